//! Uniqued types, attributes and paths.
//!
//! Every interner hands out a stable handle per distinct value: interning
//! structurally equal data twice yields the same ref, so equality on refs is
//! structural equality on the underlying data.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use cranelift_entity::{EntityRef, PrimaryMap};
use smallvec::SmallVec;

use crate::location::Location;
use crate::refs::{AttrRef, PathRef, TypeRef};
use crate::symbol::Symbol;

/// Attribute payloads.
///
/// Floats are stored as raw bits so that equality and hashing are bitwise.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Attribute {
    Unit,
    Bool(bool),
    Int(i64),
    /// IEEE-754 double stored as raw bits.
    Float(u64),
    String(String),
    Bytes(SmallVec<[u8; 16]>),
    Type(TypeRef),
    Symbol(Symbol),
    List(Vec<Attribute>),
    Location(Location),
}

impl Attribute {
    pub fn float(value: f64) -> Self {
        Attribute::Float(value.to_bits())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attribute::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Attribute::Float(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<TypeRef> {
        match self {
            Attribute::Type(ty) => Some(*ty),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Attribute]> {
        match self {
            Attribute::List(items) => Some(items),
            _ => None,
        }
    }

    /// Short kind name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Attribute::Unit => "unit",
            Attribute::Bool(_) => "bool",
            Attribute::Int(_) => "int",
            Attribute::Float(_) => "float",
            Attribute::String(_) => "string",
            Attribute::Bytes(_) => "bytes",
            Attribute::Type(_) => "type",
            Attribute::Symbol(_) => "symbol",
            Attribute::List(_) => "list",
            Attribute::Location(_) => "location",
        }
    }
}

impl From<i64> for Attribute {
    fn from(value: i64) -> Self {
        Attribute::Int(value)
    }
}

impl From<bool> for Attribute {
    fn from(value: bool) -> Self {
        Attribute::Bool(value)
    }
}

impl From<f64> for Attribute {
    fn from(value: f64) -> Self {
        Attribute::float(value)
    }
}

impl From<Vec<Attribute>> for Attribute {
    fn from(value: Vec<Attribute>) -> Self {
        Attribute::List(value)
    }
}

impl From<Symbol> for Attribute {
    fn from(value: Symbol) -> Self {
        Attribute::Symbol(value)
    }
}

impl From<TypeRef> for Attribute {
    fn from(value: TypeRef) -> Self {
        Attribute::Type(value)
    }
}

impl From<String> for Attribute {
    fn from(value: String) -> Self {
        Attribute::String(value)
    }
}

impl From<&str> for Attribute {
    fn from(value: &str) -> Self {
        Attribute::String(value.to_string())
    }
}

impl From<Location> for Attribute {
    fn from(value: Location) -> Self {
        Attribute::Location(value)
    }
}

/// Data for a single interned type: a `(dialect, name)` kind plus ordered
/// type parameters and named attribute parameters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeData {
    pub dialect: Symbol,
    pub name: Symbol,
    pub params: SmallVec<[TypeRef; 4]>,
    pub attrs: BTreeMap<Symbol, Attribute>,
}

/// Builder for `TypeData`. Defaults to no params and no attrs.
pub struct TypeDataBuilder {
    dialect: Symbol,
    name: Symbol,
    params: SmallVec<[TypeRef; 4]>,
    attrs: BTreeMap<Symbol, Attribute>,
}

impl TypeDataBuilder {
    pub fn new(dialect: impl Into<Symbol>, name: impl Into<Symbol>) -> Self {
        Self {
            dialect: dialect.into(),
            name: name.into(),
            params: SmallVec::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn param(mut self, ty: TypeRef) -> Self {
        self.params.push(ty);
        self
    }

    pub fn params(mut self, tys: impl IntoIterator<Item = TypeRef>) -> Self {
        self.params.extend(tys);
        self
    }

    pub fn attr(mut self, key: impl Into<Symbol>, val: impl Into<Attribute>) -> Self {
        self.attrs.insert(key.into(), val.into());
        self
    }

    pub fn build(self) -> TypeData {
        TypeData {
            dialect: self.dialect,
            name: self.name,
            params: self.params,
            attrs: self.attrs,
        }
    }
}

/// Deduplicating interner: the same data always yields the same ref.
pub struct Interner<K: EntityRef, T> {
    items: PrimaryMap<K, T>,
    dedup: HashMap<T, K>,
}

pub type TypeInterner = Interner<TypeRef, TypeData>;
pub type AttrInterner = Interner<AttrRef, Attribute>;
pub type PathInterner = Interner<PathRef, String>;

impl<K: EntityRef, T: Clone + Eq + Hash> Interner<K, T> {
    pub fn new() -> Self {
        Self {
            items: PrimaryMap::new(),
            dedup: HashMap::default(),
        }
    }

    /// Intern a value, returning the existing ref if an equal one is known.
    pub fn intern(&mut self, data: T) -> K {
        if let Some(&existing) = self.dedup.get(&data) {
            return existing;
        }
        let r = self.items.push(data.clone());
        self.dedup.insert(data, r);
        r
    }

    /// Look up a ref without interning.
    pub fn lookup(&self, data: &T) -> Option<K> {
        self.dedup.get(data).copied()
    }

    pub fn get(&self, r: K) -> &T {
        &self.items[r]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<K: EntityRef, T: Clone + Eq + Hash> Default for Interner<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeInterner {
    /// Check whether `r` is the type kind `dialect.name`.
    pub fn is_kind(&self, r: TypeRef, dialect: Symbol, name: Symbol) -> bool {
        let data = self.get(r);
        data.dialect == dialect && data.name == name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_interner_dedup() {
        let mut interner = TypeInterner::new();
        let data = TypeDataBuilder::new("builtin", "i32").build();
        let r1 = interner.intern(data.clone());
        let r2 = interner.intern(data);
        assert_eq!(r1, r2);
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn type_interner_distinct() {
        let mut interner = TypeInterner::new();
        let r1 = interner.intern(TypeDataBuilder::new("builtin", "i32").build());
        let r2 = interner.intern(TypeDataBuilder::new("builtin", "i64").build());
        assert_ne!(r1, r2);
        assert!(interner.is_kind(r1, Symbol::new("builtin"), Symbol::new("i32")));
    }

    #[test]
    fn attribute_params_participate_in_identity() {
        let mut interner = TypeInterner::new();
        let i8 = interner.intern(TypeDataBuilder::new("builtin", "i8").build());
        let shape = |dims: &[i64]| {
            Attribute::List(dims.iter().copied().map(Attribute::Int).collect())
        };
        let a = TypeDataBuilder::new("builtin", "tensor")
            .param(i8)
            .attr("shape", shape(&[2, 3]))
            .build();
        let b = TypeDataBuilder::new("builtin", "tensor")
            .param(i8)
            .attr("shape", shape(&[3, 2]))
            .build();
        let ra = interner.intern(a.clone());
        assert_eq!(ra, interner.intern(a));
        assert_ne!(ra, interner.intern(b));
    }

    #[test]
    fn attr_interner_compares_floats_bitwise() {
        let mut interner = AttrInterner::new();
        let zero = interner.intern(Attribute::float(0.0));
        let neg_zero = interner.intern(Attribute::float(-0.0));
        assert_ne!(zero, neg_zero);
        assert_eq!(interner.lookup(&Attribute::float(0.0)), Some(zero));
        assert_eq!(interner.get(zero).as_f64(), Some(0.0));
    }

    #[test]
    fn path_interner_dedup() {
        let mut interner = PathInterner::new();
        let r1 = interner.intern("file:///a.ir".to_owned());
        let r2 = interner.intern("file:///a.ir".to_owned());
        let r3 = interner.intern("file:///b.ir".to_owned());
        assert_eq!(r1, r2);
        assert_ne!(r1, r3);
        assert_eq!(interner.get(r3), "file:///b.ir");
    }
}
