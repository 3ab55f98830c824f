//! IrContext: arena-based mutable IR storage.
//!
//! All IR entities (operations, values, blocks, regions) are stored in
//! `PrimaryMap`s owned by `IrContext`. Entity lists (operands, results)
//! use `EntityList + ListPool` for compact 4-byte per-field storage.
//!
//! Handles are never reused. Erasing an entity flips its liveness flag;
//! reading an erased entity through an accessor is a bug in the caller and
//! panics. Mutations that would leave the graph inconsistent are refused
//! with an [`IrError`] before anything is touched.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use cranelift_entity::{EntityList, EntityRef, EntitySet, ListPool, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

use crate::error::IrError;
use crate::location::Location;
use crate::printer::print_type;
use crate::refs::*;
use crate::registry::{Arity, DialectRegistry};
use crate::symbol::{OpName, Symbol};
use crate::types::{AttrInterner, Attribute, PathInterner, TypeInterner};

/// A single use of a value: which operation uses it, at which operand index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Use {
    pub user: OpRef,
    pub operand_index: u32,
}

/// Data for a single operation in the arena.
pub struct OperationData {
    pub location: Location,
    pub name: OpName,
    operands: EntityList<ValueRef>,
    results: EntityList<TypeRef>,
    pub attributes: BTreeMap<Symbol, AttrRef>,
    pub regions: SmallVec<[RegionRef; 2]>,
    pub successors: SmallVec<[BlockRef; 2]>,
    pub parent_block: Option<BlockRef>,
}

/// Data for a single SSA value.
pub struct ValueData {
    pub def: ValueDef,
    pub ty: TypeRef,
}

/// Data for a basic block.
pub struct BlockData {
    pub location: Location,
    pub ops: SmallVec<[OpRef; 4]>,
    pub parent_region: Option<RegionRef>,
}

/// Data for a region (list of blocks).
pub struct RegionData {
    pub location: Location,
    pub blocks: SmallVec<[BlockRef; 4]>,
    pub parent_op: Option<OpRef>,
}

/// Everything owned, directly or transitively, by an operation or block.
#[derive(Default)]
struct Subtree {
    ops: Vec<OpRef>,
    blocks: Vec<BlockRef>,
    regions: Vec<RegionRef>,
}

/// Arena-based mutable IR context.
///
/// Owns all IR entities and provides methods for creating, querying,
/// and mutating them. Use-chains are maintained by every mutation.
pub struct IrContext {
    ops: PrimaryMap<OpRef, OperationData>,
    values: PrimaryMap<ValueRef, ValueData>,
    blocks: PrimaryMap<BlockRef, BlockData>,
    regions: PrimaryMap<RegionRef, RegionData>,

    /// Use-chain: for each value, the list of operations that use it.
    uses: SecondaryMap<ValueRef, SmallVec<[Use; 2]>>,

    pub types: TypeInterner,
    pub attrs: AttrInterner,
    pub paths: PathInterner,

    /// Backing pools for EntityList storage.
    value_pool: ListPool<ValueRef>,
    type_pool: ListPool<TypeRef>,

    result_values: SecondaryMap<OpRef, EntityList<ValueRef>>,
    block_arg_values: SecondaryMap<BlockRef, EntityList<ValueRef>>,

    erased_ops: EntitySet<OpRef>,
    erased_values: EntitySet<ValueRef>,
    erased_blocks: EntitySet<BlockRef>,
    erased_regions: EntitySet<RegionRef>,

    registry: Arc<DialectRegistry>,
}

impl IrContext {
    /// Create an empty context that knows the `builtin` dialect.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(DialectRegistry::with_builtin()))
    }

    pub fn with_registry(registry: Arc<DialectRegistry>) -> Self {
        Self {
            ops: PrimaryMap::new(),
            values: PrimaryMap::new(),
            blocks: PrimaryMap::new(),
            regions: PrimaryMap::new(),
            uses: SecondaryMap::new(),
            types: TypeInterner::new(),
            attrs: AttrInterner::new(),
            paths: PathInterner::new(),
            value_pool: ListPool::new(),
            type_pool: ListPool::new(),
            result_values: SecondaryMap::new(),
            block_arg_values: SecondaryMap::new(),
            erased_ops: EntitySet::new(),
            erased_values: EntitySet::new(),
            erased_blocks: EntitySet::new(),
            erased_regions: EntitySet::new(),
            registry,
        }
    }

    pub fn registry(&self) -> &DialectRegistry {
        &self.registry
    }

    pub fn registry_arc(&self) -> Arc<DialectRegistry> {
        Arc::clone(&self.registry)
    }

    /// Intern an attribute payload.
    pub fn attr(&mut self, attr: impl Into<Attribute>) -> AttrRef {
        self.attrs.intern(attr.into())
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    pub fn is_live(&self, op: OpRef) -> bool {
        op.index() < self.ops.len() && !self.erased_ops.contains(op)
    }

    pub fn is_value_live(&self, v: ValueRef) -> bool {
        v.index() < self.values.len() && !self.erased_values.contains(v)
    }

    pub fn is_block_live(&self, b: BlockRef) -> bool {
        b.index() < self.blocks.len() && !self.erased_blocks.contains(b)
    }

    pub fn is_region_live(&self, r: RegionRef) -> bool {
        r.index() < self.regions.len() && !self.erased_regions.contains(r)
    }

    #[track_caller]
    fn assert_op(&self, op: OpRef) {
        assert!(!self.erased_ops.contains(op), "access to erased operation {op}");
    }

    #[track_caller]
    fn assert_value(&self, v: ValueRef) {
        assert!(!self.erased_values.contains(v), "access to erased value {v}");
    }

    #[track_caller]
    fn assert_block(&self, b: BlockRef) {
        assert!(!self.erased_blocks.contains(b), "access to erased block {b}");
    }

    #[track_caller]
    fn assert_region(&self, r: RegionRef) {
        assert!(!self.erased_regions.contains(r), "access to erased region {r}");
    }

    fn check_op(&self, op: OpRef) -> Result<(), IrError> {
        if self.is_live(op) {
            Ok(())
        } else {
            Err(IrError::Erased(op.to_string()))
        }
    }

    fn check_value(&self, v: ValueRef) -> Result<(), IrError> {
        if self.is_value_live(v) {
            Ok(())
        } else {
            Err(IrError::Erased(v.to_string()))
        }
    }

    fn check_block(&self, b: BlockRef) -> Result<(), IrError> {
        if self.is_block_live(b) {
            Ok(())
        } else {
            Err(IrError::Erased(b.to_string()))
        }
    }

    // ========================================================================
    // Operation
    // ========================================================================

    /// Create a detached operation and allocate its result values.
    ///
    /// The operands are registered in the use-chain immediately and the
    /// listed regions become owned by the new operation. Fails with
    /// `TypeMismatch` when the registered kind declares a result arity the
    /// result types do not satisfy.
    pub fn create_op(&mut self, mut data: OperationData) -> Result<OpRef, IrError> {
        let result_types: SmallVec<[TypeRef; 4]> = data.results.as_slice(&self.type_pool).into();
        if let Some(def) = self.registry.get(&data.name) {
            if !def.results.accepts(result_types.len()) {
                return Err(IrError::TypeMismatch(format!(
                    "{} declares {} result(s), but {} result type(s) were given",
                    data.name,
                    def.results,
                    result_types.len()
                )));
            }
        }

        for (i, &r) in data.regions.iter().enumerate() {
            if !self.is_region_live(r) {
                return Err(IrError::Erased(r.to_string()));
            }
            if let Some(owner) = self.regions[r].parent_op {
                return Err(IrError::MalformedRegion(format!(
                    "{r} already belongs to {owner}"
                )));
            }
            if data.regions[..i].contains(&r) {
                return Err(IrError::MalformedRegion(format!(
                    "{r} is listed twice"
                )));
            }
        }

        let operand_slice: SmallVec<[ValueRef; 8]> =
            data.operands.as_slice(&self.value_pool).into();
        for (idx, &v) in operand_slice.iter().enumerate() {
            if !self.is_value_live(v) {
                return Err(IrError::DanglingUse(format!(
                    "operand #{idx} of new {} refers to erased value {v}",
                    data.name
                )));
            }
        }
        for &b in &data.successors {
            self.check_block(b)?;
        }

        data.parent_block = None;
        let regions = data.regions.clone();
        let op = self.ops.push(data);

        for &r in &regions {
            self.regions[r].parent_op = Some(op);
        }

        for (idx, &val) in operand_slice.iter().enumerate() {
            self.uses[val].push(Use {
                user: op,
                operand_index: idx as u32,
            });
        }

        let mut result_value_list = EntityList::new();
        for (idx, &ty) in result_types.iter().enumerate() {
            let v = self.values.push(ValueData {
                def: ValueDef::OpResult(op, idx as u32),
                ty,
            });
            result_value_list.push(v, &mut self.value_pool);
        }
        self.result_values[op] = result_value_list;

        Ok(op)
    }

    #[track_caller]
    pub fn op(&self, op: OpRef) -> &OperationData {
        self.assert_op(op);
        &self.ops[op]
    }

    pub fn op_name(&self, op: OpRef) -> OpName {
        self.op(op).name
    }

    pub fn op_operands(&self, op: OpRef) -> &[ValueRef] {
        self.op(op).operands.as_slice(&self.value_pool)
    }

    pub fn op_result_types(&self, op: OpRef) -> &[TypeRef] {
        self.op(op).results.as_slice(&self.type_pool)
    }

    /// The `index`-th result value.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn op_result(&self, op: OpRef, index: u32) -> ValueRef {
        self.op_results(op)[index as usize]
    }

    pub fn op_results(&self, op: OpRef) -> &[ValueRef] {
        self.assert_op(op);
        self.result_values[op].as_slice(&self.value_pool)
    }

    pub fn op_regions(&self, op: OpRef) -> &[RegionRef] {
        &self.op(op).regions
    }

    pub fn op_successors(&self, op: OpRef) -> &[BlockRef] {
        &self.op(op).successors
    }

    pub fn op_attr(&self, op: OpRef, key: Symbol) -> Option<AttrRef> {
        self.op(op).attributes.get(&key).copied()
    }

    /// The payload of attribute `key`, if present.
    pub fn op_attr_value(&self, op: OpRef, key: Symbol) -> Option<&Attribute> {
        self.op_attr(op, key).map(|a| self.attrs.get(a))
    }

    /// Set or overwrite attribute `key`. Returns the previous value.
    pub fn set_attr(&mut self, op: OpRef, key: Symbol, attr: AttrRef) -> Option<AttrRef> {
        self.assert_op(op);
        self.ops[op].attributes.insert(key, attr)
    }

    pub fn remove_attr(&mut self, op: OpRef, key: Symbol) -> Option<AttrRef> {
        self.assert_op(op);
        self.ops[op].attributes.remove(&key)
    }

    pub fn parent_block(&self, op: OpRef) -> Option<BlockRef> {
        self.op(op).parent_block
    }

    /// The operation whose region contains `op`.
    pub fn parent_op(&self, op: OpRef) -> Option<OpRef> {
        self.block_parent_op(self.parent_block(op)?)
    }

    /// Whether `ancestor` strictly encloses `op`.
    pub fn is_ancestor(&self, ancestor: OpRef, op: OpRef) -> bool {
        let mut cur = op;
        while let Some(parent) = self.parent_op(cur) {
            if parent == ancestor {
                return true;
            }
            cur = parent;
        }
        false
    }

    /// Position of an attached operation within its block.
    pub fn op_position(&self, op: OpRef) -> Option<usize> {
        let block = self.parent_block(op)?;
        self.blocks[block].ops.iter().position(|&o| o == op)
    }

    // ========================================================================
    // Value
    // ========================================================================

    #[track_caller]
    pub fn value(&self, v: ValueRef) -> &ValueData {
        self.assert_value(v);
        &self.values[v]
    }

    pub fn value_ty(&self, v: ValueRef) -> TypeRef {
        self.value(v).ty
    }

    pub fn value_def(&self, v: ValueRef) -> ValueDef {
        self.value(v).def
    }

    /// The operation producing `v`, or `None` for a block argument.
    pub fn defining_op(&self, v: ValueRef) -> Option<OpRef> {
        match self.value_def(v) {
            ValueDef::OpResult(op, _) => Some(op),
            ValueDef::BlockArg(..) => None,
        }
    }

    // ========================================================================
    // Block
    // ========================================================================

    /// Create a detached, empty block with the given argument types.
    pub fn create_block(&mut self, location: Location, arg_types: &[TypeRef]) -> BlockRef {
        let block = self.blocks.push(BlockData {
            location,
            ops: SmallVec::new(),
            parent_region: None,
        });

        let mut arg_value_list = EntityList::new();
        for (idx, &ty) in arg_types.iter().enumerate() {
            let v = self.values.push(ValueData {
                def: ValueDef::BlockArg(block, idx as u32),
                ty,
            });
            arg_value_list.push(v, &mut self.value_pool);
        }
        self.block_arg_values[block] = arg_value_list;

        block
    }

    #[track_caller]
    pub fn block(&self, b: BlockRef) -> &BlockData {
        self.assert_block(b);
        &self.blocks[b]
    }

    pub fn block_ops(&self, b: BlockRef) -> &[OpRef] {
        &self.block(b).ops
    }

    pub fn block_arg(&self, b: BlockRef, index: u32) -> ValueRef {
        self.block_args(b)[index as usize]
    }

    pub fn block_args(&self, b: BlockRef) -> &[ValueRef] {
        self.assert_block(b);
        self.block_arg_values[b].as_slice(&self.value_pool)
    }

    pub fn block_parent_op(&self, b: BlockRef) -> Option<OpRef> {
        self.region(self.block(b).parent_region?).parent_op
    }

    /// Whether `block` lies somewhere inside the regions of `op`.
    fn block_is_nested_in(&self, block: BlockRef, op: OpRef) -> bool {
        let mut cur = block;
        loop {
            let Some(region) = self.blocks[cur].parent_region else {
                return false;
            };
            let Some(parent) = self.regions[region].parent_op else {
                return false;
            };
            if parent == op {
                return true;
            }
            let Some(next) = self.ops[parent].parent_block else {
                return false;
            };
            cur = next;
        }
    }

    fn check_attachable(&self, op: OpRef, block: BlockRef) -> Result<(), IrError> {
        self.check_op(op)?;
        self.check_block(block)?;
        if let Some(existing) = self.ops[op].parent_block {
            return Err(IrError::AlreadyAttached {
                op,
                block: existing,
            });
        }
        if self.block_is_nested_in(block, op) {
            return Err(IrError::MalformedRegion(format!(
                "cannot insert {op} into {block}, which it encloses"
            )));
        }
        Ok(())
    }

    /// Append a detached operation to the end of a block.
    pub fn insert_at_end(&mut self, block: BlockRef, op: OpRef) -> Result<(), IrError> {
        self.check_attachable(op, block)?;
        self.blocks[block].ops.push(op);
        self.ops[op].parent_block = Some(block);
        Ok(())
    }

    /// Prepend a detached operation to a block.
    pub fn insert_at_start(&mut self, block: BlockRef, op: OpRef) -> Result<(), IrError> {
        self.check_attachable(op, block)?;
        self.blocks[block].ops.insert(0, op);
        self.ops[op].parent_block = Some(block);
        Ok(())
    }

    /// Insert a detached operation immediately before `anchor`.
    ///
    /// Blocks keep their operations in a plain vector, so finding `anchor`
    /// is linear in the length of its block. Prefer [`Self::insert_at_end`]
    /// when building a block front to back.
    pub fn insert_before(&mut self, anchor: OpRef, op: OpRef) -> Result<(), IrError> {
        self.insert_relative(anchor, op, 0)
    }

    /// Insert a detached operation immediately after `anchor`. Linear in the
    /// length of the anchor's block, like [`Self::insert_before`].
    pub fn insert_after(&mut self, anchor: OpRef, op: OpRef) -> Result<(), IrError> {
        self.insert_relative(anchor, op, 1)
    }

    fn insert_relative(&mut self, anchor: OpRef, op: OpRef, offset: usize) -> Result<(), IrError> {
        self.check_op(anchor)?;
        let block = self.ops[anchor].parent_block.ok_or(IrError::Detached(anchor))?;
        self.check_attachable(op, block)?;
        let ops = &mut self.blocks[block].ops;
        let pos = ops
            .iter()
            .position(|&o| o == anchor)
            .unwrap_or_else(|| panic!("{anchor} claims {block} as parent but is not listed in it"));
        ops.insert(pos + offset, op);
        self.ops[op].parent_block = Some(block);
        Ok(())
    }

    /// Remove an operation from its block without destroying it.
    pub fn detach_op(&mut self, op: OpRef) -> Result<(), IrError> {
        self.check_op(op)?;
        let block = self.ops[op].parent_block.ok_or(IrError::Detached(op))?;
        self.blocks[block].ops.retain(|o| *o != op);
        self.ops[op].parent_block = None;
        Ok(())
    }

    /// Move `op` (attached or not) to just before `anchor`.
    pub fn move_op_before(&mut self, op: OpRef, anchor: OpRef) -> Result<(), IrError> {
        self.check_op(op)?;
        self.check_op(anchor)?;
        if op == anchor {
            return Ok(());
        }
        let block = self.ops[anchor].parent_block.ok_or(IrError::Detached(anchor))?;
        if self.block_is_nested_in(block, op) {
            return Err(IrError::MalformedRegion(format!(
                "cannot move {op} into {block}, which it encloses"
            )));
        }
        if self.ops[op].parent_block.is_some() {
            self.detach_op(op)?;
        }
        self.insert_before(anchor, op)
    }

    // ========================================================================
    // Region
    // ========================================================================

    /// Create a region owning the given detached blocks.
    pub fn create_region(
        &mut self,
        location: Location,
        blocks: &[BlockRef],
    ) -> Result<RegionRef, IrError> {
        for (i, &b) in blocks.iter().enumerate() {
            self.check_block(b)?;
            if let Some(existing) = self.blocks[b].parent_region {
                return Err(IrError::MalformedRegion(format!(
                    "{b} already belongs to {existing}"
                )));
            }
            if blocks[..i].contains(&b) {
                return Err(IrError::MalformedRegion(format!("{b} is listed twice")));
            }
        }
        let region = self.regions.push(RegionData {
            location,
            blocks: blocks.iter().copied().collect(),
            parent_op: None,
        });
        for &b in blocks {
            self.blocks[b].parent_region = Some(region);
        }
        Ok(region)
    }

    /// Append a detached block to a region.
    pub fn append_block(&mut self, region: RegionRef, block: BlockRef) -> Result<(), IrError> {
        if !self.is_region_live(region) {
            return Err(IrError::Erased(region.to_string()));
        }
        self.check_block(block)?;
        if let Some(existing) = self.blocks[block].parent_region {
            return Err(IrError::MalformedRegion(format!(
                "{block} already belongs to {existing}"
            )));
        }
        self.regions[region].blocks.push(block);
        self.blocks[block].parent_region = Some(region);
        Ok(())
    }

    #[track_caller]
    pub fn region(&self, r: RegionRef) -> &RegionData {
        self.assert_region(r);
        &self.regions[r]
    }

    pub fn region_blocks(&self, r: RegionRef) -> &[BlockRef] {
        &self.region(r).blocks
    }

    // ========================================================================
    // Use-chain
    // ========================================================================

    pub fn uses(&self, v: ValueRef) -> &[Use] {
        self.assert_value(v);
        &self.uses[v]
    }

    pub fn has_uses(&self, v: ValueRef) -> bool {
        !self.uses(v).is_empty()
    }

    #[cfg(test)]
    pub(crate) fn uses_mut_for_test(&mut self, v: ValueRef) -> &mut SmallVec<[Use; 2]> {
        &mut self.uses[v]
    }

    /// Point operand `index` of `op` at `value`, keeping both use lists in
    /// sync.
    pub fn set_operand(&mut self, op: OpRef, index: usize, value: ValueRef) -> Result<(), IrError> {
        self.check_op(op)?;
        self.check_value(value)?;
        let slice = self.ops[op].operands.as_mut_slice(&mut self.value_pool);
        let Some(slot) = slice.get_mut(index) else {
            return Err(IrError::OperandIndex { op, index });
        };
        let old = std::mem::replace(slot, value);
        if old == value {
            return Ok(());
        }
        let index = index as u32;
        self.uses[old].retain(|u| !(u.user == op && u.operand_index == index));
        self.uses[value].push(Use {
            user: op,
            operand_index: index,
        });
        Ok(())
    }

    // ========================================================================
    // RAUW (Replace All Uses With)
    // ========================================================================

    /// Replace all uses of `old` with `new`. Both values must have the same
    /// type.
    ///
    /// Former users keep their operand positions, and `new` receives the uses
    /// in `old`'s use-list order.
    pub fn replace_all_uses(&mut self, old: ValueRef, new: ValueRef) -> Result<(), IrError> {
        self.check_value(old)?;
        self.check_value(new)?;
        let (from, to) = (self.values[old].ty, self.values[new].ty);
        if from != to {
            return Err(IrError::TypeMismatch(format!(
                "cannot replace {old} of type {} with {new} of type {}",
                print_type(self, from),
                print_type(self, to)
            )));
        }
        self.rewire_uses(old, new);
        Ok(())
    }

    /// Like [`replace_all_uses`](Self::replace_all_uses) but skips the type
    /// check, for narrowing replacements the caller has justified.
    pub fn replace_all_uses_narrowing(
        &mut self,
        old: ValueRef,
        new: ValueRef,
    ) -> Result<(), IrError> {
        self.check_value(old)?;
        self.check_value(new)?;
        self.rewire_uses(old, new);
        Ok(())
    }

    fn rewire_uses(&mut self, old: ValueRef, new: ValueRef) {
        if old == new {
            return;
        }
        let old_uses = std::mem::take(&mut self.uses[old]);
        for u in &old_uses {
            let slice = self.ops[u.user].operands.as_mut_slice(&mut self.value_pool);
            debug_assert_eq!(slice[u.operand_index as usize], old);
            slice[u.operand_index as usize] = new;
            self.uses[new].push(*u);
        }
    }

    /// Replace every result of `op` with the matching value in `values`, then
    /// erase `op`.
    pub fn replace_op(&mut self, op: OpRef, values: &[ValueRef]) -> Result<(), IrError> {
        self.check_op(op)?;
        let results: SmallVec<[ValueRef; 4]> = self.op_results(op).into();
        if results.len() != values.len() {
            return Err(IrError::ArityMismatch {
                op_name: self.ops[op].name,
                what: "replacement value(s)",
                expected: Arity::Fixed(results.len()),
                found: values.len(),
            });
        }
        for (&old, &new) in results.iter().zip(values) {
            self.check_value(new)?;
            if results.contains(&new) {
                return Err(IrError::DanglingUse(format!(
                    "{op} cannot be replaced by its own result {new}"
                )));
            }
            let (from, to) = (self.values[old].ty, self.values[new].ty);
            if from != to {
                return Err(IrError::TypeMismatch(format!(
                    "cannot replace {old} of type {} with {new} of type {}",
                    print_type(self, from),
                    print_type(self, to)
                )));
            }
        }
        let subtree = self.op_subtree(op);
        self.check_escapes(&subtree, Some(op))?;
        for (&old, &new) in results.iter().zip(values) {
            self.rewire_uses(old, new);
        }
        self.release(op, subtree);
        Ok(())
    }

    // ========================================================================
    // Erasure
    // ========================================================================

    /// Erase an operation together with everything its regions own.
    ///
    /// Fails with `HasLiveUses` if any result still has uses, with
    /// `DanglingUse` if a value defined inside the operation's regions is used
    /// outside of them, and with `MalformedRegion` if an operation outside
    /// still branches into one of its blocks. On failure nothing is modified.
    pub fn erase_op(&mut self, op: OpRef) -> Result<(), IrError> {
        self.check_op(op)?;
        for &v in self.op_results(op) {
            let uses = self.uses[v].len();
            if uses > 0 {
                return Err(IrError::HasLiveUses { op, value: v, uses });
            }
        }
        let subtree = self.op_subtree(op);
        self.check_escapes(&subtree, Some(op))?;
        self.release(op, subtree);
        Ok(())
    }

    /// Erase a block and everything in it.
    ///
    /// The block must not be the successor of any operation outside it, and
    /// no value defined in it may be used outside it.
    pub fn erase_block(&mut self, block: BlockRef) -> Result<(), IrError> {
        self.check_block(block)?;
        let mut subtree = Subtree::default();
        self.collect_block(block, &mut subtree);

        self.check_escapes(&subtree, None)?;

        if let Some(region) = self.blocks[block].parent_region.take() {
            self.regions[region].blocks.retain(|b| *b != block);
        }
        self.release_subtree(subtree);
        Ok(())
    }

    /// First live operation not `skip`ped that names one of `blocks` as a
    /// successor. Branches may cross into other regions or sit in detached
    /// blocks, so every live operation is scanned.
    pub(crate) fn branch_into(
        &self,
        blocks: &HashSet<BlockRef>,
        skip: impl Fn(OpRef) -> bool,
    ) -> Option<(OpRef, BlockRef)> {
        self.ops.iter().find_map(|(o, data)| {
            if self.erased_ops.contains(o) || skip(o) {
                return None;
            }
            let b = data.successors.iter().find(|b| blocks.contains(b))?;
            Some((o, *b))
        })
    }

    fn op_subtree(&self, op: OpRef) -> Subtree {
        let mut subtree = Subtree::default();
        for &r in &self.ops[op].regions {
            self.collect_region(r, &mut subtree);
        }
        subtree
    }

    fn collect_region(&self, region: RegionRef, out: &mut Subtree) {
        out.regions.push(region);
        for &b in &self.regions[region].blocks {
            self.collect_block(b, out);
        }
    }

    fn collect_block(&self, block: BlockRef, out: &mut Subtree) {
        out.blocks.push(block);
        for &o in &self.blocks[block].ops {
            out.ops.push(o);
            for &r in &self.ops[o].regions {
                self.collect_region(r, out);
            }
        }
    }

    /// Refuse erasure if a value defined inside `subtree` is used outside it,
    /// or if an operation outside it still branches to one of its blocks.
    fn check_escapes(&self, subtree: &Subtree, root: Option<OpRef>) -> Result<(), IrError> {
        if subtree.ops.is_empty() && subtree.blocks.is_empty() {
            return Ok(());
        }
        let inside: HashSet<OpRef> = subtree.ops.iter().copied().chain(root).collect();

        if !subtree.blocks.is_empty() {
            let blocks: HashSet<BlockRef> = subtree.blocks.iter().copied().collect();
            if let Some((o, b)) = self.branch_into(&blocks, |o| inside.contains(&o)) {
                return Err(IrError::MalformedRegion(format!(
                    "{b} is still a successor of {o}"
                )));
            }
        }

        let defined = subtree
            .ops
            .iter()
            .flat_map(|&o| self.result_values[o].as_slice(&self.value_pool))
            .chain(
                subtree
                    .blocks
                    .iter()
                    .flat_map(|&b| self.block_arg_values[b].as_slice(&self.value_pool)),
            );
        for &v in defined {
            if let Some(u) = self.uses[v].iter().find(|u| !inside.contains(&u.user)) {
                return Err(IrError::DanglingUse(format!(
                    "{v} ({}) is still used by {} outside the erased subtree",
                    self.values[v].def, u.user
                )));
            }
        }
        Ok(())
    }

    fn release(&mut self, op: OpRef, subtree: Subtree) {
        if let Some(block) = self.ops[op].parent_block.take() {
            self.blocks[block].ops.retain(|o| *o != op);
        }
        self.release_op(op);
        self.release_subtree(subtree);
    }

    fn release_subtree(&mut self, subtree: Subtree) {
        for o in subtree.ops {
            self.release_op(o);
        }
        for b in subtree.blocks {
            let args: SmallVec<[ValueRef; 4]> =
                self.block_arg_values[b].as_slice(&self.value_pool).into();
            for v in args {
                self.uses[v].clear();
                self.erased_values.insert(v);
            }
            self.erased_blocks.insert(b);
        }
        for r in subtree.regions {
            self.erased_regions.insert(r);
        }
    }

    fn release_op(&mut self, op: OpRef) {
        let operands: SmallVec<[ValueRef; 8]> =
            self.ops[op].operands.as_slice(&self.value_pool).into();
        for (idx, &val) in operands.iter().enumerate() {
            self.uses[val].retain(|u| !(u.user == op && u.operand_index == idx as u32));
        }
        let results: SmallVec<[ValueRef; 4]> =
            self.result_values[op].as_slice(&self.value_pool).into();
        for v in results {
            self.uses[v].clear();
            self.erased_values.insert(v);
        }
        self.erased_ops.insert(op);
    }
}

impl Default for IrContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for constructing `OperationData` with pool-backed lists.
///
/// Collects operands and result types into `Vec`s, then packs them
/// into `EntityList`s on `build()`. Attribute payloads are interned there too.
pub struct OperationDataBuilder {
    location: Location,
    name: OpName,
    operands: Vec<ValueRef>,
    results: Vec<TypeRef>,
    attributes: BTreeMap<Symbol, AttrValue>,
    regions: SmallVec<[RegionRef; 2]>,
    successors: SmallVec<[BlockRef; 2]>,
}

enum AttrValue {
    Interned(AttrRef),
    Raw(Attribute),
}

impl OperationDataBuilder {
    pub fn new(location: Location, name: OpName) -> Self {
        Self {
            location,
            name,
            operands: Vec::new(),
            results: Vec::new(),
            attributes: BTreeMap::new(),
            regions: SmallVec::new(),
            successors: SmallVec::new(),
        }
    }

    pub fn operand(mut self, v: ValueRef) -> Self {
        self.operands.push(v);
        self
    }

    pub fn operands(mut self, vs: impl IntoIterator<Item = ValueRef>) -> Self {
        self.operands.extend(vs);
        self
    }

    pub fn result(mut self, ty: TypeRef) -> Self {
        self.results.push(ty);
        self
    }

    pub fn results(mut self, tys: impl IntoIterator<Item = TypeRef>) -> Self {
        self.results.extend(tys);
        self
    }

    pub fn attr(mut self, key: impl Into<Symbol>, val: impl Into<Attribute>) -> Self {
        self.attributes.insert(key.into(), AttrValue::Raw(val.into()));
        self
    }

    pub fn attr_ref(mut self, key: impl Into<Symbol>, val: AttrRef) -> Self {
        self.attributes.insert(key.into(), AttrValue::Interned(val));
        self
    }

    pub fn region(mut self, r: RegionRef) -> Self {
        self.regions.push(r);
        self
    }

    pub fn successor(mut self, b: BlockRef) -> Self {
        self.successors.push(b);
        self
    }

    /// Build the `OperationData` using the context's pools and interners.
    pub fn build(self, ctx: &mut IrContext) -> OperationData {
        let mut operands = EntityList::new();
        for v in self.operands {
            operands.push(v, &mut ctx.value_pool);
        }
        let mut results = EntityList::new();
        for ty in self.results {
            results.push(ty, &mut ctx.type_pool);
        }
        let attributes = self
            .attributes
            .into_iter()
            .map(|(k, v)| match v {
                AttrValue::Interned(a) => (k, a),
                AttrValue::Raw(raw) => (k, ctx.attrs.intern(raw)),
            })
            .collect();
        OperationData {
            location: self.location,
            name: self.name,
            operands,
            results,
            attributes,
            regions: self.regions,
            successors: self.successors,
            parent_block: None,
        }
    }

    /// Build and create the operation in one step.
    pub fn create(self, ctx: &mut IrContext) -> Result<OpRef, IrError> {
        let data = self.build(ctx);
        ctx.create_op(data)
    }
}
