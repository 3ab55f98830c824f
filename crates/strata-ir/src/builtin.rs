//! The `builtin` dialect: scalar, tensor and function types and the
//! `builtin.module` top-level operation.

use crate::context::{IrContext, OperationDataBuilder};
use crate::error::IrError;
use crate::location::Location;
use crate::refs::{BlockRef, OpRef, RegionRef, TypeRef};
use crate::registry::{Arity, DialectRegistry, OpDef};
use crate::symbol::{OpName, Symbol};
use crate::types::{Attribute, TypeDataBuilder};

crate::symbols! {
    DIALECT => "builtin",
    MODULE => "module",
    TENSOR => "tensor",
    FUNCTION => "function",
    ATTR_SHAPE => "shape",
    ATTR_NUM_INPUTS => "num_inputs",
    ATTR_SYM_NAME => "sym_name",
}

/// Marker for a dynamically sized tensor dimension.
pub const DYNAMIC: i64 = -1;

pub fn module_name() -> OpName {
    OpName::new(DIALECT(), MODULE())
}

/// Register the `builtin` operation kinds.
pub fn register(registry: &mut DialectRegistry) {
    let def = OpDef::new(module_name())
        .regions(Arity::Fixed(1))
        .single_block()
        .graph_regions()
        .optional_attr(ATTR_SYM_NAME());
    if registry.register(def).is_err() {
        tracing::debug!("builtin dialect already registered");
    }
}

/// `builtin.i<width>`.
pub fn integer_type(ctx: &mut IrContext, width: u32) -> TypeRef {
    let name = Symbol::from_dynamic(&format!("i{width}"));
    ctx.types.intern(TypeDataBuilder::new(DIALECT(), name).build())
}

pub fn index_type(ctx: &mut IrContext) -> TypeRef {
    ctx.types
        .intern(TypeDataBuilder::new(DIALECT(), "index").build())
}

pub fn f32_type(ctx: &mut IrContext) -> TypeRef {
    ctx.types.intern(TypeDataBuilder::new(DIALECT(), "f32").build())
}

pub fn f64_type(ctx: &mut IrContext) -> TypeRef {
    ctx.types.intern(TypeDataBuilder::new(DIALECT(), "f64").build())
}

pub fn none_type(ctx: &mut IrContext) -> TypeRef {
    ctx.types
        .intern(TypeDataBuilder::new(DIALECT(), "none").build())
}

/// Ranked tensor of `element` with the given shape; use [`DYNAMIC`] for
/// unknown extents.
pub fn tensor_type(ctx: &mut IrContext, element: TypeRef, shape: &[i64]) -> TypeRef {
    let dims = shape.iter().copied().map(Attribute::Int).collect::<Vec<_>>();
    ctx.types.intern(
        TypeDataBuilder::new(DIALECT(), TENSOR())
            .param(element)
            .attr(ATTR_SHAPE(), dims)
            .build(),
    )
}

/// Shape of a `builtin.tensor` type.
pub fn tensor_shape(ctx: &IrContext, ty: TypeRef) -> Option<Vec<i64>> {
    if !ctx.types.is_kind(ty, DIALECT(), TENSOR()) {
        return None;
    }
    ctx.types
        .get(ty)
        .attrs
        .get(&ATTR_SHAPE())?
        .as_list()?
        .iter()
        .map(Attribute::as_int)
        .collect()
}

/// Element type of a `builtin.tensor` type.
pub fn tensor_element(ctx: &IrContext, ty: TypeRef) -> Option<TypeRef> {
    if !ctx.types.is_kind(ty, DIALECT(), TENSOR()) {
        return None;
    }
    ctx.types.get(ty).params.first().copied()
}

/// `(inputs) -> outputs`, stored as params `inputs ++ outputs`.
pub fn function_type(ctx: &mut IrContext, inputs: &[TypeRef], outputs: &[TypeRef]) -> TypeRef {
    ctx.types.intern(
        TypeDataBuilder::new(DIALECT(), FUNCTION())
            .params(inputs.iter().chain(outputs).copied())
            .attr(ATTR_NUM_INPUTS(), inputs.len() as i64)
            .build(),
    )
}

/// Handle to a `builtin.module` operation: the root of a compilation unit,
/// owning one region with one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Module(OpRef);

impl Module {
    /// Create a detached, empty module.
    pub fn build(ctx: &mut IrContext, location: Location) -> Result<Self, IrError> {
        let block = ctx.create_block(location, &[]);
        let region = ctx.create_region(location, &[block])?;
        let op = OperationDataBuilder::new(location, module_name())
            .region(region)
            .create(ctx)?;
        Ok(Module(op))
    }

    /// View `op` as a module if it is a well-formed `builtin.module`.
    pub fn from_op(ctx: &IrContext, op: OpRef) -> Option<Self> {
        if ctx.op_name(op) != module_name() {
            return None;
        }
        let &[region] = ctx.op_regions(op) else {
            return None;
        };
        (ctx.region_blocks(region).len() == 1).then_some(Module(op))
    }

    pub fn op(self) -> OpRef {
        self.0
    }

    pub fn body(self, ctx: &IrContext) -> RegionRef {
        ctx.op_regions(self.0)[0]
    }

    pub fn block(self, ctx: &IrContext) -> BlockRef {
        ctx.region_blocks(self.body(ctx))[0]
    }

    /// Top-level operations, in order.
    pub fn ops(self, ctx: &IrContext) -> Vec<OpRef> {
        ctx.block_ops(self.block(ctx)).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Span;

    #[test]
    fn identical_tensor_types_are_one_instance() {
        let mut ctx = IrContext::new();
        let i8_a = integer_type(&mut ctx, 8);
        let t1 = tensor_type(&mut ctx, i8_a, &[4, DYNAMIC]);
        let i8_b = integer_type(&mut ctx, 8);
        let t2 = tensor_type(&mut ctx, i8_b, &[4, DYNAMIC]);
        assert_eq!(t1, t2);
        assert_eq!(tensor_shape(&ctx, t1), Some(vec![4, -1]));
        assert_eq!(tensor_element(&ctx, t1), Some(i8_a));

        let t3 = tensor_type(&mut ctx, i8_a, &[4, 4]);
        assert_ne!(t1, t3);
        assert_eq!(tensor_shape(&ctx, i8_a), None);
    }

    #[test]
    fn function_type_separates_inputs_and_outputs() {
        let mut ctx = IrContext::new();
        let i32_ty = integer_type(&mut ctx, 32);
        let f64_ty = f64_type(&mut ctx);
        let a = function_type(&mut ctx, &[i32_ty], &[f64_ty]);
        let b = function_type(&mut ctx, &[i32_ty, f64_ty], &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn module_has_one_block() {
        let mut ctx = IrContext::new();
        let path = ctx.paths.intern("m.ir".to_owned());
        let module = Module::build(&mut ctx, Location::new(path, Span::default())).unwrap();
        assert_eq!(Module::from_op(&ctx, module.op()), Some(module));
        assert!(module.ops(&ctx).is_empty());
        assert_eq!(ctx.block_parent_op(module.block(&ctx)), Some(module.op()));
    }
}
