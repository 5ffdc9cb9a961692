use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::ValueId;
use crate::source::SourceOp;
use crate::target::{BinaryOp, CompareOp, UnaryOp};

use super::{emit_binary, emit_compare, emit_unary, require_int_or_float, tensor_or_scalar};

/// `gt`, `lt`, `eq`, `ne` against a tensor or a scalar.
///
/// `lt` is `greater` with swapped operands and `ne` negates `equal`.
pub(super) fn compare(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (lhs, lhs_ty) = ctx.tensor_operand(0)?;
    require_int_or_float(&lhs_ty, ctx.op().name())?;
    let rhs = tensor_or_scalar(ctx, 1, lhs_ty.dtype, lhs_ty.rank())?;
    let rhs_ty = ctx.tensor_type(rhs)?;
    if rhs_ty.dtype != lhs_ty.dtype {
        return Err(LegalizeError::type_mismatch(format!(
            "{} compares {:?} with {:?}",
            ctx.op().name(),
            lhs_ty.dtype,
            rhs_ty.dtype
        )));
    }
    let out = match ctx.op() {
        SourceOp::GtTensor | SourceOp::GtScalar => {
            emit_compare(ctx, CompareOp::Greater, lhs, rhs)?
        }
        SourceOp::LtTensor | SourceOp::LtScalar => {
            emit_compare(ctx, CompareOp::Greater, rhs, lhs)?
        }
        SourceOp::EqTensor | SourceOp::EqScalar => emit_compare(ctx, CompareOp::Equal, lhs, rhs)?,
        SourceOp::NeTensor | SourceOp::NeScalar => {
            let equal = emit_compare(ctx, CompareOp::Equal, lhs, rhs)?;
            emit_unary(ctx, UnaryOp::LogicalNot, equal)?
        }
        other => unreachable!("{other} is not a comparison"),
    };
    Ok(vec![out])
}

/// Bitwise and/or/xor on integer tensors, computed at the declared result type.
pub(super) fn bitwise(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (lhs, lhs_ty) = ctx.tensor_operand(0)?;
    require_int_or_float(&lhs_ty, ctx.op().name())?;
    if lhs_ty.dtype.is_float() {
        return Err(LegalizeError::dtype(format!(
            "{} is not defined for {:?}",
            ctx.op().name(),
            lhs_ty.dtype
        )));
    }
    let op = match ctx.op() {
        SourceOp::BitwiseAndTensor => BinaryOp::BitwiseAnd,
        SourceOp::BitwiseOrTensor => BinaryOp::BitwiseOr,
        SourceOp::BitwiseXorTensor => BinaryOp::BitwiseXor,
        other => unreachable!("{other} is not a bitwise operator"),
    };
    let rhs = tensor_or_scalar(ctx, 1, lhs_ty.dtype, lhs_ty.rank())?;
    let out = ctx.result_type()?;
    let lhs = ctx.cast(lhs, out.dtype)?;
    let rhs = ctx.cast(rhs, out.dtype)?;
    Ok(vec![emit_binary(ctx, op, lhs, rhs)?])
}
