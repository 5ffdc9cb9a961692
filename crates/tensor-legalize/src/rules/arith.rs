use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{DType, ValueId};
use crate::scalar::{materialize_alpha, materialize_scalar};
use crate::source::SourceOp;
use crate::target::{BinaryOp, UnaryOp};

use super::{
    emit_binary, emit_unary, ones, require_float_dtype, require_int_or_float, tensor_or_scalar,
};

/// `out = lhs ± alpha * rhs`.
///
/// The multiply runs in the output float type, or `si32` for integer outputs. An `si64`
/// output is computed at `si32` and widened.
pub(super) fn add_sub(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (lhs, lhs_ty) = ctx.tensor_operand(0)?;
    require_int_or_float(&lhs_ty, ctx.op().name())?;
    let out = ctx.result_type()?;
    let op = match ctx.op() {
        SourceOp::AddTensor | SourceOp::AddScalar => BinaryOp::Add,
        SourceOp::SubTensor | SourceOp::SubScalar => BinaryOp::Sub,
        other => unreachable!("{other} is not an add/sub operator"),
    };
    let mul_dtype = if out.dtype.is_float() {
        out.dtype
    } else {
        DType::Si32
    };
    let rank = lhs_ty.rank();

    let rhs = tensor_or_scalar(ctx, 1, mul_dtype, rank)?;
    let rhs = ctx.cast(rhs, mul_dtype)?;
    let alpha = ctx.operand(2)?;
    let alpha = materialize_alpha(ctx, alpha, mul_dtype, &ones(rank), false)?;
    let scaled = emit_binary(ctx, BinaryOp::Mul, rhs, alpha)?;

    match out.dtype {
        dtype if dtype.is_float() || dtype == DType::Si32 => {
            let lhs = ctx.cast(lhs, dtype)?;
            let scaled = ctx.cast(scaled, dtype)?;
            Ok(vec![emit_binary(ctx, op, lhs, scaled)?])
        }
        DType::Si64 => {
            let lhs = ctx.cast(lhs, DType::Si32)?;
            let narrow = emit_binary(ctx, op, lhs, scaled)?;
            Ok(vec![ctx.cast(narrow, DType::Si64)?])
        }
        other => Err(LegalizeError::dtype(format!(
            "{} produces {other:?}; only float, si32 and si64 outputs are supported",
            ctx.op().name()
        ))),
    }
}

/// `out = other - self * alpha`, with `alpha` required to be 1 unless it is a scalar.
pub(super) fn rsub_scalar(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_float_dtype(&ty, "rsub")?;
    let dims = ones(ty.rank());
    let (other, alpha) = (ctx.operand(1)?, ctx.operand(2)?);
    let other = materialize_scalar(ctx, other, ty.dtype, &dims)?;
    let alpha = materialize_alpha(ctx, alpha, ty.dtype, &dims, true)?;
    let scaled = emit_binary(ctx, BinaryOp::Mul, input, alpha)?;
    let out = ctx.result_type()?;
    let diff = emit_binary(ctx, BinaryOp::Sub, other, scaled)?;
    Ok(vec![ctx.cast(diff, out.dtype)?])
}

/// `mul.Tensor`, `mul.Scalar` and `square`.
pub(super) fn mul(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (lhs, lhs_ty) = ctx.tensor_operand(0)?;
    let out = ctx.result_type()?;
    if !out.dtype.is_int_or_float() {
        return Err(LegalizeError::dtype(format!(
            "{} must produce a numeric tensor, declared {:?}",
            ctx.op().name(),
            out.dtype
        )));
    }
    let rhs = match ctx.op() {
        SourceOp::Square => lhs,
        _ => tensor_or_scalar(ctx, 1, out.dtype, lhs_ty.rank())?,
    };
    let lhs = ctx.cast(lhs, out.dtype)?;
    let rhs = ctx.cast(rhs, out.dtype)?;
    Ok(vec![emit_binary(ctx, BinaryOp::Mul, lhs, rhs)?])
}

/// Float division is `lhs * reciprocal(rhs)`; integer division truncates.
pub(super) fn div(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (lhs, lhs_ty) = ctx.tensor_operand(0)?;
    require_int_or_float(&lhs_ty, ctx.op().name())?;
    let out = ctx.result_type()?;
    let rhs = tensor_or_scalar(ctx, 1, lhs_ty.dtype, lhs_ty.rank())?;
    if lhs_ty.dtype.is_float() {
        let rhs = ctx.cast(rhs, lhs_ty.dtype)?;
        let rcp = emit_unary(ctx, UnaryOp::Reciprocal, rhs)?;
        let product = emit_binary(ctx, BinaryOp::Mul, lhs, rcp)?;
        return Ok(vec![ctx.cast(product, out.dtype)?]);
    }
    let rhs = ctx.cast(rhs, lhs_ty.dtype)?;
    let quotient = emit_binary(ctx, BinaryOp::IntDiv, lhs, rhs)?;
    Ok(vec![ctx.cast(quotient, out.dtype)?])
}
