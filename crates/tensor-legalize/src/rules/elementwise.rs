use crate::constant::{is_none, match_float, match_int};
use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{DType, ValueId};
use crate::scalar::materialize_scalar;
use crate::source::SourceOp;
use crate::target::{BinaryOp, ClampSpec, CompareOp, TargetOp, UnaryOp};

use super::{
    emit_binary, emit_compare, emit_select, emit_unary, float_const, ones, require_float_dtype,
    require_int_or_float,
};

const LN_2: f32 = 0.693_147_180_56;

fn unary_kind(op: SourceOp) -> UnaryOp {
    match op {
        SourceOp::Log => UnaryOp::Log,
        SourceOp::Exp => UnaryOp::Exp,
        SourceOp::Tanh => UnaryOp::Tanh,
        SourceOp::Sigmoid => UnaryOp::Sigmoid,
        SourceOp::Neg => UnaryOp::Negate,
        SourceOp::Floor => UnaryOp::Floor,
        SourceOp::Ceil => UnaryOp::Ceil,
        SourceOp::Rsqrt => UnaryOp::Rsqrt,
        SourceOp::Reciprocal => UnaryOp::Reciprocal,
        SourceOp::BitwiseNot => UnaryOp::BitwiseNot,
        other => unreachable!("{other} is not a unary elementwise operator"),
    }
}

/// `log`, `exp`, `tanh`, `sigmoid`.
pub(super) fn unary_float(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_float_dtype(&ty, ctx.op().name())?;
    let out = ctx.result_type()?;
    let op = unary_kind(ctx.op());
    Ok(vec![ctx.emit(TargetOp::Unary(op), &[input], out)])
}

pub(super) fn unary_any(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, _) = ctx.tensor_operand(0)?;
    let out = ctx.result_type()?;
    let op = unary_kind(ctx.op());
    Ok(vec![ctx.emit(TargetOp::Unary(op), &[input], out)])
}

/// `maximum`, `minimum`: both operands must share an element type.
pub(super) fn min_max(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (lhs, lhs_ty) = ctx.tensor_operand(0)?;
    let (rhs, rhs_ty) = ctx.tensor_operand(1)?;
    if lhs_ty.dtype != rhs_ty.dtype {
        return Err(LegalizeError::type_mismatch(format!(
            "{} operands have {:?} and {:?}",
            ctx.op().name(),
            lhs_ty.dtype,
            rhs_ty.dtype
        )));
    }
    let op = match ctx.op() {
        SourceOp::Maximum => BinaryOp::Maximum,
        SourceOp::Minimum => BinaryOp::Minimum,
        other => unreachable!("{other} is not a min/max operator"),
    };
    let out = ctx.result_type()?;
    Ok(vec![ctx.emit(TargetOp::Binary(op), &[lhs, rhs], out)])
}

pub(super) fn relu(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_float_dtype(&ty, "relu")?;
    let out = ctx.result_type()?;
    let spec = ClampSpec {
        min_int: 0,
        max_int: i64::from(i32::MAX),
        min_fp: 0.0,
        max_fp: f32::MAX,
    };
    Ok(vec![ctx.emit(TargetOp::Clamp(spec), &[input], out)])
}

/// `select(x >= 0, x, x * slope)`.
pub(super) fn leaky_relu(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_float_dtype(&ty, "leaky_relu")?;
    let slope = ctx.operand(1)?;
    let slope = materialize_scalar(ctx, slope, ty.dtype, &ones(ty.rank()))?;
    let zero = float_const(ctx, 0.0, ty.dtype, 0)?;
    let cond = emit_compare(ctx, CompareOp::GreaterEqual, input, zero)?;
    let scaled = emit_binary(ctx, BinaryOp::Mul, input, slope)?;
    let out = emit_select(ctx, cond, input, scaled)?;
    Ok(vec![out])
}

/// `log(x) * reciprocal(ln 2)`.
pub(super) fn log2(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_float_dtype(&ty, "log2")?;
    let ln2 = float_const(ctx, LN_2, ty.dtype, ty.rank())?;
    let rcp = emit_unary(ctx, UnaryOp::Reciprocal, ln2)?;
    let log = emit_unary(ctx, UnaryOp::Log, input)?;
    Ok(vec![emit_binary(ctx, BinaryOp::Mul, log, rcp)?])
}

pub(super) fn pow_scalar(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_float_dtype(&ty, "pow")?;
    let exponent = ctx.operand(1)?;
    let exponent = materialize_scalar(ctx, exponent, ty.dtype, &ones(ty.rank()))?;
    Ok(vec![emit_binary(ctx, BinaryOp::Pow, input, exponent)?])
}

/// `select(x > threshold, x, value)`.
pub(super) fn threshold(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_int_or_float(&ty, "threshold")?;
    if ty.dtype.is_integer() && ty.dtype.bitwidth() > 32 {
        return Err(LegalizeError::dtype(format!(
            "threshold supports integers up to 32 bits, got {:?}",
            ty.dtype
        )));
    }
    let dims = ones(ty.rank());
    let (limit, value) = (ctx.operand(1)?, ctx.operand(2)?);
    let limit = materialize_scalar(ctx, limit, ty.dtype, &dims)?;
    let value = materialize_scalar(ctx, value, ty.dtype, &dims)?;
    let cond = emit_compare(ctx, CompareOp::Greater, input, limit)?;
    Ok(vec![emit_select(ctx, cond, input, value)?])
}

fn clamp_bound(
    ctx: &RuleContext<'_, '_>,
    operand: ValueId,
    what: &str,
) -> LegalizeResult<Option<f64>> {
    if is_none(ctx, operand) {
        return Ok(None);
    }
    if let Some(value) = match_int(ctx, operand) {
        return Ok(Some(value as f64));
    }
    match_float(ctx, operand)
        .map(Some)
        .ok_or_else(|| LegalizeError::non_constant(format!("clamp {what} must be a constant")))
}

/// Clamp with constant bounds; a `None` bound leaves that side open.
pub(super) fn clamp(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_int_or_float(&ty, "clamp")?;
    let min = clamp_bound(ctx, ctx.operand(1)?, "min")?;
    let max = clamp_bound(ctx, ctx.operand(2)?, "max")?;
    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(LegalizeError::operand(format!(
                "clamp bounds are inverted: min {min} > max {max}"
            )));
        }
    }
    let spec = ClampSpec {
        min_int: min.map_or(i64::MIN, |value| value.ceil() as i64),
        max_int: max.map_or(i64::MAX, |value| value.floor() as i64),
        min_fp: min.map_or(f32::MIN, |value| value as f32),
        max_fp: max.map_or(f32::MAX, |value| value as f32),
    };
    let out = ctx.result_type()?;
    Ok(vec![ctx.emit(TargetOp::Clamp(spec), &[input], out)])
}

pub(super) fn where_self(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (cond, cond_ty) = ctx.tensor_operand(0)?;
    let (lhs, lhs_ty) = ctx.tensor_operand(1)?;
    let (rhs, rhs_ty) = ctx.tensor_operand(2)?;
    if cond_ty.dtype != DType::I1 {
        return Err(LegalizeError::type_mismatch(format!(
            "where condition must be i1, got {:?}",
            cond_ty.dtype
        )));
    }
    if lhs_ty.dtype != rhs_ty.dtype {
        return Err(LegalizeError::type_mismatch(format!(
            "where branches have {:?} and {:?}",
            lhs_ty.dtype, rhs_ty.dtype
        )));
    }
    let out = ctx.result_type()?;
    let selected = emit_select(ctx, cond, lhs, rhs)?;
    Ok(vec![ctx.cast(selected, out.dtype)?])
}
