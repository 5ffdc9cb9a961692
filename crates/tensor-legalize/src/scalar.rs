//! Scalar operands turned into broadcastable constant tensors.

use tracing::trace;

use crate::constant::{match_int, match_scalar, Scalar};
use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{DType, TensorLiteral, ValueId};

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

/// Builds the splat literal for `scalar` at `dtype`.
///
/// Float destinations produce an f32 literal; the caller casts when the destination is
/// wider or narrower. Integer destinations are range checked: a float scalar must be an
/// exact integer, and the value must fit the destination width.
pub fn scalar_literal(scalar: Scalar, dtype: DType, dims: &[usize]) -> LegalizeResult<TensorLiteral> {
    if dtype.is_float() {
        return Ok(TensorLiteral::f32(dims, vec![scalar.as_f64() as f32]));
    }
    let (min, max) = match dtype {
        DType::Si32 => (i64::from(i32::MIN), i64::from(i32::MAX)),
        DType::Si64 => (i64::MIN, i64::MAX),
        other => {
            return Err(LegalizeError::unsupported_type(format!(
                "scalar cannot be materialized as {other:?}"
            )))
        }
    };
    let value = match scalar {
        Scalar::Int(value) => value,
        Scalar::Float(value) => {
            let exact = value.is_finite()
                && value.fract() == 0.0
                && (-TWO_POW_63..TWO_POW_63).contains(&value);
            if !exact {
                return Err(LegalizeError::out_of_range(format!(
                    "{value} is not representable as {dtype:?}"
                )));
            }
            value as i64
        }
    };
    if value < min || value > max {
        return Err(LegalizeError::out_of_range(format!(
            "{value} does not fit {dtype:?}"
        )));
    }
    Ok(TensorLiteral::int(dtype, dims, vec![value]))
}

/// Materializes the scalar feeding `operand` as a constant of `dtype` with shape `dims`.
pub fn materialize_scalar(
    ctx: &mut RuleContext<'_, '_>,
    operand: ValueId,
    dtype: DType,
    dims: &[usize],
) -> LegalizeResult<ValueId> {
    let scalar = match_scalar(ctx, operand).ok_or_else(|| {
        LegalizeError::non_constant(format!("%{} must be a constant scalar", operand.0))
    })?;
    scalar_constant(ctx, scalar, dtype, dims)
}

/// Stages the splat constant for `scalar` at `dtype`, casting f32 to other float types.
pub fn scalar_constant(
    ctx: &mut RuleContext<'_, '_>,
    scalar: Scalar,
    dtype: DType,
    dims: &[usize],
) -> LegalizeResult<ValueId> {
    let literal = scalar_literal(scalar, dtype, dims)?;
    let value = ctx.constant(literal);
    if dtype.is_float() && dtype != DType::F32 {
        return ctx.cast(value, dtype);
    }
    Ok(value)
}

/// Materializes the `alpha` multiplier of add/sub-style operators.
///
/// Scalars go through [`materialize_scalar`]. Anything else must be a constant int; with
/// `check_for_unity` that int must be 1.
pub fn materialize_alpha(
    ctx: &mut RuleContext<'_, '_>,
    operand: ValueId,
    dtype: DType,
    dims: &[usize],
    check_for_unity: bool,
) -> LegalizeResult<ValueId> {
    match materialize_scalar(ctx, operand, dtype, dims) {
        Ok(value) => return Ok(value),
        Err(error) => trace!(%error, "alpha is not a plain scalar, trying int constant"),
    }
    let alpha = match_int(ctx, operand)
        .ok_or_else(|| LegalizeError::non_constant("alpha must be a constant int"))?;
    if check_for_unity && alpha != 1 {
        return Err(LegalizeError::option(format!(
            "alpha = {alpha} is not supported, only 1"
        )));
    }
    let value = ctx.constant(TensorLiteral::f32(dims, vec![alpha as f32]));
    ctx.cast(value, dtype)
}
