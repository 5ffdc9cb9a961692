//! GELU through a rational approximation of the error function.
//!
//! `erf(x) ~ 1 - 1 / (1 + a1|x| + a2 x^2 + a3 |x|^3 + a4 x^4)^4`, sign restored with a
//! select. Maximum absolute error is about 5e-4.

use crate::constant::require_str;
use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{DType, ValueId};
use crate::target::{BinaryOp, CompareOp, UnaryOp};

use super::{
    emit_binary, emit_compare, emit_select, emit_unary, float_const, require_float_dtype,
};

const A1: f64 = 0.278393;
const A2: f64 = 0.230389;
const A3: f64 = 0.000972;
const A4: f64 = 0.078108;

/// Host evaluation of the polynomial the rules emit.
pub fn erf_approx(x: f64) -> f64 {
    let a = x.abs();
    let poly = 1.0 + A1 * a + A2 * a * a + A3 * a * a * a + A4 * a * a * a * a;
    let magnitude = 1.0 - 1.0 / poly.powi(4);
    if x >= 0.0 {
        magnitude
    } else {
        -magnitude
    }
}

fn require_exact(ctx: &RuleContext<'_, '_>, operand: ValueId) -> LegalizeResult<()> {
    let approximate = require_str(ctx, operand, "approximate")?;
    if approximate != "none" {
        return Err(LegalizeError::option(format!(
            "gelu approximate = {approximate:?} is not supported"
        )));
    }
    Ok(())
}

fn emit_erf(
    ctx: &mut RuleContext<'_, '_>,
    x: ValueId,
    dtype: DType,
    rank: usize,
) -> LegalizeResult<ValueId> {
    let abs = emit_unary(ctx, UnaryOp::Abs, x)?;
    let x2 = emit_binary(ctx, BinaryOp::Mul, abs, abs)?;
    let x3 = emit_binary(ctx, BinaryOp::Mul, x2, abs)?;
    let x4 = emit_binary(ctx, BinaryOp::Mul, x2, x2)?;

    let mut poly = float_const(ctx, 1.0, dtype, rank)?;
    for (coefficient, power) in [(A1, abs), (A2, x2), (A3, x3), (A4, x4)] {
        let c = float_const(ctx, coefficient as f32, dtype, rank)?;
        let term = emit_binary(ctx, BinaryOp::Mul, power, c)?;
        poly = emit_binary(ctx, BinaryOp::Add, poly, term)?;
    }
    let p2 = emit_binary(ctx, BinaryOp::Mul, poly, poly)?;
    let p4 = emit_binary(ctx, BinaryOp::Mul, p2, p2)?;
    let inv = emit_unary(ctx, UnaryOp::Reciprocal, p4)?;
    let one = float_const(ctx, 1.0, dtype, rank)?;
    let magnitude = emit_binary(ctx, BinaryOp::Sub, one, inv)?;

    let zero = float_const(ctx, 0.0, dtype, rank)?;
    let non_negative = emit_compare(ctx, CompareOp::GreaterEqual, x, zero)?;
    let negated = emit_unary(ctx, UnaryOp::Negate, magnitude)?;
    emit_select(ctx, non_negative, magnitude, negated)
}

/// `0.5 * (1 + erf(x / sqrt(2)))`.
fn emit_unit_normal_cdf(
    ctx: &mut RuleContext<'_, '_>,
    x: ValueId,
    dtype: DType,
    rank: usize,
) -> LegalizeResult<ValueId> {
    let rsqrt2 = float_const(ctx, std::f32::consts::FRAC_1_SQRT_2, dtype, rank)?;
    let scaled = emit_binary(ctx, BinaryOp::Mul, x, rsqrt2)?;
    let erf = emit_erf(ctx, scaled, dtype, rank)?;
    let one = float_const(ctx, 1.0, dtype, rank)?;
    let shifted = emit_binary(ctx, BinaryOp::Add, one, erf)?;
    let half = float_const(ctx, 0.5, dtype, rank)?;
    emit_binary(ctx, BinaryOp::Mul, shifted, half)
}

pub(super) fn gelu(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_float_dtype(&ty, "gelu")?;
    require_exact(ctx, ctx.operand(1)?)?;
    let cdf = emit_unit_normal_cdf(ctx, input, ty.dtype, ty.rank())?;
    let out = emit_binary(ctx, BinaryOp::Mul, input, cdf)?;
    let declared = ctx.result_type()?;
    Ok(vec![ctx.cast(out, declared.dtype)?])
}

/// `grad * (cdf(x) + x * exp(-x^2 / 2) / sqrt(2 pi))`.
pub(super) fn gelu_backward(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (grad, _) = ctx.tensor_operand(0)?;
    let (input, ty) = ctx.tensor_operand(1)?;
    require_float_dtype(&ty, "gelu_backward")?;
    require_exact(ctx, ctx.operand(2)?)?;
    let (dtype, rank) = (ty.dtype, ty.rank());

    let cdf = emit_unit_normal_cdf(ctx, input, dtype, rank)?;
    let squared = emit_binary(ctx, BinaryOp::Mul, input, input)?;
    let neg_half = float_const(ctx, -0.5, dtype, rank)?;
    let exponent = emit_binary(ctx, BinaryOp::Mul, squared, neg_half)?;
    let density = emit_unary(ctx, UnaryOp::Exp, exponent)?;
    let weighted = emit_binary(ctx, BinaryOp::Mul, density, input)?;
    let inv_sqrt_2pi = (2.0 * std::f64::consts::PI).sqrt().recip() as f32;
    let alpha = float_const(ctx, inv_sqrt_2pi, dtype, rank)?;
    let pdf_term = emit_binary(ctx, BinaryOp::Mul, weighted, alpha)?;
    let derivative = emit_binary(ctx, BinaryOp::Add, pdf_term, cdf)?;
    let out = emit_binary(ctx, BinaryOp::Mul, grad, derivative)?;
    let declared = ctx.result_type()?;
    Ok(vec![ctx.cast(out, declared.dtype)?])
}
