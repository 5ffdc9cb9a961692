//! Compile-time operand matching.
//!
//! Rules read option operands (axes, flags, shapes) through these helpers. The `match_*`
//! functions return `None` when the operand is not a constant of the requested kind;
//! the `require_*` functions turn that into [`LegalizeError::NonConstantOperand`].

use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{ConstantValue, Operand, Operation, ValueId};

/// Integer or floating-point scalar literal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Int(value) => value as f64,
            Scalar::Float(value) => value,
        }
    }
}

fn constant<'a>(ctx: &'a RuleContext<'_, '_>, value: ValueId) -> Option<&'a ConstantValue> {
    match ctx.defining_op(value)? {
        Operation::Constant(constant) => Some(constant),
        _ => None,
    }
}

pub fn match_int(ctx: &RuleContext<'_, '_>, value: ValueId) -> Option<i64> {
    match constant(ctx, value)? {
        ConstantValue::Int(v) => Some(*v),
        _ => None,
    }
}

pub fn match_float(ctx: &RuleContext<'_, '_>, value: ValueId) -> Option<f64> {
    match constant(ctx, value)? {
        ConstantValue::Float(v) => Some(*v),
        _ => None,
    }
}

pub fn match_bool(ctx: &RuleContext<'_, '_>, value: ValueId) -> Option<bool> {
    match constant(ctx, value)? {
        ConstantValue::Bool(v) => Some(*v),
        _ => None,
    }
}

pub fn match_str<'a>(ctx: &'a RuleContext<'_, '_>, value: ValueId) -> Option<&'a str> {
    match constant(ctx, value)? {
        ConstantValue::Str(v) => Some(v.as_str()),
        _ => None,
    }
}

pub fn is_none(ctx: &RuleContext<'_, '_>, value: ValueId) -> bool {
    matches!(constant(ctx, value), Some(ConstantValue::None))
}

pub fn match_scalar(ctx: &RuleContext<'_, '_>, value: ValueId) -> Option<Scalar> {
    match constant(ctx, value)? {
        ConstantValue::Int(v) => Some(Scalar::Int(*v)),
        ConstantValue::Float(v) => Some(Scalar::Float(*v)),
        _ => None,
    }
}

/// Elements of a list of constant integers.
pub fn match_int_list(ctx: &RuleContext<'_, '_>, value: ValueId) -> Option<Vec<i64>> {
    if !matches!(ctx.defining_op(value)?, Operation::ListConstruct) {
        return None;
    }
    ctx.defining_operands(value)
        .iter()
        .map(|operand| match operand {
            Operand::Value(element) => match_int(ctx, *element),
            Operand::TupleElement { .. } => None,
        })
        .collect()
}

pub fn require_int(ctx: &RuleContext<'_, '_>, value: ValueId, what: &str) -> LegalizeResult<i64> {
    match_int(ctx, value)
        .ok_or_else(|| LegalizeError::non_constant(format!("{what} must be a constant int")))
}

pub fn require_bool(
    ctx: &RuleContext<'_, '_>,
    value: ValueId,
    what: &str,
) -> LegalizeResult<bool> {
    match_bool(ctx, value)
        .ok_or_else(|| LegalizeError::non_constant(format!("{what} must be a constant bool")))
}

pub fn require_float(
    ctx: &RuleContext<'_, '_>,
    value: ValueId,
    what: &str,
) -> LegalizeResult<f64> {
    match_float(ctx, value)
        .ok_or_else(|| LegalizeError::non_constant(format!("{what} must be a constant float")))
}

pub fn require_str<'a>(
    ctx: &'a RuleContext<'_, '_>,
    value: ValueId,
    what: &str,
) -> LegalizeResult<&'a str> {
    match_str(ctx, value)
        .ok_or_else(|| LegalizeError::non_constant(format!("{what} must be a constant string")))
}

pub fn require_int_list(
    ctx: &RuleContext<'_, '_>,
    value: ValueId,
    what: &str,
) -> LegalizeResult<Vec<i64>> {
    match_int_list(ctx, value)
        .ok_or_else(|| LegalizeError::non_constant(format!("{what} must be a constant int list")))
}

/// A flag that must be constant `false` (or `None`) for the rule to apply.
pub fn require_false(ctx: &RuleContext<'_, '_>, value: ValueId, what: &str) -> LegalizeResult<()> {
    if is_none(ctx, value) {
        return Ok(());
    }
    if require_bool(ctx, value, what)? {
        return Err(LegalizeError::option(format!("{what} = true is not supported")));
    }
    Ok(())
}
