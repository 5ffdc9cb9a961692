use crate::constant::{
    is_none, match_bool, match_int, match_scalar, require_false, require_int, require_int_list,
    Scalar,
};
use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{DType, TensorLiteral, ValueId};
use crate::scalar::{materialize_scalar, scalar_constant};
use crate::source::SourceOp;

use super::{emit_select, require_static};

const CONTIGUOUS_FORMAT: i64 = 0;
const PRESERVE_FORMAT: i64 = 1;

/// Optional memory format operand; `None` or one of `accepted`.
fn check_memory_format(
    ctx: &RuleContext<'_, '_>,
    index: usize,
    accepted: &[i64],
) -> LegalizeResult<()> {
    if index >= ctx.operand_count() {
        return Ok(());
    }
    let operand = ctx.operand(index)?;
    if is_none(ctx, operand) {
        return Ok(());
    }
    let format = require_int(ctx, operand, "memory_format")?;
    if accepted.contains(&format) {
        Ok(())
    } else {
        Err(LegalizeError::option(format!(
            "memory format {format} is not supported"
        )))
    }
}

/// Factory keyword operands: layout must be strided and memory must not be pinned.
fn check_factory_options(
    ctx: &RuleContext<'_, '_>,
    layout: usize,
    pin_memory: usize,
) -> LegalizeResult<()> {
    if layout < ctx.operand_count() {
        let operand = ctx.operand(layout)?;
        if !is_none(ctx, operand) && match_int(ctx, operand) != Some(0) {
            return Err(LegalizeError::option("only the strided layout is supported"));
        }
    }
    if pin_memory < ctx.operand_count() {
        let operand = ctx.operand(pin_memory)?;
        if !is_none(ctx, operand) && match_bool(ctx, operand) != Some(false) {
            return Err(LegalizeError::option("pinned memory is not supported"));
        }
    }
    Ok(())
}

/// Splat constant of `scalar` with static `dims` and element type `dtype`.
///
/// Narrow integer types go through `Si32`; booleans are built directly.
fn fill_constant(
    ctx: &mut RuleContext<'_, '_>,
    scalar: Scalar,
    dtype: DType,
    dims: &[usize],
) -> LegalizeResult<ValueId> {
    match dtype {
        DType::I1 => Ok(ctx.constant(TensorLiteral::bool(dims, vec![scalar.as_f64() != 0.0]))),
        DType::Si8 | DType::Si16 | DType::Ui8 => {
            let wide = scalar_constant(ctx, scalar, DType::Si32, dims)?;
            ctx.cast(wide, dtype)
        }
        DType::Qi8 => Err(LegalizeError::unsupported_type(
            "constants of a quantized type are not supported",
        )),
        _ => scalar_constant(ctx, scalar, dtype, dims),
    }
}

/// `ones(size, ..)` and `zeros(size, ..)`.
pub(super) fn ones_zeros(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let sizes = require_int_list(ctx, ctx.operand(0)?, "size")?;
    let dims = sizes
        .iter()
        .map(|&size| {
            usize::try_from(size)
                .map_err(|_| LegalizeError::operand(format!("size {sizes:?} has a negative entry")))
        })
        .collect::<LegalizeResult<Vec<_>>>()?;
    check_factory_options(ctx, 2, 4)?;
    let fill = match ctx.op() {
        SourceOp::Ones => Scalar::Int(1),
        _ => Scalar::Int(0),
    };
    let out = ctx.result_type()?;
    Ok(vec![fill_constant(ctx, fill, out.dtype, &dims)?])
}

/// `fill.Scalar(self, value)`: a constant of the result shape.
pub(super) fn fill_scalar(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let out = ctx.result_type()?;
    let dims = require_static(&out, "fill")?;
    let value = ctx.operand(1)?;
    let scalar = match_scalar(ctx, value).ok_or_else(|| {
        LegalizeError::non_constant("fill value must be a constant scalar")
    })?;
    Ok(vec![fill_constant(ctx, scalar, out.dtype, &dims)?])
}

/// `masked_fill(self, mask, value)` as `select(mask, value, self)`.
pub(super) fn masked_fill(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    let (mask, mask_ty) = ctx.tensor_operand(1)?;
    if mask_ty.dtype != DType::I1 {
        return Err(LegalizeError::dtype(format!(
            "masked_fill mask must be boolean, got {:?}",
            mask_ty.dtype
        )));
    }
    let out = ctx.result_type()?;
    let fill = match ctx.op() {
        SourceOp::MaskedFillScalar => {
            let value = ctx.operand(2)?;
            materialize_scalar(ctx, value, out.dtype, &super::ones(ty.rank()))?
        }
        _ => {
            let (value, value_ty) = ctx.tensor_operand(2)?;
            if value_ty.rank() != 0 {
                return Err(LegalizeError::shape(format!(
                    "masked_fill value must be rank 0, got rank {}",
                    value_ty.rank()
                )));
            }
            ctx.cast(value, out.dtype)?
        }
    };
    let input = ctx.cast(input, out.dtype)?;
    Ok(vec![emit_select(ctx, mask, fill, input)?])
}

/// `arange.start_step(start, end, step, ..)` folded into a constant.
pub(super) fn arange(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let mut bounds = [Scalar::Int(0); 3];
    for (slot, (index, what)) in bounds
        .iter_mut()
        .zip([(0, "start"), (1, "end"), (2, "step")])
    {
        let operand = ctx.operand(index)?;
        *slot = match_scalar(ctx, operand).ok_or_else(|| {
            LegalizeError::non_constant(format!("arange {what} must be a constant scalar"))
        })?;
    }
    check_factory_options(ctx, 4, 6)?;
    let [start, end, step] = bounds;
    if step.as_f64() == 0.0 {
        return Err(LegalizeError::operand("arange step must be non-zero"));
    }
    let span = (end.as_f64() - start.as_f64()) / step.as_f64();
    if span < 0.0 {
        return Err(LegalizeError::operand(format!(
            "arange from {} to {} never reaches the end with step {}",
            start.as_f64(),
            end.as_f64(),
            step.as_f64()
        )));
    }
    let count = span.ceil() as usize;

    let out = ctx.result_type()?;
    let literal = match (start, step, out.dtype.is_integer() && out.dtype != DType::I1) {
        (Scalar::Int(start), Scalar::Int(step), true) => {
            let values = (0..count as i64).map(|i| start + i * step).collect();
            TensorLiteral::int(out.dtype, &[count], values)
        }
        _ if out.dtype.is_float() => {
            let (start, step) = (start.as_f64(), step.as_f64());
            let values = (0..count).map(|i| (start + i as f64 * step) as f32).collect();
            TensorLiteral::f32(&[count], values)
        }
        _ => {
            return Err(LegalizeError::dtype(format!(
                "arange with these bounds cannot produce {:?}",
                out.dtype
            )))
        }
    };
    let value = ctx.constant(literal);
    Ok(vec![ctx.cast(value, out.dtype)?])
}

/// `prim.NumToTensor.Scalar(a)` for an integer constant.
pub(super) fn num_to_tensor(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let value = require_int(ctx, ctx.operand(0)?, "a")?;
    let out = ctx.result_type()?;
    if !out.dtype.is_integer() {
        return Err(LegalizeError::dtype(format!(
            "NumToTensor of an integer cannot produce {:?}",
            out.dtype
        )));
    }
    Ok(vec![fill_constant(ctx, Scalar::Int(value), out.dtype, &[])?])
}

pub(super) fn contiguous(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    Ok(vec![ctx.operand(0)?])
}

/// Inference-mode dropout is the identity.
pub(super) fn dropout(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, _) = ctx.tensor_operand(0)?;
    require_false(ctx, ctx.operand(2)?, "train")?;
    let out = ctx.result_type()?;
    Ok(vec![ctx.cast(input, out.dtype)?])
}

/// `copy(self, src, non_blocking)` yields `src` converted to the element type of `self`.
pub(super) fn copy(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (_, self_ty) = ctx.tensor_operand(0)?;
    let (src, src_ty) = ctx.tensor_operand(1)?;
    require_false(ctx, ctx.operand(2)?, "non_blocking")?;
    if src_ty.rank() == 0 && self_ty.rank() != 0 {
        ctx.allow_implicit_broadcast()?;
    } else if self_ty.rank() != 0 && !self_ty.shape.is_compatible_with(&src_ty.shape) {
        return Err(LegalizeError::shape_mismatch(format!(
            "copy from {:?} into {:?}",
            src_ty.shape.dims(),
            self_ty.shape.dims()
        )));
    }
    let out = ctx.result_type()?;
    Ok(vec![ctx.cast(src, out.dtype)?])
}

/// `to.dtype(self, dtype, non_blocking, copy, memory_format?)`.
pub(super) fn to_dtype(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_static(&ty, "to.dtype")?;
    require_false(ctx, ctx.operand(2)?, "non_blocking")?;
    require_false(ctx, ctx.operand(3)?, "copy")?;
    check_memory_format(ctx, 4, &[CONTIGUOUS_FORMAT, PRESERVE_FORMAT])?;
    let out = ctx.result_type()?;
    Ok(vec![ctx.cast(input, out.dtype)?])
}

pub(super) fn clone(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, _) = ctx.tensor_operand(0)?;
    check_memory_format(ctx, 1, &[CONTIGUOUS_FORMAT])?;
    let out = ctx.result_type()?;
    Ok(vec![ctx.cast(input, out.dtype)?])
}
