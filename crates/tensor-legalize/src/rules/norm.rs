use crate::constant::{is_none, require_bool, require_float, require_int_list};
use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{Dimension, ValueId};
use crate::target::{BinaryOp, ReduceKind, UnaryOp};

use super::reduce::reduce_axes;
use super::{emit_binary, emit_unary, float_const, require_float_dtype};

/// Optional per-channel operand of batch norm, reshaped to `[C, 1, ..]` so that it
/// broadcasts against the channel axis of a rank-`rank` input.
fn channel_operand(
    ctx: &mut RuleContext<'_, '_>,
    index: usize,
    channels: Dimension,
    rank: usize,
    what: &str,
) -> LegalizeResult<Option<ValueId>> {
    let operand = ctx.operand(index)?;
    if is_none(ctx, operand) {
        return Ok(None);
    }
    let ty = ctx.tensor_type(operand)?;
    if ty.rank() != 1 || !ty.shape.dim(0).is_compatible_with(channels) {
        return Err(LegalizeError::shape_mismatch(format!(
            "batch norm {what} {:?} does not match {channels:?} channels",
            ty.shape.dims()
        )));
    }
    let mut dims = vec![ty.shape.dim(0)];
    dims.extend(std::iter::repeat(Dimension::Static(1)).take(rank - 2));
    Ok(Some(ctx.reshape(operand, &dims)?))
}

/// Inference-mode batch norm: `(x - mean) * rsqrt(var + eps) * weight + bias`.
pub(super) fn batch_norm(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_float_dtype(&ty, "batch_norm")?;
    if ty.rank() < 2 {
        return Err(LegalizeError::shape(format!(
            "batch norm input must have a channel axis, got rank {}",
            ty.rank()
        )));
    }
    if require_bool(ctx, ctx.operand(5)?, "training")? {
        return Err(LegalizeError::option("training-mode batch norm is not supported"));
    }
    if is_none(ctx, ctx.operand(6)?) {
        return Err(LegalizeError::option("batch norm without momentum is not supported"));
    }
    let eps = require_float(ctx, ctx.operand(7)?, "eps")?;

    let rank = ty.rank();
    let channels = ty.shape.dim(1);
    let weight = channel_operand(ctx, 1, channels, rank, "weight")?;
    let bias = channel_operand(ctx, 2, channels, rank, "bias")?;
    let mean = channel_operand(ctx, 3, channels, rank, "running_mean")?;
    let var = channel_operand(ctx, 4, channels, rank, "running_var")?;
    let (Some(mean), Some(var)) = (mean, var) else {
        return Err(LegalizeError::option("batch norm requires running statistics"));
    };

    let eps = float_const(ctx, eps as f32, ty.dtype, rank - 1)?;
    let centered = emit_binary(ctx, BinaryOp::Sub, input, mean)?;
    let var_eps = emit_binary(ctx, BinaryOp::Add, var, eps)?;
    let inv_std = emit_unary(ctx, UnaryOp::Rsqrt, var_eps)?;
    let mut out = emit_binary(ctx, BinaryOp::Mul, centered, inv_std)?;
    if let Some(weight) = weight {
        out = emit_binary(ctx, BinaryOp::Mul, out, weight)?;
    }
    if let Some(bias) = bias {
        out = emit_binary(ctx, BinaryOp::Add, out, bias)?;
    }
    let declared = ctx.result_type()?;
    Ok(vec![ctx.cast(out, declared.dtype)?])
}

/// `native_layer_norm(input, normalized_shape, weight?, bias?, eps)` returning
/// `(out, mean, var)` with biased variance.
pub(super) fn layer_norm(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_float_dtype(&ty, "layer_norm")?;
    let normalized = require_int_list(ctx, ctx.operand(1)?, "normalized_shape")?;
    let rank = ty.rank();
    if normalized.is_empty() || normalized.len() > rank {
        return Err(LegalizeError::shape_mismatch(format!(
            "normalized shape {normalized:?} is not a suffix of {:?}",
            ty.shape.dims()
        )));
    }
    let offset = rank - normalized.len();
    let mut normalized_dims = Vec::with_capacity(normalized.len());
    for (i, &extent) in normalized.iter().enumerate() {
        let extent = usize::try_from(extent).map_err(|_| {
            LegalizeError::operand(format!("normalized shape entry {extent} is negative"))
        })?;
        if !ty.shape.dim(offset + i).is_compatible_with(extent.into()) {
            return Err(LegalizeError::shape_mismatch(format!(
                "normalized shape {normalized:?} is not a suffix of {:?}",
                ty.shape.dims()
            )));
        }
        normalized_dims.push(extent);
    }
    let count: usize = normalized_dims.iter().product();
    if count == 0 {
        return Err(LegalizeError::shape("layer norm over zero elements"));
    }

    let mut affine = [None, None];
    for (slot, (index, what)) in affine.iter_mut().zip([(2, "weight"), (3, "bias")]) {
        let operand = ctx.operand(index)?;
        if is_none(ctx, operand) {
            continue;
        }
        let operand_ty = ctx.tensor_type(operand)?;
        if operand_ty.shape.static_dims().as_deref() != Some(normalized_dims.as_slice()) {
            return Err(LegalizeError::shape_mismatch(format!(
                "layer norm {what} {:?} differs from normalized shape {normalized:?}",
                operand_ty.shape.dims()
            )));
        }
        let mut dims = vec![Dimension::Static(1); offset];
        dims.extend(normalized_dims.iter().map(|&extent| Dimension::Static(extent)));
        *slot = Some(ctx.reshape(operand, &dims)?);
    }
    let eps = require_float(ctx, ctx.operand(4)?, "eps")?;

    let axes: Vec<usize> = (offset..rank).collect();
    let inv_count = float_const(ctx, 1.0 / count as f32, ty.dtype, rank)?;

    let sum = reduce_axes(ctx, ReduceKind::Sum, input, &axes)?;
    let mean = emit_binary(ctx, BinaryOp::Mul, sum, inv_count)?;
    let centered = emit_binary(ctx, BinaryOp::Sub, input, mean)?;
    let squared = emit_binary(ctx, BinaryOp::Mul, centered, centered)?;
    let sq_sum = reduce_axes(ctx, ReduceKind::Sum, squared, &axes)?;
    let var = emit_binary(ctx, BinaryOp::Mul, sq_sum, inv_count)?;

    let eps = float_const(ctx, eps as f32, ty.dtype, rank)?;
    let var_eps = emit_binary(ctx, BinaryOp::Add, var, eps)?;
    let inv_std = emit_unary(ctx, UnaryOp::Rsqrt, var_eps)?;
    let mut out = emit_binary(ctx, BinaryOp::Mul, centered, inv_std)?;
    let [weight, bias] = affine;
    if let Some(weight) = weight {
        out = emit_binary(ctx, BinaryOp::Mul, out, weight)?;
    }
    if let Some(bias) = bias {
        out = emit_binary(ctx, BinaryOp::Add, out, bias)?;
    }

    let declared = ctx.result_types()?;
    let mut results = Vec::with_capacity(3);
    for (value, expected) in [out, mean, var].into_iter().zip(&declared) {
        results.push(ctx.cast(value, expected.dtype)?);
    }
    Ok(results)
}
