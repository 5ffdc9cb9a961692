//! N-dimensional matmul on top of the rank-3 native primitive.
//!
//! Both operands are rank-broadcast to a common rank, their leading (batch) axes are
//! split into axes shared by both sides and axes that only one side broadcasts over,
//! and each operand is folded to `(common, squeezed, contraction)`. After the native
//! multiply the result is unfolded and, when the folding reordered axes, transposed
//! back.

use crate::constant::is_none;
use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{DType, Dimension, Shape, TensorType, ValueId};
use crate::shape_helpers::{invert_permutation, product};
use crate::source::SourceOp;
use crate::target::{BinaryOp, MatMulSpec, RescaleSpec, TargetOp};

use super::{emit_binary, require_static};

/// How a matmul-family operator constrains its operand ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatmulInputs {
    /// `matmul`: any rank of at least one.
    AnyRank,
    /// `mm` (2) and `bmm` (3).
    FixedRank(usize),
}

/// One leading or matrix axis of the rank-broadcast operands.
#[derive(Debug, Clone, Copy)]
struct AxisExtent {
    axis: usize,
    extent: Dimension,
}

/// Rank-broadcast shape of one operand. A rank-1 right operand is placed on the
/// contraction axis rather than the last one.
fn rank_broadcast(shape: &Shape, rank: usize, is_rhs: bool) -> Vec<Dimension> {
    let pad = rank - shape.rank();
    if is_rhs && shape.rank() == 1 && pad > 0 {
        let mut dims = vec![Dimension::Static(1); pad - 1];
        dims.push(shape.dim(0));
        dims.push(Dimension::Static(1));
        return dims;
    }
    let mut dims = vec![Dimension::Static(1); pad];
    dims.extend_from_slice(shape.dims());
    dims
}

/// Batch axis carried by both operands. An unknown extent facing a static 1 is not
/// common: the other side broadcasts over it, so it folds into the squeezed group.
fn is_common(lhs: Dimension, rhs: Dimension) -> bool {
    if lhs.is(1) != rhs.is(1) {
        return false;
    }
    lhs.is_dynamic() || rhs.is_dynamic() || lhs == rhs
}

/// Maps a set of distinct axes to their rank order, yielding a permutation of
/// `0..axes.len()`.
fn rank_order(axes: &[usize]) -> Vec<usize> {
    axes.iter()
        .map(|axis| axes.iter().filter(|other| *other < axis).count())
        .collect()
}

fn extents(group: &[AxisExtent]) -> Vec<Dimension> {
    group.iter().map(|entry| entry.extent).collect()
}

/// Multiplies `lhs` by `rhs` with matmul broadcasting rules.
///
/// Returns the product in the accumulator type: the operand type for floats, `si32`
/// otherwise.
fn perform_matmul(
    ctx: &mut RuleContext<'_, '_>,
    lhs: ValueId,
    rhs: ValueId,
) -> LegalizeResult<ValueId> {
    let lhs_ty = ctx.tensor_type(lhs)?;
    let rhs_ty = ctx.tensor_type(rhs)?;
    if lhs_ty.dtype != rhs_ty.dtype {
        return Err(LegalizeError::type_mismatch(format!(
            "matmul operands have {:?} and {:?}",
            lhs_ty.dtype, rhs_ty.dtype
        )));
    }
    if lhs_ty.rank() == 0 || rhs_ty.rank() == 0 {
        return Err(LegalizeError::shape("matmul operands must have rank >= 1"));
    }
    let acc_dtype = if lhs_ty.dtype.is_float() {
        lhs_ty.dtype
    } else {
        DType::Si32
    };
    let spec = MatMulSpec {
        lhs_zero_point: lhs_ty.quant.map_or(0, |quant| quant.zero_point),
        rhs_zero_point: rhs_ty.quant.map_or(0, |quant| quant.zero_point),
    };

    let lhs_rank = lhs_ty.rank();
    let rhs_rank = rhs_ty.rank();
    let max_rank = lhs_rank.max(rhs_rank).max(2);
    let lhs_b = rank_broadcast(&lhs_ty.shape, max_rank, false);
    let rhs_b = rank_broadcast(&rhs_ty.shape, max_rank, true);
    let (lhs_k, rhs_k) = (lhs_b[max_rank - 1], rhs_b[max_rank - 2]);
    if !lhs_k.is_compatible_with(rhs_k) {
        return Err(LegalizeError::shape_mismatch(format!(
            "matmul contraction extents differ: {lhs_k:?} vs {rhs_k:?}"
        )));
    }
    let lhs = if lhs_rank == max_rank {
        lhs
    } else {
        ctx.reshape(lhs, &lhs_b)?
    };
    let rhs = if rhs_rank == max_rank {
        rhs
    } else {
        ctx.reshape(rhs, &rhs_b)?
    };

    let needs_batch_broadcast = !(max_rank < 3 || (max_rank == 3 && lhs_b[0] == rhs_b[0]));
    let batch = max_rank - 2;

    let mut common = Vec::new();
    let mut lhs_squeezed = Vec::new();
    let mut rhs_squeezed = Vec::new();
    let (mm_lhs, mm_rhs) = if !needs_batch_broadcast {
        (
            reshape_up_to_3d(ctx, lhs, &lhs_b)?,
            reshape_up_to_3d(ctx, rhs, &rhs_b)?,
        )
    } else {
        for axis in 0..batch {
            if is_common(lhs_b[axis], rhs_b[axis]) {
                common.push(axis);
            } else if !lhs_b[axis].is(1) && !rhs_b[axis].is(1) {
                return Err(LegalizeError::shape_mismatch(format!(
                    "matmul batch axis {axis} does not broadcast: {:?} vs {:?}",
                    lhs_b[axis], rhs_b[axis]
                )));
            } else {
                lhs_squeezed.push(AxisExtent {
                    axis,
                    extent: lhs_b[axis],
                });
                rhs_squeezed.push(AxisExtent {
                    axis,
                    extent: rhs_b[axis],
                });
            }
        }
        lhs_squeezed.push(AxisExtent {
            axis: max_rank - 2,
            extent: lhs_b[max_rank - 2],
        });
        rhs_squeezed.push(AxisExtent {
            axis: max_rank - 1,
            extent: rhs_b[max_rank - 1],
        });

        let lhs_common: Vec<Dimension> = common.iter().map(|&axis| lhs_b[axis]).collect();
        let rhs_common: Vec<Dimension> = common.iter().map(|&axis| rhs_b[axis]).collect();

        let mut lhs_perm = common.clone();
        lhs_perm.extend(lhs_squeezed.iter().map(|entry| entry.axis));
        lhs_perm.push(max_rank - 1);
        let lhs_t = ctx.transpose(lhs, &lhs_perm)?;
        let lhs_3d = ctx.reshape(
            lhs_t,
            &[
                product(&lhs_common),
                product(&extents(&lhs_squeezed)),
                lhs_b[max_rank - 1],
            ],
        )?;

        let mut rhs_perm = common.clone();
        rhs_perm.push(max_rank - 2);
        rhs_perm.extend(rhs_squeezed.iter().map(|entry| entry.axis));
        let rhs_t = ctx.transpose(rhs, &rhs_perm)?;
        let rhs_3d = ctx.reshape(
            rhs_t,
            &[
                product(&rhs_common),
                rhs_b[max_rank - 2],
                product(&extents(&rhs_squeezed)),
            ],
        )?;
        (lhs_3d, rhs_3d)
    };

    let mm_lhs_ty = ctx.tensor_type(mm_lhs)?;
    let mm_rhs_ty = ctx.tensor_type(mm_rhs)?;
    let (lhs_batch, rhs_batch) = (mm_lhs_ty.shape.dim(0), mm_rhs_ty.shape.dim(0));
    assert!(
        lhs_batch.is_compatible_with(rhs_batch),
        "matmul operands folded to different batch sizes {lhs_batch:?} and {rhs_batch:?}"
    );
    let batch_dim = if lhs_batch.is_dynamic() {
        rhs_batch
    } else {
        lhs_batch
    };
    let mm_shape = Shape::new(vec![
        batch_dim,
        mm_lhs_ty.shape.dim(1),
        mm_rhs_ty.shape.dim(2),
    ]);
    let product_value = ctx.emit(
        TargetOp::MatMul(spec),
        &[mm_lhs, mm_rhs],
        TensorType::new(acc_dtype, mm_shape),
    );

    if max_rank == 3 && !needs_batch_broadcast {
        return Ok(product_value);
    }

    let mut out_dims = Vec::new();
    let mut out_axes = Vec::new();
    if max_rank == 2 {
        if lhs_rank == 2 {
            out_dims.push(lhs_ty.shape.dim(0));
        }
        if rhs_rank == 2 {
            out_dims.push(rhs_ty.shape.dim(1));
        }
        return ctx.reshape(product_value, &out_dims);
    }

    for &axis in &common {
        out_dims.push(if lhs_b[axis] == rhs_b[axis] {
            lhs_b[axis]
        } else {
            Dimension::Dynamic
        });
        out_axes.push(axis);
    }
    for (squeezed, operand_rank) in [(&lhs_squeezed, lhs_rank), (&rhs_squeezed, rhs_rank)] {
        let Some((matrix_axis, batch_only)) = squeezed.split_last() else {
            unreachable!("squeezed groups always end with a matrix axis");
        };
        for entry in batch_only.iter().filter(|entry| !entry.extent.is(1)) {
            out_dims.push(entry.extent);
            out_axes.push(entry.axis);
        }
        if operand_rank > 1 {
            out_dims.push(matrix_axis.extent);
            out_axes.push(matrix_axis.axis);
        }
    }

    let reshaped = ctx.reshape(product_value, &out_dims)?;
    let perm = invert_permutation(&rank_order(&out_axes));
    ctx.transpose(reshaped, &perm)
}

/// Folds a rank-2 or rank-3 operand to rank 3 with a unit batch axis.
fn reshape_up_to_3d(
    ctx: &mut RuleContext<'_, '_>,
    value: ValueId,
    dims: &[Dimension],
) -> LegalizeResult<ValueId> {
    match dims.len() {
        3 => Ok(value),
        2 => ctx.reshape(value, &[Dimension::Static(1), dims[0], dims[1]]),
        rank => unreachable!("rank-{rank} operand reached the unbroadcast matmul path"),
    }
}

/// Brings the accumulator to the declared result, rescaling quantized products.
fn finish(
    ctx: &mut RuleContext<'_, '_>,
    product_value: ValueId,
    lhs_ty: &TensorType,
    rhs_ty: &TensorType,
    out: &TensorType,
) -> LegalizeResult<ValueId> {
    match (lhs_ty.quant, rhs_ty.quant, out.quant) {
        (Some(lhs_q), Some(rhs_q), Some(out_q)) => {
            let ty = ctx.tensor_type(product_value)?;
            let spec = RescaleSpec {
                scale: lhs_q.scale * rhs_q.scale / out_q.scale,
                input_zero_point: 0,
                output_zero_point: out_q.zero_point,
            };
            Ok(ctx.emit(
                TargetOp::Rescale(spec),
                &[product_value],
                TensorType::quantized(ty.shape, out_q),
            ))
        }
        _ if out.dtype.is_quantized() => Err(LegalizeError::unsupported_type(
            "quantized matmul needs quantization parameters on operands and result",
        )),
        _ => ctx.cast(product_value, out.dtype),
    }
}

/// `matmul`, `mm`, `bmm`.
pub(super) fn matmul(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let inputs = match ctx.op() {
        SourceOp::Matmul => MatmulInputs::AnyRank,
        SourceOp::Mm => MatmulInputs::FixedRank(2),
        SourceOp::Bmm => MatmulInputs::FixedRank(3),
        other => unreachable!("{other} is not a matmul operator"),
    };
    let (lhs, lhs_ty) = ctx.tensor_operand(0)?;
    let (rhs, rhs_ty) = ctx.tensor_operand(1)?;
    if let MatmulInputs::FixedRank(rank) = inputs {
        if lhs_ty.rank() != rank || rhs_ty.rank() != rank {
            return Err(LegalizeError::shape(format!(
                "{} expects rank-{rank} operands, got {} and {}",
                ctx.op().name(),
                lhs_ty.rank(),
                rhs_ty.rank()
            )));
        }
    }
    let out = ctx.result_type()?;
    let product_value = perform_matmul(ctx, lhs, rhs)?;
    Ok(vec![finish(ctx, product_value, &lhs_ty, &rhs_ty, &out)?])
}

/// `linear(input, weight, bias?)`: `input @ weight^T + bias`.
pub(super) fn linear(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, input_ty) = ctx.tensor_operand(0)?;
    let (weight, weight_ty) = ctx.tensor_operand(1)?;
    for (ty, what) in [(&input_ty, "input"), (&weight_ty, "weight")] {
        if !matches!(ty.rank(), 2 | 3) {
            return Err(LegalizeError::shape(format!(
                "linear {what} must be rank 2 or 3, got rank {}",
                ty.rank()
            )));
        }
        require_static(ty, "linear")?;
    }
    let bias = ctx.operand(2)?;
    let bias = if is_none(ctx, bias) {
        None
    } else {
        Some(ctx.tensor_type(bias).map(|_| bias)?)
    };

    let rank = weight_ty.rank();
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.swap(rank - 1, rank - 2);
    let weight_t = ctx.transpose(weight, &perm)?;

    let out = ctx.result_type()?;
    let mut product_value = perform_matmul(ctx, input, weight_t)?;
    if let Some(bias) = bias {
        let acc = ctx.tensor_type(product_value)?.dtype;
        let bias = ctx.cast(bias, acc)?;
        product_value = emit_binary(ctx, BinaryOp::Add, product_value, bias)?;
    }
    Ok(vec![finish(ctx, product_value, &input_ty, &weight_ty, &out)?])
}
