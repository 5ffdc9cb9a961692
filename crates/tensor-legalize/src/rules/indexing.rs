use crate::constant::{require_false, require_int};
use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{DType, Dimension, Shape, TensorLiteral, TensorType, ValueId};
use crate::shape_helpers::normalize_dim;
use crate::target::{BinaryOp, ConcatSpec, ReduceKind, ReduceSpec, TargetOp};

use super::{emit_binary, require_static};

fn require_integer_indices(ty: &TensorType, what: &str) -> LegalizeResult<()> {
    if ty.dtype.is_integer() {
        Ok(())
    } else {
        Err(LegalizeError::dtype(format!(
            "{what} indices must be integers, got {:?}",
            ty.dtype
        )))
    }
}

/// Table lookup `[N, C]` values at `[W]` flat indices, returning `[1, W, C]`.
fn emit_gather(
    ctx: &mut RuleContext<'_, '_>,
    values: ValueId,
    rows: usize,
    columns: usize,
    indices: ValueId,
    count: usize,
) -> LegalizeResult<ValueId> {
    let values_ty = ctx.tensor_type(values)?;
    let values = ctx.reshape(values, &[1.into(), rows.into(), columns.into()])?;
    let indices = ctx.cast(indices, DType::Si32)?;
    let indices = ctx.reshape(indices, &[1.into(), count.into()])?;
    let out = values_ty.with_shape(Shape::from_static(&[1, count, columns]));
    Ok(ctx.emit(TargetOp::Gather, &[values, indices], out))
}

/// `embedding(weight, indices, padding_idx, scale_grad_by_freq, sparse)` for a `[N, D]`
/// table and `[X, Y]` indices.
pub(super) fn embedding(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (weight, weight_ty) = ctx.tensor_operand(0)?;
    let (indices, indices_ty) = ctx.tensor_operand(1)?;
    if weight_ty.rank() != 2 || indices_ty.rank() != 2 {
        return Err(LegalizeError::shape(format!(
            "embedding expects rank-2 weight and indices, got ranks {} and {}",
            weight_ty.rank(),
            indices_ty.rank()
        )));
    }
    require_integer_indices(&indices_ty, "embedding")?;
    let weight_dims = require_static(&weight_ty, "embedding weight")?;
    let index_dims = require_static(&indices_ty, "embedding indices")?;
    // padding_idx only affects the gradient.
    require_int(ctx, ctx.operand(2)?, "padding_idx")?;
    require_false(ctx, ctx.operand(3)?, "scale_grad_by_freq")?;
    require_false(ctx, ctx.operand(4)?, "sparse")?;

    let (rows, width) = (weight_dims[0], weight_dims[1]);
    let count = index_dims[0] * index_dims[1];
    let gathered = emit_gather(ctx, weight, rows, width, indices, count)?;
    let out = ctx.reshape(
        gathered,
        &[index_dims[0].into(), index_dims[1].into(), width.into()],
    )?;
    let declared = ctx.result_type()?;
    Ok(vec![ctx.cast(out, declared.dtype)?])
}

/// Row-major strides of `dims`.
fn strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

/// Coordinate of `axis` at every position of `dims`, shaped `dims + [1]`.
fn iota_literal(dims: &[usize], axis: usize) -> TensorLiteral {
    let inner: usize = dims[axis + 1..].iter().product();
    let count: usize = dims.iter().product();
    let values = (0..count)
        .map(|flat| ((flat / inner) % dims[axis]) as i64)
        .collect();
    let mut shape = dims.to_vec();
    shape.push(1);
    TensorLiteral::int(DType::Si32, &shape, values)
}

/// `gather(self, dim, index, sparse_grad)`.
///
/// Each index position is expanded to a full coordinate tuple, with iota coordinates on
/// every axis but `dim`. The tuples are flattened with the strides of `self` and fed to
/// a single table lookup over the flattened values.
pub(super) fn gather(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (values, values_ty) = ctx.tensor_operand(0)?;
    let dim = require_int(ctx, ctx.operand(1)?, "dim")?;
    let (index, index_ty) = ctx.tensor_operand(2)?;
    require_false(ctx, ctx.operand(3)?, "sparse_grad")?;
    require_integer_indices(&index_ty, "gather")?;

    let rank = values_ty.rank();
    if index_ty.rank() != rank {
        return Err(LegalizeError::shape_mismatch(format!(
            "gather index rank {} differs from input rank {rank}",
            index_ty.rank()
        )));
    }
    let value_dims = require_static(&values_ty, "gather input")?;
    let index_dims = require_static(&index_ty, "gather index")?;
    let rank = rank.max(1);
    let value_dims = if value_dims.is_empty() { vec![1] } else { value_dims };
    let index_dims = if index_dims.is_empty() { vec![1] } else { index_dims };
    let axis = normalize_dim(dim, rank).ok_or_else(|| {
        LegalizeError::operand(format!("gather dim {dim} is out of range for rank {rank}"))
    })?;
    for (k, (&extent, &limit)) in index_dims.iter().zip(&value_dims).enumerate() {
        if k != axis && extent > limit {
            return Err(LegalizeError::shape_mismatch(format!(
                "gather index {index_dims:?} exceeds input {value_dims:?} on axis {k}"
            )));
        }
    }

    let mut tuple_dims: Vec<Dimension> = index_dims.iter().map(|&d| d.into()).collect();
    tuple_dims.push(Dimension::Static(1));
    let index = ctx.cast(index, DType::Si32)?;
    let index = ctx.reshape(index, &tuple_dims)?;
    let mut coordinates = Vec::with_capacity(rank);
    for k in 0..rank {
        if k == axis {
            coordinates.push(index);
        } else {
            coordinates.push(ctx.constant(iota_literal(&index_dims, k)));
        }
    }
    let mut tuple_static = index_dims.clone();
    tuple_static.push(rank);
    let tuples = ctx.emit(
        TargetOp::Concat(ConcatSpec { axis: rank }),
        &coordinates,
        TensorType::from_static(DType::Si32, &tuple_static),
    );

    let mut stride_dims = vec![1; rank];
    stride_dims.push(rank);
    let stride_values = strides(&value_dims).into_iter().map(|s| s as i64).collect();
    let weights = ctx.constant(TensorLiteral::int(DType::Si32, &stride_dims, stride_values));
    let weighted = emit_binary(ctx, BinaryOp::Mul, tuples, weights)?;
    let mut flat_dims = index_dims.clone();
    flat_dims.push(1);
    let flat = ctx.emit(
        TargetOp::Reduce(ReduceSpec {
            kind: ReduceKind::Sum,
            axis: rank,
        }),
        &[weighted],
        TensorType::from_static(DType::Si32, &flat_dims),
    );

    let total: usize = value_dims.iter().product();
    let count: usize = index_dims.iter().product();
    let gathered = emit_gather(ctx, values, total, 1, flat, count)?;
    let out_dims: Vec<Dimension> = index_ty.shape.dims().to_vec();
    let out = ctx.reshape(gathered, &out_dims)?;
    let declared = ctx.result_type()?;
    Ok(vec![ctx.cast(out, declared.dtype)?])
}
