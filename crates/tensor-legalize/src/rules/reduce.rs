use crate::constant::{is_none, require_bool, require_int, require_int_list, Scalar};
use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{DType, Dimension, Shape, TensorType, ValueId};
use crate::scalar::scalar_constant;
use crate::shape_helpers::{normalize_dim, product};
use crate::source::SourceOp;
use crate::target::{ArgMaxSpec, BinaryOp, ReduceKind, ReduceSpec, TargetOp};

use super::{drop_axes, emit_binary, keep_axes, ones};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReductionKind {
    Mean,
    Sum,
    Any,
    All,
}

/// Where a reduction finds its axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DimReader {
    /// `(self, dims, keepdim, ..)`; `None` or an empty list reduces everything.
    List,
    /// `(self, dim, keepdim)`.
    Single,
    /// `(self, ..)`: every axis, dims dropped.
    Every,
}

/// Normalized, deduplicated reduction axes in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReductionDescriptor {
    axes: Vec<usize>,
    keepdim: bool,
}

fn classify(op: SourceOp) -> (ReductionKind, DimReader) {
    match op {
        SourceOp::MeanDim => (ReductionKind::Mean, DimReader::List),
        SourceOp::SumDimIntList => (ReductionKind::Sum, DimReader::List),
        SourceOp::AnyDim => (ReductionKind::Any, DimReader::Single),
        SourceOp::All => (ReductionKind::All, DimReader::Every),
        SourceOp::Any => (ReductionKind::Any, DimReader::Every),
        SourceOp::Sum => (ReductionKind::Sum, DimReader::Every),
        other => unreachable!("{other} is not a reduction"),
    }
}

fn normalize_axes(dims: &[i64], rank: usize) -> LegalizeResult<Vec<usize>> {
    let mut axes = dims
        .iter()
        .map(|&dim| {
            normalize_dim(dim, rank).ok_or_else(|| {
                LegalizeError::operand(format!(
                    "reduction dim {dim} is out of range for rank {rank}"
                ))
            })
        })
        .collect::<LegalizeResult<Vec<_>>>()?;
    axes.sort_unstable();
    axes.dedup();
    Ok(axes)
}

fn read_dims(
    ctx: &RuleContext<'_, '_>,
    reader: DimReader,
    rank: usize,
) -> LegalizeResult<ReductionDescriptor> {
    let every = || (0..rank).collect::<Vec<_>>();
    match reader {
        DimReader::List => {
            let dims = ctx.operand(1)?;
            let axes = if is_none(ctx, dims) {
                every()
            } else {
                let dims = require_int_list(ctx, dims, "reduction dims")?;
                if dims.is_empty() {
                    every()
                } else {
                    normalize_axes(&dims, rank)?
                }
            };
            let keepdim = require_bool(ctx, ctx.operand(2)?, "keepdim")?;
            Ok(ReductionDescriptor { axes, keepdim })
        }
        DimReader::Single => {
            let dim = require_int(ctx, ctx.operand(1)?, "reduction dim")?;
            let axes = normalize_axes(&[dim], rank)?;
            let keepdim = require_bool(ctx, ctx.operand(2)?, "keepdim")?;
            Ok(ReductionDescriptor { axes, keepdim })
        }
        DimReader::Every => Ok(ReductionDescriptor {
            axes: every(),
            keepdim: false,
        }),
    }
}

/// One reduce per axis, innermost first, each keeping its axis as extent 1.
pub(super) fn reduce_axes(
    ctx: &mut RuleContext<'_, '_>,
    kind: ReduceKind,
    mut value: ValueId,
    axes: &[usize],
) -> LegalizeResult<ValueId> {
    for &axis in axes.iter().rev() {
        let ty = ctx.tensor_type(value)?;
        let shape = Shape::new(keep_axes(&ty.shape, &[axis]));
        value = ctx.emit(
            TargetOp::Reduce(ReduceSpec { kind, axis }),
            &[value],
            ty.with_shape(shape),
        );
    }
    Ok(value)
}

/// `mean.dim`, `sum.dim_IntList`, `any.dim`, `all`, `any`, `sum`.
pub(super) fn reduce(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    let (kind, reader) = classify(ctx.op());
    let desc = read_dims(ctx, reader, ty.rank())?;
    let out = ctx.result_type()?;

    let (value, native) = match kind {
        ReductionKind::Mean | ReductionKind::Sum => {
            if kind == ReductionKind::Mean && !out.dtype.is_float() {
                return Err(LegalizeError::dtype(format!(
                    "mean must produce a float tensor, declared {:?}",
                    out.dtype
                )));
            }
            (ctx.cast(input, out.dtype)?, ReduceKind::Sum)
        }
        ReductionKind::Any => (ctx.cast(input, DType::I1)?, ReduceKind::Any),
        ReductionKind::All => (ctx.cast(input, DType::I1)?, ReduceKind::All),
    };
    let mut reduced = reduce_axes(ctx, native, value, &desc.axes)?;

    if kind == ReductionKind::Mean {
        let reduced_dims: Vec<Dimension> =
            desc.axes.iter().map(|&axis| ty.shape.dim(axis)).collect();
        let Dimension::Static(count) = product(&reduced_dims) else {
            return Err(LegalizeError::shape(format!(
                "mean over dynamic axes of {:?}",
                ty.shape.dims()
            )));
        };
        let scale = scalar_constant(
            ctx,
            Scalar::Float(1.0 / count as f64),
            out.dtype,
            &ones(ty.rank()),
        )?;
        reduced = emit_binary(ctx, BinaryOp::Mul, reduced, scale)?;
    }

    if !desc.keepdim {
        reduced = ctx.reshape(reduced, &drop_axes(&ty.shape, &desc.axes))?;
    }
    Ok(vec![ctx.cast(reduced, out.dtype)?])
}

/// Native argmax over `axis`; indices come out as `si32` with the axis dropped.
fn argmax_axis(
    ctx: &mut RuleContext<'_, '_>,
    value: ValueId,
    axis: usize,
) -> LegalizeResult<ValueId> {
    let ty = ctx.tensor_type(value)?;
    let shape = Shape::new(drop_axes(&ty.shape, &[axis]));
    Ok(ctx.emit(
        TargetOp::ArgMax(ArgMaxSpec { axis }),
        &[value],
        TensorType::new(DType::Si32, shape),
    ))
}

/// Argmax with optional dim. Without a dim the input is folded to one axis first.
pub(super) fn argmax(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    let out = ctx.result_type()?;
    let dim = ctx.operand(1)?;
    let keepdim = require_bool(ctx, ctx.operand(2)?, "keepdim")?;

    let indices = if is_none(ctx, dim) {
        let flat = ctx.reshape(input, &[product(ty.shape.dims())])?;
        let indices = argmax_axis(ctx, flat, 0)?;
        if keepdim {
            ctx.reshape(indices, &Shape::ones(ty.rank()).into_dims())?
        } else {
            indices
        }
    } else {
        let dim = require_int(ctx, dim, "argmax dim")?;
        let axis = normalize_axes(&[dim], ty.rank())?[0];
        let indices = argmax_axis(ctx, input, axis)?;
        if keepdim {
            ctx.reshape(indices, &keep_axes(&ty.shape, &[axis]))?
        } else {
            indices
        }
    };
    Ok(vec![ctx.cast(indices, out.dtype)?])
}

/// `max.dim` returning `(values, indices)`.
pub(super) fn max_dim(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    let declared = ctx.result_types()?;
    let dim = require_int(ctx, ctx.operand(1)?, "max dim")?;
    let keepdim = require_bool(ctx, ctx.operand(2)?, "keepdim")?;
    let axis = normalize_axes(&[dim], ty.rank())?[0];

    let mut values = reduce_axes(ctx, ReduceKind::Max, input, &[axis])?;
    let mut indices = argmax_axis(ctx, input, axis)?;
    if keepdim {
        indices = ctx.reshape(indices, &keep_axes(&ty.shape, &[axis]))?;
    } else {
        values = ctx.reshape(values, &drop_axes(&ty.shape, &[axis]))?;
    }
    let values = ctx.cast(values, declared[0].dtype)?;
    let indices = match declared.get(1) {
        Some(indices_ty) => ctx.cast(indices, indices_ty.dtype)?,
        None => indices,
    };
    Ok(vec![values, indices])
}
