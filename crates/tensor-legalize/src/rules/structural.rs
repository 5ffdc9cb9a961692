use crate::constant::{is_none, require_int, require_int_list};
use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{Dimension, Shape, ValueId};
use crate::shape_helpers::{is_permutation, normalize_dim};
use crate::source::SourceOp;
use crate::target::{ReshapeDim, ReshapeSpec, SliceSpec, TargetOp};

use super::{require_int_or_float, require_static};

fn axis(dim: i64, rank: usize, what: &str) -> LegalizeResult<usize> {
    normalize_dim(dim, rank).ok_or_else(|| {
        LegalizeError::operand(format!("{what} {dim} is out of range for rank {rank}"))
    })
}

/// `reshape` and `view` with a constant shape list; at most one entry may be `-1`.
pub(super) fn reshape(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    if ctx.op() == SourceOp::View {
        require_int_or_float(&ty, "view")?;
    }
    let sizes = require_int_list(ctx, ctx.operand(1)?, "shape")?;
    let mut new_shape = Vec::with_capacity(sizes.len());
    let mut inferred = 0;
    for &size in &sizes {
        match size {
            -1 => {
                inferred += 1;
                new_shape.push(ReshapeDim::Infer);
            }
            size if size >= 0 => new_shape.push(ReshapeDim::Fixed(size as usize)),
            size => {
                return Err(LegalizeError::shape(format!(
                    "reshape size {size} is invalid in {sizes:?}"
                )))
            }
        }
    }
    if inferred > 1 {
        return Err(LegalizeError::shape(format!(
            "reshape to {sizes:?} infers more than one extent"
        )));
    }
    if let Some(count) = ty.element_count() {
        let fixed: usize = new_shape
            .iter()
            .map(|dim| match dim {
                ReshapeDim::Fixed(size) => *size,
                ReshapeDim::Infer => 1,
            })
            .product();
        let consistent = if inferred == 0 {
            fixed == count
        } else {
            fixed != 0 && count % fixed == 0
        };
        if !consistent {
            return Err(LegalizeError::shape_mismatch(format!(
                "cannot reshape {:?} into {sizes:?}",
                ty.shape.dims()
            )));
        }
    }
    let out = ctx.result_type()?;
    Ok(vec![ctx.emit(
        TargetOp::Reshape(ReshapeSpec { new_shape }),
        &[input],
        out,
    )])
}

/// `flatten(self, start, end)`: merges axes `start..=end`. A rank-0 input becomes `[1]`.
pub(super) fn flatten(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    let dims = require_static(&ty, "flatten")?;
    let start = require_int(ctx, ctx.operand(1)?, "start_dim")?;
    let end = require_int(ctx, ctx.operand(2)?, "end_dim")?;
    let new_dims: Vec<Dimension> = if dims.is_empty() {
        vec![Dimension::Static(1)]
    } else {
        let start = axis(start, dims.len(), "start_dim")?;
        let end = axis(end, dims.len(), "end_dim")?;
        if start > end {
            return Err(LegalizeError::operand(format!(
                "flatten start_dim {start} is after end_dim {end}"
            )));
        }
        let merged: usize = dims[start..=end].iter().product();
        dims[..start]
            .iter()
            .copied()
            .chain(std::iter::once(merged))
            .chain(dims[end + 1..].iter().copied())
            .map(Dimension::Static)
            .collect()
    };
    Ok(vec![ctx.reshape(input, &new_dims)?])
}

/// `squeeze(self)` drops every static unit axis; `squeeze.dim` drops one if it is a
/// static unit axis. Unknown extents are never squeezed.
pub(super) fn squeeze(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    let rank = ty.rank();
    let squeezed: Vec<usize> = match ctx.op() {
        SourceOp::Squeeze => (0..rank).filter(|&axis| ty.shape.dim(axis).is(1)).collect(),
        SourceOp::SqueezeDim => {
            let dim = require_int(ctx, ctx.operand(1)?, "dim")?;
            if rank == 0 {
                axis(dim, 1, "dim")?;
                Vec::new()
            } else {
                let axis = axis(dim, rank, "dim")?;
                if ty.shape.dim(axis).is(1) {
                    vec![axis]
                } else {
                    Vec::new()
                }
            }
        }
        other => unreachable!("{other} is not a squeeze"),
    };
    if squeezed.is_empty() {
        return Ok(vec![input]);
    }
    let dims = super::drop_axes(&ty.shape, &squeezed);
    Ok(vec![ctx.reshape(input, &dims)?])
}

pub(super) fn unsqueeze(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    require_int_or_float(&ty, "unsqueeze")?;
    let dim = require_int(ctx, ctx.operand(1)?, "dim")?;
    let at = axis(dim, ty.rank() + 1, "dim")?;
    let mut dims = ty.shape.into_dims();
    dims.insert(at, Dimension::Static(1));
    Ok(vec![ctx.reshape(input, &dims)?])
}

pub(super) fn permute(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    let dims = require_int_list(ctx, ctx.operand(1)?, "dims")?;
    if dims.len() != ty.rank() {
        return Err(LegalizeError::operand(format!(
            "permutation {dims:?} does not match rank {}",
            ty.rank()
        )));
    }
    let perm = dims
        .iter()
        .map(|&dim| axis(dim, ty.rank(), "permutation entry"))
        .collect::<LegalizeResult<Vec<_>>>()?;
    if !is_permutation(&perm) {
        return Err(LegalizeError::operand(format!(
            "{dims:?} is not a permutation"
        )));
    }
    Ok(vec![ctx.transpose(input, &perm)?])
}

/// `transpose.int(self, dim0, dim1)`.
pub(super) fn transpose_int(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    let rank = ty.rank();
    let dim0 = require_int(ctx, ctx.operand(1)?, "dim0")?;
    let dim1 = require_int(ctx, ctx.operand(2)?, "dim1")?;
    if rank == 0 {
        axis(dim0, 1, "dim0")?;
        axis(dim1, 1, "dim1")?;
        return Ok(vec![input]);
    }
    let (a, b) = (axis(dim0, rank, "dim0")?, axis(dim1, rank, "dim1")?);
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.swap(a, b);
    Ok(vec![ctx.transpose(input, &perm)?])
}

/// Optional slice bound; negative values count from the end.
fn slice_bound(
    ctx: &RuleContext<'_, '_>,
    index: usize,
    default: i64,
    extent: i64,
    what: &str,
) -> LegalizeResult<i64> {
    let operand = ctx.operand(index)?;
    if is_none(ctx, operand) {
        return Ok(default);
    }
    let value = require_int(ctx, operand, what)?;
    Ok(if value < 0 { value + extent } else { value })
}

/// `slice.Tensor(self, dim, start?, end?, step)` with unit step on a static input.
pub(super) fn slice(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    let dims = require_static(&ty, "slice")?;
    let dim = require_int(ctx, ctx.operand(1)?, "dim")?;
    let axis = axis(dim, dims.len(), "dim")?;
    let extent = dims[axis] as i64;

    let start = slice_bound(ctx, 2, 0, extent, "start")?;
    let end = slice_bound(ctx, 3, extent, extent, "end")?.min(extent);
    let step = require_int(ctx, ctx.operand(4)?, "step")?;
    if step != 1 {
        return Err(LegalizeError::option(format!(
            "slice step {step} is not supported, only 1"
        )));
    }
    if start < 0 || end < start {
        return Err(LegalizeError::operand(format!(
            "slice [{start}, {end}) is invalid for extent {extent}"
        )));
    }

    let mut starts = vec![0; dims.len()];
    let mut sizes = dims.clone();
    starts[axis] = start as usize;
    sizes[axis] = (end - start) as usize;
    let out = ty.with_shape(Shape::from_static(&sizes));
    Ok(vec![ctx.emit(
        TargetOp::Slice(SliceSpec { starts, sizes }),
        &[input],
        out,
    )])
}

/// `broadcast_to(self, size)`.
///
/// Equal-rank and rank-0 inputs are forwarded unchanged and stretched by the implicit
/// broadcasting of their consumers, which must all be broadcasting elementwise
/// operators. Rank-changing broadcasts are rejected.
pub(super) fn broadcast_to(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, ty) = ctx.tensor_operand(0)?;
    let sizes = require_int_list(ctx, ctx.operand(1)?, "size")?;
    if ty.rank() != 0 && ty.rank() != sizes.len() {
        return Err(LegalizeError::shape(format!(
            "broadcast of rank {} to {sizes:?} changes rank",
            ty.rank()
        )));
    }
    if ty.rank() != 0 {
        for (dim, &size) in ty.shape.dims().iter().zip(&sizes) {
            let fits = match usize::try_from(size) {
                Ok(size) => dim.is(1) || dim.is_compatible_with(Dimension::Static(size)),
                Err(_) => size == -1,
            };
            if !fits {
                return Err(LegalizeError::shape_mismatch(format!(
                    "{:?} does not broadcast to {sizes:?}",
                    ty.shape.dims()
                )));
            }
        }
    }
    if !ty.shape.is_compatible_with(&ctx.result_type()?.shape) {
        ctx.allow_implicit_broadcast()?;
    }
    Ok(vec![input])
}
