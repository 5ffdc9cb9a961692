//! Shape arithmetic shared by the rules and the reference evaluator.

use crate::ir::{Dimension, Shape};

/// Returns static dimensions or maps the first dynamic axis to a caller-defined error.
pub fn static_dims_or_error<E, F>(shape: &Shape, mut on_dynamic: F) -> Result<Vec<usize>, E>
where
    F: FnMut(usize) -> E,
{
    let mut dims = Vec::with_capacity(shape.rank());
    for (axis, dim) in shape.dims().iter().enumerate() {
        match dim {
            Dimension::Static(value) => dims.push(*value),
            Dimension::Dynamic => return Err(on_dynamic(axis)),
        }
    }
    Ok(dims)
}

/// Computes `product(dims)` with overflow checking.
pub fn checked_element_count_or_error<E, F>(dims: &[usize], mut on_overflow: F) -> Result<usize, E>
where
    F: FnMut() -> E,
{
    let mut count = 1usize;
    for dim in dims {
        count = count.checked_mul(*dim).ok_or_else(&mut on_overflow)?;
    }
    Ok(count)
}

/// Builds row-major contiguous strides with overflow checking.
pub fn contiguous_strides_or_error<E, F>(
    dims: &[usize],
    mut on_overflow: F,
) -> Result<Vec<usize>, E>
where
    F: FnMut() -> E,
{
    let mut strides = vec![0usize; dims.len()];
    let mut stride = 1usize;
    for axis in (0..dims.len()).rev() {
        strides[axis] = stride;
        stride = stride
            .checked_mul(dims[axis])
            .ok_or_else(&mut on_overflow)?;
    }
    Ok(strides)
}

/// Right-aligned broadcast of two shapes. Size-1 axes stretch; `None` on conflict.
///
/// An unknown extent against a static extent other than 1 resolves to the static one.
pub fn broadcast_shapes(lhs: &Shape, rhs: &Shape) -> Option<Shape> {
    let rank = lhs.rank().max(rhs.rank());
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let a = axis_from_right(lhs, rank - 1 - i);
        let b = axis_from_right(rhs, rank - 1 - i);
        let dim = match (a, b) {
            (Dimension::Static(1), other) | (other, Dimension::Static(1)) => other,
            (Dimension::Static(x), Dimension::Static(y)) if x == y => Dimension::Static(x),
            (Dimension::Static(_), Dimension::Static(_)) => return None,
            (Dimension::Static(x), Dimension::Dynamic)
            | (Dimension::Dynamic, Dimension::Static(x)) => Dimension::Static(x),
            (Dimension::Dynamic, Dimension::Dynamic) => Dimension::Dynamic,
        };
        dims.push(dim);
    }
    Some(Shape::new(dims))
}

fn axis_from_right(shape: &Shape, offset: usize) -> Dimension {
    if offset < shape.rank() {
        shape.dim(shape.rank() - 1 - offset)
    } else {
        Dimension::Static(1)
    }
}

/// Maps a possibly negative axis into `[0, rank)`.
pub fn normalize_dim(dim: i64, rank: usize) -> Option<usize> {
    let rank = i64::try_from(rank).ok()?;
    let normalized = if dim < 0 { dim + rank } else { dim };
    if (0..rank).contains(&normalized) {
        Some(normalized as usize)
    } else {
        None
    }
}

/// Returns `true` when applying `perm` leaves the axis order unchanged.
pub fn is_monotonic(perm: &[usize]) -> bool {
    perm.windows(2).all(|pair| pair[0] < pair[1])
}

/// Returns `true` when `perm` is a permutation of `0..perm.len()`.
pub fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &axis in perm {
        if axis >= perm.len() || seen[axis] {
            return false;
        }
        seen[axis] = true;
    }
    true
}

/// Inverse permutation: `inverse[perm[i]] = i`.
pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (i, &axis) in perm.iter().enumerate() {
        inverse[axis] = i;
    }
    inverse
}

pub fn permute_shape(shape: &Shape, perm: &[usize]) -> Shape {
    Shape::new(perm.iter().map(|&axis| shape.dim(axis)).collect::<Vec<_>>())
}

/// Product of the extents, unknown if any factor is unknown.
pub fn product(dims: &[Dimension]) -> Dimension {
    dims.iter()
        .fold(Dimension::Static(1), |acc, dim| acc.mul(*dim))
}
