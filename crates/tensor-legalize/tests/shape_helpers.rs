use proptest::prelude::*;
use tensor_legalize::shape_helpers::{
    broadcast_shapes, invert_permutation, is_monotonic, is_permutation, normalize_dim,
    permute_shape, product,
};
use tensor_legalize::{Dimension, Shape};

fn dimension() -> impl Strategy<Value = Dimension> {
    prop_oneof![
        4 => (1usize..5).prop_map(Dimension::Static),
        1 => Just(Dimension::Dynamic),
    ]
}

fn shape() -> impl Strategy<Value = Shape> {
    prop::collection::vec(dimension(), 0..5).prop_map(Shape::new)
}

fn permutation() -> impl Strategy<Value = Vec<usize>> {
    (1usize..6).prop_flat_map(|rank| Just((0..rank).collect::<Vec<_>>()).prop_shuffle())
}

proptest! {
    #[test]
    fn broadcast_is_commutative(a in shape(), b in shape()) {
        prop_assert_eq!(broadcast_shapes(&a, &b), broadcast_shapes(&b, &a));
    }

    #[test]
    fn broadcast_result_has_the_larger_rank(a in shape(), b in shape()) {
        if let Some(out) = broadcast_shapes(&a, &b) {
            prop_assert_eq!(out.rank(), a.rank().max(b.rank()));
        }
    }

    #[test]
    fn scalars_and_units_are_broadcast_identities(a in shape(), ones in 0usize..5) {
        prop_assert_eq!(broadcast_shapes(&a, &Shape::scalar()), Some(a.clone()));
        prop_assert_eq!(broadcast_shapes(&a, &a), Some(a.clone()));
        if ones <= a.rank() {
            prop_assert_eq!(broadcast_shapes(&a, &Shape::ones(ones)), Some(a.clone()));
        }
    }

    #[test]
    fn inverse_permutation_restores_the_shape(perm in permutation()) {
        prop_assert!(is_permutation(&perm));
        let dims: Vec<usize> = (0..perm.len()).map(|axis| axis + 2).collect();
        let shape = Shape::from_static(&dims);
        let inverse = invert_permutation(&perm);
        prop_assert_eq!(permute_shape(&permute_shape(&shape, &perm), &inverse), shape);
    }

    #[test]
    fn negative_axes_count_from_the_end(rank in 1usize..8, axis in 0usize..8) {
        let axis = axis % rank;
        let negative = axis as i64 - rank as i64;
        prop_assert_eq!(normalize_dim(negative, rank), Some(axis));
        prop_assert_eq!(normalize_dim(axis as i64, rank), Some(axis));
        prop_assert_eq!(normalize_dim(rank as i64, rank), None);
        prop_assert_eq!(normalize_dim(-(rank as i64) - 1, rank), None);
    }
}

#[test]
fn conflicting_extents_do_not_broadcast() {
    let lhs = Shape::from_static(&[2, 3]);
    let rhs = Shape::from_static(&[4, 3]);
    assert_eq!(broadcast_shapes(&lhs, &rhs), None);
}

#[test]
fn unknown_extent_takes_the_static_side() {
    let lhs = Shape::new(vec![Dimension::Dynamic, Dimension::Static(1)]);
    let rhs = Shape::from_static(&[4, 5]);
    assert_eq!(broadcast_shapes(&lhs, &rhs), Some(Shape::from_static(&[4, 5])));
}

#[test]
fn permutation_helpers() {
    assert!(is_monotonic(&[0, 2, 3]));
    assert!(!is_monotonic(&[1, 0]));
    assert!(!is_permutation(&[0, 0, 1]));
    assert!(!is_permutation(&[0, 3]));
    assert_eq!(invert_permutation(&[2, 0, 1]), vec![1, 2, 0]);
}

#[test]
fn product_of_extents() {
    assert_eq!(product(&[Dimension::Static(2), Dimension::Static(3)]), Dimension::Static(6));
    assert_eq!(product(&[Dimension::Static(2), Dimension::Dynamic]), Dimension::Dynamic);
    assert_eq!(product(&[]), Dimension::Static(1));
}
