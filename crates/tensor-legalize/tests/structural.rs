mod legalize_support;

use anyhow::Result;
use legalize_support::{f32_ty, legalize, legalize_and_run, ramp, result_shape, rule_error};
use tensor_legalize::ir::Operation;
use tensor_legalize::target::{ReshapeDim, TargetOp};
use tensor_legalize::{
    DType, Dimension, FunctionBuilder, LegalizeError, Shape, SourceOp, TensorType,
};
use tensor_legalize_ref_cpu::CpuTensor;

fn count_target(func: &tensor_legalize::Function, predicate: impl Fn(&TargetOp) -> bool) -> usize {
    func.count_ops(|op| matches!(op, Operation::Target(target) if predicate(target)))
}

#[test]
fn view_with_inferred_extent_keeps_element_order() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3, 4]));
    let shape = b.int_list(&[4, -1]);
    let y = b.source(SourceOp::View, &[x, shape], f32_ty(&[4, 6]));
    let func = b.finish("view", vec![y]);

    let data = ramp(24);
    let out = legalize_and_run(func, &[CpuTensor::f32(&[2, 3, 4], data.clone())])?;
    assert_eq!(out[0].dims, vec![4, 6]);
    assert_eq!(out[0].as_f32()?, data.as_slice());
    Ok(())
}

#[test]
fn reshape_round_trip_is_canonicalized_away() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 6]));
    let flat = b.int_list(&[12]);
    let y = b.source(SourceOp::Reshape, &[x, flat], f32_ty(&[12]));
    let back = b.int_list(&[2, 6]);
    let z = b.source(SourceOp::Reshape, &[y, back], f32_ty(&[2, 6]));
    let func = legalize(b.finish("round_trip", vec![z]))?;

    assert_eq!(count_target(&func, |op| matches!(op, TargetOp::Reshape(_))), 0);
    assert_eq!(func.result_ids, func.parameter_ids);
    Ok(())
}

#[test]
fn reshape_rejects_two_inferred_extents() {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3, 4]));
    let shape = b.int_list(&[-1, -1]);
    let y = b.source(SourceOp::Reshape, &[x, shape], f32_ty(&[6, 4]));
    let err = rule_error(b.finish("double_infer", vec![y]));
    assert!(matches!(err, LegalizeError::UnsupportedShape(_)), "{err}");
}

#[test]
fn squeeze_drops_all_unit_axes() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[1, 4, 1, 5]));
    let y = b.source(SourceOp::Squeeze, &[x], f32_ty(&[4, 5]));
    let func = legalize(b.finish("squeeze", vec![y]))?;
    assert_eq!(result_shape(&func, 0), Shape::from_static(&[4, 5]));

    let data = ramp(20);
    let out = tensor_legalize_ref_cpu::run_function(
        &func,
        &[CpuTensor::f32(&[1, 4, 1, 5], data.clone())],
    )?;
    assert_eq!(out[0].dims, vec![4, 5]);
    assert_eq!(out[0].as_f32()?, data.as_slice());
    Ok(())
}

#[test]
fn squeeze_leaves_unknown_extents_in_place() -> Result<()> {
    let input = TensorType::new(
        DType::F32,
        Shape::new(vec![Dimension::Dynamic, Dimension::Static(1), Dimension::Static(3)]),
    );
    let output = TensorType::new(
        DType::F32,
        Shape::new(vec![Dimension::Dynamic, Dimension::Static(3)]),
    );
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(input);
    let y = b.source(SourceOp::Squeeze, &[x], output);
    let func = legalize(b.finish("squeeze_dynamic", vec![y]))?;

    let reshape = func
        .body
        .iter()
        .find_map(|inst| match &inst.op {
            Operation::Target(TargetOp::Reshape(spec)) => Some(spec.clone()),
            _ => None,
        })
        .expect("squeeze lowers to a reshape");
    assert_eq!(reshape.new_shape, vec![ReshapeDim::Infer, ReshapeDim::Fixed(3)]);

    let out = tensor_legalize_ref_cpu::run_function(
        &func,
        &[CpuTensor::f32(&[2, 1, 3], ramp(6))],
    )?;
    assert_eq!(out[0].dims, vec![2, 3]);
    Ok(())
}

#[test]
fn squeeze_dim_on_non_unit_axis_is_identity() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[3, 4]));
    let dim = b.int(0);
    let y = b.source(SourceOp::SqueezeDim, &[x, dim], f32_ty(&[3, 4]));
    let func = legalize(b.finish("squeeze_dim", vec![y]))?;
    assert_eq!(func.result_ids, func.parameter_ids);
    Ok(())
}

#[test]
fn unsqueeze_with_negative_dim_appends_an_axis() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[3, 4]));
    let dim = b.int(-1);
    let y = b.source(SourceOp::Unsqueeze, &[x, dim], f32_ty(&[3, 4, 1]));
    let out = legalize_and_run(
        b.finish("unsqueeze", vec![y]),
        &[CpuTensor::f32(&[3, 4], ramp(12))],
    )?;
    assert_eq!(out[0].dims, vec![3, 4, 1]);
    Ok(())
}

#[test]
fn flatten_merges_trailing_axes() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3, 4]));
    let start = b.int(1);
    let end = b.int(-1);
    let y = b.source(SourceOp::Flatten, &[x, start, end], f32_ty(&[2, 12]));
    let data = ramp(24);
    let out = legalize_and_run(
        b.finish("flatten", vec![y]),
        &[CpuTensor::f32(&[2, 3, 4], data.clone())],
    )?;
    assert_eq!(out[0].dims, vec![2, 12]);
    assert_eq!(out[0].as_f32()?, data.as_slice());
    Ok(())
}

#[test]
fn flatten_of_a_scalar_has_one_element() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[]));
    let start = b.int(0);
    let end = b.int(-1);
    let y = b.source(SourceOp::Flatten, &[x, start, end], f32_ty(&[1]));
    let func = legalize(b.finish("flatten_scalar", vec![y]))?;
    assert_eq!(result_shape(&func, 0), Shape::from_static(&[1]));

    let out = tensor_legalize_ref_cpu::run_function(&func, &[CpuTensor::f32(&[], vec![2.5])])?;
    assert_eq!(out[0].dims, vec![1]);
    assert_eq!(out[0].as_f32()?, &[2.5]);
    Ok(())
}

#[test]
fn permute_moves_axes() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3, 4]));
    let dims = b.int_list(&[2, 0, 1]);
    let y = b.source(SourceOp::Permute, &[x, dims], f32_ty(&[4, 2, 3]));
    let data = ramp(24);
    let out = legalize_and_run(
        b.finish("permute", vec![y]),
        &[CpuTensor::f32(&[2, 3, 4], data.clone())],
    )?;

    let mut expected = Vec::with_capacity(24);
    for k in 0..4 {
        for i in 0..2 {
            for j in 0..3 {
                expected.push(data[i * 12 + j * 4 + k]);
            }
        }
    }
    assert_eq!(out[0].dims, vec![4, 2, 3]);
    assert_eq!(out[0].as_f32()?, expected.as_slice());
    Ok(())
}

#[test]
fn transpose_twice_cancels() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3]));
    let (d0, d1) = (b.int(0), b.int(1));
    let t = b.source(SourceOp::TransposeInt, &[x, d0, d1], f32_ty(&[3, 2]));
    let tt = b.source(SourceOp::TransposeInt, &[t, d1, d0], f32_ty(&[2, 3]));
    let func = b.finish("transpose_twice", vec![t, tt]);

    let data = ramp(6);
    let out = legalize_and_run(func, &[CpuTensor::f32(&[2, 3], data.clone())])?;
    let expected: Vec<f32> = (0..3)
        .flat_map(|j| (0..2).map(move |i| (i, j)))
        .map(|(i, j)| data[i * 3 + j])
        .collect();
    assert_eq!(out[0].as_f32()?, expected.as_slice());
    assert_eq!(out[1].as_f32()?, data.as_slice());
    Ok(())
}

#[test]
fn slice_clamps_end_to_the_extent() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 5]));
    let dim = b.int(1);
    let start = b.int(1);
    let end = b.int(100);
    let step = b.int(1);
    let y = b.source(SourceOp::SliceTensor, &[x, dim, start, end, step], f32_ty(&[2, 4]));
    let data = ramp(10);
    let out = legalize_and_run(
        b.finish("slice", vec![y]),
        &[CpuTensor::f32(&[2, 5], data.clone())],
    )?;
    let expected: Vec<f32> = data[1..5].iter().chain(&data[6..10]).copied().collect();
    assert_eq!(out[0].as_f32()?, expected.as_slice());
    Ok(())
}

#[test]
fn slice_with_negative_start_and_open_end() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[5, 2]));
    let dim = b.int(0);
    let start = b.int(-2);
    let end = b.none();
    let step = b.int(1);
    let y = b.source(SourceOp::SliceTensor, &[x, dim, start, end, step], f32_ty(&[2, 2]));
    let data = ramp(10);
    let out = legalize_and_run(
        b.finish("slice_tail", vec![y]),
        &[CpuTensor::f32(&[5, 2], data.clone())],
    )?;
    assert_eq!(out[0].as_f32()?, &data[6..10]);
    Ok(())
}

#[test]
fn slice_rejects_non_unit_step() {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[6]));
    let dim = b.int(0);
    let start = b.int(0);
    let end = b.int(6);
    let step = b.int(2);
    let y = b.source(SourceOp::SliceTensor, &[x, dim, start, end, step], f32_ty(&[3]));
    let err = rule_error(b.finish("strided_slice", vec![y]));
    assert!(matches!(err, LegalizeError::UnsupportedOption(_)), "{err}");
}

#[test]
fn broadcast_to_is_absorbed_by_the_consumer() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[1, 4]));
    let y = b.add_parameter(f32_ty(&[3, 4]));
    let size = b.int_list(&[3, 4]);
    let wide = b.source(SourceOp::BroadcastTo, &[x, size], f32_ty(&[3, 4]));
    let alpha = b.int(1);
    let sum = b.source(SourceOp::AddTensor, &[wide, y, alpha], f32_ty(&[3, 4]));

    let xs = ramp(4);
    let ys: Vec<f32> = (0..12).map(|i| i as f32).collect();
    let out = legalize_and_run(
        b.finish("broadcast_add", vec![sum]),
        &[CpuTensor::f32(&[1, 4], xs.clone()), CpuTensor::f32(&[3, 4], ys.clone())],
    )?;
    let expected: Vec<f32> = (0..12).map(|i| xs[i % 4] + ys[i]).collect();
    assert_eq!(out[0].dims, vec![3, 4]);
    assert_eq!(out[0].as_f32()?, expected.as_slice());
    Ok(())
}

#[test]
fn broadcast_to_rejects_rank_changes() {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[4]));
    let size = b.int_list(&[3, 4]);
    let y = b.source(SourceOp::BroadcastTo, &[x, size], f32_ty(&[3, 4]));
    let err = rule_error(b.finish("broadcast_rank", vec![y]));
    assert!(matches!(err, LegalizeError::UnsupportedShape(_)), "{err}");
}

#[test]
fn broadcast_to_cannot_feed_a_reduction() {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[1, 4]));
    let size = b.int_list(&[3, 4]);
    let wide = b.source(SourceOp::BroadcastTo, &[x, size], f32_ty(&[3, 4]));
    let dims = b.int_list(&[0]);
    let keepdim = b.bool(false);
    let dtype = b.none();
    let sum = b.source(SourceOp::SumDimIntList, &[wide, dims, keepdim, dtype], f32_ty(&[4]));
    let err = rule_error(b.finish("broadcast_sum", vec![sum]));
    assert!(matches!(err, LegalizeError::UnsupportedShape(_)), "{err}");
    assert!(err.to_string().contains(SourceOp::SumDimIntList.name()), "{err}");
}

#[test]
fn broadcast_to_cannot_be_returned_unstretched() {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[1, 4]));
    let size = b.int_list(&[3, 4]);
    let wide = b.source(SourceOp::BroadcastTo, &[x, size], f32_ty(&[3, 4]));
    let err = rule_error(b.finish("broadcast_result", vec![wide]));
    assert!(matches!(err, LegalizeError::UnsupportedShape(_)), "{err}");
}

#[test]
fn same_shape_broadcast_to_is_returned_as_is() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[3, 4]));
    let size = b.int_list(&[3, -1]);
    let y = b.source(SourceOp::BroadcastTo, &[x, size], f32_ty(&[3, 4]));
    let data = ramp(12);
    let out = legalize_and_run(
        b.finish("broadcast_same", vec![y]),
        &[CpuTensor::f32(&[3, 4], data.clone())],
    )?;
    assert_eq!(out[0].dims, vec![3, 4]);
    assert_eq!(out[0].as_f32()?, data.as_slice());
    Ok(())
}
