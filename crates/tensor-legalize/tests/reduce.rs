mod legalize_support;

use anyhow::Result;
use legalize_support::{
    assert_close, f32_ty, legalize, legalize_and_run, project, ramp, result_shape, rule_error,
    tuple, ty,
};
use tensor_legalize::ir::Operation;
use tensor_legalize::target::TargetOp;
use tensor_legalize::{DType, FunctionBuilder, LegalizeError, Shape, SourceOp};
use tensor_legalize_ref_cpu::CpuTensor;

fn sum_over(data: &[f32], dims: [usize; 3], axis: usize) -> Vec<f32> {
    let [a, b, c] = dims;
    let mut out = Vec::new();
    match axis {
        1 => {
            for i in 0..a {
                for k in 0..c {
                    out.push((0..b).map(|j| data[i * b * c + j * c + k]).sum());
                }
            }
        }
        2 => {
            for row in data.chunks(c) {
                out.push(row.iter().sum());
            }
        }
        _ => unreachable!("test helper covers axes 1 and 2"),
    }
    out
}

#[test]
fn sum_with_keepdim_keeps_a_unit_axis() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3, 4]));
    let dims = b.int_list(&[1]);
    let keepdim = b.bool(true);
    let dtype = b.none();
    let y = b.source(SourceOp::SumDimIntList, &[x, dims, keepdim, dtype], f32_ty(&[2, 1, 4]));
    let xs = ramp(24);
    let out = legalize_and_run(b.finish("sum_keepdim", vec![y]), &[CpuTensor::f32(&[2, 3, 4], xs.clone())])?;
    assert_eq!(out[0].dims, vec![2, 1, 4]);
    assert_close(out[0].as_f32()?, &sum_over(&xs, [2, 3, 4], 1), 1e-5);
    Ok(())
}

#[test]
fn duplicate_reduction_dims_reduce_once() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3, 4]));
    let dims = b.int_list(&[1, -2]);
    let keepdim = b.bool(true);
    let dtype = b.none();
    let y = b.source(SourceOp::SumDimIntList, &[x, dims, keepdim, dtype], f32_ty(&[2, 1, 4]));
    let func = legalize(b.finish("sum_dup", vec![y]))?;
    let reduces = func.count_ops(|op| matches!(op, Operation::Target(TargetOp::Reduce(_))));
    assert_eq!(reduces, 1);
    Ok(())
}

#[test]
fn mean_over_the_last_axis() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3, 4]));
    let dims = b.int_list(&[-1]);
    let keepdim = b.bool(false);
    let dtype = b.none();
    let y = b.source(SourceOp::MeanDim, &[x, dims, keepdim, dtype], f32_ty(&[2, 3]));
    let xs = ramp(24);
    let out = legalize_and_run(b.finish("mean", vec![y]), &[CpuTensor::f32(&[2, 3, 4], xs.clone())])?;
    let expected: Vec<f32> = sum_over(&xs, [2, 3, 4], 2).iter().map(|s| s / 4.0).collect();
    assert_eq!(out[0].dims, vec![2, 3]);
    assert_close(out[0].as_f32()?, &expected, 1e-6);
    Ok(())
}

#[test]
fn mean_into_an_integer_tensor_is_rejected() {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(ty(DType::Si32, &[2, 3]));
    let dims = b.int_list(&[1]);
    let keepdim = b.bool(false);
    let dtype = b.none();
    let y = b.source(SourceOp::MeanDim, &[x, dims, keepdim, dtype], ty(DType::Si32, &[2]));
    let err = rule_error(b.finish("int_mean", vec![y]));
    assert!(matches!(err, LegalizeError::UnsupportedDType(_)), "{err}");
}

#[test]
fn sum_without_dims_reduces_to_a_scalar() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3]));
    let dims = b.none();
    let keepdim = b.bool(false);
    let dtype = b.none();
    let listed = b.source(SourceOp::SumDimIntList, &[x, dims, keepdim, dtype], f32_ty(&[]));
    let plain = b.source(SourceOp::Sum, &[x, dtype], f32_ty(&[]));
    let func = legalize(b.finish("sum_all", vec![listed, plain]))?;
    assert_eq!(result_shape(&func, 0), Shape::scalar());

    let out = tensor_legalize_ref_cpu::run_function(
        &func,
        &[CpuTensor::f32(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])],
    )?;
    assert_eq!(out[0].as_f32()?, &[21.0]);
    assert_eq!(out[1].as_f32()?, &[21.0]);
    Ok(())
}

#[test]
fn integer_sum_stays_integral() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(ty(DType::Si32, &[2, 2]));
    let dims = b.int_list(&[0]);
    let keepdim = b.bool(false);
    let dtype = b.none();
    let y = b.source(SourceOp::SumDimIntList, &[x, dims, keepdim, dtype], ty(DType::Si32, &[2]));
    let out = legalize_and_run(
        b.finish("int_sum", vec![y]),
        &[CpuTensor::int(DType::Si32, &[2, 2], vec![1, 2, 30, 40])],
    )?;
    assert_eq!(out[0].as_int()?, &[31, 42]);
    Ok(())
}

#[test]
fn any_and_all_reduce_booleans() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(ty(DType::I1, &[2, 3]));
    let any = b.source(SourceOp::Any, &[x], ty(DType::I1, &[]));
    let all = b.source(SourceOp::All, &[x], ty(DType::I1, &[]));
    let dim = b.int(1);
    let keepdim = b.bool(false);
    let any_dim = b.source(SourceOp::AnyDim, &[x, dim, keepdim], ty(DType::I1, &[2]));
    let out = legalize_and_run(
        b.finish("any_all", vec![any, all, any_dim]),
        &[CpuTensor::bool(&[2, 3], vec![false, false, false, true, false, true])],
    )?;
    assert_eq!(out[0].as_bool()?, &[true]);
    assert_eq!(out[1].as_bool()?, &[false]);
    assert_eq!(out[2].as_bool()?, &[false, true]);
    Ok(())
}

#[test]
fn argmax_over_flattened_input_and_along_a_dim() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3]));
    let none = b.none();
    let no_keep = b.bool(false);
    let flat = b.source(SourceOp::Argmax, &[x, none, no_keep], ty(DType::Si64, &[]));
    let dim = b.int(1);
    let keep = b.bool(true);
    let rows = b.source(SourceOp::Argmax, &[x, dim, keep], ty(DType::Si64, &[2, 1]));
    let out = legalize_and_run(
        b.finish("argmax", vec![flat, rows]),
        &[CpuTensor::f32(&[2, 3], vec![0.5, 3.0, 3.0, -1.0, 4.0, 2.0])],
    )?;
    assert_eq!(out[0].dtype, DType::Si64);
    assert_eq!(out[0].as_int()?, &[4]);
    assert_eq!(out[1].dims, vec![2, 1]);
    assert_eq!(out[1].as_int()?, &[1, 1]);
    Ok(())
}

#[test]
fn max_dim_returns_values_and_indices() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3]));
    let dim = b.int(-1);
    let keepdim = b.bool(false);
    let max = b.source(
        SourceOp::MaxDim,
        &[x, dim, keepdim],
        tuple(vec![f32_ty(&[2]), ty(DType::Si64, &[2])]),
    );
    let values = project(&mut b, max, 0, f32_ty(&[2]));
    let indices = project(&mut b, max, 1, ty(DType::Si64, &[2]));
    let out = legalize_and_run(
        b.finish("max_dim", vec![values, indices]),
        &[CpuTensor::f32(&[2, 3], vec![0.5, -2.0, 1.5, 7.0, 7.0, -3.0])],
    )?;
    assert_eq!(out[0].as_f32()?, &[1.5, 7.0]);
    assert_eq!(out[1].as_int()?, &[2, 0]);
    Ok(())
}
