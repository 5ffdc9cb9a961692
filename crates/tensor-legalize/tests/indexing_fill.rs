mod legalize_support;

use anyhow::Result;
use legalize_support::{assert_close, f32_ty, legalize, legalize_and_run, ramp, rule_error, ty};
use tensor_legalize::ir::{ConstantValue, Operation, TensorLiteral};
use tensor_legalize::target::TargetOp;
use tensor_legalize::{DType, FunctionBuilder, LegalizeError, SourceOp, ValueId};
use tensor_legalize_ref_cpu::CpuTensor;
use test_case::test_case;

#[test]
fn embedding_looks_up_rows() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let weight = b.add_parameter(f32_ty(&[4, 3]));
    let indices = b.add_parameter(ty(DType::Si64, &[2, 2]));
    let padding_idx = b.int(-1);
    let scale = b.bool(false);
    let sparse = b.bool(false);
    let y = b.source(
        SourceOp::Embedding,
        &[weight, indices, padding_idx, scale, sparse],
        f32_ty(&[2, 2, 3]),
    );
    let table = ramp(12);
    let ids = vec![3, 0, 1, 3];
    let out = legalize_and_run(
        b.finish("embedding", vec![y]),
        &[
            CpuTensor::f32(&[4, 3], table.clone()),
            CpuTensor::int(DType::Si64, &[2, 2], ids.clone()),
        ],
    )?;
    let expected: Vec<f32> = ids
        .iter()
        .flat_map(|&row| table[row as usize * 3..row as usize * 3 + 3].to_vec())
        .collect();
    assert_eq!(out[0].dims, vec![2, 2, 3]);
    assert_eq!(out[0].as_f32()?, expected.as_slice());
    Ok(())
}

fn gather_graph(values: &[usize], index: &[usize], dim: i64) -> tensor_legalize::Function {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(values));
    let idx = b.add_parameter(ty(DType::Si64, index));
    let dim = b.int(dim);
    let sparse = b.bool(false);
    let y = b.source(SourceOp::Gather, &[x, dim, idx, sparse], f32_ty(index));
    b.finish("gather", vec![y])
}

#[test_case(1; "along columns")]
#[test_case(0; "along rows")]
fn gather_picks_elements_along_a_dim(dim: i64) -> Result<()> {
    let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let index = vec![1, 0, 0, 1];
    let out = legalize_and_run(
        gather_graph(&[2, 3], &[2, 2], dim),
        &[
            CpuTensor::f32(&[2, 3], values.clone()),
            CpuTensor::int(DType::Si64, &[2, 2], index.clone()),
        ],
    )?;
    let expected: Vec<f32> = (0..2)
        .flat_map(|i| (0..2).map(move |j| (i, j)))
        .map(|(i, j)| {
            let picked = index[i * 2 + j] as usize;
            if dim == 1 {
                values[i * 3 + picked]
            } else {
                values[picked * 3 + j]
            }
        })
        .collect();
    assert_eq!(out[0].as_f32()?, expected.as_slice());
    Ok(())
}

#[test]
fn gather_index_larger_than_input_is_rejected() {
    let err = rule_error(gather_graph(&[2, 3], &[3, 2], 1));
    assert!(matches!(err, LegalizeError::ShapeMismatch(_)), "{err}");
}

/// Operands of a factory call after `size`: dtype, layout, device, pin_memory.
fn factory_options(b: &mut FunctionBuilder) -> [ValueId; 4] {
    [b.none(), b.none(), b.none(), b.none()]
}

#[test]
fn ones_and_zeros_build_constants() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let size = b.int_list(&[2, 3]);
    let [dtype, layout, device, pin] = factory_options(&mut b);
    let ones = b.source(SourceOp::Ones, &[size, dtype, layout, device, pin], f32_ty(&[2, 3]));
    let zeros_size = b.int_list(&[3]);
    let zeros = b.source(
        SourceOp::Zeros,
        &[zeros_size, dtype, layout, device, pin],
        ty(DType::Si64, &[3]),
    );
    let out = legalize_and_run(b.finish("factories", vec![ones, zeros]), &[])?;
    assert_eq!(out[0].as_f32()?, &[1.0; 6]);
    assert_eq!(out[1].dtype, DType::Si64);
    assert_eq!(out[1].as_int()?, &[0, 0, 0]);
    Ok(())
}

#[test]
fn fill_and_masked_fill() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[4]));
    let mask = b.add_parameter(ty(DType::I1, &[4]));
    let fill_value = b.float(2.5);
    let filled = b.source(SourceOp::FillScalar, &[x, fill_value], f32_ty(&[4]));
    let masked_value = b.float(-1.0);
    let masked = b.source(SourceOp::MaskedFillScalar, &[x, mask, masked_value], f32_ty(&[4]));
    let scalar = b.literal(TensorLiteral::f32(&[], vec![9.0]));
    let masked_tensor = b.source(SourceOp::MaskedFillTensor, &[x, mask, scalar], f32_ty(&[4]));
    let out = legalize_and_run(
        b.finish("fill", vec![filled, masked, masked_tensor]),
        &[
            CpuTensor::f32(&[4], vec![1.0, 2.0, 3.0, 4.0]),
            CpuTensor::bool(&[4], vec![false, true, true, false]),
        ],
    )?;
    assert_eq!(out[0].as_f32()?, &[2.5; 4]);
    assert_eq!(out[1].as_f32()?, &[1.0, -1.0, -1.0, 4.0]);
    assert_eq!(out[2].as_f32()?, &[1.0, 9.0, 9.0, 4.0]);
    Ok(())
}

fn arange_graph(
    start: f64,
    end: f64,
    step: f64,
    out: tensor_legalize::TensorType,
    ints: bool,
) -> tensor_legalize::Function {
    let mut b = FunctionBuilder::new();
    let [start, end, step] = if ints {
        [b.int(start as i64), b.int(end as i64), b.int(step as i64)]
    } else {
        [b.float(start), b.float(end), b.float(step)]
    };
    let [dtype, layout, device, pin] = factory_options(&mut b);
    let y = b.source(
        SourceOp::ArangeStartStep,
        &[start, end, step, dtype, layout, device, pin],
        out,
    );
    b.finish("arange", vec![y])
}

#[test]
fn arange_folds_to_a_constant() -> Result<()> {
    let ints = legalize_and_run(arange_graph(0.0, 10.0, 3.0, ty(DType::Si64, &[4]), true), &[])?;
    assert_eq!(ints[0].as_int()?, &[0, 3, 6, 9]);

    let floats = legalize_and_run(arange_graph(0.0, 1.0, 0.25, f32_ty(&[4]), false), &[])?;
    assert_close(floats[0].as_f32()?, &[0.0, 0.25, 0.5, 0.75], 1e-7);
    Ok(())
}

#[test]
fn arange_with_zero_step_is_rejected() {
    let err = rule_error(arange_graph(0.0, 4.0, 0.0, ty(DType::Si64, &[4]), true));
    assert!(matches!(err, LegalizeError::InvalidOperand(_)), "{err}");
}

#[test]
fn num_to_tensor_makes_a_rank_zero_constant() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let a = b.int(7);
    let y = b.source(SourceOp::NumToTensor, &[a], ty(DType::Si64, &[]));
    let out = legalize_and_run(b.finish("num_to_tensor", vec![y]), &[])?;
    assert!(out[0].dims.is_empty());
    assert_eq!(out[0].as_int()?, &[7]);
    Ok(())
}

fn dropout_graph(train: bool) -> tensor_legalize::Function {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[3]));
    let p = b.float(0.1);
    let train = b.bool(train);
    let y = b.source(SourceOp::Dropout, &[x, p, train], f32_ty(&[3]));
    b.finish("dropout", vec![y])
}

#[test]
fn inference_dropout_is_the_identity() -> Result<()> {
    let func = legalize(dropout_graph(false))?;
    assert_eq!(func.result_ids, func.parameter_ids);
    Ok(())
}

#[test]
fn training_dropout_is_rejected() {
    let err = rule_error(dropout_graph(true));
    assert!(matches!(err, LegalizeError::UnsupportedOption(_)), "{err}");
}

#[test]
fn to_dtype_truncates_floats() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[3]));
    let dtype = b.int(3);
    let non_blocking = b.bool(false);
    let copy = b.bool(false);
    let memory_format = b.none();
    let y = b.source(
        SourceOp::ToDtype,
        &[x, dtype, non_blocking, copy, memory_format],
        ty(DType::Si32, &[3]),
    );
    let out = legalize_and_run(
        b.finish("to_dtype", vec![y]),
        &[CpuTensor::f32(&[3], vec![1.7, -1.7, 2.0])],
    )?;
    assert_eq!(out[0].dtype, DType::Si32);
    assert_eq!(out[0].as_int()?, &[1, -1, 2]);
    Ok(())
}

#[test_case(None, true; "default format")]
#[test_case(Some(0), true; "contiguous format")]
#[test_case(Some(1), false; "preserve format")]
fn clone_accepts_only_contiguous_memory(format: Option<i64>, accepted: bool) {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[3]));
    let format = match format {
        Some(value) => b.int(value),
        None => b.none(),
    };
    let y = b.source(SourceOp::Clone, &[x, format], f32_ty(&[3]));
    let func = b.finish("clone", vec![y]);
    if accepted {
        legalize(func).expect("clone legalizes");
    } else {
        let err = rule_error(func);
        assert!(matches!(err, LegalizeError::UnsupportedOption(_)), "{err}");
    }
}

#[test]
fn copy_converts_the_source_to_the_destination_type() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let dst = b.add_parameter(f32_ty(&[2, 2]));
    let src = b.add_parameter(ty(DType::Si32, &[2, 2]));
    let non_blocking = b.bool(false);
    let y = b.source(SourceOp::Copy, &[dst, src, non_blocking], f32_ty(&[2, 2]));
    let out = legalize_and_run(
        b.finish("copy", vec![y]),
        &[
            CpuTensor::f32(&[2, 2], vec![0.0; 4]),
            CpuTensor::int(DType::Si32, &[2, 2], vec![1, -2, 3, 4]),
        ],
    )?;
    assert_eq!(out[0].as_f32()?, &[1.0, -2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn tensor_literals_become_target_constants() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2]));
    let bias = b.literal(TensorLiteral::f32(&[2], vec![1.0, 2.0]));
    let alpha = b.int(1);
    let y = b.source(SourceOp::AddTensor, &[x, bias, alpha], f32_ty(&[2]));
    let func = legalize(b.finish("literal", vec![y]))?;

    let source_literals =
        func.count_ops(|op| matches!(op, Operation::Constant(ConstantValue::Tensor(_))));
    let target_consts =
        func.count_ops(|op| matches!(op, Operation::Target(TargetOp::Const(_))));
    assert_eq!(source_literals, 0);
    assert!(target_consts >= 1);

    let out =
        tensor_legalize_ref_cpu::run_function(&func, &[CpuTensor::f32(&[2], vec![0.5, 0.5])])?;
    assert_eq!(out[0].as_f32()?, &[1.5, 2.5]);
    Ok(())
}
