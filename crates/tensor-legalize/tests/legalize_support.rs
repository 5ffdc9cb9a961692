#![allow(dead_code)]

use anyhow::Result;
use tensor_legalize::ir::{Operand, Operation, ValueType};
use tensor_legalize::{
    check_function_legality, legalize_function, ConversionFailure, DType, Function,
    FunctionBuilder, LegalitySpec, LegalizeConfig, LegalizeError, Shape, SourceOp, TensorType,
    ValueId,
};
use tensor_legalize_ref_cpu::{run_function, CpuTensor};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn f32_ty(dims: &[usize]) -> TensorType {
    TensorType::from_static(DType::F32, dims)
}

pub fn ty(dtype: DType, dims: &[usize]) -> TensorType {
    TensorType::from_static(dtype, dims)
}

pub fn tuple(types: Vec<TensorType>) -> ValueType {
    ValueType::Tuple(types.into_iter().map(ValueType::Tensor).collect())
}

/// Reads projection `index` of a multi-result value through a `contiguous`, which
/// legalizes to its operand.
pub fn project(b: &mut FunctionBuilder, tuple: ValueId, index: usize, ty: TensorType) -> ValueId {
    b.emit(
        Operation::Source(SourceOp::Contiguous),
        vec![Operand::TupleElement { tuple, index }],
        ValueType::Tensor(ty),
    )
}

/// Defaults, plus any `LEGALIZE_*` overrides set for the test run.
pub fn config() -> LegalizeConfig {
    LegalizeConfig::from_env()
}

/// Legalizes `func` and checks that only target operations remain.
pub fn legalize(mut func: Function) -> Result<Function> {
    init_tracing();
    legalize_function(&mut func, &config())?;
    if let Err(report) = check_function_legality(&func, &LegalitySpec::target()) {
        anyhow::bail!("illegal operations remain: {:?}", report.diagnostics);
    }
    Ok(func)
}

pub fn legalize_and_run(func: Function, inputs: &[CpuTensor]) -> Result<Vec<CpuTensor>> {
    let func = legalize(func)?;
    Ok(run_function(&func, inputs)?)
}

/// First rule error reported while legalizing `func`.
pub fn rule_error(mut func: Function) -> LegalizeError {
    init_tracing();
    match legalize_function(&mut func, &config()) {
        Err(ConversionFailure::Rule { mut failures, .. }) => failures.remove(0).error,
        other => panic!("expected a rule failure, got {other:?}"),
    }
}

/// `count` values cycling through a small signed range.
pub fn ramp(count: usize) -> Vec<f32> {
    (0..count).map(|i| ((i * 7) % 11) as f32 * 0.25 - 1.0).collect()
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {i}: got {a}, expected {e} (tolerance {tolerance})"
        );
    }
}

pub fn result_shape(func: &Function, index: usize) -> Shape {
    match &func.results[index] {
        ValueType::Tensor(ty) => ty.shape.clone(),
        other => panic!("result {index} is not a tensor: {other:?}"),
    }
}
