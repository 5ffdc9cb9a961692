mod legalize_support;

use anyhow::Result;
use legalize_support::{f32_ty, init_tracing, ty};
use tensor_legalize::conversion::{ConversionStage, OperationKind};
use tensor_legalize::ir::{Operation, ValueType};
use tensor_legalize::{
    check_function_legality, legalize_function, ConversionFailure, DType, Dimension, Function,
    FunctionBuilder, LegalitySpec, LegalizeConfig, LegalizeError, Shape, SourceOp, TensorType,
};

/// `log` over integers and tanh-approximated `gelu` both fail; `relu` between them
/// converts.
fn two_failures() -> Function {
    let mut b = FunctionBuilder::new();
    let ints = b.add_parameter(ty(DType::Si32, &[3]));
    let floats = b.add_parameter(f32_ty(&[3]));
    let log = b.source(SourceOp::Log, &[ints], ty(DType::Si32, &[3]));
    let relu = b.source(SourceOp::Relu, &[floats], f32_ty(&[3]));
    let approximate = b.str("tanh");
    let gelu = b.source(SourceOp::Gelu, &[floats, approximate], f32_ty(&[3]));
    b.finish("two_failures", vec![log, relu, gelu])
}

fn source_ops(func: &Function) -> usize {
    func.count_ops(|op| matches!(op, Operation::Source(_)))
}

/// `permute(permute(x, [1, 0]), [1, 0])`
fn permute_round_trip() -> Function {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3]));
    let swap = b.int_list(&[1, 0]);
    let t = b.source(SourceOp::Permute, &[x, swap], f32_ty(&[3, 2]));
    let swap_back = b.int_list(&[1, 0]);
    let y = b.source(SourceOp::Permute, &[t, swap_back], f32_ty(&[2, 3]));
    b.finish("permute_round_trip", vec![y])
}

#[test]
fn legality_check_reports_unconverted_source_ops() {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[4]));
    let y = b.source(SourceOp::Relu, &[x], f32_ty(&[4]));
    let func = b.finish("unconverted", vec![y]);

    let report = check_function_legality(&func, &LegalitySpec::target())
        .expect_err("relu is not a target op");
    assert_eq!(report.diagnostics.len(), 1);
    let diagnostic = &report.diagnostics[0];
    assert_eq!(diagnostic.stage, ConversionStage::Verify);
    assert_eq!(diagnostic.function.as_deref(), Some("unconverted"));
    assert_eq!(diagnostic.instruction_index, Some(0));
    assert!(diagnostic.message.contains(SourceOp::Relu.name()));

    check_function_legality(&func, &LegalitySpec::default()).expect("default spec allows all");
}

#[test]
fn legality_check_enforces_dtypes_and_static_shapes() {
    let mut b = FunctionBuilder::new();
    let dynamic = TensorType::new(
        DType::F32,
        Shape::new(vec![Dimension::Dynamic, Dimension::Static(3)]),
    );
    let x = b.add_parameter(dynamic);
    let i = b.add_parameter(ty(DType::Si32, &[3]));
    let func = b.finish("signature", vec![x, i]);

    let spec = LegalitySpec::target().with_dynamic_dims(false);
    let report = check_function_legality(&func, &spec).expect_err("dynamic extent");
    // Once for the parameter, once for the result.
    assert_eq!(report.diagnostics.len(), 2);
    assert!(report
        .diagnostics
        .iter()
        .all(|d| d.message.contains("dynamic")));

    let spec = LegalitySpec::target().allow_dtypes([DType::F32]);
    let report = check_function_legality(&func, &spec).expect_err("si32 is not allowed");
    assert_eq!(report.diagnostics.len(), 2);
    assert!(report.diagnostics[0].message.contains("Si32"));
}

#[test]
fn collecting_mode_reports_every_failure() {
    init_tracing();
    let mut func = two_failures();
    let config = LegalizeConfig::default().with_fail_fast(false);
    let err = legalize_function(&mut func, &config).expect_err("two rules decline");

    let errors = err.rule_errors();
    assert_eq!(errors.len(), 2);
    assert!(matches!(errors[0], LegalizeError::UnsupportedDType(_)), "{}", errors[0]);
    assert!(matches!(errors[1], LegalizeError::UnsupportedOption(_)), "{}", errors[1]);

    let diagnostics = err.diagnostics();
    assert_eq!(diagnostics.len(), 2);
    assert!(diagnostics[0].message.contains(SourceOp::Log.name()));
    assert!(diagnostics[1].message.contains(SourceOp::Gelu.name()));
    assert!(diagnostics
        .iter()
        .all(|d| d.stage == ConversionStage::Legalize && d.instruction_index.is_some()));

    match &err {
        ConversionFailure::Rule { function, failures } => {
            assert_eq!(function, "two_failures");
            assert_eq!(failures[0].op, SourceOp::Log.name());
            assert_eq!(failures[1].op, SourceOp::Gelu.name());
        }
        other => panic!("expected rule failures, got {other:?}"),
    }

    // relu was rewritten; the failing instructions stay in place.
    assert_eq!(source_ops(&func), 2);
    assert!(err.to_string().contains("and 1 more"));
}

#[test]
fn fail_fast_stops_at_the_first_failure() {
    init_tracing();
    let mut func = two_failures();
    let err = legalize_function(&mut func, &LegalizeConfig::default())
        .expect_err("log declines first");
    assert_eq!(err.rule_errors().len(), 1);
    assert_eq!(source_ops(&func), 3);
}

#[test]
fn stats_count_conversions_and_canonicalization() -> Result<()> {
    init_tracing();
    let mut func = permute_round_trip();
    let stats = legalize_function(&mut func, &LegalizeConfig::default())?;
    assert_eq!(stats.converted, 2);
    assert!(stats.emitted >= 2);
    assert!(stats.canonicalized >= 1);
    assert!(stats.dce_removed >= 2);
    assert!(func.body.is_empty());
    assert_eq!(func.result_ids, func.parameter_ids);
    Ok(())
}

#[test]
fn canonicalization_can_be_disabled() -> Result<()> {
    init_tracing();
    let mut func = permute_round_trip();
    let config = LegalizeConfig::default().with_canonicalize(false);
    let stats = legalize_function(&mut func, &config)?;
    assert_eq!(stats.canonicalized, 0);
    let transposes = func.count_ops(|op| OperationKind::from_op(op) == OperationKind::Transpose);
    assert_eq!(transposes, 2);
    Ok(())
}

#[test]
fn disabling_dce_keeps_scalar_operands() -> Result<()> {
    init_tracing();
    let mut func = permute_round_trip();
    let config = LegalizeConfig::default()
        .with_dce(false)
        .with_canonicalize(false);
    let stats = legalize_function(&mut func, &config)?;
    assert_eq!(stats.dce_removed, 0);

    let lists = func.count_ops(|op| matches!(op, Operation::ListConstruct));
    assert_eq!(lists, 2);
    assert!(check_function_legality(&func, &LegalitySpec::target()).is_err());
    check_function_legality(&func, &LegalitySpec::target().with_scalar_constants())
        .expect("scalar operands are tolerated");
    Ok(())
}

#[test]
fn config_defaults_and_builders() {
    let config = LegalizeConfig::default();
    assert_eq!(config.max_iterations, usize::MAX);
    assert!(config.enable_dce);
    assert!(config.canonicalize);
    assert!(config.fail_fast);

    let tuned = config
        .clone()
        .with_dce(false)
        .with_canonicalize(false)
        .with_fail_fast(false);
    assert!(!tuned.enable_dce && !tuned.canonicalize && !tuned.fail_fast);
    assert_eq!(tuned.max_iterations, config.max_iterations);
}

#[test]
fn config_deserializes_partial_documents() -> Result<()> {
    let config: LegalizeConfig = serde_json::from_str(r#"{"fail_fast": false}"#)?;
    assert_eq!(config, LegalizeConfig::default().with_fail_fast(false));

    let config: LegalizeConfig = serde_json::from_str(r#"{"max_iterations": 8, "enable_dce": false}"#)?;
    assert_eq!(config.max_iterations, 8);
    assert!(!config.enable_dce);
    assert!(config.canonicalize);
    Ok(())
}

#[test]
fn functions_round_trip_through_json() -> Result<()> {
    let func = two_failures();
    let text = func.to_json_string()?;
    let decoded = Function::from_json_str(&text)?;
    assert_eq!(decoded, func);
    assert!(Function::from_json_str("{\"name\": 3}").is_err());
    Ok(())
}

#[test]
fn display_prints_the_function_header() {
    let func = two_failures();
    let printed = func.to_string();
    assert!(printed.starts_with("func @two_failures"), "{printed}");
}

#[test]
fn result_types_are_recorded_from_the_builder() {
    let func = permute_round_trip();
    assert_eq!(func.results, vec![ValueType::Tensor(f32_ty(&[2, 3]))]);
    assert_eq!(func.parameters.len(), 1);
}
