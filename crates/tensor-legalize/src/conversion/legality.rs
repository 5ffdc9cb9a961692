use std::collections::HashSet;

use crate::conversion::{ConversionDiagnostic, ConversionStage};
use crate::ir::{ConstantValue, DType, Function, Operation, ValueType};
use crate::target::TargetOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    ScalarConstant,
    TensorLiteral,
    ListConstruct,
    Source,
    Const,
    Unary,
    Binary,
    Compare,
    Select,
    Clamp,
    Cast,
    Rescale,
    Reshape,
    Transpose,
    Slice,
    Concat,
    Reduce,
    ArgMax,
    MatMul,
    Conv2d,
    MaxPool2d,
    AvgPool2d,
    Gather,
}

impl OperationKind {
    pub const TARGET: &'static [OperationKind] = &[
        OperationKind::Const,
        OperationKind::Unary,
        OperationKind::Binary,
        OperationKind::Compare,
        OperationKind::Select,
        OperationKind::Clamp,
        OperationKind::Cast,
        OperationKind::Rescale,
        OperationKind::Reshape,
        OperationKind::Transpose,
        OperationKind::Slice,
        OperationKind::Concat,
        OperationKind::Reduce,
        OperationKind::ArgMax,
        OperationKind::MatMul,
        OperationKind::Conv2d,
        OperationKind::MaxPool2d,
        OperationKind::AvgPool2d,
        OperationKind::Gather,
    ];

    pub fn from_op(op: &Operation) -> Self {
        match op {
            Operation::Constant(ConstantValue::Tensor(_)) => OperationKind::TensorLiteral,
            Operation::Constant(_) => OperationKind::ScalarConstant,
            Operation::ListConstruct => OperationKind::ListConstruct,
            Operation::Source(_) => OperationKind::Source,
            Operation::Target(op) => match op {
                TargetOp::Const(_) => OperationKind::Const,
                TargetOp::Unary(_) => OperationKind::Unary,
                TargetOp::Binary(_) => OperationKind::Binary,
                TargetOp::Compare(_) => OperationKind::Compare,
                TargetOp::Select => OperationKind::Select,
                TargetOp::Clamp(_) => OperationKind::Clamp,
                TargetOp::Cast(_) => OperationKind::Cast,
                TargetOp::Rescale(_) => OperationKind::Rescale,
                TargetOp::Reshape(_) => OperationKind::Reshape,
                TargetOp::Transpose(_) => OperationKind::Transpose,
                TargetOp::Slice(_) => OperationKind::Slice,
                TargetOp::Concat(_) => OperationKind::Concat,
                TargetOp::Reduce(_) => OperationKind::Reduce,
                TargetOp::ArgMax(_) => OperationKind::ArgMax,
                TargetOp::MatMul(_) => OperationKind::MatMul,
                TargetOp::Conv2d(_) => OperationKind::Conv2d,
                TargetOp::MaxPool2d(_) => OperationKind::MaxPool2d,
                TargetOp::AvgPool2d(_) => OperationKind::AvgPool2d,
                TargetOp::Gather => OperationKind::Gather,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct LegalitySpec {
    pub allowed_ops: Option<HashSet<OperationKind>>,
    pub allow_dynamic_dims: bool,
    pub allowed_dtypes: Option<HashSet<DType>>,
}

impl Default for LegalitySpec {
    fn default() -> Self {
        Self {
            allowed_ops: None,
            allow_dynamic_dims: true,
            allowed_dtypes: None,
        }
    }
}

impl LegalitySpec {
    /// Only target instructions are legal.
    pub fn target() -> Self {
        Self::default().allow_ops(OperationKind::TARGET.iter().copied())
    }

    pub fn allow_ops(mut self, ops: impl IntoIterator<Item = OperationKind>) -> Self {
        self.allowed_ops = Some(ops.into_iter().collect());
        self
    }

    /// Additionally accepts scalar constants and lists, which stay behind as rule
    /// operands until dead-code elimination runs.
    pub fn with_scalar_constants(mut self) -> Self {
        let allowed = self.allowed_ops.get_or_insert_with(HashSet::new);
        allowed.insert(OperationKind::ScalarConstant);
        allowed.insert(OperationKind::ListConstruct);
        self
    }

    pub fn allow_dtypes(mut self, dtypes: impl IntoIterator<Item = DType>) -> Self {
        self.allowed_dtypes = Some(dtypes.into_iter().collect());
        self
    }

    pub fn with_dynamic_dims(mut self, allowed: bool) -> Self {
        self.allow_dynamic_dims = allowed;
        self
    }

    pub fn is_legal(&self, op: &Operation) -> bool {
        match &self.allowed_ops {
            Some(allowed) => allowed.contains(&OperationKind::from_op(op)),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LegalityReport {
    pub diagnostics: Vec<ConversionDiagnostic>,
}

impl LegalityReport {
    pub fn is_ok(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

pub fn check_function_legality(
    function: &Function,
    spec: &LegalitySpec,
) -> Result<(), LegalityReport> {
    let mut report = LegalityReport::default();

    for ty in function.parameters.iter().chain(function.results.iter()) {
        check_value_type(ty, spec, &mut report, &function.name, None);
    }
    for (idx, inst) in function.body.iter().enumerate() {
        if !spec.is_legal(&inst.op) {
            let message = match &inst.op {
                Operation::Source(op) => format!("operation {} is not allowed", op.name()),
                op => format!("operation {:?} is not allowed", OperationKind::from_op(op)),
            };
            report.diagnostics.push(ConversionDiagnostic::new(
                ConversionStage::Verify,
                Some(function.name.clone()),
                Some(idx),
                message,
            ));
        }
        check_value_type(&inst.output, spec, &mut report, &function.name, Some(idx));
    }

    if report.is_ok() {
        Ok(())
    } else {
        Err(report)
    }
}

fn check_value_type(
    ty: &ValueType,
    spec: &LegalitySpec,
    report: &mut LegalityReport,
    function: &str,
    inst_index: Option<usize>,
) {
    match ty {
        ValueType::Tensor(tensor) => {
            if !spec.allow_dynamic_dims && !tensor.shape.is_static() {
                report.diagnostics.push(ConversionDiagnostic::new(
                    ConversionStage::Verify,
                    Some(function.to_string()),
                    inst_index,
                    "dynamic dimensions are not allowed",
                ));
            }
            if let Some(allowed) = &spec.allowed_dtypes {
                if !allowed.contains(&tensor.dtype) {
                    report.diagnostics.push(ConversionDiagnostic::new(
                        ConversionStage::Verify,
                        Some(function.to_string()),
                        inst_index,
                        format!("dtype {:?} is not allowed", tensor.dtype),
                    ));
                }
            }
        }
        ValueType::Tuple(values) => {
            for value in values {
                check_value_type(value, spec, report, function, inst_index);
            }
        }
        _ => {}
    }
}
