//! Source-to-target legalization.
//!
//! [`legalize_function`] walks a function in program order and hands every source
//! operation to its rule. Rules stage replacement instructions in a [`RuleContext`];
//! the driver commits them only when the rule succeeds and the replacement types agree
//! with the declared result types.

mod context;
mod legality;
mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn};

use crate::config::LegalizeConfig;
use crate::driver::run_dce;
use crate::error::{LegalizeError, LegalizeResult};
use crate::index::{FunctionIndexError, InstId};
use crate::ir::{ConstantValue, Function, Instruction, Operation, ValueId, ValueType};
use crate::passes::{CanonicalizePass, FunctionPass};
use crate::rewriter::ProgramRewriter;
use crate::rules::Rule;
use crate::shape_helpers::broadcast_shapes;
use crate::target::TargetOp;

pub use context::{reshape_spec, RuleContext};
pub use legality::{check_function_legality, LegalityReport, LegalitySpec, OperationKind};
pub use registry::{lookup, registered_ops, validate_registry, RegistryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionStage {
    Legalize,
    Cleanup,
    Canonicalize,
    Verify,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionDiagnostic {
    pub stage: ConversionStage,
    pub function: Option<String>,
    pub instruction_index: Option<usize>,
    pub message: String,
}

impl ConversionDiagnostic {
    pub fn new(
        stage: ConversionStage,
        function: Option<String>,
        instruction_index: Option<usize>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            function,
            instruction_index,
            message: message.into(),
        }
    }
}

/// A rule that declined to rewrite one instruction.
#[derive(Debug)]
pub struct RuleFailure {
    /// Position of the instruction in the body at the time it was visited.
    pub position: usize,
    pub value: ValueId,
    pub op: &'static str,
    pub error: LegalizeError,
}

impl fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} %{} = {}: {}",
            self.position, self.value.0, self.op, self.error
        )
    }
}

fn summarize_failures(failures: &[RuleFailure]) -> String {
    match failures {
        [] => "no failures recorded".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{first} (and {} more)", rest.len()),
    }
}

#[derive(Debug, Error)]
pub enum ConversionFailure {
    #[error("function @{function}: {source}")]
    Index {
        function: String,
        #[source]
        source: FunctionIndexError,
    },
    #[error("function @{function}: {}", summarize_failures(.failures))]
    Rule {
        function: String,
        failures: Vec<RuleFailure>,
    },
    #[error("function @{function}: {} illegal operation(s) remain", .diagnostics.len())]
    Illegal {
        function: String,
        diagnostics: Vec<ConversionDiagnostic>,
    },
}

impl ConversionFailure {
    pub fn diagnostics(&self) -> Vec<ConversionDiagnostic> {
        match self {
            ConversionFailure::Index { function, source } => vec![ConversionDiagnostic::new(
                ConversionStage::Legalize,
                Some(function.clone()),
                None,
                source.to_string(),
            )],
            ConversionFailure::Rule { function, failures } => failures
                .iter()
                .map(|failure| {
                    ConversionDiagnostic::new(
                        ConversionStage::Legalize,
                        Some(function.clone()),
                        Some(failure.position),
                        failure.to_string(),
                    )
                })
                .collect(),
            ConversionFailure::Illegal { diagnostics, .. } => diagnostics.clone(),
        }
    }

    /// Rule errors in visit order; empty for other failure kinds.
    pub fn rule_errors(&self) -> Vec<&LegalizeError> {
        match self {
            ConversionFailure::Rule { failures, .. } => {
                failures.iter().map(|failure| &failure.error).collect()
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConversionStats {
    /// Source operations and tensor literals rewritten.
    pub converted: usize,
    /// Target instructions emitted by rules.
    pub emitted: usize,
    /// Instructions removed by dead-code elimination.
    pub dce_removed: usize,
    /// Canonicalization rewrites applied.
    pub canonicalized: usize,
}

/// Rewrites every source operation in `func` into target instructions.
///
/// On a rule failure the function keeps every rewrite that already succeeded and the
/// failing instruction stays in place.
///
/// # Panics
///
/// Panics if the rule table does not cover every source operator exactly once.
pub fn legalize_function(
    func: &mut Function,
    config: &LegalizeConfig,
) -> Result<ConversionStats, ConversionFailure> {
    let span = info_span!("legalize", function = %func.name);
    let _guard = span.enter();

    if let Err(err) = validate_registry() {
        panic!("{err}");
    }

    let name = func.name.clone();
    let index_failure = |source| ConversionFailure::Index {
        function: name.clone(),
        source,
    };
    let mut stats = ConversionStats::default();
    let mut failures = Vec::new();

    {
        let mut rewriter = ProgramRewriter::new(func).map_err(index_failure)?;
        for inst in rewriter.insts_in_order() {
            if !rewriter.contains(inst) {
                continue;
            }
            let source = match rewriter.op(inst) {
                Operation::Source(op) => Some(*op),
                Operation::Constant(ConstantValue::Tensor(_)) => None,
                _ => continue,
            };
            let (op_name, outcome) = match source {
                Some(op) => {
                    let rule = lookup(op).unwrap_or_else(|| panic!("no rule for {op}"));
                    (op.name(), apply_rule(&mut rewriter, inst, rule))
                }
                None => ("literal", lower_tensor_literal(&mut rewriter, inst)),
            };
            match outcome {
                Ok(emitted) => {
                    debug!(op = op_name, ?inst, emitted, "rule applied");
                    stats.converted += 1;
                    stats.emitted += emitted;
                }
                Err((position, value, error)) => {
                    warn!(op = op_name, position, %error, "rule declined");
                    failures.push(RuleFailure {
                        position,
                        value,
                        op: op_name,
                        error,
                    });
                    if config.fail_fast {
                        break;
                    }
                }
            }
        }

        if failures.is_empty() && config.enable_dce {
            stats.dce_removed = run_dce(&mut rewriter).map_err(index_failure)?;
        }
    }

    if !failures.is_empty() {
        return Err(ConversionFailure::Rule {
            function: name.clone(),
            failures,
        });
    }

    if config.canonicalize {
        let result = CanonicalizePass::new(config.greedy())
            .run(func)
            .map_err(index_failure)?;
        stats.canonicalized = result.rewrites_applied;
        stats.dce_removed += result.erased_insts;
    }

    let spec = if config.enable_dce {
        LegalitySpec::target()
    } else {
        LegalitySpec::target().with_scalar_constants()
    };
    check_function_legality(func, &spec).map_err(|report| ConversionFailure::Illegal {
        function: name.clone(),
        diagnostics: report.diagnostics,
    })?;
    Ok(stats)
}

type Outcome = Result<usize, (usize, ValueId, LegalizeError)>;

fn apply_rule(rewriter: &mut ProgramRewriter, inst: InstId, rule: Rule) -> Outcome {
    let position = rewriter.position(inst).unwrap_or_default();
    let value = rewriter.value_of(inst);
    let staged = {
        let mut ctx = RuleContext::new(rewriter, inst);
        match rule(&mut ctx) {
            Ok(replacements) => match check_replacements(&ctx, &replacements) {
                Ok(()) => Ok((ctx.into_staged(), replacements)),
                Err(error) => Err(error),
            },
            Err(error) => Err(error),
        }
    };
    let (instructions, replacements) = staged.map_err(|error| (position, value, error))?;
    let emitted = instructions.len();
    rewriter
        .replace_op(inst, instructions, &replacements)
        .map_err(|error| (position, value, error.into()))?;
    Ok(emitted)
}

fn lower_tensor_literal(rewriter: &mut ProgramRewriter, inst: InstId) -> Outcome {
    let position = rewriter.position(inst).unwrap_or_default();
    let value = rewriter.value_of(inst);
    let Operation::Constant(ConstantValue::Tensor(literal)) = rewriter.op(inst) else {
        unreachable!("tensor literal lowering requires a literal root");
    };
    let id = rewriter.next_value_id();
    let lowered = Instruction {
        id,
        op: Operation::Target(TargetOp::Const(literal.clone())),
        operands: Vec::new(),
        output: ValueType::Tensor(literal.ty.clone()),
    };
    rewriter
        .replace_op(inst, vec![lowered], &[id])
        .map_err(|error| (position, value, error.into()))?;
    Ok(1)
}

/// Replacement values must match the declared results in dtype and rank, with extents
/// that agree wherever both sides are known.
fn check_replacements(ctx: &RuleContext, replacements: &[ValueId]) -> LegalizeResult<()> {
    let declared = ctx.result_types()?;
    if declared.len() != replacements.len() {
        return Err(LegalizeError::operand(format!(
            "{} produced {} value(s) for {} result(s)",
            ctx.op().name(),
            replacements.len(),
            declared.len()
        )));
    }
    for (value, expected) in replacements.iter().zip(declared.iter()) {
        let actual = ctx.tensor_type(*value)?;
        if actual.dtype != expected.dtype {
            return Err(LegalizeError::type_mismatch(format!(
                "{} lowered to {:?}, declared {:?}",
                ctx.op().name(),
                actual.dtype,
                expected.dtype
            )));
        }
        let broadcast_ok = ctx.allows_implicit_broadcast()
            && broadcast_shapes(&actual.shape, &expected.shape)
                .is_some_and(|shape| shape.is_compatible_with(&expected.shape));
        if !broadcast_ok && !actual.shape.is_compatible_with(&expected.shape) {
            return Err(LegalizeError::shape_mismatch(format!(
                "{} lowered to {:?}, declared {:?}",
                ctx.op().name(),
                actual.shape.dims(),
                expected.shape.dims()
            )));
        }
    }
    Ok(())
}
