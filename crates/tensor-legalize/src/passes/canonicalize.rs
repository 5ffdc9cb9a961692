use tracing::debug;

use crate::{
    driver::{apply_patterns_and_fold_greedily, GreedyConfig},
    index::{FunctionIndexError, InstId},
    ir::{Function, Operand, Operation, ValueId},
    pattern::{CastOpView, OpRewritePattern, PatternSet, ReshapeOpView, TransposeOpView},
    register_patterns_for_view,
    rewriter::ProgramRewriter,
    target::{TargetOp, TransposeSpec},
};

use super::{FunctionPass, PassResult};

/// Redirects every use of `from` to `to` and erases `root`.
fn forward(rewriter: &mut ProgramRewriter, root: InstId, from: ValueId, to: ValueId) -> bool {
    rewriter.replace_all_uses(from, to).is_ok() && rewriter.erase_inst(root).is_ok()
}

/// Single tensor operand of `value`'s defining instruction when it matches `filter`.
fn producer_input<T>(
    rewriter: &ProgramRewriter,
    value: ValueId,
    filter: impl Fn(&TargetOp) -> Option<T>,
) -> Option<(T, ValueId)> {
    let inst = rewriter.inst_of(value)?;
    let Operation::Target(op) = rewriter.op(inst) else {
        return None;
    };
    let extracted = filter(op)?;
    let [Operand::Value(base)] = rewriter.operands(inst) else {
        return None;
    };
    Some((extracted, *base))
}

/// Remove reshapes that do not change the logical shape.
pub struct EliminateIdentityReshape;

impl OpRewritePattern<ReshapeOpView> for EliminateIdentityReshape {
    fn match_and_rewrite(&self, view: ReshapeOpView, rewriter: &mut ProgramRewriter) -> bool {
        if view.input_type != view.result_type || !view.input_type.shape.is_static() {
            return false;
        }
        forward(rewriter, view.root, view.result, view.input)
    }
}

/// Fold `reshape(reshape(x))` into one reshape of `x`.
pub struct CollapseReshapeChain;

impl OpRewritePattern<ReshapeOpView> for CollapseReshapeChain {
    fn match_and_rewrite(&self, view: ReshapeOpView, rewriter: &mut ProgramRewriter) -> bool {
        let Some(((), base)) = producer_input(rewriter, view.input, |op| match op {
            TargetOp::Reshape(_) => Some(()),
            _ => None,
        }) else {
            return false;
        };
        let Ok((_, folded)) = rewriter.insert_before(
            view.root,
            Operation::Target(TargetOp::Reshape(view.spec.clone())),
            vec![Operand::Value(base)],
            view.result_type.clone().into(),
        ) else {
            return false;
        };
        forward(rewriter, view.root, view.result, folded)
    }
}

/// Remove transposes that keep axes in place.
pub struct EliminateIdentityTranspose;

impl OpRewritePattern<TransposeOpView> for EliminateIdentityTranspose {
    fn match_and_rewrite(&self, view: TransposeOpView, rewriter: &mut ProgramRewriter) -> bool {
        if !view.spec.is_identity() {
            return false;
        }
        forward(rewriter, view.root, view.result, view.input)
    }
}

/// Fold `transpose(transpose(x, p1), p2)` into `transpose(x, p1 o p2)`.
pub struct CollapseTransposeChain;

impl OpRewritePattern<TransposeOpView> for CollapseTransposeChain {
    fn match_and_rewrite(&self, view: TransposeOpView, rewriter: &mut ProgramRewriter) -> bool {
        let Some((inner, base)) = producer_input(rewriter, view.input, |op| match op {
            TargetOp::Transpose(spec) => Some(spec.perm.clone()),
            _ => None,
        }) else {
            return false;
        };
        if inner.len() != view.spec.perm.len() {
            return false;
        }
        let composed: Vec<usize> = view.spec.perm.iter().map(|&axis| inner[axis]).collect();

        if composed.iter().enumerate().all(|(i, &axis)| i == axis) {
            return forward(rewriter, view.root, view.result, base);
        }

        let Ok((_, folded)) = rewriter.insert_before(
            view.root,
            Operation::Target(TargetOp::Transpose(TransposeSpec { perm: composed })),
            vec![Operand::Value(base)],
            view.result_type.clone().into(),
        ) else {
            return false;
        };
        forward(rewriter, view.root, view.result, folded)
    }
}

/// Remove casts whose operand already has the target type.
pub struct EliminateRedundantCast;

impl OpRewritePattern<CastOpView> for EliminateRedundantCast {
    fn match_and_rewrite(&self, view: CastOpView, rewriter: &mut ProgramRewriter) -> bool {
        if view.input_type != view.result_type {
            return false;
        }
        forward(rewriter, view.root, view.result, view.input)
    }
}

/// Local simplifications of reshape, transpose and cast chains left behind by the rules.
pub struct CanonicalizePass {
    config: GreedyConfig,
}

impl CanonicalizePass {
    const NAME: &'static str = "canonicalize";

    pub fn new(config: GreedyConfig) -> Self {
        Self { config }
    }
}

impl Default for CanonicalizePass {
    fn default() -> Self {
        Self::new(GreedyConfig::default())
    }
}

impl FunctionPass for CanonicalizePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, function: &mut Function) -> Result<PassResult, FunctionIndexError> {
        let mut patterns = PatternSet::new();
        register_patterns_for_view!(
            patterns,
            ReshapeOpView,
            EliminateIdentityReshape,
            CollapseReshapeChain
        );
        register_patterns_for_view!(
            patterns,
            TransposeOpView,
            EliminateIdentityTranspose,
            CollapseTransposeChain
        );
        patterns.insert_view::<CastOpView, _>(EliminateRedundantCast);
        let frozen = patterns.freeze();
        let stats = apply_patterns_and_fold_greedily(function, &frozen, &self.config)?;
        debug!(
            pass = Self::NAME,
            applied = stats.applied,
            erased = stats.dce_removed,
            "pass finished"
        );
        Ok(PassResult {
            changed: stats.applied > 0 || stats.dce_removed > 0,
            iterations: stats.iterations,
            rewrites_applied: stats.applied,
            erased_insts: stats.dce_removed,
        })
    }
}
