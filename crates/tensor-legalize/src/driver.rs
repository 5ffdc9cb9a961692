use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    index::{FunctionIndexError, InstId},
    ir::Function,
    pattern::FrozenPatternSet,
    rewriter::ProgramRewriter,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreedyConfig {
    pub max_iterations: usize,
    pub enable_dce: bool,
}

impl Default for GreedyConfig {
    fn default() -> Self {
        Self {
            max_iterations: usize::MAX,
            enable_dce: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GreedyRewriteStats {
    pub iterations: usize,
    pub applied: usize,
    pub dce_removed: usize,
}

/// Applies `patterns` until no pattern fires or the iteration budget runs out.
///
/// A pattern that failed on an instruction is not retried until that instruction's
/// version changes.
pub fn apply_patterns_and_fold_greedily(
    func: &mut Function,
    patterns: &FrozenPatternSet,
    cfg: &GreedyConfig,
) -> Result<GreedyRewriteStats, FunctionIndexError> {
    if patterns.is_empty() {
        return Ok(GreedyRewriteStats::default());
    }

    let mut rewriter = ProgramRewriter::new(func)?;
    let mut worklist = VecDeque::new();
    seed_worklist(&rewriter, &mut worklist);

    let mut failure_cache: HashMap<(usize, InstId), u32> = HashMap::new();
    let mut stats = GreedyRewriteStats::default();

    while let Some(inst) = worklist.pop_front() {
        if stats.iterations >= cfg.max_iterations {
            break;
        }
        if !rewriter.contains(inst) {
            continue;
        }

        let version = rewriter.version(inst).unwrap_or(0);
        let op_snapshot = rewriter.op(inst).clone();

        for (idx, pattern) in patterns.matching(&op_snapshot) {
            if failure_cache.get(&(idx, inst)).copied() == Some(version) {
                continue;
            }

            if pattern.match_and_rewrite(inst, &mut rewriter) {
                trace!(pattern = idx, ?inst, "pattern applied");
                stats.applied += 1;
                stats.iterations = stats.iterations.saturating_add(1);
                clear_failure_entries(inst, &mut failure_cache);
                seed_worklist(&rewriter, &mut worklist);
                break;
            }
            failure_cache.insert((idx, inst), version);
        }
    }

    if cfg.enable_dce {
        stats.dce_removed = run_dce(&mut rewriter)?;
    }

    Ok(stats)
}

fn seed_worklist(rewriter: &ProgramRewriter, worklist: &mut VecDeque<InstId>) {
    worklist.clear();
    worklist.extend(rewriter.insts_in_order());
}

fn clear_failure_entries(inst: InstId, cache: &mut HashMap<(usize, InstId), u32>) {
    cache.retain(|(_, cached_inst), _| *cached_inst != inst);
}

/// Erases every instruction whose value is neither read nor returned, to a fixed point.
pub fn run_dce(rewriter: &mut ProgramRewriter) -> Result<usize, FunctionIndexError> {
    let mut removed_total = 0;
    loop {
        let mut removed_in_pass = 0;
        for inst in rewriter.insts_in_order().into_iter().rev() {
            if !rewriter.contains(inst) {
                continue;
            }
            let value = rewriter.value_of(inst);
            if !rewriter.has_uses(value) {
                rewriter.erase_inst(inst)?;
                removed_in_pass += 1;
            }
        }
        if removed_in_pass == 0 {
            break;
        }
        removed_total += removed_in_pass;
    }
    Ok(removed_total)
}
