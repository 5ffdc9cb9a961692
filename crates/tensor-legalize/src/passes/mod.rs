//! Function passes over legalized target graphs.

mod canonicalize;

use crate::index::FunctionIndexError;
use crate::ir::Function;

pub use canonicalize::{
    CanonicalizePass, CollapseReshapeChain, CollapseTransposeChain, EliminateIdentityReshape,
    EliminateIdentityTranspose, EliminateRedundantCast,
};

/// Result returned by a [`FunctionPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the IR.
    pub changed: bool,
    /// Number of rewrite iterations executed while applying the pass.
    pub iterations: usize,
    /// Total number of patterns applied by the pass.
    pub rewrites_applied: usize,
    /// Instructions removed by the pass (typically via DCE).
    pub erased_insts: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_insts: self.erased_insts + other.erased_insts,
        }
    }
}

pub trait FunctionPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, function: &mut Function) -> Result<PassResult, FunctionIndexError>;
}
