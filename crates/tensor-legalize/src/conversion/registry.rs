use std::collections::HashMap;
use std::sync::OnceLock;

use thiserror::Error;

use crate::rules::{Rule, RULES};
use crate::source::SourceOp;

static REGISTRY: OnceLock<HashMap<SourceOp, Rule>> = OnceLock::new();

fn registry() -> &'static HashMap<SourceOp, Rule> {
    REGISTRY.get_or_init(|| RULES.iter().copied().collect())
}

/// Returns the rule lowering `op`.
pub fn lookup(op: SourceOp) -> Option<Rule> {
    registry().get(&op).copied()
}

pub fn registered_ops() -> Vec<SourceOp> {
    let mut ops: Vec<SourceOp> = registry().keys().copied().collect();
    ops.sort();
    ops
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rule table is inconsistent: missing {missing:?}, duplicated {duplicated:?}")]
pub struct RegistryError {
    pub missing: Vec<SourceOp>,
    pub duplicated: Vec<SourceOp>,
}

/// Checks that every source operator has exactly one rule.
pub fn validate_registry() -> Result<(), RegistryError> {
    let mut counts: HashMap<SourceOp, usize> = HashMap::new();
    for (op, _) in RULES {
        *counts.entry(*op).or_default() += 1;
    }
    let missing: Vec<SourceOp> = SourceOp::ALL
        .iter()
        .copied()
        .filter(|op| !counts.contains_key(op))
        .collect();
    let mut duplicated: Vec<SourceOp> = counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(op, _)| op)
        .collect();
    duplicated.sort();
    if missing.is_empty() && duplicated.is_empty() {
        Ok(())
    } else {
        Err(RegistryError {
            missing,
            duplicated,
        })
    }
}
