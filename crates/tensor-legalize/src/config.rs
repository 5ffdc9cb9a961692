use serde::{Deserialize, Serialize};

use crate::driver::GreedyConfig;
use crate::env;

/// Knobs for [`legalize_function`](crate::conversion::legalize_function).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegalizeConfig {
    /// Upper bound on canonicalization rewrites.
    pub max_iterations: usize,
    /// Erase dead scalar constants, lists and target ops after conversion.
    pub enable_dce: bool,
    /// Run the target-graph canonicalization pass after conversion.
    pub canonicalize: bool,
    /// Stop at the first rule failure instead of collecting all of them.
    pub fail_fast: bool,
}

impl Default for LegalizeConfig {
    fn default() -> Self {
        Self {
            max_iterations: usize::MAX,
            enable_dce: true,
            canonicalize: true,
            fail_fast: true,
        }
    }
}

impl LegalizeConfig {
    /// Defaults overlaid with the `LEGALIZE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(env::overrides())
    }

    fn with_overrides(mut self, overrides: env::Overrides) -> Self {
        if let Some(max_iterations) = overrides.max_iterations {
            self.max_iterations = max_iterations;
        }
        if let Some(disabled) = overrides.disable_dce {
            self.enable_dce = !disabled;
        }
        if let Some(canonicalize) = overrides.canonicalize {
            self.canonicalize = canonicalize;
        }
        if let Some(fail_fast) = overrides.fail_fast {
            self.fail_fast = fail_fast;
        }
        self
    }

    pub fn with_dce(mut self, enabled: bool) -> Self {
        self.enable_dce = enabled;
        self
    }

    pub fn with_canonicalize(mut self, enabled: bool) -> Self {
        self.canonicalize = enabled;
        self
    }

    pub fn with_fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    pub(crate) fn greedy(&self) -> GreedyConfig {
        GreedyConfig {
            max_iterations: self.max_iterations,
            enable_dce: self.enable_dce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LegalizeConfig;
    use crate::env::Overrides;

    #[test]
    fn environment_overrides_replace_defaults() {
        let vars = [
            ("LEGALIZE_MAX_ITERATIONS", "16"),
            ("LEGALIZE_DISABLE_DCE", "yes"),
            ("LEGALIZE_FAIL_FAST", "0"),
        ];
        let overrides = Overrides::from_lookup(|name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        });
        let config = LegalizeConfig::default().with_overrides(overrides);
        assert_eq!(config.max_iterations, 16);
        assert!(!config.enable_dce);
        assert!(config.canonicalize);
        assert!(!config.fail_fast);
    }

    #[test]
    fn empty_overlay_keeps_defaults() {
        let config = LegalizeConfig::default().with_overrides(Overrides::default());
        assert_eq!(config, LegalizeConfig::default());
    }
}
