use std::env;
use std::sync::OnceLock;

/// `LEGALIZE_*` settings found in the environment. Unset or blank variables stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Overrides {
    pub max_iterations: Option<usize>,
    pub disable_dce: Option<bool>,
    pub canonicalize: Option<bool>,
    pub fail_fast: Option<bool>,
}

static OVERRIDES: OnceLock<Overrides> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

impl Overrides {
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let read_bool = |name: &str| read(name).map(|value| parse_bool(&value));
        Self {
            max_iterations: read("LEGALIZE_MAX_ITERATIONS")
                .and_then(|value| value.trim().parse().ok()),
            disable_dce: read_bool("LEGALIZE_DISABLE_DCE"),
            canonicalize: read_bool("LEGALIZE_CANONICALIZE"),
            fail_fast: read_bool("LEGALIZE_FAIL_FAST"),
        }
    }
}

/// Process environment, read once.
pub(crate) fn overrides() -> Overrides {
    *OVERRIDES.get_or_init(|| Overrides::from_lookup(|name| env::var(name).ok()))
}

#[cfg(test)]
mod tests {
    use super::{parse_bool, Overrides};

    #[test]
    fn parse_bool_accepts_common_truthy_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }

    #[test]
    fn lookup_skips_blank_and_malformed_values() {
        let overrides = Overrides::from_lookup(|name| match name {
            "LEGALIZE_MAX_ITERATIONS" => Some("many".to_string()),
            "LEGALIZE_CANONICALIZE" => Some("  ".to_string()),
            "LEGALIZE_FAIL_FAST" => Some("off".to_string()),
            _ => None,
        });
        assert_eq!(
            overrides,
            Overrides {
                fail_fast: Some(false),
                ..Overrides::default()
            }
        );
    }
}
