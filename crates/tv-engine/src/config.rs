#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::TreeError;

pub const LOWER_TRIVIAL_KEY: &str = "treevec_lower_trivial";
pub const PROMOTE_LEAVES_KEY: &str = "treevec_promote_leaves";

/// Engine switches, read from the same string option map the host passes
/// around as compile options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Evaluate kernels directly when every operand is fully trivial.
    pub lower_trivial: bool,
    /// Promote leaves to a common dtype on conversion instead of rejecting
    /// mixed dtypes.
    pub promote_leaves: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lower_trivial: true,
            promote_leaves: true,
        }
    }
}

fn parse_bool_option(opts: &BTreeMap<String, String>, key: &str, default: bool) -> Result<bool, TreeError> {
    match opts.get(key).map(|raw| raw.trim()) {
        None | Some("") => Ok(default),
        Some(raw) if raw.eq_ignore_ascii_case("true") || raw == "1" => Ok(true),
        Some(raw) if raw.eq_ignore_ascii_case("false") || raw == "0" => Ok(false),
        Some(raw) => Err(TreeError::InvalidParam {
            key: key.to_owned(),
            detail: format!("expected a boolean, got '{raw}'"),
        }),
    }
}

impl EngineConfig {
    /// Unknown keys are ignored so the map can be shared with other layers.
    pub fn from_options(opts: &BTreeMap<String, String>) -> Result<Self, TreeError> {
        let defaults = Self::default();
        Ok(Self {
            lower_trivial: parse_bool_option(opts, LOWER_TRIVIAL_KEY, defaults.lower_trivial)?,
            promote_leaves: parse_bool_option(opts, PROMOTE_LEAVES_KEY, defaults.promote_leaves)?,
        })
    }
}
