//! Prerequisite strings from the tree config
//!
//! `"feature_buy"` is a static node key. A leading `-` marks a dynamic rule:
//! `-nodes_unlocked_below_tier:T:N` or `-total_nodes_unlocked:N`.

use crate::db::models::DynamicPrerequisite;
use crate::error::ProgressionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prerequisite {
    Static(String),
    Dynamic(DynamicPrerequisite),
}

impl Prerequisite {
    pub fn static_key(&self) -> Option<&str> {
        match self {
            Prerequisite::Static(key) => Some(key),
            Prerequisite::Dynamic(_) => None,
        }
    }
}

/// Parse and validate one prerequisite string
pub fn parse_prerequisite(raw: &str) -> Result<Prerequisite, ProgressionError> {
    let Some(rule) = raw.strip_prefix('-') else {
        if raw.trim().is_empty() {
            return Err(ProgressionError::InvalidInput("empty prerequisite".into()));
        }
        return Ok(Prerequisite::Static(raw.to_string()));
    };

    let parts: Vec<&str> = rule.split(':').collect();
    let parsed = match parts.as_slice() {
        ["nodes_unlocked_below_tier", tier, count] => DynamicPrerequisite::NodesUnlockedBelowTier {
            tier: parse_int(raw, "tier", tier)?,
            count: parse_int(raw, "count", count)?,
        },
        ["nodes_unlocked_below_tier", ..] => {
            return Err(ProgressionError::InvalidInput(format!(
                "expected -nodes_unlocked_below_tier:tier:count, got {}",
                raw
            )));
        }
        ["total_nodes_unlocked", count] => DynamicPrerequisite::TotalNodesUnlocked {
            count: parse_int(raw, "count", count)?,
        },
        ["total_nodes_unlocked", ..] => {
            return Err(ProgressionError::InvalidInput(format!(
                "expected -total_nodes_unlocked:count, got {}",
                raw
            )));
        }
        [kind, ..] => {
            return Err(ProgressionError::InvalidInput(format!(
                "unknown dynamic prerequisite type: {}",
                kind
            )));
        }
        [] => return Err(ProgressionError::InvalidInput("empty prerequisite".into())),
    };

    parsed
        .validate()
        .map_err(|e| ProgressionError::InvalidInput(format!("{}: {}", raw, e)))?;
    Ok(Prerequisite::Dynamic(parsed))
}

fn parse_int(raw: &str, field: &str, value: &str) -> Result<i32, ProgressionError> {
    value
        .parse()
        .map_err(|e| ProgressionError::InvalidInput(format!("invalid {} in {}: {}", field, raw, e)))
}

/// Split a prerequisite list into static keys and dynamic rules
pub fn split_prerequisites(
    raw: &[String],
) -> Result<(Vec<String>, Vec<DynamicPrerequisite>), ProgressionError> {
    let mut static_keys = Vec::new();
    let mut dynamic = Vec::new();
    for entry in raw {
        match parse_prerequisite(entry)? {
            Prerequisite::Static(key) => static_keys.push(key),
            Prerequisite::Dynamic(rule) => dynamic.push(rule),
        }
    }
    Ok((static_keys, dynamic))
}
