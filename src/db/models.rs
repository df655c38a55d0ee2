//! Diesel model definitions for the progression tables
//!
//! - Queryable structs: for SELECT queries (reading data)
//! - Insertable structs: for INSERT queries (writing data)
//! - Composite structs: rows joined or aggregated for callers

use std::collections::BTreeMap;

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::diesel_schema::*;
use crate::error::ProgressionError;

// ============================================================================
// Timestamp Helpers (SQLite stores timestamps as TEXT)
// ============================================================================

/// Current UTC timestamp for SQLite TEXT columns.
///
/// Fixed width with microseconds, so lexical order is chronological order.
pub fn current_timestamp() -> String {
    format_timestamp(chrono::Utc::now())
}

pub fn format_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn parse_timestamp(value: &str) -> Result<chrono::DateTime<chrono::Utc>, ProgressionError> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| ProgressionError::Internal(format!("Bad timestamp '{}': {}", value, e)))
}

// ============================================================================
// Node Models
// ============================================================================

/// Progression node row
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = progression_nodes)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProgressionNode {
    pub id: i32,
    pub node_key: String,
    pub node_type: String,
    pub display_name: String,
    pub description: String,
    pub max_level: i32,
    pub unlock_cost: i32,
    pub tier: i32,
    pub size: String,
    pub category: String,
    pub sort_order: i32,
    pub modifier_config: Option<String>,
    pub feature_key: Option<String>,
    pub dynamic_prerequisites: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ProgressionNode {
    /// Parsed modifier payload, if the node carries one
    pub fn modifier(&self) -> Result<Option<ModifierConfig>, ProgressionError> {
        match &self.modifier_config {
            Some(json) if !json.is_empty() => Ok(Some(serde_json::from_str(json)?)),
            _ => Ok(None),
        }
    }

    /// Parsed dynamic prerequisite rules (empty when none)
    pub fn dynamic_rules(&self) -> Result<Vec<DynamicPrerequisite>, ProgressionError> {
        let raw = self.dynamic_prerequisites.trim();
        if raw.is_empty() || raw == "[]" {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(raw)?)
    }
}

/// New node for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = progression_nodes)]
pub struct NewProgressionNode<'a> {
    pub node_key: &'a str,
    pub node_type: &'a str,
    pub display_name: &'a str,
    pub description: &'a str,
    pub max_level: i32,
    pub unlock_cost: i32,
    pub tier: i32,
    pub size: &'a str,
    pub category: &'a str,
    pub sort_order: i32,
    pub modifier_config: Option<String>,
    pub feature_key: Option<&'a str>,
    pub dynamic_prerequisites: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Catalog input shared by insert and update.
///
/// Identity (`node_key`) is fixed once inserted; updates touch display and
/// metadata fields only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInput {
    pub node_key: String,
    pub node_type: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub max_level: i32,
    pub unlock_cost: i32,
    #[serde(default)]
    pub tier: i32,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub modifier_config: Option<ModifierConfig>,
}

fn default_size() -> String {
    node_sizes::MEDIUM.to_string()
}

/// Numeric effect applied by an unlocked node to a feature value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifierConfig {
    pub feature_key: String,
    pub modifier_type: String,
    pub base_value: f64,
    pub per_level_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
}

/// Threshold rule evaluated against live unlock counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DynamicPrerequisite {
    /// At least `count` distinct nodes with tier < `tier` are unlocked
    NodesUnlockedBelowTier { tier: i32, count: i32 },
    /// At least `count` distinct nodes are unlocked
    TotalNodesUnlocked { count: i32 },
}

impl DynamicPrerequisite {
    pub fn validate(&self) -> Result<(), ProgressionError> {
        match *self {
            DynamicPrerequisite::NodesUnlockedBelowTier { tier, count } => {
                if tier < 0 {
                    return Err(ProgressionError::InvalidInput(format!(
                        "tier must be >= 0, got {}",
                        tier
                    )));
                }
                if count <= 0 {
                    return Err(ProgressionError::InvalidInput(format!(
                        "count must be > 0, got {}",
                        count
                    )));
                }
            }
            DynamicPrerequisite::TotalNodesUnlocked { count } => {
                if count <= 0 {
                    return Err(ProgressionError::InvalidInput(format!(
                        "count must be > 0, got {}",
                        count
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Node with its highest unlocked level (0 when locked)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeWithLevel {
    #[serde(flatten)]
    pub node: ProgressionNode,
    pub unlocked_level: i32,
}

// ============================================================================
// Unlock Models
// ============================================================================

/// Unlock fact for (node, level)
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = progression_unlocks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProgressionUnlock {
    pub id: i32,
    pub node_id: i32,
    pub current_level: i32,
    pub unlocked_at: String,
    pub unlocked_by: String,
    pub engagement_score: i32,
}

/// New unlock for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = progression_unlocks)]
pub struct NewProgressionUnlock<'a> {
    pub node_id: i32,
    pub current_level: i32,
    pub unlocked_at: &'a str,
    pub unlocked_by: &'a str,
    pub engagement_score: i32,
}

/// Result of an unlock attempt; a duplicate is not an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockOutcome {
    Unlocked,
    AlreadyUnlocked,
}

impl UnlockOutcome {
    pub fn is_new(self) -> bool {
        matches!(self, UnlockOutcome::Unlocked)
    }
}

// ============================================================================
// Voting Models
// ============================================================================

/// Voting session row
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = progression_voting_sessions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct VotingSessionRow {
    pub id: i32,
    pub status: String,
    pub started_at: String,
    pub voting_deadline: String,
    pub ended_at: Option<String>,
    pub winning_option_id: Option<i32>,
}

/// New session for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = progression_voting_sessions)]
pub struct NewVotingSession<'a> {
    pub status: &'a str,
    pub started_at: &'a str,
    pub voting_deadline: &'a str,
    pub ended_at: Option<&'a str>,
}

/// Voting option row
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = progression_voting_options)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct VotingOption {
    pub id: i32,
    pub session_id: i32,
    pub node_id: i32,
    pub target_level: i32,
    pub vote_count: i32,
    pub last_highest_vote_at: Option<String>,
}

/// New option for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = progression_voting_options)]
pub struct NewVotingOption {
    pub session_id: i32,
    pub node_id: i32,
    pub target_level: i32,
}

/// Option with the node it would unlock
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOption {
    #[serde(flatten)]
    pub option: VotingOption,
    pub node: ProgressionNode,
}

/// Session with its options in insertion order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VotingSession {
    #[serde(flatten)]
    pub session: VotingSessionRow,
    pub options: Vec<SessionOption>,
}

impl VotingSession {
    pub fn id(&self) -> i32 {
        self.session.id
    }

    pub fn status(&self) -> &str {
        &self.session.status
    }

    pub fn total_votes(&self) -> i64 {
        self.options.iter().map(|o| o.option.vote_count as i64).sum()
    }

    pub fn option(&self, option_id: i32) -> Option<&SessionOption> {
        self.options.iter().find(|o| o.option.id == option_id)
    }
}

/// Per-user vote marker
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = progression_user_votes)]
pub struct NewUserVote<'a> {
    pub user_id: &'a str,
    pub session_id: i32,
    pub option_id: i32,
    pub node_id: i32,
    pub voted_at: &'a str,
}

// ============================================================================
// Unlock Progress Models
// ============================================================================

/// One link of the contribution cycle chain
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = progression_unlock_progress)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UnlockProgress {
    pub id: i32,
    pub node_id: Option<i32>,
    pub target_level: Option<i32>,
    pub contributions_accumulated: i32,
    pub started_at: String,
    pub unlocked_at: Option<String>,
    pub voting_session_id: Option<i32>,
    pub previous_progress_id: Option<i32>,
}

impl UnlockProgress {
    pub fn has_target(&self) -> bool {
        self.node_id.is_some() && self.target_level.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.unlocked_at.is_none()
    }
}

/// New cycle for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = progression_unlock_progress)]
pub struct NewUnlockProgress<'a> {
    pub contributions_accumulated: i32,
    pub started_at: &'a str,
    pub previous_progress_id: Option<i32>,
}

// ============================================================================
// Engagement Models
// ============================================================================

/// Raw engagement event
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = engagement_metrics)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EngagementMetric {
    pub id: i32,
    pub user_id: String,
    pub metric_type: String,
    pub metric_value: i32,
    pub metadata: Option<String>,
    pub recorded_at: String,
}

/// New engagement event for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = engagement_metrics)]
pub struct NewEngagementMetric<'a> {
    pub user_id: &'a str,
    pub metric_type: &'a str,
    pub metric_value: i32,
    pub metadata: Option<String>,
    pub recorded_at: &'a str,
}

/// Weight row
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = engagement_weights)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EngagementWeight {
    pub metric_type: String,
    pub weight: f64,
    pub description: Option<String>,
    pub updated_at: String,
}

/// Per-user contribution breakdown
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContributionBreakdown {
    pub user_id: String,
    pub messages_sent: i64,
    pub commands_used: i64,
    pub items_crafted: i64,
    pub items_used: i64,
    /// Raw totals for every metric type, including the ones above
    pub by_metric: BTreeMap<String, i64>,
    /// Weighted score, unrounded
    pub total_score: f64,
}

/// Leaderboard row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: i32,
    pub user_id: String,
    pub contribution: i64,
}

// ============================================================================
// Admin Models
// ============================================================================

/// Reset audit row
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = progression_resets)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProgressionReset {
    pub id: i32,
    pub reset_by: String,
    pub reason: String,
    pub nodes_reset_count: i32,
    pub engagement_score_at_reset: i32,
    pub reset_at: String,
}

/// New reset audit row for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = progression_resets)]
pub struct NewProgressionReset<'a> {
    pub reset_by: &'a str,
    pub reason: &'a str,
    pub nodes_reset_count: i32,
    pub engagement_score_at_reset: i32,
    pub reset_at: &'a str,
}

/// Per-user unlock (recipes, personal features) outside the shared tree
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = user_progression)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UserProgression {
    pub user_id: String,
    pub progression_type: String,
    pub progression_key: String,
    pub unlocked_at: String,
    pub metadata: Option<String>,
}

/// New user progression for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = user_progression)]
pub struct NewUserProgression<'a> {
    pub user_id: &'a str,
    pub progression_type: &'a str,
    pub progression_key: &'a str,
    pub unlocked_at: &'a str,
    pub metadata: Option<String>,
}

/// Tree config sync bookkeeping
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = progression_sync_metadata)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncMetadata {
    pub config_name: String,
    pub last_sync_time: String,
    pub file_hash: String,
    pub file_mod_time: String,
}

// ============================================================================
// Constants
// ============================================================================

/// Voting session lifecycle
pub mod session_status {
    pub const VOTING: &str = "voting";
    pub const FROZEN: &str = "frozen";
    pub const COMPLETED: &str = "completed";

    pub const ALL: [&str; 3] = [VOTING, FROZEN, COMPLETED];

    /// Open sessions block creation of another one
    pub const OPEN: [&str; 2] = [VOTING, FROZEN];

    pub fn is_valid(status: &str) -> bool {
        ALL.contains(&status)
    }

    /// Allowed edges: voting -> frozen, frozen -> voting, voting|frozen -> completed
    pub fn can_transition(from: &str, to: &str) -> bool {
        matches!(
            (from, to),
            (VOTING, FROZEN) | (FROZEN, VOTING) | (VOTING, COMPLETED) | (FROZEN, COMPLETED)
        )
    }
}

/// Node kinds; behavior per kind lives in the consuming subsystem
pub mod node_types {
    pub const FEATURE: &str = "feature";
    pub const ITEM: &str = "item";
    pub const UPGRADE: &str = "upgrade";
    pub const JOB: &str = "job";
    pub const SYSTEM: &str = "system";

    pub const ALL: [&str; 5] = [FEATURE, ITEM, UPGRADE, JOB, SYSTEM];

    pub fn is_valid(node_type: &str) -> bool {
        ALL.contains(&node_type)
    }
}

/// Size tags (drive unlock cost)
pub mod node_sizes {
    pub const SMALL: &str = "small";
    pub const MEDIUM: &str = "medium";
    pub const LARGE: &str = "large";

    pub const ALL: [&str; 3] = [SMALL, MEDIUM, LARGE];

    pub fn is_valid(size: &str) -> bool {
        ALL.contains(&size)
    }
}

/// Actor recorded on unlock rows
pub mod unlock_sources {
    pub const AUTO: &str = "auto";
    pub const ADMIN: &str = "admin";
    pub const VOTE: &str = "vote";
    pub const INSTANT_OVERRIDE: &str = "instant_override";
}

/// Engagement metric types the breakdown knows by name
pub mod metric_types {
    pub const MESSAGE: &str = "message";
    pub const COMMAND: &str = "command";
    pub const ITEM_CRAFTED: &str = "item_crafted";
    pub const ITEM_USED: &str = "item_used";
    pub const VOTE_CAST: &str = "vote_cast";
}

/// Modifier arithmetic kinds
pub mod modifier_types {
    pub const MULTIPLICATIVE: &str = "multiplicative";
    pub const ADDITIVE: &str = "additive";
    pub const FIXED: &str = "fixed";

    pub const ALL: [&str; 3] = [MULTIPLICATIVE, ADDITIVE, FIXED];

    pub fn is_valid(modifier_type: &str) -> bool {
        ALL.contains(&modifier_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with(dynamic: &str, modifier: Option<&str>) -> ProgressionNode {
        ProgressionNode {
            id: 1,
            node_key: "feature_gamble".into(),
            node_type: "feature".into(),
            display_name: "Gamble".into(),
            description: String::new(),
            max_level: 1,
            unlock_cost: 100,
            tier: 1,
            size: "small".into(),
            category: "economy".into(),
            sort_order: 0,
            modifier_config: modifier.map(String::from),
            feature_key: None,
            dynamic_prerequisites: dynamic.into(),
            created_at: current_timestamp(),
            updated_at: current_timestamp(),
        }
    }

    #[test]
    fn test_timestamps_sort_chronologically() {
        let a = current_timestamp();
        let b = current_timestamp();
        assert!(a <= b);
        assert_eq!(a.len(), "2024-01-01T00:00:00.000000Z".len());
        assert!(parse_timestamp(&a).is_ok());
    }

    #[test]
    fn test_dynamic_rules_parse() {
        let node = node_with(
            r#"[{"type":"nodes_unlocked_below_tier","tier":2,"count":3},{"type":"total_nodes_unlocked","count":5}]"#,
            None,
        );
        assert_eq!(
            node.dynamic_rules().unwrap(),
            vec![
                DynamicPrerequisite::NodesUnlockedBelowTier { tier: 2, count: 3 },
                DynamicPrerequisite::TotalNodesUnlocked { count: 5 },
            ]
        );
        assert!(node_with("[]", None).dynamic_rules().unwrap().is_empty());
        assert!(node_with("", None).dynamic_rules().unwrap().is_empty());
    }

    #[test]
    fn test_modifier_parse() {
        let node = node_with(
            "[]",
            Some(r#"{"feature_key":"progression_rate","modifier_type":"multiplicative","base_value":1.0,"per_level_value":0.1}"#),
        );
        let modifier = node.modifier().unwrap().unwrap();
        assert_eq!(modifier.feature_key, "progression_rate");
        assert_eq!(modifier.max_value, None);
        assert!(node_with("[]", None).modifier().unwrap().is_none());
    }

    #[test]
    fn test_session_transitions() {
        assert!(session_status::can_transition("voting", "frozen"));
        assert!(session_status::can_transition("frozen", "voting"));
        assert!(session_status::can_transition("frozen", "completed"));
        assert!(!session_status::can_transition("completed", "voting"));
        assert!(!session_status::can_transition("voting", "voting"));
    }
}
