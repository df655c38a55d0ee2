//! Progression service - unlock graph, voting and contribution cycles
//!
//! Every multi-step decision (start a vote, record a vote, unlock the target
//! and roll the cycle over, reset) runs inside one `ProgressionDb::write`
//! transaction. Events are published after commit, and follow-up steps
//! (the next target, the next vote) run as separate transactions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use diesel::SqliteConnection;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::models::{
    format_timestamp, metric_types, session_status, unlock_sources, ProgressionNode, SessionOption,
    UnlockOutcome, UnlockProgress, UserProgression, VotingOption, VotingSession,
};
use crate::db::reset::{self, ResetSummary};
use crate::db::{engagement, nodes, progress, user_progression, voting, OpContext, ProgressionDb};
use crate::error::ProgressionError;
use crate::tree::{self, SyncResult};

use super::engagement_service::EngagementService;
use super::events::{EventBus, ProgressionEvent};
use super::modifiers::{stack_modifiers, ModifierCache};

/// Feature whose modifiers scale engagement into contribution points
pub const PROGRESSION_RATE_FEATURE: &str = "progression_rate";

/// Node that multiplies every contribution by 1.5 once unlocked
pub const CONTRIBUTION_BOOST_NODE: &str = "upgrade_contribution_boost";

/// Tunables taken from `Config`
#[derive(Debug, Clone)]
pub struct ProgressionSettings {
    pub root_node_key: String,
    pub max_voting_options: usize,
    pub max_rollover_points: i32,
    pub voting_duration: chrono::Duration,
}

impl ProgressionSettings {
    /// Fails when `voting_duration_hours` is not positive or would push a
    /// deadline past the representable date range
    pub fn from_config(config: &Config) -> Result<Self, ProgressionError> {
        let hours = config.voting_duration_hours;
        let voting_duration = chrono::Duration::try_hours(hours)
            .filter(|d| *d > chrono::Duration::zero())
            .filter(|d| Utc::now().checked_add_signed(*d).is_some())
            .ok_or_else(|| {
                ProgressionError::Config(format!("voting_duration_hours out of range: {}", hours))
            })?;

        Ok(Self {
            root_node_key: config.root_node_key.clone(),
            max_voting_options: config.max_voting_options.max(1),
            max_rollover_points: config.max_rollover_points.max(0),
            voting_duration,
        })
    }

    fn voting_deadline(&self) -> Result<String, ProgressionError> {
        Utc::now()
            .checked_add_signed(self.voting_duration)
            .map(format_timestamp)
            .ok_or_else(|| ProgressionError::Config("voting deadline out of range".into()))
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of starting a vote
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VotingStart {
    /// A ballot is open
    Started { session: VotingSession },
    /// Only one candidate and no target: it became the target without a vote
    AutoSelected {
        progress_id: i32,
        node: ProgressionNode,
        level: i32,
        session_id: i32,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdminStart {
    Resumed { session_id: i32 },
    Started { start: VotingStart },
    /// A target was picked but nothing is left to vote on
    TargetOnly { node_key: String, level: i32 },
}

/// A completed unlock cycle
#[derive(Debug, Clone, Serialize)]
pub struct UnlockResult {
    pub node: ProgressionNode,
    pub level: i32,
    pub outcome: UnlockOutcome,
    pub source: String,
    pub progress_id: i32,
    pub next_progress_id: i32,
    pub accumulated: i32,
    pub rollover: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteReceipt {
    pub session_id: i32,
    pub option_id: i32,
    pub node_key: String,
    pub target_level: i32,
    pub vote_count: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContributionOutcome {
    pub progress_id: i32,
    pub total: i32,
    pub unlock: Option<UnlockResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngagementOutcome {
    /// value × weight, before modifiers
    pub score: f64,
    /// Points added to the current cycle
    pub contribution: i32,
    pub unlock: Option<UnlockResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressionStatus {
    pub total_unlocked: usize,
    pub total_nodes: usize,
    pub all_nodes_unlocked: bool,
    pub contribution_score: f64,
    pub active_session: Option<VotingSession>,
    pub active_progress: Option<UnlockProgress>,
    pub is_transitioning: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    #[serde(flatten)]
    pub node: ProgressionNode,
    pub is_unlocked: bool,
    pub unlocked_level: i32,
    /// Nodes that list this one as a prerequisite
    pub dependents: Vec<i32>,
}

enum TargetPick {
    Existing,
    Picked {
        progress_id: i32,
        node: ProgressionNode,
        level: i32,
        session_id: i32,
    },
    NoneAvailable,
}

enum NextTarget {
    Set {
        node: ProgressionNode,
        level: i32,
        session_id: i32,
        from_vote: bool,
    },
    Exhausted {
        total_nodes: i64,
        all_maxed: bool,
    },
}

// ============================================================================
// Service
// ============================================================================

/// Progression service for business logic
pub struct ProgressionService {
    db: Arc<ProgressionDb>,
    events: Arc<EventBus>,
    engagement: Arc<EngagementService>,
    settings: ProgressionSettings,
    unlock_cache: DashMap<(String, i32), bool>,
    modifier_cache: ModifierCache,
    cache_generation: AtomicU64,
}

impl ProgressionService {
    pub fn new(
        db: Arc<ProgressionDb>,
        events: Arc<EventBus>,
        engagement: Arc<EngagementService>,
        settings: ProgressionSettings,
    ) -> Self {
        Self {
            db,
            events,
            engagement,
            settings,
            unlock_cache: DashMap::new(),
            modifier_cache: ModifierCache::new(),
            cache_generation: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &ProgressionSettings {
        &self.settings
    }

    /// Drop the unlock and modifier caches
    pub fn invalidate_caches(&self) {
        self.cache_generation.fetch_add(1, Ordering::SeqCst);
        self.unlock_cache.clear();
        self.modifier_cache.invalidate_all();
    }

    fn publish_unlock(&self, node: &ProgressionNode, level: i32, source: &str) {
        self.events.emit(ProgressionEvent::NodeUnlocked {
            node_id: node.id,
            node_key: node.node_key.clone(),
            level,
            source: source.to_string(),
        });
    }

    fn engagement_score_snapshot(&self, ctx: &OpContext) -> i32 {
        match self.engagement.get_engagement_score(ctx, None) {
            Ok(score) => score.round() as i32,
            Err(e) => {
                warn!(error = %e, "Failed to get engagement score for unlock");
                0
            }
        }
    }

    // =========================================================================
    // Tree
    // =========================================================================

    /// Load a tree file and sync it into the catalog
    pub fn sync_tree(
        &self,
        ctx: &OpContext,
        path: &Path,
        force: bool,
    ) -> Result<SyncResult, ProgressionError> {
        let config = tree::load(path)?;
        let result = tree::sync_to_database(&self.db, ctx, &config, path, force)?;
        if !result.unchanged {
            self.invalidate_caches();
        }
        for node in &result.auto_unlocked {
            self.publish_unlock(node, 1, unlock_sources::AUTO);
        }
        Ok(result)
    }

    pub fn get_progression_tree(&self, ctx: &OpContext) -> Result<Vec<TreeNode>, ProgressionError> {
        self.db.read(ctx, "get_progression_tree", |conn| {
            let all = nodes::get_all_nodes(conn)?;
            let levels = nodes::get_unlocked_levels(conn)?;
            let mut dependents: HashMap<i32, Vec<i32>> = HashMap::new();
            for (node_id, prereq_id) in nodes::get_prerequisite_edges(conn)? {
                dependents.entry(prereq_id).or_default().push(node_id);
            }

            Ok(all
                .into_iter()
                .map(|node| {
                    let unlocked_level = levels.get(&node.id).copied().unwrap_or(0);
                    let mut children = dependents.remove(&node.id).unwrap_or_default();
                    children.sort_unstable();
                    TreeNode {
                        is_unlocked: unlocked_level > 0,
                        unlocked_level,
                        dependents: children,
                        node,
                    }
                })
                .collect())
        })
    }

    /// Nodes that could be voted on right now
    pub fn get_available_unlocks(
        &self,
        ctx: &OpContext,
    ) -> Result<Vec<ProgressionNode>, ProgressionError> {
        self.db.read(ctx, "get_available_unlocks", available_nodes)
    }

    /// Locked prerequisites standing between the community and `node_key`,
    /// followed transitively
    pub fn get_required_nodes(
        &self,
        ctx: &OpContext,
        node_key: &str,
    ) -> Result<Vec<ProgressionNode>, ProgressionError> {
        self.db.read(ctx, "get_required_nodes", |conn| {
            let target = nodes::get_node_by_key(conn, node_key)?
                .ok_or_else(|| ProgressionError::NodeNotFound(node_key.to_string()))?;

            let mut visited: HashSet<i32> = HashSet::new();
            let mut locked: Vec<ProgressionNode> = Vec::new();
            let mut stack = vec![target.id];

            while let Some(node_id) = stack.pop() {
                if !visited.insert(node_id) {
                    continue;
                }
                for prereq in nodes::get_prerequisites(conn, node_id)? {
                    if nodes::get_unlock(conn, prereq.id, 1)?.is_none() {
                        if !locked.iter().any(|n| n.id == prereq.id) {
                            stack.push(prereq.id);
                            locked.push(prereq);
                        }
                    }
                }
            }
            Ok(locked)
        })
    }

    // =========================================================================
    // Hot Queries
    // =========================================================================

    pub fn is_node_unlocked(
        &self,
        ctx: &OpContext,
        node_key: &str,
        level: i32,
    ) -> Result<bool, ProgressionError> {
        let key = (node_key.to_string(), level);
        if let Some(hit) = self.unlock_cache.get(&key) {
            return Ok(*hit);
        }

        let generation = self.cache_generation.load(Ordering::SeqCst);
        let unlocked = self.db.read(ctx, "is_node_unlocked", |conn| {
            nodes::is_node_unlocked(conn, node_key, level)
        })?;
        if self.cache_generation.load(Ordering::SeqCst) == generation {
            self.unlock_cache.insert(key, unlocked);
        }
        Ok(unlocked)
    }

    pub fn is_feature_unlocked(
        &self,
        ctx: &OpContext,
        feature_key: &str,
    ) -> Result<bool, ProgressionError> {
        self.is_node_unlocked(ctx, feature_key, 1)
    }

    pub fn is_item_unlocked(&self, ctx: &OpContext, item_name: &str) -> Result<bool, ProgressionError> {
        self.is_node_unlocked(ctx, &item_node_key(item_name), 1)
    }

    /// Batch form of `is_item_unlocked`, keyed by item name
    pub fn are_items_unlocked(
        &self,
        ctx: &OpContext,
        item_names: &[&str],
    ) -> Result<BTreeMap<String, bool>, ProgressionError> {
        let mut result = BTreeMap::new();
        for name in item_names {
            result.insert(name.to_string(), self.is_item_unlocked(ctx, name)?);
        }
        Ok(result)
    }

    /// `base_value` with every unlocked modifier for the feature applied
    pub fn get_modified_value(
        &self,
        ctx: &OpContext,
        feature_key: &str,
        base_value: f64,
    ) -> Result<f64, ProgressionError> {
        if let Some(value) = self.modifier_cache.get(feature_key, base_value) {
            return Ok(value);
        }

        let generation = self.cache_generation.load(Ordering::SeqCst);
        let entries = self.db.read(ctx, "get_nodes_by_feature_key", |conn| {
            nodes::get_nodes_by_feature_key(conn, feature_key)
        })?;
        let value = stack_modifiers(&entries, base_value);

        if self.cache_generation.load(Ordering::SeqCst) == generation {
            self.modifier_cache.insert(feature_key, base_value, value);
        }
        Ok(value)
    }

    // =========================================================================
    // Voting
    // =========================================================================

    pub fn get_active_or_frozen_session(
        &self,
        ctx: &OpContext,
    ) -> Result<Option<VotingSession>, ProgressionError> {
        self.db.read(ctx, "get_active_or_frozen_session", voting::get_active_or_frozen_session)
    }

    pub fn get_most_recent_session(
        &self,
        ctx: &OpContext,
    ) -> Result<Option<VotingSession>, ProgressionError> {
        self.db.read(ctx, "get_most_recent_session", voting::get_most_recent_session)
    }

    pub fn get_session_voters(
        &self,
        ctx: &OpContext,
        session_id: i32,
    ) -> Result<Vec<String>, ProgressionError> {
        self.db.read(ctx, "get_session_voters", |conn| {
            voting::get_session_voters(conn, session_id)
        })
    }

    /// Open a ballot over the available nodes, or auto-select a lone candidate
    pub fn start_voting_session(&self, ctx: &OpContext) -> Result<VotingStart, ProgressionError> {
        let deadline = self.settings.voting_deadline()?;
        let max_options = self.settings.max_voting_options;

        let start = self.db.write(ctx, "start_voting_session", |conn| {
            if let Some(open) = voting::get_active_or_frozen_session(conn)? {
                warn!(session_id = open.id(), status = open.status(), "Voting session already open");
                return Err(ProgressionError::SessionAlreadyActive(open.id()));
            }

            let active = progress::ensure_active_unlock_progress(conn)?;
            let mut candidates = available_with_future_target(conn, Some(&active))?;
            if let Some(target_id) = active.node_id {
                candidates.retain(|n| n.id != target_id);
            }

            if candidates.is_empty() {
                return Err(ProgressionError::NoNodesAvailable);
            }

            if candidates.len() == 1 && !active.has_target() {
                let node = candidates.remove(0);
                let level = next_target_level(conn, &node)?;
                let (session, _) = voting::create_placeholder_session(conn, node.id, level)?;
                progress::set_unlock_target(conn, active.id, node.id, level, Some(session.id))?;
                return Ok(VotingStart::AutoSelected {
                    progress_id: active.id,
                    node,
                    level,
                    session_id: session.id,
                });
            }

            let mut selected: Vec<ProgressionNode> = candidates
                .choose_multiple(&mut rand::thread_rng(), max_options)
                .cloned()
                .collect();
            selected.sort_by(|a, b| a.node_key.cmp(&b.node_key));

            let row = voting::create_voting_session(conn, &deadline)?;
            for node in &selected {
                let level = next_target_level(conn, node)?;
                voting::add_voting_option(conn, row.id, node.id, level)?;
            }

            let session = voting::get_session_by_id(conn, row.id)?
                .ok_or_else(|| ProgressionError::Internal(format!("Session {} missing after insert", row.id)))?;
            Ok(VotingStart::Started { session })
        })?;

        match &start {
            VotingStart::Started { session } => {
                info!(session_id = session.id(), options = session.options.len(), "Started voting session");
                self.events.emit(ProgressionEvent::VotingStarted {
                    session_id: session.id(),
                    node_keys: session.options.iter().map(|o| o.node.node_key.clone()).collect(),
                    voting_deadline: session.session.voting_deadline.clone(),
                });
            }
            VotingStart::AutoSelected {
                progress_id,
                node,
                level,
                session_id,
            } => {
                info!(node_key = %node.node_key, level, "Only one option available, auto-selected target");
                self.events.emit(ProgressionEvent::TargetSet {
                    progress_id: *progress_id,
                    node_key: node.node_key.clone(),
                    level: *level,
                    session_id: Some(*session_id),
                    auto_selected: true,
                });
                if node.unlock_cost == 0 {
                    info!(node_key = %node.node_key, "Zero-cost target, unlocking immediately");
                    if let Err(e) = self.check_and_unlock_node(ctx) {
                        warn!(error = %e, "Failed to unlock zero-cost target");
                    }
                }
            }
        }
        Ok(start)
    }

    /// Cast a vote for the 1-based `option_index` of the open ballot
    pub fn record_vote(
        &self,
        ctx: &OpContext,
        user_id: &str,
        option_index: usize,
    ) -> Result<VoteReceipt, ProgressionError> {
        if user_id.trim().is_empty() {
            return Err(ProgressionError::InvalidInput("user_id is required".into()));
        }

        let receipt = self.db.write(ctx, "record_vote", |conn| {
            let session = voting::get_active_session(conn)?.ok_or(ProgressionError::NoActiveSession)?;
            if option_index < 1 || option_index > session.options.len() {
                return Err(ProgressionError::InvalidInput(format!(
                    "invalid option index: {} (must be between 1 and {})",
                    option_index,
                    session.options.len()
                )));
            }

            let choice = &session.options[option_index - 1];
            let vote_count = voting::check_and_record_vote_atomic(
                conn,
                user_id,
                session.id(),
                choice.option.id,
                choice.option.node_id,
            )?;

            Ok(VoteReceipt {
                session_id: session.id(),
                option_id: choice.option.id,
                node_key: choice.node.node_key.clone(),
                target_level: choice.option.target_level,
                vote_count,
            })
        })?;

        info!(user_id, session_id = receipt.session_id, node_key = %receipt.node_key, "Vote recorded");

        if let Err(e) = self.record_engagement(ctx, user_id, metric_types::VOTE_CAST, 1, None) {
            warn!(user_id, error = %e, "Failed to record vote engagement");
        }
        Ok(receipt)
    }

    /// Close the open ballot and make its winner the target if none is set
    pub fn end_voting(&self, ctx: &OpContext) -> Result<SessionOption, ProgressionError> {
        let (winner, target) = self.db.write(ctx, "end_voting", |conn| {
            let session = voting::get_active_session(conn)?.ok_or(ProgressionError::NoActiveSession)?;
            let winner = select_winner(&session.options, &mut rand::thread_rng())
                .cloned()
                .ok_or_else(|| {
                    ProgressionError::InvalidInput(format!("session {} has no options", session.id()))
                })?;

            voting::end_voting_session(conn, session.id(), Some(winner.option.id))?;

            let active = progress::ensure_active_unlock_progress(conn)?;
            let mut target = None;
            if !active.has_target() {
                progress::set_unlock_target(
                    conn,
                    active.id,
                    winner.option.node_id,
                    winner.option.target_level,
                    Some(session.id()),
                )?;
                target = Some((active.id, session.id()));
            }
            Ok((winner, target))
        })?;

        info!(
            session_id = winner.option.session_id,
            node_key = %winner.node.node_key,
            votes = winner.option.vote_count,
            "Voting ended"
        );

        if let Some((progress_id, session_id)) = target {
            self.events.emit(ProgressionEvent::TargetSet {
                progress_id,
                node_key: winner.node.node_key.clone(),
                level: winner.option.target_level,
                session_id: Some(session_id),
                auto_selected: false,
            });
        }
        Ok(winner)
    }

    // =========================================================================
    // Contribution Cycle
    // =========================================================================

    pub fn get_unlock_progress(
        &self,
        ctx: &OpContext,
    ) -> Result<Option<UnlockProgress>, ProgressionError> {
        self.db.read(ctx, "get_active_unlock_progress", progress::get_active_unlock_progress)
    }

    /// Add points to the current cycle and unlock the target once it is paid for
    pub fn add_contribution(
        &self,
        ctx: &OpContext,
        amount: i32,
    ) -> Result<ContributionOutcome, ProgressionError> {
        if amount < 0 {
            return Err(ProgressionError::InvalidInput(format!(
                "contribution amount must be >= 0, got {}",
                amount
            )));
        }

        let amount = self.apply_contribution_boost(ctx, amount);

        let (progress_id, total, cost) = self.db.write(ctx, "add_contribution", |conn| {
            let active = progress::ensure_active_unlock_progress(conn)?;
            let total = progress::add_contribution(conn, active.id, amount)?;
            let cost = match active.node_id {
                Some(node_id) => Some(nodes::require_node(conn, node_id)?.unlock_cost),
                None => None,
            };
            Ok((active.id, total, cost))
        })?;

        let unlock = match cost {
            Some(cost) if total >= cost => {
                info!(accumulated = total, required = cost, "Unlock threshold met");
                self.check_and_unlock_node(ctx)?
            }
            Some(cost) => {
                debug!(current = total, required = cost, added = amount, "Contribution progress updated");
                None
            }
            None => {
                debug!(added = amount, total, "Contribution added, no target set");
                None
            }
        };

        Ok(ContributionOutcome {
            progress_id,
            total,
            unlock,
        })
    }

    fn apply_contribution_boost(&self, ctx: &OpContext, amount: i32) -> i32 {
        match self.is_feature_unlocked(ctx, CONTRIBUTION_BOOST_NODE) {
            Ok(true) => amount.saturating_mul(3) / 2,
            Ok(false) => amount,
            Err(e) => {
                warn!(error = %e, "Failed to check contribution boost");
                amount
            }
        }
    }

    /// Unlock the target if the cycle has paid for it.
    ///
    /// The unlock, the rollover into the next cycle and closing the target's
    /// ballot commit together. Concurrent callers see the completed cycle and
    /// return `None`.
    pub fn check_and_unlock_node(
        &self,
        ctx: &OpContext,
    ) -> Result<Option<UnlockResult>, ProgressionError> {
        let cap = self.settings.max_rollover_points;

        let result = self.db.write(ctx, "check_and_unlock_node", |conn| {
            let Some(active) = progress::get_active_unlock_progress(conn)? else {
                progress::create_unlock_progress(conn)?;
                return Ok(None);
            };
            let (Some(node_id), Some(level)) = (active.node_id, active.target_level) else {
                return Ok(None);
            };

            let node = nodes::require_node(conn, node_id)?;
            if active.contributions_accumulated < node.unlock_cost {
                debug!(
                    current = active.contributions_accumulated,
                    required = node.unlock_cost,
                    "Waiting for contribution threshold"
                );
                return Ok(None);
            }

            let outcome = nodes::unlock_node(
                conn,
                node.id,
                level,
                unlock_sources::VOTE,
                active.contributions_accumulated,
            )?;

            let surplus = active.contributions_accumulated - node.unlock_cost;
            let rollover = surplus.min(cap);
            if surplus > cap {
                info!(original = surplus, capped = cap, "Capping contribution rollover");
            }

            let next = progress::complete_unlock(conn, active.id, rollover)?;
            close_target_session(conn, &active)?;

            Ok(Some(UnlockResult {
                node,
                level,
                outcome,
                source: unlock_sources::VOTE.to_string(),
                progress_id: active.id,
                next_progress_id: next.id,
                accumulated: active.contributions_accumulated,
                rollover,
            }))
        })?;

        if let Some(unlock) = &result {
            self.after_cycle_unlock(unlock);
            if let Err(e) = self.post_unlock_transition(ctx, unlock.next_progress_id) {
                warn!(error = %e, "Post-unlock transition failed");
            }
        }
        Ok(result)
    }

    fn after_cycle_unlock(&self, unlock: &UnlockResult) {
        self.invalidate_caches();
        if unlock.outcome.is_new() {
            self.publish_unlock(&unlock.node, unlock.level, &unlock.source);
        }
        self.events.emit(ProgressionEvent::CycleCompleted {
            progress_id: unlock.progress_id,
            next_progress_id: unlock.next_progress_id,
            node_key: unlock.node.node_key.clone(),
            rollover: unlock.rollover,
        });
    }

    /// Pick the next target (open ballot winner, else a random available
    /// node) and start the vote for the cycle after it
    fn post_unlock_transition(
        &self,
        ctx: &OpContext,
        next_progress_id: i32,
    ) -> Result<(), ProgressionError> {
        let next = self.db.write(ctx, "post_unlock_transition", |conn| {
            let mut rng = rand::thread_rng();
            match resolve_next_target(conn, &mut rng)? {
                Some((node, level, ballot)) => {
                    let session_id = match ballot {
                        Some(session_id) => session_id,
                        None => voting::create_placeholder_session(conn, node.id, level)?.0.id,
                    };
                    progress::set_unlock_target(conn, next_progress_id, node.id, level, Some(session_id))?;
                    Ok(NextTarget::Set {
                        node,
                        level,
                        session_id,
                        from_vote: ballot.is_some(),
                    })
                }
                None => {
                    let all = nodes::get_all_nodes(conn)?;
                    let levels = nodes::get_unlocked_levels(conn)?;
                    Ok(NextTarget::Exhausted {
                        total_nodes: all.len() as i64,
                        all_maxed: all_maxed(&all, &levels),
                    })
                }
            }
        })?;

        match next {
            NextTarget::Exhausted {
                total_nodes,
                all_maxed,
            } => {
                if all_maxed {
                    info!(total_nodes, "All nodes unlocked after this unlock");
                    self.events.emit(ProgressionEvent::AllUnlocked { total_nodes });
                } else {
                    info!("No nodes available for the next cycle");
                }
            }
            NextTarget::Set {
                node,
                level,
                session_id,
                from_vote,
            } => {
                info!(node_key = %node.node_key, level, from_vote, "Next unlock target set");
                self.events.emit(ProgressionEvent::TargetSet {
                    progress_id: next_progress_id,
                    node_key: node.node_key.clone(),
                    level,
                    session_id: Some(session_id),
                    auto_selected: !from_vote,
                });
                self.start_next_cycle_vote(ctx);
            }
        }
        Ok(())
    }

    fn start_next_cycle_vote(&self, ctx: &OpContext) {
        match self.start_voting_session(ctx) {
            Ok(_) => {}
            Err(ProgressionError::NoNodesAvailable) => {
                debug!("Nothing left to vote on for the next cycle");
            }
            Err(ProgressionError::SessionAlreadyActive(session_id)) => {
                debug!(session_id, "Next-cycle vote already open");
            }
            Err(e) => warn!(error = %e, "Failed to start next-cycle voting session"),
        }
    }

    /// Append engagement, weight it, scale it by `progression_rate` and add
    /// the integer part to the current cycle
    pub fn record_engagement(
        &self,
        ctx: &OpContext,
        user_id: &str,
        metric_type: &str,
        value: i32,
        metadata: Option<&serde_json::Value>,
    ) -> Result<EngagementOutcome, ProgressionError> {
        let score = self
            .engagement
            .record_metric(ctx, user_id, metric_type, value, metadata)?;

        let modified = match self.get_modified_value(ctx, PROGRESSION_RATE_FEATURE, score) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to apply progression_rate modifier, using base score");
                score
            }
        };

        let contribution = modified.trunc() as i32;
        let mut unlock = None;
        if contribution > 0 {
            match self.add_contribution(ctx, contribution) {
                Ok(outcome) => unlock = outcome.unlock,
                Err(e) => warn!(user_id, error = %e, "Failed to add contribution from engagement"),
            }
        }

        Ok(EngagementOutcome {
            score,
            contribution,
            unlock,
        })
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Make sure a target exists and the next vote is open
    pub fn initialize_progression_state(&self, ctx: &OpContext) -> Result<(), ProgressionError> {
        info!("Initializing progression state");
        match self.set_initial_target(ctx)? {
            TargetPick::Existing => {
                debug!("Progression target already set");
                Ok(())
            }
            TargetPick::NoneAvailable => {
                self.announce_if_all_unlocked(ctx)?;
                Ok(())
            }
            TargetPick::Picked { .. } => {
                self.start_next_cycle_vote(ctx);
                Ok(())
            }
        }
    }

    fn announce_if_all_unlocked(&self, ctx: &OpContext) -> Result<(), ProgressionError> {
        let (total_nodes, maxed) = self.db.read(ctx, "all_unlocked_check", |conn| {
            let all = nodes::get_all_nodes(conn)?;
            let levels = nodes::get_unlocked_levels(conn)?;
            Ok((all.len() as i64, all_maxed(&all, &levels)))
        })?;
        if maxed {
            info!(total_nodes, "Progression state: all nodes unlocked");
            self.events.emit(ProgressionEvent::AllUnlocked { total_nodes });
        } else {
            info!("Progression state: no nodes available");
        }
        Ok(())
    }

    fn set_initial_target(&self, ctx: &OpContext) -> Result<TargetPick, ProgressionError> {
        let pick = self.db.write(ctx, "set_initial_target", |conn| {
            let active = progress::ensure_active_unlock_progress(conn)?;
            if active.has_target() {
                return Ok(TargetPick::Existing);
            }

            let available = available_nodes(conn)?;
            let Some(node) = available.choose(&mut rand::thread_rng()).cloned() else {
                return Ok(TargetPick::NoneAvailable);
            };
            let level = next_target_level(conn, &node)?;
            let (session, _) = voting::create_placeholder_session(conn, node.id, level)?;
            progress::set_unlock_target(conn, active.id, node.id, level, Some(session.id))?;

            Ok(TargetPick::Picked {
                progress_id: active.id,
                node,
                level,
                session_id: session.id,
            })
        })?;

        if let TargetPick::Picked {
            progress_id,
            node,
            level,
            session_id,
        } = &pick
        {
            info!(node_key = %node.node_key, level, "Initial target set");
            self.events.emit(ProgressionEvent::TargetSet {
                progress_id: *progress_id,
                node_key: node.node_key.clone(),
                level: *level,
                session_id: Some(*session_id),
                auto_selected: true,
            });
        }
        Ok(pick)
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn get_progression_status(
        &self,
        ctx: &OpContext,
    ) -> Result<ProgressionStatus, ProgressionError> {
        let contribution_score = self.engagement.get_engagement_score(ctx, None)?;

        self.db.read(ctx, "get_progression_status", |conn| {
            let unlocks = nodes::get_all_unlocks(conn)?;
            let all = nodes::get_all_nodes(conn)?;
            let levels = nodes::get_unlocked_levels(conn)?;
            let active_session = voting::get_active_or_frozen_session(conn)?;
            let active_progress = progress::get_active_unlock_progress(conn)?;

            let is_transitioning = active_session.is_some()
                && active_progress.as_ref().map_or(false, |p| !p.has_target());

            Ok(ProgressionStatus {
                total_unlocked: unlocks.len(),
                total_nodes: all.len(),
                all_nodes_unlocked: all_maxed(&all, &levels),
                contribution_score,
                active_session,
                active_progress,
                is_transitioning,
            })
        })
    }

    // =========================================================================
    // Admin
    // =========================================================================

    pub fn admin_unlock(
        &self,
        ctx: &OpContext,
        node_key: &str,
        level: i32,
    ) -> Result<UnlockOutcome, ProgressionError> {
        let score = self.engagement_score_snapshot(ctx);
        let (node, outcome) = self.db.write(ctx, "admin_unlock", |conn| {
            let node = nodes::get_node_by_key(conn, node_key)?
                .ok_or_else(|| ProgressionError::NodeNotFound(node_key.to_string()))?;
            let outcome = nodes::unlock_node(conn, node.id, level, unlock_sources::ADMIN, score)?;
            Ok((node, outcome))
        })?;

        if outcome.is_new() {
            self.invalidate_caches();
            self.publish_unlock(&node, level, unlock_sources::ADMIN);
        }
        info!(node_key, level, ?outcome, "Admin unlocked node");
        Ok(outcome)
    }

    /// Unlock every node at its max level; returns how many were new
    pub fn admin_unlock_all(&self, ctx: &OpContext) -> Result<usize, ProgressionError> {
        let score = self.engagement_score_snapshot(ctx);
        let unlocked = self.db.write(ctx, "admin_unlock_all", |conn| {
            let all = nodes::get_all_nodes(conn)?;
            if all.is_empty() {
                return Err(ProgressionError::NodeNotFound("no nodes found".into()));
            }
            let mut unlocked = Vec::new();
            for node in all {
                let level = node.max_level;
                if nodes::unlock_node(conn, node.id, level, unlock_sources::ADMIN, score)?.is_new() {
                    unlocked.push((node, level));
                }
            }
            Ok(unlocked)
        })?;

        self.invalidate_caches();
        for (node, level) in &unlocked {
            self.publish_unlock(node, *level, unlock_sources::ADMIN);
        }
        info!(unlocked = unlocked.len(), "Admin unlocked all nodes");
        Ok(unlocked.len())
    }

    pub fn admin_relock(
        &self,
        ctx: &OpContext,
        node_key: &str,
        level: i32,
    ) -> Result<bool, ProgressionError> {
        let (node, removed) = self.db.write(ctx, "admin_relock", |conn| {
            let node = nodes::get_node_by_key(conn, node_key)?
                .ok_or_else(|| ProgressionError::NodeNotFound(node_key.to_string()))?;
            let removed = nodes::relock_node(conn, node.id, level)?;
            Ok((node, removed))
        })?;

        self.invalidate_caches();
        if removed {
            self.events.emit(ProgressionEvent::NodeRelocked {
                node_id: node.id,
                node_key: node.node_key.clone(),
                level,
                source: unlock_sources::ADMIN.to_string(),
            });
        }
        info!(node_key, level, removed, "Admin relocked node");
        Ok(removed)
    }

    /// `voting` -> `frozen`; returns the session id
    pub fn admin_freeze_voting(&self, ctx: &OpContext) -> Result<i32, ProgressionError> {
        let session_id = self.db.write(ctx, "admin_freeze_voting", |conn| {
            match voting::get_active_or_frozen_session(conn)? {
                Some(session) if session.status() == session_status::FROZEN => {
                    Err(ProgressionError::SessionAlreadyFrozen(session.id()))
                }
                Some(session) => {
                    voting::freeze_voting_session(conn, session.id())?;
                    Ok(session.id())
                }
                None => Err(ProgressionError::NoActiveSession),
            }
        })?;
        info!(session_id, "Admin froze voting session");
        Ok(session_id)
    }

    /// Resume a frozen ballot, or set a target if needed and open a new one
    pub fn admin_start_voting(&self, ctx: &OpContext) -> Result<AdminStart, ProgressionError> {
        if let Some(open) = self.get_active_or_frozen_session(ctx)? {
            if open.status() == session_status::FROZEN {
                self.db.write(ctx, "resume_voting_session", |conn| {
                    voting::resume_voting_session(conn, open.id())
                })?;
                info!(session_id = open.id(), "Admin resumed frozen voting session");
                return Ok(AdminStart::Resumed {
                    session_id: open.id(),
                });
            }
            return Err(ProgressionError::SessionAlreadyActive(open.id()));
        }

        let pick = self.set_initial_target(ctx)?;
        if let TargetPick::NoneAvailable = pick {
            return Err(ProgressionError::NoNodesAvailable);
        }

        match self.start_voting_session(ctx) {
            Ok(start) => Ok(AdminStart::Started { start }),
            Err(ProgressionError::NoNodesAvailable) => match pick {
                TargetPick::Picked { node, level, .. } => {
                    info!(node_key = %node.node_key, "Only one node available, no voting needed");
                    Ok(AdminStart::TargetOnly {
                        node_key: node.node_key,
                        level,
                    })
                }
                _ => Err(ProgressionError::NoNodesAvailable),
            },
            Err(e) => Err(e),
        }
    }

    pub fn admin_end_voting(&self, ctx: &OpContext) -> Result<SessionOption, ProgressionError> {
        self.end_voting(ctx)
    }

    /// End the open ballot and unlock its leader now, with no rollover
    pub fn force_instant_unlock(&self, ctx: &OpContext) -> Result<UnlockResult, ProgressionError> {
        let weights = self.engagement.weights(ctx)?;

        let result = self.db.write(ctx, "force_instant_unlock", |conn| {
            let session = voting::get_active_session(conn)?.ok_or(ProgressionError::NoActiveSession)?;
            let winner = select_winner(&session.options, &mut rand::thread_rng())
                .cloned()
                .ok_or(ProgressionError::NoActiveSession)?;
            let level = winner.option.target_level;

            voting::end_voting_session(conn, session.id(), Some(winner.option.id))?;

            let active = progress::ensure_active_unlock_progress(conn)?;
            progress::set_unlock_target(conn, active.id, winner.node.id, level, Some(session.id()))?;

            let score = engagement::get_engagement_score(conn, None, &weights)?.round() as i32;
            let outcome = nodes::unlock_node(
                conn,
                winner.node.id,
                level,
                unlock_sources::INSTANT_OVERRIDE,
                score,
            )?;
            let next = progress::complete_unlock(conn, active.id, 0)?;

            Ok(UnlockResult {
                node: winner.node,
                level,
                outcome,
                source: unlock_sources::INSTANT_OVERRIDE.to_string(),
                progress_id: active.id,
                next_progress_id: next.id,
                accumulated: active.contributions_accumulated,
                rollover: 0,
            })
        })?;

        info!(node_key = %result.node.node_key, level = result.level, "Forced instant unlock");
        self.after_cycle_unlock(&result);
        self.start_next_cycle_vote(ctx);
        Ok(result)
    }

    /// Wipe shared progression back to the root node
    pub fn reset_progression_tree(
        &self,
        ctx: &OpContext,
        reset_by: &str,
        reason: &str,
        preserve_user_data: bool,
    ) -> Result<ResetSummary, ProgressionError> {
        if reset_by.trim().is_empty() {
            return Err(ProgressionError::InvalidInput("reset_by is required".into()));
        }

        let weights = self.engagement.weights(ctx)?;
        let root = self.settings.root_node_key.clone();
        let summary = self.db.write(ctx, "reset_tree", |conn| {
            reset::reset_tree(conn, reset_by, reason, preserve_user_data, &root, &weights)
        })?;

        self.invalidate_caches();
        info!(reset_by, reason, preserve_user_data, ?summary, "Progression tree reset");
        self.events.emit(ProgressionEvent::TreeReset {
            reset_by: reset_by.to_string(),
            reason: reason.to_string(),
            preserve_user_data,
        });
        Ok(summary)
    }

    // =========================================================================
    // Per-user Progression
    // =========================================================================

    pub fn unlock_user_progression(
        &self,
        ctx: &OpContext,
        user_id: &str,
        progression_type: &str,
        progression_key: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<bool, ProgressionError> {
        self.db.write(ctx, "unlock_user_progression", |conn| {
            user_progression::unlock_user_progression(
                conn,
                user_id,
                progression_type,
                progression_key,
                metadata,
            )
        })
    }

    pub fn is_user_progression_unlocked(
        &self,
        ctx: &OpContext,
        user_id: &str,
        progression_type: &str,
        progression_key: &str,
    ) -> Result<bool, ProgressionError> {
        self.db.read(ctx, "is_user_progression_unlocked", |conn| {
            user_progression::is_user_progression_unlocked(conn, user_id, progression_type, progression_key)
        })
    }

    pub fn get_user_progressions(
        &self,
        ctx: &OpContext,
        user_id: &str,
        progression_type: &str,
    ) -> Result<Vec<UserProgression>, ProgressionError> {
        self.db.read(ctx, "get_user_progressions", |conn| {
            user_progression::get_user_progressions(conn, user_id, progression_type)
        })
    }
}

// ============================================================================
// Decision Helpers
// ============================================================================

pub fn item_node_key(item_name: &str) -> String {
    format!("item_{}", item_name)
}

/// Ballot winner: most votes, then earliest to reach the lead, then lowest
/// option id. With no votes at all the pick is random.
pub fn select_winner<'a, R: Rng + ?Sized>(
    options: &'a [SessionOption],
    rng: &mut R,
) -> Option<&'a SessionOption> {
    if options.iter().all(|o| o.option.vote_count == 0) {
        return options.choose(rng);
    }

    let mut winner = options.first()?;
    for candidate in &options[1..] {
        if beats(&candidate.option, &winner.option) {
            winner = candidate;
        }
    }
    Some(winner)
}

fn beats(candidate: &VotingOption, current: &VotingOption) -> bool {
    if candidate.vote_count != current.vote_count {
        return candidate.vote_count > current.vote_count;
    }
    // Timestamps are fixed-width UTC text, so string order is time order
    match (&candidate.last_highest_vote_at, &current.last_highest_vote_at) {
        (Some(a), Some(b)) if a != b => a < b,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        _ => candidate.id < current.id,
    }
}

fn all_maxed(all: &[ProgressionNode], levels: &HashMap<i32, i32>) -> bool {
    !all.is_empty()
        && all
            .iter()
            .all(|n| levels.get(&n.id).copied().unwrap_or(0) >= n.max_level)
}

/// Not maxed, every static prerequisite unlocked at level 1, every dynamic rule met
fn node_available(conn: &mut SqliteConnection, node: &ProgressionNode) -> Result<bool, ProgressionError> {
    if nodes::get_unlock(conn, node.id, node.max_level)?.is_some() {
        return Ok(false);
    }
    for prereq in nodes::get_prerequisites(conn, node.id)? {
        if nodes::get_unlock(conn, prereq.id, 1)?.is_none() {
            return Ok(false);
        }
    }
    nodes::dynamic_prerequisites_met(conn, node)
}

fn available_nodes(conn: &mut SqliteConnection) -> Result<Vec<ProgressionNode>, ProgressionError> {
    let mut available = Vec::new();
    for node in nodes::get_all_nodes(conn)? {
        if node_available(conn, &node)? {
            available.push(node);
        }
    }
    Ok(available)
}

/// Available nodes plus the locked dependents of the current target, so the
/// next ballot can offer what the target is about to open up
fn available_with_future_target(
    conn: &mut SqliteConnection,
    active: Option<&UnlockProgress>,
) -> Result<Vec<ProgressionNode>, ProgressionError> {
    let mut combined = available_nodes(conn)?;
    let Some(target_id) = active.and_then(|p| p.node_id) else {
        return Ok(combined);
    };

    let mut seen: HashSet<i32> = combined.iter().map(|n| n.id).collect();
    for dependent in nodes::get_dependents(conn, target_id)? {
        if seen.contains(&dependent.id) {
            continue;
        }
        if nodes::get_unlock(conn, dependent.id, dependent.max_level)?.is_none() {
            seen.insert(dependent.id);
            combined.push(dependent);
        }
    }
    Ok(combined)
}

/// Lowest level not yet unlocked (1 when the node is fresh or maxed)
fn next_target_level(conn: &mut SqliteConnection, node: &ProgressionNode) -> Result<i32, ProgressionError> {
    for level in 1..=node.max_level {
        if nodes::get_unlock(conn, node.id, level)?.is_none() {
            return Ok(level);
        }
    }
    Ok(1)
}

/// End the ballot the finished target came from, if it is still open
fn close_target_session(
    conn: &mut SqliteConnection,
    active: &UnlockProgress,
) -> Result<(), ProgressionError> {
    let Some(session_id) = active.voting_session_id else {
        return Ok(());
    };
    if let Some(session) = voting::get_session_by_id(conn, session_id)? {
        if session_status::OPEN.iter().any(|s| *s == session.status()) {
            let option_id = session
                .options
                .iter()
                .find(|o| Some(o.option.node_id) == active.node_id)
                .map(|o| o.option.id);
            voting::end_voting_session(conn, session_id, option_id)?;
        }
    }
    Ok(())
}

/// Next target after an unlock: the open ballot's winner (ending it), else the
/// most recent completed ballot's winner, else a random available node.
/// Carries the deciding ballot's id when a vote picked the target.
fn resolve_next_target<R: Rng + ?Sized>(
    conn: &mut SqliteConnection,
    rng: &mut R,
) -> Result<Option<(ProgressionNode, i32, Option<i32>)>, ProgressionError> {
    let session = match voting::get_active_or_frozen_session(conn)? {
        Some(open) => Some(open),
        None => voting::get_most_recent_session(conn)?
            .filter(|s| s.status() == session_status::COMPLETED),
    };

    if let Some(session) = session {
        let winner = if session.status() == session_status::COMPLETED {
            session
                .session
                .winning_option_id
                .and_then(|id| session.option(id))
                .cloned()
        } else {
            let winner = select_winner(&session.options, rng).cloned();
            voting::end_voting_session(conn, session.id(), winner.as_ref().map(|w| w.option.id))?;
            winner
        };

        if let Some(winner) = winner {
            let level = winner.option.target_level;
            let fresh = nodes::get_unlock(conn, winner.node.id, level)?.is_none();
            if fresh && node_available(conn, &winner.node)? {
                debug!(session_id = session.id(), node_key = %winner.node.node_key, "Next target from voting session");
                return Ok(Some((winner.node, level, Some(session.id()))));
            }
        }
    }

    let available = available_nodes(conn)?;
    match available.choose(rng) {
        Some(node) => {
            let level = next_target_level(conn, node)?;
            debug!(node_key = %node.node_key, "No usable vote, picked random next target");
            Ok(Some((node.clone(), level, None)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_engagement_weights;
    use crate::db::models::{current_timestamp, ModifierConfig};
    use crate::db::nodes::tests::node_input;
    use crate::db::test_db;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    fn option(id: i32, votes: i32, last_highest: Option<&str>) -> SessionOption {
        SessionOption {
            option: VotingOption {
                id,
                session_id: 1,
                node_id: id,
                target_level: 1,
                vote_count: votes,
                last_highest_vote_at: last_highest.map(str::to_string),
            },
            node: ProgressionNode {
                id,
                node_key: format!("node_{}", id),
                node_type: "feature".into(),
                display_name: format!("Node {}", id),
                description: String::new(),
                max_level: 1,
                unlock_cost: 100,
                tier: 1,
                size: "small".into(),
                category: "test".into(),
                sort_order: 0,
                modifier_config: None,
                feature_key: None,
                dynamic_prerequisites: "[]".into(),
                created_at: current_timestamp(),
                updated_at: current_timestamp(),
            },
        }
    }

    fn service() -> (tempfile::TempDir, ProgressionService) {
        let (dir, db) = test_db();
        let db = Arc::new(db);
        let engagement = Arc::new(EngagementService::new(
            db.clone(),
            default_engagement_weights(),
            Duration::from_secs(300),
        ));
        let service = ProgressionService::new(
            db,
            Arc::new(EventBus::new()),
            engagement,
            ProgressionSettings::from_config(&Config::default()).unwrap(),
        );
        (dir, service)
    }

    fn seed(service: &ProgressionService, inputs: &[(&str, i32, i32)]) -> Vec<ProgressionNode> {
        let mut conn = service.db.conn().unwrap();
        inputs
            .iter()
            .map(|(key, tier, cost)| {
                let mut input = node_input(key, *tier);
                input.unlock_cost = *cost;
                nodes::insert_node(&mut conn, &input).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_settings_reject_bad_voting_duration() {
        let settings = ProgressionSettings::from_config(&Config::default()).unwrap();
        assert_eq!(settings.voting_duration, chrono::Duration::hours(24));

        for hours in [0, -5, i64::MAX, i64::MAX / 3_600_000] {
            let config = Config {
                voting_duration_hours: hours,
                ..Default::default()
            };
            assert!(
                matches!(ProgressionSettings::from_config(&config), Err(ProgressionError::Config(_))),
                "hours = {}",
                hours
            );
        }
    }

    #[test]
    fn test_winner_most_votes() {
        let options = vec![option(1, 2, Some("a")), option(2, 5, Some("b")), option(3, 1, None)];
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(select_winner(&options, &mut rng).unwrap().option.id, 2);
    }

    #[test]
    fn test_winner_tie_breaks() {
        let mut rng = StdRng::seed_from_u64(7);

        // earliest to reach the lead
        let options = vec![
            option(1, 3, Some("2024-01-01T00:00:02.000000Z")),
            option(2, 3, Some("2024-01-01T00:00:01.000000Z")),
        ];
        assert_eq!(select_winner(&options, &mut rng).unwrap().option.id, 2);

        // a timestamp beats none
        let options = vec![option(1, 3, None), option(2, 3, Some("2024-01-01T00:00:01.000000Z"))];
        assert_eq!(select_winner(&options, &mut rng).unwrap().option.id, 2);

        // identical timestamps fall back to the lower id
        let options = vec![
            option(4, 3, Some("2024-01-01T00:00:01.000000Z")),
            option(3, 3, Some("2024-01-01T00:00:01.000000Z")),
        ];
        assert_eq!(select_winner(&options, &mut rng).unwrap().option.id, 3);
    }

    #[test]
    fn test_winner_without_votes_is_one_of_the_options() {
        let options = vec![option(1, 0, None), option(2, 0, None), option(3, 0, None)];
        let mut rng = StdRng::seed_from_u64(42);
        let winner = select_winner(&options, &mut rng).unwrap();
        assert!((1..=3).contains(&winner.option.id));

        assert!(select_winner(&[], &mut rng).is_none());
    }

    #[test]
    fn test_single_candidate_is_auto_selected() {
        let (_dir, service) = service();
        seed(&service, &[("feature_buy", 0, 100)]);
        let ctx = OpContext::new();

        match service.start_voting_session(&ctx).unwrap() {
            VotingStart::AutoSelected { node, level, .. } => {
                assert_eq!(node.node_key, "feature_buy");
                assert_eq!(level, 1);
            }
            other => panic!("expected auto-select, got {:?}", other),
        }
        assert!(service.get_active_or_frozen_session(&ctx).unwrap().is_none());
        let active = service.get_unlock_progress(&ctx).unwrap().unwrap();
        assert!(active.has_target());
    }

    #[test]
    fn test_vote_end_and_unlock_cycle() {
        let (_dir, service) = service();
        seed(
            &service,
            &[("feature_a", 0, 100), ("feature_b", 0, 100), ("feature_c", 0, 100)],
        );
        let ctx = OpContext::new();

        let session = match service.start_voting_session(&ctx).unwrap() {
            VotingStart::Started { session } => session,
            other => panic!("expected ballot, got {:?}", other),
        };
        assert_eq!(session.options.len(), 3);
        assert!(matches!(
            service.start_voting_session(&ctx),
            Err(ProgressionError::SessionAlreadyActive(_))
        ));

        service.record_vote(&ctx, "alice", 2).unwrap();
        service.record_vote(&ctx, "bob", 2).unwrap();
        assert!(matches!(
            service.record_vote(&ctx, "alice", 1),
            Err(ProgressionError::AlreadyVoted { .. })
        ));
        assert!(matches!(
            service.record_vote(&ctx, "carol", 9),
            Err(ProgressionError::InvalidInput(_))
        ));

        let winner = service.end_voting(&ctx).unwrap();
        assert_eq!(winner.node.node_key, session.options[1].node.node_key);

        // each accepted vote also earned one vote_cast point
        let outcome = service.add_contribution(&ctx, 150).unwrap();
        let unlock = outcome.unlock.expect("target paid for");
        assert_eq!(unlock.node.node_key, winner.node.node_key);
        assert_eq!(unlock.accumulated, 152);
        assert_eq!(unlock.rollover, 52);
        assert!(service.is_feature_unlocked(&ctx, &winner.node.node_key).unwrap());

        // the next cycle already has a target and starts from the rollover
        let next = service.get_unlock_progress(&ctx).unwrap().unwrap();
        assert_eq!(next.previous_progress_id, Some(unlock.progress_id));
        assert_eq!(next.contributions_accumulated, 52);
        assert!(next.has_target());
    }

    #[test]
    fn test_rollover_is_capped() {
        let (_dir, service) = service();
        seed(&service, &[("feature_a", 0, 100), ("feature_b", 0, 100)]);
        let ctx = OpContext::new();

        service.initialize_progression_state(&ctx).unwrap();
        let unlock = service.add_contribution(&ctx, 1_000).unwrap().unlock.unwrap();
        assert_eq!(unlock.rollover, 200);
    }

    #[test]
    fn test_unlock_cache_invalidated_by_relock() {
        let (_dir, service) = service();
        seed(&service, &[("item_sword", 0, 100)]);
        let ctx = OpContext::new();

        assert!(!service.is_item_unlocked(&ctx, "sword").unwrap());
        service.admin_unlock(&ctx, "item_sword", 1).unwrap();
        assert!(service.is_item_unlocked(&ctx, "sword").unwrap());

        let items = service.are_items_unlocked(&ctx, &["sword", "shield"]).unwrap();
        assert_eq!(items.get("sword"), Some(&true));
        assert_eq!(items.get("shield"), Some(&false));

        assert!(service.admin_relock(&ctx, "item_sword", 1).unwrap());
        assert!(!service.is_item_unlocked(&ctx, "sword").unwrap());
    }

    #[test]
    fn test_modified_value_tracks_unlocks() {
        let (_dir, service) = service();
        {
            let mut conn = service.db.conn().unwrap();
            let mut input = node_input("upgrade_sell_price", 1);
            input.node_type = "upgrade".into();
            input.max_level = 5;
            input.modifier_config = Some(ModifierConfig {
                feature_key: "sell_price".into(),
                modifier_type: "multiplicative".into(),
                base_value: 1.0,
                per_level_value: 0.1,
                max_value: None,
                min_value: None,
            });
            nodes::insert_node(&mut conn, &input).unwrap();
        }
        let ctx = OpContext::new();

        assert_eq!(service.get_modified_value(&ctx, "sell_price", 100.0).unwrap(), 100.0);
        service.admin_unlock(&ctx, "upgrade_sell_price", 3).unwrap();
        let value = service.get_modified_value(&ctx, "sell_price", 100.0).unwrap();
        assert!((value - 130.0).abs() < 1e-9);
        assert_eq!(service.get_modified_value(&ctx, "unknown", 42.0).unwrap(), 42.0);
    }

    #[test]
    fn test_required_nodes_are_transitive() {
        let (_dir, service) = service();
        let seeded = seed(
            &service,
            &[("root", 0, 100), ("mid", 1, 100), ("leaf", 2, 100)],
        );
        {
            let mut conn = service.db.conn().unwrap();
            nodes::sync_prerequisites(&mut conn, seeded[1].id, &[seeded[0].id]).unwrap();
            nodes::sync_prerequisites(&mut conn, seeded[2].id, &[seeded[1].id]).unwrap();
        }
        let ctx = OpContext::new();

        let keys: Vec<String> = service
            .get_required_nodes(&ctx, "leaf")
            .unwrap()
            .into_iter()
            .map(|n| n.node_key)
            .collect();
        assert_eq!(keys, vec!["mid", "root"]);

        service.admin_unlock(&ctx, "root", 1).unwrap();
        let remaining = service.get_required_nodes(&ctx, "leaf").unwrap();
        assert_eq!(remaining.len(), 1);

        let available: Vec<String> = service
            .get_available_unlocks(&ctx)
            .unwrap()
            .into_iter()
            .map(|n| n.node_key)
            .collect();
        assert_eq!(available, vec!["mid"]);
    }

    #[test]
    fn test_freeze_and_admin_start() {
        let (_dir, service) = service();
        seed(
            &service,
            &[("feature_a", 0, 100), ("feature_b", 0, 100), ("feature_c", 0, 100)],
        );
        let ctx = OpContext::new();

        assert!(matches!(
            service.admin_freeze_voting(&ctx),
            Err(ProgressionError::NoActiveSession)
        ));

        match service.admin_start_voting(&ctx).unwrap() {
            AdminStart::Started { .. } => {}
            other => panic!("expected a new ballot, got {:?}", other),
        }
        let session_id = service.admin_freeze_voting(&ctx).unwrap();
        assert!(matches!(
            service.admin_freeze_voting(&ctx),
            Err(ProgressionError::SessionAlreadyFrozen(id)) if id == session_id
        ));
        assert!(matches!(
            service.record_vote(&ctx, "alice", 1),
            Err(ProgressionError::NoActiveSession)
        ));

        match service.admin_start_voting(&ctx).unwrap() {
            AdminStart::Resumed { session_id: resumed } => assert_eq!(resumed, session_id),
            other => panic!("expected resume, got {:?}", other),
        }
    }

    #[test]
    fn test_force_instant_unlock() {
        let (_dir, service) = service();
        seed(
            &service,
            &[("feature_a", 0, 100), ("feature_b", 0, 100), ("feature_c", 0, 100)],
        );
        let ctx = OpContext::new();
        let mut events = service.events.subscribe();

        service.start_voting_session(&ctx).unwrap();
        service.record_vote(&ctx, "alice", 3).unwrap();
        let unlock = service.force_instant_unlock(&ctx).unwrap();

        assert_eq!(unlock.source, "instant_override");
        assert_eq!(unlock.rollover, 0);
        assert!(service.is_feature_unlocked(&ctx, &unlock.node.node_key).unwrap());

        let mut saw_unlock = false;
        while let Ok(event) = events.try_recv() {
            if let ProgressionEvent::NodeUnlocked { node_key, source, .. } = event {
                assert_eq!(node_key, unlock.node.node_key);
                assert_eq!(source, "instant_override");
                saw_unlock = true;
            }
        }
        assert!(saw_unlock);
    }

    #[test]
    fn test_engagement_feeds_contribution() {
        let (_dir, service) = service();
        seed(&service, &[("feature_a", 0, 100), ("feature_b", 0, 100)]);
        let ctx = OpContext::new();
        service.initialize_progression_state(&ctx).unwrap();

        let outcome = service.record_engagement(&ctx, "alice", "command", 3, None).unwrap();
        assert_eq!(outcome.score, 6.0);
        assert_eq!(outcome.contribution, 6);
        assert_eq!(
            service.get_unlock_progress(&ctx).unwrap().unwrap().contributions_accumulated,
            6
        );
    }

    #[test]
    fn test_contribution_boost_scales_amount() {
        let (_dir, service) = service();
        seed(&service, &[("feature_a", 0, 10_000), (CONTRIBUTION_BOOST_NODE, 0, 100)]);
        let ctx = OpContext::new();

        assert_eq!(service.add_contribution(&ctx, 100).unwrap().total, 100);

        service.admin_unlock(&ctx, CONTRIBUTION_BOOST_NODE, 1).unwrap();
        assert_eq!(service.add_contribution(&ctx, 100).unwrap().total, 250);
        // integer division rounds down
        assert_eq!(service.add_contribution(&ctx, 3).unwrap().total, 254);

        service.admin_relock(&ctx, CONTRIBUTION_BOOST_NODE, 1).unwrap();
        assert_eq!(service.add_contribution(&ctx, 100).unwrap().total, 354);
    }

    #[test]
    fn test_status_and_tree() {
        let (_dir, service) = service();
        let seeded = seed(&service, &[("root", 0, 100), ("child", 1, 100)]);
        {
            let mut conn = service.db.conn().unwrap();
            nodes::sync_prerequisites(&mut conn, seeded[1].id, &[seeded[0].id]).unwrap();
        }
        let ctx = OpContext::new();
        service.admin_unlock(&ctx, "root", 1).unwrap();

        let status = service.get_progression_status(&ctx).unwrap();
        assert_eq!(status.total_nodes, 2);
        assert_eq!(status.total_unlocked, 1);
        assert!(!status.all_nodes_unlocked);

        let tree = service.get_progression_tree(&ctx).unwrap();
        let root = tree.iter().find(|n| n.node.node_key == "root").unwrap();
        assert!(root.is_unlocked);
        assert_eq!(root.dependents, vec![seeded[1].id]);

        assert_eq!(service.admin_unlock_all(&ctx).unwrap(), 1);
        assert!(service.get_progression_status(&ctx).unwrap().all_nodes_unlocked);
    }
}
