//! Unlock graph: node catalog, prerequisite edges and unlock facts
//!
//! Functions take a plain `&mut SqliteConnection`; callers that need
//! atomicity across several calls run them inside `ProgressionDb::write`.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use diesel::dsl::{count_distinct, max};
use diesel::prelude::*;
use tracing::{debug, info, warn};

use super::diesel_schema::{progression_nodes, progression_prerequisites, progression_unlocks};
use super::models::{
    current_timestamp, node_sizes, node_types, DynamicPrerequisite, NewProgressionNode,
    NewProgressionUnlock, NodeInput, NodeWithLevel, ProgressionNode, ProgressionUnlock,
    UnlockOutcome,
};
use super::progress;
use crate::error::ProgressionError;

// ============================================================================
// Node Catalog
// ============================================================================

pub fn get_node_by_key(
    conn: &mut SqliteConnection,
    node_key: &str,
) -> Result<Option<ProgressionNode>, ProgressionError> {
    progression_nodes::table
        .filter(progression_nodes::node_key.eq(node_key))
        .first(conn)
        .optional()
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))
}

pub fn get_node_by_id(
    conn: &mut SqliteConnection,
    node_id: i32,
) -> Result<Option<ProgressionNode>, ProgressionError> {
    progression_nodes::table
        .find(node_id)
        .first(conn)
        .optional()
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))
}

/// Fetch a node or fail with `NodeNotFound`
pub fn require_node(
    conn: &mut SqliteConnection,
    node_id: i32,
) -> Result<ProgressionNode, ProgressionError> {
    get_node_by_id(conn, node_id)?
        .ok_or_else(|| ProgressionError::NodeNotFound(format!("id {}", node_id)))
}

/// All nodes in display order (tier, then sort order, then key)
pub fn get_all_nodes(conn: &mut SqliteConnection) -> Result<Vec<ProgressionNode>, ProgressionError> {
    progression_nodes::table
        .order((
            progression_nodes::tier.asc(),
            progression_nodes::sort_order.asc(),
            progression_nodes::node_key.asc(),
        ))
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))
}

fn validate_node_input(input: &NodeInput) -> Result<(), ProgressionError> {
    if input.node_key.trim().is_empty() {
        return Err(ProgressionError::InvalidInput("node_key is required".into()));
    }
    if input.display_name.trim().is_empty() {
        return Err(ProgressionError::InvalidInput(format!(
            "display_name is required for '{}'",
            input.node_key
        )));
    }
    if !node_types::is_valid(&input.node_type) {
        return Err(ProgressionError::InvalidInput(format!(
            "invalid node_type '{}' for '{}'",
            input.node_type, input.node_key
        )));
    }
    if !node_sizes::is_valid(&input.size) {
        return Err(ProgressionError::InvalidInput(format!(
            "invalid size '{}' for '{}'",
            input.size, input.node_key
        )));
    }
    if input.max_level <= 0 {
        return Err(ProgressionError::InvalidInput(format!(
            "max_level must be > 0 for '{}'",
            input.node_key
        )));
    }
    if input.tier < 0 || input.unlock_cost < 0 {
        return Err(ProgressionError::InvalidInput(format!(
            "tier and unlock_cost must be >= 0 for '{}'",
            input.node_key
        )));
    }
    Ok(())
}

fn modifier_columns(input: &NodeInput) -> Result<(Option<String>, Option<String>), ProgressionError> {
    match &input.modifier_config {
        Some(modifier) => Ok((
            Some(serde_json::to_string(modifier)?),
            Some(modifier.feature_key.clone()),
        )),
        None => Ok((None, None)),
    }
}

/// Insert a catalog node; returns the stored row
pub fn insert_node(
    conn: &mut SqliteConnection,
    input: &NodeInput,
) -> Result<ProgressionNode, ProgressionError> {
    validate_node_input(input)?;
    let (modifier_json, feature_key) = modifier_columns(input)?;
    let now = current_timestamp();

    let new_node = NewProgressionNode {
        node_key: &input.node_key,
        node_type: &input.node_type,
        display_name: &input.display_name,
        description: &input.description,
        max_level: input.max_level,
        unlock_cost: input.unlock_cost,
        tier: input.tier,
        size: &input.size,
        category: &input.category,
        sort_order: input.sort_order,
        modifier_config: modifier_json,
        feature_key: feature_key.as_deref(),
        dynamic_prerequisites: "[]",
        created_at: &now,
        updated_at: &now,
    };

    diesel::insert_into(progression_nodes::table)
        .values(&new_node)
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Insert failed: {}", e)))?;

    debug!(node_key = %input.node_key, "Inserted progression node");

    get_node_by_key(conn, &input.node_key)?
        .ok_or_else(|| ProgressionError::Internal(format!("Node '{}' missing after insert", input.node_key)))
}

/// Update display and metadata fields; the key never changes
pub fn update_node(
    conn: &mut SqliteConnection,
    node_id: i32,
    input: &NodeInput,
) -> Result<ProgressionNode, ProgressionError> {
    validate_node_input(input)?;
    let (modifier_json, feature_key) = modifier_columns(input)?;

    let updated = diesel::update(progression_nodes::table.find(node_id))
        .set((
            progression_nodes::node_type.eq(&input.node_type),
            progression_nodes::display_name.eq(&input.display_name),
            progression_nodes::description.eq(&input.description),
            progression_nodes::max_level.eq(input.max_level),
            progression_nodes::unlock_cost.eq(input.unlock_cost),
            progression_nodes::tier.eq(input.tier),
            progression_nodes::size.eq(&input.size),
            progression_nodes::category.eq(&input.category),
            progression_nodes::sort_order.eq(input.sort_order),
            progression_nodes::modifier_config.eq(modifier_json),
            progression_nodes::feature_key.eq(feature_key),
            progression_nodes::updated_at.eq(current_timestamp()),
        ))
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Update failed: {}", e)))?;

    if updated == 0 {
        return Err(ProgressionError::NodeNotFound(format!("id {}", node_id)));
    }

    require_node(conn, node_id)
}

// ============================================================================
// Prerequisites
// ============================================================================

/// Direct static prerequisites of a node
pub fn get_prerequisites(
    conn: &mut SqliteConnection,
    node_id: i32,
) -> Result<Vec<ProgressionNode>, ProgressionError> {
    let ids: Vec<i32> = progression_prerequisites::table
        .filter(progression_prerequisites::node_id.eq(node_id))
        .select(progression_prerequisites::prerequisite_node_id)
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Prerequisite query failed: {}", e)))?;

    load_nodes(conn, ids)
}

/// Nodes that list `node_id` as a static prerequisite
pub fn get_dependents(
    conn: &mut SqliteConnection,
    node_id: i32,
) -> Result<Vec<ProgressionNode>, ProgressionError> {
    let ids: Vec<i32> = progression_prerequisites::table
        .filter(progression_prerequisites::prerequisite_node_id.eq(node_id))
        .select(progression_prerequisites::node_id)
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Dependent query failed: {}", e)))?;

    load_nodes(conn, ids)
}

fn load_nodes(
    conn: &mut SqliteConnection,
    ids: Vec<i32>,
) -> Result<Vec<ProgressionNode>, ProgressionError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    progression_nodes::table
        .filter(progression_nodes::id.eq_any(ids))
        .order((progression_nodes::sort_order.asc(), progression_nodes::id.asc()))
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))
}

/// Every `(node_id, prerequisite_node_id)` edge
pub fn get_prerequisite_edges(
    conn: &mut SqliteConnection,
) -> Result<Vec<(i32, i32)>, ProgressionError> {
    progression_prerequisites::table
        .select((
            progression_prerequisites::node_id,
            progression_prerequisites::prerequisite_node_id,
        ))
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Prerequisite query failed: {}", e)))
}

/// Replace a node's static prerequisites wholesale.
///
/// Rejected with `CycleDetected` when the new edge set would make the node
/// reachable from itself.
pub fn sync_prerequisites(
    conn: &mut SqliteConnection,
    node_id: i32,
    prerequisite_ids: &[i32],
) -> Result<(), ProgressionError> {
    let node = require_node(conn, node_id)?;

    let mut wanted: Vec<i32> = Vec::with_capacity(prerequisite_ids.len());
    for &prereq_id in prerequisite_ids {
        if prereq_id == node_id {
            return Err(ProgressionError::CycleDetected(node.node_key.clone()));
        }
        require_node(conn, prereq_id)?;
        if !wanted.contains(&prereq_id) {
            wanted.push(prereq_id);
        }
    }

    let mut graph: HashMap<i32, Vec<i32>> = HashMap::new();
    for (from, to) in get_prerequisite_edges(conn)? {
        if from != node_id {
            graph.entry(from).or_default().push(to);
        }
    }
    graph.insert(node_id, wanted.clone());

    if find_cycle(&graph).is_some() {
        return Err(ProgressionError::CycleDetected(node.node_key));
    }

    conn.transaction(|conn| {
        diesel::delete(
            progression_prerequisites::table.filter(progression_prerequisites::node_id.eq(node_id)),
        )
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Prerequisite clear failed: {}", e)))?;

        for prereq_id in &wanted {
            diesel::insert_into(progression_prerequisites::table)
                .values((
                    progression_prerequisites::node_id.eq(node_id),
                    progression_prerequisites::prerequisite_node_id.eq(prereq_id),
                ))
                .execute(conn)
                .map_err(|e| ProgressionError::Internal(format!("Prerequisite insert failed: {}", e)))?;
        }

        Ok::<_, ProgressionError>(())
    })?;

    debug!(node_key = %node.node_key, count = wanted.len(), "Synced prerequisites");
    Ok(())
}

/// Depth-first search with a visiting set; returns a node on a cycle, if any.
///
/// Keys are visited in sorted order so the reported node is deterministic.
pub fn find_cycle<K>(graph: &HashMap<K, Vec<K>>) -> Option<K>
where
    K: Eq + Hash + Clone + Ord,
{
    fn visit<K: Eq + Hash + Clone>(
        node: &K,
        graph: &HashMap<K, Vec<K>>,
        visiting: &mut HashSet<K>,
        visited: &mut HashSet<K>,
    ) -> Option<K> {
        if visited.contains(node) {
            return None;
        }
        if !visiting.insert(node.clone()) {
            return Some(node.clone());
        }
        if let Some(next) = graph.get(node) {
            for child in next {
                if let Some(found) = visit(child, graph, visiting, visited) {
                    return Some(found);
                }
            }
        }
        visiting.remove(node);
        visited.insert(node.clone());
        None
    }

    let mut keys: Vec<&K> = graph.keys().collect();
    keys.sort();

    let mut visiting = HashSet::new();
    let mut visited = HashSet::new();
    for key in keys {
        if let Some(found) = visit(key, graph, &mut visiting, &mut visited) {
            return Some(found);
        }
    }
    None
}

// ============================================================================
// Dynamic Prerequisites
// ============================================================================

pub fn get_node_dynamic_prerequisites(
    conn: &mut SqliteConnection,
    node_id: i32,
) -> Result<Vec<DynamicPrerequisite>, ProgressionError> {
    require_node(conn, node_id)?.dynamic_rules()
}

pub fn update_node_dynamic_prerequisites(
    conn: &mut SqliteConnection,
    node_id: i32,
    rules: &[DynamicPrerequisite],
) -> Result<(), ProgressionError> {
    for rule in rules {
        rule.validate()?;
    }
    let json = serde_json::to_string(rules)?;

    let updated = diesel::update(progression_nodes::table.find(node_id))
        .set((
            progression_nodes::dynamic_prerequisites.eq(json),
            progression_nodes::updated_at.eq(current_timestamp()),
        ))
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Update failed: {}", e)))?;

    if updated == 0 {
        return Err(ProgressionError::NodeNotFound(format!("id {}", node_id)));
    }
    Ok(())
}

/// Distinct unlocked nodes whose tier is strictly below `tier`
pub fn count_unlocked_nodes_below_tier(
    conn: &mut SqliteConnection,
    tier: i32,
) -> Result<i64, ProgressionError> {
    progression_unlocks::table
        .inner_join(progression_nodes::table)
        .filter(progression_nodes::tier.lt(tier))
        .select(count_distinct(progression_unlocks::node_id))
        .get_result(conn)
        .map_err(|e| ProgressionError::Internal(format!("Count query failed: {}", e)))
}

pub fn count_total_unlocked_nodes(conn: &mut SqliteConnection) -> Result<i64, ProgressionError> {
    progression_unlocks::table
        .select(count_distinct(progression_unlocks::node_id))
        .get_result(conn)
        .map_err(|e| ProgressionError::Internal(format!("Count query failed: {}", e)))
}

/// Whether every dynamic rule on the node holds against live counts
pub fn dynamic_prerequisites_met(
    conn: &mut SqliteConnection,
    node: &ProgressionNode,
) -> Result<bool, ProgressionError> {
    for rule in node.dynamic_rules()? {
        let met = match rule {
            DynamicPrerequisite::NodesUnlockedBelowTier { tier, count } => {
                count_unlocked_nodes_below_tier(conn, tier)? >= count as i64
            }
            DynamicPrerequisite::TotalNodesUnlocked { count } => {
                count_total_unlocked_nodes(conn)? >= count as i64
            }
        };
        if !met {
            return Ok(false);
        }
    }
    Ok(true)
}

// ============================================================================
// Unlocks
// ============================================================================

pub fn is_node_unlocked(
    conn: &mut SqliteConnection,
    node_key: &str,
    level: i32,
) -> Result<bool, ProgressionError> {
    let count: i64 = progression_unlocks::table
        .inner_join(progression_nodes::table)
        .filter(progression_nodes::node_key.eq(node_key))
        .filter(progression_unlocks::current_level.eq(level))
        .count()
        .get_result(conn)
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))?;
    Ok(count > 0)
}

pub fn get_unlock(
    conn: &mut SqliteConnection,
    node_id: i32,
    level: i32,
) -> Result<Option<ProgressionUnlock>, ProgressionError> {
    progression_unlocks::table
        .filter(progression_unlocks::node_id.eq(node_id))
        .filter(progression_unlocks::current_level.eq(level))
        .first(conn)
        .optional()
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))
}

pub fn get_all_unlocks(
    conn: &mut SqliteConnection,
) -> Result<Vec<ProgressionUnlock>, ProgressionError> {
    progression_unlocks::table
        .order((progression_unlocks::unlocked_at.asc(), progression_unlocks::id.asc()))
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))
}

/// Highest unlocked level of a node (0 when locked)
pub fn get_unlocked_level(
    conn: &mut SqliteConnection,
    node_id: i32,
) -> Result<i32, ProgressionError> {
    let level: Option<i32> = progression_unlocks::table
        .filter(progression_unlocks::node_id.eq(node_id))
        .select(max(progression_unlocks::current_level))
        .get_result(conn)
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))?;
    Ok(level.unwrap_or(0))
}

/// Highest unlocked level per node, for nodes with at least one unlock
pub fn get_unlocked_levels(
    conn: &mut SqliteConnection,
) -> Result<HashMap<i32, i32>, ProgressionError> {
    let rows: Vec<(i32, Option<i32>)> = progression_unlocks::table
        .group_by(progression_unlocks::node_id)
        .select((progression_unlocks::node_id, max(progression_unlocks::current_level)))
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))?;

    Ok(rows
        .into_iter()
        .map(|(node_id, level)| (node_id, level.unwrap_or(0)))
        .collect())
}

/// Record `(node, level)` as unlocked.
///
/// Idempotent: a second unlock of the same pair inserts nothing and reports
/// `AlreadyUnlocked`.
pub fn unlock_node(
    conn: &mut SqliteConnection,
    node_id: i32,
    level: i32,
    unlocked_by: &str,
    engagement_score: i32,
) -> Result<UnlockOutcome, ProgressionError> {
    let node = require_node(conn, node_id)?;
    if level < 1 {
        return Err(ProgressionError::InvalidInput(format!(
            "level must be >= 1, got {}",
            level
        )));
    }
    if level > node.max_level {
        return Err(ProgressionError::MaxLevelExceeded {
            node_key: node.node_key,
            level,
            max_level: node.max_level,
        });
    }

    let now = current_timestamp();
    let inserted = diesel::insert_or_ignore_into(progression_unlocks::table)
        .values(&NewProgressionUnlock {
            node_id,
            current_level: level,
            unlocked_at: &now,
            unlocked_by,
            engagement_score,
        })
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Unlock insert failed: {}", e)))?;

    if inserted == 0 {
        debug!(node_key = %node.node_key, level, "Node already unlocked");
        return Ok(UnlockOutcome::AlreadyUnlocked);
    }

    info!(node_key = %node.node_key, level, unlocked_by, "Node unlocked");
    Ok(UnlockOutcome::Unlocked)
}

/// Remove the unlock for `(node, level)`; returns whether a row existed.
///
/// Also drops any in-flight progress row still targeting the node. That
/// cleanup is best effort.
pub fn relock_node(
    conn: &mut SqliteConnection,
    node_id: i32,
    level: i32,
) -> Result<bool, ProgressionError> {
    let deleted = diesel::delete(
        progression_unlocks::table
            .filter(progression_unlocks::node_id.eq(node_id))
            .filter(progression_unlocks::current_level.eq(level)),
    )
    .execute(conn)
    .map_err(|e| ProgressionError::Internal(format!("Relock failed: {}", e)))?;

    if let Err(e) = progress::clear_unlock_progress_for_node(conn, node_id) {
        warn!(node_id, error = %e, "Failed to clear unlock progress for relocked node");
    }

    if deleted > 0 {
        info!(node_id, level, "Node relocked");
    }
    Ok(deleted > 0)
}

/// Nodes whose modifier targets `feature_key`, with their unlocked level
pub fn get_nodes_by_feature_key(
    conn: &mut SqliteConnection,
    feature_key: &str,
) -> Result<Vec<NodeWithLevel>, ProgressionError> {
    let nodes: Vec<ProgressionNode> = progression_nodes::table
        .filter(progression_nodes::feature_key.eq(feature_key))
        .order((progression_nodes::sort_order.asc(), progression_nodes::id.asc()))
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))?;

    let mut result = Vec::with_capacity(nodes.len());
    for node in nodes {
        let unlocked_level = get_unlocked_level(conn, node.id)?;
        result.push(NodeWithLevel {
            node,
            unlocked_level,
        });
    }
    Ok(result)
}
