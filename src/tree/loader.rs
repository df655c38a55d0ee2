//! Tree file loading and catalog sync

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use diesel::SqliteConnection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{split_prerequisites, NodeConfig, TreeConfig};
use crate::db::models::{current_timestamp, format_timestamp, unlock_sources, ProgressionNode, SyncMetadata};
use crate::db::{nodes, sync_metadata, OpContext, ProgressionDb};
use crate::error::ProgressionError;

/// Key the tree file's sync metadata is stored under
pub const SYNC_CONFIG_NAME: &str = "progression_tree.json";

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResult {
    /// True when the file matched the last sync and nothing was touched
    pub unchanged: bool,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub auto_unlocked: Vec<ProgressionNode>,
}

/// Read, parse and validate a tree file
pub fn load<P: AsRef<Path>>(path: P) -> Result<TreeConfig, ProgressionError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let config: TreeConfig = serde_json::from_str(&contents)
        .map_err(|e| ProgressionError::Config(format!("{}: {}", path.display(), e)))?;
    config.validate()?;
    info!(path = %path.display(), nodes = config.nodes.len(), version = %config.version, "Loaded progression tree");
    Ok(config)
}

/// Fingerprint of the file on disk: sha256 hex and mtime
fn fingerprint(path: &Path) -> Result<(String, String), ProgressionError> {
    let data = fs::read(path)?;
    let hash = hex::encode(Sha256::digest(&data));
    let modified = fs::metadata(path)?.modified()?;
    Ok((hash, format_timestamp(modified.into())))
}

/// Bring the catalog in line with `config`.
///
/// Skipped entirely when the file hash and mtime match the last sync, unless
/// `force` is set. Inserts, updates and auto-unlocks share one transaction.
pub fn sync_to_database(
    db: &ProgressionDb,
    ctx: &OpContext,
    config: &TreeConfig,
    path: &Path,
    force: bool,
) -> Result<SyncResult, ProgressionError> {
    let (file_hash, file_mod_time) = fingerprint(path)?;

    if !force {
        let previous = db.read(ctx, "tree_sync_check", |conn| {
            sync_metadata::get_sync_metadata(conn, SYNC_CONFIG_NAME)
        })?;
        if let Some(meta) = previous {
            if meta.file_hash == file_hash && meta.file_mod_time == file_mod_time {
                info!(path = %path.display(), "Progression tree unchanged, skipping sync");
                return Ok(SyncResult {
                    unchanged: true,
                    ..Default::default()
                });
            }
        }
    }

    let ordered = config.dependency_order()?;

    let result = db.write(ctx, "tree_sync", |conn| {
        let mut ids_by_key: HashMap<String, i32> = nodes::get_all_nodes(conn)?
            .into_iter()
            .map(|n| (n.node_key, n.id))
            .collect();
        let mut result = SyncResult::default();

        for node_config in ordered {
            sync_one_node(conn, node_config, &mut ids_by_key, &mut result)
                .map_err(|e| match e {
                    ProgressionError::InvalidInput(msg) => {
                        ProgressionError::Config(format!("node {}: {}", node_config.key, msg))
                    }
                    other => other,
                })?;
        }
        Ok(result)
    })?;

    info!(
        inserted = result.inserted,
        updated = result.updated,
        skipped = result.skipped,
        auto_unlocked = result.auto_unlocked.len(),
        "Progression tree sync completed"
    );

    let metadata = SyncMetadata {
        config_name: SYNC_CONFIG_NAME.to_string(),
        last_sync_time: current_timestamp(),
        file_hash,
        file_mod_time,
    };
    if let Err(e) = db.write(ctx, "tree_sync_metadata", |conn| {
        sync_metadata::upsert_sync_metadata(conn, &metadata)
    }) {
        warn!(error = %e, "Failed to update sync metadata");
    }

    Ok(result)
}

fn sync_one_node(
    conn: &mut SqliteConnection,
    node_config: &NodeConfig,
    ids_by_key: &mut HashMap<String, i32>,
    result: &mut SyncResult,
) -> Result<(), ProgressionError> {
    let input = node_config.to_input()?;
    let (static_keys, dynamic_rules) = split_prerequisites(&node_config.prerequisites)?;

    let mut prerequisite_ids = Vec::with_capacity(static_keys.len());
    for key in &static_keys {
        let id = ids_by_key
            .get(key)
            .copied()
            .ok_or_else(|| ProgressionError::NodeNotFound(key.clone()))?;
        prerequisite_ids.push(id);
    }

    match nodes::get_node_by_key(conn, &node_config.key)? {
        Some(existing) => {
            let current_prereqs: BTreeSet<String> = nodes::get_prerequisites(conn, existing.id)?
                .into_iter()
                .map(|n| n.node_key)
                .collect();
            let wanted_prereqs: BTreeSet<String> = static_keys.iter().cloned().collect();

            let changed = node_changed(&existing, node_config, input.unlock_cost)?
                || current_prereqs != wanted_prereqs
                || existing.dynamic_rules()? != dynamic_rules;

            if changed {
                nodes::update_node(conn, existing.id, &input)?;
                nodes::sync_prerequisites(conn, existing.id, &prerequisite_ids)?;
                nodes::update_node_dynamic_prerequisites(conn, existing.id, &dynamic_rules)?;
                result.updated += 1;
                info!(node_key = %node_config.key, "Updated progression node");
            } else {
                result.skipped += 1;
            }
        }
        None => {
            let node = nodes::insert_node(conn, &input)?;
            ids_by_key.insert(node.node_key.clone(), node.id);
            nodes::sync_prerequisites(conn, node.id, &prerequisite_ids)?;
            nodes::update_node_dynamic_prerequisites(conn, node.id, &dynamic_rules)?;
            result.inserted += 1;
            info!(node_key = %node.node_key, id = node.id, "Inserted progression node");

            if node_config.auto_unlock {
                match nodes::unlock_node(conn, node.id, 1, unlock_sources::AUTO, 0) {
                    Ok(outcome) => {
                        if outcome.is_new() {
                            debug!(node_key = %node.node_key, "Auto-unlocked node");
                            result.auto_unlocked.push(node);
                        }
                    }
                    Err(e) => {
                        warn!(node_key = %node.node_key, error = %e, "Failed to auto-unlock node");
                    }
                }
            }
        }
    }
    Ok(())
}

fn node_changed(
    existing: &ProgressionNode,
    config: &NodeConfig,
    unlock_cost: i32,
) -> Result<bool, ProgressionError> {
    Ok(existing.display_name != config.name
        || existing.description != config.description
        || existing.max_level != config.max_level
        || existing.sort_order != config.sort_order
        || existing.node_type != config.node_type
        || existing.tier != config.tier
        || existing.size != config.size
        || existing.category != config.category
        || existing.unlock_cost != unlock_cost
        || existing.modifier()? != config.modifier_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::tree::tests::node;

    fn write_tree(dir: &Path, config: &TreeConfig) -> std::path::PathBuf {
        let path = dir.join("progression_tree.json");
        fs::write(&path, serde_json::to_string_pretty(config).unwrap()).unwrap();
        path
    }

    fn sample_tree() -> TreeConfig {
        let mut root = node("progression_system", 0, &[]);
        root.node_type = "system".into();
        root.auto_unlock = true;
        TreeConfig {
            version: "1.0".into(),
            description: "test".into(),
            nodes: vec![
                node("feature_sell", 1, &["feature_buy"]),
                node("feature_buy", 1, &["progression_system"]),
                root,
                node("feature_gamble", 2, &["feature_buy", "-nodes_unlocked_below_tier:2:2"]),
            ],
        }
    }

    #[test]
    fn test_initial_sync_and_skip() {
        let (dir, db) = test_db();
        let ctx = OpContext::new();
        let config = sample_tree();
        let path = write_tree(dir.path(), &config);

        let result = sync_to_database(&db, &ctx, &config, &path, false).unwrap();
        assert_eq!(result.inserted, 4);
        assert_eq!(result.auto_unlocked.len(), 1);
        assert_eq!(result.auto_unlocked[0].node_key, "progression_system");

        let mut conn = db.conn().unwrap();
        let gamble = nodes::get_node_by_key(&mut conn, "feature_gamble").unwrap().unwrap();
        assert_eq!(nodes::get_prerequisites(&mut conn, gamble.id).unwrap().len(), 1);
        assert_eq!(gamble.dynamic_rules().unwrap().len(), 1);
        assert_eq!(gamble.unlock_cost, 225);
        assert!(nodes::is_node_unlocked(&mut conn, "progression_system", 1).unwrap());
        drop(conn);

        let again = sync_to_database(&db, &ctx, &config, &path, false).unwrap();
        assert!(again.unchanged);
        assert_eq!(again.inserted, 0);
    }

    #[test]
    fn test_changed_file_updates_nodes() {
        let (dir, db) = test_db();
        let ctx = OpContext::new();
        let mut config = sample_tree();
        let path = write_tree(dir.path(), &config);
        sync_to_database(&db, &ctx, &config, &path, false).unwrap();

        config.nodes[0].name = "Sell Items".into();
        config.nodes[0].prerequisites = vec!["progression_system".into()];
        let path = write_tree(dir.path(), &config);

        let result = sync_to_database(&db, &ctx, &config, &path, false).unwrap();
        assert!(!result.unchanged);
        assert_eq!(result.inserted, 0);
        assert_eq!(result.updated, 1);
        assert_eq!(result.skipped, 3);
        assert!(result.auto_unlocked.is_empty());

        let mut conn = db.conn().unwrap();
        let sell = nodes::get_node_by_key(&mut conn, "feature_sell").unwrap().unwrap();
        assert_eq!(sell.display_name, "Sell Items");
        let prereqs = nodes::get_prerequisites(&mut conn, sell.id).unwrap();
        assert_eq!(prereqs[0].node_key, "progression_system");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let (dir, _db) = test_db();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"nodes": []}"#).unwrap();
        assert!(matches!(load(&path), Err(ProgressionError::Config(_))));

        fs::write(&path, "not json").unwrap();
        assert!(matches!(load(&path), Err(ProgressionError::Config(_))));
    }
}
