//! Progression tree definition file
//!
//! The tree is authored as JSON and synced into the catalog tables on
//! startup. Unlock costs are derived from tier and size, never written by
//! hand.
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "description": "Community unlocks",
//!   "nodes": [
//!     {"key": "progression_system", "name": "Progression", "type": "system",
//!      "tier": 0, "size": "small", "max_level": 1, "category": "core",
//!      "auto_unlock": true},
//!     {"key": "feature_buy", "name": "Buy", "type": "feature", "tier": 1,
//!      "size": "medium", "max_level": 1, "category": "economy",
//!      "prerequisites": ["progression_system"]}
//!   ]
//! }
//! ```

pub mod cost;
pub mod loader;
pub mod prerequisite;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::db::models::{node_sizes, node_types, modifier_types, ModifierConfig, NodeInput};
use crate::db::nodes::find_cycle;
use crate::error::ProgressionError;

pub use cost::calculate_unlock_cost;
pub use loader::{load, sync_to_database, SyncResult};
pub use prerequisite::{parse_prerequisite, split_prerequisites, Prerequisite};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub key: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tier: i32,
    pub size: String,
    pub max_level: i32,
    pub category: String,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub auto_unlock: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier_config: Option<ModifierConfig>,
}

impl NodeConfig {
    /// Catalog row this config entry syncs to
    pub fn to_input(&self) -> Result<NodeInput, ProgressionError> {
        Ok(NodeInput {
            node_key: self.key.clone(),
            node_type: self.node_type.clone(),
            display_name: self.name.clone(),
            description: self.description.clone(),
            max_level: self.max_level,
            unlock_cost: calculate_unlock_cost(self.tier, &self.size)?,
            tier: self.tier,
            size: self.size.clone(),
            category: self.category.clone(),
            sort_order: self.sort_order,
            modifier_config: self.modifier_config.clone(),
        })
    }
}

impl TreeConfig {
    /// Structural checks run before anything touches the database
    pub fn validate(&self) -> Result<(), ProgressionError> {
        if self.nodes.is_empty() {
            return Err(ProgressionError::Config("tree has no nodes".into()));
        }

        let mut keys: HashSet<&str> = HashSet::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            validate_node(node).map_err(|e| ProgressionError::Config(format!("node[{}]: {}", i, e)))?;
            if !keys.insert(node.key.as_str()) {
                return Err(ProgressionError::Config(format!(
                    "duplicate node key: {}",
                    node.key
                )));
            }
        }

        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        for node in &self.nodes {
            let (static_keys, _) = split_prerequisites(&node.prerequisites)
                .map_err(|e| ProgressionError::Config(format!("node {}: {}", node.key, e)))?;
            for prereq in &static_keys {
                if !keys.contains(prereq.as_str()) {
                    return Err(ProgressionError::Config(format!(
                        "node {} has unknown prerequisite: {}",
                        node.key, prereq
                    )));
                }
            }
            graph.insert(node.key.clone(), static_keys);
        }

        if let Some(key) = find_cycle(&graph) {
            return Err(ProgressionError::CycleDetected(key));
        }
        Ok(())
    }

    /// Nodes ordered so every static prerequisite precedes its dependents.
    ///
    /// Errors when a pass makes no progress, which only happens on a cycle
    /// or a dangling key.
    pub fn dependency_order(&self) -> Result<Vec<&NodeConfig>, ProgressionError> {
        let mut ordered: Vec<&NodeConfig> = Vec::with_capacity(self.nodes.len());
        let mut placed: HashSet<&str> = HashSet::with_capacity(self.nodes.len());
        let mut remaining: Vec<&NodeConfig> = self.nodes.iter().collect();

        while !remaining.is_empty() {
            let before = remaining.len();
            let mut deferred = Vec::new();
            for node in remaining {
                let (static_keys, _) = split_prerequisites(&node.prerequisites)?;
                if static_keys.iter().all(|k| placed.contains(k.as_str())) {
                    placed.insert(node.key.as_str());
                    ordered.push(node);
                } else {
                    deferred.push(node);
                }
            }
            if deferred.len() == before {
                let stuck: Vec<&str> = deferred.iter().map(|n| n.key.as_str()).collect();
                return Err(ProgressionError::Config(format!(
                    "unresolvable prerequisites for: {}",
                    stuck.join(", ")
                )));
            }
            remaining = deferred;
        }
        Ok(ordered)
    }
}

fn validate_node(node: &NodeConfig) -> Result<(), String> {
    if node.key.trim().is_empty() {
        return Err("key is required".into());
    }
    if node.name.trim().is_empty() {
        return Err(format!("{}: name is required", node.key));
    }
    if !node_types::is_valid(&node.node_type) {
        return Err(format!("{}: invalid type '{}'", node.key, node.node_type));
    }
    if node.category.trim().is_empty() {
        return Err(format!("{}: category is required", node.key));
    }
    if node.max_level <= 0 {
        return Err(format!("{}: max_level must be > 0", node.key));
    }
    if node.tier < 0 {
        return Err(format!("{}: tier must be >= 0", node.key));
    }
    if !node_sizes::is_valid(&node.size) {
        return Err(format!("{}: invalid size '{}'", node.key, node.size));
    }
    if let Some(modifier) = &node.modifier_config {
        if modifier.feature_key.trim().is_empty() {
            return Err(format!("{}: modifier feature_key is required", node.key));
        }
        if !modifier_types::is_valid(&modifier.modifier_type) {
            return Err(format!(
                "{}: invalid modifier type '{}'",
                node.key, modifier.modifier_type
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn node(key: &str, tier: i32, prerequisites: &[&str]) -> NodeConfig {
        NodeConfig {
            key: key.into(),
            name: key.replace('_', " "),
            node_type: "feature".into(),
            tier,
            size: "small".into(),
            max_level: 1,
            category: "test".into(),
            prerequisites: prerequisites.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn tree(nodes: Vec<NodeConfig>) -> TreeConfig {
        TreeConfig {
            version: "1.0".into(),
            description: String::new(),
            nodes,
        }
    }

    #[test]
    fn test_valid_tree() {
        let config = tree(vec![
            node("root", 0, &[]),
            node("a", 1, &["root"]),
            node("b", 2, &["a", "-nodes_unlocked_below_tier:2:1"]),
        ]);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_nodes() {
        assert!(tree(vec![]).validate().is_err());
        assert!(tree(vec![node("a", 0, &[]), node("a", 1, &[])]).validate().is_err());
        assert!(tree(vec![node("a", -1, &[])]).validate().is_err());
        assert!(tree(vec![node("a", 0, &["missing"])]).validate().is_err());
        assert!(tree(vec![node("a", 0, &["-total_nodes_unlocked:0"])]).validate().is_err());

        let mut bad_size = node("a", 0, &[]);
        bad_size.size = "huge".into();
        assert!(tree(vec![bad_size]).validate().is_err());

        let mut bad_type = node("a", 0, &[]);
        bad_type.node_type = "quest".into();
        assert!(tree(vec![bad_type]).validate().is_err());

        let mut no_level = node("a", 0, &[]);
        no_level.max_level = 0;
        assert!(tree(vec![no_level]).validate().is_err());
    }

    #[test]
    fn test_rejects_cycles() {
        let config = tree(vec![
            node("a", 0, &["c"]),
            node("b", 0, &["a"]),
            node("c", 0, &["b"]),
        ]);
        assert!(matches!(config.validate(), Err(ProgressionError::CycleDetected(_))));
    }

    #[test]
    fn test_dependency_order() {
        let config = tree(vec![
            node("c", 2, &["b"]),
            node("b", 1, &["a"]),
            node("a", 0, &[]),
        ]);
        let order: Vec<&str> = config
            .dependency_order()
            .unwrap()
            .iter()
            .map(|n| n.key.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{
            "version": "1.0",
            "nodes": [{"key": "item_sword", "name": "Sword", "type": "item",
                       "tier": 1, "size": "large", "max_level": 1, "category": "combat"}]
        }"#;
        let config: TreeConfig = serde_json::from_str(json).unwrap();
        let input = config.nodes[0].to_input().unwrap();
        assert_eq!(input.node_type, "item");
        assert_eq!(input.unlock_cost, 600);
    }
}
