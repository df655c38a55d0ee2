//! Feature value modifiers
//!
//! Unlocked nodes can carry a `ModifierConfig` that changes a numeric
//! feature value (sell price, progression rate, cooldown...). Modifiers for
//! the same feature stack in node sort order.

use dashmap::DashMap;
use tracing::{trace, warn};

use crate::db::models::{modifier_types, ModifierConfig, NodeWithLevel};

/// Apply one modifier at `level`; level 0 (locked) leaves the value unchanged
pub fn apply_modifier(modifier: &ModifierConfig, level: i32, value: f64) -> f64 {
    if level <= 0 {
        return value;
    }

    let effect = modifier.base_value + modifier.per_level_value * level as f64;
    let result = match modifier.modifier_type.as_str() {
        modifier_types::MULTIPLICATIVE => value * effect,
        modifier_types::ADDITIVE => value + effect,
        modifier_types::FIXED => effect,
        other => {
            warn!(modifier_type = other, feature = %modifier.feature_key, "Unknown modifier type, ignoring");
            return value;
        }
    };

    clamp(result, modifier.min_value, modifier.max_value)
}

fn clamp(value: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let mut value = value;
    if let Some(max) = max {
        value = value.min(max);
    }
    if let Some(min) = min {
        value = value.max(min);
    }
    value
}

/// Fold every unlocked modifier over `base_value`, in the given order
pub fn stack_modifiers(nodes: &[NodeWithLevel], base_value: f64) -> f64 {
    let mut value = base_value;
    for entry in nodes {
        match entry.node.modifier() {
            Ok(Some(modifier)) => value = apply_modifier(&modifier, entry.unlocked_level, value),
            Ok(None) => {}
            Err(e) => {
                warn!(node_key = %entry.node.node_key, error = %e, "Unreadable modifier config, skipping");
            }
        }
    }
    value
}

/// Hot cache of modified values keyed by `(feature, base value)`
#[derive(Default)]
pub struct ModifierCache {
    values: DashMap<(String, u64), f64>,
}

impl ModifierCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, feature_key: &str, base_value: f64) -> Option<f64> {
        self.values
            .get(&(feature_key.to_string(), base_value.to_bits()))
            .map(|v| *v)
    }

    pub fn insert(&self, feature_key: &str, base_value: f64, value: f64) {
        self.values
            .insert((feature_key.to_string(), base_value.to_bits()), value);
    }

    /// Drop everything; called on any unlock, relock or reset
    pub fn invalidate_all(&self) {
        trace!(entries = self.values.len(), "Invalidating modifier cache");
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{current_timestamp, ProgressionNode};

    fn rate(modifier_type: &str) -> ModifierConfig {
        ModifierConfig {
            feature_key: "progression_rate".into(),
            modifier_type: modifier_type.into(),
            base_value: 1.0,
            per_level_value: 0.1,
            max_value: None,
            min_value: None,
        }
    }

    fn node_with(modifier: &ModifierConfig, sort_order: i32, level: i32) -> NodeWithLevel {
        NodeWithLevel {
            node: ProgressionNode {
                id: sort_order,
                node_key: format!("upgrade_{}", sort_order),
                node_type: "upgrade".into(),
                display_name: "Upgrade".into(),
                description: String::new(),
                max_level: 5,
                unlock_cost: 100,
                tier: 1,
                size: "small".into(),
                category: "upgrades".into(),
                sort_order,
                modifier_config: Some(serde_json::to_string(modifier).unwrap()),
                feature_key: Some(modifier.feature_key.clone()),
                dynamic_prerequisites: "[]".into(),
                created_at: current_timestamp(),
                updated_at: current_timestamp(),
            },
            unlocked_level: level,
        }
    }

    #[test]
    fn test_multiplicative_levels() {
        let m = rate("multiplicative");
        assert!((apply_modifier(&m, 1, 100.0) - 110.0).abs() < 1e-9);
        assert!((apply_modifier(&m, 3, 100.0) - 130.0).abs() < 1e-9);
        assert!((apply_modifier(&m, 5, 100.0) - 150.0).abs() < 1e-9);
        assert_eq!(apply_modifier(&m, 0, 100.0), 100.0);
    }

    #[test]
    fn test_additive_fixed_and_clamp() {
        let additive = ModifierConfig {
            base_value: 5.0,
            per_level_value: 2.0,
            ..rate("additive")
        };
        assert_eq!(apply_modifier(&additive, 2, 10.0), 19.0);

        let fixed = ModifierConfig {
            base_value: 30.0,
            per_level_value: -5.0,
            min_value: Some(15.0),
            ..rate("fixed")
        };
        assert_eq!(apply_modifier(&fixed, 1, 999.0), 25.0);
        assert_eq!(apply_modifier(&fixed, 4, 999.0), 15.0);

        let capped = ModifierConfig {
            max_value: Some(1.2),
            ..rate("multiplicative")
        };
        assert_eq!(apply_modifier(&capped, 5, 1.0), 1.2);

        assert_eq!(apply_modifier(&rate("exponential"), 3, 7.0), 7.0);
    }

    #[test]
    fn test_stacking_in_order() {
        let mult = rate("multiplicative");
        let add = ModifierConfig {
            base_value: 10.0,
            per_level_value: 0.0,
            ..rate("additive")
        };

        // (100 * 1.1) + 10
        let nodes = vec![node_with(&mult, 0, 1), node_with(&add, 1, 1)];
        assert!((stack_modifiers(&nodes, 100.0) - 120.0).abs() < 1e-9);

        // (100 + 10) * 1.1
        let nodes = vec![node_with(&add, 0, 1), node_with(&mult, 1, 1)];
        assert!((stack_modifiers(&nodes, 100.0) - 121.0).abs() < 1e-9);

        // Locked nodes contribute nothing
        let nodes = vec![node_with(&mult, 0, 0)];
        assert_eq!(stack_modifiers(&nodes, 100.0), 100.0);
    }

    #[test]
    fn test_cache_keys_include_base_value() {
        let cache = ModifierCache::new();
        cache.insert("sell_price", 100.0, 110.0);
        cache.insert("sell_price", 50.0, 55.0);

        assert_eq!(cache.get("sell_price", 100.0), Some(110.0));
        assert_eq!(cache.get("sell_price", 50.0), Some(55.0));
        assert_eq!(cache.get("buy_price", 100.0), None);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
