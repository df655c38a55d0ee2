//! Unlock cost from tier and size

use crate::db::models::node_sizes;
use crate::error::ProgressionError;

pub const BASE_COST_SMALL: i32 = 100;
pub const BASE_COST_MEDIUM: i32 = 200;
pub const BASE_COST_LARGE: i32 = 400;

/// Cost growth per tier
pub const TIER_MULTIPLIER: f64 = 1.5;

pub fn base_cost(size: &str) -> Result<i32, ProgressionError> {
    match size {
        node_sizes::SMALL => Ok(BASE_COST_SMALL),
        node_sizes::MEDIUM => Ok(BASE_COST_MEDIUM),
        node_sizes::LARGE => Ok(BASE_COST_LARGE),
        other => Err(ProgressionError::InvalidInput(format!(
            "invalid size '{}' (expected small, medium or large)",
            other
        ))),
    }
}

/// `round(base_cost(size) * 1.5^tier)`
pub fn calculate_unlock_cost(tier: i32, size: &str) -> Result<i32, ProgressionError> {
    if tier < 0 {
        return Err(ProgressionError::InvalidInput(format!(
            "tier must be >= 0, got {}",
            tier
        )));
    }
    let cost = base_cost(size)? as f64 * TIER_MULTIPLIER.powi(tier);
    if cost > i32::MAX as f64 {
        return Err(ProgressionError::InvalidInput(format!(
            "unlock cost overflows at tier {}",
            tier
        )));
    }
    Ok(cost.round() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_costs() {
        assert_eq!(calculate_unlock_cost(0, "small").unwrap(), 100);
        assert_eq!(calculate_unlock_cost(0, "large").unwrap(), 400);
        assert_eq!(calculate_unlock_cost(1, "medium").unwrap(), 300);
        assert_eq!(calculate_unlock_cost(2, "small").unwrap(), 225);
        // 100 * 3.375 = 337.5 rounds away from zero
        assert_eq!(calculate_unlock_cost(3, "small").unwrap(), 338);
        assert_eq!(calculate_unlock_cost(4, "large").unwrap(), 2025);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(calculate_unlock_cost(-1, "small").is_err());
        assert!(calculate_unlock_cost(1, "huge").is_err());
        assert!(calculate_unlock_cost(100, "large").is_err());
    }
}
