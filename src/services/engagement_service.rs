//! Engagement service - ledger writes, weights and analytics
//!
//! Weights are read far more often than they change, so they are cached for
//! `weight_cache_ttl_secs` and dropped whenever one is set.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::db::models::{format_timestamp, ContributionBreakdown, LeaderboardEntry};
use crate::db::{engagement, nodes, progress, OpContext, ProgressionDb};
use crate::error::ProgressionError;

pub const DEFAULT_VELOCITY_DAYS: i64 = 7;
pub const DEFAULT_LEADERBOARD_LIMIT: i64 = 10;
pub const MAX_LEADERBOARD_LIMIT: i64 = 100;

/// Direction of daily engagement over the velocity window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VelocityMetrics {
    pub total_points: f64,
    pub points_per_day: f64,
    pub trend: Trend,
    pub period_days: i64,
    /// Days in the window that saw any engagement
    pub sample_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnlockEstimate {
    pub node_key: String,
    pub required_points: i32,
    pub current_progress: i32,
    pub current_velocity: f64,
    /// -1 when nothing is coming in
    pub estimated_days: f64,
    pub confidence: Confidence,
    pub estimated_unlock_date: Option<String>,
}

struct CachedWeights {
    weights: BTreeMap<String, f64>,
    expires_at: Instant,
}

/// TTL cache over the weight table
pub struct WeightCache {
    ttl: Duration,
    cached: RwLock<Option<CachedWeights>>,
}

impl WeightCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cached: RwLock::new(None),
        }
    }

    pub fn get(&self) -> Option<BTreeMap<String, f64>> {
        let guard = self.cached.read().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .filter(|c| Instant::now() < c.expires_at)
            .map(|c| c.weights.clone())
    }

    pub fn store(&self, weights: BTreeMap<String, f64>) {
        let mut guard = self.cached.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(CachedWeights {
            weights,
            expires_at: Instant::now() + self.ttl,
        });
    }

    pub fn invalidate(&self) {
        let mut guard = self.cached.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

/// Engagement service for ledger and analytics
pub struct EngagementService {
    db: Arc<ProgressionDb>,
    weights: WeightCache,
    default_weights: BTreeMap<String, f64>,
}

impl EngagementService {
    pub fn new(
        db: Arc<ProgressionDb>,
        default_weights: BTreeMap<String, f64>,
        weight_cache_ttl: Duration,
    ) -> Self {
        Self {
            db,
            weights: WeightCache::new(weight_cache_ttl),
            default_weights,
        }
    }

    // =========================================================================
    // Weights
    // =========================================================================

    /// Current weights, from cache when fresh
    pub fn weights(&self, ctx: &OpContext) -> Result<BTreeMap<String, f64>, ProgressionError> {
        if let Some(weights) = self.weights.get() {
            return Ok(weights);
        }
        let weights = self.db.read(ctx, "get_engagement_weights", |conn| {
            engagement::get_engagement_weights(conn, &self.default_weights)
        })?;
        self.weights.store(weights.clone());
        Ok(weights)
    }

    pub fn weight_for(&self, ctx: &OpContext, metric_type: &str) -> Result<f64, ProgressionError> {
        Ok(engagement::weight_for(&self.weights(ctx)?, metric_type))
    }

    pub fn set_engagement_weight(
        &self,
        ctx: &OpContext,
        metric_type: &str,
        weight: f64,
        description: Option<&str>,
    ) -> Result<(), ProgressionError> {
        self.db.write(ctx, "set_engagement_weight", |conn| {
            engagement::set_engagement_weight(conn, metric_type, weight, description)
        })?;
        self.invalidate_weight_cache();
        info!(metric_type, weight, "Engagement weight updated");
        Ok(())
    }

    pub fn invalidate_weight_cache(&self) {
        debug!("Invalidating engagement weight cache");
        self.weights.invalidate();
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Append a metric; returns its weighted score
    pub fn record_metric(
        &self,
        ctx: &OpContext,
        user_id: &str,
        metric_type: &str,
        value: i32,
        metadata: Option<&serde_json::Value>,
    ) -> Result<f64, ProgressionError> {
        self.db.write(ctx, "record_engagement", |conn| {
            engagement::record_engagement(conn, user_id, metric_type, value, metadata)
        })?;
        Ok(value as f64 * self.weight_for(ctx, metric_type)?)
    }

    /// Community score, all time or since a timestamp
    pub fn get_engagement_score(
        &self,
        ctx: &OpContext,
        since: Option<chrono::DateTime<Utc>>,
    ) -> Result<f64, ProgressionError> {
        let weights = self.weights(ctx)?;
        let since = since.map(format_timestamp);
        self.db.read(ctx, "get_engagement_score", |conn| {
            engagement::get_engagement_score(conn, since.as_deref(), &weights)
        })
    }

    pub fn get_user_engagement(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<ContributionBreakdown, ProgressionError> {
        let weights = self.weights(ctx)?;
        self.db.read(ctx, "get_user_engagement", |conn| {
            engagement::get_user_engagement(conn, user_id, &weights)
        })
    }

    /// Limits outside 1..=100 fall back to 10
    pub fn get_contribution_leaderboard(
        &self,
        ctx: &OpContext,
        limit: i64,
    ) -> Result<Vec<LeaderboardEntry>, ProgressionError> {
        let limit = if (1..=MAX_LEADERBOARD_LIMIT).contains(&limit) {
            limit
        } else {
            DEFAULT_LEADERBOARD_LIMIT
        };
        self.db.read(ctx, "get_contribution_leaderboard", |conn| {
            engagement::get_contribution_leaderboard(conn, limit)
        })
    }

    // =========================================================================
    // Analytics
    // =========================================================================

    /// Weighted points per day over the last `days` (7 when `days <= 0`)
    pub fn get_engagement_velocity(
        &self,
        ctx: &OpContext,
        days: i64,
    ) -> Result<VelocityMetrics, ProgressionError> {
        let days = if days <= 0 { DEFAULT_VELOCITY_DAYS } else { days };
        let since = chrono::Duration::try_days(days)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .map(format_timestamp)
            .ok_or_else(|| {
                ProgressionError::InvalidInput(format!("velocity window out of range: {} days", days))
            })?;
        let weights = self.weights(ctx)?;

        let totals = self.db.read(ctx, "get_daily_engagement_totals", |conn| {
            engagement::get_daily_engagement_totals(conn, &since, &weights)
        })?;
        Ok(velocity_from_totals(&totals, days))
    }

    /// Days until `node_key` unlocks at the current 7-day pace
    pub fn estimate_unlock_time(
        &self,
        ctx: &OpContext,
        node_key: &str,
    ) -> Result<UnlockEstimate, ProgressionError> {
        let velocity = self.get_engagement_velocity(ctx, DEFAULT_VELOCITY_DAYS)?;

        let (node, active, maxed) = self.db.read(ctx, "estimate_unlock_time", |conn| {
            let node = nodes::get_node_by_key(conn, node_key)?
                .ok_or_else(|| ProgressionError::NodeNotFound(node_key.to_string()))?;
            let active = progress::get_active_unlock_progress(conn)?;
            let maxed = nodes::get_unlock(conn, node.id, node.max_level)?.is_some();
            Ok((node, active, maxed))
        })?;

        if maxed {
            return Ok(UnlockEstimate {
                node_key: node_key.to_string(),
                required_points: 0,
                current_progress: node.unlock_cost,
                current_velocity: velocity.points_per_day,
                estimated_days: 0.0,
                confidence: Confidence::High,
                estimated_unlock_date: Some(format_timestamp(Utc::now())),
            });
        }

        let current_progress = active
            .filter(|p| p.node_id == Some(node.id))
            .map(|p| p.contributions_accumulated)
            .unwrap_or(0);
        let required_points = (node.unlock_cost - current_progress).max(0);

        let (estimated_days, estimated_unlock_date) = if velocity.points_per_day > 0.0 {
            let days = required_points as f64 / velocity.points_per_day;
            // no date when the estimate lands past the calendar
            let at = chrono::Duration::try_seconds((days * 86_400.0) as i64)
                .and_then(|wait| Utc::now().checked_add_signed(wait))
                .map(format_timestamp);
            (days, at)
        } else {
            (-1.0, None)
        };

        Ok(UnlockEstimate {
            node_key: node_key.to_string(),
            required_points,
            current_progress,
            current_velocity: velocity.points_per_day,
            estimated_days,
            confidence: confidence_for(&velocity),
            estimated_unlock_date,
        })
    }
}

/// Average over the whole window; trend compares the first and second half
/// of the days that had activity.
pub fn velocity_from_totals(totals: &BTreeMap<NaiveDate, f64>, days: i64) -> VelocityMetrics {
    let sample_size = totals.len();
    let total_points: f64 = totals.values().sum();
    let points_per_day = if days > 0 { total_points / days as f64 } else { 0.0 };

    let mut trend = Trend::Stable;
    if sample_size >= 2 {
        let daily: Vec<f64> = totals.values().copied().collect();
        let half = sample_size / 2;
        let first_avg = daily[..half].iter().sum::<f64>() / half as f64;
        let second_avg = daily[half..].iter().sum::<f64>() / (sample_size - half) as f64;

        if second_avg > first_avg * 1.1 {
            trend = Trend::Increasing;
        } else if second_avg < first_avg * 0.9 {
            trend = Trend::Decreasing;
        }
    }

    VelocityMetrics {
        total_points,
        points_per_day,
        trend,
        period_days: days,
        sample_size,
    }
}

pub fn confidence_for(velocity: &VelocityMetrics) -> Confidence {
    if velocity.sample_size >= 7 {
        match velocity.trend {
            Trend::Stable | Trend::Increasing => Confidence::High,
            Trend::Decreasing => Confidence::Medium,
        }
    } else if velocity.sample_size >= 3 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}
