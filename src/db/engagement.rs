//! Engagement ledger and weights
//!
//! Metrics are append-only. Scores are computed on read: raw values summed
//! per metric type, multiplied by that type's weight. A type without a
//! weight counts at 1.0.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use diesel::dsl::sum;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use tracing::debug;

use super::diesel_schema::{engagement_metrics, engagement_weights};
use super::models::{
    current_timestamp, metric_types, ContributionBreakdown, EngagementWeight, LeaderboardEntry,
    NewEngagementMetric,
};
use crate::error::ProgressionError;

/// Weight applied to metric types missing from the weight map
pub const FALLBACK_WEIGHT: f64 = 1.0;

pub fn weight_for(weights: &BTreeMap<String, f64>, metric_type: &str) -> f64 {
    weights.get(metric_type).copied().unwrap_or(FALLBACK_WEIGHT)
}

/// Append one engagement event
pub fn record_engagement(
    conn: &mut SqliteConnection,
    user_id: &str,
    metric_type: &str,
    metric_value: i32,
    metadata: Option<&serde_json::Value>,
) -> Result<(), ProgressionError> {
    if user_id.trim().is_empty() {
        return Err(ProgressionError::InvalidInput("user_id is required".into()));
    }
    if metric_type.trim().is_empty() {
        return Err(ProgressionError::InvalidInput("metric_type is required".into()));
    }
    if metric_value < 0 {
        return Err(ProgressionError::InvalidInput(format!(
            "metric_value must be >= 0, got {}",
            metric_value
        )));
    }

    let metadata = metadata.map(serde_json::to_string).transpose()?;
    let now = current_timestamp();

    diesel::insert_into(engagement_metrics::table)
        .values(&NewEngagementMetric {
            user_id,
            metric_type,
            metric_value,
            metadata,
            recorded_at: &now,
        })
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Engagement insert failed: {}", e)))?;

    debug!(user_id, metric_type, metric_value, "Engagement recorded");
    Ok(())
}

// ============================================================================
// Weights
// ============================================================================

pub fn list_engagement_weights(
    conn: &mut SqliteConnection,
) -> Result<Vec<EngagementWeight>, ProgressionError> {
    engagement_weights::table
        .order(engagement_weights::metric_type.asc())
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Weight query failed: {}", e)))
}

/// Stored weights, or `defaults` when the table has never been populated
pub fn get_engagement_weights(
    conn: &mut SqliteConnection,
    defaults: &BTreeMap<String, f64>,
) -> Result<BTreeMap<String, f64>, ProgressionError> {
    let rows = list_engagement_weights(conn)?;
    if rows.is_empty() {
        return Ok(defaults.clone());
    }
    Ok(rows.into_iter().map(|w| (w.metric_type, w.weight)).collect())
}

pub fn set_engagement_weight(
    conn: &mut SqliteConnection,
    metric_type: &str,
    weight: f64,
    description: Option<&str>,
) -> Result<(), ProgressionError> {
    if metric_type.trim().is_empty() {
        return Err(ProgressionError::InvalidInput("metric_type is required".into()));
    }
    if !weight.is_finite() || weight < 0.0 {
        return Err(ProgressionError::InvalidInput(format!(
            "weight must be a finite value >= 0, got {}",
            weight
        )));
    }

    diesel::replace_into(engagement_weights::table)
        .values((
            engagement_weights::metric_type.eq(metric_type),
            engagement_weights::weight.eq(weight),
            engagement_weights::description.eq(description),
            engagement_weights::updated_at.eq(current_timestamp()),
        ))
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Weight upsert failed: {}", e)))?;

    debug!(metric_type, weight, "Engagement weight set");
    Ok(())
}

// ============================================================================
// Aggregates
// ============================================================================

/// Raw totals per metric type, optionally since a timestamp
pub fn get_metric_totals(
    conn: &mut SqliteConnection,
    since: Option<&str>,
) -> Result<BTreeMap<String, i64>, ProgressionError> {
    let rows: Vec<(String, Option<i64>)> = match since {
        Some(since) => engagement_metrics::table
            .filter(engagement_metrics::recorded_at.ge(since))
            .group_by(engagement_metrics::metric_type)
            .select((engagement_metrics::metric_type, sum(engagement_metrics::metric_value)))
            .load(conn),
        None => engagement_metrics::table
            .group_by(engagement_metrics::metric_type)
            .select((engagement_metrics::metric_type, sum(engagement_metrics::metric_value)))
            .load(conn),
    }
    .map_err(|e| ProgressionError::Internal(format!("Engagement query failed: {}", e)))?;

    Ok(rows
        .into_iter()
        .map(|(metric_type, total)| (metric_type, total.unwrap_or(0)))
        .collect())
}

/// Community score: Σ raw total × weight over metric types
pub fn get_engagement_score(
    conn: &mut SqliteConnection,
    since: Option<&str>,
    weights: &BTreeMap<String, f64>,
) -> Result<f64, ProgressionError> {
    let totals = get_metric_totals(conn, since)?;
    Ok(weighted_sum(&totals, weights))
}

fn weighted_sum(totals: &BTreeMap<String, i64>, weights: &BTreeMap<String, f64>) -> f64 {
    totals
        .iter()
        .map(|(metric_type, total)| *total as f64 * weight_for(weights, metric_type))
        .sum()
}

/// One user's raw totals and weighted score
pub fn get_user_engagement(
    conn: &mut SqliteConnection,
    user_id: &str,
    weights: &BTreeMap<String, f64>,
) -> Result<ContributionBreakdown, ProgressionError> {
    let rows: Vec<(String, Option<i64>)> = engagement_metrics::table
        .filter(engagement_metrics::user_id.eq(user_id))
        .group_by(engagement_metrics::metric_type)
        .select((engagement_metrics::metric_type, sum(engagement_metrics::metric_value)))
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Engagement query failed: {}", e)))?;

    let by_metric: BTreeMap<String, i64> = rows
        .into_iter()
        .map(|(metric_type, total)| (metric_type, total.unwrap_or(0)))
        .collect();

    let get = |key: &str| by_metric.get(key).copied().unwrap_or(0);

    Ok(ContributionBreakdown {
        user_id: user_id.to_string(),
        messages_sent: get(metric_types::MESSAGE),
        commands_used: get(metric_types::COMMAND),
        items_crafted: get(metric_types::ITEM_CRAFTED),
        items_used: get(metric_types::ITEM_USED),
        total_score: weighted_sum(&by_metric, weights),
        by_metric,
    })
}

#[derive(QueryableByName)]
struct DailyMetricRow {
    #[diesel(sql_type = Text)]
    day: String,
    #[diesel(sql_type = Text)]
    metric_type: String,
    #[diesel(sql_type = BigInt)]
    total: i64,
}

/// Weighted score per UTC calendar day since `since`
pub fn get_daily_engagement_totals(
    conn: &mut SqliteConnection,
    since: &str,
    weights: &BTreeMap<String, f64>,
) -> Result<BTreeMap<NaiveDate, f64>, ProgressionError> {
    let rows: Vec<DailyMetricRow> = diesel::sql_query(
        "SELECT substr(recorded_at, 1, 10) AS day, metric_type, SUM(metric_value) AS total
         FROM engagement_metrics
         WHERE recorded_at >= ?
         GROUP BY day, metric_type
         ORDER BY day",
    )
    .bind::<Text, _>(since)
    .load(conn)
    .map_err(|e| ProgressionError::Internal(format!("Daily totals query failed: {}", e)))?;

    let mut totals: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for row in rows {
        let day = NaiveDate::parse_from_str(&row.day, "%Y-%m-%d")
            .map_err(|e| ProgressionError::Internal(format!("Bad day '{}': {}", row.day, e)))?;
        *totals.entry(day).or_insert(0.0) += row.total as f64 * weight_for(weights, &row.metric_type);
    }
    Ok(totals)
}

#[derive(QueryableByName)]
struct LeaderboardRow {
    #[diesel(sql_type = Text)]
    user_id: String,
    #[diesel(sql_type = BigInt)]
    contribution: i64,
}

/// Users ranked by all-time raw contribution; ranks are 1..n in order
pub fn get_contribution_leaderboard(
    conn: &mut SqliteConnection,
    limit: i64,
) -> Result<Vec<LeaderboardEntry>, ProgressionError> {
    let rows: Vec<LeaderboardRow> = diesel::sql_query(
        "SELECT user_id, SUM(metric_value) AS contribution
         FROM engagement_metrics
         GROUP BY user_id
         ORDER BY contribution DESC, user_id ASC
         LIMIT ?",
    )
    .bind::<BigInt, _>(limit)
    .load(conn)
    .map_err(|e| ProgressionError::Internal(format!("Leaderboard query failed: {}", e)))?;

    Ok(rows
        .into_iter()
        .enumerate()
        .map(|(i, row)| LeaderboardEntry {
            rank: i as i32 + 1,
            user_id: row.user_id,
            contribution: row.contribution,
        })
        .collect())
}
