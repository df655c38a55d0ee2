//! Progression Engine CLI
//!
//! Operates on the progression database directly; every subcommand opens
//! the database, runs one service call and prints JSON.
//!
//! ## Usage
//!
//! ```bash
//! # Sync the tree file and show where the community stands
//! progression-engine --tree progression_tree.json sync-tree
//! progression-engine status
//!
//! # Voting
//! progression-engine start-voting
//! progression-engine vote alice 2
//! progression-engine end-voting
//!
//! # Feed engagement
//! progression-engine record alice command --value 3
//!
//! # Admin
//! progression-engine unlock feature_buy
//! progression-engine reset --by admin --reason "season 2" --preserve-user-data
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use progression_engine::services::spawn_logging_listener;
use progression_engine::{Config, OpContext, ProgressionDb, Services};

#[derive(Parser, Debug)]
#[command(name = "progression-engine")]
#[command(about = "Community feature-unlock progression engine")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "PROGRESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "PROGRESSION_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Progression tree JSON
    #[arg(long, env = "PROGRESSION_TREE")]
    tree: Option<PathBuf>,

    /// Node that survives a reset
    #[arg(long, env = "PROGRESSION_ROOT_NODE")]
    root_node: Option<String>,

    /// Options offered per voting session
    #[arg(long)]
    max_voting_options: Option<usize>,

    /// Cap on points carried into the next cycle
    #[arg(long)]
    max_rollover: Option<i32>,

    /// Hours before a new voting session's deadline
    #[arg(long)]
    voting_hours: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the tree file into the catalog
    SyncTree {
        /// Sync even when the file is unchanged
        #[arg(long)]
        force: bool,
    },
    /// Pick an initial target and open the first vote if needed
    Init,
    /// Overall progression status
    Status,
    /// Every node with its unlock state
    Tree,
    /// Locked prerequisites standing between the community and a node
    Requires { node_key: String },
    /// Admin unlock
    Unlock {
        node_key: String,
        #[arg(long, default_value_t = 1)]
        level: i32,
    },
    /// Admin relock
    Relock {
        node_key: String,
        #[arg(long, default_value_t = 1)]
        level: i32,
    },
    /// Unlock every node at its max level
    UnlockAll,
    /// Reset the tree to the root node
    Reset {
        #[arg(long)]
        by: String,
        #[arg(long, default_value = "")]
        reason: String,
        /// Keep per-user progression rows
        #[arg(long)]
        preserve_user_data: bool,
    },
    /// Resume a frozen vote or open a new one
    StartVoting,
    /// Freeze the open vote
    FreezeVoting,
    /// Close the open vote and report the winner
    EndVoting,
    /// Close the open vote and unlock its leader now
    ForceUnlock,
    /// Cast a vote (1-based option index)
    Vote { user_id: String, option: usize },
    /// Record engagement
    Record {
        user_id: String,
        metric_type: String,
        #[arg(long, default_value_t = 1)]
        value: i32,
    },
    /// Set an engagement weight
    SetWeight {
        metric_type: String,
        weight: f64,
        #[arg(long)]
        description: Option<String>,
    },
    /// Top contributors
    Leaderboard {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Engagement velocity over a window
    Velocity {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Estimate when a node unlocks at the current pace
    Estimate { node_key: String },
    /// Whether a feature is unlocked
    CheckFeature { feature_key: String },
    /// A value with unlocked modifiers applied
    ModifiedValue { feature_key: String, base_value: f64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("progression_engine=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(tree) = args.tree {
        config.tree_config_path = Some(tree);
    }
    if let Some(root) = args.root_node {
        config.root_node_key = root;
    }
    if let Some(n) = args.max_voting_options {
        config.max_voting_options = n;
    }
    if let Some(cap) = args.max_rollover {
        config.max_rollover_points = cap;
    }
    if let Some(hours) = args.voting_hours {
        config.voting_duration_hours = hours;
    }

    info!(storage_dir = %config.storage_dir.display(), "Opening progression database");
    let db = Arc::new(ProgressionDb::open(&config)?);

    let config_path = config.config_path();
    if !config_path.exists() {
        match config.save(&config_path) {
            Ok(()) => info!(path = %config_path.display(), "Created default config"),
            Err(e) => warn!(path = %config_path.display(), error = %e, "Could not write default config"),
        }
    }

    let services = Services::new(db, &config)?;
    let listener = spawn_logging_listener(services.events.clone());

    let ctx = OpContext::new();
    let progression = &services.progression;
    let engagement = &services.engagement;

    match args.command {
        Command::SyncTree { force } => {
            let path = config
                .tree_config_path
                .clone()
                .ok_or_else(|| anyhow!("no tree file: pass --tree or set tree_config_path"))?;
            print_json(&progression.sync_tree(&ctx, &path, force)?)?;
        }
        Command::Init => {
            progression.initialize_progression_state(&ctx)?;
            print_json(&progression.get_progression_status(&ctx)?)?;
        }
        Command::Status => print_json(&progression.get_progression_status(&ctx)?)?,
        Command::Tree => print_json(&progression.get_progression_tree(&ctx)?)?,
        Command::Requires { node_key } => {
            print_json(&progression.get_required_nodes(&ctx, &node_key)?)?
        }
        Command::Unlock { node_key, level } => {
            print_json(&progression.admin_unlock(&ctx, &node_key, level)?)?
        }
        Command::Relock { node_key, level } => {
            print_json(&progression.admin_relock(&ctx, &node_key, level)?)?
        }
        Command::UnlockAll => print_json(&progression.admin_unlock_all(&ctx)?)?,
        Command::Reset {
            by,
            reason,
            preserve_user_data,
        } => print_json(&progression.reset_progression_tree(&ctx, &by, &reason, preserve_user_data)?)?,
        Command::StartVoting => print_json(&progression.admin_start_voting(&ctx)?)?,
        Command::FreezeVoting => print_json(&progression.admin_freeze_voting(&ctx)?)?,
        Command::EndVoting => print_json(&progression.admin_end_voting(&ctx)?)?,
        Command::ForceUnlock => print_json(&progression.force_instant_unlock(&ctx)?)?,
        Command::Vote { user_id, option } => {
            print_json(&progression.record_vote(&ctx, &user_id, option)?)?
        }
        Command::Record {
            user_id,
            metric_type,
            value,
        } => print_json(&progression.record_engagement(&ctx, &user_id, &metric_type, value, None)?)?,
        Command::SetWeight {
            metric_type,
            weight,
            description,
        } => {
            engagement.set_engagement_weight(&ctx, &metric_type, weight, description.as_deref())?;
            print_json(&engagement.weights(&ctx)?)?;
        }
        Command::Leaderboard { limit } => {
            print_json(&engagement.get_contribution_leaderboard(&ctx, limit)?)?
        }
        Command::Velocity { days } => print_json(&engagement.get_engagement_velocity(&ctx, days)?)?,
        Command::Estimate { node_key } => {
            print_json(&engagement.estimate_unlock_time(&ctx, &node_key)?)?
        }
        Command::CheckFeature { feature_key } => {
            print_json(&progression.is_feature_unlocked(&ctx, &feature_key)?)?
        }
        Command::ModifiedValue {
            feature_key,
            base_value,
        } => print_json(&progression.get_modified_value(&ctx, &feature_key, base_value)?)?,
    }

    // Let the listener log whatever the command emitted
    drop(services);
    let _ = listener.await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
