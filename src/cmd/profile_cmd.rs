//! Stored profile commands (`memtrend profile ...`).

use clap::Subcommand;
use serde::{Deserialize, Serialize};

use crate::{
    Config, MemoryProfile, MemoryStats, MemtrendError, MemtrendResult, Metadata, ProfileStore,
    TrendAnalyzer,
};

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// List stored profiles, most recent first
    List {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one profile
    Show {
        #[arg(value_name = "PROFILE_ID")]
        id: String,
        /// Include the full snapshot sequence
        #[arg(long)]
        snapshots: bool,
    },
    /// Compare memory between two profiles (deltas are RIGHT - LEFT)
    Compare {
        #[arg(value_name = "LEFT_PROFILE_ID")]
        left: String,
        #[arg(value_name = "RIGHT_PROFILE_ID")]
        right: String,
    },
    /// Delete profiles older than the given age
    Cleanup {
        #[arg(long)]
        days: f64,
    },
    /// Detect memory growth across all profiles saved under a name
    Trend {
        #[arg(value_name = "NAME")]
        name: String,
        #[arg(long)]
        days: Option<f64>,
        #[arg(long = "threshold-mb")]
        threshold_mb: Option<f64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileView {
    pub id: String,
    pub name: String,
    pub timestamp: f64,
    pub created: String,
    pub stats: MemoryStats,
    pub growth_rate_mb_per_hour: f64,
    pub snapshot_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<Vec<crate::MemorySnapshot>>,
    pub metadata: Metadata,
}

impl ProfileView {
    fn new(profile: MemoryProfile, with_snapshots: bool) -> Self {
        Self {
            created: crate::format_timestamp(profile.timestamp),
            growth_rate_mb_per_hour: profile.stats.growth_rate_mb_per_hour(),
            snapshot_count: profile.snapshots.len(),
            snapshots: with_snapshots.then_some(profile.snapshots),
            id: profile.id,
            name: profile.name,
            timestamp: profile.timestamp,
            stats: profile.stats,
            metadata: profile.metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupOutput {
    pub days: f64,
    pub removed: usize,
}

pub fn profile_command(config: &Config, command: &ProfileCommand) -> MemtrendResult<serde_json::Value> {
    let store = ProfileStore::open(config);
    match command {
        ProfileCommand::List { name, limit } => match name {
            Some(name) => {
                let views: Vec<ProfileView> = store
                    .profiles_by_name(name, *limit)?
                    .into_iter()
                    .map(|p| ProfileView::new(p, false))
                    .collect();
                Ok(serde_json::to_value(views)?)
            }
            None => Ok(serde_json::to_value(store.list_profiles(*limit)?)?),
        },
        ProfileCommand::Show { id, snapshots } => {
            let profile = store
                .get_profile(id)?
                .ok_or_else(|| MemtrendError::InvalidArgument(format!("no profile {id:?}")))?;
            Ok(serde_json::to_value(ProfileView::new(profile, *snapshots))?)
        }
        ProfileCommand::Compare { left, right } => {
            let cmp = store.compare_profiles(left, right)?.ok_or_else(|| {
                MemtrendError::InvalidArgument(format!(
                    "cannot compare {left:?} and {right:?}: profile not found"
                ))
            })?;
            Ok(serde_json::to_value(cmp)?)
        }
        ProfileCommand::Cleanup { days } => {
            let removed = store.cleanup_old_profiles(*days)?;
            Ok(serde_json::to_value(CleanupOutput {
                days: *days,
                removed,
            })?)
        }
        ProfileCommand::Trend {
            name,
            days,
            threshold_mb,
        } => {
            let threshold = threshold_mb.unwrap_or(config.trend.regression_threshold_mb);
            let outcome = TrendAnalyzer::new(&store).analyze_trend(name, *days, threshold)?;
            Ok(serde_json::to_value(outcome)?)
        }
    }
}
