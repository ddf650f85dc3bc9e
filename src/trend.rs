//! Cross-session regression: does a named workload use more memory over time?

use serde::{Deserialize, Serialize};

use crate::{MemtrendResult, ProfileStore, SECONDS_PER_DAY, even_axis_slope};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub id: String,
    pub timestamp: f64,
    pub mean_rss_mb: f64,
    pub max_rss_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryTrend {
    pub profile_name: String,
    pub profile_count: usize,
    pub time_span_days: f64,
    pub mean_rss_slope_mb_per_day: f64,
    pub max_rss_slope_mb_per_day: f64,
    pub regression_threshold_mb: f64,
    pub regression_detected: bool,
    /// Oldest first.
    pub profiles: Vec<TrendPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrendOutcome {
    InsufficientData {
        profile_name: String,
        profile_count: usize,
    },
    Analyzed(MemoryTrend),
}

impl TrendOutcome {
    pub fn trend(&self) -> Option<&MemoryTrend> {
        match self {
            Self::Analyzed(t) => Some(t),
            Self::InsufficientData { .. } => None,
        }
    }
}

#[derive(Debug)]
pub struct TrendAnalyzer<'a> {
    store: &'a ProfileStore,
}

impl<'a> TrendAnalyzer<'a> {
    pub fn new(store: &'a ProfileStore) -> Self {
        Self { store }
    }

    /// Fits mean and peak resident memory across the profiles saved under
    /// `name`, optionally limited to the last `days`.
    ///
    /// Profiles are placed evenly across the real span between the first and
    /// the last one. A regression is flagged when either slope exceeds
    /// `regression_threshold_mb / time_span_days`.
    pub fn analyze_trend(
        &self,
        name: &str,
        days: Option<f64>,
        regression_threshold_mb: f64,
    ) -> MemtrendResult<TrendOutcome> {
        let mut profiles = self.store.profiles_by_name(name, None)?;
        if let Some(days) = days {
            let cutoff = self.store.now() - days * SECONDS_PER_DAY;
            profiles.retain(|p| p.timestamp >= cutoff);
        }
        if profiles.len() < 2 {
            return Ok(TrendOutcome::InsufficientData {
                profile_name: name.to_string(),
                profile_count: profiles.len(),
            });
        }
        profiles.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

        let points: Vec<TrendPoint> = profiles
            .iter()
            .map(|p| TrendPoint {
                id: p.id.clone(),
                timestamp: p.timestamp,
                mean_rss_mb: p.stats.mean_rss_mb,
                max_rss_mb: p.stats.max_rss_mb,
            })
            .collect();
        let (first, last) = (&points[0], &points[points.len() - 1]);
        let span_days = (last.timestamp - first.timestamp) / SECONDS_PER_DAY;

        let means: Vec<f64> = points.iter().map(|p| p.mean_rss_mb).collect();
        let peaks: Vec<f64> = points.iter().map(|p| p.max_rss_mb).collect();
        let mean_slope = even_axis_slope(&means, span_days);
        let max_slope = even_axis_slope(&peaks, span_days);

        let regression_detected = span_days > 0.0 && {
            let per_day = regression_threshold_mb / span_days;
            mean_slope > per_day || max_slope > per_day
        };
        if regression_detected {
            tracing::warn!(
                profile = name,
                mean_rss_slope_mb_per_day = mean_slope,
                "memory regression across profiles"
            );
        }

        Ok(TrendOutcome::Analyzed(MemoryTrend {
            profile_name: name.to_string(),
            profile_count: points.len(),
            time_span_days: span_days,
            mean_rss_slope_mb_per_day: mean_slope,
            max_rss_slope_mb_per_day: max_slope,
            regression_threshold_mb,
            regression_detected,
            profiles: points,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::snapshot::test_snapshot;
    use crate::{Metadata, MemoryStats};

    use std::sync::Arc;

    fn temp_store(name: &str) -> (ProfileStore, Arc<ManualClock>) {
        let dir = std::env::temp_dir().join(format!(
            "memtrend-trend-{name}-{}",
            uuid::Uuid::new_v4()
        ));
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        (ProfileStore::new(dir, clock.clone()), clock)
    }

    fn save_flat(store: &ProfileStore, name: &str, rss: f64) -> String {
        let snaps = vec![test_snapshot(0.0, rss), test_snapshot(1.0, rss)];
        let stats = MemoryStats::compute(&snaps).expect("stats");
        store
            .save_profile(name, &snaps, &stats, Metadata::new())
            .expect("save")
    }

    #[test]
    fn single_profile_is_insufficient() {
        let (store, _) = temp_store("single");
        save_flat(&store, "svc", 100.0);
        let outcome = TrendAnalyzer::new(&store)
            .analyze_trend("svc", None, 50.0)
            .expect("trend");
        assert_eq!(
            outcome,
            TrendOutcome::InsufficientData {
                profile_name: "svc".to_string(),
                profile_count: 1,
            }
        );
        assert!(outcome.trend().is_none());
    }

    #[test]
    fn growth_beyond_threshold_is_a_regression() {
        let (store, clock) = temp_store("growth");
        save_flat(&store, "svc", 100.0);
        clock.advance(2.0 * SECONDS_PER_DAY);
        save_flat(&store, "svc", 200.0);

        let outcome = TrendAnalyzer::new(&store)
            .analyze_trend("svc", None, 50.0)
            .expect("trend");
        let trend = outcome.trend().expect("analyzed");
        assert_eq!(trend.profile_count, 2);
        assert!((trend.time_span_days - 2.0).abs() < 1e-9);
        assert!((trend.mean_rss_slope_mb_per_day - 50.0).abs() < 1e-9);
        assert!(trend.regression_detected);
        assert!(trend.profiles[0].timestamp < trend.profiles[1].timestamp);
    }

    #[test]
    fn flat_usage_is_not_a_regression() {
        let (store, clock) = temp_store("flat");
        for _ in 0..4 {
            save_flat(&store, "svc", 300.0);
            clock.advance(SECONDS_PER_DAY);
        }
        let trend = TrendAnalyzer::new(&store)
            .analyze_trend("svc", None, 10.0)
            .expect("trend");
        let trend = trend.trend().expect("analyzed");
        assert_eq!(trend.mean_rss_slope_mb_per_day, 0.0);
        assert!(!trend.regression_detected);
    }

    #[test]
    fn day_window_drops_older_profiles() {
        let (store, clock) = temp_store("window");
        save_flat(&store, "svc", 100.0);
        clock.advance(30.0 * SECONDS_PER_DAY);
        save_flat(&store, "svc", 110.0);
        clock.advance(SECONDS_PER_DAY);
        save_flat(&store, "svc", 120.0);

        let analyzer = TrendAnalyzer::new(&store);
        let recent = analyzer.analyze_trend("svc", Some(7.0), 50.0).expect("trend");
        assert_eq!(recent.trend().map(|t| t.profile_count), Some(2));

        let narrow = analyzer.analyze_trend("svc", Some(0.5), 50.0).expect("trend");
        assert!(matches!(
            narrow,
            TrendOutcome::InsufficientData { profile_count: 1, .. }
        ));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = TrendOutcome::InsufficientData {
            profile_name: "svc".to_string(),
            profile_count: 0,
        };
        let json = serde_json::to_value(&outcome).expect("json");
        assert_eq!(json["status"], "insufficient_data");
    }
}
