//! Threshold alerts over snapshots and session statistics.
//!
//! Each metric category yields at most one alert per check: levels are tried
//! from critical down to info and the first threshold met wins. Alerts go to
//! the built-in logging handler, then to every registered handler, then into
//! the history.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use crate::{
    AlertConfig, Clock, History, MemorySnapshot, MemoryStats, MetaValue, Metadata, Retention,
    SystemClock, ThresholdSet, metadata,
};

pub const ALERT_HIGH_MEMORY: &str = "high_memory";
pub const ALERT_HIGH_MEMORY_PERCENT: &str = "high_memory_percent";
pub const ALERT_MEMORY_LEAK: &str = "memory_leak";
pub const ALERT_RAPID_GROWTH: &str = "rapid_growth";

pub type SharedAlertManager = Arc<Mutex<AlertManager>>;
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type AlertHandler = Box<dyn Fn(&MemoryAlert) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    /// Evaluation order: most severe first.
    pub const PRECEDENCE: [AlertLevel; 3] = [Self::Critical, Self::Warning, Self::Info];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    RssMb,
    Percent,
    GrowthMbPerHour,
}

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RssMb => "rss_mb",
            Self::Percent => "percent",
            Self::GrowthMbPerHour => "growth_mb_per_hour",
        }
    }

    /// Looks up a metric by its config name; `None` for unknown names.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "rss_mb" => Some(Self::RssMb),
            "percent" => Some(Self::Percent),
            "growth_mb_per_hour" => Some(Self::GrowthMbPerHour),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryAlert {
    pub level: AlertLevel,
    pub alert_type: String,
    pub message: String,
    pub timestamp: f64,
    pub snapshot: Option<MemorySnapshot>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    pub level: Option<AlertLevel>,
    pub alert_type: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertSummary {
    pub total_alerts: usize,
    pub by_level: BTreeMap<AlertLevel, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub most_recent: Option<MemoryAlert>,
}

pub struct AlertManager {
    thresholds: BTreeMap<AlertLevel, ThresholdSet>,
    handlers: Vec<(String, AlertHandler)>,
    history: History<MemoryAlert>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertManager")
            .field("thresholds", &self.thresholds)
            .field(
                "handlers",
                &self.handlers.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(&AlertConfig::default(), Arc::new(SystemClock))
    }
}

impl AlertManager {
    pub fn new(config: &AlertConfig, clock: Arc<dyn Clock>) -> Self {
        let thresholds = AlertLevel::PRECEDENCE
            .iter()
            .map(|level| (*level, config.thresholds(*level).clone()))
            .collect();
        Self {
            thresholds,
            handlers: Vec::new(),
            history: History::new(Retention::from_limit(config.max_history)),
            clock,
        }
    }

    pub fn into_shared(self) -> SharedAlertManager {
        Arc::new(Mutex::new(self))
    }

    pub fn set_threshold(&mut self, level: AlertLevel, metric: Metric, value: f64) {
        self.thresholds.entry(level).or_default().set(metric, value);
    }

    /// Returns `false` and changes nothing when `metric` is not a known name.
    pub fn set_threshold_by_name(&mut self, level: AlertLevel, metric: &str, value: f64) -> bool {
        match Metric::parse(metric) {
            Some(m) => {
                self.set_threshold(level, m, value);
                true
            }
            None => false,
        }
    }

    pub fn threshold(&self, level: AlertLevel, metric: Metric) -> Option<f64> {
        self.thresholds.get(&level).and_then(|t| t.get(metric))
    }

    pub fn add_handler<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&MemoryAlert) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers.push((name.to_string(), Box::new(handler)));
    }

    /// Checks resident memory and system share. Returns the alerts raised.
    pub fn check_thresholds(&mut self, snapshot: &MemorySnapshot) -> Vec<MemoryAlert> {
        let mut raised = Vec::new();

        if let Some((level, threshold)) = self.crossed(Metric::RssMb, snapshot.rss_mb) {
            raised.push(MemoryAlert {
                level,
                alert_type: ALERT_HIGH_MEMORY.to_string(),
                message: format!(
                    "resident memory {:.1} MB reached {level} threshold {:.1} MB",
                    snapshot.rss_mb, threshold
                ),
                timestamp: self.clock.now(),
                snapshot: Some(snapshot.clone()),
                metadata: metadata([
                    ("threshold", MetaValue::from(threshold)),
                    ("current_value", MetaValue::from(snapshot.rss_mb)),
                    ("vms_mb", MetaValue::from(snapshot.vms_mb)),
                    ("available_mb", MetaValue::from(snapshot.available_mb)),
                ]),
            });
        }

        if let Some((level, threshold)) = self.crossed(Metric::Percent, snapshot.percent) {
            raised.push(MemoryAlert {
                level,
                alert_type: ALERT_HIGH_MEMORY_PERCENT.to_string(),
                message: format!(
                    "process holds {:.1}% of system memory ({level} threshold {:.1}%)",
                    snapshot.percent, threshold
                ),
                timestamp: self.clock.now(),
                snapshot: Some(snapshot.clone()),
                metadata: metadata([
                    ("threshold", MetaValue::from(threshold)),
                    ("current_value", MetaValue::from(snapshot.percent)),
                    ("rss_mb", MetaValue::from(snapshot.rss_mb)),
                    ("total_mb", MetaValue::from(snapshot.total_mb)),
                ]),
            });
        }

        for alert in &raised {
            self.dispatch(alert);
        }
        raised
    }

    /// Checks the session growth rate against the leak thresholds.
    pub fn check_leak(&mut self, stats: &MemoryStats) -> Option<MemoryAlert> {
        let rate = stats.growth_rate_mb_per_hour();
        let (level, threshold) = self.crossed(Metric::GrowthMbPerHour, rate)?;
        let alert = MemoryAlert {
            level,
            alert_type: ALERT_MEMORY_LEAK.to_string(),
            message: format!(
                "resident memory growing at {rate:.2} MB/hour ({level} threshold {threshold:.2} MB/hour)"
            ),
            timestamp: self.clock.now(),
            snapshot: None,
            metadata: metadata([
                ("threshold", MetaValue::from(threshold)),
                ("growth_rate_mb_per_hour", MetaValue::from(rate)),
                ("duration_seconds", MetaValue::from(stats.duration_seconds)),
                ("total_snapshots", MetaValue::from(stats.total_snapshots as u64)),
                ("mean_rss_mb", MetaValue::from(stats.mean_rss_mb)),
            ]),
        };
        self.dispatch(&alert);
        Some(alert)
    }

    /// Flags a single-step jump between two consecutive snapshots.
    pub fn check_rapid_growth(
        &mut self,
        current: &MemorySnapshot,
        previous: &MemorySnapshot,
        threshold_mb: f64,
    ) -> Option<MemoryAlert> {
        let delta = current.rss_mb - previous.rss_mb;
        if delta <= threshold_mb {
            return None;
        }
        let alert = MemoryAlert {
            level: AlertLevel::Warning,
            alert_type: ALERT_RAPID_GROWTH.to_string(),
            message: format!(
                "resident memory jumped {delta:.1} MB in {:.1}s (threshold {threshold_mb:.1} MB)",
                current.timestamp - previous.timestamp
            ),
            timestamp: self.clock.now(),
            snapshot: Some(current.clone()),
            metadata: metadata([
                ("threshold", MetaValue::from(threshold_mb)),
                ("delta_mb", MetaValue::from(delta)),
                ("previous_rss_mb", MetaValue::from(previous.rss_mb)),
                ("current_rss_mb", MetaValue::from(current.rss_mb)),
                (
                    "interval_seconds",
                    MetaValue::from(current.timestamp - previous.timestamp),
                ),
            ]),
        };
        self.dispatch(&alert);
        Some(alert)
    }

    /// History filtered by `query`, most recent first.
    pub fn alerts(&self, query: &AlertQuery) -> Vec<MemoryAlert> {
        self.history
            .iter()
            .rev()
            .filter(|a| query.level.is_none_or(|l| a.level == l))
            .filter(|a| {
                query
                    .alert_type
                    .as_deref()
                    .is_none_or(|t| a.alert_type == t)
            })
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> AlertSummary {
        let mut summary = AlertSummary {
            total_alerts: self.history.len(),
            most_recent: self.history.last().cloned(),
            ..AlertSummary::default()
        };
        for alert in self.history.iter() {
            *summary.by_level.entry(alert.level).or_default() += 1;
            *summary.by_type.entry(alert.alert_type.clone()).or_default() += 1;
        }
        summary
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn crossed(&self, metric: Metric, value: f64) -> Option<(AlertLevel, f64)> {
        AlertLevel::PRECEDENCE.iter().find_map(|level| {
            self.threshold(*level, metric)
                .filter(|t| value >= *t)
                .map(|t| (*level, t))
        })
    }

    fn dispatch(&mut self, alert: &MemoryAlert) {
        log_alert(alert);
        for (name, handler) in &self.handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(alert))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(handler = %name, alert_type = %alert.alert_type, "alert handler failed: {err}");
                }
                Err(_) => {
                    tracing::error!(handler = %name, alert_type = %alert.alert_type, "alert handler panicked");
                }
            }
        }
        self.history.push(alert.clone());
    }
}

fn log_alert(alert: &MemoryAlert) {
    match alert.level {
        AlertLevel::Info => tracing::info!(alert_type = %alert.alert_type, "{}", alert.message),
        AlertLevel::Warning => tracing::warn!(alert_type = %alert.alert_type, "{}", alert.message),
        AlertLevel::Critical => {
            tracing::error!(alert_type = %alert.alert_type, "{}", alert.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::snapshot::test_snapshot;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> AlertManager {
        AlertManager::new(&AlertConfig::default(), Arc::new(ManualClock::new(1_000.0)))
    }

    fn stats_with_rate(mb_per_hour: f64) -> MemoryStats {
        MemoryStats {
            mean_rss_mb: 300.0,
            max_rss_mb: 320.0,
            min_rss_mb: 280.0,
            std_rss_mb: 10.0,
            growth_rate_mb_per_sec: mb_per_hour / 3600.0,
            total_snapshots: 60,
            duration_seconds: 3600.0,
        }
    }

    #[test]
    fn below_every_threshold_raises_nothing() {
        let mut m = manager();
        let alerts = m.check_thresholds(&test_snapshot(0.0, 128.0));
        assert!(alerts.is_empty());
        assert_eq!(m.history_len(), 0);
    }

    #[test]
    fn only_the_most_severe_crossed_level_fires() {
        let mut m = manager();
        // warning 1024, critical 2048
        let alerts = m.check_thresholds(&test_snapshot(0.0, 1_500.0));
        let rss: Vec<_> = alerts
            .iter()
            .filter(|a| a.alert_type == ALERT_HIGH_MEMORY)
            .collect();
        assert_eq!(rss.len(), 1);
        assert_eq!(rss[0].level, AlertLevel::Warning);
        assert_eq!(rss[0].metadata.get("threshold"), Some(&MetaValue::Number(1024.0)));
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut m = manager();
        let alerts = m.check_thresholds(&test_snapshot(0.0, 2048.0));
        assert_eq!(alerts[0].level, AlertLevel::Critical);
    }

    #[test]
    fn each_category_alerts_independently() {
        let mut m = manager();
        m.set_threshold(AlertLevel::Critical, Metric::Percent, 5.0);
        // 1_000 MB of 16_384 MB is ~6.1%
        let alerts = m.check_thresholds(&test_snapshot(0.0, 1_000.0));
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].alert_type, ALERT_HIGH_MEMORY);
        assert_eq!(alerts[0].level, AlertLevel::Info);
        assert_eq!(alerts[1].alert_type, ALERT_HIGH_MEMORY_PERCENT);
        assert_eq!(alerts[1].level, AlertLevel::Critical);
    }

    #[test]
    fn unknown_metric_name_is_a_soft_miss() {
        let mut m = manager();
        assert!(!m.set_threshold_by_name(AlertLevel::Info, "swap_mb", 1.0));
        assert!(m.set_threshold_by_name(AlertLevel::Info, "rss_mb", 1.0));
        assert_eq!(m.threshold(AlertLevel::Info, Metric::RssMb), Some(1.0));
    }

    #[test]
    fn leak_check_uses_same_precedence() {
        let mut m = manager();
        assert!(m.check_leak(&stats_with_rate(5.0)).is_none());
        let alert = m.check_leak(&stats_with_rate(75.0)).expect("alert");
        assert_eq!(alert.level, AlertLevel::Warning);
        assert_eq!(alert.alert_type, ALERT_MEMORY_LEAK);
        let alert = m.check_leak(&stats_with_rate(250.0)).expect("alert");
        assert_eq!(alert.level, AlertLevel::Critical);
    }

    #[test]
    fn rapid_growth_compares_consecutive_snapshots() {
        let mut m = manager();
        let prev = test_snapshot(0.0, 200.0);
        assert!(m.check_rapid_growth(&test_snapshot(1.0, 250.0), &prev, 100.0).is_none());
        let alert = m
            .check_rapid_growth(&test_snapshot(1.0, 350.0), &prev, 100.0)
            .expect("alert");
        assert_eq!(alert.level, AlertLevel::Warning);
        assert_eq!(alert.metadata.get("delta_mb"), Some(&MetaValue::Number(150.0)));
    }

    #[test]
    fn rapid_growth_equal_to_threshold_is_not_flagged() {
        let mut m = manager();
        let prev = test_snapshot(0.0, 200.0);
        assert!(m.check_rapid_growth(&test_snapshot(1.0, 300.0), &prev, 100.0).is_none());
        assert!(m.check_rapid_growth(&test_snapshot(1.0, 300.5), &prev, 100.0).is_some());
        assert_eq!(m.history_len(), 1);
    }

    #[test]
    fn shared_manager_records_every_concurrent_check() {
        let shared = manager().into_shared();
        let dispatched = Arc::new(AtomicUsize::new(0));
        {
            let counter = dispatched.clone();
            shared.lock().expect("lock").add_handler("counts", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        // 1500 MB crosses WARNING only; percent stays under INFO.
                        let snap = test_snapshot(t as f64 * 100.0 + i as f64, 1_500.0);
                        let raised = shared.lock().expect("lock").check_thresholds(&snap);
                        assert_eq!(raised.len(), 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        let m = shared.lock().expect("lock");
        assert_eq!(m.history_len(), 200);
        assert_eq!(dispatched.load(Ordering::SeqCst), 200);
        assert_eq!(m.summary().by_level.get(&AlertLevel::Warning), Some(&200));
    }

    #[test]
    fn failing_handlers_do_not_stop_dispatch() {
        let mut m = manager();
        let seen = Arc::new(AtomicUsize::new(0));
        m.add_handler("errors", |_| Err("webhook down".into()));
        m.add_handler("panics", |_| panic!("handler bug"));
        let counter = seen.clone();
        m.add_handler("counts", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let alerts = m.check_thresholds(&test_snapshot(0.0, 4_096.0));
        assert_eq!(alerts.len(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(m.history_len(), 1);
    }

    #[test]
    fn queries_are_most_recent_first_and_filtered() {
        let mut m = manager();
        m.check_thresholds(&test_snapshot(0.0, 600.0));
        m.check_thresholds(&test_snapshot(1.0, 1_100.0));
        m.check_leak(&stats_with_rate(150.0));
        m.check_thresholds(&test_snapshot(2.0, 2_100.0));

        let all = m.alerts(&AlertQuery::default());
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].level, AlertLevel::Critical);
        assert_eq!(all[0].alert_type, ALERT_HIGH_MEMORY);
        assert_eq!(all[3].level, AlertLevel::Info);

        let high = m.alerts(&AlertQuery {
            alert_type: Some(ALERT_HIGH_MEMORY.to_string()),
            limit: Some(2),
            ..AlertQuery::default()
        });
        assert_eq!(high.len(), 2);
        assert_eq!(high[1].level, AlertLevel::Warning);

        let critical = m.alerts(&AlertQuery {
            level: Some(AlertLevel::Critical),
            ..AlertQuery::default()
        });
        assert_eq!(critical.len(), 2);

        let summary = m.summary();
        assert_eq!(summary.total_alerts, 4);
        assert_eq!(summary.by_level.get(&AlertLevel::Critical), Some(&2));
        assert_eq!(summary.by_type.get(ALERT_HIGH_MEMORY), Some(&3));
        assert_eq!(
            summary.most_recent.map(|a| a.alert_type),
            Some(ALERT_HIGH_MEMORY.to_string())
        );

        m.clear_history();
        assert_eq!(m.summary().total_alerts, 0);
    }

    #[test]
    fn summary_serializes_levels_as_keys() {
        let mut m = manager();
        m.check_thresholds(&test_snapshot(0.0, 700.0));
        let json = serde_json::to_value(m.summary()).expect("json");
        assert_eq!(json["by_level"]["INFO"], 1);
    }

    #[test]
    fn bounded_history_evicts_oldest() {
        let cfg = AlertConfig {
            max_history: Some(2),
            ..AlertConfig::default()
        };
        let mut m = AlertManager::new(&cfg, Arc::new(ManualClock::new(0.0)));
        for rss in [600.0, 1_100.0, 2_100.0] {
            m.check_thresholds(&test_snapshot(0.0, rss));
        }
        let levels: Vec<_> = m
            .alerts(&AlertQuery::default())
            .into_iter()
            .map(|a| a.level)
            .collect();
        assert_eq!(levels, vec![AlertLevel::Critical, AlertLevel::Warning]);
    }
}
