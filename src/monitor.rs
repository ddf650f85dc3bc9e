//! Session monitor: captures snapshots, tracks component markers and derives
//! statistics for the session.
//!
//! Sampling is pull-based. Nothing runs in the background; each capture
//! happens on the caller's thread. Share a monitor between threads through
//! [`SharedMonitor`].

use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    AllocationSite, AllocationTracer, Clock, History, MemorySnapshot, MemoryStats, MemtrendError,
    MemtrendResult, MonitorConfig, PlatformCapabilities, Retention, Sampler, SysinfoSampler,
    SystemClock,
};

pub type SharedMonitor = Arc<Mutex<Monitor>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentMarker {
    pub timestamp: f64,
    pub rss_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakReport {
    pub leak_detected: bool,
    pub growth_rate_mb_per_hour: f64,
    pub threshold_mb_per_hour: f64,
    pub duration_seconds: f64,
    pub total_growth_mb: f64,
}

pub struct Monitor {
    sampler: Box<dyn Sampler>,
    clock: Arc<dyn Clock>,
    tracer: Option<Arc<AllocationTracer>>,
    snapshots: History<MemorySnapshot>,
    markers: HashMap<String, Vec<ComponentMarker>>,
    start_time: Option<f64>,
    state: MonitorState,
    leak_threshold_mb_per_hour: f64,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("state", &self.state)
            .field("snapshots", &self.snapshots.len())
            .field("components", &self.markers.len())
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    pub fn new(sampler: Box<dyn Sampler>, clock: Arc<dyn Clock>, config: &MonitorConfig) -> Self {
        Self {
            sampler,
            clock,
            tracer: None,
            snapshots: History::new(Retention::from_limit(config.max_snapshots)),
            markers: HashMap::new(),
            start_time: None,
            state: MonitorState::Idle,
            leak_threshold_mb_per_hour: config.leak_threshold_mb_per_hour,
        }
    }

    /// Monitor for the current process with the system clock and default settings.
    pub fn new_default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        let sampler = SysinfoSampler::current(Duration::from_millis(config.cpu_sample_interval_ms));
        Self::new(Box::new(sampler), Arc::new(SystemClock), config)
    }

    pub fn with_tracer(mut self, tracer: Arc<AllocationTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn into_shared(self) -> SharedMonitor {
        Arc::new(Mutex::new(self))
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn capabilities(&self) -> PlatformCapabilities {
        self.sampler.capabilities()
    }

    pub fn start_time(&self) -> Option<f64> {
        self.start_time
    }

    /// Begins a session and stores the baseline snapshot.
    pub fn start(&mut self) -> &MemorySnapshot {
        self.start_time = Some(self.clock.now());
        self.state = MonitorState::Running;
        tracing::debug!("monitor session started");
        self.capture_snapshot()
    }

    pub fn capture_snapshot(&mut self) -> &MemorySnapshot {
        let snapshot = read_snapshot(
            self.sampler.as_mut(),
            self.clock.as_ref(),
            self.tracer.as_deref(),
        );
        self.snapshots.push(snapshot)
    }

    /// Latest snapshot, capturing one if the sequence is empty.
    pub fn current_snapshot(&mut self) -> &MemorySnapshot {
        let Self {
            sampler,
            clock,
            tracer,
            snapshots,
            ..
        } = self;
        snapshots.last_or_push_with(|| {
            read_snapshot(sampler.as_mut(), clock.as_ref(), tracer.as_deref())
        })
    }

    /// Stored snapshots, oldest first.
    pub fn snapshots(&mut self) -> &[MemorySnapshot] {
        self.snapshots.as_slice()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn mark_component(&mut self, name: &str) {
        let marker = ComponentMarker {
            timestamp: self.clock.now(),
            rss_mb: self.sampler.resident_mb(),
        };
        tracing::debug!(component = name, rss_mb = marker.rss_mb, "component marker");
        self.markers.entry(name.to_string()).or_default().push(marker);
    }

    pub fn component_markers(&self, name: &str) -> &[ComponentMarker] {
        self.markers.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resident-memory change between the first and last marker of `name`.
    pub fn component_memory(&self, name: &str) -> MemtrendResult<f64> {
        let markers = self.component_markers(name);
        match (markers.first(), markers.last()) {
            (Some(first), Some(last)) if markers.len() >= 2 => Ok(last.rss_mb - first.rss_mb),
            _ => Err(MemtrendError::InsufficientMarkers {
                component: name.to_string(),
                markers: markers.len(),
            }),
        }
    }

    pub fn calculate_statistics(&self) -> MemtrendResult<MemoryStats> {
        let snapshots = self.snapshots.to_vec();
        MemoryStats::compute(&snapshots)
    }

    pub fn detect_memory_leak(&self, threshold_mb_per_hour: f64) -> MemtrendResult<LeakReport> {
        let stats = self.calculate_statistics()?;
        let (Some(first), Some(last)) = (self.snapshots.first(), self.snapshots.last()) else {
            return Err(MemtrendError::NoSnapshots);
        };
        let rate = stats.growth_rate_mb_per_hour();
        Ok(LeakReport {
            leak_detected: rate > threshold_mb_per_hour,
            growth_rate_mb_per_hour: rate,
            threshold_mb_per_hour,
            duration_seconds: stats.duration_seconds,
            total_growth_mb: last.rss_mb - first.rss_mb,
        })
    }

    /// Leak check against the configured threshold.
    pub fn detect_memory_leak_default(&self) -> MemtrendResult<LeakReport> {
        self.detect_memory_leak(self.leak_threshold_mb_per_hour)
    }

    /// Largest traced allocation sites; empty when no tracer is attached.
    pub fn top_allocations(&self, limit: usize) -> Vec<AllocationSite> {
        self.tracer
            .as_ref()
            .map(|t| t.top_sites(limit))
            .unwrap_or_default()
    }

    pub fn reset(&mut self) {
        self.snapshots.clear();
        self.markers.clear();
        self.start_time = None;
        self.state = MonitorState::Idle;
        tracing::debug!("monitor reset");
    }

    /// Captures a final snapshot and returns statistics for the whole session.
    pub fn stop(&mut self) -> MemtrendResult<MemoryStats> {
        self.capture_snapshot();
        self.state = MonitorState::Stopped;
        let stats = self.calculate_statistics()?;
        tracing::debug!(
            snapshots = stats.total_snapshots,
            mean_rss_mb = stats.mean_rss_mb,
            "monitor session stopped"
        );
        Ok(stats)
    }
}

fn read_snapshot(
    sampler: &mut dyn Sampler,
    clock: &dyn Clock,
    tracer: Option<&AllocationTracer>,
) -> MemorySnapshot {
    let reading = sampler.read();
    let snapshot = MemorySnapshot {
        timestamp: clock.now(),
        process_id: reading.process_id,
        rss_mb: reading.rss_mb,
        vms_mb: reading.vms_mb,
        percent: reading.percent,
        available_mb: reading.available_mb,
        total_mb: reading.total_mb,
        heap_allocated_mb: tracer.map(AllocationTracer::in_use_mb),
        num_threads: reading.num_threads,
        num_fds: reading.num_fds,
        cpu_percent: reading.cpu_percent,
    };
    tracing::debug!(
        rss_mb = snapshot.rss_mb,
        cpu_percent = snapshot.cpu_percent,
        "captured snapshot"
    );
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::sampler::testing::ScriptedSampler;

    fn monitor(rss: impl IntoIterator<Item = f64>) -> (Monitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let m = Monitor::new(
            Box::new(ScriptedSampler::new(rss)),
            clock.clone(),
            &MonitorConfig::default(),
        );
        (m, clock)
    }

    #[test]
    fn captures_append_in_order() {
        let (mut m, clock) = monitor((0..25).map(|i| 100.0 + i as f64));
        for _ in 0..25 {
            m.capture_snapshot();
            clock.advance(1.0);
        }
        assert_eq!(m.snapshot_count(), 25);
        let snaps = m.snapshots();
        assert!(snaps.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(snaps[0].rss_mb, 100.0);
        assert_eq!(snaps[24].rss_mb, 124.0);
    }

    #[test]
    fn statistics_without_snapshots_is_an_error() {
        let (m, _) = monitor([0.0f64; 0]);
        assert!(matches!(
            m.calculate_statistics(),
            Err(MemtrendError::NoSnapshots)
        ));
        assert!(matches!(
            m.detect_memory_leak(10.0),
            Err(MemtrendError::NoSnapshots)
        ));
    }

    #[test]
    fn current_snapshot_captures_lazily() {
        let (mut m, _) = monitor([64.0, 65.0]);
        assert_eq!(m.current_snapshot().rss_mb, 64.0);
        assert_eq!(m.current_snapshot().rss_mb, 64.0);
        assert_eq!(m.snapshot_count(), 1);
    }

    #[test]
    fn component_memory_needs_two_markers() {
        let (mut m, _) = monitor([200.0, 450.0, 470.0]);
        m.mark_component("embedding_model");
        let err = m.component_memory("embedding_model").expect_err("one marker");
        assert!(matches!(
            err,
            MemtrendError::InsufficientMarkers { markers: 1, .. }
        ));
        assert!(m.component_memory("missing").is_err());

        m.mark_component("embedding_model");
        m.mark_component("embedding_model");
        let delta = m.component_memory("embedding_model").expect("delta");
        assert!((delta - 270.0).abs() < 1e-9);
    }

    #[test]
    fn leak_detection_reports_rate_and_growth() {
        // 60 MB over one hour.
        let (mut m, clock) = monitor((0..=6).map(|i| 500.0 + i as f64 * 10.0));
        m.start();
        for _ in 0..6 {
            clock.advance(600.0);
            m.capture_snapshot();
        }
        let report = m.detect_memory_leak(50.0).expect("leak");
        assert!(report.leak_detected);
        assert!((report.growth_rate_mb_per_hour - 60.0).abs() / 60.0 < 1e-3);
        assert_eq!(report.total_growth_mb, 60.0);
        assert_eq!(report.duration_seconds, 3600.0);

        let relaxed = m.detect_memory_leak(100.0).expect("leak");
        assert!(!relaxed.leak_detected);
    }

    #[test]
    fn end_to_end_session_counts_baseline_and_final() {
        let (mut m, clock) = monitor([100.0, 104.0, 108.0, 112.0, 116.0, 120.0, 120.0]);
        assert_eq!(m.state(), MonitorState::Idle);
        m.start();
        assert_eq!(m.state(), MonitorState::Running);
        for _ in 0..5 {
            clock.advance(2.0);
            m.capture_snapshot();
        }
        clock.advance(2.0);
        let stats = m.stop().expect("stats");
        assert_eq!(m.state(), MonitorState::Stopped);
        assert_eq!(stats.total_snapshots, 7);
        assert!((stats.max_rss_mb - stats.min_rss_mb - 20.0).abs() < 1e-6);
        assert_eq!(stats.duration_seconds, 12.0);
    }

    #[test]
    fn reset_clears_session() {
        let (mut m, _) = monitor([10.0, 20.0]);
        m.start();
        m.mark_component("x");
        m.reset();
        assert_eq!(m.state(), MonitorState::Idle);
        assert_eq!(m.snapshot_count(), 0);
        assert!(m.start_time().is_none());
        assert!(m.component_markers("x").is_empty());
    }

    #[test]
    fn tracer_feeds_heap_and_top_allocations() {
        let tracer = Arc::new(AllocationTracer::new());
        let (m, _) = monitor([1.0]);
        let mut m = m.with_tracer(tracer.clone());
        assert!(m.top_allocations(5).is_empty());

        tracer.allocate(3 * 1024 * 1024, "index::build", None);
        let snap = m.capture_snapshot();
        assert_eq!(snap.heap_allocated_mb, Some(3.0));
        assert_eq!(m.top_allocations(5)[0].callsite, "index::build");
    }

    #[test]
    fn no_tracer_means_no_heap_reading() {
        let (mut m, _) = monitor([1.0]);
        assert_eq!(m.capture_snapshot().heap_allocated_mb, None);
        assert!(m.top_allocations(10).is_empty());
    }

    #[test]
    fn unavailable_handles_are_none_not_zero() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut m = Monitor::new(
            Box::new(ScriptedSampler::new([5.0]).without_handles()),
            clock,
            &MonitorConfig::default(),
        );
        assert!(!m.capabilities().handle_count);
        assert_eq!(m.capture_snapshot().num_fds, None);
    }

    #[test]
    fn bounded_retention_keeps_latest() {
        let clock = Arc::new(ManualClock::new(0.0));
        let cfg = MonitorConfig {
            max_snapshots: Some(3),
            ..MonitorConfig::default()
        };
        let mut m = Monitor::new(
            Box::new(ScriptedSampler::new([1.0, 2.0, 3.0, 4.0, 5.0])),
            clock,
            &cfg,
        );
        for _ in 0..5 {
            m.capture_snapshot();
        }
        let rss: Vec<f64> = m.snapshots().iter().map(|s| s.rss_mb).collect();
        assert_eq!(rss, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn shared_monitor_serializes_captures() {
        let (m, _) = monitor((0..40).map(f64::from));
        let shared = m.into_shared();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        shared.lock().expect("monitor lock").capture_snapshot();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(shared.lock().expect("monitor lock").snapshot_count(), 40);
    }
}
