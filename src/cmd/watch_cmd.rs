//! Sampling session command (`memtrend watch ...`).

use clap::Args;
use serde::{Deserialize, Serialize};

use std::sync::Arc;
use std::time::Duration;

use crate::{
    AlertManager, AlertSummary, Clock, Config, LeakReport, MemoryStats, MemtrendError,
    MemtrendResult, MetaValue, Metadata, Monitor, PlatformCapabilities, ProfileStore, Sampler,
    SysinfoSampler, SystemClock,
};

#[derive(Debug, Clone, Args)]
pub struct WatchArgs {
    /// Process to sample (defaults to this process)
    #[arg(long)]
    pub pid: Option<u32>,
    /// Snapshots to take after the baseline
    #[arg(long, default_value_t = 10)]
    pub samples: usize,
    /// Pause between snapshots
    #[arg(long = "interval-ms", default_value_t = 1000)]
    pub interval_ms: u64,
    /// Save the session as a profile under this name
    #[arg(long)]
    pub name: Option<String>,
    /// Warn when one step grows resident memory by more than this
    #[arg(long = "rapid-growth-mb")]
    pub rapid_growth_mb: Option<f64>,
    /// Extra profile metadata as KEY=VALUE (repeatable)
    #[arg(long = "meta", value_name = "KEY=VALUE")]
    pub meta: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchReport {
    pub pid: u32,
    pub capabilities: PlatformCapabilities,
    pub stats: MemoryStats,
    pub leak: LeakReport,
    pub alerts: AlertSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
}

pub fn watch_command(config: &Config, args: &WatchArgs) -> MemtrendResult<serde_json::Value> {
    let cpu_interval = Duration::from_millis(config.monitor.cpu_sample_interval_ms);
    let sampler = match args.pid {
        Some(pid) => SysinfoSampler::for_pid(pid, cpu_interval),
        None => SysinfoSampler::current(cpu_interval),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let report = run_session(
        config,
        args,
        Box::new(sampler),
        clock,
        Duration::from_millis(args.interval_ms),
    )?;
    Ok(serde_json::to_value(report)?)
}

fn run_session(
    config: &Config,
    args: &WatchArgs,
    sampler: Box<dyn Sampler>,
    clock: Arc<dyn Clock>,
    interval: Duration,
) -> MemtrendResult<WatchReport> {
    let mut metadata = args
        .meta
        .iter()
        .map(|kv| parse_meta(kv))
        .collect::<MemtrendResult<Metadata>>()?;

    let mut monitor = Monitor::new(sampler, clock.clone(), &config.monitor);
    let mut alerts = AlertManager::new(&config.alerts, clock);

    let mut previous = monitor.start().clone();
    alerts.check_thresholds(&previous);
    for _ in 0..args.samples {
        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
        let current = monitor.capture_snapshot().clone();
        alerts.check_thresholds(&current);
        if let Some(threshold) = args.rapid_growth_mb {
            alerts.check_rapid_growth(&current, &previous, threshold);
        }
        previous = current;
    }

    let stats = monitor.stop()?;
    let leak = monitor.detect_memory_leak_default()?;
    alerts.check_leak(&stats);

    let profile_id = match &args.name {
        Some(name) => {
            let capabilities = monitor.capabilities();
            metadata
                .entry("pid".to_string())
                .or_insert(MetaValue::from(previous.process_id));
            metadata.insert("interval_ms".to_string(), MetaValue::from(args.interval_ms));
            metadata.insert(
                "handle_count_supported".to_string(),
                MetaValue::from(capabilities.handle_count),
            );
            let store = ProfileStore::open(config);
            Some(store.save_profile(name, monitor.snapshots(), &stats, metadata)?)
        }
        None => None,
    };

    Ok(WatchReport {
        pid: previous.process_id,
        capabilities: monitor.capabilities(),
        stats,
        leak,
        alerts: alerts.summary(),
        profile_id,
    })
}

/// Parses `KEY=VALUE`, reading booleans and numbers as such.
pub fn parse_meta(kv: &str) -> MemtrendResult<(String, MetaValue)> {
    let Some((key, value)) = kv.split_once('=') else {
        return Err(MemtrendError::InvalidArgument(format!(
            "metadata {kv:?} must look like KEY=VALUE"
        )));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(MemtrendError::InvalidArgument(format!(
            "metadata {kv:?} has an empty key"
        )));
    }
    let value = value.trim();
    let parsed = if let Ok(b) = value.parse::<bool>() {
        MetaValue::Bool(b)
    } else if let Ok(n) = value.parse::<f64>() {
        MetaValue::Number(n)
    } else {
        MetaValue::Text(value.to_string())
    };
    Ok((key.to_string(), parsed))
}
