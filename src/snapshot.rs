//! Point-in-time resource snapshots and the statistics derived from them.

use serde::{Deserialize, Serialize};

use crate::{MemtrendError, MemtrendResult};

/// One captured sample. Built only by [`crate::Monitor::capture_snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub timestamp: f64,
    pub process_id: u32,
    pub rss_mb: f64,
    pub vms_mb: f64,
    /// Share of total system memory held by the process, in percent.
    pub percent: f64,
    pub available_mb: f64,
    pub total_mb: f64,
    /// Bytes held by instrumented allocations; `None` when no tracer is attached.
    pub heap_allocated_mb: Option<f64>,
    pub num_threads: u64,
    /// `None` when the platform cannot count open handles.
    pub num_fds: Option<u64>,
    pub cpu_percent: f64,
}

/// How the regression assigns a time coordinate to each sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeAxis {
    /// Samples spread evenly over the elapsed duration, ignoring their own
    /// timestamps. Assumes a uniform sampling interval.
    #[default]
    Even,
    /// Each sample placed at its recorded timestamp.
    Timestamps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub mean_rss_mb: f64,
    pub max_rss_mb: f64,
    pub min_rss_mb: f64,
    pub std_rss_mb: f64,
    pub growth_rate_mb_per_sec: f64,
    pub total_snapshots: usize,
    pub duration_seconds: f64,
}

impl MemoryStats {
    /// Statistics over `snapshots` using the even time axis.
    pub fn compute(snapshots: &[MemorySnapshot]) -> MemtrendResult<Self> {
        Self::compute_with_axis(snapshots, TimeAxis::Even)
    }

    pub fn compute_with_axis(snapshots: &[MemorySnapshot], axis: TimeAxis) -> MemtrendResult<Self> {
        let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
            return Err(MemtrendError::NoSnapshots);
        };
        let rss: Vec<f64> = snapshots.iter().map(|s| s.rss_mb).collect();
        let n = rss.len() as f64;
        let mean = rss.iter().sum::<f64>() / n;
        let variance = rss.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let max = rss.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = rss.iter().copied().fold(f64::INFINITY, f64::min);
        let duration = (last.timestamp - first.timestamp).max(0.0);

        let growth = match axis {
            TimeAxis::Even => even_axis_slope(&rss, duration),
            TimeAxis::Timestamps => {
                let xs: Vec<f64> = snapshots
                    .iter()
                    .map(|s| s.timestamp - first.timestamp)
                    .collect();
                least_squares_slope(&xs, &rss)
            }
        };

        Ok(Self {
            mean_rss_mb: mean,
            max_rss_mb: max,
            min_rss_mb: min,
            std_rss_mb: variance.sqrt(),
            growth_rate_mb_per_sec: growth,
            total_snapshots: snapshots.len(),
            duration_seconds: duration,
        })
    }

    pub fn growth_rate_mb_per_hour(&self) -> f64 {
        self.growth_rate_mb_per_sec * 3600.0
    }
}

/// Slope of `values` against `0, span/(n-1), ..., span`.
///
/// Returns 0 for fewer than two values or a non-positive span.
pub fn even_axis_slope(values: &[f64], span: f64) -> f64 {
    if values.len() < 2 || span <= 0.0 {
        return 0.0;
    }
    let step = span / (values.len() - 1) as f64;
    let xs: Vec<f64> = (0..values.len()).map(|i| i as f64 * step).collect();
    least_squares_slope(&xs, values)
}

/// Ordinary least-squares slope of `ys` on `xs`.
pub fn least_squares_slope(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let nf = n as f64;
    let mean_x = xs[..n].iter().sum::<f64>() / nf;
    let mean_y = ys[..n].iter().sum::<f64>() / nf;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    for (x, y) in xs[..n].iter().zip(&ys[..n]) {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
    }
    if var_x.abs() < f64::EPSILON {
        return 0.0;
    }
    cov / var_x
}

#[cfg(test)]
pub(crate) fn test_snapshot(timestamp: f64, rss_mb: f64) -> MemorySnapshot {
    MemorySnapshot {
        timestamp,
        process_id: 42,
        rss_mb,
        vms_mb: rss_mb * 4.0,
        percent: rss_mb / 16_384.0 * 100.0,
        available_mb: 8_192.0,
        total_mb: 16_384.0,
        heap_allocated_mb: None,
        num_threads: 4,
        num_fds: Some(12),
        cpu_percent: 1.5,
    }
}
