//! `memtrend.toml` config loading.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

use crate::{AlertLevel, Metric};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Root directory of the profile store.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub trend: TrendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MonitorConfig {
    /// Blocking window for the CPU sample. 0 disables the wait.
    #[serde(default = "default_cpu_sample_interval_ms")]
    pub cpu_sample_interval_ms: u64,

    /// Ring-buffer bound on stored snapshots; unbounded when absent.
    #[serde(default)]
    pub max_snapshots: Option<usize>,

    #[serde(default = "default_leak_threshold")]
    pub leak_threshold_mb_per_hour: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ThresholdSet {
    pub rss_mb: Option<f64>,
    pub percent: Option<f64>,
    pub growth_mb_per_hour: Option<f64>,
}

impl ThresholdSet {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::RssMb => self.rss_mb,
            Metric::Percent => self.percent,
            Metric::GrowthMbPerHour => self.growth_mb_per_hour,
        }
    }

    pub fn set(&mut self, metric: Metric, value: f64) {
        let slot = match metric {
            Metric::RssMb => &mut self.rss_mb,
            Metric::Percent => &mut self.percent,
            Metric::GrowthMbPerHour => &mut self.growth_mb_per_hour,
        };
        *slot = Some(value);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AlertConfig {
    /// Ring-buffer bound on alert history; unbounded when absent.
    #[serde(default)]
    pub max_history: Option<usize>,

    #[serde(default = "default_info_thresholds")]
    pub info: ThresholdSet,

    #[serde(default = "default_warning_thresholds")]
    pub warning: ThresholdSet,

    #[serde(default = "default_critical_thresholds")]
    pub critical: ThresholdSet,
}

impl AlertConfig {
    pub fn thresholds(&self, level: AlertLevel) -> &ThresholdSet {
        match level {
            AlertLevel::Info => &self.info,
            AlertLevel::Warning => &self.warning,
            AlertLevel::Critical => &self.critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TrendConfig {
    #[serde(default = "default_regression_threshold")]
    pub regression_threshold_mb: f64,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".memtrend")
}

fn default_cpu_sample_interval_ms() -> u64 {
    50
}

fn default_leak_threshold() -> f64 {
    10.0
}

fn default_regression_threshold() -> f64 {
    50.0
}

fn default_info_thresholds() -> ThresholdSet {
    ThresholdSet {
        rss_mb: Some(512.0),
        percent: Some(50.0),
        growth_mb_per_hour: Some(10.0),
    }
}

fn default_warning_thresholds() -> ThresholdSet {
    ThresholdSet {
        rss_mb: Some(1024.0),
        percent: Some(75.0),
        growth_mb_per_hour: Some(50.0),
    }
}

fn default_critical_thresholds() -> ThresholdSet {
    ThresholdSet {
        rss_mb: Some(2048.0),
        percent: Some(90.0),
        growth_mb_per_hour: Some(100.0),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            monitor: MonitorConfig::default(),
            alerts: AlertConfig::default(),
            trend: TrendConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cpu_sample_interval_ms: default_cpu_sample_interval_ms(),
            max_snapshots: None,
            leak_threshold_mb_per_hour: default_leak_threshold(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_history: None,
            info: default_info_thresholds(),
            warning: default_warning_thresholds(),
            critical: default_critical_thresholds(),
        }
    }
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            regression_threshold_mb: default_regression_threshold(),
        }
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    /// Strict variant of [`Config::load_optional`].
    pub fn load(path: &Path) -> crate::MemtrendResult<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(toml::from_str::<Config>(&s)?)
    }
}
