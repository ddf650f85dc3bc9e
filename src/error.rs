//! Crate-wide error types.

use thiserror::Error;

pub type MemtrendResult<T> = Result<T, MemtrendError>;

#[derive(Debug, Error)]
pub enum MemtrendError {
    #[error("no snapshots captured; call start() or capture_snapshot() first")]
    NoSnapshots,

    #[error("component {component:?} has {markers} marker(s); at least 2 are required")]
    InsufficientMarkers { component: String, markers: usize },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("time format error: {0}")]
    TimeFormat(String),
}

impl From<time::error::Format> for MemtrendError {
    fn from(value: time::error::Format) -> Self {
        Self::TimeFormat(value.to_string())
    }
}
