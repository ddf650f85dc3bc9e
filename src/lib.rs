//! memtrend: process memory sampling, leak estimation, threshold alerts and
//! persisted session profiles with cross-run trend detection.

mod alerts;
mod clock;
mod cmd;
mod config;
mod error;
mod fsutil;
mod metadata;
mod monitor;
mod runtime;
mod sampler;
mod snapshot;
mod store;
mod trend;

pub use alerts::*;
pub use clock::*;
pub use cmd::*;
pub use config::*;
pub use error::*;
pub use fsutil::*;
pub use metadata::*;
pub use monitor::*;
pub use runtime::*;
pub use sampler::*;
pub use snapshot::*;
pub use store::*;
pub use trend::*;
