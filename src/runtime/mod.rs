//! In-process bookkeeping used by the monitor and alert manager.

mod alloc_trace;
mod history;

pub use alloc_trace::*;
pub use history::*;
