//! Command implementations shared by the CLI; each returns a JSON value.

mod profile_cmd;
mod watch_cmd;

pub use profile_cmd::*;
pub use watch_cmd::*;
