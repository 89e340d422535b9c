//! Command handlers for heapscope CLI
//!
//! Each subcommand has its own module with handler functions.

pub mod configure;
pub mod decode;
pub mod simulate;
pub mod watch;
