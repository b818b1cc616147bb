pub mod common;
pub mod completions;
pub mod config;
pub mod event;
pub mod session;
pub mod shift;
pub mod status;
pub mod sync;
pub mod watch;
