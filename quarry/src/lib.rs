//! `quarry`: thin library + CLI wrapper around the build & install
//! transaction engine (`quarry-recipe`, `quarry-store`, `quarry-build`,
//! `quarry-engine`). This crate wires argv to the engine's public API and
//! installs the process-wide `tracing` subscriber; it carries no behavior
//! of its own beyond that and the `Config` convenience type below.

pub mod config;
pub mod logging;

pub use config::Config;
pub use logging::{init_logging, success, LogLevel};
