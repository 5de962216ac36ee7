//! Infrastructure - configuration, metrics, and logging
//!
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `logging` - tracing subscriber setup

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::Config;
pub use metrics::Metrics;
