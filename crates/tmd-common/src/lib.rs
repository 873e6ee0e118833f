//! ---
//! tmd_section: "01-core-functionality"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Shared primitives and utilities for the guard runtime."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
//! Core shared primitives for the TMD guard workspace.
//! This crate exposes configuration loading, logging, and the clock
//! abstraction consumed by the resilience core and the daemon.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    ApiConfig, AppConfig, ConfigError, GuardConfig, LoggingConfig, MetricsConfig, ProbeKind,
    ProbeTargetConfig, QualityGateConfig, RetryConfig,
};
pub use logging::{init_tracing, LogConsole, LogFormat};
pub use time::{Clock, ManualClock, SharedClock, SystemClock};
