//! Logging setup shared by hub device client binaries.
//!
//! Reads `LOG_FORMAT`, `RUST_LOG` and `DEPLOYMENT_ENV` and installs a
//! `tracing-subscriber` registry with a text or JSON formatter.

mod config;
mod context;
mod tracing_init;

pub use config::TelemetryConfig;
pub use context::TelemetryLabels;
pub use tracing_init::{init_telemetry, with_common_fields};

/// Installs the subscriber configured from the environment.
pub fn install(service_name: &str) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::from_env(
        service_name,
        env!("CARGO_PKG_VERSION"),
    ))
}
