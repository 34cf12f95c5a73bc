//! Logger configuration.
//!
//! Opsgate emits single-line records tagged with the module target so
//! operators can filter pipeline stages (`opsgate::services::proxy`,
//! `opsgate::services::registry`, ...) next to the per-request lines the
//! correlation middleware produces. Timestamps are UTC with millisecond
//! precision, matching the call-log records.
//!
//! `RUST_LOG` controls filtering (default `info`). Level coloring uses
//! the terminal detection built into `env_logger`, which also honors
//! the `NO_COLOR` convention for log aggregation systems.

use std::io::Write;

use chrono::Utc;
use env_logger::Builder;

/// Initialize the logging system. Call once during startup; repeated
/// calls (tests spin up many gateways) are ignored.
pub fn configure_logger() {
    Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "{} {style}{:<5}{style:#} {} > {}",
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.level(),
                record.target(),
                record.args(),
            )
        })
        .try_init()
        .ok();
}
