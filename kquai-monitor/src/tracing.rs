//! Provide tracing, tailored to this program.
//!
//! The daemon calls [`init_journald_or_stdout`] once at startup to install a
//! subscriber. Everything else does `use crate::tracing::prelude::*` and
//! logs through the usual `trace!()` .. `error!()` macros, attaching block
//! numbers, RPC methods and batch sizes as structured fields.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{Directive, EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging.
///
/// Under systemd (`JOURNAL_STREAM` set) events go to journald; otherwise to
/// stdout. `default_level` is the directive used when `RUST_LOG` is unset,
/// typically `log.level` from the config file.
pub fn init_journald_or_stdout(default_level: Option<&str>) {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry().with(layer).init();
        } else {
            use_stdout(default_level);
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout(default_level);
    }
}

fn default_directive(level: Option<&str>) -> Directive {
    level
        .and_then(|l| l.parse::<Directive>().ok())
        .unwrap_or_else(|| LevelFilter::INFO.into())
}

// Log to stdout, filtering according to RUST_LOG on top of the configured
// default level.
fn use_stdout(default_level: Option<&str>) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive(default_level))
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Local time to the nearest second; block numbers already give ordering
// finer than that.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let stamp = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{stamp}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_falls_back_to_info() {
        assert_eq!(default_directive(None).to_string(), "info");
    }

    #[test]
    fn test_default_directive_from_config() {
        assert_eq!(default_directive(Some("debug")).to_string(), "debug");
        assert_eq!(
            default_directive(Some("kquai_monitor=trace")).to_string(),
            "kquai_monitor=trace"
        );
    }
}
