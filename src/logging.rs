//! Logging setup for the retrain binary.
//!
//! One fmt layer on stderr with local timestamps. `RUST_LOG` wins over the
//! default level.

use time::{UtcOffset, format_description::FormatItem, macros::format_description};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Install the global subscriber. `verbose` lowers the default level to debug.
pub fn init(verbose: bool) -> Result<(), LoggingError> {
    let layer = fmt::layer()
        .with_timer(build_timer())
        .with_target(false)
        .with_writer(std::io::stderr);
    let subscriber = Registry::default()
        .with(build_env_filter(default_level(verbose)))
        .with(layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn default_level(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

fn build_timer() -> fmt::time::OffsetTime<time::format_description::BorrowedFormatItem<'static>> {
    const DISPLAY_FORMAT: &[FormatItem<'static>] =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    fmt::time::OffsetTime::new(offset, DISPLAY_FORMAT.into())
}

fn build_env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_switches_default_level() {
        assert_eq!(default_level(false), "info");
        assert_eq!(default_level(true), "debug");
    }
}
