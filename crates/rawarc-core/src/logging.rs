//! Logging init.
//!
//! Events render as `TIMESTAMP LEVEL: TAG: MESSAGE` with per-level ANSI
//! color, where TAG is the span chain (e.g. `audio.download`) or the event
//! target when no span is active. Output goes through the status sink so the
//! progress block stays below the log stream.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::term::{StatusSink, StatusWriter};

const COLOR_RESET: &str = "\x1b[0m";

/// Maps the user-facing level names (including the historical `fatal`) to a
/// tracing filter directive.
pub fn filter_for_level(name: &str) -> Result<&'static str> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" | "fatal" => "error",
        other => bail!("invalid log level '{other}'"),
    })
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level so ad-hoc filtering keeps working.
pub fn init(level: &str, sink: Arc<StatusSink>) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::new(filter_for_level(level)?),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(LogFormat)
        .with_writer(StatusWriter(sink))
        .try_init()
        .map_err(|e| anyhow::anyhow!("unable to install logger: {e}"))?;
    Ok(())
}

fn level_style(level: Level) -> (&'static str, &'static str) {
    if level == Level::ERROR {
        ("error", "\x1b[91m")
    } else if level == Level::WARN {
        ("warn", "\x1b[93m")
    } else if level == Level::INFO {
        ("info", "\x1b[32m")
    } else if level == Level::DEBUG {
        ("debug", "\x1b[36m")
    } else {
        ("trace", "\x1b[36m")
    }
}

struct LogFormat;

impl<S, N> FormatEvent<S, N> for LogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let (name, color) = level_style(*meta.level());

        write!(writer, "{color}")?;
        write!(writer, "{} ", Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"))?;
        write!(writer, "{name}:")?;
        for _ in name.len()..5 {
            writer.write_char(' ')?;
        }
        write!(writer, " ")?;

        let mut tag = String::new();
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                if !tag.is_empty() {
                    tag.push('.');
                }
                tag.push_str(span.name());
            }
        }
        if tag.is_empty() {
            tag.push_str(meta.target());
        }
        write!(writer, "{tag}: ")?;

        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer, "{COLOR_RESET}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_filters() {
        assert_eq!(filter_for_level("debug").unwrap(), "debug");
        assert_eq!(filter_for_level("INFO").unwrap(), "info");
        assert_eq!(filter_for_level("fatal").unwrap(), "error");
        assert!(filter_for_level("loud").is_err());
    }
}
