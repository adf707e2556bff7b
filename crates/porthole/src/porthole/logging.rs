use std::{io, path::PathBuf};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::porthole::config;

#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

impl LogOutput {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "" | "stderr" => LogOutput::Stderr,
            "stdout" => LogOutput::Stdout,
            "discard" => LogOutput::Discard,
            path => LogOutput::File(PathBuf::from(path)),
        }
    }

    fn is_terminal_stream(&self) -> bool {
        matches!(self, LogOutput::Stderr | LogOutput::Stdout)
    }

    fn open(&self) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
        let pair = match self {
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Discard => tracing_appender::non_blocking(io::sink()),
            LogOutput::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("logging: open {}", path.display()))?;
                tracing_appender::non_blocking(file)
            }
        };
        Ok(pair)
    }
}

/// Installs the global subscriber. The returned runtime must outlive all logging.
pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&logging.level)))
        .context("logging: init filter")?;

    let format = parse_format(&logging.format);
    let output = LogOutput::parse(&logging.output);
    let (writer, guard) = output.open()?;

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(format == LogFormat::Text && output.is_terminal_stream())
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let layer = match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Text => layer.boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn parse_format(s: &str) -> LogFormat {
    if s.trim().eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_levels_default_to_info() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive(" warn "), "warn");
        assert_eq!(level_directive("verbose"), "info");
        assert_eq!(level_directive(""), "info");
    }

    #[test]
    fn output_targets() {
        assert_eq!(LogOutput::parse(""), LogOutput::Stderr);
        assert_eq!(LogOutput::parse(" stdout "), LogOutput::Stdout);
        assert_eq!(LogOutput::parse("discard"), LogOutput::Discard);
        assert_eq!(
            LogOutput::parse("/var/log/porthole.log"),
            LogOutput::File(PathBuf::from("/var/log/porthole.log"))
        );
        assert!(LogOutput::Stdout.is_terminal_stream());
        assert!(!LogOutput::Discard.is_terminal_stream());
    }

    #[test]
    fn file_output_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("porthole-log-{}", std::process::id()));
        let path = dir.join("nested").join("porthole.log");
        let (_writer, _guard) = LogOutput::File(path.clone()).open().unwrap();
        assert!(path.is_file());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn format_defaults_to_text() {
        assert_eq!(parse_format("JSON"), LogFormat::Json);
        assert_eq!(parse_format("text"), LogFormat::Text);
        assert_eq!(parse_format("other"), LogFormat::Text);
    }
}
