use std::{
    fmt,
    io::{self, IsTerminal},
    path::PathBuf,
};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::veil::config;

/// Crates that are chatty at debug level; kept at warn unless `RUST_LOG` says otherwise.
const QUIET_DEPS: &[&str] = &["rustls", "tokio_tungstenite", "tungstenite"];

#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("logging: unknown format {other:?} (expected text or json)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

impl LogOutput {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "" | "stderr" => Self::Stderr,
            "stdout" => Self::Stdout,
            "discard" => Self::Discard,
            path => Self::File(PathBuf::from(path)),
        }
    }

    fn is_terminal(&self) -> bool {
        match self {
            Self::Stderr => io::stderr().is_terminal(),
            Self::Stdout => io::stdout().is_terminal(),
            Self::Discard | Self::File(_) => false,
        }
    }

    fn open(&self) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
        match self {
            Self::Stderr => Ok(tracing_appender::non_blocking(io::stderr())),
            Self::Stdout => Ok(tracing_appender::non_blocking(io::stdout())),
            Self::Discard => Ok(tracing_appender::non_blocking(io::sink())),
            Self::File(p) => {
                if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(p)
                    .with_context(|| format!("logging: open {}", p.display()))?;
                Ok(tracing_appender::non_blocking(file))
            }
        }
    }
}

/// Default filter for a configured level: veil at `level`, noisy TLS and
/// WebSocket internals capped at warn.
fn default_directives(level: &str) -> anyhow::Result<String> {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        "" => "info".to_string(),
        l @ ("trace" | "debug" | "info" | "warn" | "error") => l.to_string(),
        other => anyhow::bail!("logging: unknown level {other:?}"),
    };
    let mut directives = level;
    for dep in QUIET_DEPS {
        directives.push_str(&format!(",{dep}=warn"));
    }
    Ok(directives)
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let format = LogFormat::parse(&logging.format)?;
    let output = LogOutput::parse(&logging.output);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(default_directives(&logging.level)?)
            .context("logging: init filter")?,
    };

    let (writer, guard) = output.open()?;

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(format == LogFormat::Text && output.is_terminal())
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

/// Reporter for per-session failures.
///
/// Sessions fail silently unless debug mode is on: the client has already
/// been told the tunnel is established, so logs are the only place these
/// errors can go.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugLog {
    enabled: bool,
}

impl DebugLog {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn error(&self, sid: &str, stage: &'static str, err: &dyn fmt::Display) {
        if self.enabled {
            tracing::error!(sid = %sid, stage, err = %err, "session: failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_and_output_parsing() {
        assert_eq!(LogFormat::parse("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::parse("").unwrap(), LogFormat::Text);
        assert!(LogFormat::parse("xml").is_err());

        assert_eq!(LogOutput::parse(""), LogOutput::Stderr);
        assert_eq!(LogOutput::parse("stdout"), LogOutput::Stdout);
        assert_eq!(
            LogOutput::parse(" /var/log/veil.log "),
            LogOutput::File(PathBuf::from("/var/log/veil.log"))
        );
    }

    #[test]
    fn default_filter_quiets_tls_internals() {
        let d = default_directives("Debug").unwrap();
        assert!(d.starts_with("debug,"));
        assert!(d.contains("rustls=warn"));
        assert!(d.contains("tungstenite=warn"));
        assert!(EnvFilter::try_new(&d).is_ok());
        assert!(default_directives("loud").is_err());
    }
}
