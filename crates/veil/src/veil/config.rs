use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::veil::addr::{self, AddrError, RelayAddr};

pub const DEFAULT_PORT: i64 = 8080;
pub const DEFAULT_PASSWORD: &str = "testPASSword";
pub const DEFAULT_CHUNK_KIB: i64 = 64;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Addr(#[from] AddrError),
    #[error("config: read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config: parse {path}: {msg}")]
    Parse { path: PathBuf, msg: String },
    #[error("config: unsupported config extension {0:?} (expected .toml or .yaml/.yml)")]
    Extension(String),
    #[error("config: invalid metrics_addr {0:?}")]
    MetricsAddr(String),
    #[error("config: max_header_bytes must be at least 512")]
    HeaderLimit,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Process configuration. Built and validated once at startup, read-only after.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub port: u16,
    pub password: String,
    pub relay: RelayAddr,
    pub chunk_bytes: usize,
    pub debug: bool,
    pub max_header_bytes: usize,
    pub timeouts: Timeouts,
    pub metrics_addr: Option<SocketAddr>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Bounds TCP connect, TLS handshake and upgrade together.
    pub dial: Duration,
    /// Bounds reading the client's request head.
    pub handshake: Duration,
    /// Zero disables the relay idle deadline.
    pub idle: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

/// Values supplied on the command line (or through `VEIL_*` env vars).
/// `Some` wins over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen_host: Option<String>,
    pub port: Option<i64>,
    pub password: Option<String>,
    pub relay: Option<String>,
    pub chunk_kib: Option<i64>,
    pub debug: bool,
    pub dial_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub metrics_addr: Option<String>,
}

/// Resolve the config file: explicit flag, then `veil.*` in the working
/// directory, then the OS default location. Only existing files are picked
/// up implicitly; no file at all is fine.
pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> Option<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        if !p.as_os_str().is_empty() {
            return Some(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Flag,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    let p = default_config_path()?;
    if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
        return Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Default,
        });
    }
    None
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["veil.toml", "veil.yaml", "veil.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Some(PathBuf::from("/etc/veil/veil.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("dev", "veil", "veil").map(|p| p.config_dir().join("veil.toml"))
    }
}

/// Load and validate the full configuration.
pub fn load(
    file: Option<&ResolvedConfigPath>,
    overrides: Overrides,
) -> Result<Config, ConfigError> {
    let fc = match file {
        Some(r) => load_file(&r.path)?,
        None => FileConfig::default(),
    };
    Config::build(fc, overrides)
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let data = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let parse_err = |msg: String| ConfigError::Parse {
        path: path.to_path_buf(),
        msg,
    };

    match ext.as_str() {
        "toml" => toml::from_str(&s).map_err(|e| parse_err(e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(&s).map_err(|e| parse_err(e.to_string())),
        _ => Err(ConfigError::Extension(ext)),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_host: Option<String>,
    port: Option<i64>,
    password: Option<String>,
    relay: Option<String>,
    chunk_kib: Option<i64>,
    #[serde(default)]
    debug: bool,
    dial_timeout_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    max_header_bytes: Option<i64>,
    metrics_addr: Option<String>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn millis(v: Option<i64>) -> Option<Duration> {
    v.map(|ms| Duration::from_millis(ms.max(0) as u64))
}

impl Config {
    fn build(fc: FileConfig, o: Overrides) -> Result<Config, ConfigError> {
        let relay = o.relay.or(fc.relay).unwrap_or_default();
        let relay = RelayAddr::parse(relay.trim())?;

        let port = addr::validate_port(o.port.or(fc.port).unwrap_or(DEFAULT_PORT))?;
        let chunk_bytes =
            addr::validate_chunk_kib(o.chunk_kib.or(fc.chunk_kib).unwrap_or(DEFAULT_CHUNK_KIB))?;

        let max_header_bytes = match fc.max_header_bytes {
            None => DEFAULT_MAX_HEADER_BYTES,
            Some(n) if n >= 512 => n as usize,
            Some(_) => return Err(ConfigError::HeaderLimit),
        };

        let metrics_addr = match o.metrics_addr.or(fc.metrics_addr) {
            None => None,
            Some(s) if s.trim().is_empty() => None,
            Some(s) => Some(
                s.trim()
                    .parse::<SocketAddr>()
                    .map_err(|_| ConfigError::MetricsAddr(s.clone()))?,
            ),
        };

        let debug = o.debug || fc.debug;

        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: l.level.unwrap_or_else(|| default_level(debug).into()),
                format: l.format.unwrap_or_else(|| "text".into()),
                output: l.output.unwrap_or_else(|| "stderr".into()),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: default_level(debug).into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        let dial = o
            .dial_timeout
            .or(millis(fc.dial_timeout_ms))
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_DIAL_TIMEOUT);
        let handshake = millis(fc.handshake_timeout_ms)
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);
        let idle = o
            .idle_timeout
            .or(millis(fc.idle_timeout_ms))
            .unwrap_or(Duration::ZERO);

        Ok(Config {
            listen_host: o
                .listen_host
                .or(fc.listen_host)
                .map(|h| h.trim().to_string())
                .unwrap_or_default(),
            port,
            password: o
                .password
                .or(fc.password)
                .unwrap_or_else(|| DEFAULT_PASSWORD.to_string()),
            relay,
            chunk_bytes,
            debug,
            max_header_bytes,
            timeouts: Timeouts {
                dial,
                handshake,
                idle,
            },
            metrics_addr,
            logging,
        })
    }
}

fn default_level(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}
