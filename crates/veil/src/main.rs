mod veil;

use std::{path::PathBuf, time::Duration};

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "veil",
    version,
    about = "Veil - HTTP CONNECT proxy tunnelling over TLS + WebSocket"
)]
struct Cli {
    /// Path to a config file (.toml/.yaml/.yml). If omitted, auto-detects veil.toml > veil.yaml > veil.yml in the CWD, then the OS default path (Linux: /etc/veil/veil.toml). Flags override file values.
    #[arg(short, long, env = "VEIL_CONFIG")]
    config: Option<PathBuf>,

    /// Local proxy port.
    #[arg(long, env = "VEIL_PORT")]
    port: Option<i64>,

    /// Shared secret sent to the relay.
    #[arg(long, env = "VEIL_PASSWORD")]
    pwd: Option<String>,

    /// Relay address: host[:port][/path].
    #[arg(long, env = "VEIL_WSS")]
    wss: Option<String>,

    /// Relay chunk size in KiB (1-1024).
    #[arg(long, env = "VEIL_CHUNK")]
    chunk: Option<i64>,

    /// Log per-session failures.
    #[arg(long, env = "VEIL_DEBUG")]
    debug: bool,

    /// Interface to listen on.
    #[arg(long, env = "VEIL_LISTEN_HOST")]
    listen_host: Option<String>,

    /// Deadline for connecting to the relay, e.g. "30s".
    #[arg(long, env = "VEIL_DIAL_TIMEOUT", value_parser = humantime::parse_duration)]
    dial_timeout: Option<Duration>,

    /// Close sessions idle for this long, e.g. "5m". 0 disables.
    #[arg(long, env = "VEIL_IDLE_TIMEOUT", value_parser = humantime::parse_duration)]
    idle_timeout: Option<Duration>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "VEIL_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let overrides = veil::config::Overrides {
        listen_host: cli.listen_host,
        port: cli.port,
        password: cli.pwd,
        relay: cli.wss,
        chunk_kib: cli.chunk,
        debug: cli.debug,
        dial_timeout: cli.dial_timeout,
        idle_timeout: cli.idle_timeout,
        metrics_addr: cli.metrics_addr,
    };
    veil::run(cli.config, overrides).await
}
