use std::{path::PathBuf, sync::Arc};

use anyhow::Context;

use crate::veil::{
    config, logging, net, proxy, telemetry,
    tunnel::dialer::{DialerOptions, WsDialer},
};

pub async fn run(config_path: Option<PathBuf>, overrides: config::Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path);

    let cfg = match &resolved {
        Some(r) => config::load(Some(r), overrides)
            .with_context(|| format!("load config: {}", r.path.display()))?,
        None => config::load(None, overrides).context("load config")?,
    };

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if let Some(addr) = cfg.metrics_addr {
        telemetry::init_prometheus(addr)?;
        tracing::info!(metrics_addr = %addr, "metrics: listening");
    }

    let listen_addr = net::bind_addr(&cfg.listen_host, cfg.port);

    tracing::info!(
        config = %resolved.as_ref().map(|r| r.path.display().to_string()).unwrap_or_else(|| "<none>".into()),
        config_source = %resolved.as_ref().map(|r| r.source.to_string()).unwrap_or_else(|| "flags".into()),
        listen_addr = %listen_addr,
        relay = %cfg.relay,
        chunk_bytes = cfg.chunk_bytes,
        dial_timeout = %humantime::format_duration(cfg.timeouts.dial),
        idle_timeout = %humantime::format_duration(cfg.timeouts.idle),
        debug = cfg.debug,
        "veil: starting"
    );

    // Bind before anything else listens for signals so a taken port fails fast.
    let ln = proxy::bind(&listen_addr).await?;

    let dialer = Arc::new(WsDialer::new(DialerOptions::from_config(&cfg)));
    let handler = proxy::ConnectHandler::new(proxy::ConnectOptions::from_config(&cfg, dialer));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut server = tokio::spawn(proxy::serve_with_shutdown(ln, handler, shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = &mut server => {
            return res.context("proxy task")?;
        }
    }

    server.await.context("proxy task")?
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
