use std::{io, sync::Arc, time::Duration};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    time,
};

use crate::veil::{
    config::Config,
    logging::DebugLog,
    session::{self, ActiveSessionGuard, SessionSet},
    telemetry,
    tunnel::{
        dialer::Dial,
        relay::{self, RelayOptions},
    },
};

pub const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const INTERNAL_ERROR: &[u8] =
    b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const SERVICE_UNAVAILABLE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// How long live sessions get to finish once the listener stops.
pub const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_HEADERS: usize = 64;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("proxy: method {0} not supported")]
    Method(String),
    #[error("proxy: malformed request head: {0}")]
    Malformed(httparse::Error),
    #[error("proxy: request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("proxy: CONNECT without target")]
    MissingTarget,
    #[error("proxy: client closed before sending a request head")]
    Eof,
    #[error("proxy: read request head: {0}")]
    Io(#[source] io::Error),
    #[error("proxy: no request head within {}", humantime::format_duration(*.0))]
    Timeout(Duration),
}

impl ProtocolError {
    /// Status line sent back to the client, if the client is still worth answering.
    fn response(&self) -> Option<&'static [u8]> {
        match self {
            ProtocolError::Method(_) => Some(SERVICE_UNAVAILABLE),
            ProtocolError::Malformed(_)
            | ProtocolError::TooLarge(_)
            | ProtocolError::MissingTarget => Some(BAD_REQUEST),
            ProtocolError::Eof | ProtocolError::Io(_) | ProtocolError::Timeout(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum HijackError {
    #[error("proxy: connection does not support raw takeover")]
    Unsupported,
    #[error("proxy: connection already detached: {0}")]
    Detached(#[source] io::Error),
}

impl HijackError {
    fn response(&self) -> &'static [u8] {
        match self {
            HijackError::Unsupported => INTERNAL_ERROR,
            HijackError::Detached(_) => SERVICE_UNAVAILABLE,
        }
    }
}

/// A server-side connection that can give up its raw byte stream.
///
/// After a successful hijack the handler owns the stream exclusively and no
/// longer speaks HTTP on it. On failure the connection comes back so an
/// error status can still be written.
pub trait Hijack: AsyncRead + AsyncWrite + Unpin + Send + Sized + 'static {
    type Raw: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn hijack(self) -> Result<Self::Raw, (Self, HijackError)>;
}

impl Hijack for TcpStream {
    type Raw = TcpStream;

    fn hijack(self) -> Result<TcpStream, (Self, HijackError)> {
        match self.peer_addr() {
            Ok(_) => Ok(self),
            Err(err) => Err((self, HijackError::Detached(err))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// `host:port` exactly as the client sent it.
    pub target: String,
}

/// Parses one request head. `Ok(None)` means more bytes are needed.
///
/// On success also returns the head length; anything after it is payload the
/// client pipelined.
pub fn parse_head(buf: &[u8]) -> Result<Option<(ConnectRequest, usize)>, ProtocolError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf).map_err(ProtocolError::Malformed)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let method = req.method.unwrap_or_default();
    if method != "CONNECT" {
        return Err(ProtocolError::Method(method.to_string()));
    }

    let mut target = req.path.unwrap_or_default().trim().to_string();
    if target.is_empty() {
        target = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
    }
    if target.is_empty() {
        return Err(ProtocolError::MissingTarget);
    }

    Ok(Some((ConnectRequest { target }, len)))
}

async fn read_head<S>(conn: &mut S, max: usize) -> Result<(ConnectRequest, Bytes), ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096.min(max));
    let mut tmp = vec![0u8; 4096];
    loop {
        let n = conn.read(&mut tmp).await.map_err(ProtocolError::Io)?;
        if n == 0 {
            return Err(ProtocolError::Eof);
        }
        buf.extend_from_slice(&tmp[..n]);

        if let Some((req, len)) = parse_head(&buf)? {
            if len > max {
                return Err(ProtocolError::TooLarge(max));
            }
            let pipelined = buf.split_off(len).freeze();
            return Ok((req, pipelined));
        }
        if buf.len() >= max {
            return Err(ProtocolError::TooLarge(max));
        }
    }
}

pub struct ConnectOptions {
    pub dialer: Arc<dyn Dial>,
    pub chunk_bytes: usize,
    pub max_header_bytes: usize,
    /// Deadline for the request head. Zero disables it.
    pub handshake_timeout: Duration,
    /// Relay idle deadline. Zero disables it.
    pub idle_timeout: Duration,
    pub debug: DebugLog,
}

impl ConnectOptions {
    pub fn from_config(cfg: &Config, dialer: Arc<dyn Dial>) -> Self {
        Self {
            dialer,
            chunk_bytes: cfg.chunk_bytes,
            max_header_bytes: cfg.max_header_bytes,
            handshake_timeout: cfg.timeouts.handshake,
            idle_timeout: cfg.timeouts.idle,
            debug: DebugLog::new(cfg.debug),
        }
    }
}

#[derive(Clone)]
pub struct ConnectHandler {
    opts: Arc<ConnectOptions>,
}

impl ConnectHandler {
    pub fn new(opts: ConnectOptions) -> Self {
        Self {
            opts: Arc::new(opts),
        }
    }

    /// Runs one proxy connection from request head to relay teardown.
    pub async fn handle<S: Hijack>(&self, mut conn: S, client: &str) {
        let _active = ActiveSessionGuard::new();
        let sid = session::new_session_id();
        let opts = &self.opts;

        let head = if opts.handshake_timeout.is_zero() {
            read_head(&mut conn, opts.max_header_bytes).await
        } else {
            time::timeout(opts.handshake_timeout, read_head(&mut conn, opts.max_header_bytes))
                .await
                .unwrap_or(Err(ProtocolError::Timeout(opts.handshake_timeout)))
        };
        let (req, pipelined) = match head {
            Ok(v) => v,
            Err(err) => {
                if let Some(resp) = err.response() {
                    metrics::counter!(telemetry::CONNECT_REJECTED_TOTAL).increment(1);
                    let _ = conn.write_all(resp).await;
                }
                tracing::debug!(sid = %sid, client = %client, err = %err, "proxy: request rejected");
                let _ = conn.shutdown().await;
                return;
            }
        };

        tracing::info!(sid = %sid, client = %client, dest = %req.target, "proxy: connect");

        let mut raw = match conn.hijack() {
            Ok(raw) => raw,
            Err((mut conn, err)) => {
                metrics::counter!(telemetry::CONNECT_REJECTED_TOTAL).increment(1);
                tracing::warn!(sid = %sid, client = %client, err = %err, "proxy: hijack failed");
                let _ = conn.write_all(err.response()).await;
                let _ = conn.shutdown().await;
                return;
            }
        };

        if let Err(err) = raw.write_all(ESTABLISHED).await {
            opts.debug.error(&sid, "established", &err);
            return;
        }

        // The client already saw 200, so a failed dial can only close the socket.
        let tunnel = match opts.dialer.dial(&req.target).await {
            Ok(t) => t,
            Err(err) => {
                metrics::counter!(telemetry::DIAL_FAILURES_TOTAL).increment(1);
                opts.debug.error(&sid, "dial", &err);
                let _ = raw.shutdown().await;
                return;
            }
        };

        let relay_opts = RelayOptions::new(opts.chunk_bytes)
            .with_idle_timeout(opts.idle_timeout)
            .with_prelude(pipelined);
        let report = relay::run(raw, tunnel, relay_opts).await;

        telemetry::record_relay(&report);
        if let Some(err) = &report.error {
            opts.debug.error(&sid, "relay", err);
        }
        tracing::debug!(
            sid = %sid,
            dest = %req.target,
            up_bytes = report.upstream.bytes,
            up_msgs = report.upstream.messages,
            down_bytes = report.downstream.bytes,
            down_msgs = report.downstream.messages,
            discarded = report.discarded,
            ended_by = ?report.ended_by,
            "proxy: session closed"
        );
    }
}

pub async fn bind(listen_addr: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))
}

/// Accepts CONNECT clients until `shutdown` flips to true, then drains the
/// sessions that are still running.
pub async fn serve_with_shutdown(
    ln: TcpListener,
    handler: ConnectHandler,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local = ln.local_addr().context("listener local addr")?;
    tracing::info!(listen_addr = %local, "proxy: listening");

    let mut sessions = SessionSet::new();
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        // Usually fd exhaustion; back off instead of spinning.
                        tracing::warn!(err = %err, "proxy: accept failed");
                        time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let _ = conn.set_nodelay(true);
                sessions.reap();

                let h = handler.clone();
                sessions.spawn(async move {
                    let client = peer.to_string();
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %client, "proxy: accepted");
                    }
                    h.handle(conn, &client).await;
                });
            }
        }
    }

    drop(ln);
    let live = sessions.len();
    let aborted = sessions.drain(SESSION_DRAIN_TIMEOUT).await;
    tracing::info!(live, aborted, "proxy: stopped");
    Ok(())
}
