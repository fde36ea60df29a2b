//! Duplex pump between a raw client socket and a tunnel connection.
//!
//! Raw bytes go up as binary messages, one message per read. Binary messages
//! coming down are written to the raw socket; every other message type is
//! dropped. The session ends as soon as either direction finishes, or when
//! neither direction has moved data for the idle timeout, after which the
//! tunnel gets a Close frame and the raw socket a write shutdown.

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::{self, Instant},
};
use tokio_tungstenite::tungstenite::{self, Message};

/// Upper bound on teardown steps (Close frame, raw shutdown).
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay: raw connection: {0}")]
    Io(#[from] io::Error),
    #[error("relay: tunnel: {0}")]
    Tunnel(#[from] tungstenite::Error),
    #[error("relay: idle for {}", humantime::format_duration(*.0))]
    Idle(Duration),
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Read size on the raw side, and write slice size on the way back.
    pub chunk_bytes: usize,
    /// How long the session may go without data in either direction. `None`
    /// waits forever.
    pub idle_timeout: Option<Duration>,
    /// Bytes already read from the client before the relay started.
    pub prelude: Bytes,
}

impl RelayOptions {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            chunk_bytes: chunk_bytes.max(1),
            idle_timeout: None,
            prelude: Bytes::new(),
        }
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = (!idle.is_zero()).then_some(idle);
        self
    }

    pub fn with_prelude(mut self, prelude: Bytes) -> Self {
        self.prelude = prelude;
        self
    }
}

/// What finished the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndedBy {
    /// Raw to tunnel: the client hung up or its socket failed.
    Client,
    /// Tunnel to raw: the relay closed, failed, or the client write failed.
    Relay,
    /// Neither direction moved data for the idle timeout.
    Idle,
}

/// Last time either direction moved data, shared by both pumps.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Resolves once the session has been quiet for `limit`; never without one.
    async fn expired(&self, limit: Option<Duration>) -> RelayError {
        let Some(limit) = limit else {
            return std::future::pending().await;
        };
        loop {
            let last = self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
            let deadline = last + limit;
            if Instant::now() >= deadline {
                return RelayError::Idle(limit);
            }
            time::sleep_until(deadline).await;
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub bytes: u64,
    pub messages: u64,
}

impl Flow {
    fn record(&mut self, n: usize) {
        self.bytes += n as u64;
        self.messages += 1;
    }
}

#[derive(Debug)]
pub struct RelayReport {
    pub upstream: Flow,
    pub downstream: Flow,
    /// Non-binary tunnel messages that were dropped.
    pub discarded: u64,
    pub ended_by: EndedBy,
    /// Set when the finishing direction ended on an error rather than EOF or Close.
    pub error: Option<RelayError>,
}

pub async fn run<R, T>(raw: R, tunnel: T, opts: RelayOptions) -> RelayReport
where
    R: AsyncRead + AsyncWrite + Unpin,
    T: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let (mut raw_rd, mut raw_wr) = tokio::io::split(raw);
    let (mut sink, mut stream) = tunnel.split();

    let mut upstream = Flow::default();
    let mut downstream = Flow::default();
    let mut discarded = 0u64;
    let activity = Activity::new();

    let (ended_by, res) = {
        let up = pump_up(&mut raw_rd, &mut sink, &opts, &activity, &mut upstream);
        let down = pump_down(
            &mut stream,
            &mut raw_wr,
            &opts,
            &activity,
            &mut downstream,
            &mut discarded,
        );
        tokio::select! {
            res = up => (EndedBy::Client, res),
            res = down => (EndedBy::Relay, res),
            err = activity.expired(opts.idle_timeout) => (EndedBy::Idle, Err(err)),
        }
    };

    // Both halves may already be gone; errors here change nothing.
    let _ = time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
    let _ = time::timeout(CLOSE_TIMEOUT, raw_wr.shutdown()).await;

    RelayReport {
        upstream,
        downstream,
        discarded,
        ended_by,
        error: res.err(),
    }
}

async fn pump_up<R, S>(
    raw: &mut R,
    sink: &mut S,
    opts: &RelayOptions,
    activity: &Activity,
    flow: &mut Flow,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    if !opts.prelude.is_empty() {
        let n = opts.prelude.len();
        sink.send(Message::Binary(opts.prelude.clone())).await?;
        activity.touch();
        flow.record(n);
    }

    let mut buf = vec![0u8; opts.chunk_bytes];
    loop {
        let n = raw.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        activity.touch();
        let msg = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
        sink.send(msg).await?;
        activity.touch();
        flow.record(n);
    }
}

async fn pump_down<S, W>(
    stream: &mut S,
    raw: &mut W,
    opts: &RelayOptions,
    activity: &Activity,
    flow: &mut Flow,
    discarded: &mut u64,
) -> Result<(), RelayError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = match stream.next().await {
            None => return Ok(()),
            Some(Ok(msg)) => msg,
            Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                return Ok(());
            }
            Some(Err(err)) => return Err(err.into()),
        };

        match msg {
            Message::Binary(payload) => {
                activity.touch();
                for piece in payload.chunks(opts.chunk_bytes) {
                    raw.write_all(piece).await?;
                    activity.touch();
                }
                flow.record(payload.len());
            }
            Message::Close(_) => return Ok(()),
            _ => *discarded += 1,
        }
    }
}
