use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use rustls::{RootCertStore, pki_types::ServerName};
use thiserror::Error;
use tokio::{net::TcpStream, time};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::{
    client_async_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
    },
};

use crate::veil::{
    addr::{self, RelayAddr},
    config::Config,
    tunnel::{
        fingerprint::{self, HelloProfile},
        transport::{BoxedStream, TunnelConn},
    },
};

pub const TARGET_HEADER: &str = "x-target";
pub const PASSWORD_HEADER: &str = "x-password";

/// Upper bound for a single inbound tunnel message or frame, including ones
/// that get discarded.
pub const MAX_TUNNEL_MESSAGE: usize = 16 << 20;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial: connect {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("dial: timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    #[error("dial: invalid tls server name {0:?}")]
    ServerName(String),
    #[error("dial: tls config: {0}")]
    TlsConfig(#[from] rustls::Error),
    #[error("dial: tls handshake: {0}")]
    Handshake(#[source] io::Error),
    #[error("dial: invalid {name} header value")]
    Header { name: &'static str },
    #[error("dial: upgrade: {0}")]
    Upgrade(#[source] tungstenite::Error),
    #[error("dial: relay rejected upgrade with {status}: {body:?}")]
    Rejected { status: StatusCode, body: String },
}

/// Opens tunnel connections to the relay for a given CONNECT target.
#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, target: &str) -> Result<TunnelConn, DialError>;
}

#[derive(Debug, Clone)]
pub struct DialerOptions {
    pub relay: RelayAddr,
    pub password: String,
    /// Covers TCP connect, TLS handshake and upgrade. Nothing bounds the
    /// connection once it is returned.
    pub timeout: Duration,
    pub roots: Arc<RootCertStore>,
}

impl DialerOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            relay: cfg.relay.clone(),
            password: cfg.password.clone(),
            timeout: cfg.timeouts.dial,
            roots: fingerprint::default_roots(),
        }
    }
}

/// Dials `wss://<relay>` over TLS with a freshly randomized ClientHello.
pub struct WsDialer {
    opts: DialerOptions,
}

impl WsDialer {
    pub fn new(opts: DialerOptions) -> Self {
        Self { opts }
    }

    async fn dial_once(&self, target: &str, profile: &HelloProfile) -> Result<TunnelConn, DialError> {
        let addr = self.opts.relay.dial_addr();
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|source| DialError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        let name = server_name(&addr)?;

        let connector = TlsConnector::from(Arc::new(profile.client_config(self.opts.roots.clone())?));
        // On failure the TCP stream is dropped (and closed) with the future.
        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(DialError::Handshake)?;

        let mut request = self
            .opts
            .relay
            .url()
            .into_client_request()
            .map_err(DialError::Upgrade)?;
        let headers = request.headers_mut();
        headers.insert(
            HeaderName::from_static(TARGET_HEADER),
            HeaderValue::from_str(target).map_err(|_| DialError::Header {
                name: TARGET_HEADER,
            })?,
        );
        headers.insert(
            HeaderName::from_static(PASSWORD_HEADER),
            HeaderValue::from_str(&self.opts.password).map_err(|_| DialError::Header {
                name: PASSWORD_HEADER,
            })?,
        );

        let stream: BoxedStream = Box::new(tls);
        match client_async_with_config(request, stream, Some(tunnel_ws_config())).await {
            Ok((ws, _resp)) => Ok(ws),
            Err(tungstenite::Error::Http(resp)) => {
                let body = resp
                    .body()
                    .as_deref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Err(DialError::Rejected {
                    status: resp.status(),
                    body,
                })
            }
            Err(err) => Err(DialError::Upgrade(err)),
        }
    }
}

#[async_trait]
impl Dial for WsDialer {
    async fn dial(&self, target: &str) -> Result<TunnelConn, DialError> {
        let profile = HelloProfile::random();
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                dest = %target,
                relay = %self.opts.relay,
                hello = %profile.signature(),
                "dial: start"
            );
        }

        match time::timeout(self.opts.timeout, self.dial_once(target, &profile)).await {
            Ok(res) => res,
            Err(_) => Err(DialError::Timeout(self.opts.timeout)),
        }
    }
}

/// TLS server name for a `host:port` dial address.
///
/// Uses the host with the port stripped; if that is not a usable name, the
/// whole address is tried before giving up.
fn server_name(addr: &str) -> Result<ServerName<'static>, DialError> {
    let sni = addr::sni_host(addr);
    ServerName::try_from(sni.to_string())
        .or_else(|_| ServerName::try_from(addr.to_string()))
        .map_err(|_| DialError::ServerName(sni.to_string()))
}

/// WebSocket limits shared by every tunnel connection.
pub fn tunnel_ws_config() -> WebSocketConfig {
    let mut cfg = WebSocketConfig::default();
    cfg.max_message_size = Some(MAX_TUNNEL_MESSAGE);
    cfg.max_frame_size = Some(MAX_TUNNEL_MESSAGE);
    cfg
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::veil::tunnel::fixtures::{self, RelayMode};

    fn options(relay: &fixtures::TestRelay, password: &str) -> DialerOptions {
        DialerOptions {
            relay: relay.relay_addr(),
            password: password.into(),
            timeout: Duration::from_secs(5),
            roots: relay.roots.clone(),
        }
    }

    #[test]
    fn server_name_strips_port_or_degrades() {
        assert_eq!(
            server_name("relay.example.com:8443").unwrap(),
            ServerName::try_from("relay.example.com").unwrap()
        );
        assert!(matches!(
            server_name("10.0.0.1:443").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("a..b:443"),
            Err(DialError::ServerName(ref s)) if s == "a..b"
        ));
    }

    #[tokio::test]
    async fn dial_sends_target_and_password_headers() {
        let mut relay = fixtures::spawn_relay("s3cret", RelayMode::Echo).await;
        let dialer = WsDialer::new(options(&relay, "s3cret"));

        let mut ws = dialer.dial("example.com:443").await.expect("dial");

        let up = relay.upgrades.recv().await.expect("upgrade captured");
        assert_eq!(up.target.as_deref(), Some("example.com:443"));
        assert_eq!(up.password.as_deref(), Some("s3cret"));
        assert_eq!(up.path, "/tunnel");

        ws.send(Message::Binary(Bytes::from_static(b"hello")))
            .await
            .expect("send");
        let echoed = ws.next().await.expect("frame").expect("ok");
        assert_eq!(echoed, Message::Binary(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn target_header_is_passed_verbatim() {
        let mut relay = fixtures::spawn_relay("pw", RelayMode::Echo).await;
        let dialer = WsDialer::new(options(&relay, "pw"));

        for target in ["Example.COM:443", "10.0.0.1:22", "a-b.c.d:8080"] {
            let _ws = dialer.dial(target).await.expect("dial");
            let up = relay.upgrades.recv().await.expect("upgrade captured");
            assert_eq!(up.target.as_deref(), Some(target));
        }
    }

    #[tokio::test]
    async fn rejected_upgrade_reports_status() {
        let relay = fixtures::spawn_relay("right", RelayMode::Echo).await;
        let dialer = WsDialer::new(options(&relay, "wrong"));

        let err = dialer.dial("example.com:443").await.err().expect("dial should fail");
        match err {
            DialError::Rejected { status, body } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert!(body.is_empty() || body.contains("wrong password"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_failure_is_a_dial_error() {
        // Grab a free port, then close it so nothing is listening.
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        drop(ln);

        let dialer = WsDialer::new(DialerOptions {
            relay: RelayAddr::parse(&format!("127.0.0.1:{port}")).unwrap(),
            password: "pw".into(),
            timeout: Duration::from_secs(5),
            roots: fingerprint::default_roots(),
        });
        let err = dialer.dial("example.com:443").await.err().expect("dial should fail");
        assert!(matches!(err, DialError::Connect { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn stalled_handshake_hits_the_deadline() {
        let relay = fixtures::spawn_relay("pw", RelayMode::Stall).await;
        let mut opts = options(&relay, "pw");
        opts.timeout = Duration::from_millis(200);
        let dialer = WsDialer::new(opts);

        let started = std::time::Instant::now();
        let err = dialer.dial("example.com:443").await.err().expect("dial should fail");
        assert!(matches!(err, DialError::Timeout(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn untrusted_certificate_fails_handshake() {
        let relay = fixtures::spawn_relay("pw", RelayMode::Echo).await;
        let mut opts = options(&relay, "pw");
        opts.roots = fingerprint::default_roots();
        let dialer = WsDialer::new(opts);

        let err = dialer.dial("example.com:443").await.err().expect("dial should fail");
        assert!(matches!(err, DialError::Handshake(_)), "got {err:?}");
    }
}
