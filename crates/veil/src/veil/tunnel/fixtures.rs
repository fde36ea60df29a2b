//! In-process stand-in for the relay endpoint, used by tests.

use std::{net::SocketAddr, sync::Arc};

use futures_util::{SinkExt, StreamExt};
use rustls::{
    RootCertStore, ServerConfig,
    crypto::ring,
    pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        Message,
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};

use crate::veil::{
    addr::RelayAddr,
    tunnel::dialer::{PASSWORD_HEADER, TARGET_HEADER},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayMode {
    /// Echo every binary message back verbatim.
    Echo,
    /// Like `Echo`, but precede each echo with a text and a ping message.
    EchoWithNoise,
    /// Accept TCP and never speak TLS.
    Stall,
}

#[derive(Debug, Clone)]
pub(crate) struct CapturedUpgrade {
    pub target: Option<String>,
    pub password: Option<String>,
    pub path: String,
}

pub(crate) struct TestRelay {
    pub addr: SocketAddr,
    pub roots: Arc<RootCertStore>,
    pub upgrades: mpsc::UnboundedReceiver<CapturedUpgrade>,
    /// Binary payloads as the relay received them, one entry per message.
    pub frames: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl TestRelay {
    pub fn relay_addr(&self) -> RelayAddr {
        RelayAddr::parse(&format!("localhost:{}/tunnel", self.addr.port())).expect("relay addr")
    }
}

pub(crate) async fn spawn_relay(password: &'static str, mode: RelayMode) -> TestRelay {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("cert");
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

    let mut roots = RootCertStore::empty();
    roots.add(cert_der.clone()).expect("add root");

    let server_cfg = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("versions")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .expect("server cert");
    let acceptor = TlsAcceptor::from(Arc::new(server_cfg));

    let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = ln.local_addr().expect("local addr");

    let (up_tx, upgrades) = mpsc::unbounded_channel();
    let (frame_tx, frames) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = ln.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            let up_tx = up_tx.clone();
            let frame_tx = frame_tx.clone();
            tokio::spawn(async move {
                if mode == RelayMode::Stall {
                    let _hold = tcp;
                    std::future::pending::<()>().await;
                    return;
                }
                let Ok(tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let callback = move |req: &Request, resp: Response| {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned)
                    };
                    let captured = CapturedUpgrade {
                        target: header(TARGET_HEADER),
                        password: header(PASSWORD_HEADER),
                        path: req.uri().path().to_string(),
                    };
                    let authorized = captured.password.as_deref() == Some(password);
                    let _ = up_tx.send(captured);
                    if authorized {
                        Ok(resp)
                    } else {
                        Err(forbidden())
                    }
                };
                let Ok(mut ws) = accept_hdr_async(tls, callback).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Binary(payload) => {
                            let _ = frame_tx.send(payload.to_vec());
                            if mode == RelayMode::EchoWithNoise {
                                if ws.send(Message::Text("noise".into())).await.is_err() {
                                    return;
                                }
                                if ws.send(Message::Ping(Default::default())).await.is_err() {
                                    return;
                                }
                            }
                            if ws.send(Message::Binary(payload)).await.is_err() {
                                return;
                            }
                        }
                        Message::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });

    TestRelay {
        addr,
        roots: Arc::new(roots),
        upgrades,
        frames,
    }
}

fn forbidden() -> ErrorResponse {
    tokio_tungstenite::tungstenite::http::Response::builder()
        .status(StatusCode::FORBIDDEN)
        .body(Some("wrong password".to_string()))
        .expect("static response")
}
