//! Per-dial TLS ClientHello randomization.
//!
//! Every dial draws a fresh [`HelloProfile`]: a browser-shaped base ordering
//! of cipher suites and key-exchange groups, then perturbed (shuffles, dropped
//! TLS 1.2 suites, version set, ALPN, resumption) so that consecutive
//! handshakes do not share one fixed, blockable fingerprint.

use std::sync::Arc;

use rand::{Rng, RngExt, seq::SliceRandom};
use rustls::{
    CipherSuite, ClientConfig, NamedGroup, RootCertStore, SupportedProtocolVersion,
    client::Resumption, crypto::ring, version,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Browser {
    Chrome,
    Firefox,
    Safari,
}

impl Browser {
    const ALL: [Browser; 3] = [Browser::Chrome, Browser::Firefox, Browser::Safari];

    fn tls13_suites(self) -> Vec<CipherSuite> {
        use CipherSuite::*;
        match self {
            Browser::Firefox => vec![
                TLS13_AES_128_GCM_SHA256,
                TLS13_CHACHA20_POLY1305_SHA256,
                TLS13_AES_256_GCM_SHA384,
            ],
            Browser::Chrome | Browser::Safari => vec![
                TLS13_AES_128_GCM_SHA256,
                TLS13_AES_256_GCM_SHA384,
                TLS13_CHACHA20_POLY1305_SHA256,
            ],
        }
    }

    fn tls12_suites(self) -> Vec<CipherSuite> {
        use CipherSuite::*;
        match self {
            Browser::Chrome => vec![
                TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ],
            Browser::Firefox => vec![
                TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            ],
            Browser::Safari => vec![
                TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ],
        }
    }
}

/// Observable ClientHello parameters for one handshake.
#[derive(Debug, Clone)]
pub struct HelloProfile {
    pub browser: Browser,
    pub cipher_suites: Vec<CipherSuite>,
    pub kx_groups: Vec<NamedGroup>,
    pub versions: Vec<&'static SupportedProtocolVersion>,
    pub alpn: Vec<Vec<u8>>,
    pub resumption: bool,
}

impl HelloProfile {
    pub fn random() -> Self {
        Self::randomized(&mut rand::rng())
    }

    pub fn randomized<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let browser = Browser::ALL[rng.random_range(0..Browser::ALL.len())];

        let mut tls13 = browser.tls13_suites();
        if rng.random_bool(0.5) {
            tls13.shuffle(rng);
        }

        let with_tls12 = rng.random_bool(0.75);
        let mut tls12 = if with_tls12 {
            browser.tls12_suites()
        } else {
            Vec::new()
        };
        if !tls12.is_empty() {
            if rng.random_bool(0.5) {
                tls12.shuffle(rng);
            }
            let keep = rng.random_range(2..=tls12.len());
            while tls12.len() > keep {
                let i = rng.random_range(0..tls12.len());
                tls12.remove(i);
            }
        }

        let mut kx_groups = vec![NamedGroup::X25519, NamedGroup::secp256r1, NamedGroup::secp384r1];
        if rng.random_bool(0.2) {
            kx_groups.shuffle(rng);
        } else if rng.random_bool(0.5) {
            kx_groups.swap(1, 2);
        }

        let versions: Vec<&'static SupportedProtocolVersion> = if with_tls12 {
            vec![&version::TLS13, &version::TLS12]
        } else {
            vec![&version::TLS13]
        };

        // The tunnel upgrade is an HTTP/1.1 request, so h2 is never offered.
        let alpn = if rng.random_bool(0.7) {
            vec![b"http/1.1".to_vec()]
        } else {
            Vec::new()
        };

        let mut cipher_suites = tls13;
        cipher_suites.extend(tls12);

        Self {
            browser,
            cipher_suites,
            kx_groups,
            versions,
            alpn,
            resumption: rng.random_bool(0.5),
        }
    }

    /// Compact description of the profile for logs and comparisons.
    pub fn signature(&self) -> String {
        let join = |items: Vec<String>| items.join("-");
        format!(
            "{:?};v={};cs={};kx={};alpn={};resume={}",
            self.browser,
            join(self.versions.iter().map(|v| format!("{:?}", v.version)).collect()),
            join(self.cipher_suites.iter().map(|c| format!("{c:?}")).collect()),
            join(self.kx_groups.iter().map(|g| format!("{g:?}")).collect()),
            join(
                self.alpn
                    .iter()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect()
            ),
            self.resumption,
        )
    }

    /// Build a rustls client config offering exactly this profile.
    pub fn client_config(&self, roots: Arc<RootCertStore>) -> Result<ClientConfig, rustls::Error> {
        let mut provider = ring::default_provider();

        let suites = self
            .cipher_suites
            .iter()
            .filter_map(|id| {
                provider
                    .cipher_suites
                    .iter()
                    .find(|s| s.suite() == *id)
                    .copied()
            })
            .collect::<Vec<_>>();
        let groups = self
            .kx_groups
            .iter()
            .filter_map(|g| provider.kx_groups.iter().find(|k| k.name() == *g).copied())
            .collect::<Vec<_>>();
        provider.cipher_suites = suites;
        provider.kx_groups = groups;

        let mut cfg = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&self.versions)?
            .with_root_certificates(roots)
            .with_no_client_auth();
        cfg.alpn_protocols = self.alpn.clone();
        if !self.resumption {
            cfg.resumption = Resumption::disabled();
        }
        Ok(cfg)
    }
}

/// Root store with the Mozilla trust anchors.
pub fn default_roots() -> Arc<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(roots)
}
