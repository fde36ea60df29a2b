use std::fmt;

use thiserror::Error;

/// Port used for the relay when the address does not name one (`wss://` default).
pub const DEFAULT_RELAY_PORT: u16 = 443;

pub const MIN_CHUNK_KIB: i64 = 1;
pub const MAX_CHUNK_KIB: i64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("relay address is empty")]
    Empty,
    #[error("relay address has an empty host")]
    EmptyHost,
    #[error("relay address has invalid character {ch:?} at byte {pos}")]
    InvalidChar { ch: char, pos: usize },
    #[error("relay address has an empty port")]
    EmptyPort,
    #[error("relay address port {0:?} is not numeric")]
    InvalidPort(String),
    #[error("relay address port {0} does not fit in 16 bits")]
    PortOverflow(String),
    #[error("listen port {0} out of range (1-65535)")]
    ListenPort(i64),
    #[error("chunk size {0} KiB out of range (1-1024)")]
    ChunkSize(i64),
}

/// A validated `host[:port][/path]` relay address.
///
/// The host grammar is deliberately narrow: ASCII letters, digits, dots and
/// hyphens. IPv6 literals are not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAddr {
    host: String,
    port: Option<u16>,
    path: String,
}

impl RelayAddr {
    pub fn parse(input: &str) -> Result<Self, AddrError> {
        if input.is_empty() {
            return Err(AddrError::Empty);
        }

        let (authority, path) = match input.find('/') {
            Some(i) => (&input[..i], &input[i..]),
            None => (input, ""),
        };

        let (host, port) = match authority.split_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (authority, None),
        };

        if host.is_empty() {
            return Err(AddrError::EmptyHost);
        }
        if let Some((pos, ch)) = host
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '.' || *c == '-'))
        {
            return Err(AddrError::InvalidChar { ch, pos });
        }

        let port = match port {
            None => None,
            Some("") => return Err(AddrError::EmptyPort),
            Some(p) => {
                if let Some((i, ch)) = p.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
                    // A second ':' or stray character inside the port.
                    if ch == ':' {
                        return Err(AddrError::InvalidChar {
                            ch,
                            pos: host.len() + 1 + i,
                        });
                    }
                    return Err(AddrError::InvalidPort(p.to_string()));
                }
                Some(
                    p.parse::<u16>()
                        .map_err(|_| AddrError::PortOverflow(p.to_string()))?,
                )
            }
        };

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_RELAY_PORT)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port` with the default port filled in; what the TCP dial targets.
    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    /// Upgrade URL for the tunnel handshake.
    pub fn url(&self) -> String {
        match self.port {
            Some(p) => format!("wss://{}:{}{}", self.host(), p, self.path()),
            None => format!("wss://{}{}", self.host(), self.path()),
        }
    }
}

impl fmt::Display for RelayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)?;
        if let Some(p) = self.port {
            write!(f, ":{p}")?;
        }
        f.write_str(&self.path)
    }
}

pub fn validate_port(port: i64) -> Result<u16, AddrError> {
    if (1..=65535).contains(&port) {
        Ok(port as u16)
    } else {
        Err(AddrError::ListenPort(port))
    }
}

/// Validates a chunk size in KiB and returns it in bytes.
pub fn validate_chunk_kib(kib: i64) -> Result<usize, AddrError> {
    if (MIN_CHUNK_KIB..=MAX_CHUNK_KIB).contains(&kib) {
        Ok(kib as usize * 1024)
    } else {
        Err(AddrError::ChunkSize(kib))
    }
}

/// Server name for TLS derived from a dial address.
///
/// Strips a trailing `:port`. Anything that does not split cleanly (no port,
/// too many colons) is returned whole.
pub fn sni_host(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((h, tail)) = rest.split_once(']') {
            if tail.is_empty() || tail.starts_with(':') {
                return h;
            }
        }
        return addr;
    }
    match addr.rsplit_once(':') {
        Some((h, _)) if !h.is_empty() && !h.contains(':') => h,
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_grammar() {
        let a = RelayAddr::parse("relay.example.com").unwrap();
        assert_eq!(a.host(), "relay.example.com");
        assert_eq!(a.port(), 443);
        assert_eq!(a.path(), "");
        assert_eq!(a.dial_addr(), "relay.example.com:443");
        assert_eq!(a.url(), "wss://relay.example.com");

        let a = RelayAddr::parse("my-relay.dev:8443/ws/tunnel?x=1").unwrap();
        assert_eq!(a.host(), "my-relay.dev");
        assert_eq!(a.port(), 8443);
        assert_eq!(a.path(), "/ws/tunnel?x=1");
        assert_eq!(a.url(), "wss://my-relay.dev:8443/ws/tunnel?x=1");
        assert_eq!(a.to_string(), "my-relay.dev:8443/ws/tunnel?x=1");

        let a = RelayAddr::parse("10.0.0.1/").unwrap();
        assert_eq!(a.path(), "/");
        assert_eq!(a.url(), "wss://10.0.0.1/");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(RelayAddr::parse(""), Err(AddrError::Empty));
        assert_eq!(RelayAddr::parse(":443"), Err(AddrError::EmptyHost));
        assert_eq!(RelayAddr::parse("/ws"), Err(AddrError::EmptyHost));
        assert_eq!(RelayAddr::parse("host:"), Err(AddrError::EmptyPort));
        assert_eq!(
            RelayAddr::parse("host:80a"),
            Err(AddrError::InvalidPort("80a".into()))
        );
        assert_eq!(
            RelayAddr::parse("host:99999"),
            Err(AddrError::PortOverflow("99999".into()))
        );
        // Scheme prefixes are not part of the grammar.
        assert_eq!(RelayAddr::parse("wss://host"), Err(AddrError::EmptyPort));
        assert!(matches!(
            RelayAddr::parse("ho_st:443"),
            Err(AddrError::InvalidChar { ch: '_', pos: 2 })
        ));
        assert!(matches!(
            RelayAddr::parse("a:1:2"),
            Err(AddrError::InvalidChar { ch: ':', pos: 3 })
        ));
    }

    #[test]
    fn port_and_chunk_ranges() {
        assert_eq!(validate_port(1), Ok(1));
        assert_eq!(validate_port(65535), Ok(65535));
        assert_eq!(validate_port(0), Err(AddrError::ListenPort(0)));
        assert_eq!(validate_port(65536), Err(AddrError::ListenPort(65536)));

        assert_eq!(validate_chunk_kib(1), Ok(1024));
        assert_eq!(validate_chunk_kib(1024), Ok(1024 * 1024));
        assert_eq!(validate_chunk_kib(0), Err(AddrError::ChunkSize(0)));
        assert_eq!(validate_chunk_kib(1025), Err(AddrError::ChunkSize(1025)));
    }

    #[test]
    fn sni_strips_port_or_falls_back() {
        assert_eq!(sni_host("relay.example.com:8443"), "relay.example.com");
        assert_eq!(sni_host("relay.example.com"), "relay.example.com");
        assert_eq!(sni_host("[::1]:443"), "::1");
        assert_eq!(sni_host("a:b:c"), "a:b:c");
        assert_eq!(sni_host(":443"), ":443");
    }
}
