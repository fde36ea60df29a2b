//! Client side of the relay tunnel: a TLS-wrapped WebSocket carrying one
//! proxied TCP stream per connection.

pub mod dialer;
pub mod fingerprint;
pub mod relay;
pub mod transport;

#[cfg(test)]
pub(crate) mod fixtures;
