/// Build a bind address from a listen host and port.
///
/// An empty host or `":"`-style shorthand means all interfaces. IPv6 hosts
/// are bracketed so the result parses as a `SocketAddr`.
pub fn bind_addr(host: &str, port: u16) -> String {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        format!("0.0.0.0:{port}")
    } else if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::bind_addr;

    #[test]
    fn bind_addr_defaults_to_all_interfaces() {
        assert_eq!(bind_addr("", 8080), "0.0.0.0:8080");
        assert_eq!(bind_addr("  ", 7000), "0.0.0.0:7000");
    }

    #[test]
    fn bind_addr_brackets_ipv6() {
        assert_eq!(bind_addr("127.0.0.1", 8080), "127.0.0.1:8080");
        assert_eq!(bind_addr("::", 8080), "[::]:8080");
        assert_eq!(bind_addr("[::1]", 1080), "[::1]:1080");
    }
}
