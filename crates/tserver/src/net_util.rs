//! Bind address list parsing.

use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::ServerError;

/// Parse a comma-separated list of `host[:port]` entries, applying
/// `default_port` to entries without one.
///
/// # Errors
///
/// Returns an error on the first entry that fails to parse or resolve; no
/// partial result is produced.
pub fn parse_address_list(
    addresses: &str,
    default_port: u16,
) -> Result<Vec<SocketAddr>, ServerError> {
    let mut parsed = Vec::new();
    for entry in addresses.split(',') {
        parsed.push(parse_one(entry.trim(), default_port)?);
    }
    Ok(parsed)
}

fn parse_one(entry: &str, default_port: u16) -> Result<SocketAddr, ServerError> {
    if entry.is_empty() {
        return Err(ServerError::AddressParse {
            entry: entry.to_string(),
            detail: "empty address entry".to_string(),
        });
    }
    // Literal ip:port, including [v6]:port.
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let candidate = if entry.contains(':') {
        entry.to_string()
    } else {
        format!("{entry}:{default_port}")
    };
    match candidate.to_socket_addrs() {
        Ok(mut resolved) => resolved.next().ok_or_else(|| ServerError::AddressParse {
            entry: entry.to_string(),
            detail: "resolved to no addresses".to_string(),
        }),
        Err(e) => Err(ServerError::AddressParse {
            entry: entry.to_string(),
            detail: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_addresses() {
        let parsed = parse_address_list("0.0.0.0:7150", 7150).unwrap();
        assert_eq!(parsed, vec!["0.0.0.0:7150".parse().unwrap()]);

        let parsed = parse_address_list("127.0.0.1:0, 127.0.0.1:9999", 7150).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].port(), 9999);
    }

    #[test]
    fn test_default_port_applied() {
        let parsed = parse_address_list("127.0.0.1", 7150).unwrap();
        assert_eq!(parsed, vec!["127.0.0.1:7150".parse().unwrap()]);
    }

    #[test]
    fn test_malformed_entries_fail() {
        assert!(parse_address_list("", 7150).is_err());
        assert!(parse_address_list("127.0.0.1:notaport", 7150).is_err());
        assert!(parse_address_list("127.0.0.1:0,,127.0.0.1:1", 7150).is_err());
    }
}
