use std::{fmt, net::SocketAddr, str::FromStr};

use crate::error::{ClientError, Result};

pub const DEFAULT_PORT: u16 = 10800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn matches(&self, address: &SocketAddr) -> bool {
        match self {
            AddressFamily::V4 => address.is_ipv4(),
            AddressFamily::V6 => address.is_ipv6(),
        }
    }
}

/// A parsed `host[:port]` endpoint.
///
/// IPv6 hosts are written in brackets (`[::1]:10800`); the brackets are stripped from
/// [`Endpoint::host`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub family: AddressFamily,
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> Result<Self> {
        let endpoint = endpoint.trim();

        let (host, port, family) = if endpoint.matches(':').count() > 1 {
            let (host, port) = match endpoint.rfind("]:") {
                Some(idx) => (&endpoint[..=idx], Some(&endpoint[idx + 2..])),
                None => (endpoint, None),
            };
            if !host.starts_with('[') || !host.ends_with(']') || host.len() < 2 {
                return Err(ClientError::IllegalArgument(format!(
                    "incorrect IPv6 host '{host}' in endpoint '{endpoint}', expected [address]"
                )));
            }
            (&host[1..host.len() - 1], port, AddressFamily::V6)
        } else {
            match endpoint.rsplit_once(':') {
                Some((host, port)) => (host, Some(port), AddressFamily::V4),
                None => (endpoint, None, AddressFamily::V4),
            }
        };

        if host.is_empty() {
            return Err(ClientError::IllegalArgument(format!(
                "missing host in endpoint '{endpoint}'"
            )));
        }

        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| {
                ClientError::IllegalArgument(format!(
                    "incorrect port '{port}' in endpoint '{endpoint}'"
                ))
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            family,
        })
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            AddressFamily::V4 => write!(f, "{}:{}", self.host, self.port),
            AddressFamily::V6 => write!(f, "[{}]:{}", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_from_string() {
        let inputs = vec![
            ("10.0.0.1:11000", "10.0.0.1", 11000, AddressFamily::V4),
            ("[::1]:11000", "::1", 11000, AddressFamily::V6),
            ("myhost", "myhost", DEFAULT_PORT, AddressFamily::V4),
            ("[fe80::1%eth0]", "fe80::1%eth0", DEFAULT_PORT, AddressFamily::V6),
            ("localhost:10801", "localhost", 10801, AddressFamily::V4),
        ];

        for (input, host, port, family) in inputs {
            let endpoint: Endpoint = input.parse().unwrap();
            assert_eq!(
                endpoint,
                Endpoint {
                    host: host.to_string(),
                    port,
                    family
                },
                "parsing '{input}'"
            );
        }
    }

    #[test]
    fn malformed_endpoints() {
        for input in [
            "bad:port:x",
            "[::1]:port",
            "[::1:10800",
            "::1]:10800",
            "host:",
            "host:70000",
            ":10800",
            "",
        ] {
            assert!(
                matches!(Endpoint::parse(input), Err(ClientError::IllegalArgument(_))),
                "'{input}' should be rejected"
            );
        }
    }

    #[test]
    fn display_round_trips() {
        for input in ["10.0.0.1:11000", "[::1]:11000"] {
            assert_eq!(Endpoint::parse(input).unwrap().to_string(), input);
        }
    }
}
