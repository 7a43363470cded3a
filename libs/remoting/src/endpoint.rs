//! Endpoint descriptors and the overrides applied to them before pooling.
//!
//! Endpoints compare by value, so two descriptors naming the same address with
//! the same effective timeout and compression flag share one pooled connection.
//! The stringified form is `tcp -h <host> -p <port> [-t <ms>] [-z]`. Hosts
//! containing `:` or whitespace are double-quoted, so IPv6 literals survive
//! the colon separated endpoint lists of stringified references.

use rand::seq::SliceRandom;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{RemotingError, Result};

/// Transport family of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportKind {
    Tcp,
    Ssl,
    Udp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Ssl => "ssl",
            TransportKind::Udp => "udp",
        }
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, TransportKind::Udp)
    }
}

impl FromStr for TransportKind {
    type Err = RemotingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(TransportKind::Tcp),
            "ssl" => Ok(TransportKind::Ssl),
            "udp" => Ok(TransportKind::Udp),
            other => Err(RemotingError::configuration(
                format!("unknown transport '{}'", other),
                Some("endpoint"),
            )),
        }
    }
}

/// A concrete transport address
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointDescriptor {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    /// Connect and I/O timeout; `None` means no endpoint-level timeout
    pub timeout: Option<Duration>,
    pub compress: bool,
}

impl EndpointDescriptor {
    pub fn new(transport: TransportKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
            timeout: None,
            compress: false,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(TransportKind::Tcp, host, port)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Address in `host:port` form, suitable for socket lookups
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -h ", self.transport.as_str())?;
        if needs_quotes(&self.host) {
            write!(f, "\"{}\"", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        write!(f, " -p {}", self.port)?;
        if let Some(timeout) = self.timeout {
            write!(f, " -t {}", timeout.as_millis())?;
        }
        if self.compress {
            write!(f, " -z")?;
        }
        Ok(())
    }
}

impl FromStr for EndpointDescriptor {
    type Err = RemotingError;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        let mut tokens = tokens.iter().map(String::as_str);
        let transport: TransportKind = tokens
            .next()
            .ok_or_else(|| RemotingError::configuration("empty endpoint", Some("endpoint")))?
            .parse()?;

        let mut host = None;
        let mut port = None;
        let mut timeout = None;
        let mut compress = false;

        while let Some(flag) = tokens.next() {
            match flag {
                "-h" => host = Some(expect_value(&mut tokens, flag, s)?.to_string()),
                "-p" => {
                    let value = expect_value(&mut tokens, flag, s)?;
                    port = Some(value.parse::<u16>().map_err(|_| {
                        RemotingError::configuration(
                            format!("invalid port '{}' in endpoint '{}'", value, s),
                            Some("endpoint"),
                        )
                    })?);
                }
                "-t" => {
                    let value = expect_value(&mut tokens, flag, s)?;
                    timeout = match value {
                        "infinite" => None,
                        ms => Some(Duration::from_millis(ms.parse::<u64>().map_err(|_| {
                            RemotingError::configuration(
                                format!("invalid timeout '{}' in endpoint '{}'", ms, s),
                                Some("endpoint"),
                            )
                        })?)),
                    };
                }
                "-z" => compress = true,
                other => {
                    return Err(RemotingError::configuration(
                        format!("unknown option '{}' in endpoint '{}'", other, s),
                        Some("endpoint"),
                    ))
                }
            }
        }

        let host = host.ok_or_else(|| {
            RemotingError::configuration(format!("endpoint '{}' has no host", s), Some("endpoint"))
        })?;
        let port = port.ok_or_else(|| {
            RemotingError::configuration(format!("endpoint '{}' has no port", s), Some("endpoint"))
        })?;

        Ok(Self {
            transport,
            host,
            port,
            timeout,
            compress,
        })
    }
}

fn expect_value<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    flag: &str,
    endpoint: &str,
) -> Result<&'a str> {
    tokens.next().ok_or_else(|| {
        RemotingError::configuration(
            format!("option '{}' requires a value in endpoint '{}'", flag, endpoint),
            Some("endpoint"),
        )
    })
}

fn needs_quotes(host: &str) -> bool {
    host.is_empty() || host.contains(|c: char| c == ':' || c.is_whitespace())
}

/// Whitespace separated tokens; a double-quoted token keeps its colons and spaces
fn tokenize(s: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;

    for c in s.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quoted {
        return Err(RemotingError::configuration(
            format!("unterminated quote in endpoint '{}'", s),
            Some("endpoint"),
        ));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Parse a colon separated list of stringified endpoints
///
/// Colons inside double quotes belong to a host and do not separate entries.
pub fn parse_endpoint_list(s: &str) -> Result<Vec<EndpointDescriptor>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ':' if !quoted => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);

    parts
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

/// Forced values applied to every endpoint before pool lookup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointOverrides {
    pub timeout: Option<Duration>,
    pub compress: Option<bool>,
}

impl EndpointOverrides {
    pub fn is_empty(&self) -> bool {
        self.timeout.is_none() && self.compress.is_none()
    }

    /// The effective endpoint after overrides; this is the pooling key
    pub fn apply(&self, endpoint: &EndpointDescriptor) -> EndpointDescriptor {
        let mut effective = endpoint.clone();
        if let Some(timeout) = self.timeout {
            effective.timeout = Some(timeout);
        }
        if let Some(compress) = self.compress {
            effective.compress = compress;
        }
        effective
    }
}

/// Order in which resolved endpoints are offered to the connection manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EndpointSelection {
    /// Keep the resolved order
    #[default]
    Ordered,
    /// Shuffle on every attempt to spread load
    Random,
}

impl EndpointSelection {
    pub fn arrange(&self, mut endpoints: Vec<EndpointDescriptor>) -> Vec<EndpointDescriptor> {
        if let EndpointSelection::Random = self {
            endpoints.shuffle(&mut rand::thread_rng());
        }
        endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let ep: EndpointDescriptor = "tcp -h 10.0.0.5 -p 4061 -t 2500 -z".parse().unwrap();
        assert_eq!(ep.transport, TransportKind::Tcp);
        assert_eq!(ep.host, "10.0.0.5");
        assert_eq!(ep.port, 4061);
        assert_eq!(ep.timeout, Some(Duration::from_millis(2500)));
        assert!(ep.compress);
        assert_eq!(ep.to_string(), "tcp -h 10.0.0.5 -p 4061 -t 2500 -z");
    }

    #[test]
    fn test_parse_rejects_incomplete_endpoints() {
        assert!("tcp -p 4061".parse::<EndpointDescriptor>().is_err());
        assert!("tcp -h host".parse::<EndpointDescriptor>().is_err());
        assert!("tcp -h host -p notaport".parse::<EndpointDescriptor>().is_err());
        assert!("quic -h host -p 1".parse::<EndpointDescriptor>().is_err());
        assert!("tcp -h host -p 1 -x".parse::<EndpointDescriptor>().is_err());
        assert!("tcp -h".parse::<EndpointDescriptor>().is_err());
    }

    #[test]
    fn test_infinite_timeout() {
        let ep: EndpointDescriptor = "ssl -h example.com -p 443 -t infinite".parse().unwrap();
        assert_eq!(ep.transport, TransportKind::Ssl);
        assert_eq!(ep.timeout, None);
    }

    #[test]
    fn test_endpoint_list() {
        let list = parse_endpoint_list("tcp -h a -p 1: tcp -h b -p 2").unwrap();
        assert_eq!(list, vec![EndpointDescriptor::tcp("a", 1), EndpointDescriptor::tcp("b", 2)]);
    }

    #[test]
    fn test_overrides_change_pooling_key() {
        let raw = EndpointDescriptor::tcp("host", 10000);
        let overrides = EndpointOverrides {
            timeout: Some(Duration::from_secs(3)),
            compress: Some(true),
        };
        let effective = overrides.apply(&raw);

        assert_ne!(raw, effective);
        assert_eq!(effective.timeout, Some(Duration::from_secs(3)));
        assert!(effective.compress);
        assert_eq!(EndpointOverrides::default().apply(&raw), raw);
    }

    #[test]
    fn test_ipv6_host_round_trips() {
        let v6 = EndpointDescriptor::tcp("::1", 4061).with_timeout(Duration::from_millis(500));
        assert_eq!(v6.to_string(), "tcp -h \"::1\" -p 4061 -t 500");
        assert_eq!(v6.to_string().parse::<EndpointDescriptor>().unwrap(), v6);

        let v4 = EndpointDescriptor::tcp("10.0.0.5", 4062);
        let list = format!("{}:{}", v6, v4);
        assert_eq!(parse_endpoint_list(&list).unwrap(), vec![v6, v4]);

        assert!("tcp -h \"::1 -p 4061".parse::<EndpointDescriptor>().is_err());
        assert!(parse_endpoint_list("tcp -h \"fe80::1 -p 1").is_err());
    }

    #[test]
    fn test_ipv6_address_is_bracketed() {
        let ep = EndpointDescriptor::tcp("::1", 80);
        assert_eq!(ep.address(), "[::1]:80");
    }

    #[test]
    fn test_random_selection_keeps_all_endpoints() {
        let endpoints: Vec<_> = (1..=8).map(|p| EndpointDescriptor::tcp("h", p)).collect();
        let mut arranged = EndpointSelection::Random.arrange(endpoints.clone());
        arranged.sort();
        assert_eq!(arranged, endpoints);
        assert_eq!(EndpointSelection::Ordered.arrange(endpoints.clone()), endpoints);
    }
}
