//! Endpoint urls of the form `protocol://host:port`.
//!
//! Endpoint lists arrive from the service directory and may contain entries
//! this process cannot use (bad syntax, unknown scheme). Parsing is therefore
//! lenient: a `Url` always exists, and `is_valid()` tells whether it is
//! dialable. Two urls are equal iff protocol, host and port all match.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A parsed endpoint. Pure value.
#[derive(Debug, Clone)]
pub struct Url {
    protocol: String,
    host: String,
    port: u16,
    valid: bool,
}

impl Url {
    /// Parse an endpoint string. Never fails; check `is_valid()`.
    pub fn parse(input: &str) -> Self {
        let (protocol, rest) = match input.split_once("://") {
            Some((scheme, rest)) => (scheme.to_string(), rest),
            None => (String::new(), input),
        };
        let (host, port_str) = match rest.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port),
            None => (rest.to_string(), ""),
        };
        let port = port_str.parse::<u16>().unwrap_or(0);
        let valid = !protocol.is_empty() && !host.is_empty() && port_str.parse::<u16>().is_ok();
        Self {
            protocol,
            host,
            port,
            valid,
        }
    }

    /// Build a url from parts. Always valid if the parts are non-empty.
    pub fn new(protocol: &str, host: &str, port: u16) -> Self {
        Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
            valid: !protocol.is_empty() && !host.is_empty(),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether all three components parsed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Loopback is any host matching `127.*` or exactly `localhost`.
    pub fn is_loopback(&self) -> bool {
        self.host.starts_with("127.") || self.host == "localhost"
    }

    /// `host:port` form fed to `tokio::net::lookup_host`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Copy of this url with a different port. Used to publish the resolved
    /// port of a listener bound to port 0.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            protocol: self.protocol.clone(),
            host: self.host.clone(),
            port,
            valid: self.valid,
        }
    }
}

// Equality ignores the validity flag: it is derived from the components.
impl PartialEq for Url {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.host == other.host && self.port == other.port
    }
}

impl Eq for Url {}

impl Hash for Url {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

impl From<&str> for Url {
    fn from(input: &str) -> Self {
        Url::parse(input)
    }
}

impl Serialize for Url {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Url {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Url::parse(&s))
    }
}
