//! Transport-level endpoint addresses.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A `tcp://host:port` address for a fabric endpoint.
///
/// The fabric only speaks TCP between processes; in-process tests connect to
/// loopback addresses like everything else.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress {
    host: String,
    port: u16,
}

impl EndpointAddress {
    /// Creates an address from a host and port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEndpoint`] if the host is empty or the port is
    /// zero.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(Error::InvalidEndpoint {
                address: format!(":{port}"),
                reason: "host cannot be empty".into(),
            });
        }
        if port == 0 {
            return Err(Error::InvalidEndpoint {
                address: host,
                reason: "port cannot be zero".into(),
            });
        }
        Ok(Self { host, port })
    }

    /// Returns the host component.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port component.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the address in ZeroMQ URI form, e.g. `tcp://10.0.0.2:5570`.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    /// Returns a copy of this address with a different port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEndpoint`] if the port is zero.
    pub fn with_port(&self, port: u16) -> Result<Self> {
        Self::new(self.host.clone(), port)
    }
}

impl Display for EndpointAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

impl FromStr for EndpointAddress {
    type Err = Error;

    /// Parses `tcp://host:port` or bare `host:port`.
    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("tcp://").unwrap_or(s);
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| Error::InvalidEndpoint {
            address: s.into(),
            reason: "expected host:port".into(),
        })?;
        let port: u16 = port.parse().map_err(|_| Error::InvalidEndpoint {
            address: s.into(),
            reason: "port must be a 16-bit integer".into(),
        })?;
        Self::new(host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_display_parse() {
        let addr = EndpointAddress::new("10.0.0.2", 5570).expect("address");
        assert_eq!(addr.uri(), "tcp://10.0.0.2:5570");
        let parsed: EndpointAddress = addr.to_string().parse().expect("parse");
        assert_eq!(parsed, addr);
    }

    #[test]
    fn parses_bare_host_port() {
        let addr: EndpointAddress = "localhost:7200".parse().expect("parse");
        assert_eq!(addr.host(), "localhost");
        assert_eq!(addr.port(), 7200);
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!("tcp://".parse::<EndpointAddress>().is_err());
        assert!("nohost".parse::<EndpointAddress>().is_err());
        assert!("host:0".parse::<EndpointAddress>().is_err());
        assert!("host:99999".parse::<EndpointAddress>().is_err());
    }
}
