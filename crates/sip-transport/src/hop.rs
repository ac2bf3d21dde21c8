//! # Hops
//!
//! A [`Hop`] is the resolved `(transport, host, port)` destination of one
//! outbound message. Hops double as connection lookup keys in the
//! [`ConnectionRegistry`](crate::registry::ConnectionRegistry), so their
//! equality follows the connection matching rules rather than plain field
//! equality:
//!
//! - transport and host always compare case-insensitively
//! - the port compares only when *both* sides carry a nonzero port; a zero
//!   port is a wildcard
//! - the hash excludes the port, so a wildcard hop lands in the same bucket
//!   as every concrete hop for the same transport and host
//!
//! ```rust
//! use rvoip_sip_transport_layer::hop::{Hop, Transport};
//!
//! let any_port = Hop::new(Transport::Udp, "1.2.3.4", 0);
//! let concrete = Hop::new(Transport::Udp, "1.2.3.4", 5060);
//! assert_eq!(any_port, concrete);
//! assert_ne!(concrete, Hop::new(Transport::Udp, "1.2.3.4", 5070));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::connection::SipConnection;
use crate::error::Error;
use crate::message::{SipUri, Via};

/// Default port for UDP and TCP
pub const DEFAULT_PORT: u16 = 5060;

/// Default port for TLS
pub const DEFAULT_SECURE_PORT: u16 = 5061;

/// SIP transport protocols handled by this layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

impl Transport {
    /// Whether the transport is connection oriented
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Transport::Udp)
    }

    /// Whether the transport is secure
    pub fn is_secure(&self) -> bool {
        matches!(self, Transport::Tls)
    }

    /// Default port for this transport
    pub fn default_port(&self) -> u16 {
        if self.is_secure() {
            DEFAULT_SECURE_PORT
        } else {
            DEFAULT_PORT
        }
    }

    /// Upper-case token as it appears in a Via header
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
            Transport::Tls => "TLS",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(Transport::Udp)
        } else if s.eq_ignore_ascii_case("tcp") {
            Ok(Transport::Tcp)
        } else if s.eq_ignore_ascii_case("tls") {
            Ok(Transport::Tls)
        } else {
            Err(Error::UnsupportedTransport(s.to_string()))
        }
    }
}

/// Resolved destination of an outbound message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hop {
    transport: Transport,
    host: String,
    port: u16,
}

impl Hop {
    /// Create a hop from its parts. A zero port matches any port.
    pub fn new(transport: Transport, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
        }
    }

    /// Hop for sending a response back along a Via entry (RFC 3261 18.2.2, RFC 3581 4).
    ///
    /// `maddr` takes precedence over `received`, which takes precedence over
    /// the sent-by host. A numeric `rport` overrides the sent-by port unless
    /// `maddr` is present. Missing ports default by transport.
    pub fn from_via(via: &Via) -> Self {
        let transport = via.transport().parse().unwrap_or(Transport::Udp);
        let maddr = via.maddr();
        let host = maddr
            .or_else(|| via.received())
            .unwrap_or_else(|| via.host())
            .to_string();
        let port = match (maddr, via.rport()) {
            (None, Some(rport)) => rport,
            _ => via.port().unwrap_or_else(|| transport.default_port()),
        };
        Self::new(transport, host, port)
    }

    /// Hop for a SIP or SIPS URI.
    ///
    /// A `sips` URI whose transport is not already secure is upgraded to
    /// `secure_default`; without an explicit port it gets the default secure
    /// port.
    pub fn from_uri(uri: &SipUri, secure_default: Transport) -> Self {
        let mut transport = uri
            .transport()
            .and_then(|t| t.parse().ok())
            .unwrap_or(if uri.is_secure() { secure_default } else { Transport::Udp });
        let mut port = uri.port();

        if uri.is_secure() && !transport.is_secure() {
            transport = secure_default;
            if port.is_none() {
                port = Some(DEFAULT_SECURE_PORT);
            }
        }

        let host = uri.maddr().unwrap_or_else(|| uri.host()).to_string();
        let port = port.unwrap_or_else(|| transport.default_port());
        Self::new(transport, host, port)
    }

    /// Hop identifying the remote end of an existing connection
    pub fn from_connection(connection: &dyn SipConnection) -> Self {
        Self::new(
            connection.listening_point().transport(),
            connection.remote_host(),
            connection.remote_port(),
        )
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Rewrite the port. Only used when re-keying a connection for connection reuse.
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Copy of this hop on a different transport
    pub fn with_transport(&self, transport: Transport) -> Self {
        Self::new(transport, self.host.clone(), self.port)
    }
}

impl PartialEq for Hop {
    fn eq(&self, other: &Self) -> bool {
        if self.transport != other.transport || !self.host.eq_ignore_ascii_case(&other.host) {
            return false;
        }
        self.port == 0 || other.port == 0 || self.port == other.port
    }
}

// Port wildcards make equality non-transitive across different concrete ports;
// lookups with a zero port return whichever entry for the host is found first.
impl Eq for Hop {}

impl Hash for Hop {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transport.hash(state);
        for b in self.host.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.transport)
    }
}
