//! Via header values
//!
//! Only the parts of a Via entry the transport layer reads or rewrites are
//! modelled: the transport token, the sent-by host and port, and the ordered
//! parameter list (`branch`, `received`, `rport`, `maddr`, `alias`, and any
//! proprietary markers).
//!
//! ```text
//! Via: SIP/2.0/UDP pc33.atlanta.com:5060;branch=z9hG4bK776asdhds;rport
//! ```

use std::fmt;
use std::str::FromStr;

use nom::character::complete::{char, space1};
use nom::combinator::all_consuming;
use nom::sequence::preceded;

use super::grammar::{host_port, params, sip_version, token, ParseResult};
use crate::error::Error;

/// Standard `received` parameter (RFC 3261 18.2.1)
pub const RECEIVED: &str = "received";

/// Standard `rport` parameter (RFC 3581)
pub const RPORT: &str = "rport";

/// Standard `maddr` parameter
pub const MADDR: &str = "maddr";

/// Connection reuse `alias` parameter
pub const ALIAS: &str = "alias";

/// A single Via entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    protocol: String,
    transport: String,
    host: String,
    port: Option<u16>,
    params: Vec<(String, Option<String>)>,
}

impl Via {
    /// Create a SIP/2.0 Via entry
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            protocol: "SIP/2.0".to_string(),
            transport: transport.into(),
            host: host.into(),
            port,
            params: Vec::new(),
        }
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn set_transport(&mut self, transport: impl Into<String>) {
        self.transport = transport.into();
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    /// Port, or the transport default when absent
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| {
            if self.transport.eq_ignore_ascii_case("tls") {
                crate::hop::DEFAULT_SECURE_PORT
            } else {
                crate::hop::DEFAULT_PORT
            }
        })
    }

    /// `Some(value)` if the parameter is present; the inner option is `None`
    /// for flag parameters such as a bare `rport`.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.param(name).is_some()
    }

    /// Set or replace a parameter, keeping its position if it already exists
    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        match self.params.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.params.push((name.to_string(), value)),
        }
    }

    pub fn remove_param(&mut self, name: &str) {
        self.params.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch").flatten()
    }

    pub fn received(&self) -> Option<&str> {
        self.param(RECEIVED).flatten()
    }

    pub fn set_received(&mut self, host: impl Into<String>) {
        self.set_param(RECEIVED, Some(host.into()));
    }

    /// Numeric `rport` value; a bare `rport` flag yields `None`
    pub fn rport(&self) -> Option<u16> {
        self.param(RPORT).flatten().and_then(|v| v.parse().ok())
    }

    pub fn set_rport(&mut self, port: u16) {
        self.set_param(RPORT, Some(port.to_string()));
    }

    pub fn maddr(&self) -> Option<&str> {
        self.param(MADDR).flatten()
    }
}

/// `sent-protocol LWS sent-by *( SEMI via-params )`
fn via_parm(input: &str) -> ParseResult<Via> {
    let (input, (name, version)) = sip_version(input)?;
    let (input, transport) = preceded(char('/'), token)(input)?;
    let (input, _) = space1(input)?;
    let (input, (host, port)) = host_port(input)?;
    let (input, params) = params(input)?;
    Ok((
        input,
        Via {
            protocol: format!("{}/{}", name, version),
            transport: transport.to_string(),
            host: host.to_string(),
            port,
            params,
        },
    ))
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        all_consuming(via_parm)(s)
            .map(|(_, via)| via)
            .map_err(|_| Error::Parse(format!("Invalid Via: {}", s)))
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.protocol, self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let raw = "SIP/2.0/TCP client.example.com:5070;branch=z9hG4bK74bf9;rport;alias";
        let via: Via = raw.parse().unwrap();
        assert_eq!(via.transport(), "TCP");
        assert_eq!(via.host(), "client.example.com");
        assert_eq!(via.port(), Some(5070));
        assert_eq!(via.branch(), Some("z9hG4bK74bf9"));
        assert_eq!(via.param(RPORT), Some(None));
        assert!(via.has_param(ALIAS));
        assert_eq!(via.to_string(), raw);
    }

    #[test]
    fn test_set_received_and_rport() {
        let mut via: Via = "SIP/2.0/UDP 10.0.0.1;rport".parse().unwrap();
        via.set_received("192.0.2.1");
        via.set_rport(33000);
        assert_eq!(via.received(), Some("192.0.2.1"));
        assert_eq!(via.rport(), Some(33000));
        assert_eq!(via.to_string(), "SIP/2.0/UDP 10.0.0.1;rport=33000;received=192.0.2.1");
    }

    #[test]
    fn test_ipv6_host() {
        let via: Via = "SIP/2.0/UDP [2001:db8::1]:5062;branch=z9hG4bKx".parse().unwrap();
        assert_eq!(via.host(), "[2001:db8::1]");
        assert_eq!(via.port(), Some(5062));
    }

    #[test]
    fn test_invalid() {
        assert!("garbage".parse::<Via>().is_err());
        assert!("SIP/2.0/UDP host:notaport".parse::<Via>().is_err());
        assert!("SIP/2.0/UDP".parse::<Via>().is_err());
        assert!("SIP/2.0/UDP host;branch=z9hG4bK1 trailing".parse::<Via>().is_err());
    }

    #[test]
    fn test_port_or_default() {
        let via: Via = "SIP/2.0/TLS host".parse().unwrap();
        assert_eq!(via.port_or_default(), 5061);
    }
}
