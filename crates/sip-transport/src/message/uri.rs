//! SIP URIs and name-addr values
//!
//! [`SipUri`] covers `sip:` and `sips:` URIs with user, host, port and
//! parameters. URI headers (`?...`) are kept verbatim. [`NameAddr`] wraps a
//! header value such as `"Bob" <sip:bob@example.com;transport=udp>;tag=1` so
//! the URI can be rewritten without disturbing the surrounding text.

use std::fmt;
use std::str::FromStr;

use nom::branch::alt;
use nom::bytes::complete::{tag_no_case, take_till1};
use nom::character::complete::char;
use nom::combinator::{all_consuming, opt, rest, value};
use nom::sequence::{preceded, terminated};

use super::grammar::{host_port, params, ParseResult};
use crate::error::Error;

/// A `sip:` or `sips:` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    secure: bool,
    user: Option<String>,
    host: String,
    port: Option<u16>,
    params: Vec<(String, Option<String>)>,
    headers: Option<String>,
}

impl SipUri {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            secure: false,
            user: None,
            host: host.into(),
            port,
            params: Vec::new(),
            headers: None,
        }
    }

    /// Whether the scheme is `sips`
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.param(name).is_some()
    }

    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        match self.params.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.params.push((name.to_string(), value)),
        }
    }

    pub fn transport(&self) -> Option<&str> {
        self.param("transport").flatten()
    }

    pub fn set_transport(&mut self, transport: &str) {
        self.set_param("transport", Some(transport.to_ascii_lowercase()));
    }

    pub fn maddr(&self) -> Option<&str> {
        self.param("maddr").flatten()
    }
}

fn scheme(input: &str) -> ParseResult<bool> {
    alt((value(true, tag_no_case("sips:")), value(false, tag_no_case("sip:"))))(input)
}

/// `("sip:" / "sips:") [ userinfo "@" ] hostport uri-parameters [ headers ]`
fn sip_uri(input: &str) -> ParseResult<SipUri> {
    let (input, secure) = scheme(input)?;
    let (input, user) = opt(terminated(take_till1(|c: char| c == '@'), char('@')))(input)?;
    let (input, (host, port)) = host_port(input)?;
    let (input, params) = params(input)?;
    let (input, headers) = opt(preceded(char('?'), rest))(input)?;
    Ok((
        input,
        SipUri {
            secure,
            user: user.map(str::to_string),
            host: host.to_string(),
            port,
            params,
            headers: headers.map(str::to_string),
        },
    ))
}

impl FromStr for SipUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        all_consuming(sip_uri)(s)
            .map(|(_, uri)| uri)
            .map_err(|_| Error::Parse(format!("Invalid SIP URI: {}", s)))
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.secure { "sips:" } else { "sip:" })?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}

/// A header value carrying a URI, optionally in angle brackets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    display: String,
    uri: SipUri,
    trailer: String,
    bracketed: bool,
}

impl NameAddr {
    pub fn uri(&self) -> &SipUri {
        &self.uri
    }

    pub fn uri_mut(&mut self) -> &mut SipUri {
        &mut self.uri
    }
}

impl FromStr for NameAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match (s.find('<'), s.rfind('>')) {
            (Some(open), Some(close)) if open < close => Ok(Self {
                display: s[..open].to_string(),
                uri: s[open + 1..close].parse()?,
                trailer: s[close + 1..].to_string(),
                bracketed: true,
            }),
            // Without brackets, parameters after the URI belong to the header;
            // the URI keeps them here since only the transport layer reads them.
            _ => Ok(Self {
                display: String::new(),
                uri: s.trim().parse()?,
                trailer: String::new(),
                bracketed: false,
            }),
        }
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bracketed {
            write!(f, "{}<{}>{}", self.display, self.uri, self.trailer)
        } else {
            write!(f, "{}", self.uri)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri: SipUri = "sips:alice@atlanta.com:5071;transport=tcp;lr?subject=x".parse().unwrap();
        assert!(uri.is_secure());
        assert_eq!(uri.user(), Some("alice"));
        assert_eq!(uri.host(), "atlanta.com");
        assert_eq!(uri.port(), Some(5071));
        assert_eq!(uri.transport(), Some("tcp"));
        assert!(uri.has_param("lr"));
        assert_eq!(uri.to_string(), "sips:alice@atlanta.com:5071;transport=tcp;lr?subject=x");
    }

    #[test]
    fn test_reject_other_schemes() {
        assert!("tel:+15551234".parse::<SipUri>().is_err());
        assert!("sip:".parse::<SipUri>().is_err());
        assert!("sip:host:port".parse::<SipUri>().is_err());
    }

    #[test]
    fn test_name_addr_rewrite_keeps_surroundings() {
        let mut value: NameAddr = "\"Proxy\" <sip:10.0.0.9:5060;transport=udp;ibm-ob>;x=1".parse().unwrap();
        assert!(value.uri().has_param("ibm-ob"));
        value.uri_mut().set_transport("TCP");
        assert_eq!(value.to_string(), "\"Proxy\" <sip:10.0.0.9:5060;transport=tcp;ibm-ob>;x=1");
    }

    #[test]
    fn test_bare_name_addr() {
        let value: NameAddr = "sip:10.0.0.9;ibm-ob".parse().unwrap();
        assert_eq!(value.uri().host(), "10.0.0.9");
        assert_eq!(value.to_string(), "sip:10.0.0.9;ibm-ob");
    }
}
