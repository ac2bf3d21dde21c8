//! # SIP message model
//!
//! The transport layer does not own the SIP object model; it only needs to
//! read and rewrite a handful of headers on the way in and out. This module
//! provides that minimal surface:
//!
//! - [`SipMessage`]: start line, ordered headers and body
//! - [`Via`], [`SipUri`], [`NameAddr`]: the typed values the transport rewrites
//! - [`MessageParser`] / [`TextMessageParser`]: stream framing of raw bytes
//!
//! Header names are matched case-insensitively and compact forms (`v`, `i`,
//! `f`, `t`, `l`, ...) are expanded on insertion.

mod grammar;
pub mod parser;
pub mod uri;
pub mod via;

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

pub use parser::{MessageParser, ParseError, ParseOutcome, TextMessageParser};
pub use uri::{NameAddr, SipUri};
pub use via::Via;

/// Header names used by the transport layer
pub mod headers {
    pub const VIA: &str = "Via";
    pub const CALL_ID: &str = "Call-ID";
    pub const CSEQ: &str = "CSeq";
    pub const FROM: &str = "From";
    pub const TO: &str = "To";
    pub const ROUTE: &str = "Route";
    pub const MAX_FORWARDS: &str = "Max-Forwards";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const RETRY_AFTER: &str = "Retry-After";
    pub const SUPPORTED: &str = "Supported";

    /// Proprietary explicit destination, used for flow-token routing
    pub const DESTINATION: &str = "IBM-Destination";

    /// Proprietary local listening point index, used in standalone deployments
    pub const PORT_INDEX: &str = "IBM-PO";
}

/// Proprietary parameter and method names shared with the front proxy
pub mod markers {
    /// Destination URI parameter marking an RFC 5626 outbound flow
    pub const OUTBOUND_EXTENSION: &str = "ibm-ob";

    /// Destination URI parameter marking a tampered flow token
    pub const TAMPERED: &str = "ibm-tampered";

    /// Top Via parameter marking a request switched off UDP for its size
    pub const MTU_SWITCH: &str = "ibmmtu";

    /// Top Via parameter carrying the session id
    pub const SESSION_ID: &str = "ibmsid";

    /// Method of the relay failure-report pseudo message
    pub const PROXY_ERROR: &str = "PROXYERROR";

    /// Method of the first message the front proxy sends per connection
    pub const STARTUP: &str = "STARTUP";
}

pub const ACK: &str = "ACK";

/// Expand compact header forms (RFC 3261 7.3.3)
pub fn canonical_header_name(name: &str) -> &str {
    match name {
        "v" | "V" => headers::VIA,
        "i" | "I" => headers::CALL_ID,
        "f" | "F" => headers::FROM,
        "t" | "T" => headers::TO,
        "l" | "L" => headers::CONTENT_LENGTH,
        "k" | "K" => headers::SUPPORTED,
        "m" | "M" => "Contact",
        "c" | "C" => "Content-Type",
        _ => name,
    }
}

/// A single header line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// First line of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Response { status: u16, reason: String },
}

/// A SIP request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    start_line: StartLine,
    headers: Vec<Header>,
    body: Bytes,
    loopback: bool,
}

impl SipMessage {
    pub fn request(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self::from_start_line(StartLine::Request {
            method: method.into(),
            uri: uri.into(),
        })
    }

    pub fn response(status: u16, reason: impl Into<String>) -> Self {
        Self::from_start_line(StartLine::Response {
            status,
            reason: reason.into(),
        })
    }

    pub(crate) fn from_start_line(start_line: StartLine) -> Self {
        Self {
            start_line,
            headers: Vec::new(),
            body: Bytes::new(),
            loopback: false,
        }
    }

    pub fn start_line(&self) -> &StartLine {
        &self.start_line
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    /// Whether this is a request with the given method
    pub fn is_method(&self, name: &str) -> bool {
        self.method().map_or(false, |m| m.eq_ignore_ascii_case(name))
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason_phrase(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    /// Set status code and reason phrase. No effect on requests.
    pub fn set_status(&mut self, status: u16, reason: impl Into<String>) {
        if let StartLine::Response { .. } = self.start_line {
            self.start_line = StartLine::Response {
                status,
                reason: reason.into(),
            };
        }
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Value of the first header with this name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).next()
    }

    pub fn header_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let name = canonical_header_name(name).to_string();
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(&name))
            .map(|h| h.value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Append a header line
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push(Header {
            name: canonical_header_name(name).to_string(),
            value: value.into(),
        });
    }

    /// Replace the first header with this name, or append it
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let name = canonical_header_name(name);
        match self.headers.iter_mut().find(|h| h.name.eq_ignore_ascii_case(name)) {
            Some(header) => header.value = value.into(),
            None => self.add_header(name, value),
        }
    }

    /// Remove the first header with this name, returning its value
    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        let name = canonical_header_name(name);
        let index = self.headers.iter().position(|h| h.name.eq_ignore_ascii_case(name))?;
        Some(self.headers.remove(index).value)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header(headers::CALL_ID)
    }

    /// All Via entries, in order, including comma-separated entries
    pub fn via_values(&self) -> impl Iterator<Item = &str> {
        self.header_values(headers::VIA)
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn via_count(&self) -> usize {
        self.via_values().count()
    }

    /// Parsed top Via entry
    pub fn top_via(&self) -> Option<crate::Result<Via>> {
        self.via_values().next().map(str::parse)
    }

    /// Replace the top Via entry, leaving other entries of the same line untouched
    pub fn set_top_via(&mut self, via: &Via) {
        match self
            .headers
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(headers::VIA))
        {
            Some(header) => {
                header.value = match header.value.split_once(',') {
                    Some((_, rest)) => format!("{},{}", via, rest),
                    None => via.to_string(),
                };
            }
            None => self.add_header(headers::VIA, via.to_string()),
        }
    }

    /// Whether the Supported header lists the option tag
    pub fn supports(&self, option: &str) -> bool {
        self.header_values(headers::SUPPORTED)
            .flat_map(|v| v.split(','))
            .any(|tag| tag.trim().eq_ignore_ascii_case(option))
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Replace the body and keep Content-Length consistent
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        self.set_header(headers::CONTENT_LENGTH, self.body.len().to_string());
    }

    /// Whether the message targets this stack's own address
    pub fn is_loopback(&self) -> bool {
        self.loopback
    }

    pub fn set_loopback(&mut self, loopback: bool) {
        self.loopback = loopback;
    }

    /// Build a response carrying the critical headers of this request
    /// (Via, From, To, Call-ID, CSeq). A To tag is added when missing.
    pub fn create_response(&self, status: u16, reason: impl Into<String>) -> SipMessage {
        let mut response = SipMessage::response(status, reason);
        for header in &self.headers {
            let critical = [headers::VIA, headers::FROM, headers::TO, headers::CALL_ID, headers::CSEQ]
                .iter()
                .any(|n| header.name.eq_ignore_ascii_case(n));
            if critical {
                response.headers.push(header.clone());
            }
        }
        if let Some(to) = response.header(headers::TO) {
            if !to.contains(";tag=") {
                let tag = uuid::Uuid::new_v4().simple().to_string();
                let to = format!("{};tag={}", to, &tag[..10]);
                response.set_header(headers::TO, to);
            }
        }
        response.set_header(headers::CONTENT_LENGTH, "0");
        response.loopback = self.loopback;
        response
    }

    /// Serialize to wire format
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        match &self.start_line {
            StartLine::Request { method, uri } => {
                buf.put_slice(format!("{} {} SIP/2.0\r\n", method, uri).as_bytes());
            }
            StartLine::Response { status, reason } => {
                buf.put_slice(format!("SIP/2.0 {} {}\r\n", status, reason).as_bytes());
            }
        }
        for header in &self.headers {
            buf.put_slice(header.name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(header.value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}
