//! Next-hop routing
//!
//! The transport manager consults a [`Router`] for where a message goes; the
//! policy is pluggable. [`DefaultRouter`] implements the plain RFC 3261
//! order for requests (explicit destination, then Route, then request-URI)
//! with an optional outbound proxy in front, and sends responses back along
//! the top Via.

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::hop::{Hop, Transport};
use crate::message::{headers, NameAddr, SipMessage, SipUri};

/// Next-hop policy
pub trait Router: Send + Sync {
    /// Hop for a request. `original` is the hop of the first transmission
    /// when this is a retransmission.
    fn next_hop(&self, request: &SipMessage, original: Option<&Hop>) -> Result<Hop>;

    /// Hop for a response
    fn response_hop(&self, response: &SipMessage) -> Result<Hop>;

    /// Hop to use when a request is too large for an unreliable transport
    fn switch_transport(&self, hop: &Hop) -> Hop;

    fn set_outbound_proxy(&self, proxy: Hop);

    /// Whether the stack talks to peers directly, without a front proxy
    fn is_standalone_mode(&self) -> bool;

    /// Last look at a validated inbound request before it goes upstream
    fn process_request(&self, _request: &mut SipMessage) {}
}

/// RFC 3261 routing with an optional outbound proxy
#[derive(Debug)]
pub struct DefaultRouter {
    outbound_proxy: RwLock<Option<Hop>>,
    standalone: bool,
    secure_default: Transport,
}

impl DefaultRouter {
    pub fn new(standalone: bool, secure_default: Transport) -> Self {
        Self {
            outbound_proxy: RwLock::new(None),
            standalone,
            secure_default,
        }
    }

    pub fn outbound_proxy(&self) -> Option<Hop> {
        self.outbound_proxy.read().clone()
    }

    fn uri_hop(&self, value: &str) -> Result<Hop> {
        let name_addr: NameAddr = value.parse()?;
        Ok(Hop::from_uri(name_addr.uri(), self.secure_default))
    }
}

impl Router for DefaultRouter {
    fn next_hop(&self, request: &SipMessage, original: Option<&Hop>) -> Result<Hop> {
        if let Some(original) = original {
            trace!("Reusing hop {} of the first transmission", original);
            return Ok(original.clone());
        }
        if let Some(proxy) = self.outbound_proxy() {
            return Ok(proxy);
        }
        if let Some(destination) = request.header(headers::DESTINATION) {
            return self.uri_hop(destination);
        }
        if let Some(route) = request.header(headers::ROUTE) {
            return self.uri_hop(first_entry(route));
        }
        let uri: SipUri = request
            .request_uri()
            .ok_or_else(|| Error::bad_request(400, "Cannot route a response as a request"))?
            .parse()?;
        Ok(Hop::from_uri(&uri, self.secure_default))
    }

    fn response_hop(&self, response: &SipMessage) -> Result<Hop> {
        let via = response
            .top_via()
            .ok_or_else(|| Error::bad_request(400, "Missing Via header field"))??;
        Ok(Hop::from_via(&via))
    }

    fn switch_transport(&self, hop: &Hop) -> Hop {
        match hop.transport() {
            Transport::Udp => hop.with_transport(Transport::Tcp),
            _ => hop.clone(),
        }
    }

    fn set_outbound_proxy(&self, proxy: Hop) {
        debug!("Outbound proxy set to {}", proxy);
        *self.outbound_proxy.write() = Some(proxy);
    }

    fn is_standalone_mode(&self) -> bool {
        self.standalone
    }
}

/// First entry of a comma separated name-addr list
fn first_entry(value: &str) -> &str {
    let mut in_brackets = false;
    let mut in_quotes = false;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_brackets = true,
            '>' if !in_quotes => in_brackets = false,
            ',' if !in_quotes && !in_brackets => return value[..i].trim(),
            _ => {}
        }
    }
    value.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SipMessage {
        let mut msg = SipMessage::request("INVITE", "sip:bob@10.0.0.9:5070");
        msg.add_header("Via", "SIP/2.0/UDP 10.0.0.1;branch=z9hG4bK1");
        msg
    }

    #[test]
    fn test_request_uri_route() {
        let router = DefaultRouter::new(true, Transport::Tls);
        let hop = router.next_hop(&request(), None).unwrap();
        assert_eq!(hop.to_string(), "10.0.0.9:5070/UDP");
    }

    #[test]
    fn test_route_precedence() {
        let router = DefaultRouter::new(true, Transport::Tls);
        let mut msg = request();
        msg.add_header("Route", "<sip:p1.example.com;transport=tcp;lr>, <sip:p2.example.com;lr>");
        assert_eq!(router.next_hop(&msg, None).unwrap().to_string(), "p1.example.com:5060/TCP");

        msg.add_header("IBM-Destination", "<sip:10.1.1.1:6000;transport=udp;ibm-ob>");
        assert_eq!(router.next_hop(&msg, None).unwrap().to_string(), "10.1.1.1:6000/UDP");

        router.set_outbound_proxy(Hop::new(Transport::Tcp, "outbound.example.com", 5060));
        assert_eq!(router.next_hop(&msg, None).unwrap().host(), "outbound.example.com");

        let original = Hop::new(Transport::Udp, "first.example.com", 5060);
        assert_eq!(router.next_hop(&msg, Some(&original)).unwrap(), original);
    }

    #[test]
    fn test_response_hop_and_switch() {
        let router = DefaultRouter::new(true, Transport::Tls);
        let response = request().create_response(200, "OK");
        let hop = router.response_hop(&response).unwrap();
        assert_eq!(hop, Hop::new(Transport::Udp, "10.0.0.1", 5060));
        assert_eq!(router.switch_transport(&hop).transport(), Transport::Tcp);
    }

    #[test]
    fn test_first_entry() {
        assert_eq!(first_entry("\"a, b\" <sip:x;lr>, <sip:y>"), "\"a, b\" <sip:x;lr>");
        assert_eq!(first_entry("<sip:x>"), "<sip:x>");
    }
}
