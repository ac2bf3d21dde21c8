//! Path MTU transport switch (RFC 3261 18.1.1)
//!
//! A request too large for the path MTU of an unreliable transport is sent
//! over a reliable one instead. The switch works on a copy of the message so
//! the transaction's retransmission copy keeps its original transport. If no
//! reliable connection can be had, the request goes out over UDP anyway.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::TransportManager;
use crate::connection::SipConnection;
use crate::context::MessageContext;
use crate::error::Result;
use crate::hop::{Hop, Transport};
use crate::listening_point::ListeningPoint;
use crate::message::{headers, markers, NameAddr, SipMessage};

impl TransportManager {
    /// Move the request in `context` off the unreliable `original` connection.
    ///
    /// Returns the connection to write to: a reliable one when the switch
    /// worked, `original` otherwise.
    pub(super) async fn handle_path_mtu_exceeded(
        &self,
        context: &mut MessageContext,
        original: &Arc<dyn SipConnection>,
    ) -> Arc<dyn SipConnection> {
        let original_hop = Hop::from_connection(original.as_ref());
        let target = self.router.switch_transport(&original_hop);
        let transport = target.transport();
        if !transport.is_reliable() {
            debug!("Router keeps {} on {}, sending fragmented", original_hop, transport);
            return original.clone();
        }

        let Some(lp) = self.switch_listening_point(original.listening_point(), transport) else {
            debug!("No {} listening point to switch to, sending over UDP", transport);
            return original.clone();
        };

        let mut message = context.message().clone();
        switch_to(&mut message, transport);

        match self.get_hop_connection(&target, Some(&lp), Some(&lp), true).await {
            Ok(Some(connection)) => {
                info!(
                    "Switched {} to {} for path MTU, {} bytes",
                    original_hop,
                    target,
                    message.to_bytes().len()
                );
                // standalone falls back to UDP itself, a front proxy reports back instead
                if self.is_standalone_mode() {
                    context.transport_switch();
                } else {
                    mark_switched(&mut message);
                }
                context.set_message(message);
                context.set_connection(connection.clone());
                connection
            }
            Ok(None) => original.clone(),
            Err(e) => {
                warn!("Could not switch {} to {}: {}; sending over UDP", original_hop, transport, e);
                original.clone()
            }
        }
    }

    /// Reliable listening point to switch to from `udp`.
    ///
    /// The one sharing host and port with `udp` is preferred. Strict local
    /// port mode never leaves the provider's listening point.
    fn switch_listening_point(&self, udp: &ListeningPoint, transport: Transport) -> Option<Arc<ListeningPoint>> {
        if self.config.strict_outbound_local_port {
            return None;
        }
        self.registry
            .get_listening_point(udp.host(), udp.port(), transport)
            .or_else(|| self.registry.get_default_listening_point(transport))
    }

    /// Write a switched request over its original UDP connection after the
    /// reliable write failed
    pub(super) async fn fall_back_to_udp(
        &self,
        mut context: MessageContext,
        original: &Arc<dyn SipConnection>,
    ) -> Result<()> {
        warn!("Reliable write failed, reverting to UDP over {}", original.key());
        revert_to_udp(context.message_mut());
        context.set_connection(original.clone());
        match self.write(&context, original, false).await {
            Ok(()) => {
                context.done();
                Ok(())
            }
            Err(e) => {
                context.write_error(&e).await;
                Ok(())
            }
        }
    }

    /// Resend a request the front proxy could not deliver after its MTU switch
    pub(super) async fn handle_mtu_error(&self, mut message: SipMessage) {
        revert_to_udp(&mut message);
        let lp = self.registry.get_default_listening_point(Transport::Udp);
        let mut context = MessageContext::new(message);
        // already switched once; the resend must not switch again
        context.transport_switch();
        if let Err(e) = self.send_message(context, lp.as_ref(), None).await {
            warn!("Resending over UDP after MTU error failed: {}", e);
        }
    }
}

/// Rewrite the top Via and the destination URI from UDP to `transport`
fn switch_to(message: &mut SipMessage, transport: Transport) {
    if let Some(Ok(mut via)) = message.top_via() {
        if via.transport().eq_ignore_ascii_case(Transport::Udp.as_str()) {
            via.set_transport(transport.as_str());
            message.set_top_via(&via);
        }
    }
    rewrite_destination(message, |current| {
        current.map_or(true, |t| t.eq_ignore_ascii_case("udp"))
            .then(|| transport.as_str().to_ascii_lowercase())
    });
}

/// Tell the front proxy this request left UDP because of its size
fn mark_switched(message: &mut SipMessage) {
    if let Some(Ok(mut via)) = message.top_via() {
        via.set_param(markers::MTU_SWITCH, None);
        message.set_top_via(&via);
    }
}

/// Undo [`switch_to`] and [`mark_switched`]
pub(super) fn revert_to_udp(message: &mut SipMessage) {
    if let Some(Ok(mut via)) = message.top_via() {
        via.set_transport(Transport::Udp.as_str());
        via.remove_param(markers::MTU_SWITCH);
        message.set_top_via(&via);
    }
    rewrite_destination(message, |current| {
        current
            .filter(|t| !t.eq_ignore_ascii_case("udp"))
            .map(|_| "udp".to_string())
    });
}

/// Replace the transport parameter of the destination URI with whatever
/// `choose` returns for the current one; `None` leaves it alone
fn rewrite_destination(message: &mut SipMessage, choose: impl FnOnce(Option<&str>) -> Option<String>) {
    let Some(value) = message.header(headers::DESTINATION) else {
        return;
    };
    let Ok(mut destination) = value.parse::<NameAddr>() else {
        return;
    };
    if let Some(transport) = choose(destination.uri().transport()) {
        destination.uri_mut().set_transport(&transport);
        message.set_header(headers::DESTINATION, destination.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn large_request() -> SipMessage {
        let mut msg = SipMessage::request("MESSAGE", "sip:bob@10.0.0.9");
        msg.add_header("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1");
        msg.add_header(headers::DESTINATION, "<sip:10.0.0.9:5060;transport=udp>");
        msg
    }

    #[test]
    fn test_switch_and_revert() {
        let mut msg = large_request();
        switch_to(&mut msg, Transport::Tcp);
        mark_switched(&mut msg);
        let via = msg.top_via().unwrap().unwrap();
        assert_eq!(via.transport(), "TCP");
        assert!(via.has_param(markers::MTU_SWITCH));
        assert_eq!(msg.header(headers::DESTINATION), Some("<sip:10.0.0.9:5060;transport=tcp>"));

        revert_to_udp(&mut msg);
        let via = msg.top_via().unwrap().unwrap();
        assert_eq!(via.transport(), "UDP");
        assert!(!via.has_param(markers::MTU_SWITCH));
        assert_eq!(msg.header(headers::DESTINATION), Some("<sip:10.0.0.9:5060;transport=udp>"));
    }

    #[test]
    fn test_switch_leaves_tls_destination() {
        let mut msg = large_request();
        msg.set_header(headers::DESTINATION, "<sip:10.0.0.9:5061;transport=tls>");
        switch_to(&mut msg, Transport::Tcp);
        assert_eq!(msg.header(headers::DESTINATION), Some("<sip:10.0.0.9:5061;transport=tls>"));
    }
}
