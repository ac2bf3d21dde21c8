//! Connection resolution for outbound messages

use std::sync::Arc;

use tracing::{debug, trace};

use super::TransportManager;
use crate::connection::SipConnection;
use crate::context::{describe, MessageContext, TransactionContext};
use crate::error::{Error, Result};
use crate::hop::{Hop, Transport};
use crate::listening_point::ListeningPoint;
use crate::message::{headers, markers, NameAddr, SipMessage};

impl TransportManager {
    /// Find or create the connection `context` goes out on
    pub(super) async fn resolve_connection(
        &self,
        context: &mut MessageContext,
        provider: Option<&Arc<ListeningPoint>>,
        transaction: Option<&TransactionContext>,
    ) -> Result<Arc<dyn SipConnection>> {
        if context.message().is_request() {
            self.get_request_connection(context, provider, transaction).await
        } else {
            self.get_response_connection(context, provider, transaction).await
        }
    }

    async fn get_request_connection(
        &self,
        context: &mut MessageContext,
        provider: Option<&Arc<ListeningPoint>>,
        transaction: Option<&TransactionContext>,
    ) -> Result<Arc<dyn SipConnection>> {
        self.validate_outgoing(context.message_mut())?;
        let outbound_flow = check_flow_token(context.message())?;

        let hop = match transaction {
            Some(transaction) => {
                transaction.resolve_hop(|original| self.router.next_hop(context.message(), original))?
            }
            None => self.router.next_hop(context.message(), None)?,
        };
        debug!("Next hop for {} is {}", describe(context.message()), hop);

        // an existing flow must be reused; only UDP has nothing to look up
        let create = !outbound_flow || hop.transport() == Transport::Udp;
        let lp = self.request_listening_point(context.message_mut(), &hop, provider, outbound_flow)?;

        let connection = match self.get_hop_connection(&hop, lp.as_ref(), provider, create).await? {
            Some(connection) => connection,
            None if outbound_flow => {
                debug!("No connection left for outbound flow to {}", hop);
                return Err(Error::FlowFailed);
            }
            None => return Err(Error::NoConnection(hop.to_string())),
        };

        self.align_top_via(context.message_mut(), connection.listening_point());
        Ok(connection)
    }

    /// Add a missing Max-Forwards and require a Via
    fn validate_outgoing(&self, request: &mut SipMessage) -> Result<()> {
        if !request.has_header(headers::MAX_FORWARDS) {
            request.add_header(headers::MAX_FORWARDS, self.config.max_forwards_default.to_string());
        }
        if request.via_count() == 0 {
            return Err(Error::bad_request(400, "Missing Via header field"));
        }
        Ok(())
    }

    /// Listening point a request is pinned to, if any
    fn request_listening_point(
        &self,
        request: &mut SipMessage,
        hop: &Hop,
        provider: Option<&Arc<ListeningPoint>>,
        outbound_flow: bool,
    ) -> Result<Option<Arc<ListeningPoint>>> {
        let strict = || {
            if self.config.strict_outbound_local_port {
                provider.cloned()
            } else {
                None
            }
        };

        if !self.is_standalone_mode() {
            return Ok(strict());
        }

        match request.remove_header(headers::PORT_INDEX) {
            Some(index) => {
                let lp = index
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| self.registry.get_listening_point_by_index(i, hop.transport()));
                match lp {
                    Some(lp) => {
                        trace!("Port index {} selects {}", index.trim(), lp);
                        Ok(Some(lp))
                    }
                    None if outbound_flow => {
                        debug!("Port index {} names no {} listening point", index.trim(), hop.transport());
                        Err(Error::FlowFailed)
                    }
                    None => Ok(strict()),
                }
            }
            None if self.config.sent_by_host.is_some() => Ok(None),
            None if outbound_flow => {
                debug!("No port index on outbound flow request to {}", hop);
                Err(Error::FlowFailed)
            }
            None => Ok(strict()),
        }
    }

    /// Registered connection for `hop`, created if `create` is set.
    ///
    /// `lp` restricts the lookup; without it every listening point is
    /// searched. A new connection originates from a listening point of the
    /// hop's transport.
    pub(super) async fn get_hop_connection(
        &self,
        hop: &Hop,
        lp: Option<&Arc<ListeningPoint>>,
        provider: Option<&Arc<ListeningPoint>>,
        create: bool,
    ) -> Result<Option<Arc<dyn SipConnection>>> {
        let lookup = lp.map(|lp| lp.as_ref());
        if !create {
            return Ok(self.registry.get_connection(lookup, hop));
        }

        let preferred = if self.config.create_connection_use_lp_from_outbound {
            lp.or(provider)
        } else {
            provider.or(lp)
        };
        let origin = match preferred.filter(|origin| origin.transport() == hop.transport()) {
            Some(origin) => origin.clone(),
            None => self
                .registry
                .get_default_listening_point(hop.transport())
                .ok_or_else(|| Error::ListeningPointNotFound(format!("no {} listening point", hop.transport())))?,
        };

        let connection = self.registry.get_or_create_connection(lookup, &origin, hop).await?;
        Ok(Some(connection))
    }

    /// Rewrite the top Via so it names the listening point the request leaves from
    fn align_top_via(&self, request: &mut SipMessage, lp: &ListeningPoint) {
        let Some(Ok(mut via)) = request.top_via() else {
            return;
        };
        let via_transport = via.transport().parse::<Transport>().ok();
        if via_transport == Some(lp.transport()) && lp.matches(via.host(), via.port_or_default(), lp.transport()) {
            return;
        }
        debug!("Rewriting top Via {} to match listening point {}", via, lp);
        via.set_transport(lp.transport().as_str());
        via.set_host(lp.sent_by());
        via.set_port(lp.port());
        request.set_top_via(&via);
    }

    async fn get_response_connection(
        &self,
        context: &mut MessageContext,
        provider: Option<&Arc<ListeningPoint>>,
        transaction: Option<&TransactionContext>,
    ) -> Result<Arc<dyn SipConnection>> {
        let hop = self.router.response_hop(context.message())?;
        let strict = provider.filter(|_| self.config.strict_outbound_local_port);
        let lookup = strict.map(|lp| lp.as_ref());

        if let Some(connection) = self.registry.get_connection(lookup, &hop) {
            return Ok(connection);
        }

        // the client's connection is keyed by its Via port, not the rport it sees
        if hop.transport().is_reliable() {
            if let Some(Ok(via)) = context.message().top_via() {
                if via.rport() == Some(hop.port()) {
                    let corrected = Hop::new(hop.transport(), hop.host(), via.port_or_default());
                    if let Some(connection) = self.registry.get_connection(lookup, &corrected) {
                        trace!("Found connection for {} under Via port {}", hop, corrected.port());
                        return Ok(connection);
                    }
                }
            }
        }

        let carried = transaction.and_then(TransactionContext::connection);
        if let Some(connection) = &carried {
            if connection.is_reliable() && !connection.is_closed() && connection.transport() == hop.transport() {
                trace!("Answering over the connection that carried the request");
                return Ok(connection.clone());
            }
        }

        let origin = carried
            .as_ref()
            .or(context.connection())
            .map(|c| c.listening_point().clone())
            .filter(|lp| lp.transport() == hop.transport())
            .or_else(|| strict.cloned().filter(|lp| lp.transport() == hop.transport()))
            .or_else(|| self.registry.get_default_listening_point(hop.transport()))
            .ok_or_else(|| Error::ListeningPointNotFound(format!("no {} listening point", hop.transport())))?;

        self.registry.get_or_create_connection(lookup, &origin, &hop).await
    }
}

/// Whether the request targets an RFC 5626 flow.
///
/// A tampered flow token fails before any connection is looked up.
fn check_flow_token(request: &SipMessage) -> Result<bool> {
    let Some(destination) = request.header(headers::DESTINATION) else {
        return Ok(false);
    };
    let destination = match destination.parse::<NameAddr>() {
        Ok(destination) => destination,
        Err(e) => {
            debug!("Ignoring unparsable destination {}: {}", destination, e);
            return Ok(false);
        }
    };
    let uri = destination.uri();
    if !uri.has_param(markers::OUTBOUND_EXTENSION) {
        return Ok(false);
    }
    if uri.has_param(markers::TAMPERED) {
        debug!("Flow token of {} was tampered with", uri);
        return Err(Error::FlowTampered);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_destination(destination: &str) -> SipMessage {
        let mut msg = SipMessage::request("INVITE", "sip:bob@example.com");
        msg.add_header(headers::DESTINATION, destination);
        msg
    }

    #[test]
    fn test_check_flow_token() {
        assert!(!check_flow_token(&SipMessage::request("INVITE", "sip:bob@example.com")).unwrap());
        assert!(!check_flow_token(&request_with_destination("<sip:10.0.0.1:5060>")).unwrap());
        assert!(check_flow_token(&request_with_destination("<sip:10.0.0.1:5060;transport=tcp;ibm-ob>")).unwrap());
        assert!(matches!(
            check_flow_token(&request_with_destination("<sip:10.0.0.1:5060;ibm-ob;ibm-tampered>")),
            Err(Error::FlowTampered)
        ));
    }
}
