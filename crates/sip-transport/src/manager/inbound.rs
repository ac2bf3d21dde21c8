//! Inbound pipeline: framing, validation, Via correction and connection reuse

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, info, trace, Instrument};

use super::TransportManager;
use crate::connection::SipConnection;
use crate::context::MessageContext;
use crate::error::{Error, Result};
use crate::logging::message_span;
use crate::message::via::{ALIAS, RPORT};
use crate::message::{headers, markers, ParseError, ParseOutcome, SipMessage, Via, ACK};

/// Option tag of RFC 5626
const OUTBOUND_OPTION: &str = "outbound";

impl TransportManager {
    /// Consume every complete message in `buffer`
    pub async fn on_read(&self, connection: &Arc<dyn SipConnection>, buffer: &mut BytesMut) {
        while !buffer.is_empty() && !connection.is_closed() {
            match connection.state().parse(buffer) {
                ParseOutcome::Incomplete => break,
                ParseOutcome::Error(error) => {
                    self.message_dropped(None, &error.to_string());
                    self.on_parse_error(connection);
                }
                ParseOutcome::Message { message, error } => {
                    connection.state().set_start_line_hunting(false);
                    let span = message_span(&message);
                    self.on_message(connection, message, error).instrument(span).await;
                }
            }
        }
    }

    async fn on_message(&self, connection: &Arc<dyn SipConnection>, message: SipMessage, error: Option<ParseError>) {
        self.trace_in(&message);
        if message.is_request() {
            self.on_request(connection, message, error).await;
        } else {
            self.on_response(connection, message, error).await;
        }
    }

    async fn on_request(&self, connection: &Arc<dyn SipConnection>, mut request: SipMessage, error: Option<ParseError>) {
        if let Some(error) = error {
            if request.is_method(ACK) || request.is_method(markers::PROXY_ERROR) {
                self.message_dropped(Some(&request), &format!("malformed, {}", error));
            } else {
                self.message_dropped(Some(&request), &format!("answered with {}", error));
                let response = request.create_response(error.status_code, error.reason);
                self.respond(connection, response).await;
            }
            self.on_parse_error(connection);
            return;
        }

        let Some(upstream) = self.upstream.get() else {
            let mut response = request.create_response(503, "Service Unavailable");
            response.set_header(headers::RETRY_AFTER, "5 (Initializing)");
            self.message_dropped(Some(&request), "stack not initialized");
            self.respond(connection, response).await;
            return;
        };

        if request.is_method(markers::PROXY_ERROR) {
            self.handle_proxy_error(connection, request).await;
            return;
        }

        let mut via = match validate_incoming(&request) {
            Ok(via) => via,
            Err(Error::BadRequest { status, reason }) => {
                self.message_dropped(Some(&request), &reason);
                let response = request.create_response(status, reason);
                self.respond(connection, response).await;
                return;
            }
            Err(e) => {
                self.message_dropped(Some(&request), &e.to_string());
                return;
            }
        };

        if request.is_method(markers::STARTUP) && !self.startup_received.swap(true, Ordering::AcqRel) {
            info!("Front proxy STARTUP received on {:?}, leaving standalone mode", connection);
        }

        self.correct_via(connection, &mut via);
        self.process_connection_reuse(connection, &request, &via);
        request.set_top_via(&via);
        self.router.process_request(&mut request);

        upstream
            .process_message(request, Some(connection.listening_point().clone()), Some(connection.clone()))
            .await;
    }

    async fn on_response(&self, connection: &Arc<dyn SipConnection>, response: SipMessage, error: Option<ParseError>) {
        if let Some(error) = error {
            self.message_dropped(Some(&response), &format!("malformed, {}", error));
            self.on_parse_error(connection);
            return;
        }
        match self.upstream.get() {
            Some(upstream) => {
                upstream
                    .process_message(response, Some(connection.listening_point().clone()), Some(connection.clone()))
                    .await;
            }
            None => self.message_dropped(Some(&response), "stack not initialized"),
        }
    }

    /// Count a parse error against the connection and close it when its budget is spent
    fn on_parse_error(&self, connection: &Arc<dyn SipConnection>) {
        let errors = connection.state().increment_parse_errors();
        if connection.is_reliable() {
            if connection.state().should_drop_connection() {
                debug!("Closing {:?} after {} parse errors", connection, errors);
                self.clean_up_connection(connection);
            } else {
                connection.state().set_start_line_hunting(true);
            }
        } else if self.is_standalone_mode() {
            debug!("Closing {:?} after parse error", connection);
            self.clean_up_connection(connection);
        }
    }

    /// Answer an inbound request from the transport layer itself
    async fn respond(&self, connection: &Arc<dyn SipConnection>, mut response: SipMessage) {
        if let Some(Ok(mut via)) = response.top_via() {
            via.set_received(connection.remote_host());
            via.set_rport(connection.remote_port());
            response.set_top_via(&via);
        }
        let context = MessageContext::with_connection(response, connection.clone());
        if let Err(e) = self
            .send_message(context, Some(connection.listening_point()), None)
            .await
        {
            debug!("Could not send locally generated response over {:?}: {}", connection, e);
        }
    }

    /// Record where the request physically came from (RFC 3261 18.2.1, RFC 3581 4)
    fn correct_via(&self, connection: &Arc<dyn SipConnection>, via: &mut Via) {
        via.set_received(connection.remote_host());
        if (connection.is_reliable() && self.is_standalone_mode()) || via.has_param(RPORT) {
            via.set_rport(connection.remote_port());
        }
    }

    /// Re-key an accepted connection under the port its peer listens on, so
    /// requests to that peer reuse it
    fn process_connection_reuse(&self, connection: &Arc<dyn SipConnection>, request: &SipMessage, via: &Via) {
        if connection.alias_port().is_some()
            || connection.is_outbound()
            || !connection.is_reliable()
            || via.transport().eq_ignore_ascii_case("udp")
        {
            return;
        }

        let startup = request.is_method(markers::STARTUP);
        let requested = self.config.force_connection_reuse
            || via.has_param(ALIAS)
            || (startup && self.config.alias_cluster_startup);
        if !requested {
            return;
        }

        let port = if startup && via.port().is_none() {
            0
        } else if request.via_count() == 1 && request.supports(OUTBOUND_OPTION) {
            connection.remote_port()
        } else {
            via.port().unwrap_or_else(|| connection.remote_port())
        };
        trace!("Aliasing {:?} to port {}", connection, port);
        self.registry.update_connection(connection, port);
    }
}

/// Check the headers every request must carry, returning the parsed top Via
fn validate_incoming(request: &SipMessage) -> Result<Via> {
    for name in [headers::CALL_ID, headers::CSEQ, headers::FROM, headers::TO] {
        if !request.has_header(name) {
            return Err(Error::bad_request(400, format!("Missing {} header field", name)));
        }
    }

    let via = match request.top_via() {
        None => return Err(Error::bad_request(400, "Missing Via header field")),
        Some(Err(_)) => return Err(Error::bad_request(400, "Malformed Via header field")),
        Some(Ok(via)) => via,
    };

    if let Some(max_forwards) = request.header(headers::MAX_FORWARDS) {
        match max_forwards.trim().parse::<i64>() {
            Ok(hops) if hops < 0 => return Err(Error::bad_request(483, "Too Many Hops")),
            Ok(_) => {}
            Err(_) => return Err(Error::bad_request(400, "Bad Request, Malformed Max-Forwards header")),
        }
    }

    Ok(via)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SipMessage {
        let mut msg = SipMessage::request("OPTIONS", "sip:bob@10.0.0.9");
        msg.add_header("Via", "SIP/2.0/TCP 10.0.0.1:5070;branch=z9hG4bK1");
        msg.add_header("From", "<sip:alice@10.0.0.1>;tag=1");
        msg.add_header("To", "<sip:bob@10.0.0.9>");
        msg.add_header("Call-ID", "abc");
        msg.add_header("CSeq", "1 OPTIONS");
        msg
    }

    fn status_of(result: Result<Via>) -> Option<u16> {
        result.err().and_then(|e| e.status_code())
    }

    #[test]
    fn test_valid_request() {
        let via = validate_incoming(&request()).unwrap();
        assert_eq!(via.port(), Some(5070));
    }

    #[test]
    fn test_missing_header() {
        let mut msg = request();
        msg.remove_header("CSeq");
        match validate_incoming(&msg) {
            Err(Error::BadRequest { status, reason }) => {
                assert_eq!(status, 400);
                assert_eq!(reason, "Missing CSeq header field");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_max_forwards() {
        let mut msg = request();
        msg.set_header("Max-Forwards", "abc");
        assert_eq!(status_of(validate_incoming(&msg)), Some(400));
        msg.set_header("Max-Forwards", "-1");
        assert_eq!(status_of(validate_incoming(&msg)), Some(483));
        msg.set_header("Max-Forwards", "0");
        assert!(validate_incoming(&msg).is_ok());
    }
}
