//! Delivery failure handling
//!
//! Flow failures are answered locally with a synthesized response. Failure
//! reports from the front proxy (`PROXYERROR`) carry the undelivered message
//! as their body; it is either resent over UDP, when the failure followed an
//! MTU switch, or handed to the backup sender.

use std::sync::Arc;

use tracing::{debug, warn};

use super::TransportManager;
use crate::connection::SipConnection;
use crate::context::{describe, MessageContext, TransactionContext};
use crate::events::TransportEvent;
use crate::message::{markers, SipMessage, TextMessageParser};

impl TransportManager {
    /// The RFC 5626 flow of `request` is gone: answer 430
    pub(super) async fn handle_flow_failed(&self, request: &SipMessage, transaction: Option<&TransactionContext>) {
        warn!(
            "Flow failed for {} [{}]",
            describe(request),
            request.call_id().unwrap_or_default()
        );
        let response = request.create_response(430, "Flow Failed");
        self.deliver_synthesized(response, transaction).await;
    }

    /// The flow token of `request` was tampered with: answer 403
    pub(super) async fn handle_flow_tampered(&self, request: &SipMessage, transaction: Option<&TransactionContext>) {
        warn!(
            "Tampered flow token on {} [{}]",
            describe(request),
            request.call_id().unwrap_or_default()
        );
        let response = request.create_response(403, "Forbidden Flow");
        self.deliver_synthesized(response, transaction).await;
    }

    async fn deliver_synthesized(&self, response: SipMessage, transaction: Option<&TransactionContext>) {
        match self.upstream.get() {
            Some(upstream) => {
                upstream
                    .deliver_event(TransportEvent::ResponseSynthesized {
                        transaction_id: transaction.map(TransactionContext::id),
                        response,
                    })
                    .await;
            }
            None => self.message_dropped(Some(&response), "no transaction layer for synthesized response"),
        }
    }

    /// Process a failure report from the front proxy
    pub(super) async fn handle_proxy_error(&self, connection: &Arc<dyn SipConnection>, report: SipMessage) {
        if report.body().is_empty() {
            self.message_dropped(Some(&report), "failure report without a message");
            return;
        }
        let undelivered = match TextMessageParser::parse_bytes(report.body()) {
            Ok(message) => message,
            Err(e) => {
                self.message_dropped(Some(&report), &format!("unparsable reported message, {}", e));
                return;
            }
        };

        let mtu_switched = matches!(
            undelivered.top_via(),
            Some(Ok(via)) if via.has_param(markers::MTU_SWITCH)
        );
        debug!(
            "Front proxy could not deliver {} [{}]",
            describe(&undelivered),
            undelivered.call_id().unwrap_or_default()
        );
        if mtu_switched {
            self.handle_mtu_error(undelivered).await;
        } else {
            self.handle_general_proxy_error(connection, undelivered).await;
        }
    }

    async fn handle_general_proxy_error(&self, connection: &Arc<dyn SipConnection>, undelivered: SipMessage) {
        let mut context = MessageContext::with_connection(undelivered, connection.clone());
        context.report_failures_to(self.upstream.clone());
        if let Err(e) = self.backup.send_backup(context).await {
            debug!("Backup delivery failed: {}", e);
        }
    }
}
