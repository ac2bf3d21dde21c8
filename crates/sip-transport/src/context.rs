//! Per-message and per-transaction context
//!
//! A [`MessageContext`] travels with one outbound or inbound message through
//! a single send attempt and is released explicitly with
//! [`MessageContext::done`]. A [`TransactionContext`] is owned by the
//! transaction layer and outlives individual sends; the transport layer uses
//! it to pin the hop of retransmissions and to cache the connection they go
//! out on. The cached connection is held weakly: the registry owns it.
//!
//! A message that cannot be delivered is reported to the transaction layer
//! as a [`TransportEvent::SendFailed`], once the context knows where to send
//! it ([`MessageContext::report_failures_to`]).

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::connection::SipConnection;
use crate::error::{Error, Result};
use crate::events::{TransactionLayerSlot, TransportEvent};
use crate::hop::Hop;
use crate::message::SipMessage;

/// One message on its way through the transport layer
#[derive(Debug)]
pub struct MessageContext {
    message: SipMessage,
    connection: Option<Arc<dyn SipConnection>>,
    transport_switched: bool,
    transaction_id: Option<u64>,
    upstream: Option<Arc<TransactionLayerSlot>>,
}

impl MessageContext {
    pub fn new(message: SipMessage) -> Self {
        Self {
            message,
            connection: None,
            transport_switched: false,
            transaction_id: None,
            upstream: None,
        }
    }

    pub fn with_connection(message: SipMessage, connection: Arc<dyn SipConnection>) -> Self {
        Self {
            connection: Some(connection),
            ..Self::new(message)
        }
    }

    pub fn message(&self) -> &SipMessage {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut SipMessage {
        &mut self.message
    }

    pub fn set_message(&mut self, message: SipMessage) {
        self.message = message;
    }

    pub fn connection(&self) -> Option<&Arc<dyn SipConnection>> {
        self.connection.as_ref()
    }

    pub fn set_connection(&mut self, connection: Arc<dyn SipConnection>) {
        self.connection = Some(connection);
    }

    /// Mark this message as moved off UDP because of its size
    pub fn transport_switch(&mut self) {
        self.transport_switched = true;
    }

    pub fn transport_switched(&self) -> bool {
        self.transport_switched
    }

    pub fn transaction_id(&self) -> Option<u64> {
        self.transaction_id
    }

    pub fn set_transaction_id(&mut self, id: u64) {
        self.transaction_id = Some(id);
    }

    /// Deliver failures of this message to the transaction layer in `upstream`
    pub fn report_failures_to(&mut self, upstream: Arc<TransactionLayerSlot>) {
        self.upstream = Some(upstream);
    }

    /// Give up on a write that failed and tell the transaction layer
    pub async fn write_error(&self, error: &Error) {
        debug!(
            "Failed writing {} to {:?}: {}",
            describe(&self.message),
            self.connection.as_ref().map(|c| c.key()),
            error
        );
        self.report_failure(error.to_string()).await;
    }

    /// Tell the transaction layer this message was not delivered, and release the context
    pub async fn handle_failure(self, reason: impl Into<String>) -> SipMessage {
        self.report_failure(reason.into()).await;
        self.done()
    }

    async fn report_failure(&self, reason: String) {
        let Some(upstream) = self.upstream.as_ref().and_then(|slot| slot.get()) else {
            debug!("Nobody to tell that {} failed: {}", describe(&self.message), reason);
            return;
        };
        upstream
            .deliver_event(TransportEvent::SendFailed {
                transaction_id: self.transaction_id,
                call_id: self.message.call_id().map(str::to_string),
                message: self.message.clone(),
                reason,
            })
            .await;
    }

    /// Release the context once the send attempt completed
    pub fn done(self) -> SipMessage {
        trace!("Done with context of {}", describe(&self.message));
        self.message
    }
}

/// Short label of a message for log lines
pub(crate) fn describe(message: &SipMessage) -> String {
    match (message.method(), message.status_code()) {
        (Some(method), _) => method.to_string(),
        (None, Some(status)) => format!("{} response", status),
        (None, None) => "message".to_string(),
    }
}

/// Transport state a transaction keeps across retransmissions
#[derive(Debug, Default)]
pub struct TransactionContext {
    id: u64,
    hop: Mutex<Option<Hop>>,
    connection: Mutex<Option<Weak<dyn SipConnection>>>,
}

impl TransactionContext {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Hop of the first transmission, if already resolved
    pub fn hop(&self) -> Option<Hop> {
        self.hop.lock().clone()
    }

    /// Resolve the hop of this transmission.
    ///
    /// `resolve` gets the hop of the first transmission, if any. The first
    /// resolved hop is kept for later retransmissions. The check and the update
    /// happen under one lock so a retransmission never sees a half-updated hop.
    pub fn resolve_hop(&self, resolve: impl FnOnce(Option<&Hop>) -> Result<Hop>) -> Result<Hop> {
        let mut slot = self.hop.lock();
        let hop = resolve(slot.as_ref())?;
        if slot.is_none() {
            *slot = Some(hop.clone());
        }
        Ok(hop)
    }

    /// Connection the transaction last went out on, if it is still alive
    pub fn connection(&self) -> Option<Arc<dyn SipConnection>> {
        self.connection.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_connection(&self, connection: &Arc<dyn SipConnection>) {
        *self.connection.lock() = Some(Arc::downgrade(connection));
    }
}
