//! Interface to the transaction layer above
//!
//! Inbound messages that pass validation go up through
//! [`TransactionLayer::process_message`]. Responses the transport layer
//! synthesizes for outbound requests that had nowhere to go (430 Flow Failed,
//! 403 Forbidden Flow) go up as [`TransportEvent`]s, since no connection
//! exists to carry them. So do messages that were given up on, such as a
//! request the front proxy reported undeliverable with no backup target left.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::connection::SipConnection;
use crate::listening_point::ListeningPoint;
use crate::message::SipMessage;

/// Events delivered upward outside the normal receive path
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A response generated locally for an outbound request
    ResponseSynthesized {
        /// Client transaction that sent the request, if any
        transaction_id: Option<u64>,
        response: SipMessage,
    },
    /// A message could not be delivered and no further attempt will be made
    SendFailed {
        transaction_id: Option<u64>,
        call_id: Option<String>,
        message: SipMessage,
        reason: String,
    },
}

/// The layer that receives inbound messages
#[async_trait]
pub trait TransactionLayer: Send + Sync {
    async fn process_message(
        &self,
        message: SipMessage,
        listening_point: Option<Arc<ListeningPoint>>,
        connection: Option<Arc<dyn SipConnection>>,
    );

    async fn deliver_event(&self, event: TransportEvent);
}

/// Slot for the transaction layer, empty until the stack is initialized
#[derive(Default)]
pub struct TransactionLayerSlot {
    inner: RwLock<Option<Arc<dyn TransactionLayer>>>,
}

impl TransactionLayerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, layer: Arc<dyn TransactionLayer>) {
        *self.inner.write() = Some(layer);
    }

    pub fn detach(&self) -> Option<Arc<dyn TransactionLayer>> {
        self.inner.write().take()
    }

    pub fn get(&self) -> Option<Arc<dyn TransactionLayer>> {
        self.inner.read().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.read().is_some()
    }
}

impl std::fmt::Debug for TransactionLayerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLayerSlot")
            .field("attached", &self.is_attached())
            .finish()
    }
}
