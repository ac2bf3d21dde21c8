//! Delivery of self-addressed messages
//!
//! A message the stack sends to itself never touches the network. It is
//! queued and delivered to the transaction layer by a single worker task, in
//! submission order. Queuing keeps the sending task from re-entering the
//! transaction layer from inside its own send call.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::connection::SipConnection;
use crate::error::{Error, Result};
use crate::events::TransactionLayerSlot;
use crate::listening_point::ListeningPoint;
use crate::message::{headers, SipMessage};

struct LoopbackMessage {
    message: SipMessage,
    listening_point: Option<Arc<ListeningPoint>>,
    connection: Option<Arc<dyn SipConnection>>,
}

/// FIFO dispatcher for loopback messages
#[derive(Debug)]
pub struct LoopbackDispatcher {
    queue: mpsc::UnboundedSender<LoopbackMessage>,
    worker: JoinHandle<()>,
}

impl LoopbackDispatcher {
    /// Start the worker. Must be called within a tokio runtime.
    pub fn spawn(upstream: Arc<TransactionLayerSlot>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<LoopbackMessage>();
        let worker = tokio::spawn(async move {
            while let Some(LoopbackMessage {
                mut message,
                listening_point,
                connection,
            }) = rx.recv().await
            {
                message.remove_header(headers::DESTINATION);
                match upstream.get() {
                    Some(layer) => {
                        trace!("Delivering loopback message [{}]", message.call_id().unwrap_or_default());
                        layer.process_message(message, listening_point, connection).await;
                    }
                    None => warn!("Dropping loopback message, no transaction layer attached"),
                }
            }
            debug!("Loopback dispatcher stopped");
        });
        Self { queue, worker }
    }

    /// Queue a message for delivery
    pub fn dispatch(
        &self,
        message: SipMessage,
        listening_point: Option<Arc<ListeningPoint>>,
        connection: Option<Arc<dyn SipConnection>>,
    ) -> Result<()> {
        self.queue
            .send(LoopbackMessage {
                message,
                listening_point,
                connection,
            })
            .map_err(|_| Error::TransportClosed)
    }
}

impl Drop for LoopbackDispatcher {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{TransactionLayer, TransportEvent};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<SipMessage>>,
    }

    #[async_trait]
    impl TransactionLayer for Recorder {
        async fn process_message(
            &self,
            message: SipMessage,
            _listening_point: Option<Arc<ListeningPoint>>,
            _connection: Option<Arc<dyn SipConnection>>,
        ) {
            // yield so a concurrent consumer would have a chance to reorder
            tokio::task::yield_now().await;
            self.received.lock().push(message);
        }

        async fn deliver_event(&self, _event: TransportEvent) {}
    }

    #[tokio::test]
    async fn test_fifo_delivery_strips_destination() {
        let recorder = Arc::new(Recorder::default());
        let slot = Arc::new(TransactionLayerSlot::new());
        slot.attach(recorder.clone());
        let dispatcher = LoopbackDispatcher::spawn(slot);

        for i in 0..20 {
            let mut msg = SipMessage::request("MESSAGE", "sip:self@127.0.0.1");
            msg.add_header("Call-ID", i.to_string());
            msg.add_header("IBM-Destination", "<sip:127.0.0.1:5060>");
            dispatcher.dispatch(msg, None, None).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.received.lock().len() < 20 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let received = recorder.received.lock();
        for (i, msg) in received.iter().enumerate() {
            assert_eq!(msg.call_id(), Some(i.to_string().as_str()));
            assert!(!msg.has_header("IBM-Destination"));
        }
    }
}
