//! # Transport manager
//!
//! Orchestrates everything between the transaction layer and the sockets:
//!
//! ```text
//!  send_message ──► resolve hop ──► get or create connection ──► write ──► done
//!                                                                  │
//!                                        path MTU exceeded ◄───────┘
//!                                          switch UDP → TCP, write once more
//!
//!  bytes ──► on_read ──► parse ──► validate ──► received/rport ──► alias ──► transaction layer
//! ```
//!
//! The manager is an explicitly constructed service; several independent
//! instances can coexist in one process. Build it with
//! [`TransportManagerBuilder`], which also wires it to the connection factory
//! as the receiver of inbound bytes.

mod failure;
mod inbound;
mod mtu;
mod resolve;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tracing::{debug, info, trace, warn};

use crate::backup::{BackupSenderFactory, NaptrCapability};
use crate::config::TransportConfig;
use crate::connection::{ConnectionFactory, ConnectionListener, SipConnection};
use crate::context::{describe, MessageContext, TransactionContext};
use crate::error::{Error, Result};
use crate::events::{TransactionLayer, TransactionLayerSlot};
use crate::hop::{Hop, Transport};
use crate::listening_point::ListeningPoint;
use crate::loopback::LoopbackDispatcher;
use crate::message::{headers, NameAddr, SipMessage};
use crate::registry::ConnectionRegistry;
use crate::router::{DefaultRouter, Router};

/// Builder for [`TransportManager`]
pub struct TransportManagerBuilder {
    config: TransportConfig,
    factory: Arc<dyn ConnectionFactory>,
    router: Option<Arc<dyn Router>>,
    naptr: Option<Arc<dyn NaptrCapability>>,
}

impl TransportManagerBuilder {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            config: TransportConfig::default(),
            factory,
            router: None,
            naptr: None,
        }
    }

    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the [`DefaultRouter`]
    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    /// Register the NAPTR capability of the hosting environment
    pub fn with_naptr_capability(mut self, capability: Arc<dyn NaptrCapability>) -> Self {
        self.naptr = Some(capability);
        self
    }

    /// Build the manager. Must be called within a tokio runtime.
    pub fn build(self) -> Result<Arc<TransportManager>> {
        self.config.validate()?;

        let router = self.router.unwrap_or_else(|| {
            Arc::new(DefaultRouter::new(self.config.standalone, self.config.default_secure_transport))
        });
        install_outbound_proxy(&self.config, router.as_ref());

        let upstream = Arc::new(TransactionLayerSlot::new());
        let manager = Arc::new(TransportManager {
            registry: Arc::new(ConnectionRegistry::new(self.factory.clone())),
            backup: BackupSenderFactory::select(&self.config, self.naptr),
            loopback: LoopbackDispatcher::spawn(upstream.clone()),
            upstream,
            router,
            config: self.config,
            startup_received: AtomicBool::new(false),
            dropped_messages: AtomicU64::new(0),
        });

        let listener: Arc<dyn ConnectionListener> = manager.clone();
        self.factory.set_listener(Arc::downgrade(&listener));
        Ok(manager)
    }
}

fn install_outbound_proxy(config: &TransportConfig, router: &dyn Router) {
    let Some(proxy) = config.outbound_proxy.as_deref().filter(|p| !p.trim().is_empty()) else {
        return;
    };
    match proxy.parse::<NameAddr>() {
        Ok(name_addr) => {
            let hop = Hop::from_uri(name_addr.uri(), config.default_secure_transport);
            info!("Routing all requests through outbound proxy {}", hop);
            router.set_outbound_proxy(hop);
        }
        Err(e) => debug!("Could not parse outbound proxy {}, ignoring it: {}", proxy, e),
    }
}

/// Transport layer service
pub struct TransportManager {
    config: TransportConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<dyn Router>,
    upstream: Arc<TransactionLayerSlot>,
    backup: BackupSenderFactory,
    loopback: LoopbackDispatcher,
    startup_received: AtomicBool,
    dropped_messages: AtomicU64,
}

impl TransportManager {
    pub fn builder(factory: Arc<dyn ConnectionFactory>) -> TransportManagerBuilder {
        TransportManagerBuilder::new(factory)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    pub fn backup_senders(&self) -> &BackupSenderFactory {
        &self.backup
    }

    /// Connect the transaction layer. Requests arriving before this are answered with 503.
    pub fn attach_transaction_layer(&self, layer: Arc<dyn TransactionLayer>) {
        self.upstream.attach(layer);
    }

    pub fn detach_transaction_layer(&self) -> Option<Arc<dyn TransactionLayer>> {
        self.upstream.detach()
    }

    /// Whether this stack talks to peers directly. Turns false for good once
    /// a front proxy announces itself with a STARTUP request.
    pub fn is_standalone_mode(&self) -> bool {
        !self.startup_received.load(Ordering::Acquire) && self.router.is_standalone_mode()
    }

    /// Number of messages dropped so far
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Bind a listening connection
    pub async fn create_listening_connection(
        &self,
        host: &str,
        port: u16,
        transport: Transport,
    ) -> Result<Arc<ListeningPoint>> {
        let lp = self.registry.create_listening_connection(host, port, transport).await?;
        if let Some(sent_by) = &self.config.sent_by_host {
            lp.set_sent_by(sent_by.clone());
        }
        Ok(lp)
    }

    pub fn remove_listening_connection(&self, lp: &ListeningPoint) -> bool {
        self.registry.remove_listening_connection(lp)
    }

    pub fn listening_points(&self) -> Vec<Arc<ListeningPoint>> {
        self.registry.listening_points()
    }

    /// Send a message.
    ///
    /// `provider` is the listening point the sender is bound to, if any. The
    /// connection already attached to `context` is used when it is reliable
    /// and open; otherwise one is resolved. `transaction` pins the hop of
    /// retransmissions.
    ///
    /// Requests to an RFC 5626 flow that no longer exists, or whose flow token
    /// was tampered with, are answered locally with 430 or 403 through
    /// [`TransactionLayer::deliver_event`] and count as sent. So does a
    /// request whose write failed after a path MTU switch: the transaction
    /// layer gets a [`crate::events::TransportEvent::SendFailed`] instead of an error here.
    pub async fn send_message(
        &self,
        mut context: MessageContext,
        provider: Option<&Arc<ListeningPoint>>,
        transaction: Option<&TransactionContext>,
    ) -> Result<()> {
        if context.message().is_loopback() {
            let connection = context.connection().cloned();
            let message = context.done();
            trace!("Queuing loopback message [{}]", message.call_id().unwrap_or_default());
            return self.loopback.dispatch(message, provider.cloned(), connection);
        }

        context.report_failures_to(self.upstream.clone());
        if let Some(transaction) = transaction {
            context.set_transaction_id(transaction.id());
        }

        let supplied = context.connection().cloned();
        let connection = match supplied {
            Some(connection) if connection.is_reliable() && !connection.is_closed() => connection,
            _ => match self.resolve_connection(&mut context, provider, transaction).await {
                Ok(connection) => {
                    if let Some(transaction) = transaction {
                        if transaction.connection().map_or(true, |c| c.is_closed()) {
                            transaction.set_connection(&connection);
                        }
                    }
                    connection
                }
                Err(Error::FlowFailed) => {
                    self.handle_flow_failed(context.message(), transaction).await;
                    return Ok(());
                }
                Err(Error::FlowTampered) => {
                    self.handle_flow_tampered(context.message(), transaction).await;
                    return Ok(());
                }
                Err(e) => {
                    debug!("No connection for sending {}: {}", describe(context.message()), e);
                    return Err(e);
                }
            },
        };

        let consider_mtu =
            context.message().is_request() && !connection.is_reliable() && !context.transport_switched();

        if self.is_standalone_mode() {
            context.message_mut().remove_header(headers::DESTINATION);
        }
        self.trace_out(context.message());
        context.set_connection(connection.clone());

        match self.write(&context, &connection, consider_mtu).await {
            Ok(()) => {
                context.done();
                Ok(())
            }
            Err(Error::PathMtuExceeded { size, limit }) if consider_mtu => {
                debug!("Request of {} bytes is too large for path MTU limit {}", size, limit);
                let switched = self.handle_path_mtu_exceeded(&mut context, &connection).await;
                match self.write(&context, &switched, false).await {
                    Ok(()) => {
                        context.done();
                        Ok(())
                    }
                    Err(e) if context.transport_switched() => {
                        debug!("Write of switched {} failed: {}", describe(context.message()), e);
                        self.fall_back_to_udp(context, &connection).await
                    }
                    Err(e) => {
                        context.write_error(&e).await;
                        Ok(())
                    }
                }
            }
            Err(e) => {
                debug!("Failed writing {} to {}: {}", describe(context.message()), connection.key(), e);
                Err(e)
            }
        }
    }

    async fn write(
        &self,
        context: &MessageContext,
        connection: &Arc<dyn SipConnection>,
        consider_mtu: bool,
    ) -> Result<()> {
        let bytes = context.message().to_bytes();
        let limit = self.config.mtu_limit();
        if consider_mtu && bytes.len() > limit {
            return Err(Error::PathMtuExceeded {
                size: bytes.len(),
                limit,
            });
        }
        trace!("Writing {} bytes to {}", bytes.len(), connection.key());
        connection.write(bytes).await
    }

    fn trace_out(&self, message: &SipMessage) {
        if self.config.trace_out_messages {
            info!("Out message:\r\n{}", message);
        } else {
            trace!("Out message:\r\n{}", message);
        }
    }

    fn trace_in(&self, message: &SipMessage) {
        if self.config.trace_in_messages {
            info!("In message:\r\n{}", message);
        } else {
            trace!("In message:\r\n{}", message);
        }
    }

    /// Record a dropped message and why
    fn message_dropped(&self, message: Option<&SipMessage>, reason: &str) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        match message {
            Some(message) => debug!(
                "Dropped {} [{}]: {}",
                describe(message),
                message.call_id().unwrap_or_default(),
                reason
            ),
            None => debug!("Dropped unparsable message: {}", reason),
        }
    }

    /// Unregister and close a connection
    fn clean_up_connection(&self, connection: &Arc<dyn SipConnection>) {
        debug!("Cleaning up connection {:?}", connection);
        self.registry.remove_connection(connection);
    }

    /// Stop listening and close every connection
    pub fn shutdown(&self) {
        info!("Shutting down transport manager");
        self.registry.close_all();
    }
}

#[async_trait]
impl ConnectionListener for TransportManager {
    async fn on_read(&self, connection: &Arc<dyn SipConnection>, buffer: &mut BytesMut) {
        TransportManager::on_read(self, connection, buffer).await;
    }

    fn on_connection_created(&self, connection: Arc<dyn SipConnection>) {
        if connection.is_reliable() {
            self.registry.add_connection(connection.clone());
        }
        if let Err(e) = connection.start() {
            debug!("Could not start reading from {:?}: {}", connection, e);
            self.clean_up_connection(&connection);
            return;
        }
        debug!("Connection created {:?}", connection);
    }

    fn on_connection_closed(&self, connection: &Arc<dyn SipConnection>) {
        self.clean_up_connection(connection);
    }

    fn on_io_error(&self, connection: &Arc<dyn SipConnection>, error: &Error) {
        warn!("I/O error on {:?}: {}", connection, error);
        self.clean_up_connection(connection);
    }

    fn on_listening_connection_closed(&self, listening_point: &ListeningPoint) {
        warn!("Listening connection {} closed", listening_point);
        self.registry.remove_listening_connection(listening_point);
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("registry", &self.registry)
            .field("standalone", &self.is_standalone_mode())
            .field("dropped_messages", &self.dropped_messages())
            .finish()
    }
}
