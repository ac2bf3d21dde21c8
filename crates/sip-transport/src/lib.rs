//! SIP transport layer for the rvoip stack
//!
//! Sits between the SIP transaction layer and the sockets. Owns the table of
//! listening points and live connections, picks the connection each message
//! goes out on, and validates and corrects inbound messages before handing
//! them up.
//!
//! Besides plain RFC 3261 transport selection, it implements:
//!
//! - RFC 5626 flow-token routing, answering 430 or 403 locally when a flow is
//!   gone or its token was tampered with
//! - the RFC 3261 18.1.1 switch from UDP to TCP for requests larger than the
//!   path MTU, with a fallback to UDP when no reliable connection can be had
//! - RFC 3581 `received`/`rport` correction and connection reuse aliasing
//! - recovery from failure reports of a front proxy, through a pluggable
//!   backup sender
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_sip_transport_layer::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let config = TransportConfig::default();
//! let factory = Arc::new(TokioConnectionFactory::from_config(&config));
//! let manager = TransportManager::builder(factory).with_config(config).build()?;
//! manager.create_listening_connection("127.0.0.1", 5060, Transport::Udp).await?;
//! manager.create_listening_connection("127.0.0.1", 5060, Transport::Tcp).await?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod hop;
pub mod listening_point;
pub mod logging;
pub mod loopback;
pub mod manager;
pub mod message;
pub mod net;
pub mod registry;
pub mod router;

pub use error::{Error, Result};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::backup::{BackupSender, BackupSenderFactory, NaptrCapability};
    pub use crate::config::TransportConfig;
    pub use crate::connection::{ConnectionFactory, ConnectionListener, ListeningConnection, SipConnection};
    pub use crate::context::{MessageContext, TransactionContext};
    pub use crate::events::{TransactionLayer, TransportEvent};
    pub use crate::hop::{Hop, Transport};
    pub use crate::listening_point::ListeningPoint;
    pub use crate::logging::{setup_logging, LoggingConfig};
    pub use crate::manager::{TransportManager, TransportManagerBuilder};
    pub use crate::message::SipMessage;
    pub use crate::net::TokioConnectionFactory;
    pub use crate::registry::ConnectionRegistry;
    pub use crate::router::{DefaultRouter, Router};
    pub use crate::{Error, Result};
}
