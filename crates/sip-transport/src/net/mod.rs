//! # tokio sockets
//!
//! [`TokioConnectionFactory`] implements [`ConnectionFactory`] over tokio's
//! UDP and TCP sockets:
//!
//! - UDP: one shared socket per listening point. Each received datagram is
//!   handed to the [`ConnectionListener`] with a fresh, unregistered
//!   [`UdpConnection`] addressing the sending peer.
//! - TCP: an accept loop per listening point, and one reader task per
//!   connection accumulating bytes until the listener consumed a message.
//!
//! TLS needs a handshake layer this crate does not provide, so TLS listening
//! points and connections are rejected.

mod tcp;
mod udp;

pub use tcp::{TcpConnection, TcpListeningConnection};
pub use udp::{UdpConnection, UdpListeningConnection};

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::UdpSocket;

use crate::config::TransportConfig;
use crate::connection::{ConnectionFactory, ConnectionListener, ListeningConnection, SipConnection};
use crate::error::{Error, Result};
use crate::hop::Transport;
use crate::listening_point::{ListeningPoint, ListeningPointId};

/// Receive buffer for one datagram
const UDP_BUFFER_SIZE: usize = 65_535;

/// Read chunk of stream connections
const TCP_READ_CHUNK: usize = 8192;

/// Late-bound receiver of socket events, shared by all socket tasks.
///
/// Holds the listener weakly so socket tasks never keep the transport
/// manager alive.
#[derive(Clone, Default)]
pub(crate) struct ListenerHandle(Arc<RwLock<Option<Weak<dyn ConnectionListener>>>>);

impl ListenerHandle {
    fn set(&self, listener: Weak<dyn ConnectionListener>) {
        *self.0.write() = Some(listener);
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.0.read().as_ref().and_then(Weak::upgrade)
    }
}

/// [`ConnectionFactory`] backed by tokio sockets
pub struct TokioConnectionFactory {
    allowed_parse_errors: u32,
    listener: ListenerHandle,
    udp_sockets: DashMap<ListeningPointId, Arc<UdpSocket>>,
}

impl TokioConnectionFactory {
    pub fn new(allowed_parse_errors: u32) -> Self {
        Self {
            allowed_parse_errors,
            listener: ListenerHandle::default(),
            udp_sockets: DashMap::new(),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.allowed_parse_errors)
    }
}

impl Default for TokioConnectionFactory {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

#[async_trait]
impl ConnectionFactory for TokioConnectionFactory {
    async fn listen(
        &self,
        id: ListeningPointId,
        host: &str,
        port: u16,
        transport: Transport,
    ) -> Result<Arc<dyn ListeningConnection>> {
        match transport {
            Transport::Udp => {
                let listening =
                    UdpListeningConnection::bind(id, host, port, self.allowed_parse_errors, self.listener.clone())
                        .await?;
                self.udp_sockets.insert(id, listening.socket().clone());
                Ok(listening)
            }
            Transport::Tcp => {
                let listening =
                    TcpListeningConnection::bind(id, host, port, self.allowed_parse_errors, self.listener.clone())
                        .await?;
                Ok(listening)
            }
            Transport::Tls => Err(Error::UnsupportedTransport(transport.to_string())),
        }
    }

    fn create_connection(&self, lp: &Arc<ListeningPoint>, host: &str, port: u16) -> Result<Arc<dyn SipConnection>> {
        match lp.transport() {
            Transport::Udp => {
                let socket = self
                    .udp_sockets
                    .get(&lp.id())
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| Error::ListeningPointNotFound(lp.to_string()))?;
                Ok(Arc::new(UdpConnection::new(
                    lp.clone(),
                    socket,
                    host,
                    port,
                    self.allowed_parse_errors,
                )))
            }
            Transport::Tcp => Ok(TcpConnection::outbound(
                lp.clone(),
                host,
                port,
                self.allowed_parse_errors,
                self.listener.clone(),
            )),
            Transport::Tls => Err(Error::UnsupportedTransport(lp.transport().to_string())),
        }
    }

    fn set_listener(&self, listener: Weak<dyn ConnectionListener>) {
        self.listener.set(listener);
    }
}

/// First address `host:port` resolves to
async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::NoConnection(format!("{}:{} does not resolve", host, port)))
}
