use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{resolve, ListenerHandle, UDP_BUFFER_SIZE};
use crate::connection::{ConnectionState, ListeningConnection, SipConnection};
use crate::error::{Error, Result};
use crate::hop::{Hop, Transport};
use crate::listening_point::{ListeningPoint, ListeningPointId};

/// Bound UDP socket with its receive loop
pub struct UdpListeningConnection {
    lp: Arc<ListeningPoint>,
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpListeningConnection {
    pub(crate) async fn bind(
        id: ListeningPointId,
        host: &str,
        port: u16,
        allowed_parse_errors: u32,
        listener: ListenerHandle,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind((host, port)).await.map_err(|source| Error::BindFailed {
            addr: format!("{}:{}", host, port),
            source,
        })?;
        let local_addr = socket.local_addr()?;
        info!("SIP UDP transport bound to {}", local_addr);

        let listening = Arc::new(Self {
            lp: Arc::new(ListeningPoint::new(id, host, local_addr.port(), Transport::Udp)),
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            receive_task: Mutex::new(None),
        });
        let task = listening.spawn_receive_loop(allowed_parse_errors, listener);
        *listening.receive_task.lock() = Some(task);
        Ok(listening)
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    fn spawn_receive_loop(&self, allowed_parse_errors: u32, listener: ListenerHandle) -> JoinHandle<()> {
        let lp = self.lp.clone();
        let socket = self.socket.clone();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; UDP_BUFFER_SIZE];

            while !closed.load(Ordering::Relaxed) {
                let (len, src) = match socket.recv_from(&mut buffer).await {
                    Ok(received) => received,
                    Err(e) => {
                        if closed.load(Ordering::Relaxed) {
                            break;
                        }
                        // ICMP port unreachable from an earlier send surfaces here on some platforms
                        warn!("Error receiving UDP packet on {}: {}", lp, e);
                        continue;
                    }
                };
                trace!("Received {} bytes from {} on {}", len, src, lp);

                let Some(listener) = listener.get() else {
                    debug!("Dropping datagram from {}, nobody is listening", src);
                    continue;
                };
                let connection: Arc<dyn SipConnection> = Arc::new(UdpConnection::with_target(
                    lp.clone(),
                    socket.clone(),
                    src,
                    allowed_parse_errors,
                ));
                let mut datagram = BytesMut::from(&buffer[..len]);
                listener.on_read(&connection, &mut datagram).await;
            }

            info!("UDP receive loop on {} terminated", lp);
        })
    }
}

impl ListeningConnection for UdpListeningConnection {
    fn listening_point(&self) -> &Arc<ListeningPoint> {
        &self.lp
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for UdpListeningConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpListeningConnection({})", self.lp)
    }
}

/// One UDP peer, addressed over the shared socket of its listening point
pub struct UdpConnection {
    lp: Arc<ListeningPoint>,
    socket: Arc<UdpSocket>,
    remote_host: String,
    remote_port: u16,
    target: Mutex<Option<SocketAddr>>,
    state: ConnectionState,
}

impl UdpConnection {
    pub fn new(
        lp: Arc<ListeningPoint>,
        socket: Arc<UdpSocket>,
        host: &str,
        port: u16,
        allowed_parse_errors: u32,
    ) -> Self {
        Self {
            state: ConnectionState::new(Hop::new(Transport::Udp, host, port), allowed_parse_errors),
            lp,
            socket,
            remote_host: host.to_string(),
            remote_port: port,
            target: Mutex::new(None),
        }
    }

    /// Connection to a peer whose address is already known
    fn with_target(
        lp: Arc<ListeningPoint>,
        socket: Arc<UdpSocket>,
        target: SocketAddr,
        allowed_parse_errors: u32,
    ) -> Self {
        let connection = Self::new(lp, socket, &target.ip().to_string(), target.port(), allowed_parse_errors);
        *connection.target.lock() = Some(target);
        connection
    }

    async fn target(&self) -> Result<SocketAddr> {
        let known = *self.target.lock();
        match known {
            Some(target) => Ok(target),
            None => {
                let target = resolve(&self.remote_host, self.remote_port).await?;
                *self.target.lock() = Some(target);
                Ok(target)
            }
        }
    }
}

#[async_trait]
impl SipConnection for UdpConnection {
    fn listening_point(&self) -> &Arc<ListeningPoint> {
        &self.lp
    }

    fn remote_host(&self) -> &str {
        &self.remote_host
    }

    fn remote_port(&self) -> u16 {
        self.remote_port
    }

    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn connect(&self) -> Result<()> {
        self.target().await.map(|_| ())
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        let destination = self.target().await?;
        debug!("Sending {} byte message to {}", bytes.len(), destination);
        self.socket
            .send_to(&bytes, destination)
            .await
            .map(|_| ())
            .map_err(|source| Error::SendFailed { destination, source })
    }

    fn start(&self) -> Result<()> {
        // the listening point's receive loop delivers datagrams
        Ok(())
    }

    fn close(&self) {
        self.state.mark_closed();
    }
}

impl fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpConnection({} -> {}:{})", self.lp, self.remote_host, self.remote_port)
    }
}
