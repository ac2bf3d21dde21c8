use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{resolve, ListenerHandle, TCP_READ_CHUNK};
use crate::connection::{ConnectionState, ListeningConnection, SipConnection};
use crate::error::{Error, Result};
use crate::hop::{Hop, Transport};
use crate::listening_point::{ListeningPoint, ListeningPointId};

/// Bound TCP listener with its accept loop
pub struct TcpListeningConnection {
    lp: Arc<ListeningPoint>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpListeningConnection {
    pub(crate) async fn bind(
        id: ListeningPointId,
        host: &str,
        port: u16,
        allowed_parse_errors: u32,
        listener: ListenerHandle,
    ) -> Result<Arc<Self>> {
        let socket = TcpListener::bind((host, port)).await.map_err(|source| Error::BindFailed {
            addr: format!("{}:{}", host, port),
            source,
        })?;
        let local_addr = socket.local_addr()?;
        info!("SIP TCP transport listening on {}", local_addr);

        let lp = Arc::new(ListeningPoint::new(id, host, local_addr.port(), Transport::Tcp));
        let task = tokio::spawn(accept_loop(socket, lp.clone(), allowed_parse_errors, listener));
        Ok(Arc::new(Self {
            lp,
            accept_task: Mutex::new(Some(task)),
        }))
    }
}

async fn accept_loop(socket: TcpListener, lp: Arc<ListeningPoint>, allowed_parse_errors: u32, listener: ListenerHandle) {
    loop {
        match socket.accept().await {
            Ok((stream, peer)) => {
                debug!("Accepted TCP connection from {} on {}", peer, lp);
                let connection = TcpConnection::accepted(lp.clone(), stream, peer, allowed_parse_errors, listener.clone());
                match listener.get() {
                    Some(listener) => listener.on_connection_created(connection),
                    None => debug!("Dropping connection from {}, nobody is listening", peer),
                }
            }
            Err(e) => {
                warn!("Accept failed on {}: {}", lp, e);
                if let Some(listener) = listener.get() {
                    listener.on_listening_connection_closed(&lp);
                }
                break;
            }
        }
    }
}

impl ListeningConnection for TcpListeningConnection {
    fn listening_point(&self) -> &Arc<ListeningPoint> {
        &self.lp
    }

    fn close(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for TcpListeningConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpListeningConnection({})", self.lp)
    }
}

/// A TCP stream to one peer
pub struct TcpConnection {
    this: Weak<TcpConnection>,
    lp: Arc<ListeningPoint>,
    remote_host: String,
    remote_port: u16,
    state: ConnectionState,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    listener: ListenerHandle,
}

impl TcpConnection {
    fn build(
        lp: Arc<ListeningPoint>,
        host: &str,
        port: u16,
        halves: Option<(OwnedReadHalf, OwnedWriteHalf)>,
        allowed_parse_errors: u32,
        listener: ListenerHandle,
    ) -> Arc<Self> {
        let (reader, writer) = match halves {
            Some((reader, writer)) => (Some(reader), Some(writer)),
            None => (None, None),
        };
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: ConnectionState::new(Hop::new(Transport::Tcp, host, port), allowed_parse_errors),
            lp,
            remote_host: host.to_string(),
            remote_port: port,
            writer: tokio::sync::Mutex::new(writer),
            reader: Mutex::new(reader),
            reader_task: Mutex::new(None),
            listener,
        })
    }

    /// Unconnected outbound connection; see [`SipConnection::connect`]
    pub(crate) fn outbound(
        lp: Arc<ListeningPoint>,
        host: &str,
        port: u16,
        allowed_parse_errors: u32,
        listener: ListenerHandle,
    ) -> Arc<Self> {
        Self::build(lp, host, port, None, allowed_parse_errors, listener)
    }

    fn accepted(
        lp: Arc<ListeningPoint>,
        stream: TcpStream,
        peer: SocketAddr,
        allowed_parse_errors: u32,
        listener: ListenerHandle,
    ) -> Arc<Self> {
        let halves = stream.into_split();
        Self::build(
            lp,
            &peer.ip().to_string(),
            peer.port(),
            Some(halves),
            allowed_parse_errors,
            listener,
        )
    }
}

async fn read_loop(connection: Arc<dyn SipConnection>, mut reader: OwnedReadHalf, listener: ListenerHandle) {
    let mut buffer = BytesMut::with_capacity(TCP_READ_CHUNK);
    loop {
        buffer.reserve(TCP_READ_CHUNK);
        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                debug!("Peer closed {:?}", connection);
                if let Some(listener) = listener.get() {
                    listener.on_connection_closed(&connection);
                }
                break;
            }
            Ok(n) => {
                trace!("Read {} bytes on {:?}", n, connection);
                let Some(listener) = listener.get() else {
                    debug!("Closing {:?}, nobody is listening", connection);
                    connection.close();
                    break;
                };
                listener.on_read(&connection, &mut buffer).await;
                if connection.is_closed() {
                    break;
                }
            }
            Err(e) => {
                if connection.is_closed() {
                    break;
                }
                let error = Error::Io(e);
                match listener.get() {
                    Some(listener) => listener.on_io_error(&connection, &error),
                    None => connection.close(),
                }
                break;
            }
        }
    }
}

#[async_trait]
impl SipConnection for TcpConnection {
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
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Ok(());
        }
        let addr = resolve(&self.remote_host, self.remote_port).await?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::connection_failed(addr, e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {}", addr, e);
        }
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock() = Some(read_half);
        *writer = Some(write_half);
        info!("Connected to {} from {}", addr, self.lp);
        Ok(())
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(Error::TransportClosed)?;
        trace!("Writing {} bytes to {}:{}", bytes.len(), self.remote_host, self.remote_port);
        stream.write_all(&bytes).await?;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let reader = self.reader.lock().take();
        let Some(reader) = reader else {
            // already reading, unless closed
            if self.reader_task.lock().is_some() {
                return Ok(());
            }
            return Err(Error::TransportClosed);
        };
        let connection: Arc<dyn SipConnection> = self.this.upgrade().ok_or(Error::TransportClosed)?;
        let task = tokio::spawn(read_loop(connection, reader, self.listener.clone()));
        *self.reader_task.lock() = Some(task);
        Ok(())
    }

    fn close(&self) {
        if !self.state.mark_closed() {
            return;
        }
        debug!("Closing {:?}", self);
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        // dropping the write half shuts the stream down
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpConnection({} <-> {}:{})", self.lp, self.remote_host, self.remote_port)
    }
}
