//! Connection abstractions
//!
//! The socket I/O itself lives behind traits so the transport layer can be
//! driven by the tokio implementation in [`crate::net`] or by in-memory test
//! doubles:
//!
//! - [`SipConnection`]: one conversation with a remote peer (a TCP stream, or
//!   a UDP peer address on a shared socket)
//! - [`ListeningConnection`]: a bound local endpoint
//! - [`ConnectionFactory`]: binds listening connections and builds outbound
//!   connections
//! - [`ConnectionListener`]: receives inbound bytes and lifecycle events; the
//!   transport manager implements it
//!
//! Bookkeeping shared by every implementation (lookup key, alias port,
//! outbound flag, parse error budget, per-connection parser) lives in
//! [`ConnectionState`], which implementations embed and expose through
//! [`SipConnection::state`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::hop::{Hop, Transport};
use crate::listening_point::{ListeningPoint, ListeningPointId};
use crate::message::{MessageParser, ParseOutcome, TextMessageParser};

/// Mutable bookkeeping of a connection
pub struct ConnectionState {
    key: RwLock<Hop>,
    alias_port: Mutex<Option<u16>>,
    outbound: AtomicBool,
    closed: AtomicBool,
    parse_errors: AtomicU32,
    allowed_parse_errors: u32,
    parser: Mutex<Box<dyn MessageParser>>,
}

impl ConnectionState {
    /// State for a connection keyed by `key`, using the default text parser
    pub fn new(key: Hop, allowed_parse_errors: u32) -> Self {
        Self::with_parser(key, allowed_parse_errors, Box::new(TextMessageParser::new()))
    }

    pub fn with_parser(key: Hop, allowed_parse_errors: u32, parser: Box<dyn MessageParser>) -> Self {
        Self {
            key: RwLock::new(key),
            alias_port: Mutex::new(None),
            outbound: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            parse_errors: AtomicU32::new(0),
            allowed_parse_errors,
            parser: Mutex::new(parser),
        }
    }

    pub fn key(&self) -> Hop {
        self.key.read().clone()
    }

    pub fn set_key(&self, key: Hop) {
        *self.key.write() = key;
    }

    pub fn alias_port(&self) -> Option<u16> {
        *self.alias_port.lock()
    }

    /// Record the alias port and move the lookup key to it
    pub fn set_alias_port(&self, port: u16) {
        *self.alias_port.lock() = Some(port);
        self.key.write().set_port(port);
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound.load(Ordering::Acquire)
    }

    pub fn set_outbound(&self, outbound: bool) {
        self.outbound.store(outbound, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed. Returns `true` only for the first caller.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Count one more parse error, returning the new total
    pub fn increment_parse_errors(&self) -> u32 {
        self.parse_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn parse_errors(&self) -> u32 {
        self.parse_errors.load(Ordering::Acquire)
    }

    /// Whether the parse error budget of this connection is spent
    pub fn should_drop_connection(&self) -> bool {
        self.parse_errors() > self.allowed_parse_errors
    }

    /// Parse the next message out of `buffer` with this connection's parser
    pub fn parse(&self, buffer: &mut BytesMut) -> ParseOutcome {
        self.parser.lock().parse(buffer)
    }

    pub fn set_start_line_hunting(&self, hunting: bool) {
        self.parser.lock().set_start_line_hunting(hunting);
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("key", &*self.key.read())
            .field("alias_port", &self.alias_port())
            .field("outbound", &self.is_outbound())
            .field("closed", &self.is_closed())
            .field("parse_errors", &self.parse_errors())
            .finish()
    }
}

/// A connection to one remote peer
#[async_trait]
pub trait SipConnection: Send + Sync + fmt::Debug {
    /// Local listening point this connection belongs to
    fn listening_point(&self) -> &Arc<ListeningPoint>;

    /// Physical address of the peer
    fn remote_host(&self) -> &str;

    fn remote_port(&self) -> u16;

    fn state(&self) -> &ConnectionState;

    /// Establish the connection. No-op for connectionless transports.
    async fn connect(&self) -> Result<()>;

    /// Write one serialized message
    async fn write(&self, bytes: Bytes) -> Result<()>;

    /// Begin delivering inbound bytes to the transport manager
    fn start(&self) -> Result<()>;

    /// Close the connection. Implementations must call [`ConnectionState::mark_closed`].
    fn close(&self);

    fn is_reliable(&self) -> bool {
        self.listening_point().transport().is_reliable()
    }

    fn transport(&self) -> Transport {
        self.listening_point().transport()
    }

    /// Registry lookup key
    fn key(&self) -> Hop {
        self.state().key()
    }

    fn set_key(&self, key: Hop) {
        self.state().set_key(key);
    }

    fn alias_port(&self) -> Option<u16> {
        self.state().alias_port()
    }

    fn is_outbound(&self) -> bool {
        self.state().is_outbound()
    }

    fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Whether the peer is this connection's own listening point
    fn is_loopback(&self) -> bool {
        let lp = self.listening_point();
        lp.port() == self.remote_port() && lp.host().eq_ignore_ascii_case(self.remote_host())
    }
}

/// A bound local endpoint
pub trait ListeningConnection: Send + Sync + fmt::Debug {
    fn listening_point(&self) -> &Arc<ListeningPoint>;

    /// Stop accepting. Connections already accepted stay open.
    fn close(&self);
}

/// Creates listening and outbound connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Bind a listening connection. The returned listening point carries the
    /// actually bound port, which differs from `port` when `port` is zero.
    async fn listen(
        &self,
        id: ListeningPointId,
        host: &str,
        port: u16,
        transport: Transport,
    ) -> Result<Arc<dyn ListeningConnection>>;

    /// Build an unconnected outbound connection from `lp` to `host:port`
    fn create_connection(&self, lp: &Arc<ListeningPoint>, host: &str, port: u16) -> Result<Arc<dyn SipConnection>>;

    /// Register the receiver of inbound bytes and connection events
    fn set_listener(&self, _listener: Weak<dyn ConnectionListener>) {}
}

/// Receiver of inbound bytes and connection lifecycle events
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// New bytes arrived on `connection`. Complete messages are consumed from `buffer`.
    async fn on_read(&self, connection: &Arc<dyn SipConnection>, buffer: &mut BytesMut);

    /// A listening connection accepted a new connection
    fn on_connection_created(&self, connection: Arc<dyn SipConnection>);

    /// The peer closed the connection
    fn on_connection_closed(&self, connection: &Arc<dyn SipConnection>);

    fn on_io_error(&self, connection: &Arc<dyn SipConnection>, error: &Error);

    fn on_listening_connection_closed(&self, listening_point: &ListeningPoint);
}

/// Whether two handles refer to the same connection instance
pub fn same_connection(a: &Arc<dyn SipConnection>, b: &Arc<dyn SipConnection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
