//! In-memory collaborators shared by the integration tests
#![allow(dead_code)]

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use rvoip_sip_transport_layer::backup::{BackupSender, NaptrCapability};
use rvoip_sip_transport_layer::connection::{
    ConnectionFactory, ConnectionState, ListeningConnection, SipConnection,
};
use rvoip_sip_transport_layer::context::MessageContext;
use rvoip_sip_transport_layer::events::{TransactionLayer, TransportEvent};
use rvoip_sip_transport_layer::hop::{Hop, Transport};
use rvoip_sip_transport_layer::listening_point::{ListeningPoint, ListeningPointId};
use rvoip_sip_transport_layer::message::{SipMessage, TextMessageParser};
use rvoip_sip_transport_layer::prelude::*;

pub const LOCAL_HOST: &str = "10.0.0.1";
pub const LOCAL_PORT: u16 = 5060;

/// Connection that records what is written to it
pub struct MockConnection {
    lp: Arc<ListeningPoint>,
    remote_host: String,
    remote_port: u16,
    state: ConnectionState,
    connect_fails: bool,
    connect_delay: Duration,
    pub fail_writes: AtomicBool,
    pub written: Mutex<Vec<Bytes>>,
    pub close_calls: AtomicUsize,
}

impl MockConnection {
    pub fn new(lp: &Arc<ListeningPoint>, host: &str, port: u16) -> Arc<Self> {
        Self::build(lp, host, port, false, Duration::ZERO)
    }

    fn build(lp: &Arc<ListeningPoint>, host: &str, port: u16, connect_fails: bool, connect_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            lp: lp.clone(),
            remote_host: host.to_string(),
            remote_port: port,
            state: ConnectionState::new(Hop::new(lp.transport(), host, port), 2),
            connect_fails,
            connect_delay,
            fail_writes: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
        })
    }

    /// Everything written so far, parsed back into messages
    pub fn written_messages(&self) -> Vec<SipMessage> {
        self.written
            .lock()
            .iter()
            .map(|bytes| TextMessageParser::parse_bytes(bytes).expect("written message parses"))
            .collect()
    }

    pub fn as_dyn(self: &Arc<Self>) -> Arc<dyn SipConnection> {
        self.clone()
    }
}

#[async_trait]
impl SipConnection for MockConnection {
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
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.connect_fails {
            return Err(Error::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")));
        }
        Ok(())
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        if self.is_closed() || self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        self.written.lock().push(bytes);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.mark_closed();
    }
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MockConnection({} -> {}:{})", self.lp, self.remote_host, self.remote_port)
    }
}

#[derive(Debug)]
pub struct MockListening {
    lp: Arc<ListeningPoint>,
}

impl ListeningConnection for MockListening {
    fn listening_point(&self) -> &Arc<ListeningPoint> {
        &self.lp
    }

    fn close(&self) {}
}

/// Factory that hands out [`MockConnection`]s and remembers them
#[derive(Default)]
pub struct MockFactory {
    pub created: Mutex<Vec<Arc<MockConnection>>>,
    pub fail_reliable_connects: AtomicBool,
    pub connect_delay: Mutex<Duration>,
}

impl MockFactory {
    pub fn created(&self) -> Vec<Arc<MockConnection>> {
        self.created.lock().clone()
    }

    pub fn created_for(&self, transport: Transport) -> Vec<Arc<MockConnection>> {
        self.created()
            .into_iter()
            .filter(|c| c.transport() == transport)
            .collect()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn listen(
        &self,
        id: ListeningPointId,
        host: &str,
        port: u16,
        transport: Transport,
    ) -> Result<Arc<dyn ListeningConnection>> {
        Ok(Arc::new(MockListening {
            lp: Arc::new(ListeningPoint::new(id, host, port, transport)),
        }))
    }

    fn create_connection(&self, lp: &Arc<ListeningPoint>, host: &str, port: u16) -> Result<Arc<dyn SipConnection>> {
        let fails = lp.transport().is_reliable() && self.fail_reliable_connects.load(Ordering::SeqCst);
        let connection = MockConnection::build(lp, host, port, fails, *self.connect_delay.lock());
        self.created.lock().push(connection.clone());
        Ok(connection)
    }
}

/// Transaction layer that records what reaches it
#[derive(Default)]
pub struct RecordingLayer {
    pub messages: Mutex<Vec<SipMessage>>,
    pub events: Mutex<Vec<TransportEvent>>,
}

impl RecordingLayer {
    pub fn messages(&self) -> Vec<SipMessage> {
        self.messages.lock().clone()
    }

    pub fn synthesized(&self) -> Vec<(Option<u64>, SipMessage)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                TransportEvent::ResponseSynthesized { transaction_id, response } => {
                    Some((*transaction_id, response.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Messages given up on, with their transaction id and reason
    pub fn failures(&self) -> Vec<(Option<u64>, SipMessage, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                TransportEvent::SendFailed {
                    transaction_id,
                    message,
                    reason,
                    ..
                } => Some((*transaction_id, message.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    /// Wait until `count` messages arrived
    pub async fn wait_for_messages(&self, count: usize) -> Vec<SipMessage> {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.messages.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("messages arrive in time");
        self.messages()
    }
}

#[async_trait]
impl TransactionLayer for RecordingLayer {
    async fn process_message(
        &self,
        message: SipMessage,
        _listening_point: Option<Arc<ListeningPoint>>,
        _connection: Option<Arc<dyn SipConnection>>,
    ) {
        self.messages.lock().push(message);
    }

    async fn deliver_event(&self, event: TransportEvent) {
        self.events.lock().push(event);
    }
}

/// NAPTR capability whose senders record the messages they get
#[derive(Default)]
pub struct RecordingNaptr {
    pub sent: Arc<Mutex<Vec<SipMessage>>>,
}

struct RecordingSender {
    sent: Arc<Mutex<Vec<SipMessage>>>,
}

#[async_trait]
impl BackupSender for RecordingSender {
    async fn send_backup(&self, context: MessageContext) -> Result<()> {
        self.sent.lock().push(context.done());
        Ok(())
    }

    fn clean(&self) {}

    fn is_poolable(&self) -> bool {
        true
    }
}

impl NaptrCapability for RecordingNaptr {
    fn create_sender(&self, _dns_servers: &[String]) -> Result<Box<dyn BackupSender>> {
        Ok(Box::new(RecordingSender { sent: self.sent.clone() }))
    }
}

/// A manager over mock sockets with UDP and TCP listening on 10.0.0.1:5060
pub struct Harness {
    pub manager: Arc<TransportManager>,
    pub factory: Arc<MockFactory>,
    pub layer: Arc<RecordingLayer>,
    pub udp: Arc<ListeningPoint>,
    pub tcp: Arc<ListeningPoint>,
}

impl Harness {
    pub async fn new(config: TransportConfig) -> Self {
        Self::build(config, None, true).await
    }

    pub async fn without_layer(config: TransportConfig) -> Self {
        Self::build(config, None, false).await
    }

    pub async fn with_naptr(config: TransportConfig, naptr: Arc<RecordingNaptr>) -> Self {
        Self::build(config, Some(naptr), true).await
    }

    async fn build(config: TransportConfig, naptr: Option<Arc<RecordingNaptr>>, attach: bool) -> Self {
        init_tracing();
        let factory = Arc::new(MockFactory::default());
        let mut builder = TransportManager::builder(factory.clone()).with_config(config);
        if let Some(naptr) = naptr {
            builder = builder.with_naptr_capability(naptr);
        }
        let manager = builder.build().expect("manager builds");

        let layer = Arc::new(RecordingLayer::default());
        if attach {
            manager.attach_transaction_layer(layer.clone());
        }

        let udp = manager
            .create_listening_connection(LOCAL_HOST, LOCAL_PORT, Transport::Udp)
            .await
            .expect("udp listening point");
        let tcp = manager
            .create_listening_connection(LOCAL_HOST, LOCAL_PORT, Transport::Tcp)
            .await
            .expect("tcp listening point");

        Self {
            manager,
            factory,
            layer,
            udp,
            tcp,
        }
    }

    /// An accepted TCP connection from `host:port`, registered the way the
    /// socket layer registers it
    pub fn accept_tcp(&self, host: &str, port: u16) -> Arc<MockConnection> {
        let connection = MockConnection::new(&self.tcp, host, port);
        ConnectionListener::on_connection_created(self.manager.as_ref(), connection.as_dyn());
        connection
    }

    /// Feed raw bytes to the manager as if they arrived on `connection`
    pub async fn receive(&self, connection: &Arc<MockConnection>, bytes: &[u8]) {
        let mut buffer = BytesMut::from(bytes);
        self.manager.on_read(&connection.as_dyn(), &mut buffer).await;
    }
}

/// Route test logs through the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A request with the headers the transport layer requires
pub fn request(method: &str, uri: &str, via: &str) -> SipMessage {
    let mut msg = SipMessage::request(method, uri);
    msg.add_header("Via", via);
    msg.add_header("From", "<sip:alice@example.com>;tag=a1");
    msg.add_header("To", "<sip:bob@example.com>");
    msg.add_header("Call-ID", format!("{}-call@{}", method.to_ascii_lowercase(), LOCAL_HOST));
    msg.add_header("CSeq", format!("1 {}", method));
    msg.add_header("Content-Length", "0");
    msg
}

/// A request from this stack, leaving over UDP
pub fn outgoing(method: &str, uri: &str) -> SipMessage {
    request(method, uri, "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKout1")
}

/// Body of `len` bytes
pub fn filler(len: usize) -> Bytes {
    Bytes::from(vec![b'x'; len])
}
