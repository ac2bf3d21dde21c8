//! # Connection registry
//!
//! Authoritative table of listening connections and live connections. Live
//! connections are keyed by `(listening point, hop)`; for reliable transports
//! at most one connection is registered per key.
//!
//! Replacing an entry closes the superseded connection only when it is
//! outbound. An inbound connection belongs to the peer that opened it and is
//! never closed locally on replacement.
//!
//! Removal is race checked: an entry is only removed while it still holds the
//! exact instance being removed, so a connection that was re-keyed by
//! [`ConnectionRegistry::update_connection`] is not removed under its old key.
//!
//! Lookup-or-create is serialized per hop by an async gate, so concurrent
//! senders to the same unregistered hop end up sharing one connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::connection::{same_connection, ConnectionFactory, ListeningConnection, SipConnection};
use crate::error::{Error, Result};
use crate::hop::{Hop, Transport};
use crate::listening_point::{ListeningPoint, ListeningPointId};

type ConnectionKey = (ListeningPointId, Hop);

/// Table of listening points and live connections
pub struct ConnectionRegistry {
    factory: Arc<dyn ConnectionFactory>,
    listening: RwLock<Vec<Arc<dyn ListeningConnection>>>,
    next_listening_id: AtomicUsize,
    connections: DashMap<ConnectionKey, Arc<dyn SipConnection>>,
    gates: DashMap<Hop, Arc<Mutex<()>>>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            listening: RwLock::new(Vec::new()),
            next_listening_id: AtomicUsize::new(0),
            connections: DashMap::new(),
            gates: DashMap::new(),
        }
    }

    /// Bind a new listening connection through the factory and register it
    pub async fn create_listening_connection(
        &self,
        host: &str,
        port: u16,
        transport: Transport,
    ) -> Result<Arc<ListeningPoint>> {
        let id = ListeningPointId(self.next_listening_id.fetch_add(1, Ordering::Relaxed));
        let listening = self.factory.listen(id, host, port, transport).await?;
        let lp = listening.listening_point().clone();
        self.add_listening_point(listening);
        Ok(lp)
    }

    /// Register an already bound listening connection
    pub fn add_listening_point(&self, listening: Arc<dyn ListeningConnection>) {
        info!("Listening on {}", listening.listening_point());
        self.listening.write().push(listening);
    }

    /// Stop and unregister the listening connection of `lp`
    pub fn remove_listening_connection(&self, lp: &ListeningPoint) -> bool {
        let removed = {
            let mut listening = self.listening.write();
            let index = listening.iter().position(|l| l.listening_point().id() == lp.id());
            index.map(|i| listening.remove(i))
        };
        match removed {
            Some(listening) => {
                info!("Stopped listening on {}", lp);
                listening.close();
                true
            }
            None => false,
        }
    }

    pub fn listening_points(&self) -> Vec<Arc<ListeningPoint>> {
        self.listening
            .read()
            .iter()
            .map(|l| l.listening_point().clone())
            .collect()
    }

    pub fn listening_connections(&self) -> Vec<Arc<dyn ListeningConnection>> {
        self.listening.read().clone()
    }

    pub fn get_listening_connection(&self, lp: &ListeningPoint) -> Option<Arc<dyn ListeningConnection>> {
        self.listening
            .read()
            .iter()
            .find(|l| l.listening_point().id() == lp.id())
            .cloned()
    }

    /// First listening point of the transport
    pub fn get_default_listening_point(&self, transport: Transport) -> Option<Arc<ListeningPoint>> {
        self.listening
            .read()
            .iter()
            .map(|l| l.listening_point())
            .find(|lp| lp.transport() == transport)
            .cloned()
    }

    /// Listening point bound to, or advertising, `host:port` on the transport
    pub fn get_listening_point(&self, host: &str, port: u16, transport: Transport) -> Option<Arc<ListeningPoint>> {
        self.listening
            .read()
            .iter()
            .map(|l| l.listening_point())
            .find(|lp| lp.matches(host, port, transport))
            .cloned()
    }

    /// The `index`-th listening point of the transport, in creation order
    pub fn get_listening_point_by_index(&self, index: usize, transport: Transport) -> Option<Arc<ListeningPoint>> {
        self.listening
            .read()
            .iter()
            .map(|l| l.listening_point())
            .filter(|lp| lp.transport() == transport)
            .nth(index)
            .cloned()
    }

    /// Registered connection for `hop`.
    ///
    /// With `lp` omitted, every listening point is searched and the first
    /// match is returned.
    pub fn get_connection(&self, lp: Option<&ListeningPoint>, hop: &Hop) -> Option<Arc<dyn SipConnection>> {
        match lp {
            Some(lp) => self
                .connections
                .get(&(lp.id(), hop.clone()))
                .map(|entry| entry.value().clone()),
            None => self
                .listening_points()
                .iter()
                .find_map(|lp| self.get_connection(Some(lp.as_ref()), hop)),
        }
    }

    /// Register a connection under its current key.
    ///
    /// A different instance previously registered under the key is closed if
    /// it is outbound.
    pub fn add_connection(&self, connection: Arc<dyn SipConnection>) {
        let key = (connection.listening_point().id(), connection.key());
        debug!("Adding connection {:?} under {}", connection, key.1);
        if let Some(replaced) = self.insert(key, connection.clone()) {
            if !same_connection(&replaced, &connection) && replaced.is_outbound() {
                debug!("Closing replaced outbound connection {:?}", replaced);
                replaced.close();
            }
        }
    }

    /// Re-key a connection to `new_port` for connection reuse.
    ///
    /// A different outbound connection previously registered under the new
    /// key is closed, unless it points back at its own listening point.
    pub fn update_connection(&self, connection: &Arc<dyn SipConnection>, new_port: u16) {
        let lp_id = connection.listening_point().id();
        let old_key = connection.key();
        self.connections
            .remove_if(&(lp_id, old_key.clone()), |_, existing| same_connection(existing, connection));

        connection.state().set_alias_port(new_port);
        let new_key = connection.key();
        info!("Connection {} aliased from {} to {}", lp_id, old_key, new_key);

        if let Some(replaced) = self.insert((lp_id, new_key), connection.clone()) {
            if !same_connection(&replaced, connection) && replaced.is_outbound() && !replaced.is_loopback() {
                debug!("Closing outbound connection {:?} superseded by alias", replaced);
                replaced.close();
            }
        }
    }

    /// Unregister and close a connection.
    ///
    /// Returns whether the registry still held this instance. The connection
    /// is closed either way.
    pub fn remove_connection(&self, connection: &Arc<dyn SipConnection>) -> bool {
        let key = (connection.listening_point().id(), connection.key());
        let removed = self
            .connections
            .remove_if(&key, |_, existing| same_connection(existing, connection))
            .is_some();
        if removed {
            debug!("Removed connection {:?}", connection);
        } else {
            trace!("Connection {:?} was not registered under {}", connection, key.1);
        }
        connection.close();
        removed
    }

    /// Build an unconnected connection from `lp` to `host:port`
    pub fn create_connection(&self, lp: &Arc<ListeningPoint>, host: &str, port: u16) -> Result<Arc<dyn SipConnection>> {
        if port == 0 {
            return Err(Error::InvalidPort(u32::from(port)));
        }
        if self.get_listening_connection(lp).is_none() {
            return Err(Error::ListeningPointNotFound(lp.to_string()));
        }
        self.factory.create_connection(lp, host, port)
    }

    /// Registered connection for `hop`, or a new outbound one from `origin`.
    ///
    /// Concurrent callers for the same hop are serialized so only one
    /// connection gets created. Connections on unreliable transports are
    /// returned without being registered.
    pub async fn get_or_create_connection(
        &self,
        lookup: Option<&ListeningPoint>,
        origin: &Arc<ListeningPoint>,
        hop: &Hop,
    ) -> Result<Arc<dyn SipConnection>> {
        if let Some(connection) = self.get_connection(lookup, hop) {
            return Ok(connection);
        }

        let gate = self
            .gates
            .entry(hop.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = gate.lock().await;
            match self.get_connection(lookup, hop) {
                Some(connection) => Ok(connection),
                None => self.connect(origin, hop).await,
            }
        };

        // The map and this call hold the only references when nobody else waits
        self.gates.remove_if(hop, |_, g| Arc::strong_count(g) <= 2);
        result
    }

    async fn connect(&self, origin: &Arc<ListeningPoint>, hop: &Hop) -> Result<Arc<dyn SipConnection>> {
        debug!("Creating connection from {} to {}", origin, hop);
        let connection = self.create_connection(origin, hop.host(), hop.port())?;
        connection.state().set_outbound(true);
        if hop.transport() != origin.transport() {
            connection.set_key(hop.with_transport(origin.transport()));
        } else {
            connection.set_key(hop.clone());
        }

        if let Err(e) = connection.connect().await {
            warn!("Could not connect to {}: {}", hop, e);
            connection.close();
            return Err(Error::connection_failed(hop, e.to_string()));
        }

        if connection.is_reliable() {
            self.add_connection(connection.clone());
        }
        if let Err(e) = connection.start() {
            warn!("Could not start connection to {}: {}", hop, e);
            self.remove_connection(&connection);
            return Err(e);
        }
        Ok(connection)
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections(&self) -> Vec<Arc<dyn SipConnection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Close every listening connection and registered connection
    pub fn close_all(&self) {
        for listening in self.listening.write().drain(..) {
            listening.close();
        }
        let connections = self.connections();
        self.connections.clear();
        for connection in connections {
            connection.close();
        }
    }

    fn insert(&self, key: ConnectionKey, connection: Arc<dyn SipConnection>) -> Option<Arc<dyn SipConnection>> {
        match self.connections.entry(key) {
            // replace the key too, so a wildcard key never outlives its connection
            Entry::Occupied(entry) => Some(entry.replace_entry(connection).1),
            Entry::Vacant(entry) => {
                entry.insert(connection);
                None
            }
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("listening_points", &self.listening.read().len())
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    use crate::connection::ConnectionState;

    #[derive(Debug)]
    struct TestConnection {
        lp: Arc<ListeningPoint>,
        host: String,
        port: u16,
        state: ConnectionState,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl SipConnection for TestConnection {
        fn listening_point(&self) -> &Arc<ListeningPoint> {
            &self.lp
        }

        fn remote_host(&self) -> &str {
            &self.host
        }

        fn remote_port(&self) -> u16 {
            self.port
        }

        fn state(&self) -> &ConnectionState {
            &self.state
        }

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn write(&self, _bytes: Bytes) -> Result<()> {
            Ok(())
        }

        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.state.mark_closed();
        }
    }

    #[derive(Debug)]
    struct TestListening {
        lp: Arc<ListeningPoint>,
    }

    impl ListeningConnection for TestListening {
        fn listening_point(&self) -> &Arc<ListeningPoint> {
            &self.lp
        }

        fn close(&self) {}
    }

    struct TestFactory;

    #[async_trait]
    impl ConnectionFactory for TestFactory {
        async fn listen(
            &self,
            id: ListeningPointId,
            host: &str,
            port: u16,
            transport: Transport,
        ) -> Result<Arc<dyn ListeningConnection>> {
            Ok(Arc::new(TestListening {
                lp: Arc::new(ListeningPoint::new(id, host, port, transport)),
            }))
        }

        fn create_connection(&self, lp: &Arc<ListeningPoint>, host: &str, port: u16) -> Result<Arc<dyn SipConnection>> {
            Ok(connection(lp, host, port))
        }
    }

    fn connection(lp: &Arc<ListeningPoint>, host: &str, port: u16) -> Arc<TestConnection> {
        Arc::new(TestConnection {
            lp: lp.clone(),
            host: host.to_string(),
            port,
            state: ConnectionState::new(Hop::new(lp.transport(), host, port), 2),
            closes: AtomicUsize::new(0),
        })
    }

    async fn registry() -> (ConnectionRegistry, Arc<ListeningPoint>) {
        let registry = ConnectionRegistry::new(Arc::new(TestFactory));
        let tcp = registry
            .create_listening_connection("10.0.0.1", 5060, Transport::Tcp)
            .await
            .unwrap();
        (registry, tcp)
    }

    #[tokio::test]
    async fn test_replacing_outbound_connection_closes_it() {
        let (registry, tcp) = registry().await;
        let old = connection(&tcp, "10.0.0.9", 5070);
        old.state().set_outbound(true);
        registry.add_connection(old.clone());

        let new = connection(&tcp, "10.0.0.9", 5070);
        registry.add_connection(new.clone());

        assert_eq!(old.closes.load(Ordering::SeqCst), 1);
        let found = registry
            .get_connection(Some(&tcp), &Hop::new(Transport::Tcp, "10.0.0.9", 5070))
            .unwrap();
        assert!(same_connection(&found, &(new as Arc<dyn SipConnection>)));
    }

    #[tokio::test]
    async fn test_replacing_inbound_connection_keeps_it_open() {
        let (registry, tcp) = registry().await;
        let inbound = connection(&tcp, "10.0.0.9", 5070);
        registry.add_connection(inbound.clone());

        registry.add_connection(connection(&tcp, "10.0.0.9", 5070));

        assert_eq!(inbound.closes.load(Ordering::SeqCst), 0);
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_update_connection_moves_key_to_alias_port() {
        let (registry, tcp) = registry().await;
        let accepted: Arc<dyn SipConnection> = connection(&tcp, "10.0.0.9", 40000);
        registry.add_connection(accepted.clone());

        registry.update_connection(&accepted, 5070);

        assert_eq!(accepted.alias_port(), Some(5070));
        assert!(registry
            .get_connection(Some(&tcp), &Hop::new(Transport::Tcp, "10.0.0.9", 40000))
            .is_none());
        let found = registry
            .get_connection(None, &Hop::new(Transport::Tcp, "10.0.0.9", 5070))
            .unwrap();
        assert!(same_connection(&found, &accepted));
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_superseded_connection_leaves_replacement() {
        let (registry, tcp) = registry().await;
        let first: Arc<dyn SipConnection> = connection(&tcp, "10.0.0.9", 5070);
        let second: Arc<dyn SipConnection> = connection(&tcp, "10.0.0.9", 5070);
        registry.add_connection(first.clone());
        registry.add_connection(second.clone());

        assert!(!registry.remove_connection(&first));
        assert!(first.is_closed());
        assert_eq!(registry.connection_count(), 1);

        assert!(registry.remove_connection(&second));
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_create_connection_checks_port_and_listening_point() {
        let (registry, tcp) = registry().await;

        assert!(matches!(
            registry.create_connection(&tcp, "10.0.0.9", 0),
            Err(Error::InvalidPort(0))
        ));

        let unknown = Arc::new(ListeningPoint::new(ListeningPointId(42), "10.0.0.1", 5080, Transport::Tcp));
        assert!(matches!(
            registry.create_connection(&unknown, "10.0.0.9", 5070),
            Err(Error::ListeningPointNotFound(_))
        ));

        assert!(registry.create_connection(&tcp, "10.0.0.9", 5070).is_ok());
    }

    #[tokio::test]
    async fn test_listening_point_lookups() {
        let (registry, tcp) = registry().await;
        let second = registry
            .create_listening_connection("10.0.0.2", 5060, Transport::Tcp)
            .await
            .unwrap();
        let udp = registry
            .create_listening_connection("10.0.0.1", 5060, Transport::Udp)
            .await
            .unwrap();

        assert_eq!(registry.get_default_listening_point(Transport::Tcp).unwrap().id(), tcp.id());
        assert_eq!(registry.get_default_listening_point(Transport::Udp).unwrap().id(), udp.id());
        assert_eq!(
            registry.get_listening_point_by_index(1, Transport::Tcp).unwrap().id(),
            second.id()
        );
        assert!(registry.get_listening_point_by_index(2, Transport::Tcp).is_none());
        assert!(registry.get_default_listening_point(Transport::Tls).is_none());

        assert!(registry.remove_listening_connection(&second));
        assert_eq!(registry.listening_points().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_shares_connection() {
        let (registry, tcp) = registry().await;
        let hop = Hop::new(Transport::Tcp, "10.0.0.9", 5070);

        let (a, b) = tokio::join!(
            registry.get_or_create_connection(Some(&tcp), &tcp, &hop),
            registry.get_or_create_connection(Some(&tcp), &tcp, &hop),
        );

        assert!(same_connection(&a.unwrap(), &b.unwrap()));
        assert_eq!(registry.connection_count(), 1);
    }
}
