//! Local endpoints the stack listens on

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::hop::Transport;

/// Position of a listening point in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListeningPointId(pub usize);

impl fmt::Display for ListeningPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lp-{}", self.0)
    }
}

/// A local (host, port, transport) endpoint.
///
/// Created once when the listening connection is bound. Only the sent-by
/// value, which goes into the Via of outgoing requests, may change afterwards.
#[derive(Debug)]
pub struct ListeningPoint {
    id: ListeningPointId,
    host: String,
    port: u16,
    transport: Transport,
    sent_by: RwLock<String>,
}

impl ListeningPoint {
    pub fn new(id: ListeningPointId, host: impl Into<String>, port: u16, transport: Transport) -> Self {
        let host = host.into();
        Self {
            id,
            sent_by: RwLock::new(host.clone()),
            host,
            port,
            transport,
        }
    }

    pub fn id(&self) -> ListeningPointId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    /// Host advertised in the Via of requests sent from this listening point
    pub fn sent_by(&self) -> String {
        self.sent_by.read().clone()
    }

    pub fn set_sent_by(&self, sent_by: impl Into<String>) {
        *self.sent_by.write() = sent_by.into();
    }

    /// Whether this listening point answers to the given address.
    /// The host may match either the bound host or the sent-by alias.
    pub fn matches(&self, host: &str, port: u16, transport: Transport) -> bool {
        self.transport == transport
            && self.port == port
            && (self.host.eq_ignore_ascii_case(host) || self.sent_by.read().eq_ignore_ascii_case(host))
    }
}

impl fmt::Display for ListeningPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.transport)
    }
}
