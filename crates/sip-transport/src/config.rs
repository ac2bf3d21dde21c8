//! Transport layer configuration

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hop::Transport;
use crate::message::NameAddr;

/// Default Max-Forwards added to outgoing requests that lack one
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// Settings consumed by the transport manager and its collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Resolve failed destinations through NAPTR and resend to the next target
    pub dns_auto_resolution: bool,

    /// Resolvers used by DNS auto resolution
    pub dns_servers: Vec<String>,

    /// Size of the backup sender pool
    pub max_backup_senders: usize,

    /// Send from the provider's own listening point instead of any listening point
    pub strict_outbound_local_port: bool,

    /// Alias every inbound reliable connection, whether or not the peer asked for it
    pub force_connection_reuse: bool,

    /// Parse errors tolerated on a reliable connection before it is closed
    pub allowed_parse_errors: u32,

    /// Route every request through this proxy, as a SIP URI or name-addr
    pub outbound_proxy: Option<String>,

    /// Path MTU of unreliable transports, in bytes
    pub path_mtu: usize,

    /// Bytes of the path MTU kept free for the Via and headers added downstream
    pub mtu_headroom: usize,

    /// Transport used for `sips` URIs that do not name a secure one
    pub default_secure_transport: Transport,

    /// Whether this stack talks to peers directly rather than behind a front proxy
    pub standalone: bool,

    /// Sent-by host configured for all listening points
    pub sent_by_host: Option<String>,

    /// Create connections from the listening point chosen for the request,
    /// not the provider's one
    pub create_connection_use_lp_from_outbound: bool,

    /// Alias the connection carrying a front proxy STARTUP request
    pub alias_cluster_startup: bool,

    /// Log every inbound message at info level
    pub trace_in_messages: bool,

    /// Log every outbound message at info level
    pub trace_out_messages: bool,

    /// Max-Forwards value added to requests that lack the header
    pub max_forwards_default: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dns_auto_resolution: false,
            dns_servers: Vec::new(),
            max_backup_senders: 10,
            strict_outbound_local_port: false,
            force_connection_reuse: false,
            allowed_parse_errors: 2,
            outbound_proxy: None,
            path_mtu: 1500,
            mtu_headroom: 200,
            default_secure_transport: Transport::Tls,
            standalone: true,
            sent_by_host: None,
            create_connection_use_lp_from_outbound: false,
            alias_cluster_startup: true,
            trace_in_messages: false,
            trace_out_messages: false,
            max_forwards_default: DEFAULT_MAX_FORWARDS,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dns_auto_resolution(mut self, servers: Vec<String>) -> Self {
        self.dns_auto_resolution = true;
        self.dns_servers = servers;
        self
    }

    pub fn with_max_backup_senders(mut self, max: usize) -> Self {
        self.max_backup_senders = max;
        self
    }

    pub fn with_strict_outbound_local_port(mut self, strict: bool) -> Self {
        self.strict_outbound_local_port = strict;
        self
    }

    pub fn with_force_connection_reuse(mut self, force: bool) -> Self {
        self.force_connection_reuse = force;
        self
    }

    pub fn with_allowed_parse_errors(mut self, allowed: u32) -> Self {
        self.allowed_parse_errors = allowed;
        self
    }

    pub fn with_outbound_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.outbound_proxy = Some(proxy.into());
        self
    }

    pub fn with_path_mtu(mut self, path_mtu: usize) -> Self {
        self.path_mtu = path_mtu;
        self
    }

    pub fn with_standalone(mut self, standalone: bool) -> Self {
        self.standalone = standalone;
        self
    }

    pub fn with_sent_by_host(mut self, host: impl Into<String>) -> Self {
        self.sent_by_host = Some(host.into());
        self
    }

    pub fn with_alias_cluster_startup(mut self, alias: bool) -> Self {
        self.alias_cluster_startup = alias;
        self
    }

    pub fn with_message_tracing(mut self, inbound: bool, outbound: bool) -> Self {
        self.trace_in_messages = inbound;
        self.trace_out_messages = outbound;
        self
    }

    /// Largest request sent over an unreliable transport without switching
    pub fn mtu_limit(&self) -> usize {
        self.path_mtu.saturating_sub(self.mtu_headroom)
    }

    /// Whether the NAPTR backup sender may be used
    pub fn naptr_enabled(&self) -> bool {
        self.dns_auto_resolution && !self.dns_servers.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.path_mtu <= self.mtu_headroom {
            return Err(Error::Config(format!(
                "path_mtu ({}) must exceed mtu_headroom ({})",
                self.path_mtu, self.mtu_headroom
            )));
        }
        if self.naptr_enabled() && self.max_backup_senders == 0 {
            return Err(Error::Config(
                "max_backup_senders must be positive with DNS auto resolution".to_string(),
            ));
        }
        if let Some(proxy) = &self.outbound_proxy {
            proxy
                .parse::<NameAddr>()
                .map_err(|e| Error::Config(format!("Invalid outbound proxy {}: {}", proxy, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.allowed_parse_errors, 2);
        assert_eq!(config.mtu_limit(), 1300);
        assert!(config.standalone);
        assert!(!config.naptr_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"force_connection_reuse": true, "default_secure_transport": "TLS"}"#).unwrap();
        assert!(config.force_connection_reuse);
        assert_eq!(config.max_backup_senders, 10);
        assert_eq!(config.default_secure_transport, Transport::Tls);
    }

    #[test]
    fn test_validate() {
        assert!(TransportConfig::new().with_path_mtu(100).validate().is_err());
        assert!(TransportConfig::new()
            .with_dns_auto_resolution(vec!["10.0.0.53".into()])
            .with_max_backup_senders(0)
            .validate()
            .is_err());
        assert!(TransportConfig::new().with_outbound_proxy("not a uri").validate().is_err());
        assert!(TransportConfig::new()
            .with_outbound_proxy("<sip:proxy.example.com:5070;transport=tcp>")
            .validate()
            .is_ok());
    }
}
