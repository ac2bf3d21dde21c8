//! # Backup senders
//!
//! When a relay reports that a message could not be delivered, the message
//! is handed to a backup sender. Two strategies exist:
//!
//! - a NAPTR capable sender, supplied by the hosting environment through
//!   [`NaptrCapability`], which resolves the next target and resends. Its
//!   instances are pooled and bounded by `max_backup_senders`.
//! - a no-op sender that hands the failure to the transaction layer.
//!
//! The strategy is chosen once, when the [`BackupSenderFactory`] is built.
//! NAPTR is used only if the capability is registered *and* DNS auto
//! resolution is enabled with at least one resolver.
//!
//! Borrowed senders must be handed back with
//! [`BackupSenderFactory::finish_to_use_sender`]; poolable ones are cleaned
//! and reused, others are dropped.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::context::MessageContext;
use crate::error::{Error, Result};

/// Resends a message whose delivery failed
#[async_trait]
pub trait BackupSender: Send + Sync {
    async fn send_backup(&self, context: MessageContext) -> Result<()>;

    /// Reset per-use state before the sender goes back to the pool
    fn clean(&self);

    /// Whether this instance may be reused after [`BackupSender::clean`]
    fn is_poolable(&self) -> bool;
}

/// NAPTR resolution capability registered by the hosting environment
pub trait NaptrCapability: Send + Sync {
    fn create_sender(&self, dns_servers: &[String]) -> Result<Box<dyn BackupSender>>;
}

/// Sender used when no NAPTR capability is available
#[derive(Debug, Default)]
pub struct NoopBackupSender;

#[async_trait]
impl BackupSender for NoopBackupSender {
    async fn send_backup(&self, context: MessageContext) -> Result<()> {
        debug!(
            "No backup target for failed message [{}]",
            context.message().call_id().unwrap_or("no Call-ID")
        );
        context.handle_failure("no backup target").await;
        Ok(())
    }

    fn clean(&self) {}

    fn is_poolable(&self) -> bool {
        true
    }
}

/// Bounded pool of NAPTR senders
pub struct NaptrSenderPool {
    capability: Arc<dyn NaptrCapability>,
    dns_servers: Vec<String>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn BackupSender>>>,
}

impl NaptrSenderPool {
    pub fn new(capability: Arc<dyn NaptrCapability>, dns_servers: Vec<String>, max_size: usize) -> Self {
        Self {
            capability,
            dns_servers,
            permits: Arc::new(Semaphore::new(max_size)),
            idle: Mutex::new(Vec::with_capacity(max_size)),
        }
    }

    /// Borrow a sender, waiting while the pool is exhausted
    pub async fn acquire(&self) -> Result<PooledSender> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::BackupUnavailable("sender pool closed".to_string()))?;
        let pooled = self.idle.lock().pop();
        let sender = match pooled {
            Some(sender) => sender,
            None => self.capability.create_sender(&self.dns_servers)?,
        };
        Ok(PooledSender {
            sender,
            _permit: Some(permit),
        })
    }

    /// Return a sender. Only poolable senders are kept.
    pub fn release(&self, pooled: PooledSender) {
        if pooled.sender.is_poolable() {
            pooled.sender.clean();
            self.idle.lock().push(pooled.sender);
        }
    }

    /// Senders that may still be borrowed without waiting
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A borrowed backup sender. Holds a pool slot until handed back or dropped.
pub struct PooledSender {
    sender: Box<dyn BackupSender>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PooledSender {
    pub fn sender(&self) -> &dyn BackupSender {
        self.sender.as_ref()
    }
}

impl fmt::Debug for PooledSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSender")
            .field("pooled", &self._permit.is_some())
            .finish()
    }
}

/// Selected backup delivery strategy
pub enum BackupSenderFactory {
    Naptr(NaptrSenderPool),
    Noop,
}

impl BackupSenderFactory {
    /// Choose the strategy for this stack instance
    pub fn select(config: &TransportConfig, capability: Option<Arc<dyn NaptrCapability>>) -> Self {
        match capability {
            Some(capability) if config.naptr_enabled() => {
                info!(
                    "Using NAPTR backup senders, pool size {}, resolvers {:?}",
                    config.max_backup_senders, config.dns_servers
                );
                BackupSenderFactory::Naptr(NaptrSenderPool::new(
                    capability,
                    config.dns_servers.clone(),
                    config.max_backup_senders,
                ))
            }
            Some(_) => {
                debug!("NAPTR capability registered but DNS auto resolution is off");
                BackupSenderFactory::Noop
            }
            None => BackupSenderFactory::Noop,
        }
    }

    pub fn is_naptr(&self) -> bool {
        matches!(self, BackupSenderFactory::Naptr(_))
    }

    pub async fn get_sender(&self) -> Result<PooledSender> {
        match self {
            BackupSenderFactory::Naptr(pool) => pool.acquire().await,
            BackupSenderFactory::Noop => Ok(PooledSender {
                sender: Box::new(NoopBackupSender),
                _permit: None,
            }),
        }
    }

    pub fn finish_to_use_sender(&self, sender: PooledSender) {
        if let BackupSenderFactory::Naptr(pool) = self {
            pool.release(sender);
        }
    }

    /// Borrow a sender, resend through it and hand it back
    pub async fn send_backup(&self, context: MessageContext) -> Result<()> {
        let sender = self.get_sender().await?;
        let result = sender.sender().send_backup(context).await;
        if let Err(e) = &result {
            warn!("Backup send failed: {}", e);
        }
        self.finish_to_use_sender(sender);
        result
    }
}

impl fmt::Debug for BackupSenderFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupSenderFactory::Naptr(pool) => write!(f, "BackupSenderFactory::Naptr(available={})", pool.available()),
            BackupSenderFactory::Noop => f.write_str("BackupSenderFactory::Noop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCapability {
        created: AtomicUsize,
        poolable: bool,
    }

    struct CountingSender {
        poolable: bool,
    }

    #[async_trait]
    impl BackupSender for CountingSender {
        async fn send_backup(&self, _context: MessageContext) -> Result<()> {
            Ok(())
        }

        fn clean(&self) {}

        fn is_poolable(&self) -> bool {
            self.poolable
        }
    }

    impl NaptrCapability for CountingCapability {
        fn create_sender(&self, _dns_servers: &[String]) -> Result<Box<dyn BackupSender>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSender { poolable: self.poolable }))
        }
    }

    fn capability(poolable: bool) -> Arc<CountingCapability> {
        Arc::new(CountingCapability {
            created: AtomicUsize::new(0),
            poolable,
        })
    }

    fn naptr_config() -> TransportConfig {
        TransportConfig::new()
            .with_dns_auto_resolution(vec!["10.0.0.53".to_string()])
            .with_max_backup_senders(2)
    }

    #[test]
    fn test_select_requires_capability_and_dns() {
        let cap: Arc<dyn NaptrCapability> = capability(true);
        assert!(BackupSenderFactory::select(&naptr_config(), Some(cap.clone())).is_naptr());
        assert!(!BackupSenderFactory::select(&naptr_config(), None).is_naptr());
        assert!(!BackupSenderFactory::select(&TransportConfig::new(), Some(cap.clone())).is_naptr());

        let mut no_servers = naptr_config();
        no_servers.dns_servers.clear();
        assert!(!BackupSenderFactory::select(&no_servers, Some(cap)).is_naptr());
    }

    #[tokio::test]
    async fn test_poolable_senders_are_reused() {
        let cap = capability(true);
        let factory = BackupSenderFactory::select(&naptr_config(), Some(cap.clone() as Arc<dyn NaptrCapability>));

        for _ in 0..3 {
            let ctx = MessageContext::new(SipMessage::request("INVITE", "sip:a@b"));
            factory.send_backup(ctx).await.unwrap();
        }
        assert_eq!(cap.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_poolable_senders_are_dropped() {
        let cap = capability(false);
        let factory = BackupSenderFactory::select(&naptr_config(), Some(cap.clone() as Arc<dyn NaptrCapability>));

        let first = factory.get_sender().await.unwrap();
        factory.finish_to_use_sender(first);
        let second = factory.get_sender().await.unwrap();
        factory.finish_to_use_sender(second);
        assert_eq!(cap.created.load(Ordering::SeqCst), 2);
        if let BackupSenderFactory::Naptr(pool) = &factory {
            assert_eq!(pool.idle_count(), 0);
            assert_eq!(pool.available(), 2);
        }
    }

    #[tokio::test]
    async fn test_pool_is_bounded() {
        let cap = capability(true);
        let factory = BackupSenderFactory::select(&naptr_config(), Some(cap as Arc<dyn NaptrCapability>));
        let _a = factory.get_sender().await.unwrap();
        let _b = factory.get_sender().await.unwrap();
        let third = tokio::time::timeout(std::time::Duration::from_millis(50), factory.get_sender()).await;
        assert!(third.is_err());
    }
}
