//! # Broker Connection Manager Module
//!
//! This module provides the process-wide registry of broker connections.
//! Establishing an AMQP connection is a full network handshake, so every
//! RPC client in the process shares one connection per virtual host and only
//! opens its own channel on top of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, ReconnectConfig};
use crate::errors::{ProvisionError, TransportError};
use crate::transport::{AmqpConnector, Connection, Connector};
use crate::vhost::{ManagementApi, VhostProvisioner, VhostStatus};

/// Shared broker connections keyed by virtual host
///
/// # Connection Lifecycle
///
/// - A connection is established on the first `acquire()` for its vhost
/// - Later calls reuse it while it reports itself connected
/// - A closed or invalidated connection is replaced on the next `acquire()`
///
/// # Thread Safety
///
/// Each vhost has its own slot behind an async mutex which is held for the
/// whole of a (re)connect, so only one task performs a handshake for that
/// vhost at a time and concurrent callers wait for its result instead of
/// racing it. Reconnecting one vhost never blocks another.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    provisioner: Arc<dyn VhostProvisioner>,
    reconnect: ReconnectConfig,
    slots: StdMutex<HashMap<String, Arc<ConnectionSlot>>>,
}

type ConnectionSlot = Mutex<Option<Arc<dyn Connection>>>;

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        provisioner: Arc<dyn VhostProvisioner>,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            connector,
            provisioner,
            reconnect,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    /// Build a manager talking to a real broker
    pub fn from_config(broker: &BrokerConfig) -> Result<Self, ProvisionError> {
        Ok(Self::new(
            Arc::new(AmqpConnector::new(broker.clone())),
            Arc::new(ManagementApi::from_config(broker)?),
            broker.reconnect.clone(),
        ))
    }

    /// Create the virtual host on the broker, or confirm it exists
    pub async fn ensure_vhost(&self, vhost: &str) -> Result<VhostStatus, ProvisionError> {
        self.provisioner.ensure_vhost(vhost).await
    }

    /// Get the live connection for a vhost, connecting if needed
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connect` once every retry has failed
    pub async fn acquire(&self, vhost: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let slot = self.slot(vhost);
        let mut cached = slot.lock().await;

        if let Some(connection) = cached.as_ref() {
            if connection.is_connected() {
                return Ok(Arc::clone(connection));
            }
            warn!(vhost, "Shared broker connection is closed, reconnecting");
            *cached = None;
        }

        let connection = self.connect_with_retry(vhost).await?;
        *cached = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Forget the connection of a vhost so the next `acquire()` reconnects
    pub async fn invalidate(&self, vhost: &str) {
        let slot = self.slots.lock().unwrap().get(vhost).cloned();
        if let Some(slot) = slot {
            if slot.lock().await.take().is_some() {
                info!(vhost, "Invalidated shared broker connection");
            }
        }
    }

    /// Number of vhosts with a cached connection
    pub async fn connection_count(&self) -> usize {
        let slots: Vec<_> = self.slots.lock().unwrap().values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    fn slot(&self, vhost: &str) -> Arc<ConnectionSlot> {
        let mut slots = self.slots.lock().unwrap();
        Arc::clone(slots.entry(vhost.to_string()).or_default())
    }

    async fn connect_with_retry(&self, vhost: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let mut attempt = 0;
        loop {
            match self.connector.connect(vhost).await {
                Ok(connection) => {
                    if attempt > 0 {
                        info!(vhost, attempt, "Broker connection recovered");
                    }
                    return Ok(connection);
                }
                Err(e) if attempt < self.reconnect.max_retries => {
                    attempt += 1;
                    let delay = self.retry_delay(attempt);
                    warn!(vhost, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Broker connection failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!(vhost, attempts = attempt + 1, "Giving up on broker connection");
                    return Err(e);
                }
            }
        }
    }

    /// Backoff for a retry attempt plus up to 25% random jitter
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.reconnect.backoff(attempt);
        let jitter_ceiling = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ceiling > 0 {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}
