use std::sync::Arc;
use std::time::Duration;

use adbot::config::ReconnectConfig;
use adbot::errors::{ProvisionError, TransportError};
use adbot::transport::{Connection, MemoryBroker};
use adbot::vhost::{VhostProvisioner, VhostStatus};
use adbot::ConnectionManager;
use anyhow::Result;
use async_trait::async_trait;

struct AcceptAll;

#[async_trait]
impl VhostProvisioner for AcceptAll {
    async fn ensure_vhost(&self, _vhost: &str) -> Result<VhostStatus, ProvisionError> {
        Ok(VhostStatus::AlreadyExists)
    }
}

fn manager(broker: &MemoryBroker, max_retries: u32) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        Arc::new(AcceptAll),
        ReconnectConfig {
            max_retries,
            base_retry_delay_ms: 1,
            max_retry_delay_ms: 5,
        },
    ))
}

#[tokio::test]
async fn test_concurrent_acquire_shares_one_handshake() -> Result<()> {
    let broker = MemoryBroker::new();
    let connections = manager(&broker, 0);

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let connections = Arc::clone(&connections);
            tokio::spawn(async move { connections.acquire("ads-vhost").await })
        })
        .collect();

    let mut acquired = Vec::new();
    for task in tasks {
        acquired.push(task.await??);
    }

    assert_eq!(broker.handshakes(), 1);
    assert!(acquired.iter().all(|c| Arc::ptr_eq(c, &acquired[0])));
    assert_eq!(connections.connection_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_one_connection_per_vhost() -> Result<()> {
    let broker = MemoryBroker::new();
    let connections = manager(&broker, 0);

    connections.acquire("a").await?;
    connections.acquire("b").await?;
    connections.acquire("a").await?;

    assert_eq!(broker.handshakes(), 2);
    assert_eq!(connections.connection_count().await, 2);
    Ok(())
}

#[tokio::test]
async fn test_invalidate_forces_reconnect() -> Result<()> {
    let broker = MemoryBroker::new();
    let connections = manager(&broker, 0);

    connections.acquire("ads-vhost").await?;
    connections.invalidate("ads-vhost").await;
    assert_eq!(connections.connection_count().await, 0);

    connections.acquire("ads-vhost").await?;
    assert_eq!(broker.handshakes(), 2);

    // Unknown vhosts are a no-op
    connections.invalidate("missing").await;
    assert_eq!(connections.connection_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_closed_connection_is_replaced() -> Result<()> {
    let broker = MemoryBroker::new();
    let connections = manager(&broker, 0);

    let first = connections.acquire("ads-vhost").await?;
    broker.drop_connections();
    assert!(!first.is_connected());

    let second = connections.acquire("ads-vhost").await?;
    assert!(second.is_connected());
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(broker.handshakes(), 2);
    Ok(())
}

#[tokio::test]
async fn test_retries_until_budget_is_spent() -> Result<()> {
    let broker = MemoryBroker::new();
    let connections = manager(&broker, 2);

    broker.fail_next_handshakes(2);
    assert!(connections.acquire("ads-vhost").await.is_ok());

    broker.drop_connections();
    broker.fail_next_handshakes(3);
    let result = connections.acquire("ads-vhost").await;

    assert!(matches!(result, Err(TransportError::Connect(_))));
    assert_eq!(connections.connection_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_reconnecting_one_vhost_does_not_block_another() -> Result<()> {
    let broker = MemoryBroker::new();
    let connections = Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        Arc::new(AcceptAll),
        ReconnectConfig {
            max_retries: 1,
            base_retry_delay_ms: 500,
            max_retry_delay_ms: 500,
        },
    ));

    // The first handshake fails, so "slow" backs off for at least 500ms
    broker.fail_next_handshakes(1);
    let slow = {
        let connections = Arc::clone(&connections);
        tokio::spawn(async move { connections.acquire("slow").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let other = tokio::time::timeout(Duration::from_millis(200), connections.acquire("other")).await;
    assert!(matches!(other, Ok(Ok(_))));

    assert!(slow.await?.is_ok());
    assert_eq!(broker.handshakes(), 2);
    Ok(())
}
