use std::sync::Arc;
use std::time::Duration;

use adbot::config::{ReconnectConfig, RpcConfig};
use adbot::errors::{ProvisionError, RpcError};
use adbot::transport::MemoryBroker;
use adbot::user_registry::{NewUser, UserRegistry};
use adbot::vhost::{VhostProvisioner, VhostStatus};
use adbot::ConnectionManager;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

const VHOST: &str = "ad_engine";

struct AcceptAll;

#[async_trait]
impl VhostProvisioner for AcceptAll {
    async fn ensure_vhost(&self, _vhost: &str) -> Result<VhostStatus, ProvisionError> {
        Ok(VhostStatus::Created)
    }
}

fn rpc_config() -> RpcConfig {
    RpcConfig {
        reply_timeout: Duration::from_secs(5),
        ..RpcConfig::default()
    }
}

async fn registry(broker: &MemoryBroker, config: &RpcConfig) -> Result<UserRegistry> {
    let connections = Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        Arc::new(AcceptAll),
        ReconnectConfig::default(),
    ));
    Ok(UserRegistry::new(connections, config).await?)
}

/// Registered users are the ones with an even Telegram id
async fn spawn_exists_route(broker: &MemoryBroker) -> Result<()> {
    broker
        .spawn_responder(VHOST, "user.are_exist", |request: Value| async move {
            let id = request["telegram_id"].as_u64()?;
            Some(json!(id % 2 == 0))
        })
        .await?;
    Ok(())
}

async fn spawn_create_route(broker: &MemoryBroker) -> Result<()> {
    broker
        .spawn_responder(VHOST, "user.create", |request: Value| async move {
            if request["telegram_id"] == 7 {
                return Some(json!("User already exists"));
            }
            Some(json!({
                "profile": {
                    "telegram_id": request["telegram_id"],
                    "birth_day": request["birth_day"],
                    "city": request["city"].as_str().unwrap_or("Moscow"),
                    "country_code": request["country_code"].as_str().unwrap_or("RU"),
                    "interests": request["interests"],
                    "bio": request["bio"],
                }
            }))
        })
        .await?;
    Ok(())
}

fn new_user(telegram_id: u64) -> NewUser {
    NewUser {
        telegram_id,
        birth_day: "1995-05-15".to_string(),
        city: None,
        country_code: None,
        interests: vec!["music".to_string(), "travel".to_string()],
        bio: Some("Hello".to_string()),
        latitude: 55.75,
        longitude: 37.61,
    }
}

#[tokio::test]
async fn test_exists_reports_registration() -> Result<()> {
    let broker = MemoryBroker::new();
    spawn_exists_route(&broker).await?;
    let registry = registry(&broker, &rpc_config()).await?;

    assert_eq!(registry.exists(42).await?, Some(true));
    assert_eq!(registry.exists(43).await?, Some(false));

    registry.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_register_returns_stored_profile() -> Result<()> {
    let broker = MemoryBroker::new();
    spawn_create_route(&broker).await?;
    let registry = registry(&broker, &rpc_config()).await?;

    let profile = registry
        .register(&new_user(100))
        .await?
        .expect("engine should reply");

    assert_eq!(profile.telegram_id, 100);
    assert_eq!(profile.birth_day, "1995-05-15");
    assert_eq!(profile.city, "Moscow");
    assert_eq!(profile.country_code, "RU");
    assert_eq!(profile.interests, vec!["music", "travel"]);
    assert_eq!(profile.bio.as_deref(), Some("Hello"));
    Ok(())
}

#[tokio::test]
async fn test_engine_error_message_is_remote_error() -> Result<()> {
    let broker = MemoryBroker::new();
    spawn_create_route(&broker).await?;
    let registry = registry(&broker, &rpc_config()).await?;

    match registry.register(&new_user(7)).await {
        Err(RpcError::Remote(message)) => assert_eq!(message, "User already exists"),
        other => panic!("Unexpected result: {other:?}"),
    }

    // The route stays usable after a remote failure
    assert!(registry.register(&new_user(8)).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_routes_share_one_connection() -> Result<()> {
    let broker = MemoryBroker::new();
    spawn_exists_route(&broker).await?;
    spawn_create_route(&broker).await?;
    let registry = registry(&broker, &rpc_config()).await?;

    assert_eq!(registry.exists(2).await?, Some(true));
    assert!(registry.register(&new_user(2)).await?.is_some());
    assert_eq!(broker.handshakes(), 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_engine_times_out() -> Result<()> {
    let broker = MemoryBroker::new();
    let config = RpcConfig {
        reply_timeout: Duration::from_millis(100),
        ..RpcConfig::default()
    };
    let registry = registry(&broker, &config).await?;

    let result = registry.exists(42).await;

    assert!(matches!(result, Err(ref e) if e.is_timeout()), "{result:?}");
    Ok(())
}
