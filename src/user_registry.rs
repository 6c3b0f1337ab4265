//! # User Registry Module
//!
//! Typed calls to the ad engine's user routes over the broker:
//! `user.are_exist` answers whether a Telegram user is registered and
//! `user.create` registers one. When a route fails, the engine replies with
//! a bare JSON string holding the error message instead of the result.
//!
//! Replies are matched by correlation id, so the engine has to publish each
//! reply to the request's `reply_to` queue with the request's correlation id.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{RoutePair, RpcConfig};
use crate::connection_manager::ConnectionManager;
use crate::errors::RpcError;
use crate::rpc_client::RpcClient;
use crate::transport::QueueIdentity;

#[derive(Debug, Clone, Serialize)]
pub struct UserLookup {
    pub telegram_id: u64,
}

/// Registration payload for `user.create`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub telegram_id: u64,
    /// ISO 8601 date, `YYYY-MM-DD`
    pub birth_day: String,
    pub city: Option<String>,
    /// ISO 3166 alpha-2
    pub country_code: Option<String>,
    pub interests: Vec<String>,
    pub bio: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserProfile {
    pub telegram_id: u64,
    pub birth_day: String,
    pub city: String,
    pub country_code: String,
    pub interests: Vec<String>,
    pub bio: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterReply {
    profile: UserProfile,
}

/// Either the route's result or the engine's error message
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EngineReply<T> {
    Success(T),
    Failure(String),
}

impl<T> EngineReply<T> {
    fn into_result(self) -> Result<T, RpcError> {
        match self {
            EngineReply::Success(value) => Ok(value),
            EngineReply::Failure(message) => Err(RpcError::Remote(message)),
        }
    }
}

/// Client for the user routes, one RPC client per route
pub struct UserRegistry {
    exists: RpcClient,
    create: RpcClient,
}

impl UserRegistry {
    pub async fn new(connections: Arc<ConnectionManager>, config: &RpcConfig) -> Result<Self, RpcError> {
        let client = |route: &RoutePair| {
            RpcClient::new(
                Arc::clone(&connections),
                QueueIdentity::new(
                    route.request_queue.clone(),
                    route.response_queue.clone(),
                    config.vhost.clone(),
                ),
                config.reply_timeout,
            )
        };

        let exists = client(&config.user_queues.exists).await?;
        let create = client(&config.user_queues.create).await?;
        Ok(Self { exists, create })
    }

    /// Whether the user is registered; `None` when no reply came back
    pub async fn exists(&self, telegram_id: u64) -> Result<Option<bool>, RpcError> {
        let reply: Option<EngineReply<bool>> = self
            .exists
            .send_message(&UserLookup { telegram_id })
            .await?;
        reply.map(EngineReply::into_result).transpose()
    }

    /// Register a user and return the stored profile
    pub async fn register(&self, user: &NewUser) -> Result<Option<UserProfile>, RpcError> {
        let reply: Option<EngineReply<RegisterReply>> = self.create.send_message(user).await?;
        let profile = reply
            .map(EngineReply::into_result)
            .transpose()?
            .map(|reply| reply.profile);
        if let Some(profile) = &profile {
            info!(telegram_id = profile.telegram_id, "User registered");
        }
        Ok(profile)
    }

    pub async fn close(&self) -> Result<(), RpcError> {
        let exists = self.exists.close().await;
        let create = self.create.close().await;
        exists.and(create)
    }
}
