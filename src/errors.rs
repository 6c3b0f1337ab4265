//! # Error Types Module
//!
//! This module defines the error types used by the broker transport, the
//! virtual-host provisioning call and the correlated RPC client.

use std::time::Duration;

use thiserror::Error;

/// Faults raised by the message-broker transport
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Handshake with the broker failed (after retries)
    #[error("Broker connection error: {0}")]
    Connect(String),
    /// Channel could not be opened or was closed by the broker
    #[error("Channel error: {0}")]
    Channel(String),
    /// Queue declaration was refused
    #[error("Queue declaration error: {0}")]
    Declare(String),
    /// Message could not be published
    #[error("Publish error: {0}")]
    Publish(String),
    /// Consumer could not be started or failed mid-stream
    #[error("Consume error: {0}")]
    Consume(String),
    /// Acknowledgement (ack, nack or reject) failed
    #[error("Acknowledgement error: {0}")]
    Ack(String),
}

/// Faults raised while provisioning a virtual host through the management API
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The HTTP request itself failed
    #[error("Management API request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The management API answered with something other than 201 or 204
    #[error("Unexpected status {status} while provisioning vhost \"{vhost}\": {body}")]
    UnexpectedStatus {
        vhost: String,
        status: u16,
        body: String,
    },
    /// The management base URL cannot carry a path
    #[error("Invalid management API url: {0}")]
    InvalidUrl(String),
}

/// Errors returned by [`crate::rpc_client::RpcClient`]
#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The request payload could not be serialized
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    /// The correlated reply could not be deserialized
    #[error("Failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),
    /// No correlated reply arrived in time
    #[error("No response for correlation id {correlation_id} within {timeout:?}")]
    TimedOut {
        correlation_id: String,
        timeout: Duration,
    },
    /// The reply stream failed while the call was outstanding
    #[error("Reply channel lost: {0}")]
    ChannelLost(String),
    /// The remote service answered with an error message
    #[error("Remote error: {0}")]
    Remote(String),
}

impl RpcError {
    /// Whether the error is a reply timeout rather than an infrastructure fault
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::TimedOut { .. })
    }
}
