//! # Ad Bot
//!
//! Telegram front-end of the ad engine. Talks to the engine through a
//! correlated request/response client over RabbitMQ: requests go out on a
//! named queue and replies come back on a dedicated response queue, matched
//! by correlation id.

pub mod bot;
pub mod config;
pub mod connection_manager;
pub mod correlation;
pub mod errors;
pub mod logging;
pub mod rpc_client;
pub mod transport;
pub mod user_registry;
pub mod vhost;

pub use connection_manager::ConnectionManager;
pub use errors::{ProvisionError, RpcError, TransportError};
pub use rpc_client::RpcClient;
pub use transport::QueueIdentity;
