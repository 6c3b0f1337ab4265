//! Bot module for handling Telegram interactions
//!
//! Handles the `/start` entry command: looks the sender up in the ad engine
//! and greets them accordingly. Anything else gets a short hint.

use std::sync::Arc;

use anyhow::Result;
use teloxide::prelude::*;
use tracing::{debug, error, info};

use crate::errors::RpcError;
use crate::user_registry::UserRegistry;

pub const WELCOME_BACK: &str = "👋 Welcome back! Your profile is already set up.";
pub const WELCOME_NEW: &str =
    "👋 Hi! You are not registered yet. Let's fill in your profile to get personalised ads.";
pub const SERVICE_UNAVAILABLE: &str =
    "⚠️ The ad service is not responding right now. Please try /start again in a minute.";
pub const HELP: &str = "Send /start to check your registration.";

/// Reply for `/start` given the outcome of the registration lookup
pub fn start_reply(lookup: &Result<Option<bool>, RpcError>) -> &'static str {
    match lookup {
        Ok(Some(true)) => WELCOME_BACK,
        Ok(Some(false)) => WELCOME_NEW,
        Ok(None) | Err(_) => SERVICE_UNAVAILABLE,
    }
}

/// Handle an incoming message
pub async fn message_handler(bot: Bot, msg: Message, registry: Arc<UserRegistry>) -> Result<()> {
    let Some(text) = msg.text() else {
        debug!(user_id = %msg.chat.id, "Ignoring non-text message");
        return Ok(());
    };

    match text.trim() {
        "/start" => {
            let Some(user) = msg.from.as_ref() else {
                return Ok(());
            };
            let telegram_id = user.id.0;
            info!(telegram_id, "Received /start");

            let lookup = registry.exists(telegram_id).await;
            if let Err(e) = &lookup {
                error!(telegram_id, error = %e, "User lookup failed");
            }
            bot.send_message(msg.chat.id, start_reply(&lookup)).await?;
        }
        _ => {
            bot.send_message(msg.chat.id, HELP).await?;
        }
    }

    Ok(())
}
