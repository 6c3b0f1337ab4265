use std::sync::Arc;

use adbot::bot;
use adbot::config::AppConfig;
use adbot::connection_manager::ConnectionManager;
use adbot::logging::init_logging;
use adbot::user_registry::UserRegistry;
use anyhow::{Context, Result};
use teloxide::prelude::*;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    init_logging(&config.logger)?;

    info!("Starting ad bot");

    let connections = Arc::new(
        ConnectionManager::from_config(&config.broker)
            .context("Failed to set up broker management client")?,
    );

    let registry = Arc::new(
        UserRegistry::new(Arc::clone(&connections), &config.rpc)
            .await
            .context("Failed to provision ad engine queues")?,
    );

    match &config.bot {
        Some(bot_config) => {
            let bot = Bot::new(&bot_config.token);
            info!("Bot initialized, starting dispatcher");

            let handler = dptree::entry().branch(Update::filter_message().endpoint({
                let registry = Arc::clone(&registry);
                move |bot: Bot, msg: Message| {
                    let registry = Arc::clone(&registry);
                    async move { bot::message_handler(bot, msg, registry).await }
                }
            }));

            Dispatcher::builder(bot, handler)
                .enable_ctrlc_handler()
                .build()
                .dispatch()
                .await;
        }
        None => {
            warn!("APP__BOT__TOKEN is not set, waiting for Ctrl-C without a Telegram dispatcher");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
        }
    }

    registry.close().await.context("Failed to close RPC channels")?;
    info!("Ad bot stopped");
    Ok(())
}
