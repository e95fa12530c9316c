use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;

use wdx_core::{
    errors::TransportError,
    ports::{SessionEstablisher, SessionHandle},
    Result,
};

use crate::classify;

/// Long-poll duration requested from `getUpdates`.
pub const POLL_TIMEOUT_SECS: u32 = 30;

/// HTTP timeout; must outlast the long poll or every idle poll fails.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(45);

/// Creates a verified Bot API session from the bot token.
pub struct TelegramEstablisher {
    token: String,
}

impl TelegramEstablisher {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl SessionEstablisher for TelegramEstablisher {
    type Session = TelegramSession;

    async fn establish(&self) -> std::result::Result<TelegramSession, TransportError> {
        let client = teloxide::net::default_reqwest_settings()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::transient(format!("http client: {e}")))?;
        let bot = Bot::with_client(self.token.clone(), client);

        // Verifies the token; a rejected token is terminal.
        let me = bot.get_me().await.map_err(|e| classify(&e))?;
        // Long polling is refused while a webhook is set.
        bot.delete_webhook().await.map_err(|e| classify(&e))?;

        let username = me.username().to_string();
        tracing::info!(username = %username, bot_id = me.id.0, "telegram session established");

        Ok(TelegramSession {
            bot,
            username,
            cancel: CancellationToken::new(),
        })
    }
}

/// A verified bot client plus the token that stops its polling loop.
pub struct TelegramSession {
    bot: Bot,
    username: String,
    cancel: CancellationToken,
}

impl TelegramSession {
    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Cancelled once the lifecycle manager tears this session down.
    pub fn cancelled_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_torn_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
impl SessionHandle for TelegramSession {
    async fn teardown(&self) -> Result<()> {
        if !self.cancel.is_cancelled() {
            tracing::debug!(username = %self.username, "tearing down telegram session");
        }
        self.cancel.cancel();
        Ok(())
    }
}
