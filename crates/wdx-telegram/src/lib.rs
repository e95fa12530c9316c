//! Telegram adapter (teloxide).
//!
//! Implements the `wdx-core` ports over the Telegram Bot API: the session
//! establisher, the reply sink and the long-polling loop that reports
//! transport failures to the lifecycle manager.

use async_trait::async_trait;

use teloxide::{prelude::*, ApiError, RequestError};

use tokio::time::sleep;

pub mod router;
pub mod session;

pub use session::{TelegramEstablisher, TelegramSession};

use wdx_core::{
    domain::ChatId,
    errors::{Error, TransportError},
    ports::ReplySink,
    Result,
};

/// Telegram rejects longer texts outright.
pub const MESSAGE_LIMIT: usize = 4096;

#[derive(Clone)]
pub struct TelegramReplySink {
    bot: Bot,
}

impl TelegramReplySink {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        match classify(&e) {
            t if t.is_terminal() => Error::FatalAuth(t.message),
            _ => Error::External(format!("telegram error: {e}")),
        }
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        tracing::debug!(wait_secs = d.as_secs(), "telegram flood control; retrying once");
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

#[async_trait]
impl ReplySink for TelegramReplySink {
    async fn send_text(&self, chat_id: &ChatId, text: &str) -> Result<()> {
        let chat = tg_chat(chat_id)?;
        for chunk in split_message(text, MESSAGE_LIMIT) {
            self.with_retry(|| self.bot.send_message(chat, chunk.clone()))
                .await?;
        }
        Ok(())
    }
}

/// Core chat ids are strings; Telegram's are signed integers.
pub fn tg_chat(chat_id: &ChatId) -> Result<teloxide::types::ChatId> {
    chat_id
        .0
        .parse::<i64>()
        .map(teloxide::types::ChatId)
        .map_err(|_| Error::External(format!("not a telegram chat id: {chat_id}")))
}

/// Decide whether a Bot API failure is worth reconnecting over.
pub fn classify(e: &RequestError) -> TransportError {
    match e {
        // teloxide reports a rejected token as `NotFound` ("Unauthorized").
        RequestError::Api(ApiError::NotFound) => {
            TransportError::terminal(format!("telegram rejected the bot token: {e}"))
        }
        RequestError::Api(ApiError::Unknown(desc)) if desc.contains("Unauthorized") => {
            TransportError::terminal(format!("telegram rejected the bot token: {desc}"))
        }
        RequestError::Api(ApiError::TerminatedByOtherGetUpdates) => TransportError::terminal(
            "another instance is already polling with this token".to_string(),
        ),
        other => TransportError::transient(other.to_string()),
    }
}

/// Split on line boundaries where possible so each chunk fits `limit` chars.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len <= limit {
            current.push_str(line);
            current_len += line_len;
            continue;
        }
        // A single overlong line: hard-split by chars.
        for c in line.chars() {
            if current_len == limit {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current.push(c);
            current_len += 1;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_tokens_are_terminal() {
        assert!(classify(&RequestError::Api(ApiError::Unknown(
            "Unauthorized: token revoked".to_string()
        )))
        .is_terminal());
        assert!(!classify(&RequestError::Api(ApiError::Unknown("Bad Gateway".to_string()))).is_terminal());
        assert!(classify(&RequestError::Api(ApiError::NotFound)).is_terminal());
        assert!(classify(&RequestError::Api(ApiError::TerminatedByOtherGetUpdates)).is_terminal());
        assert!(!classify(&RequestError::Api(ApiError::BotBlocked)).is_terminal());
    }

    #[test]
    fn chat_ids_must_be_numeric() {
        assert_eq!(tg_chat(&ChatId::from(-1001)).unwrap().0, -1001);
        assert!(tg_chat(&ChatId("abc".to_string())).is_err());
    }

    #[test]
    fn short_messages_are_not_split() {
        assert_eq!(split_message("hi", 10), vec!["hi".to_string()]);
    }

    #[test]
    fn long_messages_split_on_lines() {
        let chunks = split_message("aaaa\nbbbb\ncccc", 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb\n".to_string(), "cccc".to_string()]);

        let chunks = split_message(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), "x".repeat(25));
    }
}
