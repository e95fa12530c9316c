use async_trait::async_trait;

use crate::{domain::ChatId, errors::TransportError, Result};

/// A live session to the messaging transport.
#[async_trait]
pub trait SessionHandle: Send + Sync + 'static {
    /// Release transport resources held by this session.
    ///
    /// Must be idempotent: the lifecycle manager may call it on a session that
    /// already died on its own.
    async fn teardown(&self) -> Result<()>;
}

/// Hexagonal port for establishing the single outbound session.
///
/// Owned and implemented by the caller; the core treats it as opaque and only
/// bounds each call with its own timeout.
#[async_trait]
pub trait SessionEstablisher: Send + Sync + 'static {
    type Session: SessionHandle;

    async fn establish(&self) -> std::result::Result<Self::Session, TransportError>;
}

/// Hexagonal port for replying to the originating chat.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send_text(&self, chat_id: &ChatId, text: &str) -> Result<()>;
}
