use std::time::Duration;

use crate::ratelimit::RateLimitTier;

/// Whether a transport failure is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Network blips, timeouts, server hiccups.
    Transient,
    /// Credentials rejected, account banned: retrying cannot help.
    Terminal,
}

/// Opaque failure reported by the transport (or by the establish callback).
///
/// The core only looks at [`TransportError::is_terminal`]; the message is
/// carried along for logs and status snapshots.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: FailureKind,
    pub message: String,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Terminal,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == FailureKind::Terminal
    }
}

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the owner can
/// tell retryable outcomes from fatal ones without matching on strings.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("fatal authentication failure: {0}")]
    FatalAuth(String),

    #[error("connection failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    #[error("rate limit exceeded for {tier} tier, retry after {}s", retry_after.as_secs())]
    RateLimitExceeded {
        tier: RateLimitTier,
        retry_after: Duration,
    },

    #[error("unknown command: {name}")]
    UnknownCommand {
        name: String,
        suggestion: Option<String>,
    },

    #[error("command {command} failed: {source}")]
    Handler {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("counter store error: {0}")]
    Store(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Nothing automatic is safe after this; the owner must intervene.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalAuth(_) | Error::ExhaustedRetries { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(e) => !e.is_terminal(),
            Error::Store(_) | Error::Io(_) => true,
            _ => false,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        if e.is_terminal() {
            Error::FatalAuth(e.message)
        } else {
            Error::Transport(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_transport_errors_become_fatal() {
        let err: Error = TransportError::terminal("invalid token").into();
        assert!(err.is_fatal());
        assert!(!err.is_retryable());

        let err: Error = TransportError::transient("connection reset").into();
        assert!(!err.is_fatal());
        assert!(err.is_retryable());
    }

    #[test]
    fn rate_limit_message_mentions_tier_and_seconds() {
        let err = Error::RateLimitExceeded {
            tier: RateLimitTier::Command,
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(
            err.to_string(),
            "rate limit exceeded for command tier, retry after 42s"
        );
    }
}
