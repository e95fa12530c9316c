//! Runtime core for the WDX chat bot.
//!
//! This crate is intentionally transport-agnostic. The messaging transport,
//! the counter store and the command handlers live behind ports (traits)
//! implemented by the owner.

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod ports;
pub mod ratelimit;

pub use errors::{Error, Result};
