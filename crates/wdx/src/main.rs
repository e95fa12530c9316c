use std::{collections::HashSet, sync::Arc};

use tokio_util::sync::CancellationToken;

use wdx_core::{
    config::Config,
    dispatch::{Dispatcher, RegistryHandle},
    lifecycle::SessionLifecycle,
    ratelimit::{MemoryCounterStore, RateLimiter},
};
use wdx_telegram::{router::run_polling, TelegramEstablisher, TelegramReplySink};

mod commands;

#[tokio::main]
async fn main() -> Result<(), wdx_core::Error> {
    wdx_core::logging::init("wdx")?;

    let cfg = Config::load()?;
    let owners: Arc<HashSet<String>> =
        Arc::new(cfg.owner_ids.iter().map(|id| id.to_string()).collect());

    let lifecycle = Arc::new(SessionLifecycle::new(
        cfg.lifecycle.clone(),
        TelegramEstablisher::new(cfg.telegram_bot_token.clone()),
    ));
    let session = lifecycle.start().await?;

    let limiter = RateLimiter::new(cfg.rate_limit.clone(), Arc::new(MemoryCounterStore::new()));
    let registry = Arc::new(RegistryHandle::new(commands::registry(
        limiter.clone(),
        owners.clone(),
    )));

    let dispatcher = Arc::new(
        Dispatcher::new(
            cfg.dispatch.clone(),
            registry,
            limiter,
            Arc::new(TelegramReplySink::new(session.bot())),
        )
        .with_bot_username(session.username())
        .with_supervisor(lifecycle.clone())
        .with_identity_tier(commands::identity_tier(owners)),
    );
    tracing::info!(
        username = %session.username(),
        commands = dispatcher.stats().commands,
        owners = cfg.owner_ids.len(),
        "wdx bot ready"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
    });

    run_polling(lifecycle, dispatcher, shutdown)
        .await
        .map_err(|e| wdx_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
