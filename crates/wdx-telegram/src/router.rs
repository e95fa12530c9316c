use std::{collections::HashMap, sync::Arc, time::Duration};

use teloxide::{
    prelude::*,
    types::{AllowedUpdate, UpdateKind},
};

use tokio::{
    sync::{mpsc, Mutex},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use wdx_core::{
    dispatch::Dispatcher,
    domain::{ChatId, InboundMessage, SenderId},
    errors::TransportError,
    lifecycle::{RecoveryOutcome, SessionLifecycle},
};

use crate::{classify, session::POLL_TIMEOUT_SECS, TelegramEstablisher};

pub type TelegramLifecycle = SessionLifecycle<TelegramEstablisher>;

/// How long a chat worker lingers without messages before exiting.
const CHAT_IDLE: Duration = Duration::from_secs(300);

/// Messages a single chat may have waiting for dispatch.
pub const CHAT_QUEUE_CAPACITY: usize = 32;

type QueueMap = Arc<Mutex<HashMap<ChatId, mpsc::Sender<InboundMessage>>>>;

/// Per-chat FIFO workers: messages of one chat are dispatched strictly in
/// arrival order, different chats run concurrently. A chat whose queue is
/// full has further messages dropped.
pub struct ChatQueues {
    dispatcher: Arc<Dispatcher>,
    idle: Duration,
    capacity: usize,
    inner: QueueMap,
}

impl ChatQueues {
    pub fn new(dispatcher: Arc<Dispatcher>, idle: Duration) -> Self {
        Self {
            dispatcher,
            idle,
            capacity: CHAT_QUEUE_CAPACITY,
            inner: Arc::default(),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Queue a message for its chat. Returns false if it was dropped.
    pub async fn push(&self, msg: InboundMessage) -> bool {
        let mut map = self.inner.lock().await;
        let chat = msg.chat_id.clone();

        let msg = match map.get(&chat) {
            Some(tx) => match tx.try_send(msg) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(msg)) => {
                    tracing::warn!(
                        chat_id = %chat,
                        sender = %msg.sender_id,
                        capacity = self.capacity,
                        "chat queue full; dropping message"
                    );
                    return false;
                }
                // Worker gone; start a fresh one below.
                Err(mpsc::error::TrySendError::Closed(msg)) => msg,
            },
            None => msg,
        };

        let (tx, rx) = mpsc::channel(self.capacity);
        if tx.try_send(msg).is_err() {
            tracing::warn!(chat_id = %chat, "chat queue closed before first message");
            return false;
        }
        map.insert(chat.clone(), tx);
        tokio::spawn(drain_chat(
            chat,
            rx,
            self.dispatcher.clone(),
            self.inner.clone(),
            self.idle,
        ));
        true
    }

    /// Number of chats with a live worker.
    pub async fn active(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Stop accepting work; workers finish what is queued and exit.
    pub async fn close(&self) {
        self.inner.lock().await.clear();
    }
}

async fn drain_chat(
    chat: ChatId,
    mut rx: mpsc::Receiver<InboundMessage>,
    dispatcher: Arc<Dispatcher>,
    map: QueueMap,
    idle: Duration,
) {
    loop {
        match timeout(idle, rx.recv()).await {
            Ok(Some(msg)) => {
                let outcome = dispatcher.dispatch(msg).await;
                tracing::debug!(chat_id = %chat, outcome = ?outcome, "message dispatched");
            }
            Ok(None) => return,
            Err(_) => {
                // Removal and push both hold the map lock, so nothing queued
                // after this check can be lost.
                let mut map = map.lock().await;
                if rx.is_empty() {
                    map.remove(&chat);
                    return;
                }
            }
        }
    }
}

/// Text messages only; everything else is not for the dispatcher.
pub fn extract_inbound(update: &Update) -> Option<InboundMessage> {
    let UpdateKind::Message(msg) = &update.kind else {
        return None;
    };
    let text = msg.text()?;
    let from = msg.from()?;

    Some(InboundMessage {
        chat_id: ChatId::from(msg.chat.id.0),
        sender_id: SenderId(from.id.0.to_string()),
        sender_name: Some(from.full_name()),
        text: text.to_string(),
    })
}

/// Long-poll `getUpdates` on the live session until shutdown or a fatal
/// transport error. Poll failures are handed to the lifecycle manager, which
/// reconnects (or gives up) before polling resumes.
pub async fn run_polling(
    lifecycle: Arc<TelegramLifecycle>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let queues = ChatQueues::new(dispatcher, CHAT_IDLE);
    let mut fatal = lifecycle.subscribe_fatal();
    let mut offset: i32 = 0;

    tracing::info!("starting telegram polling loop");
    let result = loop {
        let Some(session) = lifecycle.current().await else {
            match lifecycle
                .notify_failure(TransportError::transient("no live telegram session"))
                .await
            {
                Ok(RecoveryOutcome::ShutDown) => break Ok(()),
                Ok(_) => continue,
                Err(e) => break Err(e.into()),
            }
        };
        let session_gone = session.cancelled_token();
        let poll = session
            .bot()
            .get_updates()
            .offset(offset)
            .timeout(POLL_TIMEOUT_SECS)
            .allowed_updates(vec![AllowedUpdate::Message]);

        let polled = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            // Replaced by a recovery elsewhere; poll on the new session.
            _ = session_gone.cancelled() => continue,
            _ = fatal.changed() => {
                let report = fatal.borrow().clone();
                match report {
                    Some(report) => break Err(anyhow::anyhow!(
                        "telegram transport lost: {} ({:?})",
                        report.message,
                        report.kind
                    )),
                    None => continue,
                }
            }
            polled = poll.send() => polled,
        };

        match polled {
            Ok(updates) => {
                tracing::debug!(count = updates.len(), "got telegram updates");
                for update in updates {
                    offset = update.id + 1;
                    match extract_inbound(&update) {
                        Some(msg) => {
                            queues.push(msg).await;
                        }
                        None => tracing::debug!(update_id = update.id, "ignoring non-text update"),
                    }
                }
            }
            Err(e) => {
                let reason = classify(&e);
                tracing::warn!(error = %e, terminal = reason.is_terminal(), "telegram getUpdates failed");
                match lifecycle.notify_failure(reason).await {
                    Ok(RecoveryOutcome::ShutDown) => break Ok(()),
                    Ok(outcome) => tracing::info!(?outcome, "telegram polling resumed"),
                    Err(e) => break Err(e.into()),
                }
            }
        }
    };

    queues.close().await;
    lifecycle.shutdown().await;
    tracing::info!("telegram polling stopped");
    result
}
