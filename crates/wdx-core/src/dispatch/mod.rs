//! Command dispatch: parse, resolve, guard and execute one inbound message.
//!
//! Pipeline per command message:
//!
//! ```text
//! parse -> resolve -> global middleware -> command middleware
//!       -> rate-limit gate -> analytics -> handler
//! ```
//!
//! Plain text goes to the single fallback handler instead, or is ignored.

pub mod parser;
pub mod registry;
pub mod stats;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{timeout, Instant};

use crate::{
    domain::{InboundMessage, SenderId},
    errors::{Error, TransportError},
    lifecycle::{RecoveryOutcome, TransportSupervisor},
    ports::ReplySink,
    ratelimit::{RateLimitTier, RateLimiter},
    Result,
};

pub use parser::{CommandParser, DispatchRequest, ParsedCommand};
pub use registry::{
    handler_fn, CommandContext, CommandEntry, CommandHandler, CommandRegistry, Middleware,
    MiddlewareOutcome, RegistryBuilder, RegistryHandle, Resolution,
};
pub use stats::{CommandUsage, DispatcherStats, UsageTracker};

use stats::UsageEvent;

pub const GENERIC_FAILURE_REPLY: &str =
    "❌ An error occurred while executing the command. Please try again later.";

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub prefixes: Vec<char>,
    /// Bound on one handler run; exceeding it counts as a failure.
    pub handler_timeout: Duration,
    pub max_suggestion_distance: usize,
    pub max_suggestions: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            prefixes: vec!['.', '!', '/', '#'],
            handler_timeout: Duration::from_secs(30),
            max_suggestion_distance: 2,
            max_suggestions: 3,
        }
    }
}

/// Conversational path for messages that are not commands.
#[async_trait]
pub trait FallbackHandler: Send + Sync + 'static {
    async fn handle(&self, message: InboundMessage, replies: Arc<dyn ReplySink>)
        -> anyhow::Result<()>;
}

/// What happened to one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Executed {
        command: String,
        elapsed: Duration,
    },
    Failed {
        command: String,
        error: String,
    },
    Rejected {
        command: String,
        reason: String,
    },
    RateLimited {
        command: String,
        tier: RateLimitTier,
        retry_after: Duration,
    },
    Disabled {
        command: String,
    },
    Unknown {
        name: String,
        suggestion: Option<String>,
    },
    /// Handed to the fallback handler.
    Fallback,
    /// Not a command and no fallback installed.
    Ignored,
}

type IdentityTierFn = dyn Fn(&SenderId) -> RateLimitTier + Send + Sync;

pub struct Dispatcher {
    cfg: DispatchConfig,
    parser: CommandParser,
    registry: Arc<RegistryHandle>,
    global_middleware: Vec<Arc<dyn Middleware>>,
    limiter: RateLimiter,
    identity_tier: Arc<IdentityTierFn>,
    replies: Arc<dyn ReplySink>,
    fallback: Option<Arc<dyn FallbackHandler>>,
    supervisor: Option<Arc<dyn TransportSupervisor>>,
    usage: Arc<UsageTracker>,
}

impl Dispatcher {
    pub fn new(
        cfg: DispatchConfig,
        registry: Arc<RegistryHandle>,
        limiter: RateLimiter,
        replies: Arc<dyn ReplySink>,
    ) -> Self {
        Self {
            parser: CommandParser::new(cfg.prefixes.clone()),
            cfg,
            registry,
            global_middleware: Vec::new(),
            limiter,
            identity_tier: Arc::new(|_: &SenderId| RateLimitTier::User),
            replies,
            fallback: None,
            supervisor: None,
            usage: Arc::new(UsageTracker::default()),
        }
    }

    pub fn with_bot_username(mut self, username: impl Into<String>) -> Self {
        self.parser = self.parser.with_bot_username(username);
        self
    }

    /// Global middleware runs before every command's own middleware, in
    /// registration order.
    pub fn with_middleware(mut self, m: impl Middleware) -> Self {
        self.global_middleware.push(Arc::new(m));
        self
    }

    pub fn with_fallback(mut self, fallback: impl FallbackHandler) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn TransportSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Decide the identity tier (`User` or `Premium`) per sender.
    pub fn with_identity_tier(
        mut self,
        f: impl Fn(&SenderId) -> RateLimitTier + Send + Sync + 'static,
    ) -> Self {
        self.identity_tier = Arc::new(f);
        self
    }

    pub fn registry(&self) -> &Arc<RegistryHandle> {
        &self.registry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats::collect(&self.registry.snapshot(), &self.usage)
    }

    /// Forward an owner-detected disconnect to the lifecycle manager.
    pub async fn report_transport_failure(&self, reason: TransportError) -> Result<RecoveryOutcome> {
        let Some(supervisor) = &self.supervisor else {
            return Err(Error::External(
                "no transport supervisor installed".to_string(),
            ));
        };
        supervisor.notify_failure(reason).await
    }

    /// Run one message through the pipeline. Never fails: every error is
    /// logged and turned into a reply or an outcome.
    pub async fn dispatch(&self, message: InboundMessage) -> DispatchOutcome {
        let Some(parsed) = self.parser.parse(&message.text) else {
            return self.run_fallback(message).await;
        };
        let request = DispatchRequest::new(message, parsed);
        let registry = self.registry.snapshot();

        let command = match registry.resolve(&request.parsed_name, self.cfg.max_suggestion_distance)
        {
            Resolution::Found(entry) => entry,
            Resolution::NotFound { suggestions } => {
                return self.reply_unknown(&request, suggestions).await;
            }
        };
        let name = command.name.clone();

        if !command.enabled {
            self.reply(&request, &format!("⛔ Command \"{name}\" is currently disabled."))
                .await;
            return DispatchOutcome::Disabled { command: name };
        }

        let chain = self
            .global_middleware
            .iter()
            .chain(command.middleware.iter());
        for m in chain {
            if let MiddlewareOutcome::Reject(reason) = m.check(&request, &command).await {
                tracing::debug!(
                    command = %name,
                    sender = %request.sender_id,
                    middleware = m.name(),
                    "command rejected by middleware"
                );
                self.usage.record(&name, UsageEvent::Rejected);
                self.reply(&request, &reason).await;
                return DispatchOutcome::Rejected {
                    command: name,
                    reason,
                };
            }
        }

        let identity = (self.identity_tier)(&request.sender_id);
        let checks = RateLimiter::command_checks(
            &request.sender_id,
            &name,
            identity,
            command.rate_limit_tier,
        );
        let decision = self.limiter.check_all(&checks).await;
        if !decision.allowed {
            let tier = decision
                .failed
                .as_ref()
                .map_or(command.rate_limit_tier, |c| c.tier);
            let retry_after = decision.retry_after().unwrap_or_default();
            let err = Error::RateLimitExceeded { tier, retry_after };
            tracing::info!(
                command = %name,
                sender = %request.sender_id,
                error = %err,
                "command rate limited"
            );
            self.usage.record(&name, UsageEvent::RateLimited);
            self.reply(
                &request,
                &format!(
                    "⏰ Rate limit exceeded. Try again in {}s",
                    ceil_secs(retry_after)
                ),
            )
            .await;
            return DispatchOutcome::RateLimited {
                command: name,
                tier,
                retry_after,
            };
        }

        self.usage.record(&name, UsageEvent::Invoked);

        let ctx = CommandContext {
            request,
            command: command.clone(),
            registry,
            replies: self.replies.clone(),
            usage: self.usage.clone(),
            supervisor: self.supervisor.clone(),
        };
        let chat_id = ctx.request.chat_id.clone();
        let sender = ctx.request.sender_id.clone();
        let args = ctx.request.args.len();
        let handler = command.handler.clone();

        let started = Instant::now();
        match self.guarded(async move { handler.handle(ctx).await }).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                tracing::info!(
                    command = %name,
                    category = %command.category,
                    args,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "command executed"
                );
                DispatchOutcome::Executed {
                    command: name,
                    elapsed,
                }
            }
            Err(source) => {
                let err = Error::Handler {
                    command: name.clone(),
                    source,
                };
                tracing::error!(command = %name, sender = %sender, error = %err, "command execution failed");
                self.usage.record(&name, UsageEvent::Failed);
                if let Err(e) = self.replies.send_text(&chat_id, GENERIC_FAILURE_REPLY).await {
                    tracing::warn!(error = %e, "failed to send error reply");
                }
                DispatchOutcome::Failed {
                    command: name,
                    error: err.to_string(),
                }
            }
        }
    }

    async fn run_fallback(&self, message: InboundMessage) -> DispatchOutcome {
        let Some(fallback) = self.fallback.clone() else {
            return DispatchOutcome::Ignored;
        };
        let replies = self.replies.clone();
        let sender = message.sender_id.clone();

        if let Err(e) = self
            .guarded(async move { fallback.handle(message, replies).await })
            .await
        {
            tracing::error!(sender = %sender, error = %e, "fallback handler failed");
        }
        DispatchOutcome::Fallback
    }

    /// Run handler code in its own task, so a panic or a hang is contained.
    async fn guarded<F>(&self, fut: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut task = tokio::spawn(fut);
        match timeout(self.cfg.handler_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_panic() => {
                let payload = join.into_panic();
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(anyhow::anyhow!("handler panicked: {msg}"))
            }
            Ok(Err(join)) => Err(anyhow::anyhow!("handler task cancelled: {join}")),
            Err(_) => {
                task.abort();
                Err(anyhow::anyhow!(
                    "handler timed out after {}s",
                    self.cfg.handler_timeout.as_secs()
                ))
            }
        }
    }

    async fn reply_unknown(
        &self,
        request: &DispatchRequest,
        suggestions: Vec<String>,
    ) -> DispatchOutcome {
        let name = request.parsed_name.clone();
        let suggestion = suggestions.first().cloned();
        let err = Error::UnknownCommand {
            name: name.clone(),
            suggestion: suggestion.clone(),
        };
        tracing::debug!(sender = %request.sender_id, error = %err, "unknown command");

        let text = if suggestions.is_empty() {
            format!(
                "Command \"{name}\" not found. Type {}help for available commands.",
                request.prefix
            )
        } else {
            let list = suggestions
                .iter()
                .take(self.cfg.max_suggestions)
                .map(|s| format!("• {s}"))
                .collect::<Vec<_>>()
                .join("\n");
            format!("Command \"{name}\" not found. Did you mean:\n{list}")
        };
        self.reply(request, &text).await;
        DispatchOutcome::Unknown { name, suggestion }
    }

    async fn reply(&self, request: &DispatchRequest, text: &str) {
        if let Err(e) = self.replies.send_text(&request.chat_id, text).await {
            tracing::warn!(chat_id = %request.chat_id, error = %e, "failed to send reply");
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::ChatId,
        lifecycle::{LifecycleConfig, SessionLifecycle},
        ports::{SessionEstablisher, SessionHandle},
        ratelimit::{MemoryCounterStore, RateLimitConfig, TierLimit},
    };
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(ChatId, String)>>,
    }

    impl RecordingSink {
        fn texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }

        fn last(&self) -> Option<String> {
            self.texts().pop()
        }
    }

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn send_text(&self, chat_id: &ChatId, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.clone(), text.to_string()));
            Ok(())
        }
    }

    fn msg(sender: i64, text: &str) -> InboundMessage {
        InboundMessage {
            chat_id: ChatId::from(sender),
            sender_id: SenderId::from(sender),
            sender_name: None,
            text: text.to_string(),
        }
    }

    fn echo() -> CommandEntry {
        CommandEntry::new(
            "echo",
            handler_fn(|ctx: CommandContext| async move {
                ctx.reply(&ctx.request.args_text()).await?;
                Ok(())
            }),
        )
    }

    fn dispatcher(
        registry: CommandRegistry,
        rate: RateLimitConfig,
    ) -> (Dispatcher, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let limiter = RateLimiter::new(rate, Arc::new(MemoryCounterStore::new()));
        let d = Dispatcher::new(
            DispatchConfig::default(),
            Arc::new(RegistryHandle::new(registry)),
            limiter,
            sink.clone(),
        );
        (d, sink)
    }

    #[tokio::test]
    async fn executes_resolved_command() {
        let reg = CommandRegistry::builder().register(echo().alias("say")).build();
        let (d, sink) = dispatcher(reg, RateLimitConfig::default());

        let out = d.dispatch(msg(1, "!SAY hello world")).await;
        assert!(matches!(out, DispatchOutcome::Executed { ref command, .. } if command == "echo"));
        assert_eq!(sink.last().as_deref(), Some("hello world"));
        assert_eq!(d.stats().usage["echo"].invocations, 1);
    }

    #[tokio::test]
    async fn failing_handlers_do_not_stop_later_messages() {
        let reg = CommandRegistry::builder()
            .register(CommandEntry::new(
                "boom",
                handler_fn(|_ctx| async { anyhow::bail!("database unavailable") }),
            ))
            .register(CommandEntry::new(
                "crash",
                handler_fn(|_ctx| async { panic!("handler bug") }),
            ))
            .register(echo())
            .build();
        let (d, sink) = dispatcher(reg, RateLimitConfig::default());

        let out = d.dispatch(msg(1, "/boom")).await;
        match out {
            DispatchOutcome::Failed { command, error } => {
                assert_eq!(command, "boom");
                assert!(error.contains("database unavailable"), "{error}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(sink.last().as_deref(), Some(GENERIC_FAILURE_REPLY));

        let out = d.dispatch(msg(1, "/crash")).await;
        match out {
            DispatchOutcome::Failed { error, .. } => assert!(error.contains("handler bug"), "{error}"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let out = d.dispatch(msg(1, "/echo still alive")).await;
        assert!(matches!(out, DispatchOutcome::Executed { .. }));
        assert_eq!(sink.last().as_deref(), Some("still alive"));

        let stats = d.stats();
        assert_eq!(stats.usage["boom"].failures, 1);
        assert_eq!(stats.usage["crash"].failures, 1);
        assert_eq!(stats.usage["echo"].failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let reg = CommandRegistry::builder()
            .register(CommandEntry::new(
                "slow",
                handler_fn(|_ctx| async {
                    tokio::time::sleep(Duration::from_secs(120)).await;
                    Ok(())
                }),
            ))
            .build();
        let (d, sink) = dispatcher(reg, RateLimitConfig::default());

        let out = d.dispatch(msg(1, ".slow")).await;
        match out {
            DispatchOutcome::Failed { error, .. } => assert!(error.contains("timed out"), "{error}"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(sink.last().as_deref(), Some(GENERIC_FAILURE_REPLY));
    }

    #[tokio::test]
    async fn unknown_command_gets_suggestion() {
        let reg = CommandRegistry::builder()
            .register(CommandEntry::new("feather", handler_fn(|_| async { Ok(()) })))
            .register(CommandEntry::new("weather", handler_fn(|_| async { Ok(()) })))
            .build();
        let (d, sink) = dispatcher(reg, RateLimitConfig::default());

        let out = d.dispatch(msg(1, "!weathr jakarta")).await;
        assert_eq!(
            out,
            DispatchOutcome::Unknown {
                name: "weathr".to_string(),
                suggestion: Some("weather".to_string()),
            }
        );
        assert_eq!(
            sink.last().as_deref(),
            Some("Command \"weathr\" not found. Did you mean:\n• weather\n• feather")
        );

        let out = d.dispatch(msg(1, "!xyzzy")).await;
        assert!(matches!(out, DispatchOutcome::Unknown { suggestion: None, .. }));
        assert_eq!(
            sink.last().as_deref(),
            Some("Command \"xyzzy\" not found. Type !help for available commands.")
        );
    }

    struct Trace {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        reject: bool,
    }

    #[async_trait]
    impl Middleware for Trace {
        async fn check(&self, _req: &DispatchRequest, _cmd: &CommandEntry) -> MiddlewareOutcome {
            self.log.lock().unwrap().push(self.label);
            if self.reject {
                MiddlewareOutcome::Reject(format!("blocked by {}", self.label))
            } else {
                MiddlewareOutcome::Continue
            }
        }
    }

    #[tokio::test]
    async fn middleware_runs_global_first_and_can_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_handler = ran.clone();

        let reg = CommandRegistry::builder()
            .register(
                CommandEntry::new(
                    "guarded",
                    handler_fn(move |_| {
                        let ran = ran_in_handler.clone();
                        async move {
                            ran.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
                .middleware(Trace {
                    label: "command",
                    log: log.clone(),
                    reject: true,
                }),
            )
            .build();
        let (d, sink) = dispatcher(reg, RateLimitConfig::default());
        let d = d
            .with_middleware(Trace {
                label: "global-1",
                log: log.clone(),
                reject: false,
            })
            .with_middleware(Trace {
                label: "global-2",
                log: log.clone(),
                reject: false,
            });

        let out = d.dispatch(msg(5, "#guarded")).await;
        assert_eq!(
            out,
            DispatchOutcome::Rejected {
                command: "guarded".to_string(),
                reason: "blocked by command".to_string(),
            }
        );
        assert_eq!(*log.lock().unwrap(), vec!["global-1", "global-2", "command"]);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(sink.last().as_deref(), Some("blocked by command"));
        assert_eq!(d.stats().usage["guarded"].rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_command_gets_retry_message() {
        let rate = RateLimitConfig::default().with_tier(RateLimitTier::Command, TierLimit::fixed(2, 60));
        let reg = CommandRegistry::builder().register(echo()).build();
        let (d, sink) = dispatcher(reg, rate);

        for _ in 0..2 {
            assert!(matches!(
                d.dispatch(msg(9, "/echo hi")).await,
                DispatchOutcome::Executed { .. }
            ));
        }
        tokio::time::advance(Duration::from_millis(10_500)).await;

        let out = d.dispatch(msg(9, "/echo hi")).await;
        match out {
            DispatchOutcome::RateLimited {
                tier, retry_after, ..
            } => {
                assert_eq!(tier, RateLimitTier::Command);
                assert_eq!(retry_after, Duration::from_millis(49_500));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            sink.last().as_deref(),
            Some("⏰ Rate limit exceeded. Try again in 50s")
        );

        // Another sender has its own command budget.
        assert!(matches!(
            d.dispatch(msg(10, "/echo hi")).await,
            DispatchOutcome::Executed { .. }
        ));
    }

    #[tokio::test]
    async fn disabled_command_is_not_executed() {
        let reg = CommandRegistry::builder().register(echo().disabled()).build();
        let (d, sink) = dispatcher(reg, RateLimitConfig::default());

        let out = d.dispatch(msg(1, "/echo hi")).await;
        assert_eq!(
            out,
            DispatchOutcome::Disabled {
                command: "echo".to_string()
            }
        );
        assert_eq!(sink.texts().len(), 1);
        assert!(d.stats().usage.get("echo").is_none());
    }

    struct CountingFallback(Arc<AtomicUsize>);

    #[async_trait]
    impl FallbackHandler for CountingFallback {
        async fn handle(
            &self,
            message: InboundMessage,
            replies: Arc<dyn ReplySink>,
        ) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            replies.send_text(&message.chat_id, "chatting").await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn each_message_takes_exactly_one_path() {
        let reg = CommandRegistry::builder().register(echo()).build();

        let (d, _) = dispatcher(CommandRegistry::default(), RateLimitConfig::default());
        assert_eq!(d.dispatch(msg(1, "how are you")).await, DispatchOutcome::Ignored);

        let hits = Arc::new(AtomicUsize::new(0));
        let (d, sink) = dispatcher(reg, RateLimitConfig::default());
        let d = d.with_fallback(CountingFallback(hits.clone()));

        assert_eq!(d.dispatch(msg(1, "how are you")).await, DispatchOutcome::Fallback);
        assert!(matches!(
            d.dispatch(msg(1, "/echo x")).await,
            DispatchOutcome::Executed { .. }
        ));
        assert!(matches!(
            d.dispatch(msg(1, "/nope")).await,
            DispatchOutcome::Unknown { .. }
        ));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sink.texts().iter().filter(|t| *t == "chatting").count(), 1);
    }

    #[tokio::test]
    async fn premium_identity_uses_its_own_tier() {
        let rate = RateLimitConfig::default()
            .with_tier(RateLimitTier::User, TierLimit::fixed(1, 60))
            .with_tier(RateLimitTier::Premium, TierLimit::fixed(5, 60));
        let reg = CommandRegistry::builder().register(echo()).build();
        let (d, _) = dispatcher(reg, rate);
        let d = d.with_identity_tier(|s: &SenderId| {
            if s.0 == "1" {
                RateLimitTier::Premium
            } else {
                RateLimitTier::User
            }
        });

        assert!(matches!(d.dispatch(msg(2, "/echo a")).await, DispatchOutcome::Executed { .. }));
        assert!(matches!(
            d.dispatch(msg(2, "/echo a")).await,
            DispatchOutcome::RateLimited { tier: RateLimitTier::User, .. }
        ));
        for _ in 0..3 {
            assert!(matches!(d.dispatch(msg(1, "/echo a")).await, DispatchOutcome::Executed { .. }));
        }
    }

    #[tokio::test]
    async fn stats_count_commands_aliases_and_categories() {
        let reg = CommandRegistry::builder()
            .register(echo().alias("say").category("tools"))
            .register(CommandEntry::new("ping", handler_fn(|_| async { Ok(()) })).category("main"))
            .register(CommandEntry::new("menu", handler_fn(|_| async { Ok(()) })).category("main"))
            .build();
        let (d, _) = dispatcher(reg, RateLimitConfig::default());

        let stats = d.stats();
        assert_eq!(stats.commands, 3);
        assert_eq!(stats.aliases, 1);
        assert_eq!(stats.categories["main"], 2);
        assert_eq!(stats.categories["tools"], 1);
    }

    struct Session;

    #[async_trait]
    impl SessionHandle for Session {
        async fn teardown(&self) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysUp;

    #[async_trait]
    impl SessionEstablisher for AlwaysUp {
        type Session = Session;

        async fn establish(&self) -> std::result::Result<Session, TransportError> {
            Ok(Session)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_delegated_to_the_supervisor() {
        let (d, _) = dispatcher(CommandRegistry::default(), RateLimitConfig::default());
        assert!(d
            .report_transport_failure(TransportError::transient("x"))
            .await
            .is_err());

        let lifecycle = Arc::new(SessionLifecycle::new(LifecycleConfig::default(), AlwaysUp));
        lifecycle.start().await.unwrap();
        let (d, _) = dispatcher(CommandRegistry::default(), RateLimitConfig::default());
        let d = d.with_supervisor(lifecycle.clone());

        let outcome = d
            .report_transport_failure(TransportError::transient("socket closed"))
            .await
            .unwrap();
        assert_eq!(outcome, RecoveryOutcome::Recovered { attempts: 1 });
        assert_eq!(lifecycle.status().await.total_successful_recoveries, 1);
    }
}
