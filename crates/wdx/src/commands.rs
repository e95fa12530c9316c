//! Built-in commands shipped with the bot.

use std::{collections::HashSet, fmt::Write as _, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use wdx_core::{
    dispatch::{
        handler_fn, CommandContext, CommandEntry, CommandRegistry, DispatchRequest, Middleware,
        MiddlewareOutcome, RegistryBuilder,
    },
    domain::SenderId,
    lifecycle::SessionStatus,
    ratelimit::{RateLimitTier, RateLimiter},
};

pub const OWNER_ONLY_REPLY: &str = "🔒 This command is restricted to the bot owner.";

/// Rejects everyone not listed in `OWNER_IDS`.
pub struct OwnerOnly {
    owners: Arc<HashSet<String>>,
}

impl OwnerOnly {
    pub fn new(owners: Arc<HashSet<String>>) -> Self {
        Self { owners }
    }
}

#[async_trait]
impl Middleware for OwnerOnly {
    async fn check(&self, request: &DispatchRequest, _command: &CommandEntry) -> MiddlewareOutcome {
        if self.owners.contains(&request.sender_id.0) {
            MiddlewareOutcome::Continue
        } else {
            MiddlewareOutcome::Reject(OWNER_ONLY_REPLY.to_string())
        }
    }
}

/// Owners get the premium rate-limit tier.
pub fn identity_tier(owners: Arc<HashSet<String>>) -> impl Fn(&SenderId) -> RateLimitTier + Send + Sync {
    move |sender| {
        if owners.contains(&sender.0) {
            RateLimitTier::Premium
        } else {
            RateLimitTier::User
        }
    }
}

pub fn registry(limiter: RateLimiter, owners: Arc<HashSet<String>>) -> CommandRegistry {
    builtins(CommandRegistry::builder(), limiter, owners).build()
}

pub fn builtins(
    builder: RegistryBuilder,
    limiter: RateLimiter,
    owners: Arc<HashSet<String>>,
) -> RegistryBuilder {
    let limits_limiter = limiter.clone();
    let limits_owners = owners.clone();

    builder
        .register(
            CommandEntry::new("help", handler_fn(help))
                .alias("menu")
                .category("main")
                .description("List commands, or show details for one")
                .usage("help [command]"),
        )
        .register(
            CommandEntry::new(
                "ping",
                handler_fn(|ctx: CommandContext| async move {
                    ctx.reply("🏓 Pong!").await?;
                    Ok(())
                }),
            )
            .category("main")
            .description("Check that the bot is responsive"),
        )
        .register(
            CommandEntry::new(
                "limits",
                handler_fn(move |ctx: CommandContext| {
                    let limiter = limits_limiter.clone();
                    let owners = limits_owners.clone();
                    async move {
                        let sender = ctx.request.sender_id.clone();
                        let tier = identity_tier(owners)(&sender);
                        let status = limiter.status(&sender, tier).await?;
                        let mut out = format!("📊 Rate limits ({} tier)\n", status.identity_tier);
                        for t in &status.tiers {
                            let _ = writeln!(
                                out,
                                "• {}: {}/{} (resets in {})",
                                t.tier,
                                t.current,
                                t.limit,
                                format_duration(t.reset_in)
                            );
                        }
                        ctx.reply(out.trim_end()).await?;
                        Ok(())
                    }
                }),
            )
            .category("main")
            .description("Show your current rate-limit usage"),
        )
        .register(
            CommandEntry::new("status", handler_fn(status))
                .category("owner")
                .description("Transport and dispatcher health")
                .usage("status [json]")
                .middleware(OwnerOnly::new(owners.clone())),
        )
        .register(
            CommandEntry::new(
                "resetlimits",
                handler_fn(move |ctx: CommandContext| {
                    let limiter = limiter.clone();
                    async move {
                        let Some(target) = ctx.args().first() else {
                            ctx.reply("Usage: resetlimits <sender id>").await?;
                            return Ok(());
                        };
                        let removed = limiter.reset_identity(&SenderId(target.clone())).await?;
                        ctx.reply(&format!("✅ Cleared {removed} rate-limit counters for {target}"))
                            .await?;
                        Ok(())
                    }
                }),
            )
            .category("owner")
            .description("Clear every rate-limit counter of a sender")
            .usage("resetlimits <sender id>")
            .middleware(OwnerOnly::new(owners)),
        )
}

async fn help(ctx: CommandContext) -> anyhow::Result<()> {
    let prefix = ctx.request.prefix;

    if let Some(name) = ctx.args().first() {
        let Some(entry) = ctx.registry.get(&name.to_lowercase()) else {
            ctx.reply(&format!("Command \"{name}\" not found.")).await?;
            return Ok(());
        };
        let mut out = format!(
            "ℹ️ {prefix}{}\n{}\nUsage: {prefix}{}",
            entry.name, entry.description, entry.usage
        );
        if !entry.aliases.is_empty() {
            let _ = write!(out, "\nAliases: {}", entry.aliases.join(", "));
        }
        ctx.reply(&out).await?;
        return Ok(());
    }

    let mut out = String::from("📖 Available commands");
    for category in ctx.registry.categories().keys() {
        let _ = write!(out, "\n\n[{category}]");
        for entry in ctx
            .registry
            .commands()
            .filter(|e| &e.category == category && e.enabled)
        {
            let _ = write!(out, "\n• {prefix}{} - {}", entry.name, entry.description);
        }
    }
    let _ = write!(out, "\n\nType {prefix}help <command> for details.");
    ctx.reply(&out).await?;
    Ok(())
}

async fn status(ctx: CommandContext) -> anyhow::Result<()> {
    let session = match &ctx.supervisor {
        Some(s) => Some(s.status().await),
        None => None,
    };
    let stats = ctx.stats();

    if ctx.args().first().map(String::as_str) == Some("json") {
        let body = serde_json::json!({ "session": session, "dispatcher": stats });
        ctx.reply(&serde_json::to_string_pretty(&body)?).await?;
        return Ok(());
    }

    let mut out = String::from("🤖 Status\n");
    match &session {
        Some(s) => render_session(&mut out, s),
        None => out.push_str("\nTransport: not supervised"),
    }
    let _ = write!(
        out,
        "\n\nCommands: {} ({} aliases)\nInvocations: {}",
        stats.commands,
        stats.aliases,
        stats.usage.values().map(|u| u.invocations).sum::<u64>()
    );
    ctx.reply(&out).await?;
    Ok(())
}

fn render_session(out: &mut String, s: &SessionStatus) {
    let _ = write!(
        out,
        "\nTransport: {:?}\nLast success: {}\nRetries: {}/{}\nCircuit: {}\nRecoveries: {} (avg {})",
        s.phase,
        format_timestamp(s.last_success_at),
        s.attempt_count,
        s.max_retries,
        if s.circuit_open { "open" } else { "closed" },
        s.total_successful_recoveries,
        format_duration(s.average_recovery_time),
    );
    if let Some(err) = &s.last_error {
        let _ = write!(out, "\nLast error: {err}");
    }
    if let Some(next) = s.next_retry_in {
        let _ = write!(out, "\nNext retry in: {}", format_duration(next));
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    let ago = Utc::now().signed_duration_since(at).num_seconds();
    format!(
        "{} ({} ago)",
        at.format("%Y-%m-%d %H:%M:%S UTC"),
        format_duration(Duration::from_secs(ago.max(0) as u64))
    )
}

fn format_duration(d: Duration) -> String {
    let seconds = d.as_secs();
    let hours = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        return format!("{hours}h {mins}m {secs}s");
    }
    if mins > 0 {
        return format!("{mins}m {secs}s");
    }
    format!("{secs}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wdx_core::{
        dispatch::{DispatchConfig, DispatchOutcome, Dispatcher, RegistryHandle},
        domain::{ChatId, InboundMessage},
        ports::ReplySink,
        ratelimit::{MemoryCounterStore, RateLimitConfig},
    };

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn last(&self) -> String {
            self.sent.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn send_text(&self, _chat_id: &ChatId, text: &str) -> wdx_core::Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    const OWNER: i64 = 1;

    fn setup() -> (Dispatcher, Arc<RecordingSink>) {
        let owners: Arc<HashSet<String>> = Arc::new([OWNER.to_string()].into_iter().collect());
        let limiter = RateLimiter::new(RateLimitConfig::default(), Arc::new(MemoryCounterStore::new()));
        let sink = Arc::new(RecordingSink::default());
        let d = Dispatcher::new(
            DispatchConfig::default(),
            Arc::new(RegistryHandle::new(registry(limiter.clone(), owners.clone()))),
            limiter,
            sink.clone(),
        )
        .with_identity_tier(identity_tier(owners));
        (d, sink)
    }

    fn msg(sender: i64, text: &str) -> InboundMessage {
        InboundMessage {
            chat_id: ChatId::from(sender),
            sender_id: SenderId::from(sender),
            sender_name: None,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn help_lists_commands_by_category() {
        let (d, sink) = setup();
        d.dispatch(msg(5, ".menu")).await;

        let text = sink.last();
        assert!(text.starts_with("📖 Available commands"), "{text}");
        assert!(text.contains("[main]"));
        assert!(text.contains("• .ping - Check that the bot is responsive"));
        assert!(text.contains("[owner]"));
        assert!(text.ends_with("Type .help <command> for details."));

        d.dispatch(msg(5, "/help help")).await;
        let text = sink.last();
        assert!(text.contains("Usage: /help [command]"), "{text}");
        assert!(text.contains("Aliases: menu"));
    }

    #[tokio::test]
    async fn ping_replies() {
        let (d, sink) = setup();
        assert!(matches!(
            d.dispatch(msg(5, "!ping")).await,
            DispatchOutcome::Executed { .. }
        ));
        assert_eq!(sink.last(), "🏓 Pong!");
    }

    #[tokio::test]
    async fn owner_commands_reject_other_senders() {
        let (d, sink) = setup();

        let out = d.dispatch(msg(5, "/status")).await;
        assert!(matches!(out, DispatchOutcome::Rejected { .. }));
        assert_eq!(sink.last(), OWNER_ONLY_REPLY);

        let out = d.dispatch(msg(OWNER, "/status")).await;
        assert!(matches!(out, DispatchOutcome::Executed { .. }));
        let text = sink.last();
        assert!(text.contains("Transport: not supervised"), "{text}");
        assert!(text.contains("Commands: 5 (1 aliases)"), "{text}");
    }

    #[tokio::test]
    async fn status_json_is_valid() {
        let (d, sink) = setup();
        d.dispatch(msg(OWNER, "/status json")).await;

        let v: serde_json::Value = serde_json::from_str(&sink.last()).unwrap();
        assert!(v["session"].is_null());
        assert_eq!(v["dispatcher"]["commands"], 5);
        assert_eq!(v["dispatcher"]["categories"]["owner"], 2);
    }

    #[tokio::test]
    async fn limits_and_reset_cover_the_sender() {
        let (d, sink) = setup();
        d.dispatch(msg(5, "/ping")).await;
        d.dispatch(msg(5, "/limits")).await;

        let text = sink.last();
        assert!(text.starts_with("📊 Rate limits (user tier)"), "{text}");
        assert!(text.contains("• user: 2/30"), "{text}");

        d.dispatch(msg(OWNER, "/resetlimits 5")).await;
        assert!(sink.last().starts_with("✅ Cleared"), "{}", sink.last());

        d.dispatch(msg(5, "/limits")).await;
        assert!(sink.last().contains("• user: 1/30"), "{}", sink.last());
    }

    #[test]
    fn durations_are_compact() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1h 2m 5s");
    }
}
