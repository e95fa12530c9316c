use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;

use crate::{
    lifecycle::TransportSupervisor,
    ports::ReplySink,
    ratelimit::RateLimitTier,
};

use super::{
    parser::DispatchRequest,
    stats::{DispatcherStats, UsageTracker},
};

pub const DEFAULT_CATEGORY: &str = "general";

/// Everything a handler can see while running one command.
#[derive(Clone)]
pub struct CommandContext {
    pub request: DispatchRequest,
    pub command: Arc<CommandEntry>,
    pub registry: Arc<CommandRegistry>,
    pub replies: Arc<dyn ReplySink>,
    pub usage: Arc<UsageTracker>,
    pub supervisor: Option<Arc<dyn TransportSupervisor>>,
}

impl CommandContext {
    pub async fn reply(&self, text: &str) -> crate::Result<()> {
        self.replies.send_text(&self.request.chat_id, text).await
    }

    pub fn args(&self) -> &[String] {
        &self.request.args
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats::collect(&self.registry, &self.usage)
    }
}

/// Body of a command. Errors are opaque; the dispatcher logs them and sends
/// one generic reply.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`CommandHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> CommandHandler for HandlerFn<F>
where
    F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MiddlewareOutcome {
    Continue,
    /// Stop the pipeline and send this message to the user.
    Reject(String),
}

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn check(&self, request: &DispatchRequest, command: &CommandEntry) -> MiddlewareOutcome;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// One registered command.
pub struct CommandEntry {
    pub name: String,
    pub aliases: Vec<String>,
    pub category: String,
    pub description: String,
    pub usage: String,
    pub rate_limit_tier: RateLimitTier,
    pub enabled: bool,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub handler: Arc<dyn CommandHandler>,
}

impl CommandEntry {
    pub fn new(name: impl Into<String>, handler: impl CommandHandler) -> Self {
        let name = name.into().to_lowercase();
        Self {
            usage: name.clone(),
            name,
            aliases: Vec::new(),
            category: DEFAULT_CATEGORY.to_string(),
            description: "No description".to_string(),
            rate_limit_tier: RateLimitTier::Command,
            enabled: true,
            middleware: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into().to_lowercase());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    pub fn tier(mut self, tier: RateLimitTier) -> Self {
        self.rate_limit_tier = tier;
        self
    }

    pub fn middleware(mut self, m: impl Middleware) -> Self {
        self.middleware.push(Arc::new(m));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("category", &self.category)
            .field("rate_limit_tier", &self.rate_limit_tier)
            .field("enabled", &self.enabled)
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Primary(usize),
    Alias(usize),
}

impl Slot {
    fn index(self) -> usize {
        match self {
            Slot::Primary(i) | Slot::Alias(i) => i,
        }
    }
}

/// Collects commands at load time. Names and aliases share one namespace;
/// a collision is logged and the later registration wins.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<Arc<CommandEntry>>,
    index: HashMap<String, Slot>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, entry: CommandEntry) -> Self {
        self.add(entry);
        self
    }

    pub fn add(&mut self, entry: CommandEntry) {
        let idx = self.entries.len();

        self.claim(&entry.name, Slot::Primary(idx), &entry.name);
        for alias in &entry.aliases {
            if alias == &entry.name {
                continue;
            }
            self.claim(alias, Slot::Alias(idx), &entry.name);
        }

        tracing::debug!(
            command = %entry.name,
            category = %entry.category,
            aliases = entry.aliases.len(),
            "command registered"
        );
        self.entries.push(Arc::new(entry));
    }

    fn claim(&mut self, key: &str, slot: Slot, owner: &str) {
        if let Some(prev) = self.index.insert(key.to_string(), slot) {
            let prev_owner = self
                .entries
                .get(prev.index())
                .map_or(owner, |e| e.name.as_str());
            tracing::warn!(
                name = %key,
                previous = %prev_owner,
                replacement = %owner,
                "command name collision; later registration wins"
            );
        }
    }

    pub fn build(self) -> CommandRegistry {
        CommandRegistry {
            entries: self.entries,
            index: self.index,
        }
    }
}

pub enum Resolution {
    Found(Arc<CommandEntry>),
    NotFound { suggestions: Vec<String> },
}

/// Immutable registry snapshot. Reloads build a new one.
#[derive(Default)]
pub struct CommandRegistry {
    entries: Vec<Arc<CommandEntry>>,
    index: HashMap<String, Slot>,
}

impl CommandRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CommandEntry>> {
        self.index
            .get(name)
            .map(|slot| self.entries[slot.index()].clone())
    }

    /// Exact lookup, then fuzzy suggestions within `max_distance`.
    pub fn resolve(&self, name: &str, max_distance: usize) -> Resolution {
        match self.get(name) {
            Some(entry) => Resolution::Found(entry),
            None => Resolution::NotFound {
                suggestions: self.suggest(name, max_distance),
            },
        }
    }

    /// Primary names within `max_distance` edits, closest first; equal
    /// distances keep registration order.
    pub fn suggest(&self, input: &str, max_distance: usize) -> Vec<String> {
        let mut scored: Vec<(usize, &str)> = self
            .commands()
            .filter_map(|e| {
                levenshtein_within(input, &e.name, max_distance).map(|d| (d, e.name.as_str()))
            })
            .collect();
        // Stable sort keeps insertion order among ties.
        scored.sort_by_key(|(d, _)| *d);
        scored.into_iter().map(|(_, n)| n.to_string()).collect()
    }

    /// Live commands (those still owning their primary name), in
    /// registration order.
    pub fn commands(&self) -> impl Iterator<Item = &Arc<CommandEntry>> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(i, e)| self.index.get(&e.name) == Some(&Slot::Primary(*i)))
            .map(|(_, e)| e)
    }

    pub fn command_count(&self) -> usize {
        self.commands().count()
    }

    pub fn alias_count(&self) -> usize {
        self.index
            .values()
            .filter(|s| matches!(s, Slot::Alias(_)))
            .count()
    }

    pub fn categories(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for e in self.commands() {
            *out.entry(e.category.clone()).or_insert(0) += 1;
        }
        out
    }

    pub fn is_alias(&self, name: &str) -> bool {
        matches!(self.index.get(name), Some(Slot::Alias(_)))
    }
}

/// Shared, swappable pointer to the current registry snapshot.
#[derive(Default)]
pub struct RegistryHandle {
    current: RwLock<Arc<CommandRegistry>>,
}

impl RegistryHandle {
    pub fn new(registry: CommandRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    pub fn snapshot(&self) -> Arc<CommandRegistry> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the registry. In-flight dispatches keep their old snapshot.
    pub fn swap(&self, registry: CommandRegistry) -> Arc<CommandRegistry> {
        let next = Arc::new(registry);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let prev = std::mem::replace(&mut *guard, next);
        tracing::info!(
            commands = guard.command_count(),
            aliases = guard.alias_count(),
            "command registry reloaded"
        );
        prev
    }
}

/// Edit distance between `a` and `b` if it is at most `max`.
pub fn levenshtein_within(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return None;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        let mut row_min = cur[0];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
            row_min = row_min.min(cur[j + 1]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut cur);
    }

    let d = prev[b.len()];
    (d <= max).then_some(d)
}
