use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::registry::CommandRegistry;

/// Per-command usage counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommandUsage {
    pub invocations: u64,
    pub failures: u64,
    pub rejected: u64,
    pub rate_limited: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DispatcherStats {
    pub commands: usize,
    pub aliases: usize,
    pub categories: BTreeMap<String, usize>,
    pub usage: BTreeMap<String, CommandUsage>,
}

impl DispatcherStats {
    pub fn collect(registry: &CommandRegistry, usage: &UsageTracker) -> Self {
        Self {
            commands: registry.command_count(),
            aliases: registry.alias_count(),
            categories: registry.categories(),
            usage: usage.snapshot(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum UsageEvent {
    Invoked,
    Failed,
    Rejected,
    RateLimited,
}

/// Analytics sink shared by the dispatcher and handler contexts.
#[derive(Debug, Default)]
pub struct UsageTracker {
    inner: Mutex<HashMap<String, CommandUsage>>,
}

impl UsageTracker {
    pub(crate) fn record(&self, command: &str, event: UsageEvent) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = map.entry(command.to_string()).or_default();
        match event {
            UsageEvent::Invoked => {
                entry.invocations += 1;
                entry.last_used_at = Some(Utc::now());
            }
            UsageEvent::Failed => entry.failures += 1,
            UsageEvent::Rejected => entry.rejected += 1,
            UsageEvent::RateLimited => entry.rate_limited += 1,
        }
    }

    pub fn get(&self, command: &str) -> Option<CommandUsage> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(command)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CommandUsage> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
