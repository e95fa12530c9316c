use std::{env, fs, path::Path, time::Duration};

use crate::{
    dispatch::DispatchConfig,
    errors::Error,
    lifecycle::LifecycleConfig,
    ratelimit::{RateLimitConfig, RateLimitTier, TierLimit},
    Result,
};

/// Typed process configuration.
///
/// Every sub-config has a `Default` matching the documented defaults; the
/// environment only overrides what it sets.
#[derive(Clone, Debug)]
pub struct Config {
    pub telegram_bot_token: String,
    /// Senders allowed to run owner-only commands. Empty means nobody.
    pub owner_ids: Vec<i64>,
    pub dispatch: DispatchConfig,
    pub lifecycle: LifecycleConfig,
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Load from the process environment, reading `.env` first if present.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(&get);

        let telegram_bot_token = env.str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        let owner_ids = parse_csv_i64(env.str("OWNER_IDS"));

        // Dispatch
        let mut dispatch = DispatchConfig::default();
        if let Some(raw) = env.str("COMMAND_PREFIXES") {
            let prefixes = parse_prefixes(&raw);
            if prefixes.is_empty() {
                return Err(Error::Config(format!(
                    "COMMAND_PREFIXES must contain at least one prefix character, got {raw:?}"
                )));
            }
            dispatch.prefixes = prefixes;
        }
        if let Some(ms) = env.u64("HANDLER_TIMEOUT_MS")? {
            dispatch.handler_timeout = Duration::from_millis(ms);
        }

        // Reconnection
        let mut lifecycle = LifecycleConfig::default();
        if let Some(n) = env.u32("RECONNECT_MAX_RETRIES")? {
            lifecycle.max_retries = n;
        }
        if let Some(ms) = env.u64("RECONNECT_BASE_DELAY_MS")? {
            lifecycle.base_delay = Duration::from_millis(ms);
        }
        if let Some(m) = env.f64("RECONNECT_MULTIPLIER")? {
            if !m.is_finite() || m < 1.0 {
                return Err(Error::Config(format!(
                    "RECONNECT_MULTIPLIER must be a finite number >= 1.0, got {m}"
                )));
            }
            lifecycle.multiplier = m;
        }
        if let Some(ms) = env.u64("RECONNECT_MAX_DELAY_MS")? {
            lifecycle.max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env.u32("CIRCUIT_THRESHOLD")? {
            lifecycle.circuit_threshold = n;
        }
        if let Some(ms) = env.u64("CIRCUIT_COOLDOWN_MS")? {
            lifecycle.circuit_cooldown = Duration::from_millis(ms);
        }
        if let Some(ms) = env.u64("CIRCUIT_MAX_WAIT_MS")? {
            lifecycle.max_circuit_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = env.u64("ESTABLISH_TIMEOUT_MS")? {
            lifecycle.establish_timeout = Duration::from_millis(ms);
        }
        if lifecycle.base_delay > lifecycle.max_delay {
            return Err(Error::Config(
                "RECONNECT_BASE_DELAY_MS must not exceed RECONNECT_MAX_DELAY_MS".to_string(),
            ));
        }

        // Rate limiting
        let mut rate_limit = RateLimitConfig::default();
        if let Some(enabled) = env.bool("RATE_LIMIT_ENABLED") {
            rate_limit.enabled = enabled;
        }
        for tier in RateLimitTier::ALL {
            let upper = tier.as_str().to_uppercase();
            let base = rate_limit.limit_for(tier);
            let requests = env
                .u32(&format!("RATE_LIMIT_{upper}_REQUESTS"))?
                .unwrap_or(base.requests);
            let window = env
                .u64(&format!("RATE_LIMIT_{upper}_WINDOW"))?
                .map(Duration::from_secs)
                .unwrap_or(base.window);
            if window.is_zero() {
                return Err(Error::Config(format!(
                    "RATE_LIMIT_{upper}_WINDOW must be at least one second"
                )));
            }
            rate_limit = rate_limit.with_tier(
                tier,
                TierLimit {
                    requests,
                    window,
                    strategy: base.strategy,
                },
            );
        }

        Ok(Self {
            telegram_bot_token,
            owner_ids,
            dispatch,
            lifecycle,
            rate_limit,
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn str(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.str(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw:?}")))
    }

    fn u64(&self, key: &str) -> Result<Option<u64>> {
        self.parsed(key)
    }

    fn u32(&self, key: &str) -> Result<Option<u32>> {
        self.parsed(key)
    }

    fn f64(&self, key: &str) -> Result<Option<f64>> {
        self.parsed(key)
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.str(key).map(|s| {
            matches!(
                s.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (k, v) in parse_dotenv(&contents) {
        if env::var_os(&k).is_some() {
            continue; // do not override existing env
        }
        env::set_var(k, v);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = &val[1..val.len() - 1];
        }
        out.push((key.to_string(), val.to_string()));
    }
    out
}

/// Accepts `"./!#"`, `". ! / #"` or `".,!,/,#"`.
fn parse_prefixes(raw: &str) -> Vec<char> {
    let mut out = Vec::new();
    for c in raw.chars().filter(|c| !c.is_whitespace() && *c != ',') {
        if !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::WindowStrategy;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn token_is_required() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("TELEGRAM_BOT_TOKEN"));
        assert!(load(&[("TELEGRAM_BOT_TOKEN", "   ")]).is_err());
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = load(&[("TELEGRAM_BOT_TOKEN", "123:abc")]).unwrap();
        assert_eq!(cfg.dispatch.prefixes, vec!['.', '!', '/', '#']);
        assert_eq!(cfg.dispatch.handler_timeout, Duration::from_secs(30));
        assert_eq!(cfg.lifecycle.max_retries, 10);
        assert_eq!(cfg.lifecycle.base_delay, Duration::from_secs(2));
        assert!(cfg.rate_limit.enabled);
        let ai = cfg.rate_limit.limit_for(RateLimitTier::Ai);
        assert_eq!(ai.requests, 5);
        assert_eq!(ai.window, Duration::from_secs(300));
        assert_eq!(ai.strategy, WindowStrategy::Sliding);
        assert!(cfg.owner_ids.is_empty());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = load(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("OWNER_IDS", "42, 7,,nope"),
            ("COMMAND_PREFIXES", "! /"),
            ("RECONNECT_MAX_RETRIES", "3"),
            ("RECONNECT_MULTIPLIER", "2"),
            ("RATE_LIMIT_ENABLED", "off"),
            ("RATE_LIMIT_COMMAND_REQUESTS", "4"),
            ("RATE_LIMIT_AI_WINDOW", "60"),
        ])
        .unwrap();

        assert_eq!(cfg.owner_ids, vec![42, 7]);
        assert_eq!(cfg.dispatch.prefixes, vec!['!', '/']);
        assert_eq!(cfg.lifecycle.max_retries, 3);
        assert_eq!(cfg.lifecycle.multiplier, 2.0);
        assert!(!cfg.rate_limit.enabled);
        assert_eq!(cfg.rate_limit.limit_for(RateLimitTier::Command).requests, 4);
        let ai = cfg.rate_limit.limit_for(RateLimitTier::Ai);
        assert_eq!(ai.window, Duration::from_secs(60));
        assert_eq!(ai.strategy, WindowStrategy::Sliding);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = load(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("RECONNECT_BASE_DELAY_MS", "soon"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("RECONNECT_BASE_DELAY_MS")));

        assert!(load(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("RECONNECT_MULTIPLIER", "0.5"),
        ])
        .is_err());
        assert!(load(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("RATE_LIMIT_USER_WINDOW", "0"),
        ])
        .is_err());
    }

    #[test]
    fn dotenv_lines_are_parsed() {
        let parsed = parse_dotenv(
            "# comment\n\nexport A=1\nB = \"two words\"\nC='x'\nbroken\n=nokey\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two words".to_string()),
                ("C".to_string(), "x".to_string()),
            ]
        );
    }
}
