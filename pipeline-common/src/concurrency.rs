//! Per-queue-key concurrency limits, shared by the dispatcher (which sizes
//! its spawn plan against them) and the worker (which acquires a slot lease
//! against the same limit before claiming a job).

use std::collections::HashMap;
use std::str::FromStr;

/// `queue_key=limit` overrides of the default concurrency limit, parsed from
/// a single comma-separated env var so both binaries read one format.
#[derive(Debug, Clone, Default)]
pub struct QueueConcurrencyOverrides(pub HashMap<String, i32>);

impl QueueConcurrencyOverrides {
    /// The concurrency limit for `queue_key`: its override if one is set,
    /// otherwise `default_limit`.
    pub fn resolve(&self, queue_key: &str, default_limit: i32) -> i32 {
        self.0.get(queue_key).copied().unwrap_or(default_limit)
    }

    /// Round-trip back to the `key=limit,...` form `FromStr` parses, so a
    /// process holding a resolved `Config` can forward it to a child's
    /// environment verbatim.
    pub fn to_env_string(&self) -> String {
        let mut entries: Vec<String> = self.0.iter().map(|(key, limit)| format!("{key}={limit}")).collect();
        entries.sort();
        entries.join(",")
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseOverridesError(String);

impl std::fmt::Display for ParseOverridesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseOverridesError {}

impl FromStr for QueueConcurrencyOverrides {
    type Err = ParseOverridesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = HashMap::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, limit) = entry
                .split_once('=')
                .ok_or_else(|| ParseOverridesError(format!("malformed override {entry:?}, expected key=limit")))?;
            let limit = limit
                .parse::<i32>()
                .map_err(|_| ParseOverridesError(format!("malformed limit in override {entry:?}")))?;
            map.insert(key.to_owned(), limit);
        }
        Ok(QueueConcurrencyOverrides(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_override_before_default() {
        let overrides: QueueConcurrencyOverrides = "anthropic/claude-3-5-sonnet=2,openai/gpt-4o=8".parse().unwrap();
        assert_eq!(overrides.resolve("anthropic/claude-3-5-sonnet", 4), 2);
        assert_eq!(overrides.resolve("openai/gpt-4o", 4), 8);
        assert_eq!(overrides.resolve("default", 4), 4);
    }

    #[test]
    fn empty_string_parses_to_no_overrides() {
        let overrides: QueueConcurrencyOverrides = "".parse().unwrap();
        assert_eq!(overrides.resolve("default", 4), 4);
    }

    #[test]
    fn malformed_entry_is_rejected() {
        assert!("no-equals-sign".parse::<QueueConcurrencyOverrides>().is_err());
        assert!("key=not-a-number".parse::<QueueConcurrencyOverrides>().is_err());
    }
}
