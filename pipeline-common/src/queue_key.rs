//! Canonical queue-key computation.
//!
//! The queue key is the single routing concept the core understands: it is
//! both the `jobq.entrypoint` value and the `slots.queue_key` value. Provider
//! is a derived label for reporting only — nothing here re-derives a routing
//! decision from provider, on purpose (see design notes on why the old
//! provider-bucket dispatch was dropped).

const PROVIDER_ALIASES: &[&str] = &["openai", "anthropic", "claude", "google", "gemini", "default"];

const MODEL_PREFIXES: &[(&str, &str)] = &[
    ("claude", "anthropic"),
    ("gpt", "openai"),
    ("o1", "openai"),
    ("o3", "openai"),
    ("gemini", "google"),
];

/// Agents that never call out to a real provider; their queue key collapses
/// to the literal `default` regardless of whatever model string accompanies
/// them.
const DETERMINISTIC_AGENTS: &[&str] = &["nop", "oracle"];

/// Canonicalize a raw queue key string: lowercase, trim, collapse internal
/// whitespace to single underscores, then resolve provider-only aliases and
/// bare model names. Idempotent: `normalize_queue_key(normalize_queue_key(s))
/// == normalize_queue_key(s)`.
pub fn normalize_queue_key(raw: &str) -> String {
    let collapsed = collapse_whitespace(raw.trim().to_lowercase());

    if collapsed.is_empty() {
        return "default".to_owned();
    }

    if PROVIDER_ALIASES.contains(&collapsed.as_str()) {
        return "default".to_owned();
    }

    if let Some((_, model)) = collapsed.split_once('/') {
        // Already has a provider segment; re-collapse the model half so a
        // second pass is a no-op, but otherwise pass the pair through.
        let _ = model;
        return collapsed;
    }

    let provider = infer_provider(&collapsed).unwrap_or("default");
    format!("{provider}/{collapsed}")
}

/// Resolve the queue key for a trial given its agent and model. Deterministic
/// agents (nop, oracle) always resolve to `default` since they never
/// exercise a real provider's concurrency budget.
pub fn trial_queue_key(agent: &str, model: &str) -> String {
    let agent_lower = agent.trim().to_lowercase();
    if DETERMINISTIC_AGENTS.contains(&agent_lower.as_str()) {
        return "default".to_owned();
    }
    normalize_queue_key(model)
}

fn infer_provider(model: &str) -> Option<&'static str> {
    MODEL_PREFIXES
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, provider)| *provider)
}

fn collapse_whitespace(s: String) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !last_was_space && !out.is_empty() {
                out.push('_');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out.trim_end_matches('_').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_provider_aliases_collapse_to_default() {
        for alias in PROVIDER_ALIASES {
            assert_eq!(normalize_queue_key(alias), "default");
        }
        assert_eq!(normalize_queue_key("  Claude  "), "default");
    }

    #[test]
    fn bare_model_gets_inferred_provider() {
        assert_eq!(
            normalize_queue_key("claude-3-5-sonnet"),
            "anthropic/claude-3-5-sonnet"
        );
        assert_eq!(normalize_queue_key("gpt-4o"), "openai/gpt-4o");
        assert_eq!(normalize_queue_key("gemini-1.5-pro"), "google/gemini-1.5-pro");
        assert_eq!(normalize_queue_key("some-weird-model"), "default/some-weird-model");
    }

    #[test]
    fn explicit_provider_model_pairs_pass_through() {
        assert_eq!(
            normalize_queue_key("anthropic/claude-3-5-sonnet"),
            "anthropic/claude-3-5-sonnet"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        let samples = [
            "  Anthropic/Claude-3-5-Sonnet  ",
            "GPT-4o",
            "default",
            "nop",
            "",
        ];
        for s in samples {
            let once = normalize_queue_key(s);
            let twice = normalize_queue_key(&once);
            assert_eq!(once, twice, "not idempotent for {s:?}");
        }
    }

    #[test]
    fn deterministic_agents_force_default() {
        assert_eq!(trial_queue_key("nop", "claude-3-5-sonnet"), "default");
        assert_eq!(trial_queue_key("oracle", "gpt-4o"), "default");
        assert_eq!(
            trial_queue_key("codex", "claude-3-5-sonnet"),
            "anthropic/claude-3-5-sonnet"
        );
    }
}
