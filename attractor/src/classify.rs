//! Failure classifier: any failure becomes a (class, signature) pair.
//!
//! The class decides retry-gate behavior; the signature is a short stable
//! string the loop-restart circuit breaker counts recurrences of. Signatures
//! must not change between runs.

use serde::{Deserialize, Serialize};

use crate::llm::LlmError;

/// Retry eligibility class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Retrying cannot change the result (contract violations, auth, bad input).
    #[serde(rename = "deterministic")]
    Deterministic,
    /// Infrastructure hiccup; retrying may succeed.
    #[serde(rename = "transient-infra")]
    TransientInfra,
    /// The run context was cancelled; never retried.
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Deterministic => "deterministic",
            FailureClass::TransientInfra => "transient-infra",
            FailureClass::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<FailureClass> {
        match s {
            "deterministic" => Some(FailureClass::Deterministic),
            "transient-infra" => Some(FailureClass::TransientInfra),
            "cancelled" => Some(FailureClass::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One substring rule: needle (matched lowercase), class, signature domain and slug.
struct Token {
    needle: &'static str,
    class: FailureClass,
    domain: &'static str,
    slug: &'static str,
}

/// Transient-infra tokens, checked before the deterministic set: a stderr tail
/// that mentions both a timeout and a usage hint should stay retryable.
const TRANSIENT_TOKENS: &[Token] = &[
    Token { needle: "rate limit", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "rate-limit" },
    Token { needle: "too many requests", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "rate-limit" },
    Token { needle: "429", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "rate-limit" },
    Token { needle: "idle timeout", class: FailureClass::TransientInfra, domain: "provider_timeout", slug: "idle" },
    Token { needle: "timed out", class: FailureClass::TransientInfra, domain: "provider_timeout", slug: "request" },
    Token { needle: "timeout", class: FailureClass::TransientInfra, domain: "provider_timeout", slug: "request" },
    Token { needle: "stream disconnected", class: FailureClass::TransientInfra, domain: "stream_disconnect", slug: "disconnected" },
    Token { needle: "stream closed before response.completed", class: FailureClass::TransientInfra, domain: "stream_disconnect", slug: "early-close" },
    Token { needle: "reconnecting...", class: FailureClass::TransientInfra, domain: "stream_disconnect", slug: "reconnecting" },
    Token { needle: "connection reset", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "connection-reset" },
    Token { needle: "connection refused", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "connection-refused" },
    Token { needle: "network is unreachable", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "network-unreachable" },
    Token { needle: "temporarily unavailable", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "unavailable" },
    Token { needle: "internal server error", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "server-5xx" },
    Token { needle: "502", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "server-5xx" },
    Token { needle: "503", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "server-5xx" },
    Token { needle: "504", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "server-5xx" },
    Token { needle: "500", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "server-5xx" },
    Token { needle: "overloaded", class: FailureClass::TransientInfra, domain: "provider_failure", slug: "overloaded" },
];

const DETERMINISTIC_TOKENS: &[Token] = &[
    Token { needle: "stream-json requires --verbose", class: FailureClass::Deterministic, domain: "provider_contract", slug: "stream-json-requires-verbose" },
    Token { needle: "unknown flag", class: FailureClass::Deterministic, domain: "provider_contract", slug: "unknown-flag" },
    Token { needle: "unrecognized argument", class: FailureClass::Deterministic, domain: "provider_contract", slug: "unknown-flag" },
    Token { needle: "unknown option", class: FailureClass::Deterministic, domain: "provider_contract", slug: "unknown-flag" },
    Token { needle: "no such file or directory", class: FailureClass::Deterministic, domain: "executable_missing", slug: "not-found" },
    Token { needle: "command not found", class: FailureClass::Deterministic, domain: "executable_missing", slug: "not-found" },
    Token { needle: "invalid_json_schema", class: FailureClass::Deterministic, domain: "schema_validation", slug: "invalid-schema" },
    Token { needle: "invalid schema", class: FailureClass::Deterministic, domain: "schema_validation", slug: "invalid-schema" },
    Token { needle: "state db missing rollout path", class: FailureClass::Deterministic, domain: "state_db", slug: "missing-rollout" },
    Token { needle: "record_discrepancy", class: FailureClass::Deterministic, domain: "state_db", slug: "discrepancy" },
    Token { needle: "model not found", class: FailureClass::Deterministic, domain: "provider_model_unavailable", slug: "not-found" },
    Token { needle: "unknown model", class: FailureClass::Deterministic, domain: "provider_model_unavailable", slug: "not-found" },
    Token { needle: "invalid api key", class: FailureClass::Deterministic, domain: "provider_auth", slug: "invalid-key" },
    Token { needle: "unauthorized", class: FailureClass::Deterministic, domain: "provider_auth", slug: "unauthorized" },
    Token { needle: "permission denied", class: FailureClass::Deterministic, domain: "provider_auth", slug: "denied" },
    Token { needle: "context length", class: FailureClass::Deterministic, domain: "provider_contract", slug: "context-length" },
    Token { needle: "aborted", class: FailureClass::Deterministic, domain: "provider_contract", slug: "abort" },
];

/// Classify a CLI subprocess failure from its observable remains.
///
/// Matches the concatenation of (stderr tail, run error, exit code) against
/// the token tables, transient first, and falls back to
/// `provider_failure|<prov>|unknown` when nothing matches.
pub fn classify_cli_failure(
    provider: &str,
    stderr_tail: &str,
    run_error: Option<&str>,
    exit_code: Option<i32>,
) -> (FailureClass, String) {
    let mut haystack = String::with_capacity(stderr_tail.len() + 64);
    haystack.push_str(stderr_tail);
    if let Some(err) = run_error {
        haystack.push('\n');
        haystack.push_str(err);
    }
    if let Some(code) = exit_code {
        haystack.push_str(&format!("\nexit={code}"));
    }
    let haystack = haystack.to_lowercase();

    for token in TRANSIENT_TOKENS.iter().chain(DETERMINISTIC_TOKENS) {
        if haystack.contains(token.needle) {
            return (
                token.class,
                format!("{}|{}|{}", token.domain, provider, token.slug),
            );
        }
    }
    (
        FailureClass::Deterministic,
        format!("provider_failure|{provider}|unknown"),
    )
}

/// Classify a typed API error from the LLM client taxonomy.
pub fn classify_llm_error(provider: &str, err: &LlmError) -> (FailureClass, String) {
    let (class, domain, slug) = match err {
        LlmError::Authentication(_) => (FailureClass::Deterministic, "provider_auth", "authentication"),
        LlmError::AccessDenied(_) => (FailureClass::Deterministic, "provider_auth", "access-denied"),
        LlmError::InvalidRequest(_) => (FailureClass::Deterministic, "provider_contract", "invalid-request"),
        LlmError::ContextLength(_) => (FailureClass::Deterministic, "provider_contract", "context-length"),
        LlmError::Configuration(_) => (FailureClass::Deterministic, "provider_config", "configuration"),
        LlmError::Abort(_) => (FailureClass::Deterministic, "provider_contract", "abort"),
        LlmError::RateLimit { .. } => (FailureClass::TransientInfra, "provider_failure", "rate-limit"),
        LlmError::Server(_) => (FailureClass::TransientInfra, "provider_failure", "server-5xx"),
        LlmError::Timeout(_) => (FailureClass::TransientInfra, "provider_timeout", "request"),
        LlmError::Network(_) => (FailureClass::TransientInfra, "provider_failure", "network"),
        LlmError::Stream(_) => (FailureClass::TransientInfra, "stream_disconnect", "disconnected"),
        LlmError::Cancelled => (FailureClass::Cancelled, "cancelled", "run"),
        LlmError::Unknown(_) => (FailureClass::Deterministic, "provider_failure", "unknown"),
    };
    (class, format!("{domain}|{provider}|{slug}"))
}

/// Retry-gate fallback when a handler did not stamp `meta.failure_class`.
pub fn heuristic_class(reason: &str) -> FailureClass {
    let lower = reason.to_lowercase();
    const TRANSIENT_HINTS: &[&str] = &[
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "rate limit",
        "429",
        "500",
        "502",
        "503",
        "504",
    ];
    if TRANSIENT_HINTS.iter().any(|h| lower.contains(h)) {
        FailureClass::TransientInfra
    } else {
        FailureClass::Deterministic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Idle-watchdog kills classify as transient with the idle signature.
    #[test]
    fn idle_timeout_is_transient() {
        let (class, sig) = classify_cli_failure(
            "openai",
            "",
            Some("codex idle timeout after 120s with no output"),
            None,
        );
        assert_eq!(class, FailureClass::TransientInfra);
        assert_eq!(sig, "provider_timeout|openai|idle");
    }

    /// **Scenario**: Anthropic stream-json contract violation yields the documented signature.
    #[test]
    fn stream_json_verbose_contract() {
        let (class, sig) = classify_cli_failure(
            "anthropic",
            "Error: stream-json requires --verbose",
            None,
            Some(1),
        );
        assert_eq!(class, FailureClass::Deterministic);
        assert_eq!(sig, "provider_contract|anthropic|stream-json-requires-verbose");
    }

    /// **Scenario**: Unknown shell error with no transient hint is deterministic with the generic signature.
    #[test]
    fn unknown_failure_is_deterministic_generic() {
        let (class, sig) = classify_cli_failure("google", "segfault", None, Some(139));
        assert_eq!(class, FailureClass::Deterministic);
        assert_eq!(sig, "provider_failure|google|unknown");
    }

    /// **Scenario**: Rate limits and 5xx map transient; auth errors map deterministic.
    #[test]
    fn token_table_coverage() {
        let (class, _) = classify_cli_failure("openai", "429 too many requests", None, None);
        assert_eq!(class, FailureClass::TransientInfra);
        let (class, _) = classify_cli_failure("openai", "invalid api key", None, None);
        assert_eq!(class, FailureClass::Deterministic);
        let (class, _) = classify_cli_failure("openai", "Reconnecting... 2/5", None, None);
        assert_eq!(class, FailureClass::TransientInfra);
    }

    /// **Scenario**: Typed API errors classify per the taxonomy; cancellation is its own class.
    #[test]
    fn llm_error_taxonomy() {
        let (class, sig) =
            classify_llm_error("openai", &LlmError::RateLimit { message: "slow down".into(), retry_after: None });
        assert_eq!(class, FailureClass::TransientInfra);
        assert_eq!(sig, "provider_failure|openai|rate-limit");

        let (class, _) = classify_llm_error("anthropic", &LlmError::ContextLength("too long".into()));
        assert_eq!(class, FailureClass::Deterministic);

        let (class, _) = classify_llm_error("google", &LlmError::Cancelled);
        assert_eq!(class, FailureClass::Cancelled);
    }

    /// **Scenario**: Heuristic fallback promotes transient hints only.
    #[test]
    fn heuristic_fallback() {
        assert_eq!(heuristic_class("connection reset by peer"), FailureClass::TransientInfra);
        assert_eq!(heuristic_class("assertion failed"), FailureClass::Deterministic);
    }
}
