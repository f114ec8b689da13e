//! Edge condition grammar.
//!
//! A condition is `outcome=<value>` optionally conjoined with
//! `context.<key>=<value>` clauses via `&&`. Context values are compared as
//! strings.

use crate::context::RunContext;

/// Parsed edge condition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Condition {
    /// Required outcome label, if an `outcome=` clause is present.
    pub outcome: Option<String>,
    /// `(key, value)` pairs from `context.<key>=<value>` clauses.
    pub context: Vec<(String, String)>,
}

impl Condition {
    /// Parses a condition string. Unknown clause forms are ignored rather
    /// than rejected so a newer DSL does not break an older engine.
    pub fn parse(raw: &str) -> Condition {
        let mut cond = Condition::default();
        for clause in raw.split("&&") {
            let clause = clause.trim();
            let Some((key, value)) = clause.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key == "outcome" {
                cond.outcome = Some(value.to_string());
            } else if let Some(ctx_key) = key.strip_prefix("context.") {
                cond.context.push((ctx_key.to_string(), value.to_string()));
            }
        }
        cond
    }

    /// True when the outcome label and every context clause match.
    pub fn matches(&self, outcome_label: &str, ctx: &RunContext) -> bool {
        if let Some(expected) = &self.outcome {
            if expected != outcome_label {
                return false;
            }
        }
        self.context.iter().all(|(key, expected)| {
            ctx.get_string(key).map(|actual| actual == *expected).unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: `outcome=` and `context.` clauses parse; conjunction requires all.
    #[test]
    fn parse_and_match() {
        let cond = Condition::parse("outcome=success && context.phase=build");
        assert_eq!(cond.outcome.as_deref(), Some("success"));
        assert_eq!(cond.context, vec![("phase".to_string(), "build".to_string())]);

        let mut ctx = RunContext::new();
        ctx.set("phase", json!("build"));
        assert!(cond.matches("success", &ctx));
        assert!(!cond.matches("fail", &ctx));

        ctx.set("phase", json!("test"));
        assert!(!cond.matches("success", &ctx));
    }

    /// **Scenario**: Context values compare as strings, so numbers match their textual form.
    #[test]
    fn context_values_compare_as_strings() {
        let cond = Condition::parse("outcome=success && context.attempt=2");
        let mut ctx = RunContext::new();
        ctx.set("attempt", json!(2));
        assert!(cond.matches("success", &ctx));
    }

    /// **Scenario**: Custom outcome labels match verbatim.
    #[test]
    fn custom_outcome_labels() {
        let cond = Condition::parse("outcome=needs_dod");
        let ctx = RunContext::new();
        assert!(cond.matches("needs_dod", &ctx));
        assert!(!cond.matches("has_dod", &ctx));
    }
}
