//! Model catalog and failover model selection.
//!
//! The catalog is the OpenRouter/LiteLLM-style model-info document pinned on
//! disk (see `modeldb` config). The engine uses it for exactly one thing:
//! picking a provider-appropriate model when failing over to a provider the
//! node did not name.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One catalog entry. Only the provider tag matters to the engine; the rest
/// of the document (pricing, limits) is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub litellm_provider: Option<String>,
}

/// Model key → info, as loaded from the pinned model-info JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelCatalog {
    pub entries: BTreeMap<String, ModelInfo>,
}

impl ModelCatalog {
    pub fn load(path: &Path) -> std::io::Result<ModelCatalog> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn keys_for_provider(&self, provider: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, info)| {
                info.litellm_provider
                    .as_deref()
                    .map(normalize_provider_tag)
                    .as_deref()
                    == Some(provider)
            })
            .map(|(key, _)| key.as_str())
            .collect()
    }
}

fn normalize_provider_tag(tag: &str) -> String {
    let tag = tag.trim().to_lowercase();
    match tag.as_str() {
        "gemini" | "vertex_ai" => "google".to_string(),
        other => other.to_string(),
    }
}

/// Best model for a provider when failing over. Returns `None` only for
/// providers with no selection rule and no catalog entries.
pub fn preferred_model(provider: &str, catalog: &ModelCatalog) -> Option<String> {
    match provider {
        "openai" => Some(preferred_openai(catalog)),
        "anthropic" => preferred_anthropic(catalog),
        "google" => Some(preferred_google(catalog)),
        other => {
            let mut keys = catalog.keys_for_provider(other);
            keys.sort_by(|a, b| rank_generic(a, b));
            keys.first().map(|k| strip_prefix(k).to_string())
        }
    }
}

fn preferred_openai(catalog: &ModelCatalog) -> String {
    for candidate in ["gpt-5.2-codex", "codex-mini-latest"] {
        if catalog.contains(candidate) {
            return candidate.to_string();
        }
    }
    "gpt-5.2-codex".to_string()
}

fn preferred_anthropic(catalog: &ModelCatalog) -> Option<String> {
    let mut keys = catalog.keys_for_provider("anthropic");
    keys.sort_by(|a, b| rank_anthropic(a, b));
    keys.first().map(|k| strip_prefix(k).to_string())
}

const GOOGLE_PREFERRED: &[&str] = &[
    "gemini/gemini-2.5-pro",
    "gemini/gemini-2.5-pro-preview-06-05",
    "gemini/gemini-2.5-pro-preview-05-06",
    "gemini/gemini-2.5-pro-preview-03-25",
];

fn preferred_google(catalog: &ModelCatalog) -> String {
    for candidate in GOOGLE_PREFERRED {
        if catalog.contains(candidate) {
            return candidate
                .strip_prefix("gemini/")
                .unwrap_or(candidate)
                .to_string();
        }
    }
    let mut keys = catalog.keys_for_provider("google");
    keys.sort_by(|a, b| rank_google(a, b));
    keys.first()
        .map(|k| k.strip_prefix("gemini/").unwrap_or(k).to_string())
        .unwrap_or_else(|| "gemini-2.5-pro".to_string())
}

/// Anthropic ranking: family (opus > sonnet > haiku), then numeric tokens,
/// then keys without `/`, then descending lexical. `a` before `b` means `a`
/// is preferred.
fn rank_anthropic(a: &str, b: &str) -> Ordering {
    let family = |k: &str| {
        let k = k.to_lowercase();
        if k.contains("opus") {
            3
        } else if k.contains("sonnet") {
            2
        } else if k.contains("haiku") {
            1
        } else {
            0
        }
    };
    family(b)
        .cmp(&family(a))
        .then_with(|| numeric_tokens(b).cmp(&numeric_tokens(a)))
        .then_with(|| a.contains('/').cmp(&b.contains('/')))
        .then_with(|| b.cmp(a))
}

/// Google ranking: family (-pro > flash > lite), then numeric tokens, then
/// descending lexical.
fn rank_google(a: &str, b: &str) -> Ordering {
    let family = |k: &str| {
        let k = k.to_lowercase();
        if k.contains("-pro") {
            3
        } else if k.contains("flash") {
            2
        } else if k.contains("lite") {
            1
        } else {
            0
        }
    };
    family(b)
        .cmp(&family(a))
        .then_with(|| numeric_tokens(b).cmp(&numeric_tokens(a)))
        .then_with(|| b.cmp(a))
}

fn rank_generic(a: &str, b: &str) -> Ordering {
    numeric_tokens(b)
        .cmp(&numeric_tokens(a))
        .then_with(|| b.cmp(a))
}

/// Consecutive digit runs as a sequence, compared lexicographically so
/// `claude-4-1` outranks `claude-3-7`.
fn numeric_tokens(key: &str) -> Vec<u64> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in key.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if !current.is_empty() {
            if let Ok(n) = current.parse() {
                tokens.push(n);
            }
            current.clear();
        }
    }
    if !current.is_empty() {
        if let Ok(n) = current.parse() {
            tokens.push(n);
        }
    }
    tokens
}

fn strip_prefix(key: &str) -> &str {
    key.rsplit_once('/').map(|(_, rest)| rest).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(entries: &[(&str, &str)]) -> ModelCatalog {
        ModelCatalog {
            entries: entries
                .iter()
                .map(|(key, provider)| {
                    (
                        key.to_string(),
                        ModelInfo {
                            litellm_provider: Some(provider.to_string()),
                        },
                    )
                })
                .collect(),
        }
    }

    /// **Scenario**: openai prefers gpt-5.2-codex, then codex-mini-latest, then the literal.
    #[test]
    fn openai_fixed_preferences() {
        let cat = catalog(&[("gpt-5.2-codex", "openai"), ("codex-mini-latest", "openai")]);
        assert_eq!(preferred_model("openai", &cat).unwrap(), "gpt-5.2-codex");

        let cat = catalog(&[("codex-mini-latest", "openai")]);
        assert_eq!(preferred_model("openai", &cat).unwrap(), "codex-mini-latest");

        let cat = catalog(&[]);
        assert_eq!(preferred_model("openai", &cat).unwrap(), "gpt-5.2-codex");
    }

    /// **Scenario**: anthropic ranks opus over sonnet over haiku, newer versions first,
    /// and strips any `…/` prefix on return.
    #[test]
    fn anthropic_family_and_version_ranking() {
        let cat = catalog(&[
            ("claude-haiku-4-5", "anthropic"),
            ("claude-sonnet-4-5", "anthropic"),
            ("anthropic/claude-opus-4-1", "anthropic"),
            ("claude-opus-4-6", "anthropic"),
        ]);
        assert_eq!(preferred_model("anthropic", &cat).unwrap(), "claude-opus-4-6");
    }

    /// **Scenario**: among equal families and versions, keys without a slash win.
    #[test]
    fn anthropic_prefers_unprefixed_keys() {
        let cat = catalog(&[
            ("anthropic/claude-opus-4-1", "anthropic"),
            ("claude-opus-4-1", "anthropic"),
        ]);
        assert_eq!(preferred_model("anthropic", &cat).unwrap(), "claude-opus-4-1");
    }

    /// **Scenario**: google tries the fixed preferred list first, else ranks -pro over flash,
    /// stripping the gemini/ prefix.
    #[test]
    fn google_preferred_list_then_ranking() {
        let cat = catalog(&[("gemini/gemini-2.5-pro", "gemini")]);
        assert_eq!(preferred_model("google", &cat).unwrap(), "gemini-2.5-pro");

        let cat = catalog(&[
            ("gemini/gemini-3-flash", "gemini"),
            ("gemini/gemini-3-pro-preview", "gemini"),
        ]);
        assert_eq!(preferred_model("google", &cat).unwrap(), "gemini-3-pro-preview");

        let cat = catalog(&[]);
        assert_eq!(preferred_model("google", &cat).unwrap(), "gemini-2.5-pro");
    }

    /// **Scenario**: the catalog document is a transparent map and loads from disk.
    #[test]
    fn catalog_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("models.json");
        std::fs::write(
            &path,
            r#"{"claude-opus-4-6":{"litellm_provider":"anthropic","max_tokens":64000}}"#,
        )
        .unwrap();
        let cat = ModelCatalog::load(&path).unwrap();
        assert!(cat.contains("claude-opus-4-6"));
        assert_eq!(
            cat.entries["claude-opus-4-6"].litellm_provider.as_deref(),
            Some("anthropic")
        );
    }
}
