//! Deterministic retry backoff.
//!
//! Pure function from (attempt, config, seed) to a delay. Jitter is derived
//! from a keyed hash of the seed, so a given (run, node, attempt) always
//! sleeps the same length and replays stay deterministic.

use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::graph::{parse_bool, Graph, Node};

/// Backoff configuration, read from node attributes first and graph
/// attributes second (`retry.backoff.*` keys).
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_delay: Duration::from_millis(200),
            factor: 2.0,
            max_delay: Duration::from_millis(60_000),
            jitter: false,
        }
    }
}

/// Reads `retry.backoff.initial_delay_ms`, `.backoff_factor`, `.max_delay_ms`
/// and `.jitter` with node-first, graph-second precedence.
pub fn backoff_config_for(graph: &Graph, node: &Node) -> BackoffConfig {
    let defaults = BackoffConfig::default();
    let read = |key: &str| graph.node_or_graph_attr(node, key);

    let initial_ms = read("retry.backoff.initial_delay_ms")
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(defaults.initial_delay);
    let factor = read("retry.backoff.backoff_factor")
        .and_then(|s| s.trim().parse::<f64>().ok())
        .unwrap_or(defaults.factor);
    let max_ms = read("retry.backoff.max_delay_ms")
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(defaults.max_delay);
    let jitter = parse_bool(read("retry.backoff.jitter"), defaults.jitter);

    BackoffConfig {
        initial_delay: initial_ms,
        factor,
        max_delay: max_ms,
        jitter,
    }
}

/// Delay before the given 1-indexed attempt.
///
/// `base = initial · factor^(attempt-1)`, capped at `max_delay`; with jitter
/// the base is scaled by `0.5 + u` where `u ∈ [0,1)` comes from the first 64
/// bits of `SHA256(seed)`.
pub fn delay_for_attempt(attempt: u32, cfg: &BackoffConfig, seed: &str) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let base_ms = cfg.initial_delay.as_secs_f64() * 1000.0 * cfg.factor.powi(exponent);
    let capped_ms = base_ms.min(cfg.max_delay.as_secs_f64() * 1000.0);
    let final_ms = if cfg.jitter {
        capped_ms * (0.5 + jitter_unit(seed))
    } else {
        capped_ms
    };
    Duration::from_secs_f64((final_ms / 1000.0).max(0.0))
}

/// First 64 bits of SHA256(seed) mapped into [0, 1).
fn jitter_unit(seed: &str) -> f64 {
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) as f64 / (u64::MAX as f64 + 1.0)
}

/// Canonical seed format: a given (run, node, attempt) always sleeps the same.
pub fn backoff_seed(run_id: &str, node_id: &str, attempt: u32) -> String {
    format!("{run_id}:{node_id}:{attempt}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, Node};

    /// **Scenario**: Without jitter the sequence is initial·factor^(i-1) capped at max_delay.
    #[test]
    fn geometric_sequence_capped() {
        let cfg = BackoffConfig {
            initial_delay: Duration::from_millis(200),
            factor: 2.0,
            max_delay: Duration::from_millis(1000),
            jitter: false,
        };
        assert_eq!(delay_for_attempt(1, &cfg, "s"), Duration::from_millis(200));
        assert_eq!(delay_for_attempt(2, &cfg, "s"), Duration::from_millis(400));
        assert_eq!(delay_for_attempt(3, &cfg, "s"), Duration::from_millis(800));
        assert_eq!(delay_for_attempt(4, &cfg, "s"), Duration::from_millis(1000));
        assert_eq!(delay_for_attempt(10, &cfg, "s"), Duration::from_millis(1000));
    }

    /// **Scenario**: With jitter the delay is deterministic per seed and bounded by [0.5, 1.5)·base.
    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let cfg = BackoffConfig {
            jitter: true,
            ..BackoffConfig::default()
        };
        let seed = backoff_seed("run-1", "build", 1);
        let a = delay_for_attempt(1, &cfg, &seed);
        let b = delay_for_attempt(1, &cfg, &seed);
        assert_eq!(a, b, "same seed must sleep the same");

        let base = cfg.initial_delay.as_secs_f64();
        assert!(a.as_secs_f64() >= base * 0.5);
        assert!(a.as_secs_f64() < base * 1.5);

        let other = delay_for_attempt(1, &cfg, &backoff_seed("run-1", "build", 2));
        assert_ne!(a, other, "different attempts should jitter differently");
    }

    /// **Scenario**: Node attributes override graph attributes which override defaults.
    #[test]
    fn config_precedence_node_then_graph() {
        let mut graph = Graph::new();
        graph.set_attr("retry.backoff.initial_delay_ms", "1000");
        graph.set_attr("retry.backoff.jitter", "true");
        graph
            .add_node(
                Node::new("a")
                    .with_attr("shape", "Mdiamond")
                    .with_attr("retry.backoff.initial_delay_ms", "50"),
            )
            .unwrap();
        graph.add_node(Node::new("b").with_attr("shape", "Msquare")).unwrap();
        graph.add_edge(Edge::new("a", "b"));

        let node_a = graph.node("a").unwrap();
        let cfg = backoff_config_for(&graph, node_a);
        assert_eq!(cfg.initial_delay, Duration::from_millis(50));
        assert!(cfg.jitter, "graph-level jitter applies when node is silent");

        let node_b = graph.node("b").unwrap();
        let cfg = backoff_config_for(&graph, node_b);
        assert_eq!(cfg.initial_delay, Duration::from_millis(1000));
        assert_eq!(cfg.factor, 2.0);
        assert_eq!(cfg.max_delay, Duration::from_millis(60_000));
    }
}
