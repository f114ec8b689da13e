//! Version-control collaborator interface.
//!
//! The worktree layer that commits per-stage changes to a dedicated branch
//! lives outside the core. The engine only needs these five operations and
//! never inspects the repository through any other channel.

use async_trait::async_trait;

use crate::error::EngineError;

/// Narrow seam to the external VCS worktree layer.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Creates and checks out `<prefix>/<run_id>`, returning the branch name.
    async fn init_run_branch(&self, prefix: &str, run_id: &str) -> Result<String, EngineError>;

    /// Commits worktree changes for a stage attempt; returns the commit SHA.
    async fn commit_stage(&self, node_id: &str, attempt: u32) -> Result<String, EngineError>;

    /// Hard-resets the run branch to the given SHA (resume rewind).
    async fn rewind_to(&self, sha: &str) -> Result<(), EngineError>;

    /// Fast-forwards the run branch to a winning parallel branch's SHA.
    async fn fast_forward_to(&self, sha: &str) -> Result<(), EngineError>;

    async fn current_branch(&self) -> Result<String, EngineError>;
}

/// No-op VCS used by tests and by runs without a repository. Commit SHAs are
/// synthesized counters so checkpoints still carry distinct markers.
#[derive(Debug, Default)]
pub struct NullVcs {
    counter: std::sync::atomic::AtomicU64,
    branch: std::sync::Mutex<String>,
}

impl NullVcs {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Vcs for NullVcs {
    async fn init_run_branch(&self, prefix: &str, run_id: &str) -> Result<String, EngineError> {
        let branch = format!("{prefix}/{run_id}");
        *self.branch.lock().unwrap_or_else(|p| p.into_inner()) = branch.clone();
        Ok(branch)
    }

    async fn commit_stage(&self, node_id: &str, attempt: u32) -> Result<String, EngineError> {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(format!("null-{node_id}-{attempt}-{n}"))
    }

    async fn rewind_to(&self, _sha: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn fast_forward_to(&self, _sha: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn current_branch(&self) -> Result<String, EngineError> {
        Ok(self
            .branch
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: NullVcs synthesizes distinct SHAs and remembers the run branch.
    #[tokio::test]
    async fn null_vcs_basics() {
        let vcs = NullVcs::new();
        let branch = vcs.init_run_branch("attractor", "run-1").await.unwrap();
        assert_eq!(branch, "attractor/run-1");
        assert_eq!(vcs.current_branch().await.unwrap(), "attractor/run-1");

        let a = vcs.commit_stage("build", 1).await.unwrap();
        let b = vcs.commit_stage("build", 2).await.unwrap();
        assert_ne!(a, b);
    }
}
