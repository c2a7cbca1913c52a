//! Repo management
//!
//! [`RepoKey`] names a GitHub repository, [`RepoLockMap`] serializes all Git
//! work targeting the same repository, and [`GitBackend`] is the seam
//! between the relay's finalize pipeline and the actual `git` binary
//! ([`manager::CliGit`] in production, stubs in tests).

pub mod git;
pub mod manager;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::error::RelayError;

pub use manager::CliGit;

/// A validated `"owner/repo"` pair. Both segments are filesystem-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoKey {
    owner: String,
    repo: String,
}

impl RepoKey {
    /// Parse and validate an `owner/repo` string.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let mut parts = raw.split('/');
        let (Some(owner), Some(repo), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(RelayError::InvalidInput(format!(
                "repo must be 'owner/repo', got '{raw}'"
            )));
        };
        if !is_valid_segment(owner) || !is_valid_segment(repo) {
            return Err(RelayError::InvalidInput(format!(
                "repo contains invalid characters: '{raw}'"
            )));
        }
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }
}

impl std::fmt::Display for RepoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Validate one path segment of a repo key: ASCII alphanumerics plus
/// `._-`, length-capped, never a dot-directory.
fn is_valid_segment(segment: &str) -> bool {
    if segment.is_empty() || segment.len() > 100 || segment == "." || segment == ".." {
        return false;
    }
    segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Validate a Git branch name as the relay accepts it. Conservative subset
/// of the ref-name rules, rejecting anything that could be parsed as a
/// command-line flag or path escape.
pub fn is_valid_branch(branch: &str) -> bool {
    if branch.is_empty() || branch.len() > 200 {
        return false;
    }
    if branch.starts_with('-') || branch.starts_with('/') || branch.ends_with('/') {
        return false;
    }
    if branch.contains("..") || branch.contains("//") {
        return false;
    }
    branch
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
}

/// FIFO mutex per repository key. Distinct repositories proceed in
/// parallel; operations on the same repository run in acquisition order
/// (the tokio mutex is fair). Keys live for the process lifetime.
#[derive(Debug, Default)]
pub struct RepoLockMap {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RepoLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a repository, waiting FIFO behind earlier
    /// claimants. The guard releases on drop, on every exit path.
    pub async fn acquire(&self, key: &RepoKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// The Git collaborator behind the finalize pipeline.
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Clone-or-fetch the repository and reset `branch` to the tip of
    /// `origin/<base_branch>`. Returns the working directory.
    async fn prepare_branch(
        &self,
        key: &RepoKey,
        branch: &str,
        base_branch: &str,
    ) -> Result<PathBuf, RelayError>;

    /// Verify a bundle, import its commits, and push them to
    /// `refs/heads/<branch>` upstream. Returns the pushed commit SHA.
    async fn apply_bundle(
        &self,
        repo_dir: &Path,
        bundle: &[u8],
        branch: &str,
        session_id: &str,
    ) -> Result<String, RelayError>;

    /// Apply an mbox-format patch series onto the current branch.
    async fn apply_patch(&self, repo_dir: &Path, mbox: &[u8]) -> Result<(), RelayError>;

    /// Force-with-lease push of the current branch. Returns the head SHA.
    async fn push_branch(&self, repo_dir: &Path, branch: &str) -> Result<String, RelayError>;

    /// SHA of `refs/heads/<branch>` on the remote, or empty string if the
    /// ref does not exist.
    async fn remote_head(&self, key: &RepoKey, branch: &str) -> Result<String, RelayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_repo_key_parse_valid() {
        let key = RepoKey::parse("octo-org/some.repo_1").unwrap();
        assert_eq!(key.owner(), "octo-org");
        assert_eq!(key.repo(), "some.repo_1");
        assert_eq!(key.to_string(), "octo-org/some.repo_1");
    }

    #[test]
    fn test_repo_key_parse_invalid() {
        for raw in [
            "",
            "noslash",
            "a/b/c",
            "/repo",
            "owner/",
            "owner/..",
            "../repo",
            "owner/re po",
            "owner/re$po",
        ] {
            assert!(RepoKey::parse(raw).is_err(), "accepted '{raw}'");
        }
    }

    #[test]
    fn test_branch_validation() {
        assert!(is_valid_branch("main"));
        assert!(is_valid_branch("feat/chunked-upload"));
        assert!(is_valid_branch("release-1.2.3"));
        assert!(!is_valid_branch(""));
        assert!(!is_valid_branch("-rf"));
        assert!(!is_valid_branch("feat..main"));
        assert!(!is_valid_branch("/main"));
        assert!(!is_valid_branch("feat branch"));
    }

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(RepoLockMap::new());
        let key = RepoKey::parse("a/b").unwrap();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(&key).await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_in_parallel() {
        let locks = Arc::new(RepoLockMap::new());
        let a = RepoKey::parse("a/b").unwrap();
        let b = RepoKey::parse("c/d").unwrap();

        let guard_a = locks.acquire(&a).await;
        // Holding a/b must not block c/d.
        let guard_b = tokio::time::timeout(Duration::from_secs(1), locks.acquire(&b))
            .await
            .expect("distinct repo key should not be blocked");
        drop(guard_a);
        drop(guard_b);
    }
}
