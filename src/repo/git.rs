//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function shells out to the system `git` binary. The committer
//! identity and credentials are injected via environment variables so
//! callers never see them in argv. Failures carry the failing operation
//! name and trimmed stderr.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::RelayError;

/// Author and committer identity applied to every git invocation.
#[derive(Debug, Clone)]
pub struct GitIdentity {
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    pub committer_email: String,
}

impl GitIdentity {
    pub fn apply(&self, cmd: &mut Command) {
        cmd.env("GIT_AUTHOR_NAME", &self.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.author_email)
            .env("GIT_COMMITTER_NAME", &self.committer_name)
            .env("GIT_COMMITTER_EMAIL", &self.committer_email);
    }
}

/// Run a git command, returning its stdout on success.
///
/// `op` is the short operation name carried in errors ("clone", "push",
/// ...), never the full argv, so token-bearing URLs stay out of error
/// bodies and logs.
pub async fn run(
    op: &'static str,
    cwd: Option<&Path>,
    identity: &GitIdentity,
    args: &[&str],
) -> Result<String, RelayError> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    identity.apply(&mut cmd);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!(target: "git", op, "spawning git");

    let output = cmd.output().await.map_err(|e| RelayError::Git {
        op,
        message: format!("failed to spawn git: {e}"),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RelayError::Git {
            op,
            message: format!("status {}: {}", output.status, stderr.trim()),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a git command where failure is tolerable (cleanup paths). Logs and
/// swallows the error.
pub async fn run_best_effort(
    op: &'static str,
    cwd: Option<&Path>,
    identity: &GitIdentity,
    args: &[&str],
) {
    if let Err(e) = run(op, cwd, identity, args).await {
        debug!(target: "git", op, "best-effort git command failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> GitIdentity {
        GitIdentity {
            author_name: "Relay".into(),
            author_email: "relay@example.com".into(),
            committer_name: "Relay".into(),
            committer_email: "relay@example.com".into(),
        }
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run("version", None, &identity(), &["--version"])
            .await
            .unwrap();
        assert!(out.starts_with("git version"));
    }

    #[tokio::test]
    async fn test_failure_carries_op_and_stderr() {
        let err = run(
            "rev-parse",
            None,
            &identity(),
            &["rev-parse", "--definitely-not-a-flag"],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "GIT_ERROR");
        assert!(err.to_string().contains("rev-parse"));
    }

    #[tokio::test]
    async fn test_best_effort_swallows_failure() {
        run_best_effort(
            "update-ref",
            None,
            &identity(),
            &["update-ref", "-d", "refs/relay/nonexistent"],
        )
        .await;
    }
}
