//! Compose child-process driver.
//!
//! Every invocation runs `docker compose -f <stack>/docker-compose.yml …`
//! under a deadline with `kill_on_drop`, so dropping the future (request
//! cancellation) tears the child down.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::limits::COMPOSE_TIMEOUT;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("compose command failed")]
    Failed { output: String },

    #[error("compose command timed out")]
    TimedOut,

    #[error("failed to run compose command")]
    Spawn(#[from] std::io::Error),
}

pub fn compose_file_path(stack_dir: &Path) -> PathBuf {
    stack_dir.join("docker-compose.yml")
}

/// A prepared compose command; callers attach their own stdio.
pub fn compose_command(stack_dir: &Path, args: &[&str]) -> Command {
    let compose_file = compose_file_path(stack_dir);
    let mut cmd = Command::new("docker");
    cmd.arg("compose").arg("-f").arg(compose_file).args(args);
    cmd.kill_on_drop(true);
    cmd
}

/// Run a compose command, capturing combined stdout and stderr.
pub async fn run_compose(stack_dir: &Path, args: &[&str]) -> Result<String, ComposeError> {
    run_compose_within(stack_dir, args, COMPOSE_TIMEOUT).await
}

pub async fn run_compose_within(stack_dir: &Path, args: &[&str], deadline: Duration) -> Result<String, ComposeError> {
    let mut cmd = compose_command(stack_dir, args);
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = timeout(deadline, cmd.output())
        .await
        .map_err(|_| ComposeError::TimedOut)??;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(text)
    } else {
        Err(ComposeError::Failed { output: text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_file_path() {
        assert_eq!(
            compose_file_path(Path::new("/srv/stacks/game")),
            PathBuf::from("/srv/stacks/game/docker-compose.yml")
        );
    }

    #[tokio::test]
    async fn test_run_compose_missing_binary_is_spawn_error() {
        // `docker` is absent in the test environment more often than not;
        // either way the call must not hang past the deadline.
        let result = run_compose_within(Path::new("/nonexistent"), &["ps"], Duration::from_secs(5)).await;
        assert!(result.is_err());
    }
}
