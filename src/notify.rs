/// Finalize action: tell the user the condition was satisfied.
///
/// Only the command notifier is implemented. It runs under `sh -c` with
/// stdio inherited, and the watcher waits for it before exiting.
use crate::condition::process::shell_command;
use crate::condition::Condition;
use crate::context::{ExecutionContext, Notifier};
use std::process::ExitStatus;

/// Errors that can occur while notifying.
#[derive(Debug)]
pub enum NotifyError {
    /// No way to tell the user was configured.
    NotConfigured,
    /// Failed to spawn the notification command.
    Launch {
        command: String,
        source: std::io::Error,
    },
    /// Failed while waiting for the notification command.
    Wait {
        command: String,
        source: std::io::Error,
    },
    /// The notification command ran and exited non-zero.
    Failed { command: String, status: ExitStatus },
    /// The notifier is recognized but not implemented.
    Unsupported { via: String },
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::NotConfigured => write!(
                f,
                "no notification configured (use --tellme-via-running=CMD)"
            ),
            NotifyError::Launch { command, source } => {
                write!(f, "failed to launch notification `{}`: {}", command, source)
            }
            NotifyError::Wait { command, source } => {
                write!(f, "failed to wait for notification `{}`: {}", command, source)
            }
            NotifyError::Failed { command, status } => {
                write!(f, "notification `{}` failed: {}", command, status)
            }
            NotifyError::Unsupported { via } => {
                write!(f, "notifying via {} is not implemented", via)
            }
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifyError::Launch { source, .. } => Some(source),
            NotifyError::Wait { source, .. } => Some(source),
            NotifyError::NotConfigured
            | NotifyError::Failed { .. }
            | NotifyError::Unsupported { .. } => None,
        }
    }
}

/// Run the configured notifier once for a satisfied condition.
pub async fn finalize(ctx: &ExecutionContext, condition: &Condition) -> Result<(), NotifyError> {
    let notifier = ctx.notifier.as_ref().ok_or(NotifyError::NotConfigured)?;
    tracing::info!(%condition, via = %notifier, "condition satisfied, notifying");

    match notifier {
        Notifier::Command(command) => run_command(command).await,
        Notifier::HttpGet { .. } | Notifier::HttpPost { .. } => Err(NotifyError::Unsupported {
            via: notifier.to_string(),
        }),
    }
}

async fn run_command(command: &str) -> Result<(), NotifyError> {
    let mut child = shell_command(command)
        .spawn()
        .map_err(|e| NotifyError::Launch {
            command: command.to_string(),
            source: e,
        })?;

    let status = child.wait().await.map_err(|e| NotifyError::Wait {
        command: command.to_string(),
        source: e,
    })?;

    if !status.success() {
        return Err(NotifyError::Failed {
            command: command.to_string(),
            status,
        });
    }

    tracing::debug!(command, "notification command finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(notifier: Option<Notifier>) -> ExecutionContext {
        ExecutionContext::new(false, notifier)
    }

    #[tokio::test]
    async fn test_finalize_without_notifier_fails() {
        let err = finalize(&ctx_with(None), &Condition::file_exists("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::NotConfigured));
        assert!(err.to_string().contains("--tellme-via-running"));
    }

    #[tokio::test]
    async fn test_finalize_runs_command_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("told");
        let ctx = ctx_with(Some(Notifier::Command(format!(
            "echo done >> {}",
            marker.display()
        ))));

        finalize(&ctx, &Condition::file_exists("x")).await.unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "done\n");
    }

    #[tokio::test]
    async fn test_finalize_nonzero_exit_is_error() {
        let ctx = ctx_with(Some(Notifier::Command("exit 3".to_string())));
        let err = finalize(&ctx, &Condition::file_exists("x"))
            .await
            .unwrap_err();
        match err {
            NotifyError::Failed { status, .. } => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_finalize_http_is_unsupported() {
        let ctx = ctx_with(Some(Notifier::HttpPost {
            url: "http://localhost:9/hook".to_string(),
            body: None,
        }));
        let err = finalize(&ctx, &Condition::file_exists("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Unsupported { .. }));
        assert!(err.to_string().contains("HTTP POST"));
    }
}
