/// Polling driver: init once, check every 100ms until satisfied, then run
/// the finalize action exactly once.
///
/// One `.` is written to the progress sink per unsatisfied poll as a
/// heartbeat. Any error from `init`, `check` or the finalize action stops
/// the loop immediately; a failed watch never notifies.
use crate::condition::{Condition, ConditionError};
use crate::context::ExecutionContext;
use crate::notify::{self, NotifyError};
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Fixed polling cadence.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where a watch is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    NotInitialized,
    Ready,
    Polling,
    Satisfied,
    Finalized,
    Failed,
}

/// Errors that end a watch.
#[derive(Debug)]
pub enum WatchError {
    Init(ConditionError),
    Check(ConditionError),
    Notify(NotifyError),
    /// Writing the progress heartbeat failed.
    Progress(std::io::Error),
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Init(e) => write!(f, "failed to start watching: {}", e),
            WatchError::Check(e) => write!(f, "{}", e),
            WatchError::Notify(e) => write!(f, "{}", e),
            WatchError::Progress(e) => write!(f, "failed to write progress: {}", e),
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Init(e) | WatchError::Check(e) => Some(e),
            WatchError::Notify(e) => Some(e),
            WatchError::Progress(e) => Some(e),
        }
    }
}

pub struct Watcher<W: Write> {
    poll_interval: Duration,
    /// Interval between "still waiting" log records; `None` disables them.
    update_every: Option<Duration>,
    progress: W,
    state: WatchState,
    polls: u64,
}

impl Watcher<std::io::Stdout> {
    /// Watcher that writes its heartbeat to stdout.
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> Watcher<W> {
    pub fn new(progress: W) -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            update_every: None,
            progress,
            state: WatchState::NotInitialized,
            polls: 0,
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_update_every(mut self, every: Option<Duration>) -> Self {
        self.update_every = every;
        self
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Number of `check` calls made so far.
    pub fn polls(&self) -> u64 {
        self.polls
    }

    #[cfg(test)]
    pub fn progress(&self) -> &W {
        &self.progress
    }

    fn transition(&mut self, next: WatchState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "watch state");
            self.state = next;
        }
    }

    fn fail(&mut self, err: WatchError) -> WatchError {
        self.transition(WatchState::Failed);
        err
    }

    /// Wait for `condition` and notify once it is satisfied.
    pub async fn run(
        &mut self,
        condition: Condition,
        ctx: &ExecutionContext,
    ) -> Result<(), WatchError> {
        let condition = self.wait(condition, ctx).await?;

        match notify::finalize(ctx, &condition).await {
            Ok(()) => {
                self.transition(WatchState::Finalized);
                Ok(())
            }
            Err(e) => Err(self.fail(WatchError::Notify(e))),
        }
    }

    /// Initialize `condition` and poll it until satisfied. Returns the
    /// satisfied condition; does not notify.
    pub async fn wait(
        &mut self,
        condition: Condition,
        ctx: &ExecutionContext,
    ) -> Result<Condition, WatchError> {
        let mut condition = match condition.init(ctx).await {
            Ok(c) => c,
            Err(e) => return Err(self.fail(WatchError::Init(e))),
        };
        self.transition(WatchState::Ready);

        let started = Instant::now();
        let started_at = chrono::Local::now();
        let mut last_update = started;
        let mut dots = false;

        loop {
            self.transition(WatchState::Polling);
            let (next, satisfied) = match condition.check(ctx).await {
                Ok(result) => result,
                Err(e) => return Err(self.fail(WatchError::Check(e))),
            };
            self.polls += 1;
            condition = next;

            if satisfied {
                if dots {
                    self.heartbeat("\n")?;
                }
                info!(
                    %condition,
                    polls = self.polls,
                    elapsed_secs = started.elapsed().as_secs(),
                    "condition satisfied"
                );
                self.transition(WatchState::Satisfied);
                return Ok(condition);
            }

            tokio::time::sleep(self.poll_interval).await;
            self.heartbeat(".")?;
            dots = true;

            if let Some(every) = self.update_every {
                if last_update.elapsed() >= every {
                    info!(
                        %condition,
                        since = %started_at.format("%Y-%m-%d %H:%M:%S"),
                        elapsed_secs = started.elapsed().as_secs(),
                        "still waiting"
                    );
                    last_update = Instant::now();
                }
            }
        }
    }

    fn heartbeat(&mut self, mark: &str) -> Result<(), WatchError> {
        let written = self
            .progress
            .write_all(mark.as_bytes())
            .and_then(|()| self.progress.flush());
        match written {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(WatchError::Progress(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Notifier;
    use tempfile::tempdir;

    fn watcher() -> Watcher<Vec<u8>> {
        Watcher::new(Vec::new()).with_poll_interval(Duration::from_millis(10))
    }

    fn notify_into(marker: &std::path::Path) -> ExecutionContext {
        ExecutionContext::new(
            false,
            Some(Notifier::Command(format!("echo told >> {}", marker.display()))),
        )
    }

    #[tokio::test]
    async fn test_wait_for_file_that_appears_later() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");

        let writer = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            std::fs::write(writer, "hello").unwrap();
        });

        let mut watcher = watcher();
        let condition = watcher
            .wait(Condition::file_exists(&path), &ExecutionContext::default())
            .await
            .unwrap();

        assert!(matches!(condition, Condition::FileExists(_)));
        assert_eq!(watcher.state(), WatchState::Satisfied);
        assert!(watcher.polls() > 1);

        let out = String::from_utf8(watcher.progress().clone()).unwrap();
        assert!(out.starts_with('.'));
        assert!(out.ends_with(".\n"));
        assert_eq!(out.matches('.').count() as u64, watcher.polls() - 1);
    }

    #[tokio::test]
    async fn test_already_satisfied_prints_no_heartbeat() {
        let dir = tempdir().unwrap();
        let mut watcher = watcher();
        watcher
            .wait(Condition::dir_exists(dir.path()), &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(watcher.polls(), 1);
        assert!(watcher.progress().is_empty());
    }

    #[tokio::test]
    async fn test_init_error_fails_without_polling() {
        let dir = tempdir().unwrap();
        let mut watcher = watcher();
        let err = watcher
            .wait(
                Condition::file_updated(dir.path().join("missing")),
                &ExecutionContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Init(ConditionError::NotFound { .. })));
        assert_eq!(watcher.state(), WatchState::Failed);
        assert_eq!(watcher.polls(), 0);
    }

    #[tokio::test]
    async fn test_check_error_aborts_without_notifying() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("told");

        let mut watcher = watcher();
        let err = watcher
            .run(Condition::command_succeeds("exit 1"), &notify_into(&marker))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WatchError::Check(ConditionError::UnexpectedExit { .. })
        ));
        assert_eq!(watcher.state(), WatchState::Failed);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_run_notifies_exactly_once() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("told");

        let mut watcher = watcher();
        watcher
            .run(
                Condition::command_exited("sleep 0.1", None),
                &notify_into(&marker),
            )
            .await
            .unwrap();

        assert_eq!(watcher.state(), WatchState::Finalized);
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "told\n");
    }

    #[tokio::test]
    async fn test_run_without_notifier_fails_after_satisfied() {
        let dir = tempdir().unwrap();
        let mut watcher = watcher();
        let err = watcher
            .run(
                Condition::file_removed(dir.path().join("never-existed")),
                &ExecutionContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Notify(NotifyError::NotConfigured)));
        assert_eq!(watcher.state(), WatchState::Failed);
    }

    #[tokio::test]
    async fn test_still_waiting_updates_do_not_disturb_polling() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("late");

        let writer = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            std::fs::create_dir(writer).unwrap();
        });

        let mut watcher = watcher().with_update_every(Some(Duration::ZERO));
        watcher
            .wait(Condition::dir_exists(&path), &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(watcher.state(), WatchState::Satisfied);
    }

    #[tokio::test]
    async fn test_broken_progress_sink_is_fatal() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let dir = tempdir().unwrap();
        let mut watcher = Watcher::new(Broken).with_poll_interval(Duration::from_millis(1));
        let err = watcher
            .wait(
                Condition::file_exists(dir.path().join("never")),
                &ExecutionContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Progress(_)));
        assert_eq!(watcher.state(), WatchState::Failed);
    }
}
