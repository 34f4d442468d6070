/// Process conditions: an external pid going away, or a command we start
/// ourselves exiting (with any status, a specific status, success, or failure).
///
/// Watched commands run under `sh -c` with inherited stdio. A background task
/// awaits each child and hands its exit status over a oneshot channel;
/// `check` polls that channel without blocking and, if nothing has arrived,
/// falls back to a liveness probe and an explicit reap.
use super::ConditionError;
use crate::context::ExecutionContext;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tokio::process::Command;
use tokio::sync::oneshot::{self, error::TryRecvError};

/// Build `sh -c <command>` with stdio inherited from the watcher.
pub(crate) fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

/// Outcome of a zero-signal liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Gone,
}

/// Send the null signal to `pid`. EPERM means the process exists but is not
/// ours to signal, so it counts as alive. Zombies also count as alive until
/// somebody reaps them.
pub fn probe(pid: Pid) -> Result<Liveness, ConditionError> {
    match kill(pid, None) {
        Ok(()) => Ok(Liveness::Alive),
        Err(Errno::ESRCH) => Ok(Liveness::Gone),
        Err(Errno::EPERM) => Ok(Liveness::Alive),
        Err(e) => Err(ConditionError::Probe { pid, source: e }),
    }
}

/// Result of a non-blocking reap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaped {
    Exited(ExitStatus),
    Running,
    /// ECHILD: somebody else (the completion task) already collected it.
    AlreadyReaped,
}

pub fn reap(pid: Pid) -> Result<Reaped, ConditionError> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => {
            Ok(Reaped::Exited(ExitStatus::from_raw((code & 0xff) << 8)))
        }
        Ok(WaitStatus::Signaled(_, signal, _)) => {
            Ok(Reaped::Exited(ExitStatus::from_raw(signal as i32)))
        }
        Ok(_) => Ok(Reaped::Running),
        Err(Errno::ECHILD) => Ok(Reaped::AlreadyReaped),
        Err(e) => Err(ConditionError::Reap { pid, source: e }),
    }
}

/// A started command plus the receiving end of its completion channel.
#[derive(Debug)]
pub struct CommandHandle {
    pid: Pid,
    completion: oneshot::Receiver<io::Result<ExitStatus>>,
}

impl CommandHandle {
    /// Start `sh -c <command>` and a task that waits for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(command: &str) -> Result<Self, ConditionError> {
        let mut child = shell_command(command)
            .spawn()
            .map_err(|e| ConditionError::Launch {
                command: command.to_string(),
                source: e,
            })?;

        let raw_pid = child.id().ok_or_else(|| ConditionError::Launch {
            command: command.to_string(),
            source: io::Error::other("child has no pid"),
        })?;

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = child.wait().await;
            tracing::debug!(pid = raw_pid, ?result, "watched command finished");
            let _ = tx.send(result);
        });

        Ok(Self {
            pid: Pid::from_raw(raw_pid as i32),
            completion: rx,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Non-blocking: the exit status if the completion task has delivered it.
    pub fn try_completed(&mut self) -> io::Result<Option<ExitStatus>> {
        match self.completion.try_recv() {
            Ok(result) => result.map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => Err(io::Error::other(
                "completion task ended without reporting a status",
            )),
        }
    }

    /// Wait for the completion task's result.
    pub async fn completed(&mut self) -> io::Result<ExitStatus> {
        match (&mut self.completion).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::other(
                "completion task ended without reporting a status",
            )),
        }
    }
}

/// Which exits satisfy a command condition. Any other exit is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitExpectation {
    Any,
    Status(i32),
    Success,
    Failure,
}

impl ExitExpectation {
    pub fn accepts(&self, status: &ExitStatus) -> bool {
        match self {
            ExitExpectation::Any => true,
            ExitExpectation::Status(code) => status.code() == Some(*code),
            ExitExpectation::Success => status.success(),
            ExitExpectation::Failure => !status.success(),
        }
    }
}

impl fmt::Display for ExitExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitExpectation::Any => write!(f, "any exit"),
            ExitExpectation::Status(code) => write!(f, "exit status {code}"),
            ExitExpectation::Success => write!(f, "a zero exit status"),
            ExitExpectation::Failure => write!(f, "a non-zero exit status"),
        }
    }
}

/// Satisfied when a pid we did not start stops existing. Its exit status is
/// not observable: only a parent can reap.
#[derive(Debug, Clone)]
pub struct PidExitedCondition {
    pid: Pid,
    exited: bool,
}

impl PidExitedCondition {
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
            exited: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn check(mut self, ctx: &ExecutionContext) -> Result<(Self, bool), ConditionError> {
        if self.exited {
            return Ok((self, true));
        }

        let liveness = probe(self.pid)?;
        if ctx.verbose {
            tracing::debug!(pid = %self.pid, ?liveness, "probed pid");
        }

        let exited = liveness == Liveness::Gone;
        self.exited = exited;
        Ok((self, exited))
    }
}

#[derive(Debug)]
enum CommandState {
    Pending,
    Running(CommandHandle),
    Exited(ExitStatus),
}

/// A command started at `init` and polled until it exits. Used for both
/// `command-exits` (optionally with an expected status) and `command-fails`.
#[derive(Debug)]
pub struct WatchedCommandCondition {
    command: String,
    expected: ExitExpectation,
    state: CommandState,
}

impl WatchedCommandCondition {
    pub fn new(command: impl Into<String>, expected: ExitExpectation) -> Self {
        Self {
            command: command.into(),
            expected,
            state: CommandState::Pending,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    #[cfg(test)]
    pub fn expected(&self) -> ExitExpectation {
        self.expected
    }

    /// Pid of the running command, if it has been started and not yet reaped.
    #[cfg(test)]
    pub fn pid(&self) -> Option<Pid> {
        match &self.state {
            CommandState::Running(handle) => Some(handle.pid()),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self.state {
            CommandState::Exited(status) => Some(status),
            _ => None,
        }
    }

    /// Start the command. Calling this again on a started command is a no-op.
    pub async fn init(mut self, _ctx: &ExecutionContext) -> Result<Self, ConditionError> {
        if !matches!(self.state, CommandState::Pending) {
            return Ok(self);
        }

        let handle = CommandHandle::spawn(&self.command)?;
        tracing::info!(command = %self.command, pid = %handle.pid(), "started watched command");
        self.state = CommandState::Running(handle);
        Ok(self)
    }

    pub async fn check(mut self, ctx: &ExecutionContext) -> Result<(Self, bool), ConditionError> {
        let mut handle = match std::mem::replace(&mut self.state, CommandState::Pending) {
            CommandState::Exited(status) => {
                self.state = CommandState::Exited(status);
                return Ok((self, true));
            }
            CommandState::Pending => {
                return Err(ConditionError::NotInitialized {
                    condition: format!("command `{}`", self.command),
                });
            }
            CommandState::Running(handle) => handle,
        };

        match self.poll(&mut handle, ctx).await? {
            Some(status) => self.finish(status).map(|done| (done, true)),
            None => {
                self.state = CommandState::Running(handle);
                Ok((self, false))
            }
        }
    }

    /// Completion channel first, then the liveness probe, then reap.
    async fn poll(
        &self,
        handle: &mut CommandHandle,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExitStatus>, ConditionError> {
        let wait_err = |source| ConditionError::Wait {
            command: self.command.clone(),
            source,
        };

        if let Some(status) = handle.try_completed().map_err(wait_err)? {
            if ctx.verbose {
                tracing::debug!(pid = %handle.pid(), %status, "completion channel signaled");
            }
            return Ok(Some(status));
        }

        if probe(handle.pid())? == Liveness::Alive {
            return Ok(None);
        }

        match reap(handle.pid())? {
            Reaped::Exited(status) => {
                if ctx.verbose {
                    tracing::debug!(pid = %handle.pid(), %status, "reaped exited command");
                }
                Ok(Some(status))
            }
            Reaped::Running => Ok(None),
            Reaped::AlreadyReaped => {
                if ctx.verbose {
                    tracing::debug!(pid = %handle.pid(), "already reaped, collecting status");
                }
                handle.completed().await.map(Some).map_err(wait_err)
            }
        }
    }

    fn finish(mut self, status: ExitStatus) -> Result<Self, ConditionError> {
        tracing::info!(command = %self.command, %status, "watched command exited");
        if !self.expected.accepts(&status) {
            return Err(ConditionError::UnexpectedExit {
                command: self.command,
                status,
                expected: self.expected,
            });
        }
        self.state = CommandState::Exited(status);
        Ok(self)
    }
}

/// Runs the command to completion inside `check`. Zero exit satisfies the
/// condition; any other exit is fatal. There is no retry.
#[derive(Debug, Clone)]
pub struct CommandSucceedsCondition {
    command: String,
    succeeded: bool,
}

impl CommandSucceedsCondition {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            succeeded: false,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub async fn check(mut self, _ctx: &ExecutionContext) -> Result<(Self, bool), ConditionError> {
        if self.succeeded {
            return Ok((self, true));
        }

        let mut child = shell_command(&self.command)
            .spawn()
            .map_err(|e| ConditionError::Launch {
                command: self.command.clone(),
                source: e,
            })?;
        let status = child.wait().await.map_err(|e| ConditionError::Wait {
            command: self.command.clone(),
            source: e,
        })?;

        tracing::info!(command = %self.command, %status, "command finished");
        if !status.success() {
            return Err(ConditionError::UnexpectedExit {
                command: self.command,
                status,
                expected: ExitExpectation::Success,
            });
        }

        self.succeeded = true;
        Ok((self, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use std::time::Duration;

    fn ctx() -> ExecutionContext {
        ExecutionContext::default()
    }

    /// Poll until satisfied or an error, giving up after ~10s.
    async fn check_until_done(
        mut condition: WatchedCommandCondition,
    ) -> Result<WatchedCommandCondition, ConditionError> {
        for _ in 0..1000 {
            let (next, satisfied) = condition.check(&ctx()).await?;
            if satisfied {
                return Ok(next);
            }
            condition = next;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("command condition never resolved");
    }

    #[test]
    fn test_exit_expectation_accepts() {
        let ok = ExitStatus::from_raw(0);
        let three = ExitStatus::from_raw(3 << 8);
        let killed = ExitStatus::from_raw(Signal::SIGKILL as i32);

        assert!(ExitExpectation::Any.accepts(&ok));
        assert!(ExitExpectation::Any.accepts(&killed));
        assert!(ExitExpectation::Status(3).accepts(&three));
        assert!(!ExitExpectation::Status(3).accepts(&ok));
        assert!(!ExitExpectation::Status(9).accepts(&killed));
        assert!(ExitExpectation::Success.accepts(&ok));
        assert!(!ExitExpectation::Success.accepts(&three));
        assert!(ExitExpectation::Failure.accepts(&three));
        assert!(ExitExpectation::Failure.accepts(&killed));
        assert!(!ExitExpectation::Failure.accepts(&ok));
    }

    #[test]
    fn test_probe_own_process_is_alive() {
        let me = Pid::from_raw(std::process::id() as i32);
        assert_eq!(probe(me).unwrap(), Liveness::Alive);
    }

    #[test]
    fn test_probe_init_is_alive_even_without_permission() {
        // Either Ok (root) or EPERM (everyone else); both mean alive.
        assert_eq!(probe(Pid::from_raw(1)).unwrap(), Liveness::Alive);
    }

    #[test]
    fn test_reap_collects_zombie_then_reports_already_reaped() {
        let child = std::process::Command::new("sh")
            .args(["-c", "exit 7"])
            .spawn()
            .unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        let status = loop {
            match reap(pid).unwrap() {
                Reaped::Exited(status) => break status,
                Reaped::Running => std::thread::sleep(Duration::from_millis(10)),
                Reaped::AlreadyReaped => panic!("nobody else should have reaped"),
            }
        };
        assert_eq!(status.code(), Some(7));
        assert_eq!(reap(pid).unwrap(), Reaped::AlreadyReaped);
        assert_eq!(probe(pid).unwrap(), Liveness::Gone);
    }

    #[test]
    fn test_reap_non_child_is_already_reaped() {
        assert_eq!(reap(Pid::from_raw(1)).unwrap(), Reaped::AlreadyReaped);
    }

    #[test]
    fn test_pid_exited_after_kill_and_reap() {
        let mut child = std::process::Command::new("sleep")
            .arg("3600")
            .spawn()
            .unwrap();

        let condition = PidExitedCondition::new(child.id() as i32);
        let (condition, satisfied) = condition.check(&ctx()).unwrap();
        assert!(!satisfied);

        child.kill().unwrap();
        child.wait().unwrap();

        let (condition, satisfied) = condition.check(&ctx()).unwrap();
        assert!(satisfied);
        let (_, satisfied) = condition.check(&ctx()).unwrap();
        assert!(satisfied);
    }

    #[tokio::test]
    async fn test_command_exited_any_status() {
        let condition = WatchedCommandCondition::new("exit 5", ExitExpectation::Any)
            .init(&ctx())
            .await
            .unwrap();
        let done = check_until_done(condition).await.unwrap();
        assert_eq!(done.exit_status().and_then(|s| s.code()), Some(5));

        // Memoized: further checks stay satisfied.
        let (_, satisfied) = done.check(&ctx()).await.unwrap();
        assert!(satisfied);
    }

    #[tokio::test]
    async fn test_command_exited_with_expected_status() {
        let condition = WatchedCommandCondition::new("exit 3", ExitExpectation::Status(3))
            .init(&ctx())
            .await
            .unwrap();
        assert!(check_until_done(condition).await.is_ok());

        let condition = WatchedCommandCondition::new("exit 4", ExitExpectation::Status(3))
            .init(&ctx())
            .await
            .unwrap();
        let err = check_until_done(condition).await.unwrap_err();
        assert!(matches!(
            err,
            ConditionError::UnexpectedExit {
                expected: ExitExpectation::Status(3),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_command_fails_on_nonzero_exit() {
        let condition = WatchedCommandCondition::new("exit 1", ExitExpectation::Failure)
            .init(&ctx())
            .await
            .unwrap();
        let done = check_until_done(condition).await.unwrap();
        assert_eq!(done.exit_status().and_then(|s| s.code()), Some(1));
    }

    #[tokio::test]
    async fn test_command_fails_errors_on_success() {
        let condition = WatchedCommandCondition::new("true", ExitExpectation::Failure)
            .init(&ctx())
            .await
            .unwrap();
        let err = check_until_done(condition).await.unwrap_err();
        assert!(matches!(err, ConditionError::UnexpectedExit { .. }));
        assert!(err.to_string().contains("a non-zero exit status"));
    }

    #[tokio::test]
    async fn test_long_running_command_is_not_done_until_killed() {
        let condition = WatchedCommandCondition::new("exec sleep 3600", ExitExpectation::Failure)
            .init(&ctx())
            .await
            .unwrap();
        let pid = condition.pid().unwrap();

        let (condition, satisfied) = condition.check(&ctx()).await.unwrap();
        assert!(!satisfied);

        kill(pid, Signal::SIGKILL).unwrap();
        let done = check_until_done(condition).await.unwrap();
        assert_eq!(done.exit_status().and_then(|s| s.signal()), Some(9));
        assert!(done.pid().is_none());
    }

    #[tokio::test]
    async fn test_init_twice_does_not_respawn() {
        let condition = WatchedCommandCondition::new("exec sleep 3600", ExitExpectation::Any)
            .init(&ctx())
            .await
            .unwrap();
        let first = condition.pid().unwrap();
        let condition = condition.init(&ctx()).await.unwrap();
        assert_eq!(condition.pid(), Some(first));

        kill(first, Signal::SIGKILL).unwrap();
        check_until_done(condition).await.unwrap();
    }

    /// Wraps a child we own in a handle whose completion sender is returned to
    /// the caller, so the channel stays empty until the test fills it.
    fn handle_with_sender(
        child: &std::process::Child,
    ) -> (CommandHandle, oneshot::Sender<io::Result<ExitStatus>>) {
        let (tx, rx) = oneshot::channel();
        let handle = CommandHandle {
            pid: Pid::from_raw(child.id() as i32),
            completion: rx,
        };
        (handle, tx)
    }

    #[tokio::test]
    async fn test_poll_waits_on_unreaped_child_then_collects_late_status() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "exit 6"])
            .spawn()
            .unwrap();
        let (mut handle, tx) = handle_with_sender(&child);
        let condition = WatchedCommandCondition::new("exit 6", ExitExpectation::Any);

        // Running or a zombie, the pid still answers the probe.
        assert!(condition.poll(&mut handle, &ctx()).await.unwrap().is_none());

        // Reaped elsewhere; the status only reaches the channel afterwards.
        let status = child.wait().unwrap();
        assert_eq!(probe(handle.pid()).unwrap(), Liveness::Gone);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(Ok(status));
        });

        let collected = condition.poll(&mut handle, &ctx()).await.unwrap();
        assert_eq!(collected.and_then(|s| s.code()), Some(6));
    }

    #[tokio::test]
    async fn test_check_satisfied_through_reap_fallback() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "exit 2"])
            .spawn()
            .unwrap();
        let (handle, tx) = handle_with_sender(&child);
        let status = child.wait().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(Ok(status));
        });

        let condition = WatchedCommandCondition {
            command: "exit 2".to_string(),
            expected: ExitExpectation::Failure,
            state: CommandState::Running(handle),
        };
        let (done, satisfied) = condition.check(&ctx()).await.unwrap();
        assert!(satisfied);
        assert_eq!(done.exit_status().and_then(|s| s.code()), Some(2));
    }

    #[tokio::test]
    async fn test_poll_errors_when_completion_task_vanishes() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();
        let (mut handle, tx) = handle_with_sender(&child);
        child.wait().unwrap();
        drop(tx);

        let condition = WatchedCommandCondition::new("exit 0", ExitExpectation::Any);
        let err = condition.poll(&mut handle, &ctx()).await.unwrap_err();
        assert!(matches!(err, ConditionError::Wait { .. }));
    }

    #[tokio::test]
    async fn test_watched_command_check_before_init() {
        let err = WatchedCommandCondition::new("true", ExitExpectation::Any)
            .check(&ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ConditionError::NotInitialized { .. }));
    }

    #[tokio::test]
    async fn test_command_succeeds_on_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("runs.log");
        let cmd = format!("echo run >> {}", log.display());

        let (condition, satisfied) = CommandSucceedsCondition::new(cmd)
            .check(&ctx())
            .await
            .unwrap();
        assert!(satisfied);

        // Memoized: the command is not run a second time.
        let (_, satisfied) = condition.check(&ctx()).await.unwrap();
        assert!(satisfied);
        assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_command_succeeds_nonzero_exit_is_fatal() {
        let err = CommandSucceedsCondition::new("exit 2")
            .check(&ctx())
            .await
            .unwrap_err();
        match err {
            ConditionError::UnexpectedExit {
                status, expected, ..
            } => {
                assert_eq!(status.code(), Some(2));
                assert_eq!(expected, ExitExpectation::Success);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
