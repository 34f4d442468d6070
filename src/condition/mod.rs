//! Pollable predicates over external state.
//!
//! Every condition goes through the same two-step lifecycle: `init` once to
//! capture a baseline or start a background wait, then `check` repeatedly
//! until it reports satisfied. Both steps consume the condition and hand back
//! the updated value, so all progress state lives in the value itself.
//!
//! "Not yet" outcomes (path absent, connection refused, process alive) are
//! `Ok((_, false))`. Anything else that goes wrong is a `ConditionError` and
//! is fatal to the watch.

pub mod path;
pub mod process;
pub mod socket;

use crate::context::ExecutionContext;
use nix::errno::Errno;
use nix::unistd::Pid;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;

pub use path::{ExistsCondition, RemovedCondition, UpdatedCondition};
pub use process::{
    CommandSucceedsCondition, ExitExpectation, PidExitedCondition, WatchedCommandCondition,
};
pub use socket::SocketConnectCondition;

/// Errors that abort a watch.
#[derive(Debug)]
pub enum ConditionError {
    /// The target must exist before it can be watched for changes.
    NotFound { path: PathBuf },
    /// Stat failed for a reason other than absence.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The command could not be started.
    Launch {
        command: String,
        source: std::io::Error,
    },
    /// Waiting on a started command failed.
    Wait {
        command: String,
        source: std::io::Error,
    },
    /// The liveness probe failed with something other than "no such process".
    Probe { pid: Pid, source: Errno },
    /// Reaping an exited child failed with something other than ECHILD.
    Reap { pid: Pid, source: Errno },
    /// A TCP dial failed with something other than "connection refused".
    Connect {
        address: String,
        source: std::io::Error,
    },
    /// The command exited, but not the way the condition required.
    UnexpectedExit {
        command: String,
        status: ExitStatus,
        expected: ExitExpectation,
    },
    /// `check` was called on a condition that needs `init` first.
    NotInitialized { condition: String },
    /// The condition kind is reserved but has no implementation.
    Unsupported { condition: String },
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionError::NotFound { path } => {
                write!(f, "{} does not exist", path.display())
            }
            ConditionError::Io { path, source } => {
                write!(f, "failed to stat {}: {}", path.display(), source)
            }
            ConditionError::Launch { command, source } => {
                write!(f, "failed to launch `{}`: {}", command, source)
            }
            ConditionError::Wait { command, source } => {
                write!(f, "failed to wait for `{}`: {}", command, source)
            }
            ConditionError::Probe { pid, source } => {
                write!(f, "failed to probe pid {}: {}", pid, source)
            }
            ConditionError::Reap { pid, source } => {
                write!(f, "failed to reap pid {}: {}", pid, source)
            }
            ConditionError::Connect { address, source } => {
                write!(f, "failed to connect to {}: {}", address, source)
            }
            ConditionError::UnexpectedExit {
                command,
                status,
                expected,
            } => {
                write!(f, "`{}` {}, expected {}", command, status, expected)
            }
            ConditionError::NotInitialized { condition } => {
                write!(f, "{} was checked before it was initialized", condition)
            }
            ConditionError::Unsupported { condition } => {
                write!(f, "{} is not implemented", condition)
            }
        }
    }
}

impl std::error::Error for ConditionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConditionError::Io { source, .. } => Some(source),
            ConditionError::Launch { source, .. } => Some(source),
            ConditionError::Wait { source, .. } => Some(source),
            ConditionError::Probe { source, .. } => Some(source),
            ConditionError::Reap { source, .. } => Some(source),
            ConditionError::Connect { source, .. } => Some(source),
            ConditionError::NotFound { .. }
            | ConditionError::UnexpectedExit { .. }
            | ConditionError::NotInitialized { .. }
            | ConditionError::Unsupported { .. } => None,
        }
    }
}

/// The one thing a `tellmewhen` invocation waits for.
#[derive(Debug)]
pub enum Condition {
    FileExists(ExistsCondition),
    FileRemoved(RemovedCondition),
    FileUpdated(UpdatedCondition),
    DirExists(ExistsCondition),
    DirRemoved(RemovedCondition),
    DirUpdated(UpdatedCondition),
    PidExited(PidExitedCondition),
    CommandExited(WatchedCommandCondition),
    CommandSucceeds(CommandSucceedsCondition),
    CommandFails(WatchedCommandCondition),
    SocketConnect(SocketConnectCondition),
    /// Reserved: HEAD request over plain HTTP returns 200.
    HttpHeadOk(String),
    /// Reserved: HEAD request over HTTPS returns 200.
    HttpsHeadOk(String),
}

impl Condition {
    pub fn file_exists(path: impl Into<PathBuf>) -> Self {
        Condition::FileExists(ExistsCondition::file(path))
    }

    pub fn file_removed(path: impl Into<PathBuf>) -> Self {
        Condition::FileRemoved(RemovedCondition::new(path))
    }

    pub fn file_updated(path: impl Into<PathBuf>) -> Self {
        Condition::FileUpdated(UpdatedCondition::new(path))
    }

    pub fn dir_exists(path: impl Into<PathBuf>) -> Self {
        Condition::DirExists(ExistsCondition::dir(path))
    }

    pub fn dir_removed(path: impl Into<PathBuf>) -> Self {
        Condition::DirRemoved(RemovedCondition::new(path))
    }

    pub fn dir_updated(path: impl Into<PathBuf>) -> Self {
        Condition::DirUpdated(UpdatedCondition::new(path))
    }

    pub fn pid_exited(pid: i32) -> Self {
        Condition::PidExited(PidExitedCondition::new(pid))
    }

    pub fn command_exited(command: impl Into<String>, status: Option<i32>) -> Self {
        let expected = match status {
            Some(code) => ExitExpectation::Status(code),
            None => ExitExpectation::Any,
        };
        Condition::CommandExited(WatchedCommandCondition::new(command, expected))
    }

    pub fn command_succeeds(command: impl Into<String>) -> Self {
        Condition::CommandSucceeds(CommandSucceedsCondition::new(command))
    }

    pub fn command_fails(command: impl Into<String>) -> Self {
        Condition::CommandFails(WatchedCommandCondition::new(
            command,
            ExitExpectation::Failure,
        ))
    }

    pub fn socket_connect(address: impl Into<String>) -> Self {
        Condition::SocketConnect(SocketConnectCondition::new(address))
    }

    /// Flag-style name of the condition kind, e.g. `file-exists`.
    pub fn kind(&self) -> &'static str {
        match self {
            Condition::FileExists(_) => "file-exists",
            Condition::FileRemoved(_) => "file-removed",
            Condition::FileUpdated(_) => "file-updated",
            Condition::DirExists(_) => "dir-exists",
            Condition::DirRemoved(_) => "dir-removed",
            Condition::DirUpdated(_) => "dir-updated",
            Condition::PidExited(_) => "pid",
            Condition::CommandExited(_) => "command-exits",
            Condition::CommandSucceeds(_) => "command-succeeds",
            Condition::CommandFails(_) => "command-fails",
            Condition::SocketConnect(_) => "socket-can-connect",
            Condition::HttpHeadOk(_) => "http-head-ok",
            Condition::HttpsHeadOk(_) => "https-head-ok",
        }
    }

    /// One-time setup before polling starts.
    pub async fn init(self, ctx: &ExecutionContext) -> Result<Condition, ConditionError> {
        tracing::debug!(condition = %self, "initializing condition");
        match self {
            Condition::FileUpdated(c) => c.init(ctx).map(Condition::FileUpdated),
            Condition::DirUpdated(c) => c.init(ctx).map(Condition::DirUpdated),
            Condition::CommandExited(c) => c.init(ctx).await.map(Condition::CommandExited),
            Condition::CommandFails(c) => c.init(ctx).await.map(Condition::CommandFails),
            Condition::HttpHeadOk(_) | Condition::HttpsHeadOk(_) => {
                Err(ConditionError::Unsupported {
                    condition: self.to_string(),
                })
            }
            passive @ (Condition::FileExists(_)
            | Condition::FileRemoved(_)
            | Condition::DirExists(_)
            | Condition::DirRemoved(_)
            | Condition::PidExited(_)
            | Condition::CommandSucceeds(_)
            | Condition::SocketConnect(_)) => Ok(passive),
        }
    }

    /// Evaluate the condition once. Returns the updated condition and
    /// whether it is satisfied.
    pub async fn check(
        self,
        ctx: &ExecutionContext,
    ) -> Result<(Condition, bool), ConditionError> {
        match self {
            Condition::FileExists(c) => rewrap(c.check(ctx), Condition::FileExists),
            Condition::FileRemoved(c) => rewrap(c.check(ctx), Condition::FileRemoved),
            Condition::FileUpdated(c) => rewrap(c.check(ctx), Condition::FileUpdated),
            Condition::DirExists(c) => rewrap(c.check(ctx), Condition::DirExists),
            Condition::DirRemoved(c) => rewrap(c.check(ctx), Condition::DirRemoved),
            Condition::DirUpdated(c) => rewrap(c.check(ctx), Condition::DirUpdated),
            Condition::PidExited(c) => rewrap(c.check(ctx), Condition::PidExited),
            Condition::CommandExited(c) => rewrap(c.check(ctx).await, Condition::CommandExited),
            Condition::CommandSucceeds(c) => {
                rewrap(c.check(ctx).await, Condition::CommandSucceeds)
            }
            Condition::CommandFails(c) => rewrap(c.check(ctx).await, Condition::CommandFails),
            Condition::SocketConnect(c) => rewrap(c.check(ctx).await, Condition::SocketConnect),
            Condition::HttpHeadOk(_) | Condition::HttpsHeadOk(_) => {
                Err(ConditionError::Unsupported {
                    condition: self.to_string(),
                })
            }
        }
    }
}

fn rewrap<T>(
    result: Result<(T, bool), ConditionError>,
    wrap: fn(T) -> Condition,
) -> Result<(Condition, bool), ConditionError> {
    result.map(|(inner, satisfied)| (wrap(inner), satisfied))
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind();
        match self {
            Condition::FileExists(c) | Condition::DirExists(c) => {
                write!(f, "{kind} {}", c.path().display())
            }
            Condition::FileRemoved(c) | Condition::DirRemoved(c) => {
                write!(f, "{kind} {}", c.path().display())
            }
            Condition::FileUpdated(c) | Condition::DirUpdated(c) => {
                write!(f, "{kind} {}", c.path().display())
            }
            Condition::PidExited(c) => write!(f, "{kind} {}", c.pid()),
            Condition::CommandExited(c) | Condition::CommandFails(c) => {
                write!(f, "{kind} `{}`", c.command())
            }
            Condition::CommandSucceeds(c) => write!(f, "{kind} `{}`", c.command()),
            Condition::SocketConnect(c) => write!(f, "{kind} {}", c.address()),
            Condition::HttpHeadOk(target) | Condition::HttpsHeadOk(target) => {
                write!(f, "{kind} {target}")
            }
        }
    }
}
