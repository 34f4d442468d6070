/// Filesystem conditions: a path appearing, disappearing, or having its
/// modification time change.
use super::ConditionError;
use crate::context::ExecutionContext;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Stat `path`, mapping "not found" to `None` and anything else to a fatal error.
fn stat(path: &Path) -> Result<Option<std::fs::Metadata>, ConditionError> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConditionError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn modified(path: &Path, meta: &std::fs::Metadata) -> Result<SystemTime, ConditionError> {
    meta.modified().map_err(|e| ConditionError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Satisfied once the path exists. Directory watches additionally require
/// the path to be a directory; a plain file at that path is "not yet".
#[derive(Debug, Clone)]
pub struct ExistsCondition {
    path: PathBuf,
    require_dir: bool,
    exists: bool,
}

impl ExistsCondition {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            require_dir: false,
            exists: false,
        }
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            require_dir: true,
            exists: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn check(mut self, _ctx: &ExecutionContext) -> Result<(Self, bool), ConditionError> {
        if self.exists {
            return Ok((self, true));
        }

        let Some(meta) = stat(&self.path)? else {
            return Ok((self, false));
        };

        if self.require_dir && !meta.is_dir() {
            return Ok((self, false));
        }

        tracing::debug!(path = %self.path.display(), "path exists");
        self.exists = true;
        Ok((self, true))
    }
}

/// Satisfied once a stat of the path reports "not found".
#[derive(Debug, Clone)]
pub struct RemovedCondition {
    path: PathBuf,
    removed: bool,
}

impl RemovedCondition {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn check(mut self, _ctx: &ExecutionContext) -> Result<(Self, bool), ConditionError> {
        if self.removed {
            return Ok((self, true));
        }

        if stat(&self.path)?.is_some() {
            return Ok((self, false));
        }

        tracing::debug!(path = %self.path.display(), "path removed");
        self.removed = true;
        Ok((self, true))
    }
}

/// Satisfied once the modification time differs from the one captured at
/// `init`. Any difference counts, including a timestamp moving backwards.
///
/// If the target is deleted and recreated with an identical modification
/// time, no change is seen. While the target is absent the check reports
/// "not yet" rather than failing.
#[derive(Debug, Clone)]
pub struct UpdatedCondition {
    path: PathBuf,
    baseline: Option<SystemTime>,
    changed: bool,
}

impl UpdatedCondition {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            baseline: None,
            changed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Capture the baseline modification time. The target must already exist.
    pub fn init(mut self, _ctx: &ExecutionContext) -> Result<Self, ConditionError> {
        let meta = stat(&self.path)?.ok_or_else(|| ConditionError::NotFound {
            path: self.path.clone(),
        })?;
        let mtime = modified(&self.path, &meta)?;
        tracing::debug!(path = %self.path.display(), ?mtime, "captured baseline mtime");
        self.baseline = Some(mtime);
        Ok(self)
    }

    pub fn check(mut self, ctx: &ExecutionContext) -> Result<(Self, bool), ConditionError> {
        if self.changed {
            return Ok((self, true));
        }

        let Some(baseline) = self.baseline else {
            return Err(ConditionError::NotInitialized {
                condition: format!("updated {}", self.path.display()),
            });
        };

        let Some(meta) = stat(&self.path)? else {
            if ctx.verbose {
                tracing::debug!(path = %self.path.display(), "target absent, waiting for it to return");
            }
            return Ok((self, false));
        };

        let current = modified(&self.path, &meta)?;
        if ctx.verbose {
            tracing::debug!(
                path = %self.path.display(),
                prev = ?baseline,
                curr = ?current,
                "comparing mtime"
            );
        }

        let changed = current != baseline;
        self.changed = changed;
        Ok((self, changed))
    }
}
