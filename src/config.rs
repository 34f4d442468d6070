use crate::condition::Condition;
use crate::context::{ExecutionContext, Notifier};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Flat record of every recognized option.
///
/// Keys are the kebab-case flag names, so a JSON config file and the command
/// line speak the same vocabulary. Unknown keys are ignored and missing keys
/// take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    // File/directory conditions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_exists: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_removed: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_updated: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir_exists: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir_removed: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir_updated: Option<PathBuf>,

    // Process conditions
    #[serde(skip_serializing_if = "Option::is_none", alias = "pid-exits")]
    pub pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_exits: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_succeeds: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_fails: Option<String>,

    // Network conditions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_can_connect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_head_ok: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_head_ok: Option<String>,

    // Notification
    #[serde(
        skip_serializing_if = "Option::is_none",
        alias = "notify-by-running",
        alias = "notify-command"
    )]
    pub tellme_via_running: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "notify-url")]
    pub tellme_via_http_get: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tellme_via_http_post: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_body: Option<PathBuf>,

    /// Log periodic "still waiting" updates.
    pub notify: bool,
    /// Seconds between "still waiting" updates; 0 disables them.
    pub notify_every_seconds: u64,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file_exists: None,
            file_removed: None,
            file_updated: None,
            dir_exists: None,
            dir_removed: None,
            dir_updated: None,
            pid: None,
            command_exits: None,
            with_status: None,
            command_succeeds: None,
            command_fails: None,
            socket_can_connect: None,
            http_head_ok: None,
            https_head_ok: None,
            tellme_via_running: None,
            tellme_via_http_get: None,
            tellme_via_http_post: None,
            post_body: None,
            notify: true,
            notify_every_seconds: 60,
            verbose: false,
        }
    }
}

/// Errors produced while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Serialize { source: serde_json::Error },
    /// Nothing to wait on.
    NoCondition,
    /// Mutually exclusive options were combined.
    Conflict { options: Vec<&'static str> },
    Invalid { option: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Serialize { source } => {
                write!(f, "failed to serialize config: {}", source)
            }
            ConfigError::NoCondition => {
                write!(f, "you must specify something to wait on (see --help)")
            }
            ConfigError::Conflict { options } => {
                let flags: Vec<String> = options.iter().map(|o| format!("--{o}")).collect();
                write!(f, "only one of {} may be given", flags.join(", "))
            }
            ConfigError::Invalid { option, reason } => {
                write!(f, "invalid --{}: {}", option, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Serialize { source } => Some(source),
            ConfigError::NoCondition
            | ConfigError::Conflict { .. }
            | ConfigError::Invalid { .. } => None,
        }
    }
}

fn non_empty(option: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid {
            option,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn non_empty_path(option: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::Invalid {
            option,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

impl Config {
    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn from_json(json: &str) -> Result<Config, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize { source: e })
    }

    /// Layer `overrides` on top of `self`: every selector or notifier set in
    /// `overrides` wins. `notify` and `notify-every-seconds` keep this
    /// config's values; `verbose` is on if either side turns it on.
    pub fn merge(self, overrides: Config) -> Config {
        Config {
            file_exists: overrides.file_exists.or(self.file_exists),
            file_removed: overrides.file_removed.or(self.file_removed),
            file_updated: overrides.file_updated.or(self.file_updated),
            dir_exists: overrides.dir_exists.or(self.dir_exists),
            dir_removed: overrides.dir_removed.or(self.dir_removed),
            dir_updated: overrides.dir_updated.or(self.dir_updated),
            pid: overrides.pid.or(self.pid),
            command_exits: overrides.command_exits.or(self.command_exits),
            with_status: overrides.with_status.or(self.with_status),
            command_succeeds: overrides.command_succeeds.or(self.command_succeeds),
            command_fails: overrides.command_fails.or(self.command_fails),
            socket_can_connect: overrides.socket_can_connect.or(self.socket_can_connect),
            http_head_ok: overrides.http_head_ok.or(self.http_head_ok),
            https_head_ok: overrides.https_head_ok.or(self.https_head_ok),
            tellme_via_running: overrides.tellme_via_running.or(self.tellme_via_running),
            tellme_via_http_get: overrides.tellme_via_http_get.or(self.tellme_via_http_get),
            tellme_via_http_post: overrides.tellme_via_http_post.or(self.tellme_via_http_post),
            post_body: overrides.post_body.or(self.post_body),
            notify: self.notify,
            notify_every_seconds: self.notify_every_seconds,
            verbose: self.verbose || overrides.verbose,
        }
    }

    /// Pick the single condition to wait on.
    pub fn condition(&self) -> Result<Condition, ConfigError> {
        let mut selected: Vec<(&'static str, Condition)> = Vec::new();

        if let Some(path) = &self.file_exists {
            non_empty_path("file-exists", path)?;
            selected.push(("file-exists", Condition::file_exists(path)));
        }
        if let Some(path) = &self.file_removed {
            non_empty_path("file-removed", path)?;
            selected.push(("file-removed", Condition::file_removed(path)));
        }
        if let Some(path) = &self.file_updated {
            non_empty_path("file-updated", path)?;
            selected.push(("file-updated", Condition::file_updated(path)));
        }
        if let Some(path) = &self.dir_exists {
            non_empty_path("dir-exists", path)?;
            selected.push(("dir-exists", Condition::dir_exists(path)));
        }
        if let Some(path) = &self.dir_removed {
            non_empty_path("dir-removed", path)?;
            selected.push(("dir-removed", Condition::dir_removed(path)));
        }
        if let Some(path) = &self.dir_updated {
            non_empty_path("dir-updated", path)?;
            selected.push(("dir-updated", Condition::dir_updated(path)));
        }
        if let Some(pid) = self.pid {
            // 0 and negative pids address process groups when signalled.
            if pid <= 0 {
                return Err(ConfigError::Invalid {
                    option: "pid",
                    reason: format!("{pid} is not a process id"),
                });
            }
            selected.push(("pid", Condition::pid_exited(pid)));
        }
        if let Some(cmd) = &self.command_exits {
            non_empty("command-exits", cmd)?;
            if let Some(status) = self.with_status {
                if !(0..=255).contains(&status) {
                    return Err(ConfigError::Invalid {
                        option: "with-status",
                        reason: format!("{status} is not an exit status (0-255)"),
                    });
                }
            }
            selected.push((
                "command-exits",
                Condition::command_exited(cmd, self.with_status),
            ));
        } else if self.with_status.is_some() {
            return Err(ConfigError::Invalid {
                option: "with-status",
                reason: "only applies to --command-exits".to_string(),
            });
        }
        if let Some(cmd) = &self.command_succeeds {
            non_empty("command-succeeds", cmd)?;
            selected.push(("command-succeeds", Condition::command_succeeds(cmd)));
        }
        if let Some(cmd) = &self.command_fails {
            non_empty("command-fails", cmd)?;
            selected.push(("command-fails", Condition::command_fails(cmd)));
        }
        if let Some(addr) = &self.socket_can_connect {
            non_empty("socket-can-connect", addr)?;
            selected.push(("socket-can-connect", Condition::socket_connect(addr)));
        }
        if let Some(target) = &self.http_head_ok {
            selected.push(("http-head-ok", Condition::HttpHeadOk(target.clone())));
        }
        if let Some(target) = &self.https_head_ok {
            selected.push(("https-head-ok", Condition::HttpsHeadOk(target.clone())));
        }

        match selected.len() {
            0 => Err(ConfigError::NoCondition),
            1 => Ok(selected.remove(0).1),
            _ => Err(ConfigError::Conflict {
                options: selected.into_iter().map(|(name, _)| name).collect(),
            }),
        }
    }

    /// Pick the notifier, if one was configured.
    pub fn notifier(&self) -> Result<Option<Notifier>, ConfigError> {
        let mut selected: Vec<(&'static str, Notifier)> = Vec::new();

        if let Some(cmd) = &self.tellme_via_running {
            non_empty("tellme-via-running", cmd)?;
            selected.push(("tellme-via-running", Notifier::Command(cmd.clone())));
        }
        if let Some(url) = &self.tellme_via_http_get {
            non_empty("tellme-via-http-get", url)?;
            selected.push((
                "tellme-via-http-get",
                Notifier::HttpGet { url: url.clone() },
            ));
        }
        if let Some(url) = &self.tellme_via_http_post {
            non_empty("tellme-via-http-post", url)?;
            selected.push((
                "tellme-via-http-post",
                Notifier::HttpPost {
                    url: url.clone(),
                    body: self.post_body.clone(),
                },
            ));
        } else if self.post_body.is_some() {
            return Err(ConfigError::Invalid {
                option: "post-body",
                reason: "only applies to --tellme-via-http-post".to_string(),
            });
        }

        match selected.len() {
            0 => Ok(None),
            1 => Ok(Some(selected.remove(0).1)),
            _ => Err(ConfigError::Conflict {
                options: selected.into_iter().map(|(name, _)| name).collect(),
            }),
        }
    }

    pub fn context(&self) -> Result<ExecutionContext, ConfigError> {
        Ok(ExecutionContext::new(self.verbose, self.notifier()?))
    }

    /// Interval for "still waiting" updates, if enabled.
    pub fn update_every(&self) -> Option<std::time::Duration> {
        if self.notify && self.notify_every_seconds > 0 {
            Some(std::time::Duration::from_secs(self.notify_every_seconds))
        } else {
            None
        }
    }
}
