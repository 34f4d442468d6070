/// Execution context threaded through every condition lifecycle call.
///
/// Built once from the resolved `Config` and passed by reference into
/// `Condition::init`, `Condition::check` and the finalize action. Nothing
/// else in the process holds mutable global state.
use std::fmt;
use std::path::PathBuf;

/// How the user asked to be told that the condition was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notifier {
    /// Run a shell command and wait for it.
    Command(String),
    /// GET a URL. Parsed and validated, not yet implemented.
    HttpGet { url: String },
    /// POST a file body to a URL. Parsed and validated, not yet implemented.
    HttpPost { url: String, body: Option<PathBuf> },
}

impl fmt::Display for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notifier::Command(cmd) => write!(f, "running `{cmd}`"),
            Notifier::HttpGet { url } => write!(f, "HTTP GET {url}"),
            Notifier::HttpPost { url, body: None } => write!(f, "HTTP POST {url}"),
            Notifier::HttpPost {
                url,
                body: Some(body),
            } => write!(f, "HTTP POST {url} with {}", body.display()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Emit per-poll diagnostics from inside conditions.
    pub verbose: bool,
    pub notifier: Option<Notifier>,
}

impl ExecutionContext {
    pub fn new(verbose: bool, notifier: Option<Notifier>) -> Self {
        Self { verbose, notifier }
    }
}
