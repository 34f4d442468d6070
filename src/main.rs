mod condition;
mod config;
mod context;
mod notify;
mod watch;

use clap::{Parser, Subcommand};
use config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use watch::Watcher;

const EXAMPLES: &str = "\
EXAMPLES:
    tellmewhen --command-exits='curl -O https://someho.st/some-large-package.bz2' \\
               --tellme-via-running=\"zenity --info --text='done'\"
    tellmewhen --file-exists=build/output.tar --tellme-via-running='notify-send built'
    tellmewhen --socket-can-connect=localhost:5432 --tellme-via-running='echo db is up'
    tellmewhen process-fails 'make test' --tellme-via-running='say tests broke'";

/// Tell me when something has happened: block until a file, directory,
/// process or socket reaches the requested state, then run a command.
#[derive(Parser, Debug)]
#[command(name = "tellmewhen", version, about, after_help = EXAMPLES)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Seconds between "still waiting" updates, 0 to disable (default: from config, else 60)
    #[arg(long, value_name = "SECONDS", global = true)]
    update_every: Option<u64>,

    /// Load configuration from a JSON file; flags override its values
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Print the resolved configuration as JSON and exit
    #[arg(long, global = true)]
    print_config: bool,

    /// Extra logging (per-poll diagnostics)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Wait for a file to exist
    #[arg(long, value_name = "PATH", help_heading = "File conditions")]
    file_exists: Option<PathBuf>,

    /// Wait for a file to be removed
    #[arg(long, value_name = "PATH", help_heading = "File conditions")]
    file_removed: Option<PathBuf>,

    /// Wait for a file's modification time to change
    #[arg(long, value_name = "PATH", help_heading = "File conditions")]
    file_updated: Option<PathBuf>,

    /// Wait for a directory to exist
    #[arg(long, value_name = "PATH", help_heading = "File conditions")]
    dir_exists: Option<PathBuf>,

    /// Wait for a directory to be removed
    #[arg(long, value_name = "PATH", help_heading = "File conditions")]
    dir_removed: Option<PathBuf>,

    /// Wait for a directory's modification time to change
    #[arg(long, value_name = "PATH", help_heading = "File conditions")]
    dir_updated: Option<PathBuf>,

    /// Wait for an existing process to exit
    #[arg(
        long,
        value_name = "PID",
        visible_alias = "pid-exits",
        allow_negative_numbers = true,
        help_heading = "Process conditions"
    )]
    pid: Option<i32>,

    /// Run CMD and wait for it to exit
    #[arg(long, value_name = "CMD", help_heading = "Process conditions")]
    command_exits: Option<String>,

    /// With --command-exits: require this exit status
    #[arg(
        long,
        value_name = "NUM",
        allow_negative_numbers = true,
        help_heading = "Process conditions"
    )]
    with_status: Option<i32>,

    /// Run CMD to completion; done if it exits 0, error otherwise
    #[arg(long, value_name = "CMD", help_heading = "Process conditions")]
    command_succeeds: Option<String>,

    /// Run CMD and wait for it to exit non-zero; a zero exit is an error
    #[arg(long, value_name = "CMD", help_heading = "Process conditions")]
    command_fails: Option<String>,

    /// Wait until a TCP connection to HOST:PORT is accepted
    #[arg(
        long,
        value_name = "HOST:PORT",
        visible_alias = "socket-connect",
        help_heading = "Socket conditions"
    )]
    socket_can_connect: Option<String>,

    /// Wait for an HTTP HEAD to return 200 (not implemented)
    #[arg(long, value_name = "HOST:PORT", help_heading = "Socket conditions")]
    http_head_ok: Option<String>,

    /// Wait for an HTTPS HEAD to return 200 (not implemented)
    #[arg(long, value_name = "HOST:PORT", help_heading = "Socket conditions")]
    https_head_ok: Option<String>,

    /// Run CMD once the condition is met
    #[arg(
        long,
        value_name = "CMD",
        visible_alias = "notify-by-running",
        global = true,
        help_heading = "Notification"
    )]
    tellme_via_running: Option<String>,

    /// GET URL once the condition is met (not implemented)
    #[arg(long, value_name = "URL", global = true, help_heading = "Notification")]
    tellme_via_http_get: Option<String>,

    /// POST to URL once the condition is met (not implemented)
    #[arg(long, value_name = "URL", global = true, help_heading = "Notification")]
    tellme_via_http_post: Option<String>,

    /// With --tellme-via-http-post: file to send as the body
    #[arg(long, value_name = "FILE", global = true, help_heading = "Notification")]
    post_body: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Run CMD to completion; done if it exits 0, error otherwise
    ProcessSucceeds {
        #[arg(value_name = "CMD")]
        command: String,
    },
    /// Run CMD and wait for it to exit non-zero
    ProcessFails {
        #[arg(value_name = "CMD")]
        command: String,
    },
}

impl Cli {
    /// The options given on the command line, as a config layer.
    fn overrides(&self) -> Config {
        let (process_succeeds, process_fails) = match &self.command {
            Some(Command::ProcessSucceeds { command }) => (Some(command.clone()), None),
            Some(Command::ProcessFails { command }) => (None, Some(command.clone())),
            None => (None, None),
        };

        Config {
            file_exists: self.file_exists.clone(),
            file_removed: self.file_removed.clone(),
            file_updated: self.file_updated.clone(),
            dir_exists: self.dir_exists.clone(),
            dir_removed: self.dir_removed.clone(),
            dir_updated: self.dir_updated.clone(),
            pid: self.pid,
            command_exits: self.command_exits.clone(),
            with_status: self.with_status,
            command_succeeds: process_succeeds.or_else(|| self.command_succeeds.clone()),
            command_fails: process_fails.or_else(|| self.command_fails.clone()),
            socket_can_connect: self.socket_can_connect.clone(),
            http_head_ok: self.http_head_ok.clone(),
            https_head_ok: self.https_head_ok.clone(),
            tellme_via_running: self.tellme_via_running.clone(),
            tellme_via_http_get: self.tellme_via_http_get.clone(),
            tellme_via_http_post: self.tellme_via_http_post.clone(),
            post_body: self.post_body.clone(),
            verbose: self.verbose,
            ..Default::default()
        }
    }

    /// Config file (if any) with command-line options layered on top.
    fn resolve_config(&self) -> Result<Config, config::ConfigError> {
        let base = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        let mut config = base.merge(self.overrides());
        if let Some(secs) = self.update_every {
            config.notify_every_seconds = secs;
        }
        Ok(config)
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.resolve_config()?;

    if cli.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    init_tracing(config.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let condition = config.condition()?;
    let ctx = config.context()?;
    if ctx.notifier.is_none() {
        tracing::warn!("no notification configured; waiting will end in an error");
    }

    tracing::info!(%condition, "waiting");
    let mut watcher = Watcher::stdout().with_update_every(config.update_every());
    let result = watcher.run(condition, &ctx).await;
    if result.is_err() {
        if watcher.polls() > 1 {
            // Finish the heartbeat line before the error lands on stderr.
            println!();
        }
        tracing::debug!(state = ?watcher.state(), polls = watcher.polls(), "watch stopped");
    }
    result.map_err(Into::into)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tellmewhen: {e}");
            ExitCode::FAILURE
        }
    }
}
