//! Command-line surface: argument parsing, config overrides, and result
//! headers.
//!
//! The binary stays thin; everything here translates between the CLI and
//! the core library types.

use chrono::{DateTime, Local};
use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::config::SshConfig;
use crate::expr::EvalError;
use crate::pipeline::PipelineError;
use crate::ssh::{PrintError, PrintMode, SshError, SshResult};

/// Run a command across matching fleet instances over SSH.
#[derive(Debug, Parser)]
#[command(
    name = "triton-pssh",
    about = "Run a command in parallel over a Triton compute fleet",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Login user for every instance (default: the image's default_user
    /// tag).
    #[arg(short = 'u', long, value_name = "USER")]
    pub user: Option<String>,
    /// SSH port on the instances.
    #[arg(short = 'P', long, value_name = "PORT")]
    pub port: Option<u16>,
    /// Bastion host address for privately networked instances.
    #[arg(short = 'b', long, value_name = "HOST")]
    pub bastion: Option<String>,
    /// Login user on the bastion host.
    #[arg(short = 'U', long, value_name = "USER")]
    pub bastion_user: Option<String>,
    /// SSH port on the bastion host.
    #[arg(long, value_name = "PORT")]
    pub bastion_port: Option<u16>,
    /// TCP dial timeout in seconds.
    #[arg(short = 'T', long, value_name = "SECONDS")]
    pub timeout: Option<f64>,
    /// Whole-session bound in seconds (0 disables it).
    #[arg(short = 't', long, value_name = "SECONDS")]
    pub deadline: Option<f64>,
    /// Number of concurrent SSH sessions.
    #[arg(short = 'p', long, value_name = "N")]
    pub parallel: Option<usize>,
    /// Buffer remote output and print it after each host completes.
    #[arg(short = 'i', long)]
    pub inline: bool,
    /// Keep remote stderr separate instead of merging it into stdout.
    #[arg(long)]
    pub inline_stdout_only: bool,
    /// Directory receiving per-host stdout files.
    #[arg(short = 'o', long, value_name = "DIR")]
    pub outdir: Option<String>,
    /// Directory receiving per-host stderr files.
    #[arg(short = 'e', long, value_name = "DIR")]
    pub errdir: Option<String>,
    /// Fallback login user.
    #[arg(long, value_name = "USER")]
    pub default_user: Option<String>,
    /// Additional private key files, tried in order.
    #[arg(short = 'I', long = "identity", value_name = "FILE")]
    pub identities: Vec<String>,
    /// Skip the on-disk metadata cache.
    #[arg(long)]
    pub no_cache: bool,
    /// Evaluate the pipeline without opening SSH connections.
    #[arg(long)]
    pub dry_run: bool,
    /// Print the equivalent command line instead of executing.
    #[arg(long, value_enum, value_name = "MODE")]
    pub print: Option<PrintArg>,
    /// Filter expression and remote command, separated by `:::`.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "FILTER ::: COMMAND"
    )]
    pub args: Vec<String>,
}

/// Print-mode flag values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PrintArg {
    Ssh,
    Scp,
    Rsync,
}

impl From<PrintArg> for PrintMode {
    fn from(value: PrintArg) -> Self {
        match value {
            PrintArg::Ssh => Self::Ssh,
            PrintArg::Scp => Self::Scp,
            PrintArg::Rsync => Self::Rsync,
        }
    }
}

/// Errors surfaced by the binary.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    Config(String),
    /// The positional arguments held no remote command.
    #[error("empty command")]
    EmptyCommand,
    /// The filter expression failed to parse or evaluate.
    #[error("filter error: {0}")]
    Filter(#[from] EvalError),
    /// Instance enumeration failed.
    #[error("enumeration error: {0}")]
    Pipeline(#[from] PipelineError),
    /// Job construction or submission failed.
    #[error("ssh error: {0}")]
    Ssh(#[from] SshError),
    /// A print-mode rendering failed.
    #[error("print error: {0}")]
    Print(#[from] PrintError),
    /// Stdin staging failed.
    #[error("cannot stage stdin: {0}")]
    Stdin(String),
}

impl Cli {
    /// Applies CLI overrides on top of the layered configuration.
    pub fn apply_to(&self, config: &mut SshConfig) {
        if let Some(user) = &self.user {
            config.user = user.clone();
        }
        if let Some(port) = self.port {
            config.server_port = port;
        }
        if let Some(bastion) = &self.bastion {
            config.bastion_address = bastion.clone();
        }
        if let Some(bastion_user) = &self.bastion_user {
            config.bastion_user = bastion_user.clone();
        }
        if let Some(bastion_port) = self.bastion_port {
            config.bastion_port = bastion_port;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        if let Some(deadline) = self.deadline {
            config.deadline_secs = deadline;
        }
        if let Some(parallel) = self.parallel {
            config.parallelism = parallel.max(1);
        }
        if self.inline {
            config.inline_output = true;
        }
        if self.inline_stdout_only {
            config.inline_stdout_only = true;
        }
        if let Some(outdir) = &self.outdir {
            config.out_directory = outdir.clone();
        }
        if let Some(errdir) = &self.errdir {
            config.err_directory = errdir.clone();
        }
        if let Some(default_user) = &self.default_user {
            config.default_user = default_user.clone();
        }
        if self.dry_run {
            config.dry_run = true;
        }
    }
}

/// Splits the positional arguments into the filter expression and the
/// remote command at the `:::` separator. An absent or empty filter means
/// `true`.
///
/// # Errors
///
/// Returns [`CliError::EmptyCommand`] when nothing follows the separator.
pub fn split_filter_and_command(args: &[String]) -> Result<(String, Vec<String>), CliError> {
    let (filter_words, command) = match args.iter().position(|word| word == ":::") {
        Some(index) => (&args[..index], args[index + 1..].to_vec()),
        None => (args, Vec::new()),
    };

    if command.is_empty() {
        return Err(CliError::EmptyCommand);
    }

    let filter = filter_words.join(" ").trim().to_owned();
    let filter = if filter.is_empty() {
        String::from("true")
    } else {
        filter
    };
    Ok((filter, command))
}

/// Formats the per-host result header printed in completion order.
#[must_use]
pub fn format_result_header(count: usize, result: &SshResult) -> String {
    let time = DateTime::<Local>::from(result.finished_at).format("%H:%M:%S");
    let who = format!(
        "{} {}@{}",
        result.instance_id, result.user, result.instance_name
    );
    match &result.status {
        Ok(()) => format!("[{count}] {time} [SUCCESS] {who}"),
        Err(error @ SshError::Remote {
            exit_status,
            signal,
        }) => {
            let mut line =
                format!("[{count}] {time} [FAILURE] {who} {error}, returning {exit_status}");
            if let Some(signal) = signal {
                line.push_str(&format!(", signaled with {signal}"));
            }
            line
        }
        Err(error) => {
            format!(
                "[{count}] {time} [FAILURE] {who} [{}] {error}",
                error.kind()
            )
        }
    }
}
