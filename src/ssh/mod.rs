//! Parallel SSH fan-out executor.
//!
//! A fixed pool of workers consumes [`SshJob`]s from a bounded channel.
//! Each job dials its target directly or tunnels through a bastion via an
//! SSH `direct-tcpip` channel, runs the remote command with the configured
//! stdin/stdout/stderr disposition, and delivers exactly one [`SshResult`]
//! on the job's oneshot channel. Workers never abort the pool: every
//! failure is carried in the result's status.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;
use std::time::SystemTime;

use camino::Utf8PathBuf;
use russh::keys::ssh_key;
use russh::{ChannelMsg, Pty, Sig, client};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::SshConfig;
use crate::metadata::{ImageCache, NetworkCache, default_user};
use crate::provider::Instance;

pub mod auth;
pub mod print;

pub use auth::AuthMethod;
pub use print::{PrintError, PrintMode};

static CLIENT_CONFIG: LazyLock<Arc<client::Config>> =
    LazyLock::new(|| Arc::new(client::Config::default()));

/// Errors raised while building or executing SSH jobs.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// The session has been closed; no further jobs are accepted.
    #[error("ssh session is closed")]
    Closed,
    /// An endpoint string did not split into host and port.
    #[error("cannot get host:port from {endpoint}")]
    Endpoint {
        /// Offending endpoint string.
        endpoint: String,
    },
    /// TCP dial failure or dial timeout.
    #[error("cannot connect to {endpoint}: {message}")]
    Connect {
        /// Endpoint being dialed.
        endpoint: String,
        /// Description of the failure.
        message: String,
    },
    /// SSH transport handshake failure.
    #[error("ssh handshake with {endpoint} failed: {message}")]
    Handshake {
        /// Endpoint being negotiated with.
        endpoint: String,
        /// Description of the failure.
        message: String,
    },
    /// Every configured authentication method was rejected.
    #[error("authentication failed for {user}@{endpoint}")]
    Auth {
        /// Login user attempted.
        user: String,
        /// Endpoint that rejected the user.
        endpoint: String,
    },
    /// Opening the direct-tcpip channel through the bastion failed.
    #[error("cannot open tunnel to {endpoint}: {message}")]
    Tunnel {
        /// Inner endpoint the tunnel targets.
        endpoint: String,
        /// Description of the failure.
        message: String,
    },
    /// Session-channel or exec plumbing failure.
    #[error("ssh session failed: {message}")]
    Session {
        /// Description of the failure.
        message: String,
    },
    /// The PTY request was rejected.
    #[error("pty request failed: {message}")]
    Pty {
        /// Description of the failure.
        message: String,
    },
    /// A per-host output file could not be created.
    #[error("cannot create a file {path}: {message}")]
    OutputFile {
        /// Path that could not be created.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// The stdin source could not be opened.
    #[error("cannot open input file {path}: {message}")]
    Input {
        /// Path that could not be opened.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// The instance is only privately networked and no bastion is
    /// configured.
    #[error("cannot connect to the instance({name}) without bastion server")]
    MissingBastion {
        /// Instance name.
        name: String,
    },
    /// The remote command exited non-zero or was killed by a signal.
    #[error("remote command exited with status {exit_status}")]
    Remote {
        /// Remote exit status.
        exit_status: u32,
        /// Signal name when the command was signalled.
        signal: Option<String>,
    },
    /// The whole-session deadline elapsed.
    #[error("deadline exceeded talking to {endpoint}")]
    Deadline {
        /// Endpoint the session was bound to.
        endpoint: String,
    },
    /// Any other SSH protocol failure.
    #[error("ssh protocol error: {message}")]
    Protocol {
        /// Description of the failure.
        message: String,
    },
}

impl SshError {
    /// Short failure class used in result headers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::Endpoint { .. } => "Endpoint",
            Self::Connect { .. } => "Connect",
            Self::Handshake { .. } => "Handshake",
            Self::Auth { .. } => "Auth",
            Self::Tunnel { .. } => "Tunnel",
            Self::Session { .. } => "Session",
            Self::Pty { .. } => "Pty",
            Self::OutputFile { .. } => "OutputFile",
            Self::Input { .. } => "Input",
            Self::MissingBastion { .. } => "MissingBastion",
            Self::Remote { .. } => "Remote",
            Self::Deadline { .. } => "Deadline",
            Self::Protocol { .. } => "Protocol",
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(value: russh::Error) -> Self {
        Self::Protocol {
            message: value.to_string(),
        }
    }
}

/// Host-key acceptor: fleet hosts are ephemeral, so host keys are not
/// pinned (the `ssh` renderings disable host-key checking the same way).
#[derive(Clone, Debug)]
pub(crate) struct Accepter;

impl client::Handler for Accepter {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Authentication settings for one SSH endpoint.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Login user.
    pub user: String,
    /// Ordered authentication strategies, tried until one succeeds.
    pub auth: Vec<AuthMethod>,
}

/// PTY request parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestPty {
    /// Terminal type, for example `xterm`.
    pub term: String,
    /// Width in columns.
    pub width: u32,
    /// Height in rows.
    pub height: u32,
}

/// One unit of work for the executor.
#[derive(Debug)]
pub struct SshJob {
    /// Target endpoint as `host:port`.
    pub server: String,
    /// Authentication for the target.
    pub server_config: ClientConfig,
    /// Bastion endpoint as `host:port`, when tunnelling.
    pub bastion: Option<String>,
    /// Authentication for the bastion.
    pub bastion_config: Option<ClientConfig>,
    /// Provider identifier of the instance.
    pub instance_id: String,
    /// Provider name of the instance.
    pub instance_name: String,
    /// Remote command argv; joined with shell quoting before execution.
    pub command: Vec<String>,
    /// Optional PTY request.
    pub pty: Option<RequestPty>,
    /// Optional file streamed to the remote command's stdin.
    pub input: Option<Utf8PathBuf>,
    /// Produce a success result without any network I/O.
    pub dry_run: bool,
    /// Delivery channel; receives exactly one result.
    pub result: oneshot::Sender<SshResult>,
}

/// Outcome of one job.
#[derive(Debug)]
pub struct SshResult {
    /// Target endpoint as `host:port`.
    pub server: String,
    /// Provider identifier of the instance.
    pub instance_id: String,
    /// Provider name of the instance.
    pub instance_name: String,
    /// Login user the session ran as.
    pub user: String,
    /// Captured stdout when inline output is enabled.
    pub stdout: Option<Vec<u8>>,
    /// Captured stderr when inline output is enabled.
    pub stderr: Option<Vec<u8>>,
    /// Completion time.
    pub finished_at: SystemTime,
    /// `Ok` on success; otherwise the failure, including remote exits.
    pub status: Result<(), SshError>,
}

struct RunOutput {
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
    status: Result<(), SshError>,
}

/// Bounded worker pool executing SSH jobs.
pub struct SshSession {
    config: Arc<SshConfig>,
    jobs: Mutex<Option<mpsc::Sender<SshJob>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
}

impl SshSession {
    /// Spawns `workers` long-lived workers consuming the job channel.
    #[must_use]
    pub fn new(config: SshConfig, workers: usize) -> Self {
        let workers = workers.max(1);
        let config = Arc::new(config);
        let (tx, rx) = mpsc::channel::<SshJob>(1);
        let rx = Arc::new(Mutex::new(rx));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            active.fetch_add(1, Ordering::SeqCst);
            handles.push(tokio::spawn(run_worker(
                worker,
                Arc::clone(&config),
                Arc::clone(&rx),
                Arc::clone(&active),
            )));
        }

        Self {
            config,
            jobs: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            active,
        }
    }

    /// Executor configuration.
    #[must_use]
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Number of live workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Submits a job to the pool, applying backpressure when every worker
    /// is busy.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Closed`] after [`SshSession::close`].
    pub async fn run(&self, job: SshJob) -> Result<(), SshError> {
        let sender = {
            let guard = self.jobs.lock().await;
            guard.as_ref().cloned()
        };
        let Some(sender) = sender else {
            return Err(SshError::Closed);
        };
        sender.send(job).await.map_err(|_| SshError::Closed)
    }

    /// Closes the job channel and joins every worker. Jobs already started
    /// are drained, not cancelled.
    pub async fn close(&self) {
        drop(self.jobs.lock().await.take());
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Builds a job for `instance`.
    ///
    /// The login user is the configured override, else the image's
    /// `default_user` tag, else the configured default. Instances without
    /// a public network require the bastion; with
    /// `force_bastion_on_public_host` the bastion is used even for public
    /// instances when one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::MissingBastion`] when the instance is only
    /// privately networked and no bastion address is configured.
    pub async fn build_job(
        &self,
        instance: &Instance,
        images: &ImageCache,
        networks: &NetworkCache,
        auth: Vec<AuthMethod>,
        command: Vec<String>,
        input: Option<Utf8PathBuf>,
    ) -> Result<(SshJob, oneshot::Receiver<SshResult>), SshError> {
        let user = if self.config.user.is_empty() {
            let image = images.get(&instance.image).await.ok();
            default_user(image.as_ref(), &self.config.default_user)
        } else {
            self.config.user.clone()
        };

        let public = networks.has_public(instance).await;
        let needs_bastion = !public;
        let wants_bastion = needs_bastion || self.config.force_bastion_on_public_host;

        let (bastion, bastion_config) = if wants_bastion {
            if self.config.bastion_address.trim().is_empty() {
                if needs_bastion {
                    return Err(SshError::MissingBastion {
                        name: instance.name.clone(),
                    });
                }
                (None, None)
            } else {
                (
                    Some(format!(
                        "{}:{}",
                        self.config.bastion_address, self.config.bastion_port
                    )),
                    Some(ClientConfig {
                        user: self.config.bastion_user.clone(),
                        auth: vec![AuthMethod::Agent],
                    }),
                )
            }
        } else {
            (None, None)
        };

        let (result_tx, result_rx) = oneshot::channel();
        let job = SshJob {
            server: format!("{}:{}", instance.primary_ip, self.config.server_port),
            server_config: ClientConfig { user, auth },
            bastion,
            bastion_config,
            instance_id: instance.id.clone(),
            instance_name: instance.name.clone(),
            command,
            pty: None,
            input,
            dry_run: self.config.dry_run,
            result: result_tx,
        };
        Ok((job, result_rx))
    }

    /// Renders the job's connection parameters as a shell-array literal
    /// for the given print mode instead of executing anything.
    ///
    /// # Errors
    ///
    /// Returns [`PrintError`] for malformed endpoints and for scp/rsync
    /// commands missing the `{}` placeholder.
    pub fn print_conf(&self, job: &SshJob, mode: PrintMode) -> Result<String, PrintError> {
        let (bastion_host, bastion_port, bastion_user) = match (&job.bastion, &job.bastion_config)
        {
            (Some(endpoint), Some(config)) => {
                let (host, port) = print::split_endpoint(endpoint)?;
                (host.to_owned(), port.to_owned(), config.user.clone())
            }
            _ => (String::new(), String::new(), String::new()),
        };
        let (host, port) = print::split_endpoint(&job.server)?;

        let mut rendered = String::from("cmdline=");
        match mode {
            PrintMode::Ssh => print::print_ssh_conf(
                &mut rendered,
                &bastion_host,
                &bastion_port,
                &bastion_user,
                host,
                port,
                &job.server_config.user,
                &job.command,
            )?,
            PrintMode::Scp => print::print_scp_conf(
                &mut rendered,
                &bastion_host,
                &bastion_port,
                &bastion_user,
                host,
                port,
                &job.server_config.user,
                &job.command,
            )?,
            PrintMode::Rsync => print::print_rsync_conf(
                &mut rendered,
                &bastion_host,
                &bastion_port,
                &bastion_user,
                host,
                port,
                &job.server_config.user,
                &job.command,
            )?,
        }
        rendered.push('\n');
        rendered.push_str("\"${cmdline[@]}\"");
        Ok(rendered)
    }
}

async fn run_worker(
    worker: usize,
    config: Arc<SshConfig>,
    jobs: Arc<Mutex<mpsc::Receiver<SshJob>>>,
    active: Arc<AtomicUsize>,
) {
    debug!(worker, "ssh worker started");
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else { break };
        execute_job(&config, worker, job).await;
    }
    active.fetch_sub(1, Ordering::SeqCst);
    debug!(worker, "ssh worker finished");
}

async fn execute_job(config: &SshConfig, worker: usize, job: SshJob) {
    let SshJob {
        server,
        server_config,
        bastion,
        bastion_config,
        instance_id,
        instance_name,
        command,
        pty,
        input,
        dry_run,
        result,
    } = job;

    let output = if dry_run {
        trace!(worker, server = %server, "dry run, skipping connection");
        RunOutput {
            stdout: None,
            stderr: None,
            status: Ok(()),
        }
    } else {
        let session = do_ssh(
            config,
            &server,
            &server_config,
            bastion.as_deref(),
            bastion_config.as_ref(),
            &command,
            pty.as_ref(),
            input.as_ref(),
            &instance_id,
        );
        let outcome = match config.deadline() {
            Some(deadline) => tokio::time::timeout(deadline, session)
                .await
                .unwrap_or_else(|_| {
                    Err(SshError::Deadline {
                        endpoint: server.clone(),
                    })
                }),
            None => session.await,
        };
        outcome.unwrap_or_else(|error| RunOutput {
            stdout: None,
            stderr: None,
            status: Err(error),
        })
    };

    debug!(worker, server = %server, status = ?output.status, "job finished");
    let _ = result.send(SshResult {
        server,
        instance_id,
        instance_name,
        user: server_config.user,
        stdout: output.stdout,
        stderr: output.stderr,
        finished_at: SystemTime::now(),
        status: output.status,
    });
}

#[expect(clippy::too_many_arguments, reason = "one call site, mirrors the job fields")]
async fn do_ssh(
    config: &SshConfig,
    server: &str,
    server_config: &ClientConfig,
    bastion: Option<&str>,
    bastion_config: Option<&ClientConfig>,
    command: &[String],
    pty: Option<&RequestPty>,
    input: Option<&Utf8PathBuf>,
    instance_id: &str,
) -> Result<RunOutput, SshError> {
    // The bastion handle must outlive the whole session: dropping it would
    // tear the direct-tcpip tunnel down.
    let (client, _bastion_guard) = match (bastion, bastion_config) {
        (Some(bastion), Some(bastion_client)) => {
            trace!(bastion = %bastion, server = %server, "tunnelling through bastion");
            let bastion_handle = connect(config, bastion, bastion_client).await?;
            let (host, port) = parse_endpoint(server)?;
            let channel = bastion_handle
                .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
                .await
                .map_err(|err| SshError::Tunnel {
                    endpoint: server.to_owned(),
                    message: err.to_string(),
                })?;
            let mut handle = client::connect_stream(
                Arc::clone(&CLIENT_CONFIG),
                channel.into_stream(),
                Accepter,
            )
            .await
            .map_err(|err| SshError::Handshake {
                endpoint: server.to_owned(),
                message: err.to_string(),
            })?;
            auth::authenticate(&mut handle, &server_config.user, &server_config.auth, server)
                .await?;
            (handle, Some(bastion_handle))
        }
        _ => {
            trace!(server = %server, "connecting directly");
            (connect(config, server, server_config).await?, None)
        }
    };

    let mut channel = client
        .channel_open_session()
        .await
        .map_err(|err| SshError::Session {
            message: err.to_string(),
        })?;

    if let Some(pty) = pty {
        let modes = [
            (Pty::ECHO, 0),
            (Pty::TTY_OP_ISPEED, 14400),
            (Pty::TTY_OP_OSPEED, 14400),
        ];
        channel
            .request_pty(true, &pty.term, pty.width, pty.height, 0, 0, &modes)
            .await
            .map_err(|err| SshError::Pty {
                message: err.to_string(),
            })?;
    }

    let user = &server_config.user;
    let mut stdout_sink =
        Sink::open(config.inline_output, &config.out_directory, user, instance_id).await?;
    let mut stderr_sink =
        Sink::open(config.inline_output, &config.err_directory, user, instance_id).await?;

    let mut rendered = print::shell_join(command);
    if !config.inline_stdout_only {
        // Merge stderr into stdout on the remote side.
        rendered = format!("exec 2>&1; {rendered}");
    }
    trace!(command = %rendered, "executing remote command");
    channel
        .exec(true, rendered)
        .await
        .map_err(|err| SshError::Session {
            message: err.to_string(),
        })?;

    let stdin_task = match input {
        Some(path) => {
            let mut file =
                tokio::fs::File::open(path)
                    .await
                    .map_err(|err| SshError::Input {
                        path: path.to_string(),
                        message: err.to_string(),
                    })?;
            let mut writer = channel.make_writer();
            Some(tokio::spawn(async move {
                let copied = tokio::io::copy(&mut file, &mut writer).await;
                trace!(copied = ?copied, "stdin copy finished");
                let _ = writer.shutdown().await;
            }))
        }
        None => None,
    };

    let mut exit_status: Option<u32> = None;
    let mut exit_signal: Option<String> = None;
    while let Some(message) = channel.wait().await {
        match message {
            ChannelMsg::Data { ref data } => stdout_sink.write(data).await,
            ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr_sink.write(data).await,
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            ChannelMsg::ExitSignal { signal_name, .. } => {
                exit_signal = Some(signal_name_of(&signal_name));
            }
            _ => {}
        }
    }

    if let Some(task) = stdin_task {
        let _ = task.await;
    }

    let status = if exit_signal.is_some() || exit_status.is_some_and(|code| code != 0) {
        Err(SshError::Remote {
            exit_status: exit_status.unwrap_or(0),
            signal: exit_signal,
        })
    } else {
        Ok(())
    };

    Ok(RunOutput {
        stdout: stdout_sink.into_buffer(),
        stderr: stderr_sink.into_buffer(),
        status,
    })
}

async fn connect(
    config: &SshConfig,
    endpoint: &str,
    client_config: &ClientConfig,
) -> Result<client::Handle<Accepter>, SshError> {
    let (host, port) = parse_endpoint(endpoint)?;
    let stream = tokio::time::timeout(config.timeout(), TcpStream::connect((host, port)))
        .await
        .map_err(|_| SshError::Connect {
            endpoint: endpoint.to_owned(),
            message: String::from("connection timed out"),
        })?
        .map_err(|err| SshError::Connect {
            endpoint: endpoint.to_owned(),
            message: err.to_string(),
        })?;

    let mut handle = client::connect_stream(Arc::clone(&CLIENT_CONFIG), stream, Accepter)
        .await
        .map_err(|err| SshError::Handshake {
            endpoint: endpoint.to_owned(),
            message: err.to_string(),
        })?;

    auth::authenticate(
        &mut handle,
        &client_config.user,
        &client_config.auth,
        endpoint,
    )
    .await?;
    Ok(handle)
}

fn parse_endpoint(endpoint: &str) -> Result<(&str, u16), SshError> {
    let (host, port) = print::split_endpoint(endpoint).map_err(|_| SshError::Endpoint {
        endpoint: endpoint.to_owned(),
    })?;
    let port = port.parse::<u16>().map_err(|_| SshError::Endpoint {
        endpoint: endpoint.to_owned(),
    })?;
    Ok((host, port))
}

fn signal_name_of(signal: &Sig) -> String {
    match signal {
        Sig::Custom(name) => name.clone(),
        other => format!("{other:?}"),
    }
}

enum Sink {
    Inline(Vec<u8>),
    File(tokio::fs::File),
    Discard,
}

impl Sink {
    async fn open(
        inline: bool,
        directory: &str,
        user: &str,
        instance_id: &str,
    ) -> Result<Self, SshError> {
        if inline {
            return Ok(Self::Inline(Vec::new()));
        }
        if directory.trim().is_empty() {
            return Ok(Self::Discard);
        }
        let path = Utf8PathBuf::from(directory).join(format!("{user}@{instance_id}"));
        match tokio::fs::File::create(&path).await {
            Ok(file) => Ok(Self::File(file)),
            Err(err) => Err(SshError::OutputFile {
                path: path.into_string(),
                message: err.to_string(),
            }),
        }
    }

    async fn write(&mut self, data: &[u8]) {
        match self {
            Self::Inline(buffer) => buffer.extend_from_slice(data),
            Self::File(file) => {
                if let Err(err) = file.write_all(data).await {
                    debug!(error = %err, "dropping output after file write failure");
                }
            }
            Self::Discard => {}
        }
    }

    fn into_buffer(self) -> Option<Vec<u8>> {
        match self {
            Self::Inline(buffer) => Some(buffer),
            Self::File(_) | Self::Discard => None,
        }
    }
}
