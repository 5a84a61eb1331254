use crate::Error;

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use async_nats::ConnectOptions;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};
use warden_bootable::Bootable;

/// Regex pattern for matching NATS server log lines
static LOG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\d+\] \d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}\.\d{6} (\[[A-Z]+\]) (.*)")
        .expect("Invalid regex pattern")
});

const READY_MESSAGE: &str = "Server is ready";
const ATTACH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How the server role finds or provides a NATS server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ServerMode {
    /// Attach to a server already listening on the default URL, or start a
    /// standalone `JetStream` server on its port.
    Discovery {
        client_port: u16,
        store_dir: PathBuf,
    },

    /// Start a server from a NATS server config file.
    File(PathBuf),
}

enum ServerHandle {
    /// A server someone else manages.
    Attached,

    Spawned {
        pid: Option<Pid>,
        exit: watch::Receiver<Option<ExitStatus>>,
        monitor: JoinHandle<()>,
    },
}

/// The server role: a local `nats-server` process.
pub struct NatsServer {
    mode: ServerMode,
    server_bin_dir: Option<PathBuf>,
    debug: bool,
    startup_timeout: Duration,
    handle: Mutex<Option<ServerHandle>>,
}

impl NatsServer {
    pub(crate) fn new(
        mode: ServerMode,
        server_bin_dir: Option<PathBuf>,
        debug: bool,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            mode,
            server_bin_dir,
            debug,
            startup_timeout,
            handle: Mutex::new(None),
        }
    }

    fn executable(&self) -> Result<PathBuf, Error> {
        match &self.server_bin_dir {
            Some(dir) => Ok(dir.join("nats-server")),
            None => Ok(which::which("nats-server")?),
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = match &self.mode {
            ServerMode::Discovery {
                client_port,
                store_dir,
            } => vec![
                "--jetstream".to_string(),
                "--port".to_string(),
                client_port.to_string(),
                "--store_dir".to_string(),
                store_dir.to_string_lossy().to_string(),
            ],
            ServerMode::File(path) => {
                vec!["--config".to_string(), path.to_string_lossy().to_string()]
            }
        };

        if self.debug {
            args.push("-DV".to_string());
        }

        args
    }

    /// Whether a server is already answering on the discovery port.
    async fn reachable(client_port: u16) -> bool {
        let url = format!("nats://127.0.0.1:{client_port}");

        let probe = ConnectOptions::new()
            .connection_timeout(ATTACH_PROBE_TIMEOUT)
            .connect(url);

        matches!(
            tokio::time::timeout(ATTACH_PROBE_TIMEOUT * 2, probe).await,
            Ok(Ok(_))
        )
    }

    async fn spawn(&self) -> Result<ServerHandle, Error> {
        let executable = self.executable()?;
        let args = self.args();

        debug!(executable = %executable.display(), ?args, "spawning nats server");

        let mut child = Command::new(&executable)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::Spawn)?;

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw);

        let (ready_tx, ready_rx) = watch::channel(false);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    handle_log_line(&line);
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if handle_log_line(&line) {
                        ready_tx.send_replace(true);
                    }
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let monitor = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    if status.success() {
                        info!("nats server exited with status: {status}");
                    } else {
                        warn!("nats server exited with status: {status}");
                    }
                    exit_tx.send_replace(Some(status));
                }
                Err(e) => error!(error = %e, "failed to wait for nats server"),
            }
        });

        let startup = tokio::time::timeout(self.startup_timeout, async {
            tokio::select! {
                true = became_ready(ready_rx) => Ok(()),
                status = exited(exit_rx.clone()) => Err(status),
            }
        })
        .await;

        match startup {
            Ok(Ok(())) => Ok(ServerHandle::Spawned {
                pid,
                exit: exit_rx,
                monitor,
            }),
            Ok(Err(status)) => {
                monitor.abort();
                Err(Error::ServerExited(
                    status.map_or_else(|| "unknown status".to_string(), |s| s.to_string()),
                ))
            }
            Err(_) => {
                // Dropping the child kills it
                monitor.abort();
                Err(Error::ServerNotReady(self.startup_timeout))
            }
        }
    }
}

async fn became_ready(mut ready: watch::Receiver<bool>) -> bool {
    ready.wait_for(|ready| *ready).await.is_ok()
}

async fn exited(mut exit: watch::Receiver<Option<ExitStatus>>) -> Option<ExitStatus> {
    exit.wait_for(Option::is_some).await.ok().and_then(|status| *status)
}

/// Forwards a server log line to tracing. Returns true for the readiness line.
#[allow(clippy::cognitive_complexity)]
fn handle_log_line(line: &str) -> bool {
    // Switch spammy messages to trace level
    if line.contains("rid:")
        || line.contains("Reloaded")
        || line.contains("Trapped")
        || line.contains("i/o timeout")
        || line.contains("connection refused")
    {
        trace!(target: "nats-server", "{}", line);
        return false;
    }

    let Some(caps) = LOG_REGEX.captures(line) else {
        error!(target: "nats-server", "{}", line);
        return false;
    };

    let label = caps.get(1).map_or("[UKW]", |m| m.as_str());
    let message = caps.get(2).map_or(line, |m| m.as_str());

    match label {
        "[INF]" => info!(target: "nats-server", "{}", message),
        "[DBG]" => debug!(target: "nats-server", "{}", message),
        "[WRN]" => warn!(target: "nats-server", "{}", message),
        "[ERR]" | "[FTL]" => error!(target: "nats-server", "{}", message),
        "[TRC]" => trace!(target: "nats-server", "{}", message),
        _ => error!(target: "nats-server", "{}", line),
    }

    label == "[INF]" && message.contains(READY_MESSAGE)
}

#[async_trait]
impl Bootable for NatsServer {
    type Error = Error;

    fn bootable_name(&self) -> &'static str {
        "nats-server"
    }

    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), Self::Error> {
        let mut handle = self.handle.lock().await;

        if handle.is_some() {
            return Err(Error::AlreadyStarted);
        }

        if let ServerMode::Discovery { client_port, .. } = &self.mode {
            if Self::reachable(*client_port).await {
                info!(port = client_port, "attached to running nats server");
                handle.replace(ServerHandle::Attached);
                return Ok(());
            }
        }

        let spawned = self.spawn().await?;
        info!(mode = ?self.mode, "nats server ready");
        handle.replace(spawned);

        Ok(())
    }

    #[instrument(skip(self))]
    async fn shutdown(&self) -> Result<(), Self::Error> {
        let Some(handle) = self.handle.lock().await.take() else {
            debug!("nats server not running");
            return Ok(());
        };

        let ServerHandle::Spawned { pid, exit, monitor } = handle else {
            debug!("detached from externally managed nats server");
            return Ok(());
        };

        if let Some(pid) = pid {
            match signal::kill(pid, Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    monitor.abort();
                    return Err(Error::Signal(e));
                }
            }
        }

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, exited(exit))
            .await
            .is_err()
        {
            warn!("timeout waiting for nats server to exit, killing");
            monitor.abort();
        }

        info!("nats server shut down");

        Ok(())
    }

    async fn wait(&self) {
        let exit = match &*self.handle.lock().await {
            Some(ServerHandle::Spawned { exit, .. }) => exit.clone(),
            _ => return,
        };

        exited(exit).await;
    }
}
