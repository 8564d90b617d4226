/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use quill_protocol::OnionNetwork;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running { pid: u32, port: u16 },
    Failed { reason: String },
}

impl ProcessState {
    pub fn socks_port(&self) -> Option<u16> {
        match self {
            ProcessState::Running { port, .. } => Some(*port),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("no free port in {start}..={end}")]
    NoFreePort { start: u16, end: u16 },
    #[error("spawn {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("exited before ready: {0}")]
    ExitedEarly(String),
    #[error("socks port not ready within {0:?}")]
    ReadyTimeout(Duration),
    #[error("process supervisor is gone")]
    Closed,
}

#[derive(Clone, Debug)]
pub struct ProcessConfig {
    pub port_range: RangeInclusive<u16>,
    pub ready_timeout: Duration,
    /// How long a terminated daemon may take to exit before it is killed.
    pub stop_grace: Duration,
    pub data_dir: PathBuf,
}

impl ProcessConfig {
    pub fn defaults_for(network: OnionNetwork, data_dir: PathBuf) -> Self {
        let port_range = match network {
            OnionNetwork::Tor => 19050..=19099,
            OnionNetwork::Lokinet => 19150..=19199,
        };
        Self {
            port_range,
            ready_timeout: Duration::from_secs(45),
            stop_grace: Duration::from_secs(10),
            data_dir,
        }
    }
}

enum Cmd {
    Start {
        binary: PathBuf,
        reply: oneshot::Sender<Result<u16, ProcessError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the task that owns one network's child process. The task is
/// the only writer of the published state.
pub struct ProcessHandle {
    network: OnionNetwork,
    tx: mpsc::Sender<Cmd>,
    state: watch::Receiver<ProcessState>,
    task: JoinHandle<()>,
}

impl ProcessHandle {
    pub fn spawn(network: OnionNetwork, cfg: ProcessConfig) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let (state_tx, state) = watch::channel(ProcessState::Stopped);
        let task = tokio::spawn(supervise(network, cfg, rx, state_tx));
        Self {
            network,
            tx,
            state,
            task,
        }
    }

    pub fn network(&self) -> OnionNetwork {
        self.network
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Start `binary`, or return the current port if it already runs.
    pub async fn start(&self, binary: PathBuf) -> Result<u16, ProcessError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Start { binary, reply })
            .await
            .map_err(|_| ProcessError::Closed)?;
        rx.await.map_err(|_| ProcessError::Closed)?
    }

    pub async fn stop(&self) -> Result<(), ProcessError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Stop { reply })
            .await
            .map_err(|_| ProcessError::Closed)?;
        rx.await.map_err(|_| ProcessError::Closed)
    }

    pub async fn shutdown(self) {
        let _ = self.stop().await;
        drop(self.tx);
        let _ = self.task.await;
    }
}

struct Running {
    child: Child,
    binary: PathBuf,
    pid: u32,
    port: u16,
}

async fn supervise(
    network: OnionNetwork,
    cfg: ProcessConfig,
    mut rx: mpsc::Receiver<Cmd>,
    state_tx: watch::Sender<ProcessState>,
) {
    let mut current: Option<Running> = None;
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                None => {
                    stop_current(network, &mut current, cfg.stop_grace).await;
                    let _ = state_tx.send(ProcessState::Stopped);
                    break;
                }
                Some(Cmd::Start { binary, reply }) => {
                    if let Some(run) = &current {
                        if run.binary == binary {
                            let _ = reply.send(Ok(run.port));
                            continue;
                        }
                        stop_current(network, &mut current, cfg.stop_grace).await;
                    }
                    let _ = state_tx.send(ProcessState::Starting);
                    match launch(network, &cfg, binary).await {
                        Ok(run) => {
                            tracing::info!(%network, pid = run.pid, port = run.port, "onion process running");
                            let _ = state_tx.send(ProcessState::Running { pid: run.pid, port: run.port });
                            let _ = reply.send(Ok(run.port));
                            current = Some(run);
                        }
                        Err(e) => {
                            tracing::warn!(%network, error = %e, "onion process failed to start");
                            let _ = state_tx.send(ProcessState::Failed { reason: e.to_string() });
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Some(Cmd::Stop { reply }) => {
                    stop_current(network, &mut current, cfg.stop_grace).await;
                    let _ = state_tx.send(ProcessState::Stopped);
                    let _ = reply.send(());
                }
            },
            status = wait_exit(&mut current), if current.is_some() => {
                current = None;
                let reason = match status {
                    Ok(s) => format!("exited unexpectedly: {s}"),
                    Err(e) => format!("wait failed: {e}"),
                };
                tracing::warn!(%network, reason = %reason, "onion process died");
                let _ = state_tx.send(ProcessState::Failed { reason });
            }
        }
    }
}

async fn wait_exit(current: &mut Option<Running>) -> std::io::Result<ExitStatus> {
    match current {
        Some(run) => run.child.wait().await,
        None => std::future::pending().await,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StopKind {
    Terminated,
    Killed,
}

async fn stop_current(network: OnionNetwork, current: &mut Option<Running>, grace: Duration) {
    if let Some(run) = current.take() {
        let pid = run.pid;
        let how = stop_child(network, run.child, pid, grace).await;
        tracing::info!(%network, pid, how = ?how, "onion process stopped");
    }
}

/// SIGTERM first; SIGKILL once `grace` runs out.
async fn stop_child(network: OnionNetwork, mut child: Child, pid: u32, grace: Duration) -> StopKind {
    if terminate(network, pid) {
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            tracing::debug!(%network, pid, status = ?status, "exited after terminate");
            return StopKind::Terminated;
        }
        tracing::warn!(%network, pid, grace = ?grace, "onion process ignored terminate, killing");
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(%network, error = %e, "kill");
    }
    if tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .is_err()
    {
        tracing::warn!(%network, pid, "onion process did not exit after kill");
    }
    StopKind::Killed
}

#[cfg(unix)]
fn terminate(network: OnionNetwork, pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(%network, pid, error = %e, "terminate");
            false
        }
    }
}

#[cfg(not(unix))]
fn terminate(_network: OnionNetwork, _pid: u32) -> bool {
    false
}

async fn launch(
    network: OnionNetwork,
    cfg: &ProcessConfig,
    binary: PathBuf,
) -> Result<Running, ProcessError> {
    let port = pick_free_port(&cfg.port_range).await?;
    let data_dir = cfg.data_dir.join(network.as_str());
    if let Err(e) = tokio::fs::create_dir_all(&data_dir).await {
        tracing::warn!(path = %data_dir.display(), error = %e, "create onion data dir");
    }

    let mut cmd = Command::new(&binary);
    match network {
        OnionNetwork::Tor => {
            cmd.arg("--SocksPort")
                .arg(format!("127.0.0.1:{port}"))
                .arg("--DataDirectory")
                .arg(&data_dir);
        }
        OnionNetwork::Lokinet => {
            cmd.arg("--socks-port").arg(port.to_string());
        }
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        path: binary.display().to_string(),
        source,
    })?;
    let pid = child.id().unwrap_or_default();
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(%network, "{line}");
            }
        });
    }

    let deadline = Instant::now() + cfg.ready_timeout;
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(ProcessError::ExitedEarly(status.to_string()));
        }
        let connect = tokio::time::timeout(
            Duration::from_millis(500),
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
        )
        .await;
        if matches!(connect, Ok(Ok(_))) {
            return Ok(Running {
                child,
                binary,
                pid,
                port,
            });
        }
        if Instant::now() >= deadline {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ProcessError::ReadyTimeout(cfg.ready_timeout));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn pick_free_port(range: &RangeInclusive<u16>) -> Result<u16, ProcessError> {
    for port in range.clone() {
        if tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            return Ok(port);
        }
    }
    Err(ProcessError::NoFreePort {
        start: *range.start(),
        end: *range.end(),
    })
}
