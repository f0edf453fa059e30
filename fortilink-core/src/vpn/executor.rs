//! Process execution for the external VPN client.
//!
//! The child is spawned in a new process group (pgid equal to the child
//! pid) so the whole tree, including any privilege-escalation wrapper,
//! can be signalled atomically at disconnect.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::error::VpnError;

/// Boxed writer handed out for the child's stdin.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
/// Boxed reader handed out for the child's stdout/stderr.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Creates processes for the session controller.
pub trait ProcessExecutor: Send + Sync {
    /// Prepares a new process with the given program and arguments.
    fn create(&self, program: &str, args: &[String]) -> Result<Box<dyn VpnProcess>, VpnError>;
}

/// A prepared, and after [`start`](VpnProcess::start) running, VPN client
/// process with piped standard streams.
#[async_trait]
pub trait VpnProcess: Send {
    /// Spawns the process. Must be called before any other method.
    fn start(&mut self) -> Result<(), VpnError>;

    /// Waits for the process to exit.
    async fn wait(&mut self) -> Result<(), VpnError>;

    /// Returns a handle that can terminate the process group even after
    /// the process itself has moved into the waiter task.
    fn kill_handle(&self) -> Option<Arc<dyn KillHandle>>;

    fn take_stdin(&mut self) -> Option<BoxedWriter>;
    fn take_stdout(&mut self) -> Option<BoxedReader>;
    fn take_stderr(&mut self) -> Option<BoxedReader>;
}

/// Terminates a process group.
#[async_trait]
pub trait KillHandle: Send + Sync {
    async fn kill(&self) -> Result<(), VpnError>;
}

/// How the process group is signalled when the session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    /// The host process is already privileged and signals the group
    /// directly, escalating from SIGTERM to SIGKILL.
    Elevated,
    /// Unprivileged host process; falls back to `pkexec kill` when direct
    /// signalling is refused.
    User,
}

/// Spawns the VPN client (or its pkexec wrapper) with piped stdio.
pub struct RealExecutor {
    mode: KillMode,
}

impl RealExecutor {
    /// Executor for the privileged helper daemon.
    pub fn elevated() -> Self {
        Self {
            mode: KillMode::Elevated,
        }
    }

    /// Executor for an unprivileged host process.
    pub fn user() -> Self {
        Self {
            mode: KillMode::User,
        }
    }
}

impl ProcessExecutor for RealExecutor {
    fn create(&self, program: &str, args: &[String]) -> Result<Box<dyn VpnProcess>, VpnError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // New process group with pgid == child pid.
            .process_group(0);
        Ok(Box::new(RealProcess {
            command,
            child: None,
            pgid: None,
            mode: self.mode,
        }))
    }
}

struct RealProcess {
    command: Command,
    child: Option<Child>,
    pgid: Option<i32>,
    mode: KillMode,
}

#[async_trait]
impl VpnProcess for RealProcess {
    fn start(&mut self) -> Result<(), VpnError> {
        let child = self
            .command
            .spawn()
            .map_err(|err| VpnError::StartProcess(err.to_string()))?;
        self.pgid = child.id().map(|pid| pid as i32);
        tracing::debug!(pid = ?child.id(), "VPN client process spawned");
        self.child = Some(child);
        Ok(())
    }

    async fn wait(&mut self) -> Result<(), VpnError> {
        match self.child.as_mut() {
            Some(child) => {
                let status = child
                    .wait()
                    .await
                    .map_err(|err| VpnError::WaitProcess(err.to_string()))?;
                tracing::debug!(%status, "VPN client process exited");
                Ok(())
            }
            None => Err(VpnError::WaitProcess("process not started".to_string())),
        }
    }

    fn kill_handle(&self) -> Option<Arc<dyn KillHandle>> {
        self.pgid
            .map(|pgid| Arc::new(GroupKillHandle::new(pgid, self.mode)) as Arc<dyn KillHandle>)
    }

    fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.child
            .as_mut()
            .and_then(|child| child.stdin.take())
            .map(|stdin| Box::new(stdin) as BoxedWriter)
    }

    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.child
            .as_mut()
            .and_then(|child| child.stdout.take())
            .map(|stdout| Box::new(stdout) as BoxedReader)
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.child
            .as_mut()
            .and_then(|child| child.stderr.take())
            .map(|stderr| Box::new(stderr) as BoxedReader)
    }
}

/// Signals a whole process group, honouring the kill mode.
pub struct GroupKillHandle {
    pgid: Pid,
    mode: KillMode,
}

impl GroupKillHandle {
    pub fn new(pgid: i32, mode: KillMode) -> Self {
        Self {
            pgid: Pid::from_raw(pgid),
            mode,
        }
    }
}

#[async_trait]
impl KillHandle for GroupKillHandle {
    async fn kill(&self) -> Result<(), VpnError> {
        match self.mode {
            KillMode::Elevated => kill_group_elevated(self.pgid),
            KillMode::User => kill_group_user(self.pgid).await,
        }
    }
}

/// Direct group kill for a privileged process: SIGTERM, then SIGKILL.
/// A group that already exited counts as success.
fn kill_group_elevated(pgid: Pid) -> Result<(), VpnError> {
    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => {
            tracing::warn!(%pgid, error = %err, "SIGTERM to process group failed, escalating");
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(err) => Err(VpnError::KillFailed(err.to_string())),
            }
        }
    }
}

/// Group kill for an unprivileged process. The group usually runs as root
/// behind pkexec, so a refused direct signal falls back to `pkexec kill`.
async fn kill_group_user(pgid: Pid) -> Result<(), VpnError> {
    if matches!(killpg(pgid, Signal::SIGTERM), Ok(()) | Err(Errno::ESRCH)) {
        return Ok(());
    }

    let status = run_pkexec_kill(pgid, "-TERM").await?;
    if status.success() {
        return Ok(());
    }
    if is_pkexec_cancellation(&status) {
        return Err(VpnError::AuthorizationCancelled);
    }

    let status = run_pkexec_kill(pgid, "-KILL").await?;
    if status.success() {
        return Ok(());
    }
    if is_pkexec_cancellation(&status) {
        return Err(VpnError::AuthorizationCancelled);
    }
    Err(VpnError::KillFailed(format!(
        "pkexec kill exited with {status}"
    )))
}

async fn run_pkexec_kill(pgid: Pid, signal_arg: &str) -> Result<std::process::ExitStatus, VpnError> {
    // "--" keeps the negative pgid from being parsed as an option.
    Command::new("pkexec")
        .args(["kill", signal_arg, "--", &format!("-{pgid}")])
        .status()
        .await
        .map_err(|err| VpnError::KillFailed(err.to_string()))
}

/// Exit code 126 means the pkexec authorisation dialog was declined,
/// 127 that pkexec itself is missing.
fn is_pkexec_cancellation(status: &std::process::ExitStatus) -> bool {
    matches!(status.code(), Some(126) | Some(127))
}
