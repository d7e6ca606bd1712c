//! Execution of external commands.
//!
//! Commands are described by a [`Request`] and executed by an [`Exec`]
//! back-end. [`Inline`] spawns the command from the calling thread, the
//! [`Prefork`](crate::prefork::Prefork) back-end forwards the request to a
//! long-lived child process. Both end up in [`run`], which supervises the
//! command and terminates its whole process group on timeout.

use std::collections::BTreeMap;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use crossbeam_channel::{RecvTimeoutError, bounded};
use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Grace period between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// The command line to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cmd {
    Argv(Vec<String>),
    Shell(String),
}

impl Cmd {
    pub fn is_shell(&self) -> bool {
        matches!(self, Cmd::Shell(_))
    }
}

impl std::fmt::Display for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cmd::Argv(argv) => f.write_str(&argv.join(" ")),
            Cmd::Shell(line) => f.write_str(line),
        }
    }
}

/// A serializable command request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub cmd: Cmd,
    pub cwd: Option<Utf8PathBuf>,
    /// Variables set on top of the inherited process environment.
    pub env: BTreeMap<String, String>,
    pub shell: bool,
    /// Capture standard output instead of inheriting it.
    pub stdout: bool,
    /// Capture standard error instead of inheriting it.
    pub stderr: bool,
    /// Time budget in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl Request {
    pub fn new(cmd: Cmd) -> Self {
        Self {
            shell: cmd.is_shell(),
            cmd,
            cwd: None,
            env: BTreeMap::new(),
            stdout: true,
            stderr: true,
            timeout: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }
}

/// Result of an executed request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Set when the command could not be executed at all.
    pub exception: Option<String>,
    pub timed_out: bool,
}

impl Response {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A command execution back-end.
///
/// `slot` is the index of the worker slot issuing the request. Back-ends
/// holding per-worker resources use it to pick the resource, at most one
/// request is in flight per slot.
pub trait Exec: Send + Sync {
    fn name(&self) -> &'static str;

    fn exec(&self, slot: usize, request: &Request) -> Result<Response, ExecError>;
}

/// Runs every request directly from the calling worker thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

impl Exec for Inline {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn exec(&self, _: usize, request: &Request) -> Result<Response, ExecError> {
        run(request)
    }
}

/// Executes a request and waits for it, enforcing its timeout.
///
/// The command runs in a fresh process group. When the timeout expires the
/// group receives SIGTERM, then SIGKILL after [`KILL_GRACE`], and the
/// response is marked as timed out.
pub fn run(request: &Request) -> Result<Response, ExecError> {
    let mut command = match &request.cmd {
        Cmd::Shell(line) => shell(line),
        Cmd::Argv(argv) => {
            let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;
            let mut command = Command::new(program);
            command.args(args);
            command
        }
    };

    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }

    // The secret of a prefork pool never reaches the commands it runs.
    command
        .env_remove(crate::prefork::KEY_VAR)
        .envs(&request.env)
        .stdin(Stdio::null())
        .stdout(pipe_or_inherit(request.stdout))
        .stderr(pipe_or_inherit(request.stderr));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    tracing::debug!("runner: {}", request.cmd);

    let child = command
        .spawn()
        .map_err(|e| ExecError::Spawn(request.cmd.to_string(), e))?;

    let Some(timeout) = request.timeout() else {
        let output = child.wait_with_output()?;
        return Ok(Response {
            code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
            exception: None,
            timed_out: false,
        });
    };

    let pid = child.id();
    let (done, finished) = bounded::<()>(1);

    let supervisor = thread::Builder::new()
        .name(format!("supervisor-{pid}"))
        .spawn(move || match finished.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("process {pid} exceeded {timeout:?}, terminating");
                terminate(pid, false);

                if let Err(RecvTimeoutError::Timeout) = finished.recv_timeout(KILL_GRACE) {
                    terminate(pid, true);
                }

                true
            }
            _ => false,
        })?;

    let output = child.wait_with_output();
    // The receiver may already be gone if the timer fired.
    let _ = done.send(());
    let timed_out = supervisor.join().unwrap_or(false);
    let output = output?;

    Ok(Response {
        code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
        exception: None,
        timed_out,
    })
}

fn pipe_or_inherit(capture: bool) -> Stdio {
    match capture {
        true => Stdio::piped(),
        false => Stdio::inherit(),
    }
}

#[cfg(unix)]
fn shell(line: &str) -> Command {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(not(unix))]
fn shell(line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

/// Signals the process group led by `pid`.
#[cfg(unix)]
fn terminate(pid: u32, force: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let signal = match force {
        true => Signal::SIGKILL,
        false => Signal::SIGTERM,
    };

    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        tracing::debug!("killpg({pid}, {signal:?}): {e}");
    }
}

/// Terminates the process tree rooted at `pid`.
#[cfg(not(unix))]
fn terminate(pid: u32, force: bool) {
    let mut command = Command::new("taskkill");
    command.args(["/T", "/PID", &pid.to_string()]);

    if force {
        command.arg("/F");
    }

    if let Err(e) = command.stdout(Stdio::null()).stderr(Stdio::null()).status() {
        tracing::debug!("taskkill {pid}: {e}");
    }
}
