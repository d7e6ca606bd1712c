use std::fmt::{Display, Formatter};
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Deadlock(#[from] DeadlockError),

    #[error("Error while accessing the signature store:\n{0}")]
    Store(#[from] StoreError),

    #[error("Error while starting the execution service:\n{0}")]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error("Generator '{0}':\n{1}")]
    Generator(String, anyhow::Error),

    #[error("Build failed: {count} task(s) failed, first: {first}")]
    Failed { count: usize, first: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Couldn't read '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't write '{0}'.\n{1}")]
    Write(Utf8PathBuf, std::io::Error),

    #[error("Couldn't encode the store.\n{0}")]
    Encode(String),
}

/// Failure of the command execution service.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't spawn '{0}'.\n{1}")]
    Spawn(String, std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Couldn't (de)serialize payload: {0}")]
    Codec(String),

    #[error("Invalid key given")]
    Auth,

    #[error("Empty command")]
    EmptyCommand,
}

impl ExecError {
    /// Errors after which the connection is in an unknown state and must be
    /// replaced.
    pub(crate) fn is_protocol(&self) -> bool {
        matches!(self, ExecError::Protocol(_) | ExecError::Io(_) | ExecError::Codec(_))
    }
}

/// Reason recorded on a task that did not finish successfully.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("command exited with status {code}{}", stderr_suffix(.stderr))]
    Command { code: i32, stderr: String },

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Exception(String),

    #[error("missing output '{0}'")]
    MissingOutput(Utf8PathBuf),

    #[error("cancelled, a predecessor did not succeed")]
    Cancelled,
}

fn stderr_suffix(stderr: &str) -> String {
    match stderr.trim() {
        "" => String::new(),
        text => format!(":\n{text}"),
    }
}

/// A task stuck in the frozen queue when a deadlock is detected.
#[derive(Debug, Clone)]
pub struct FrozenTask {
    pub uid: String,
    pub name: String,
    pub run_after: Vec<String>,
}

/// Every remaining task is postponed and none made progress since the last
/// sweep over the frozen queue.
#[derive(Debug, Clone, Error)]
pub struct DeadlockError {
    pub hint: &'static str,
    pub frozen: Vec<FrozenTask>,
    pub cycles: Vec<Vec<String>>,
}

impl Display for DeadlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Deadlock detected: {}", self.hint)?;

        for task in &self.frozen {
            write!(f, "\n  {} ({})\t-> {:?}", task.name, task.uid, task.run_after)?;
        }

        for cycle in &self.cycles {
            write!(f, "\n  cycle: {}", cycle.join(" -> "))?;
        }

        Ok(())
    }
}
