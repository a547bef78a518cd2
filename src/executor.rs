//! The narrow capability every remote operation is built on.
//!
//! [`crate::connection::Session`] implements it over SSH; tests substitute
//! in-process implementations.

use crate::errors::RemoteError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCommand {
    pub command: String,
    pub stdin: Option<Vec<u8>>,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

pub trait Executor: Send + Sync {
    /// Runs a shell command to completion. A nonzero exit is returned as an
    /// [`crate::errors::ErrorKind::Exit`] error, never as a transport error.
    fn exec(&self, command: &RemoteCommand) -> Result<CommandOutput, RemoteError>;

    /// Writes `content` to `path`, replacing any existing file.
    fn upload(&self, path: &str, content: &[u8]) -> Result<(), RemoteError>;

    /// Writes `content` to `path` and makes it executable.
    fn upload_script(&self, path: &str, content: &[u8]) -> Result<(), RemoteError>;

    /// A fresh remote path for the next script upload.
    fn script_path(&self) -> Result<String, RemoteError>;
}
