use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParams,
    /// The remote path is absent. Expected during Read; never a failure there.
    PathNotExist,
    PathConflict,
    Transport,
    Denied,
    /// The remote command ran and exited nonzero.
    Exit,
    Validation,
    Internal,
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub retryable: bool,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            hint: None,
            details: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            retryable: matches!(kind, ErrorKind::Transport),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, "INVALID_PARAMS", message)
    }

    pub fn path_not_exist(path: &str) -> Self {
        Self::new(
            ErrorKind::PathNotExist,
            "PATH_NOT_EXIST",
            format!("path '{}' doesn't exist", path),
        )
    }

    pub fn path_conflict(path: &str) -> Self {
        Self::new(
            ErrorKind::PathConflict,
            "PATH_CONFLICT",
            format!("path '{}' exists", path),
        )
        .with_hint("Set overwrite = true to adopt the existing object.")
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, "TRANSPORT", message)
    }

    /// Transport failure that must not be retried (protocol or handshake errors).
    pub fn protocol(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Transport, "PROTOCOL", message);
        err.retryable = false;
        err
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Denied, "DENIED", message)
    }

    pub fn exit(command: &str, exit_code: i32, stdout: String, stderr: String) -> Self {
        let message = format!(
            "command `{}` exited with status {}\nstderr: {}",
            command,
            exit_code,
            stderr.trim_end()
        );
        let mut err = Self::new(ErrorKind::Exit, "EXIT", message);
        err.exit_code = Some(exit_code);
        err.stdout = Some(stdout);
        err.stderr = Some(stderr);
        err
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, "VALIDATION", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, "INTERNAL", message)
    }

    pub fn is_path_not_exist(&self) -> bool {
        self.kind == ErrorKind::PathNotExist
    }

    pub fn is_exit(&self) -> bool {
        self.kind == ErrorKind::Exit
    }

    /// Prefixes the message, keeping kind and captured streams.
    pub fn context(mut self, prefix: impl AsRef<str>) -> Self {
        self.message = format!("{}: {}", prefix.as_ref(), self.message);
        self
    }

    /// Replaces each secret with a redaction marker in every text field.
    pub fn redacted(mut self, secrets: &[String]) -> Self {
        if secrets.is_empty() {
            return self;
        }
        self.message = crate::utils::redact::redact_secrets(&self.message, secrets);
        self.stdout = self
            .stdout
            .map(|text| crate::utils::redact::redact_secrets(&text, secrets));
        self.stderr = self
            .stderr
            .map(|text| crate::utils::redact::redact_secrets(&text, secrets));
        self
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        RemoteError::transport(err.to_string())
    }
}
