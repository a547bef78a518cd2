//! Upload-and-run execution of a script body.

use crate::constants::script::{DEFAULT_SHEBANG, DEFAULT_WORKING_DIRECTORY};
use crate::errors::RemoteError;
use crate::executor::{Executor, RemoteCommand};
use crate::filesystem;
use crate::utils::shell::{conjunction, inline_env, is_valid_env_name, quote_command};
use std::collections::BTreeMap;

/// Built fresh for each lifecycle phase and dropped after it runs.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub workdir: String,
    pub environment: BTreeMap<String, String>,
    pub interpreter: Vec<String>,
    pub body: String,
    pub stdin: Option<Vec<u8>>,
    /// Values scrubbed from error text.
    pub secrets: Vec<String>,
}

impl Script {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            workdir: DEFAULT_WORKING_DIRECTORY.to_string(),
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    fn upload_body(&self) -> Vec<u8> {
        if self.interpreter.is_empty() && !self.body.starts_with("#!") {
            let mut out = DEFAULT_SHEBANG.as_bytes().to_vec();
            out.extend_from_slice(self.body.as_bytes());
            return out;
        }
        self.body.as_bytes().to_vec()
    }

    fn command_line(&self, script_path: &str) -> String {
        let workdir = if self.workdir.is_empty() {
            DEFAULT_WORKING_DIRECTORY
        } else {
            self.workdir.as_str()
        };
        let mut invocation: Vec<&str> = self.interpreter.iter().map(String::as_str).collect();
        invocation.push(script_path);
        let env = inline_env(&self.environment);
        let run = if env.is_empty() {
            quote_command(&invocation)
        } else {
            format!("{} {}", env, quote_command(&invocation))
        };
        conjunction(&[
            quote_command(&["mkdir", "-p", workdir]),
            quote_command(&["cd", workdir]),
            run,
        ])
    }

    fn validate(&self) -> Result<(), RemoteError> {
        if let Some(name) = self.environment.keys().find(|k| !is_valid_env_name(k)) {
            return Err(RemoteError::invalid_params(format!(
                "environment variable name '{}' is not a valid shell identifier",
                name
            )));
        }
        Ok(())
    }

    /// Uploads, runs and removes the script; returns captured stdout.
    ///
    /// A nonzero exit comes back as an `Exit` error carrying stderr, so
    /// callers can tell "the script failed" from "the host is unreachable".
    pub fn exec(&self, exec: &dyn Executor) -> Result<String, RemoteError> {
        self.validate()?;
        let path = exec.script_path()?;
        exec.upload_script(&path, &self.upload_body())?;

        let mut command = RemoteCommand::new(self.command_line(&path));
        if let Some(stdin) = self.stdin.as_ref() {
            command = command.with_stdin(stdin.clone());
        }
        let result = exec.exec(&command);
        let cleanup = filesystem::remove(exec, &path, "");

        // A leftover script is an error even when the script succeeded. It is
        // not an `Exit` error: the script's own status was zero.
        match (result, cleanup) {
            (Ok(output), Ok(())) => Ok(output.stdout),
            (Ok(_), Err(err)) => Err(RemoteError::internal(format!(
                "failed to remove uploaded script {}: {}",
                path, err.message
            ))
            .redacted(&self.secrets)),
            (Err(err), _) => Err(err.redacted(&self.secrets)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::executor::testing::ScriptedExecutor;

    #[test]
    fn exec_uploads_runs_and_cleans_up() {
        let exec = ScriptedExecutor::new();
        exec.respond_stdout("hello");
        let mut script = Script::new("echo hello");
        script.workdir = "/srv/app".to_string();
        script
            .environment
            .insert("NAME".to_string(), "a b".to_string());

        assert_eq!(script.exec(&exec).unwrap(), "hello");

        let uploads = exec.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "/tmp/linux-42.sh");
        assert_eq!(uploads[0].1, b"#!/bin/sh\necho hello".to_vec());
        assert!(uploads[0].2);

        let lines = exec.command_lines();
        assert_eq!(
            lines[0],
            "{ mkdir -p /srv/app && cd /srv/app && NAME='a b' /tmp/linux-42.sh ;}"
        );
        assert_eq!(
            lines[1],
            "{ [ ! -e /tmp/linux-42.sh ] || rm -rf /tmp/linux-42.sh ;}"
        );
    }

    #[test]
    fn interpreter_precedes_script_and_keeps_body() {
        let exec = ScriptedExecutor::new();
        let mut script = Script::new("print('x')");
        script.interpreter = vec!["python3".to_string(), "-u".to_string()];
        script.exec(&exec).unwrap();

        assert_eq!(
            exec.command_lines()[0],
            "{ mkdir -p . && cd . && python3 -u /tmp/linux-42.sh ;}"
        );
        assert_eq!(exec.uploads.lock().unwrap()[0].1, b"print('x')".to_vec());
    }

    #[test]
    fn existing_shebang_is_kept() {
        let exec = ScriptedExecutor::new();
        Script::new("#!/bin/bash\necho").exec(&exec).unwrap();
        assert_eq!(
            exec.uploads.lock().unwrap()[0].1,
            b"#!/bin/bash\necho".to_vec()
        );
    }

    #[test]
    fn stdin_is_forwarded() {
        let exec = ScriptedExecutor::new();
        Script::new("cat").with_stdin("previous").exec(&exec).unwrap();
        let commands = exec.commands.lock().unwrap();
        assert_eq!(commands[0].stdin.as_deref(), Some(&b"previous"[..]));
    }

    #[test]
    fn nonzero_exit_is_exit_error_and_script_still_removed() {
        let exec = ScriptedExecutor::new();
        exec.respond_exit(3, "boom");
        let err = Script::new("exit 3").exec(&exec).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exit);
        assert_eq!(err.stderr.as_deref(), Some("boom"));
        assert_eq!(exec.command_lines().len(), 2);
    }

    #[test]
    fn failed_cleanup_after_success_is_reported() {
        let exec = ScriptedExecutor::new();
        exec.respond_stdout("done").respond_exit(1, "rm: Operation not permitted");
        let err = Script::new("true").exec(&exec).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.message.contains("Operation not permitted"));
        assert!(err
            .message
            .starts_with("failed to remove uploaded script /tmp/linux-42.sh"));
    }

    #[test]
    fn script_failure_wins_over_cleanup_failure() {
        let exec = ScriptedExecutor::new();
        exec.respond_exit(3, "boom").respond_exit(1, "rm failed");
        let err = Script::new("exit 3").exec(&exec).unwrap_err();
        assert_eq!(err.exit_code, Some(3));
        assert_eq!(err.stderr.as_deref(), Some("boom"));
    }

    #[test]
    fn secrets_are_scrubbed_from_errors() {
        let exec = ScriptedExecutor::new();
        exec.respond_exit(1, "login failed for hunter22");
        let mut script = Script::new("login");
        script.secrets = vec!["hunter22".to_string()];
        let err = script.exec(&exec).unwrap_err();
        assert!(!err.to_string().contains("hunter22"));
    }

    #[test]
    fn invalid_env_names_are_rejected_before_upload() {
        let exec = ScriptedExecutor::new();
        let mut script = Script::new("true");
        script
            .environment
            .insert("BAD;NAME".to_string(), "x".to_string());
        let err = script.exec(&exec).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParams);
        assert!(exec.uploads.lock().unwrap().is_empty());
    }
}
