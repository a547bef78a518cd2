#![allow(dead_code)]

use linux_remote::errors::RemoteError;
use linux_remote::executor::{CommandOutput, Executor, RemoteCommand};
use linux_remote::filesystem::Permission;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub fn tmp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn id(flag: &str) -> u16 {
    let output = Command::new("id").arg(flag).output().expect("run id");
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .expect("numeric id")
}

/// Owner and group the test process can always chown to.
pub fn own_permission(mode: &str) -> Permission {
    Permission::new(id("-u"), id("-g"), mode).expect("valid mode")
}

/// Runs commands with the local `sh`, so the generated shell is exercised
/// exactly as a remote host would run it.
pub struct LocalExecutor {
    script_dir: PathBuf,
}

impl LocalExecutor {
    pub fn new() -> Self {
        let script_dir = tmp_dir("linux-remote-scripts");
        std::fs::create_dir_all(&script_dir).expect("script dir");
        Self { script_dir }
    }

    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }
}

impl Drop for LocalExecutor {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.script_dir);
    }
}

impl Executor for LocalExecutor {
    fn exec(&self, command: &RemoteCommand) -> Result<CommandOutput, RemoteError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Some(input) = command.stdin.as_ref() {
                let _ = stdin.write_all(input);
            }
        }
        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        match output.status.code() {
            Some(0) => Ok(CommandOutput { stdout, stderr }),
            code => Err(RemoteError::exit(
                &command.command,
                code.unwrap_or(-1),
                stdout,
                stderr,
            )),
        }
    }

    fn upload(&self, path: &str, content: &[u8]) -> Result<(), RemoteError> {
        std::fs::write(path, content)?;
        Ok(())
    }

    fn upload_script(&self, path: &str, content: &[u8]) -> Result<(), RemoteError> {
        std::fs::write(path, content)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
        Ok(())
    }

    fn script_path(&self) -> Result<String, RemoteError> {
        Ok(path_str(
            &self
                .script_dir
                .join(format!("linux-{}.sh", uuid::Uuid::new_v4().simple())),
        ))
    }
}
