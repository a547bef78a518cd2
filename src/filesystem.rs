//! Filesystem primitives composed from single shell commands.
//!
//! Each function maps the exit status of its command to a domain meaning at
//! the point where that meaning is known: a failed `stat` is absence, a
//! failed `[ ! -e ]` is a conflict.

use crate::errors::RemoteError;
use crate::executor::{Executor, RemoteCommand};
use crate::utils::shell::{conjunction, quote, quote_command, unless_absent};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static MODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-7]{3,4}$").expect("mode regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub owner: u16,
    pub group: u16,
    pub mode: String,
}

impl Permission {
    pub fn new(owner: u16, group: u16, mode: impl Into<String>) -> Result<Self, RemoteError> {
        let permission = Self {
            owner,
            group,
            mode: mode.into(),
        };
        permission.validate()?;
        Ok(permission)
    }

    pub fn validate(&self) -> Result<(), RemoteError> {
        if !MODE.is_match(&self.mode) {
            return Err(RemoteError::invalid_params(format!(
                "invalid linux permission mode '{}'",
                self.mode
            ))
            .with_hint("Use three octal digits, e.g. \"644\"."));
        }
        Ok(())
    }

    fn parse_stat(command: &str, output: &str) -> Result<Self, RemoteError> {
        let line = output.lines().next().unwrap_or("").trim();
        let parts: Vec<&str> = line.split(' ').collect();
        if parts.len() != 3 {
            return Err(RemoteError::internal(format!(
                "malformed output of `{}`: {:?}",
                command, output
            )));
        }
        let owner = parts[0].parse::<u16>().map_err(|err| {
            RemoteError::internal(format!("while parsing owner id '{}': {}", parts[0], err))
        })?;
        let group = parts[1].parse::<u16>().map_err(|err| {
            RemoteError::internal(format!("while parsing group id '{}': {}", parts[1], err))
        })?;
        Ok(Self {
            owner,
            group,
            mode: parts[2].to_string(),
        })
    }
}

/// Any nonzero `stat` exit is reported as absence; permission-denied is not
/// distinguished.
pub fn get_permission(exec: &dyn Executor, path: &str) -> Result<Permission, RemoteError> {
    let command = quote_command(&["stat", "-c", "%u %g %a", path]);
    match exec.exec(&RemoteCommand::new(command.clone())) {
        Ok(output) => Permission::parse_stat(&command, &output.stdout),
        Err(err) if err.is_exit() => Err(RemoteError::path_not_exist(path)),
        Err(err) => Err(err),
    }
}

/// Applies owner, group and mode in one conjunction: if `chown` fails,
/// `chmod` does not run.
pub fn set_permission(
    exec: &dyn Executor,
    path: &str,
    permission: &Permission,
) -> Result<(), RemoteError> {
    permission.validate()?;
    let owner = format!("{}:{}", permission.owner, permission.group);
    let command = conjunction(&[
        quote_command(&["chown", owner.as_str(), path]),
        quote_command(&["chmod", permission.mode.as_str(), path]),
    ]);
    exec.exec(&RemoteCommand::new(command))?;
    Ok(())
}

pub fn reserve_path(exec: &dyn Executor, path: &str) -> Result<(), RemoteError> {
    let command = format!("[ ! -e {} ]", quote(path));
    match exec.exec(&RemoteCommand::new(command)) {
        Ok(_) => Ok(()),
        Err(err) if err.is_exit() => Err(RemoteError::path_conflict(path)),
        Err(err) => Err(err),
    }
}

pub fn mkdirp(exec: &dyn Executor, path: &str) -> Result<(), RemoteError> {
    exec.exec(&RemoteCommand::new(quote_command(&["mkdir", "-p", path])))?;
    Ok(())
}

pub fn cat(exec: &dyn Executor, path: &str) -> Result<String, RemoteError> {
    let output = exec.exec(&RemoteCommand::new(quote_command(&["cat", path])))?;
    Ok(output.stdout)
}

pub fn mv(exec: &dyn Executor, old: &str, new: &str) -> Result<(), RemoteError> {
    exec.exec(&RemoteCommand::new(quote_command(&["mv", old, new])))?;
    Ok(())
}

/// Creates the file if missing and checks that a regular file is there.
pub fn touch(exec: &dyn Executor, path: &str) -> Result<(), RemoteError> {
    let command = conjunction(&[
        quote_command(&["touch", path]),
        format!("[ -f {} ]", quote(path)),
    ]);
    exec.exec(&RemoteCommand::new(command))?;
    Ok(())
}

/// Moves every entry of `old` (dotfiles included) into `new`, then removes
/// `old`. Runs as one remote transaction that stops at the first failure.
pub fn move_directory(exec: &dyn Executor, old: &str, new: &str) -> Result<(), RemoteError> {
    let old_q = quote(old);
    let new_q = quote(new);
    let command = format!(
        "( set -e; mkdir -p {new}; \
         for entry in {old}/* {old}/.[!.]* {old}/..?*; do \
         if [ -e \"$entry\" ] || [ -L \"$entry\" ]; then mv \"$entry\" {new}/; fi; \
         done; rm -rf {old} )",
        old = old_q,
        new = new_q
    );
    exec.exec(&RemoteCommand::new(command))?;
    Ok(())
}

/// Idempotent removal. With `recycle_path`, the object is moved under
/// `<recycle_path>/<unix-timestamp>/` instead of being deleted. An empty
/// `path` or an already-absent object is a successful no-op.
pub fn remove(exec: &dyn Executor, path: &str, recycle_path: &str) -> Result<(), RemoteError> {
    if path.is_empty() {
        return Ok(());
    }
    let command = if recycle_path.is_empty() {
        unless_absent(path, &quote_command(&["rm", "-rf", path]))
    } else {
        let folder = format!(
            "{}/{}",
            recycle_path.trim_end_matches('/'),
            chrono::Utc::now().timestamp()
        );
        unless_absent(
            path,
            &conjunction(&[
                quote_command(&["mkdir", "-p", folder.as_str()]),
                quote_command(&["mv", path, folder.as_str()]),
            ]),
        )
    };
    exec.exec(&RemoteCommand::new(command))?;
    Ok(())
}
