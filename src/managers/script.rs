//! Script resources: user-supplied lifecycle commands run through
//! [`crate::script::Script`], with the read command's output tracked as the
//! resource's observed state.

use super::{new_resource_id, run_blocking, Created, ResourceHandler};
use crate::constants::script::DEFAULT_WORKING_DIRECTORY;
use crate::diff::{classify, Decision, DiffAttributeSet, PriorFlags};
use crate::errors::RemoteError;
use crate::executor::Executor;
use crate::script::Script;
use crate::services::logger::Logger;
use crate::utils::redact::REDACTION;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

fn default_working_directory() -> String {
    DEFAULT_WORKING_DIRECTORY.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleCommands {
    pub create: String,
    pub read: String,
    #[serde(default)]
    pub update: Option<String>,
    pub delete: String,
}

impl LifecycleCommands {
    fn update_declared(&self) -> bool {
        self.update.as_deref().map(|u| !u.is_empty()).unwrap_or(false)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptState {
    pub lifecycle_commands: LifecycleCommands,
    #[serde(default)]
    pub interpreter: Vec<String>,
    #[serde(default)]
    pub triggers: BTreeMap<String, String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub sensitive_environment: BTreeMap<String, String>,
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
    /// Output of the read command as of the last create or update.
    #[serde(default)]
    pub output: String,
    /// Set by read when the read command now prints something else.
    #[serde(default)]
    pub dirty_output: String,
    /// Set by read when the read command exits nonzero.
    #[serde(default)]
    pub faulty_output: String,
}

impl fmt::Debug for ScriptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sensitive: BTreeMap<&str, &str> = self
            .sensitive_environment
            .keys()
            .map(|k| (k.as_str(), REDACTION))
            .collect();
        f.debug_struct("ScriptState")
            .field("lifecycle_commands", &self.lifecycle_commands)
            .field("interpreter", &self.interpreter)
            .field("triggers", &self.triggers)
            .field("environment", &self.environment)
            .field("sensitive_environment", &sensitive)
            .field("working_directory", &self.working_directory)
            .field("output", &self.output)
            .field("dirty_output", &self.dirty_output)
            .field("faulty_output", &self.faulty_output)
            .finish()
    }
}

fn changed_map_keys(
    prefix: &str,
    a: &BTreeMap<String, String>,
    b: &BTreeMap<String, String>,
    out: &mut Vec<String>,
) {
    let names: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    for name in names {
        if a.get(name) != b.get(name) {
            out.push(format!("{}.{}", prefix, name));
        }
    }
}

impl ScriptState {
    pub fn new(commands: LifecycleCommands) -> Self {
        Self {
            lifecycle_commands: commands,
            interpreter: Vec::new(),
            triggers: BTreeMap::new(),
            environment: BTreeMap::new(),
            sensitive_environment: BTreeMap::new(),
            working_directory: default_working_directory(),
            output: String::new(),
            dirty_output: String::new(),
            faulty_output: String::new(),
        }
    }

    /// Builds the script for one lifecycle phase. Sensitive variables are
    /// merged over the plain ones and scrubbed from errors.
    pub fn script(&self, body: &str) -> Script {
        let mut environment = self.environment.clone();
        environment.extend(self.sensitive_environment.clone());
        Script {
            workdir: self.working_directory.clone(),
            environment,
            interpreter: self.interpreter.clone(),
            body: body.to_string(),
            stdin: None,
            secrets: self
                .sensitive_environment
                .values()
                .filter(|v| !v.is_empty())
                .cloned()
                .collect(),
        }
    }

    /// Flattened names of every attribute that differs from `other`.
    pub fn changed_keys(&self, other: &ScriptState) -> Vec<String> {
        let mut keys = Vec::new();
        let (a, b) = (&self.lifecycle_commands, &other.lifecycle_commands);
        if a.create != b.create {
            keys.push("lifecycle_commands.create".to_string());
        }
        if a.read != b.read {
            keys.push("lifecycle_commands.read".to_string());
        }
        if a.update != b.update {
            keys.push("lifecycle_commands.update".to_string());
        }
        if a.delete != b.delete {
            keys.push("lifecycle_commands.delete".to_string());
        }
        if self.interpreter != other.interpreter {
            keys.push("interpreter".to_string());
        }
        changed_map_keys("triggers", &self.triggers, &other.triggers, &mut keys);
        changed_map_keys("environment", &self.environment, &other.environment, &mut keys);
        changed_map_keys(
            "sensitive_environment",
            &self.sensitive_environment,
            &other.sensitive_environment,
            &mut keys,
        );
        if self.working_directory != other.working_directory {
            keys.push("working_directory".to_string());
        }
        if self.output != other.output {
            keys.push("output".to_string());
        }
        if self.dirty_output != other.dirty_output {
            keys.push("dirty_output".to_string());
        }
        if self.faulty_output != other.faulty_output {
            keys.push("faulty_output".to_string());
        }
        keys
    }

    fn commands_differ(&self, other: &ScriptState) -> bool {
        self.lifecycle_commands != other.lifecycle_commands || self.interpreter != other.interpreter
    }

    fn validate(&self) -> Result<(), RemoteError> {
        let c = &self.lifecycle_commands;
        for (phase, body) in [("create", &c.create), ("read", &c.read), ("delete", &c.delete)] {
            if body.trim().is_empty() {
                return Err(RemoteError::invalid_params(format!(
                    "lifecycle_commands.{} must not be empty",
                    phase
                )));
            }
        }
        Ok(())
    }
}

fn run_read(exec: &dyn Executor, state: &ScriptState) -> Result<String, RemoteError> {
    state.script(&state.lifecycle_commands.read).exec(exec)
}

/// Runs create, then read to record the initial output.
pub fn create_script(exec: &dyn Executor, desired: &ScriptState) -> Result<ScriptState, RemoteError> {
    desired.validate()?;
    desired.script(&desired.lifecycle_commands.create).exec(exec)?;
    let mut state = desired.clone();
    state.output = run_read(exec, desired)?;
    state.dirty_output.clear();
    state.faulty_output.clear();
    Ok(state)
}

/// Re-runs the read command without touching `output`: a changed result
/// sets `dirty_output`, a nonzero exit sets `faulty_output`. Transport
/// failures are returned as errors.
pub fn read_script(exec: &dyn Executor, known: &ScriptState) -> Result<ScriptState, RemoteError> {
    let mut state = known.clone();
    state.dirty_output.clear();
    state.faulty_output.clear();
    match run_read(exec, known) {
        Ok(observed) => {
            if observed != known.output {
                state.dirty_output = format!("Dirty output detected:\n\n{}", observed);
            }
        }
        Err(err) if err.is_exit() => {
            state.faulty_output = format!("Faulty output produced:\n\n{}", err);
        }
        Err(err) => return Err(err),
    }
    Ok(state)
}

/// Command-only changes re-run read when the read command changed and
/// otherwise just adopt the new commands. Input changes run the update
/// command with the previous output on stdin, then read.
pub fn update_script(
    exec: &dyn Executor,
    old: Option<&ScriptState>,
    new: Option<&ScriptState>,
) -> Result<Option<ScriptState>, RemoteError> {
    let (old, new) = match (old, new) {
        (None, Some(new)) => return create_script(exec, new).map(Some),
        (Some(old), None) => return delete_script(exec, old).map(|_| None),
        (None, None) => return Ok(None),
        (Some(old), Some(new)) => (old, new),
    };
    new.validate()?;

    let mut state = new.clone();
    state.output = old.output.clone();
    state.dirty_output = old.dirty_output.clone();
    state.faulty_output = old.faulty_output.clone();

    if old.commands_differ(new) {
        if old.lifecycle_commands.read != new.lifecycle_commands.read {
            state.output = run_read(exec, new)?;
            state.dirty_output.clear();
            state.faulty_output.clear();
        }
        return Ok(Some(state));
    }

    let body = new
        .lifecycle_commands
        .update
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            RemoteError::validation("in-place update requires lifecycle_commands.update")
        })?;
    new.script(body)
        .with_stdin(old.output.as_bytes().to_vec())
        .exec(exec)?;
    state.output = run_read(exec, new)?;
    state.dirty_output.clear();
    state.faulty_output.clear();
    Ok(Some(state))
}

/// Skipped when the last read failed: the object is already considered gone.
pub fn delete_script(exec: &dyn Executor, known: &ScriptState) -> Result<(), RemoteError> {
    if !known.faulty_output.is_empty() {
        return Ok(());
    }
    known.script(&known.lifecycle_commands.delete).exec(exec)?;
    Ok(())
}

#[derive(Clone)]
pub struct ScriptManager {
    logger: Logger,
    executor: Arc<dyn Executor>,
}

impl ScriptManager {
    pub fn new(logger: Logger, executor: Arc<dyn Executor>) -> Self {
        Self {
            logger: logger.child("script"),
            executor,
        }
    }
}

#[async_trait]
impl ResourceHandler for ScriptManager {
    type State = ScriptState;

    async fn create(&self, desired: ScriptState) -> Result<Created<ScriptState>, RemoteError> {
        self.logger.debug(
            "create",
            Some(&serde_json::json!({"working_directory": desired.working_directory})),
        );
        let executor = self.executor.clone();
        let state =
            run_blocking("script create", move || create_script(executor.as_ref(), &desired))
                .await?;
        Ok(Created {
            id: new_resource_id(),
            state,
        })
    }

    async fn read(&self, _id: &str, known: ScriptState) -> Result<Option<ScriptState>, RemoteError> {
        let executor = self.executor.clone();
        let state =
            run_blocking("script read", move || read_script(executor.as_ref(), &known)).await?;
        if !state.faulty_output.is_empty() {
            self.logger.warn("read command failed", None);
        } else if !state.dirty_output.is_empty() {
            self.logger.info("read output drifted", None);
        }
        Ok(Some(state))
    }

    async fn update(
        &self,
        old: Option<ScriptState>,
        new: Option<ScriptState>,
    ) -> Result<Option<ScriptState>, RemoteError> {
        let changed = match (&old, &new) {
            (Some(old), Some(new)) => old.changed_keys(new),
            _ => Vec::new(),
        };
        self.logger.debug("update", Some(&serde_json::json!({"changed": changed})));
        let executor = self.executor.clone();
        run_blocking("script update", move || {
            update_script(executor.as_ref(), old.as_ref(), new.as_ref())
        })
        .await
    }

    async fn delete(&self, known: ScriptState) -> Result<(), RemoteError> {
        self.logger.debug(
            "delete",
            Some(&serde_json::json!({"skipped": !known.faulty_output.is_empty()})),
        );
        let executor = self.executor.clone();
        run_blocking("script delete", move || delete_script(executor.as_ref(), &known)).await
    }

    fn classify_diff(
        &self,
        prior: &ScriptState,
        desired: &ScriptState,
    ) -> Result<Decision, RemoteError> {
        let flags = PriorFlags {
            read_failed: !prior.faulty_output.is_empty(),
            update_declared: desired.lifecycle_commands.update_declared(),
        };
        classify(
            &DiffAttributeSet::script(),
            prior.changed_keys(desired),
            flags,
        )
    }
}

/// Read-only view of a script: only the read command is ever run.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptQuery {
    pub read: String,
    #[serde(default)]
    pub interpreter: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub sensitive_environment: BTreeMap<String, String>,
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
}

impl ScriptQuery {
    pub fn new(read: impl Into<String>) -> Self {
        Self {
            read: read.into(),
            interpreter: Vec::new(),
            environment: BTreeMap::new(),
            sensitive_environment: BTreeMap::new(),
            working_directory: default_working_directory(),
        }
    }

    fn as_state(&self) -> ScriptState {
        let mut state = ScriptState::new(LifecycleCommands {
            read: self.read.clone(),
            ..LifecycleCommands::default()
        });
        state.interpreter = self.interpreter.clone();
        state.environment = self.environment.clone();
        state.sensitive_environment = self.sensitive_environment.clone();
        state.working_directory = self.working_directory.clone();
        state
    }
}

#[derive(Clone)]
pub struct ScriptDataSource {
    logger: Logger,
    executor: Arc<dyn Executor>,
}

impl ScriptDataSource {
    pub fn new(logger: Logger, executor: Arc<dyn Executor>) -> Self {
        Self {
            logger: logger.child("script_data"),
            executor,
        }
    }

    /// Any failure, including a nonzero exit, is an error here.
    pub async fn read(&self, query: ScriptQuery) -> Result<String, RemoteError> {
        self.logger.debug("read", None);
        let executor = self.executor.clone();
        run_blocking("script data read", move || {
            run_read(executor.as_ref(), &query.as_state())
        })
        .await
    }
}
