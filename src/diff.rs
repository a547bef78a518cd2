//! Decides how a changed desired state reaches the remote host.
//!
//! [`classify`] is a pure function over flattened attribute names such as
//! `lifecycle_commands.read` or `environment.CONTENT`. A key belongs to the
//! partition its root (the text before the first `.`) is registered in.

use crate::errors::RemoteError;
use std::collections::BTreeSet;

pub const READ_COMMAND_KEY: &str = "lifecycle_commands.read";
pub const FAULTY_OUTPUT_KEY: &str = "faulty_output";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Commands,
    Inputs,
    Outputs,
    Internal,
    Triggers,
}

#[derive(Debug, Clone, Default)]
pub struct DiffAttributeSet {
    pub commands: BTreeSet<String>,
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
    pub internal: BTreeSet<String>,
    /// Inert markers whose only effect is forcing recreation.
    pub triggers: BTreeSet<String>,
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl DiffAttributeSet {
    /// Partitions of the script resource.
    pub fn script() -> Self {
        Self {
            commands: set(&["lifecycle_commands", "interpreter"]),
            inputs: set(&["environment", "sensitive_environment", "working_directory"]),
            outputs: set(&["output"]),
            internal: set(&["dirty_output", "faulty_output"]),
            triggers: set(&["triggers"]),
        }
    }

    pub fn partition_of(&self, key: &str) -> Option<Partition> {
        let root = key.split('.').next().unwrap_or(key);
        if self.commands.contains(root) {
            Some(Partition::Commands)
        } else if self.inputs.contains(root) {
            Some(Partition::Inputs)
        } else if self.outputs.contains(root) {
            Some(Partition::Outputs)
        } else if self.internal.contains(root) {
            Some(Partition::Internal)
        } else if self.triggers.contains(root) {
            Some(Partition::Triggers)
        } else {
            None
        }
    }
}

/// What the prior state says about the resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorFlags {
    /// The last read command exited nonzero.
    pub read_failed: bool,
    /// The desired state declares an update command.
    pub update_declared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NoRemoteAction,
    InPlaceUpdate { recompute_outputs: bool },
    ForceRecreate { keys: Vec<String> },
}

impl Decision {
    pub fn is_recreate(&self) -> bool {
        matches!(self, Decision::ForceRecreate { .. })
    }
}

#[derive(Default)]
struct Changed {
    commands: Vec<String>,
    inputs: Vec<String>,
    internal: Vec<String>,
    triggers: Vec<String>,
    unknown: Vec<String>,
}

/// Classifies one transaction's changed keys.
///
/// Command and input changes may not be mixed. A read-command change only
/// re-reads. A recorded read failure forces recreation. Input and drift
/// marker changes are applied in place when an update command exists and
/// force recreation otherwise. Trigger changes always force recreation.
pub fn classify<I, S>(
    attrs: &DiffAttributeSet,
    changed: I,
    prior: PriorFlags,
) -> Result<Decision, RemoteError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut buckets = Changed::default();
    let mut read_changed = false;
    for key in changed {
        let key = key.as_ref().to_string();
        match attrs.partition_of(&key) {
            Some(Partition::Commands) => {
                read_changed |= key == READ_COMMAND_KEY;
                buckets.commands.push(key);
            }
            Some(Partition::Inputs) => buckets.inputs.push(key),
            Some(Partition::Outputs) => {}
            Some(Partition::Internal) => buckets.internal.push(key),
            Some(Partition::Triggers) => buckets.triggers.push(key),
            None => buckets.unknown.push(key),
        }
    }
    for list in [
        &mut buckets.commands,
        &mut buckets.inputs,
        &mut buckets.internal,
        &mut buckets.triggers,
        &mut buckets.unknown,
    ] {
        list.sort();
        list.dedup();
    }

    let decision = classify_changes(&buckets, read_changed, prior)?;
    if buckets.triggers.is_empty() {
        return Ok(decision);
    }
    let mut keys = match decision {
        Decision::ForceRecreate { keys } => keys,
        _ => Vec::new(),
    };
    keys.extend(buckets.triggers.iter().cloned());
    keys.sort();
    keys.dedup();
    Ok(Decision::ForceRecreate { keys })
}

fn classify_changes(
    changed: &Changed,
    read_changed: bool,
    prior: PriorFlags,
) -> Result<Decision, RemoteError> {
    if !changed.commands.is_empty() {
        let others: Vec<&str> = changed
            .inputs
            .iter()
            .chain(changed.unknown.iter())
            .map(String::as_str)
            .collect();
        if !others.is_empty() {
            return Err(RemoteError::validation(format!(
                "update to '{}' should not be combined with update to other arguments: {}",
                changed.commands.join(","),
                others.join(",")
            )));
        }
        if read_changed {
            return Ok(Decision::InPlaceUpdate {
                recompute_outputs: true,
            });
        }
    }

    if prior.read_failed {
        return Ok(Decision::ForceRecreate {
            keys: vec![FAULTY_OUTPUT_KEY.to_string()],
        });
    }
    if !changed.commands.is_empty() {
        return Ok(Decision::NoRemoteAction);
    }
    // Internal markers such as `dirty_output` record drift found by a read;
    // clearing them needs the same repair as an input change.
    if changed.inputs.is_empty() && changed.internal.is_empty() && changed.unknown.is_empty() {
        return Ok(Decision::NoRemoteAction);
    }
    if prior.update_declared && changed.unknown.is_empty() {
        return Ok(Decision::InPlaceUpdate {
            recompute_outputs: true,
        });
    }

    let mut keys: Vec<String> = changed
        .inputs
        .iter()
        .chain(changed.internal.iter())
        .chain(changed.unknown.iter())
        .cloned()
        .collect();
    keys.sort();
    Ok(Decision::ForceRecreate { keys })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn run(changed: &[&str], prior: PriorFlags) -> Result<Decision, RemoteError> {
        classify(&DiffAttributeSet::script(), changed.iter(), prior)
    }

    fn with_update() -> PriorFlags {
        PriorFlags {
            update_declared: true,
            ..PriorFlags::default()
        }
    }

    #[test]
    fn mixed_command_and_input_changes_are_rejected() {
        let err = run(
            &["lifecycle_commands.read", "environment.CONTENT"],
            with_update(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("should not be combined"));
        assert!(err.message.contains("lifecycle_commands.read"));
        assert!(err.message.contains("environment.CONTENT"));
    }

    #[test]
    fn interpreter_with_working_directory_is_rejected() {
        let err = run(&["interpreter", "working_directory"], PriorFlags::default()).unwrap_err();
        assert!(err.message.starts_with("update to 'interpreter'"));
    }

    #[test]
    fn read_command_change_only_rereads() {
        let decision = run(&["lifecycle_commands.read"], PriorFlags::default()).unwrap();
        assert_eq!(
            decision,
            Decision::InPlaceUpdate {
                recompute_outputs: true
            }
        );
    }

    #[test]
    fn read_command_change_wins_over_prior_read_failure() {
        let prior = PriorFlags {
            read_failed: true,
            ..PriorFlags::default()
        };
        let decision = run(&["lifecycle_commands.read"], prior).unwrap();
        assert!(!decision.is_recreate());
    }

    #[test]
    fn prior_read_failure_forces_recreate() {
        let prior = PriorFlags {
            read_failed: true,
            update_declared: true,
        };
        assert_eq!(
            run(&[], prior).unwrap(),
            Decision::ForceRecreate {
                keys: vec!["faulty_output".to_string()]
            }
        );
        assert!(run(&["environment.X"], prior).unwrap().is_recreate());
    }

    #[test]
    fn other_command_changes_need_no_remote_action() {
        let decision = run(
            &["lifecycle_commands.update", "lifecycle_commands.delete"],
            PriorFlags::default(),
        )
        .unwrap();
        assert_eq!(decision, Decision::NoRemoteAction);
    }

    #[test]
    fn nothing_changed_is_no_op() {
        assert_eq!(
            run(&[], PriorFlags::default()).unwrap(),
            Decision::NoRemoteAction
        );
        assert_eq!(
            run(&["output"], PriorFlags::default()).unwrap(),
            Decision::NoRemoteAction
        );
    }

    #[test]
    fn drift_with_update_command_is_repaired_in_place() {
        assert_eq!(
            run(&["output", "dirty_output"], with_update()).unwrap(),
            Decision::InPlaceUpdate {
                recompute_outputs: true
            }
        );
    }

    #[test]
    fn drift_without_update_command_recreates() {
        assert_eq!(
            run(&["output", "dirty_output"], PriorFlags::default()).unwrap(),
            Decision::ForceRecreate {
                keys: vec!["dirty_output".to_string()]
            }
        );
    }

    #[test]
    fn input_change_with_update_command_is_in_place() {
        let decision = run(&["environment.CONTENT"], with_update()).unwrap();
        assert_eq!(
            decision,
            Decision::InPlaceUpdate {
                recompute_outputs: true
            }
        );
    }

    #[test]
    fn input_change_without_update_command_recreates_per_key() {
        let decision = run(
            &["working_directory", "sensitive_environment.TOKEN", "dirty_output"],
            PriorFlags::default(),
        )
        .unwrap();
        assert_eq!(
            decision,
            Decision::ForceRecreate {
                keys: vec![
                    "dirty_output".to_string(),
                    "sensitive_environment.TOKEN".to_string(),
                    "working_directory".to_string(),
                ]
            }
        );
    }

    #[test]
    fn unknown_keys_force_recreate_even_with_update_command() {
        let decision = run(&["mystery"], with_update()).unwrap();
        assert_eq!(
            decision,
            Decision::ForceRecreate {
                keys: vec!["mystery".to_string()]
            }
        );
    }

    #[test]
    fn trigger_changes_always_recreate() {
        let decision = run(&["triggers.version"], with_update()).unwrap();
        assert_eq!(
            decision,
            Decision::ForceRecreate {
                keys: vec!["triggers.version".to_string()]
            }
        );
        let merged = run(
            &["triggers.version", "environment.A"],
            PriorFlags::default(),
        )
        .unwrap();
        assert_eq!(
            merged,
            Decision::ForceRecreate {
                keys: vec!["environment.A".to_string(), "triggers.version".to_string()]
            }
        );
    }

    #[test]
    fn duplicate_keys_are_collapsed() {
        let decision = run(&["environment.A", "environment.A"], PriorFlags::default()).unwrap();
        assert_eq!(
            decision,
            Decision::ForceRecreate {
                keys: vec!["environment.A".to_string()]
            }
        );
    }
}
