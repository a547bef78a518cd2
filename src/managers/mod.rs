//! Resource handlers: the create/read/update/delete boundary the declarative
//! framework calls into.
//!
//! The reconciliation logic itself is synchronous and lives in plain
//! functions taking `&dyn Executor`; the handlers move each call onto the
//! blocking pool.

pub mod directory;
pub mod file;
pub mod script;

pub use directory::{DirectoryManager, RemoteDirectory};
pub use file::{FileManager, RemoteFile};
pub use script::{LifecycleCommands, ScriptDataSource, ScriptManager, ScriptQuery, ScriptState};

use crate::diff::Decision;
use crate::errors::RemoteError;
use async_trait::async_trait;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created<S> {
    pub id: String,
    pub state: S,
}

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    type State: Clone + Send + Sync + 'static;

    /// Creates the remote object and returns a fresh id with the state read
    /// back from the host.
    async fn create(&self, desired: Self::State) -> Result<Created<Self::State>, RemoteError>;

    /// `Ok(None)` means the object is gone and the caller should forget it.
    async fn read(&self, id: &str, known: Self::State)
        -> Result<Option<Self::State>, RemoteError>;

    /// `old == None` creates, `new == None` deletes and returns `None`.
    async fn update(
        &self,
        old: Option<Self::State>,
        new: Option<Self::State>,
    ) -> Result<Option<Self::State>, RemoteError>;

    /// Succeeds when the object is already absent.
    async fn delete(&self, known: Self::State) -> Result<(), RemoteError>;

    fn classify_diff(
        &self,
        prior: &Self::State,
        desired: &Self::State,
    ) -> Result<Decision, RemoteError>;
}

pub(crate) fn new_resource_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) async fn run_blocking<T, F>(label: &str, op: F) -> Result<T, RemoteError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RemoteError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|_| RemoteError::internal(format!("{} task failed", label)))?
}
