use super::{new_resource_id, run_blocking, Created, ResourceHandler};
use crate::constants::files::DEFAULT_DIRECTORY_MODE;
use crate::diff::Decision;
use crate::errors::RemoteError;
use crate::executor::Executor;
use crate::filesystem::{self, Permission};
use crate::services::logger::Logger;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn default_permission() -> Permission {
    Permission {
        owner: 0,
        group: 0,
        mode: DEFAULT_DIRECTORY_MODE.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDirectory {
    pub path: String,
    #[serde(default = "default_permission")]
    pub permission: Permission,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub recycle_path: String,
}

impl RemoteDirectory {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            permission: default_permission(),
            overwrite: false,
            recycle_path: String::new(),
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_recycle_path(mut self, recycle_path: impl Into<String>) -> Self {
        self.recycle_path = recycle_path.into();
        self
    }

    fn validate(&self) -> Result<(), RemoteError> {
        if self.path.trim().is_empty() {
            return Err(RemoteError::invalid_params("directory path must not be empty"));
        }
        self.permission.validate()
    }
}

pub fn create_directory(exec: &dyn Executor, dir: &RemoteDirectory) -> Result<(), RemoteError> {
    dir.validate()?;
    if !dir.overwrite {
        filesystem::reserve_path(exec, &dir.path)?;
    }
    filesystem::mkdirp(exec, &dir.path)?;
    filesystem::set_permission(exec, &dir.path, &dir.permission)
}

pub fn read_directory(exec: &dyn Executor, path: &str) -> Result<RemoteDirectory, RemoteError> {
    let permission = filesystem::get_permission(exec, path)?;
    Ok(RemoteDirectory {
        path: path.to_string(),
        permission,
        overwrite: false,
        recycle_path: String::new(),
    })
}

/// A path change carries the directory's entries over to the new path
/// before permissions are re-applied there.
pub fn update_directory(
    exec: &dyn Executor,
    old: Option<&RemoteDirectory>,
    new: Option<&RemoteDirectory>,
) -> Result<(), RemoteError> {
    let (old, new) = match (old, new) {
        (None, Some(new)) => return create_directory(exec, new),
        (Some(old), None) => return delete_directory(exec, old),
        (None, None) => return Ok(()),
        (Some(old), Some(new)) => (old, new),
    };
    new.validate()?;
    if old.path != new.path {
        if !new.overwrite {
            filesystem::reserve_path(exec, &new.path)?;
        }
        filesystem::move_directory(exec, &old.path, &new.path)?;
    }
    let mut applied = new.clone();
    applied.overwrite = true;
    create_directory(exec, &applied)
}

pub fn delete_directory(exec: &dyn Executor, dir: &RemoteDirectory) -> Result<(), RemoteError> {
    filesystem::remove(exec, &dir.path, &dir.recycle_path)
}

#[derive(Clone)]
pub struct DirectoryManager {
    logger: Logger,
    executor: Arc<dyn Executor>,
}

impl DirectoryManager {
    pub fn new(logger: Logger, executor: Arc<dyn Executor>) -> Self {
        Self {
            logger: logger.child("directory"),
            executor,
        }
    }

    async fn read_back(
        &self,
        known: RemoteDirectory,
    ) -> Result<Option<RemoteDirectory>, RemoteError> {
        let executor = self.executor.clone();
        let path = known.path.clone();
        let found = run_blocking("directory read", move || {
            match read_directory(executor.as_ref(), &path) {
                Ok(dir) => Ok(Some(dir)),
                Err(err) if err.is_path_not_exist() => Ok(None),
                Err(err) => Err(err),
            }
        })
        .await?;
        Ok(found.map(|mut dir| {
            dir.overwrite = known.overwrite;
            dir.recycle_path = known.recycle_path;
            dir
        }))
    }
}

#[async_trait]
impl ResourceHandler for DirectoryManager {
    type State = RemoteDirectory;

    async fn create(
        &self,
        desired: RemoteDirectory,
    ) -> Result<Created<RemoteDirectory>, RemoteError> {
        self.logger.debug(
            "create",
            Some(&serde_json::json!({"path": desired.path, "overwrite": desired.overwrite})),
        );
        let executor = self.executor.clone();
        let dir = desired.clone();
        run_blocking("directory create", move || {
            create_directory(executor.as_ref(), &dir)
        })
        .await?;
        let path = desired.path.clone();
        let state = self.read_back(desired).await?.ok_or_else(|| {
            RemoteError::internal(format!("directory '{}' vanished right after create", path))
        })?;
        Ok(Created {
            id: new_resource_id(),
            state,
        })
    }

    async fn read(
        &self,
        _id: &str,
        known: RemoteDirectory,
    ) -> Result<Option<RemoteDirectory>, RemoteError> {
        self.read_back(known).await
    }

    async fn update(
        &self,
        old: Option<RemoteDirectory>,
        new: Option<RemoteDirectory>,
    ) -> Result<Option<RemoteDirectory>, RemoteError> {
        self.logger.debug(
            "update",
            Some(&serde_json::json!({
                "from": old.as_ref().map(|d| d.path.clone()),
                "to": new.as_ref().map(|d| d.path.clone()),
            })),
        );
        let executor = self.executor.clone();
        let (before, after) = (old.clone(), new.clone());
        run_blocking("directory update", move || {
            update_directory(executor.as_ref(), before.as_ref(), after.as_ref())
        })
        .await?;
        match new {
            Some(new) => self.read_back(new).await,
            None => Ok(None),
        }
    }

    async fn delete(&self, known: RemoteDirectory) -> Result<(), RemoteError> {
        self.logger.debug(
            "delete",
            Some(&serde_json::json!({"path": known.path, "recycle_path": known.recycle_path})),
        );
        let executor = self.executor.clone();
        run_blocking("directory delete", move || {
            delete_directory(executor.as_ref(), &known)
        })
        .await
    }

    fn classify_diff(
        &self,
        prior: &RemoteDirectory,
        desired: &RemoteDirectory,
    ) -> Result<Decision, RemoteError> {
        if prior == desired {
            Ok(Decision::NoRemoteAction)
        } else {
            Ok(Decision::InPlaceUpdate {
                recompute_outputs: false,
            })
        }
    }
}
