use super::{new_resource_id, run_blocking, Created, ResourceHandler};
use crate::constants::files::DEFAULT_FILE_MODE;
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
        mode: DEFAULT_FILE_MODE.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_permission")]
    pub permission: Permission,
    /// Content is neither uploaded nor read back; the file is only touched.
    #[serde(default)]
    pub ignore_content: bool,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub recycle_path: String,
}

impl RemoteFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            permission: default_permission(),
            ignore_content: false,
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
            return Err(RemoteError::invalid_params("file path must not be empty"));
        }
        self.permission.validate()
    }
}

fn parent_dir(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// Steps run in order with no rollback: a failure after the upload leaves
/// the content in place with the old permission. Re-running with
/// `overwrite` set converges.
pub fn create_file(exec: &dyn Executor, file: &RemoteFile) -> Result<(), RemoteError> {
    file.validate()?;
    if !file.overwrite {
        filesystem::reserve_path(exec, &file.path)?;
    }
    filesystem::mkdirp(exec, parent_dir(&file.path))?;
    if file.ignore_content {
        filesystem::touch(exec, &file.path)?;
    } else {
        exec.upload(&file.path, file.content.as_bytes())?;
    }
    filesystem::set_permission(exec, &file.path, &file.permission)
}

/// Reads permission and, unless ignored, content. Absence is `PathNotExist`.
pub fn read_file(
    exec: &dyn Executor,
    path: &str,
    ignore_content: bool,
) -> Result<RemoteFile, RemoteError> {
    let permission = filesystem::get_permission(exec, path)?;
    let content = if ignore_content {
        String::new()
    } else {
        filesystem::cat(exec, path)?
    };
    Ok(RemoteFile {
        path: path.to_string(),
        content,
        permission,
        ignore_content,
        overwrite: false,
        recycle_path: String::new(),
    })
}

pub fn update_file(
    exec: &dyn Executor,
    old: Option<&RemoteFile>,
    new: Option<&RemoteFile>,
) -> Result<(), RemoteError> {
    let (old, new) = match (old, new) {
        (None, Some(new)) => return create_file(exec, new),
        (Some(old), None) => return delete_file(exec, old),
        (None, None) => return Ok(()),
        (Some(old), Some(new)) => (old, new),
    };
    new.validate()?;
    if old.path != new.path {
        if !new.overwrite {
            filesystem::reserve_path(exec, &new.path)?;
        }
        filesystem::mkdirp(exec, parent_dir(&new.path))?;
        filesystem::mv(exec, &old.path, &new.path)?;
    }
    let mut applied = new.clone();
    applied.overwrite = true;
    create_file(exec, &applied)
}

pub fn delete_file(exec: &dyn Executor, file: &RemoteFile) -> Result<(), RemoteError> {
    filesystem::remove(exec, &file.path, &file.recycle_path)
}

#[derive(Clone)]
pub struct FileManager {
    logger: Logger,
    executor: Arc<dyn Executor>,
}

impl FileManager {
    pub fn new(logger: Logger, executor: Arc<dyn Executor>) -> Self {
        Self {
            logger: logger.child("file"),
            executor,
        }
    }

    async fn read_back(&self, known: RemoteFile) -> Result<Option<RemoteFile>, RemoteError> {
        let executor = self.executor.clone();
        let path = known.path.clone();
        let ignore_content = known.ignore_content;
        let found = run_blocking("file read", move || {
            match read_file(executor.as_ref(), &path, ignore_content) {
                Ok(file) => Ok(Some(file)),
                Err(err) if err.is_path_not_exist() => Ok(None),
                Err(err) => Err(err),
            }
        })
        .await?;
        Ok(found.map(|mut file| {
            file.overwrite = known.overwrite;
            file.recycle_path = known.recycle_path;
            if file.ignore_content {
                file.content = known.content;
            }
            file
        }))
    }
}

#[async_trait]
impl ResourceHandler for FileManager {
    type State = RemoteFile;

    async fn create(&self, desired: RemoteFile) -> Result<Created<RemoteFile>, RemoteError> {
        self.logger.debug(
            "create",
            Some(&serde_json::json!({"path": desired.path, "overwrite": desired.overwrite})),
        );
        let executor = self.executor.clone();
        let file = desired.clone();
        run_blocking("file create", move || create_file(executor.as_ref(), &file)).await?;
        let state = self.read_back(desired.clone()).await?.ok_or_else(|| {
            RemoteError::internal(format!("file '{}' vanished right after create", desired.path))
        })?;
        Ok(Created {
            id: new_resource_id(),
            state,
        })
    }

    async fn read(&self, _id: &str, known: RemoteFile) -> Result<Option<RemoteFile>, RemoteError> {
        self.read_back(known).await
    }

    async fn update(
        &self,
        old: Option<RemoteFile>,
        new: Option<RemoteFile>,
    ) -> Result<Option<RemoteFile>, RemoteError> {
        self.logger.debug(
            "update",
            Some(&serde_json::json!({
                "from": old.as_ref().map(|f| f.path.clone()),
                "to": new.as_ref().map(|f| f.path.clone()),
            })),
        );
        let executor = self.executor.clone();
        let (before, after) = (old.clone(), new.clone());
        run_blocking("file update", move || {
            update_file(executor.as_ref(), before.as_ref(), after.as_ref())
        })
        .await?;
        match new {
            Some(new) => self.read_back(new).await,
            None => Ok(None),
        }
    }

    async fn delete(&self, known: RemoteFile) -> Result<(), RemoteError> {
        self.logger.debug(
            "delete",
            Some(&serde_json::json!({"path": known.path, "recycle_path": known.recycle_path})),
        );
        let executor = self.executor.clone();
        run_blocking("file delete", move || delete_file(executor.as_ref(), &known)).await
    }

    fn classify_diff(
        &self,
        prior: &RemoteFile,
        desired: &RemoteFile,
    ) -> Result<Decision, RemoteError> {
        let mut prior = prior.clone();
        let mut desired = desired.clone();
        if desired.ignore_content {
            prior.content.clear();
            desired.content.clear();
        }
        if prior == desired {
            Ok(Decision::NoRemoteAction)
        } else {
            Ok(Decision::InPlaceUpdate {
                recompute_outputs: false,
            })
        }
    }
}
