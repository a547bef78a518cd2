//! Entry point for the framework: resolves which session a resource talks
//! to and hands out handlers bound to it.

use crate::connection::{
    ConnectionConfig, ConnectionIdentity, ConnectionOverride, ConnectionRegistry, Session,
};
use crate::errors::RemoteError;
use crate::executor::Executor;
use crate::managers::{DirectoryManager, FileManager, ScriptDataSource, ScriptManager};
use crate::services::logger::Logger;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct Provider {
    logger: Logger,
    registry: ConnectionRegistry,
    default_session: Arc<Session>,
}

impl Provider {
    pub fn new(config: ConnectionConfig, logger: Logger) -> Result<Self, RemoteError> {
        let logger = logger.child("provider");
        let registry = ConnectionRegistry::new(logger.clone());
        let identity = ConnectionIdentity::derive(&config);
        let default_session = registry.acquire(identity, config)?;
        Ok(Self {
            logger,
            registry,
            default_session,
        })
    }

    pub fn from_value(settings: &Value, logger: Logger) -> Result<Self, RemoteError> {
        Self::new(ConnectionConfig::from_value(settings)?, logger)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn default_session(&self) -> Arc<Session> {
        self.default_session.clone()
    }

    /// The provider-level session, or the shared session for an override's
    /// id. An id reused with different parameters is rejected.
    pub fn session_for(
        &self,
        override_: Option<&ConnectionOverride>,
    ) -> Result<Arc<Session>, RemoteError> {
        match override_ {
            None => Ok(self.default_session.clone()),
            Some(o) => self.registry.acquire(o.identity(), o.config.clone()),
        }
    }

    pub fn executor_for(
        &self,
        override_: Option<&ConnectionOverride>,
    ) -> Result<Arc<dyn Executor>, RemoteError> {
        let session: Arc<dyn Executor> = self.session_for(override_)?;
        Ok(session)
    }

    pub fn file(&self, override_: Option<&ConnectionOverride>) -> Result<FileManager, RemoteError> {
        Ok(FileManager::new(self.logger.clone(), self.executor_for(override_)?))
    }

    pub fn directory(
        &self,
        override_: Option<&ConnectionOverride>,
    ) -> Result<DirectoryManager, RemoteError> {
        Ok(DirectoryManager::new(
            self.logger.clone(),
            self.executor_for(override_)?,
        ))
    }

    pub fn script(
        &self,
        override_: Option<&ConnectionOverride>,
    ) -> Result<ScriptManager, RemoteError> {
        Ok(ScriptManager::new(self.logger.clone(), self.executor_for(override_)?))
    }

    pub fn script_data_source(
        &self,
        override_: Option<&ConnectionOverride>,
    ) -> Result<ScriptDataSource, RemoteError> {
        Ok(ScriptDataSource::new(
            self.logger.clone(),
            self.executor_for(override_)?,
        ))
    }
}
