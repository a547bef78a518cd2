use super::{ConnectionConfig, ConnectionIdentity, Session, SessionStatus};
use crate::errors::RemoteError;
use crate::services::logger::Logger;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Shares one [`Session`] per identity.
///
/// Registering a different config under an identity that is already held is
/// a configuration error: neither parameter set is authoritative.
#[derive(Clone)]
pub struct ConnectionRegistry {
    logger: Logger,
    sessions: Arc<DashMap<ConnectionIdentity, Arc<Session>>>,
}

impl ConnectionRegistry {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("registry"),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Returns the shared session for `identity`, creating an unconnected
    /// one on first use. Connecting happens lazily on the first command.
    pub fn acquire(
        &self,
        identity: ConnectionIdentity,
        config: ConnectionConfig,
    ) -> Result<Arc<Session>, RemoteError> {
        config.validate()?;
        match self.sessions.entry(identity) {
            Entry::Occupied(entry) => {
                if entry.get().config() != &config {
                    return Err(RemoteError::invalid_params(format!(
                        "conflicting connection '{}'",
                        entry.key()
                    ))
                    .with_hint("Use one set of connection parameters per connection id."));
                }
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                self.logger.debug(
                    "Registered connection",
                    Some(&serde_json::json!({
                        "identity": entry.key().as_str(),
                        "host": config.host,
                        "port": config.port,
                    })),
                );
                let session = Arc::new(Session::new(
                    entry.key().clone(),
                    config,
                    self.logger.clone(),
                ));
                entry.insert(session.clone());
                Ok(session)
            }
        }
    }

    pub fn get(&self, identity: &ConnectionIdentity) -> Option<Arc<Session>> {
        self.sessions.get(identity).map(|entry| entry.value().clone())
    }

    /// Drops the session for `identity` so the next `acquire` starts over.
    /// Handles already given out keep working until they are dropped.
    pub fn forget(&self, identity: &ConnectionIdentity) -> bool {
        self.sessions.remove(identity).is_some()
    }

    /// Forgets every session whose connect attempt has failed.
    pub fn forget_failed(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| !matches!(session.status(), SessionStatus::Failed(_)));
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
