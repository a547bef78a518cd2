//! Connection parameters, identities and the session that owns the SSH link.

mod bastion;
mod registry;
mod session;

pub use registry::ConnectionRegistry;
pub use session::{Session, SessionStatus};

use crate::constants::network::{
    DEFAULT_CONNECT_TIMEOUT, SSH_DEFAULT_HOST, SSH_DEFAULT_PORT, SSH_DEFAULT_USER,
};
use crate::constants::script::DEFAULT_SCRIPT_PATH;
use crate::errors::RemoteError;
use crate::utils::duration::parse_duration;
use crate::utils::redact::REDACTION;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

fn default_host() -> String {
    SSH_DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    SSH_DEFAULT_PORT
}

fn default_user() -> String {
    SSH_DEFAULT_USER.to_string()
}

fn default_script_path() -> String {
    DEFAULT_SCRIPT_PATH.to_string()
}

fn default_timeout() -> String {
    DEFAULT_CONNECT_TIMEOUT.to_string()
}

/// Typed connection parameters. Populated once at the framework boundary;
/// nothing below this layer looks at untyped maps.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub host_key: Option<String>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Takes preference over `password`.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Signed certificate, used together with `private_key`.
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub agent: Option<bool>,
    #[serde(default)]
    pub agent_identity: Option<String>,
    #[serde(default)]
    pub bastion_host: Option<String>,
    #[serde(default)]
    pub bastion_port: Option<u16>,
    #[serde(default)]
    pub bastion_host_key: Option<String>,
    #[serde(default)]
    pub bastion_user: Option<String>,
    #[serde(default)]
    pub bastion_password: Option<String>,
    #[serde(default)]
    pub bastion_private_key: Option<String>,
    #[serde(default)]
    pub bastion_certificate: Option<String>,
    #[serde(default = "default_script_path")]
    pub script_path: String,
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            host_key: None,
            user: default_user(),
            password: None,
            private_key: None,
            certificate: None,
            agent: None,
            agent_identity: None,
            bastion_host: None,
            bastion_port: None,
            bastion_host_key: None,
            bastion_user: None,
            bastion_password: None,
            bastion_private_key: None,
            bastion_certificate: None,
            script_path: default_script_path(),
            timeout: default_timeout(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret = |value: &Option<String>| value.as_ref().map(|_| REDACTION);
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &secret(&self.password))
            .field("private_key", &secret(&self.private_key))
            .field("certificate", &self.certificate.is_some())
            .field("agent", &self.agent)
            .field("bastion_host", &self.bastion_host)
            .field("bastion_port", &self.bastion_port)
            .field("bastion_user", &self.bastion_user)
            .field("bastion_password", &secret(&self.bastion_password))
            .field("bastion_private_key", &secret(&self.bastion_private_key))
            .field("script_path", &self.script_path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// One SSH hop, with bastion fields already defaulted from the target.
#[derive(Clone)]
pub(crate) struct Endpoint {
    pub host: String,
    pub port: u16,
    pub host_key: Option<String>,
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub certificate: Option<String>,
    pub agent: bool,
    pub agent_identity: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

impl ConnectionConfig {
    pub fn from_value(value: &Value) -> Result<Self, RemoteError> {
        let config: ConnectionConfig = serde_json::from_value(value.clone()).map_err(|err| {
            RemoteError::invalid_params(format!("invalid connection settings: {}", err))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.host.trim().is_empty() {
            return Err(RemoteError::invalid_params("host must be a non-empty string"));
        }
        if self.port == 0 || self.bastion_port == Some(0) {
            return Err(RemoteError::invalid_params(
                "port must be an integer between 1 and 65535",
            ));
        }
        if self.user.trim().is_empty() {
            return Err(RemoteError::invalid_params("user must be a non-empty string"));
        }
        if self.certificate.is_some() && non_empty(&self.private_key).is_none() {
            return Err(RemoteError::invalid_params(
                "certificate must be used together with private_key",
            ));
        }
        if self.script_path.trim().is_empty() {
            return Err(RemoteError::invalid_params("script_path must not be empty"));
        }
        self.connect_timeout()?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Result<Duration, RemoteError> {
        parse_duration(&self.timeout)
    }

    pub(crate) fn target(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            host_key: non_empty(&self.host_key),
            user: self.user.clone(),
            password: non_empty(&self.password),
            private_key: non_empty(&self.private_key),
            certificate: non_empty(&self.certificate),
            agent: self.agent.unwrap_or(true),
            agent_identity: non_empty(&self.agent_identity),
        }
    }

    pub(crate) fn bastion(&self) -> Option<Endpoint> {
        let host = non_empty(&self.bastion_host)?;
        Some(Endpoint {
            host,
            port: self.bastion_port.unwrap_or(self.port),
            host_key: non_empty(&self.bastion_host_key),
            user: non_empty(&self.bastion_user).unwrap_or_else(|| self.user.clone()),
            password: non_empty(&self.bastion_password).or_else(|| non_empty(&self.password)),
            private_key: non_empty(&self.bastion_private_key)
                .or_else(|| non_empty(&self.private_key)),
            certificate: non_empty(&self.bastion_certificate)
                .or_else(|| non_empty(&self.certificate)),
            agent: self.agent.unwrap_or(true),
            agent_identity: non_empty(&self.agent_identity),
        })
    }

    /// Every value the session must never echo back.
    pub(crate) fn secrets(&self) -> Vec<String> {
        [
            &self.password,
            &self.private_key,
            &self.bastion_password,
            &self.bastion_private_key,
        ]
        .into_iter()
        .filter_map(non_empty)
        .collect()
    }
}

/// Key under which sessions are shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionIdentity(String);

impl ConnectionIdentity {
    pub fn named(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Digest over the fields that select the endpoint and the credentials.
    pub fn derive(config: &ConnectionConfig) -> Self {
        let mut hasher = Sha256::new();
        let port = config.port.to_string();
        let bastion_port = config
            .bastion_port
            .map(|p| p.to_string())
            .unwrap_or_default();
        let fields: [&str; 9] = [
            config.host.as_str(),
            port.as_str(),
            config.user.as_str(),
            config.password.as_deref().unwrap_or(""),
            config.private_key.as_deref().unwrap_or(""),
            config.certificate.as_deref().unwrap_or(""),
            config.bastion_host.as_deref().unwrap_or(""),
            bastion_port.as_str(),
            config.bastion_user.as_deref().unwrap_or(""),
        ];
        for field in fields {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        Self(format!("derived:{}", hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-resource replacement for the provider-level connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOverride {
    pub id: String,
    #[serde(flatten)]
    pub config: ConnectionConfig,
}

impl ConnectionOverride {
    pub fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::named(self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_value_applies_defaults() {
        let config = ConnectionConfig::from_value(&serde_json::json!({})).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 22);
        assert_eq!(config.user, "root");
        assert_eq!(config.script_path, "/tmp/linux-%RAND%.sh");
        assert_eq!(config.connect_timeout().unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn from_value_rejects_bad_settings() {
        assert!(ConnectionConfig::from_value(&serde_json::json!({"port": 0})).is_err());
        assert!(ConnectionConfig::from_value(&serde_json::json!({"port": 70000})).is_err());
        assert!(ConnectionConfig::from_value(&serde_json::json!({"timeout": "soon"})).is_err());
        assert!(ConnectionConfig::from_value(
            &serde_json::json!({"timeout": "18446744073709551615"})
        )
        .is_err());
        assert!(
            ConnectionConfig::from_value(&serde_json::json!({"certificate": "ssh-rsa-cert"}))
                .is_err()
        );
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = ConnectionConfig {
            password: Some("hunter22".to_string()),
            private_key: Some("-----BEGIN KEY-----".to_string()),
            ..ConnectionConfig::default()
        };
        let text = format!("{:?}", config);
        assert!(!text.contains("hunter22"));
        assert!(!text.contains("BEGIN KEY"));
        assert!(text.contains("REDACTED"));
    }

    #[test]
    fn bastion_defaults_to_target_credentials() {
        let config = ConnectionConfig {
            port: 2222,
            user: "deploy".to_string(),
            password: Some("pw".to_string()),
            bastion_host: Some("jump.example".to_string()),
            ..ConnectionConfig::default()
        };
        let bastion = config.bastion().unwrap();
        assert_eq!(bastion.host, "jump.example");
        assert_eq!(bastion.port, 2222);
        assert_eq!(bastion.user, "deploy");
        assert_eq!(bastion.password.as_deref(), Some("pw"));
        assert!(ConnectionConfig::default().bastion().is_none());
    }

    #[test]
    fn derived_identity_tracks_credentials() {
        let base = ConnectionConfig::default();
        let other_password = ConnectionConfig {
            password: Some("x".to_string()),
            ..ConnectionConfig::default()
        };
        assert_eq!(
            ConnectionIdentity::derive(&base),
            ConnectionIdentity::derive(&ConnectionConfig::default())
        );
        assert_ne!(
            ConnectionIdentity::derive(&base),
            ConnectionIdentity::derive(&other_password)
        );
    }

    #[test]
    fn override_flattens_connection_fields() {
        let value = serde_json::json!({"id": "db", "host": "10.0.0.5", "port": 2222});
        let parsed: ConnectionOverride = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.identity(), ConnectionIdentity::named("db"));
        assert_eq!(parsed.config.host, "10.0.0.5");
        assert_eq!(parsed.config.port, 2222);
        assert_eq!(parsed.config.user, "root");
    }
}
