//! Reconciles files, directories and idempotent scripts on remote Linux
//! hosts over a shared, serialized SSH session.

pub mod connection;
pub mod constants;
pub mod diff;
pub mod errors;
pub mod executor;
pub mod filesystem;
pub mod managers;
pub mod provider;
pub mod script;
pub mod services;
pub mod utils;

pub use connection::{ConnectionConfig, ConnectionIdentity, ConnectionOverride};
pub use errors::{ErrorKind, RemoteError};
pub use executor::{CommandOutput, Executor, RemoteCommand};
pub use provider::Provider;
