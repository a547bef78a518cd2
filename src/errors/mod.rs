mod remote_error;

pub use remote_error::{ErrorKind, RemoteError};
