pub mod duration;
pub mod redact;
pub mod shell;
