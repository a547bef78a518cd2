use once_cell::sync::Lazy;
use regex::Regex;

pub const REDACTION: &str = "***REDACTED***";

static PRIVATE_KEY_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-----BEGIN [A-Z0-9 ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z0-9 ]*PRIVATE KEY-----")
        .expect("private key regex")
});

/// Replaces every occurrence of each secret. Empty secrets are skipped so
/// that an unset password does not blank the whole text.
pub fn redact_secrets(text: &str, secrets: &[String]) -> String {
    let mut out = PRIVATE_KEY_BLOCK.replace_all(text, REDACTION).to_string();
    for secret in secrets {
        if secret.is_empty() {
            continue;
        }
        out = out.replace(secret.as_str(), REDACTION);
    }
    out
}
