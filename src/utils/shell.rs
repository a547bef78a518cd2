use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static SAFE_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w@%+=:,./-]+$").expect("safe word regex"));

static ENV_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env name regex"));

/// Quotes a single argument for a POSIX shell.
pub fn quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    if SAFE_WORD.is_match(value) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

pub fn quote_command<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `{ a && b ;}`: later steps never run once an earlier one fails.
pub fn conjunction<S: AsRef<str>>(steps: &[S]) -> String {
    let body = steps
        .iter()
        .map(|step| step.as_ref())
        .collect::<Vec<_>>()
        .join(" && ");
    format!("{{ {} ;}}", body)
}

/// `{ [ ! -e path ] || action ;}`
pub fn unless_absent(path: &str, action: &str) -> String {
    format!("{{ [ ! -e {} ] || {} ;}}", quote(path), action)
}

pub fn is_valid_env_name(name: &str) -> bool {
    ENV_NAME.is_match(name)
}

/// `K1='v1' K2='v2'`, ordered by key.
pub fn inline_env(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(key, value)| format!("{}={}", key, quote(value)))
        .collect::<Vec<_>>()
        .join(" ")
}
