//! Allowlist validation for values that end up in dump-tool argument vectors.

use crate::error::BackupError;

fn check(field: &str, value: &str, allowed: impl Fn(char) -> bool) -> Result<(), BackupError> {
    if value.is_empty() {
        return Err(BackupError::configuration(format!("{field} is required")));
    }
    if value.len() > 255 {
        return Err(BackupError::configuration(format!("{field} is too long")));
    }
    if value.starts_with('-') {
        return Err(BackupError::configuration(format!(
            "{field} must not start with '-'"
        )));
    }
    if let Some(bad) = value.chars().find(|c| !allowed(*c)) {
        return Err(BackupError::configuration(format!(
            "{field} contains disallowed character {bad:?}"
        )));
    }
    Ok(())
}

/// Hostnames, IPv4 and bracketed or bare IPv6 addresses.
pub fn host(value: &str) -> Result<(), BackupError> {
    check("host", value, |c| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '[' | ']')
    })
}

pub fn username(value: &str) -> Result<(), BackupError> {
    check("username", value, |c| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@')
    })
}

pub fn database(value: &str) -> Result<(), BackupError> {
    check("database", value, |c| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '$')
    })
}

pub fn port(value: u16) -> Result<(), BackupError> {
    if value == 0 {
        return Err(BackupError::configuration("port must be between 1 and 65535"));
    }
    Ok(())
}
