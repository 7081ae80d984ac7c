//! Small helpers shared across the gateway.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix milliseconds.
#[must_use]
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Generate a prefixed unique identifier, e.g. `msg_9f1c…`.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

/// Generate a message identifier.
#[must_use]
pub fn generate_message_id() -> String {
    generate_id("msg")
}

/// Truncate a string to at most `max_chars` characters, appending `…` when cut.
#[must_use]
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(1);
    let mut out: String = s.chars().take(keep).collect();
    out.push('…');
    out
}

/// User home directory, falling back to the current directory.
#[must_use]
pub fn home_dir() -> PathBuf {
    dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Base directory for waypost state (`~/.waypost`).
#[must_use]
pub fn config_dir() -> PathBuf {
    home_dir().join(".waypost")
}

/// Default configuration file path (`~/.waypost/config.json`).
#[must_use]
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Default workspace directory (`~/.waypost/workspace`).
#[must_use]
pub fn workspace_dir() -> PathBuf {
    config_dir().join("workspace")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 6), "hello…");
        assert_eq!(truncate_str("héllo", 5).chars().count(), 5);
    }

    #[test]
    fn test_generate_id() {
        let a = generate_id("job");
        let b = generate_id("job");
        assert!(a.starts_with("job_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_default_paths() {
        assert!(config_path().ends_with("config.json"));
        assert!(workspace_dir().ends_with("workspace"));
    }
}
