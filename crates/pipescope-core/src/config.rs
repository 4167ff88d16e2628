//! Environment lookups shared by the agent and the panel.

use std::path::PathBuf;
use std::time::Duration;

pub const SESSION_ENV: &str = "PIPESCOPE_SESSION_ID";
pub const AGENT_SOCK_ENV: &str = "PIPESCOPE_AGENT_SOCK";
pub const EXPORT_DIR_ENV: &str = "PIPESCOPE_EXPORT_DIR";
pub const LOG_STDOUT_ENV: &str = "PIPESCOPE_LOG_STDOUT";

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

pub fn resolve_session_id() -> String {
    env_non_empty(SESSION_ENV).unwrap_or_else(|| format!("pid-{}", std::process::id()))
}

/// `PIPESCOPE_AGENT_SOCK`, else `<runtime dir>/pipescope/<session slug>/agent.sock`.
pub fn resolve_agent_socket_path(session_id: &str) -> PathBuf {
    if let Some(value) = env_non_empty(AGENT_SOCK_ENV) {
        return PathBuf::from(value);
    }
    let runtime_dir = if let Some(value) = env_non_empty("XDG_RUNTIME_DIR") {
        PathBuf::from(value)
    } else if let Some(uid) = env_non_empty("UID") {
        PathBuf::from(format!("/run/user/{uid}"))
    } else {
        PathBuf::from("/tmp")
    };
    runtime_dir
        .join("pipescope")
        .join(session_slug(session_id))
        .join("agent.sock")
}

pub fn resolve_export_dir() -> PathBuf {
    env_non_empty(EXPORT_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Reconnect delay after `current`: doubles up to ten seconds.
pub fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > Duration::from_secs(10) {
        Duration::from_secs(10)
    } else {
        next
    }
}

/// Filesystem-safe, collision-resistant name for a session id.
pub fn session_slug(session_id: &str) -> String {
    let mut slug = String::with_capacity(session_id.len());
    for ch in session_id.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            slug.push(ch);
        } else {
            slug.push('-');
        }
    }
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-').to_string();
    let base = if slug.is_empty() {
        "session".to_string()
    } else {
        slug
    };
    let hash = stable_hash_hex(session_id);
    let short: String = base.chars().take(48).collect();
    format!("{short}-{hash}")
}

/// FNV-1a, printed as eight hex digits.
pub fn stable_hash_hex(input: &str) -> String {
    let mut hash: u32 = 2166136261;
    for byte in input.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    format!("{hash:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_is_stable_and_path_safe() {
        let slug = session_slug("my session/1");
        assert!(slug.starts_with("my-session-1-"));
        assert_eq!(slug, session_slug("my session/1"));
        assert_ne!(slug, session_slug("my session 1"));
        assert!(session_slug("///").starts_with("session-"));
        assert_eq!(stable_hash_hex(""), "811c9dc5");
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(next_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(8)), Duration::from_secs(10));
        assert_eq!(next_backoff(Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[test]
    fn long_session_ids_are_shortened() {
        let slug = session_slug(&"x".repeat(100));
        assert_eq!(slug.len(), 48 + 1 + 8);
    }
}
