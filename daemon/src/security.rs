//! Ambient middleware: API-key auth, sliding-window rate limiting, and
//! path-traversal guarding for file operations. These raise their own
//! HTTP-native statuses before a request ever reaches the manager — they
//! are not part of [`crate::error::ManagerError`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::config::SecurityConfig;

fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Holds the SHA-256 digests of configured API keys so the plaintext
/// values never linger in memory longer than construction.
pub struct ApiKeyValidator {
    enabled: bool,
    header_name: String,
    hashed_keys: Vec<String>,
}

impl ApiKeyValidator {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            enabled: config.api_key_enabled,
            header_name: config.api_key_header.clone(),
            hashed_keys: config.api_keys.iter().map(|k| hash_key(k)).collect(),
        }
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// `None` means auth is disabled and the request passes unconditionally.
    /// `Some(true)` / `Some(false)` reports whether the presented key (if
    /// any) hashes to a configured one.
    pub fn check(&self, presented: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        match presented {
            Some(key) => self.hashed_keys.contains(&hash_key(key)),
            None => false,
        }
    }
}

struct Window {
    count: u32,
    started_at: Instant,
}

/// Sliding-window rate limiter keyed by client identity (API key, remote
/// IP, or `X-Forwarded-For`, in that preference order).
pub struct RateLimiter {
    enabled: bool,
    max_requests: u32,
    window: Duration,
    state: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            enabled: config.rate_limit_enabled,
            max_requests: config.rate_limit_requests,
            window: Duration::from_secs(config.rate_limit_window_seconds),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the request should be admitted.
    pub fn allow(&self, client_key: &str) -> bool {
        if !self.enabled {
            return true;
        }
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let entry = state.entry(client_key.to_string()).or_insert_with(|| Window {
            count: 0,
            started_at: now,
        });
        if now.duration_since(entry.started_at) >= self.window {
            entry.count = 0;
            entry.started_at = now;
        }
        if entry.count >= self.max_requests {
            return false;
        }
        entry.count += 1;
        true
    }
}

/// Rejects paths with null bytes, `..` traversal components, or that fall
/// outside every configured allowed prefix.
pub fn validate_path(path: &str, allowed_prefixes: &[String]) -> Result<(), String> {
    if path.contains('\0') {
        return Err("path contains a null byte".to_string());
    }
    if std::path::Path::new(path)
        .components()
        .any(|c| c == std::path::Component::ParentDir)
    {
        return Err("path contains a parent-directory (..) component".to_string());
    }
    if allowed_prefixes.is_empty() {
        return Ok(());
    }
    if allowed_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str())) {
        Ok(())
    } else {
        Err(format!("path {path} is outside the allowed prefixes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn security_config(enabled: bool, keys: Vec<&str>) -> SecurityConfig {
        SecurityConfig {
            api_key_enabled: enabled,
            api_keys: keys.into_iter().map(String::from).collect(),
            api_key_header: "X-API-Key".to_string(),
            rate_limit_enabled: false,
            rate_limit_requests: 100,
            rate_limit_window_seconds: 60,
            max_request_size_bytes: 1024,
            allowed_path_prefixes: vec!["/workspace".to_string()],
            cors_origins: "*".to_string(),
        }
    }

    #[test]
    fn disabled_auth_passes_without_key() {
        let validator = ApiKeyValidator::new(&security_config(false, vec![]));
        assert!(validator.check(None));
    }

    #[test]
    fn enabled_auth_rejects_missing_key() {
        let validator = ApiKeyValidator::new(&security_config(true, vec!["secret"]));
        assert!(!validator.check(None));
    }

    #[test]
    fn enabled_auth_accepts_matching_key() {
        let validator = ApiKeyValidator::new(&security_config(true, vec!["secret"]));
        assert!(validator.check(Some("secret")));
    }

    #[test]
    fn enabled_auth_rejects_wrong_key() {
        let validator = ApiKeyValidator::new(&security_config(true, vec!["secret"]));
        assert!(!validator.check(Some("wrong")));
    }

    #[test]
    fn rate_limiter_admits_up_to_the_limit_then_rejects() {
        let mut config = security_config(false, vec![]);
        config.rate_limit_enabled = true;
        config.rate_limit_requests = 2;
        config.rate_limit_window_seconds = 60;
        let limiter = RateLimiter::new(&config);
        assert!(limiter.allow("client-a"));
        assert!(limiter.allow("client-a"));
        assert!(!limiter.allow("client-a"));
    }

    #[test]
    fn rate_limiter_tracks_clients_independently() {
        let mut config = security_config(false, vec![]);
        config.rate_limit_enabled = true;
        config.rate_limit_requests = 1;
        let limiter = RateLimiter::new(&config);
        assert!(limiter.allow("client-a"));
        assert!(limiter.allow("client-b"));
    }

    #[test]
    fn validate_path_rejects_traversal() {
        let err = validate_path("/workspace/../etc/passwd", &["/workspace".to_string()]);
        assert!(err.is_err());
    }

    #[test]
    fn validate_path_rejects_null_byte() {
        let err = validate_path("/workspace/foo\0bar", &["/workspace".to_string()]);
        assert!(err.is_err());
    }

    #[test]
    fn validate_path_rejects_outside_prefix() {
        let err = validate_path("/etc/passwd", &["/workspace".to_string()]);
        assert!(err.is_err());
    }

    #[test]
    fn validate_path_accepts_within_prefix() {
        assert!(validate_path("/workspace/x.bin", &["/workspace".to_string()]).is_ok());
    }
}
