//! Process-wide configuration, loaded once from the environment in `main`
//! and threaded down via `Arc`. No config file, no lazy-static singleton —
//! every field here is env-var sourced (see the module docs for the full
//! list), matching the enumerated-options design of the source service.

use std::path::PathBuf;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, base: &std::path::Path, default_suffix: &str) -> PathBuf {
    match std::env::var(key) {
        Ok(v) => PathBuf::from(v),
        Err(_) => base.join(default_suffix),
    }
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_float(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Directory roots and binary paths.
#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub kernels_dir: PathBuf,
    pub rootfs_dir: PathBuf,
    pub sandboxes_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub firecracker_bin: PathBuf,
    pub jailer_bin: PathBuf,
}

/// Resource range/default configuration for admission.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub default_memory_mb: u32,
    pub min_memory_mb: u32,
    pub max_memory_mb: u32,
    pub default_vcpu_count: u32,
    pub min_vcpu_count: u32,
    pub max_vcpu_count: u32,
    pub max_sandboxes: usize,
    pub host_reserved_memory_mb: u32,
}

/// Wait/deadline configuration.
#[derive(Debug, Clone)]
pub struct TimeoutsConfig {
    pub vm_boot_timeout: std::time::Duration,
    pub guest_agent_timeout: std::time::Duration,
    pub command_default_timeout: std::time::Duration,
    pub api_socket_timeout: std::time::Duration,
}

/// Vsock transport constants.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub vsock_port: u32,
    pub max_message_size: usize,
}

/// API-key auth, rate limiting, and path-traversal guarding. Ambient —
/// not part of the typed core — but still enumerated here since the
/// whole store is built once in `main`.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub api_key_enabled: bool,
    pub api_keys: Vec<String>,
    pub api_key_header: String,
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window_seconds: u64,
    pub max_request_size_bytes: usize,
    pub allowed_path_prefixes: Vec<String>,
    pub cors_origins: String,
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    pub paths: PathsConfig,
    pub limits: ResourceLimits,
    pub timeouts: TimeoutsConfig,
    pub transport: TransportConfig,
    pub security: SecurityConfig,
    pub host: String,
    pub port: u16,
}

impl ConfigStore {
    /// Load every field from the environment, falling back to the same
    /// defaults as the source service.
    pub fn from_env() -> Self {
        let base_dir = PathBuf::from(env_string("WORKSPACE_BASE_DIR", "/var/lib/workspace"));

        let paths = PathsConfig {
            kernels_dir: env_path("WORKSPACE_KERNELS_DIR", &base_dir, "kernels"),
            rootfs_dir: env_path("WORKSPACE_ROOTFS_DIR", &base_dir, "rootfs"),
            sandboxes_dir: env_path("WORKSPACE_SANDBOXES_DIR", &base_dir, "sandboxes"),
            snapshots_dir: env_path("WORKSPACE_SNAPSHOTS_DIR", &base_dir, "snapshots"),
            firecracker_bin: PathBuf::from(env_string(
                "FIRECRACKER_BIN",
                "/usr/local/bin/firecracker",
            )),
            jailer_bin: PathBuf::from(env_string("JAILER_BIN", "/usr/local/bin/jailer")),
        };

        let limits = ResourceLimits {
            default_memory_mb: env_num("DEFAULT_MEMORY_MB", 512),
            min_memory_mb: env_num("MIN_MEMORY_MB", 256),
            max_memory_mb: env_num("MAX_MEMORY_MB", 2048),
            default_vcpu_count: env_num("DEFAULT_VCPU_COUNT", 1),
            min_vcpu_count: env_num("MIN_VCPU_COUNT", 1),
            max_vcpu_count: env_num("MAX_VCPU_COUNT", 4),
            max_sandboxes: env_num("MAX_SANDBOXES", 20),
            host_reserved_memory_mb: env_num("HOST_RESERVED_MEMORY_MB", 4096),
        };

        let timeouts = TimeoutsConfig {
            vm_boot_timeout: std::time::Duration::from_secs_f64(env_float("VM_BOOT_TIMEOUT", 5.0)),
            guest_agent_timeout: std::time::Duration::from_secs_f64(env_float(
                "GUEST_AGENT_TIMEOUT",
                30.0,
            )),
            command_default_timeout: std::time::Duration::from_secs(env_num(
                "COMMAND_DEFAULT_TIMEOUT",
                300,
            )),
            api_socket_timeout: std::time::Duration::from_secs_f64(env_float(
                "API_SOCKET_TIMEOUT",
                5.0,
            )),
        };

        let transport = TransportConfig {
            vsock_port: env_num("VSOCK_PORT", 5000),
            max_message_size: env_num("MAX_MESSAGE_SIZE", 10 * 1024 * 1024),
        };

        let security = SecurityConfig {
            api_key_enabled: env_bool("API_KEY_ENABLED", false),
            api_keys: std::env::var("API_KEYS")
                .map(|v| v.split(',').map(str::trim).map(String::from).collect())
                .unwrap_or_default(),
            api_key_header: env_string("API_KEY_HEADER", "X-API-Key"),
            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED", true),
            rate_limit_requests: env_num("RATE_LIMIT_REQUESTS", 100),
            rate_limit_window_seconds: env_num("RATE_LIMIT_WINDOW_SECONDS", 60),
            max_request_size_bytes: env_num("MAX_REQUEST_SIZE_BYTES", 10 * 1024 * 1024),
            allowed_path_prefixes: std::env::var("ALLOWED_PATH_PREFIXES")
                .map(|v| v.split(',').map(str::trim).map(String::from).collect())
                .unwrap_or_else(|_| vec!["/workspace".to_string(), "/tmp".to_string()]),
            cors_origins: env_string("CORS_ORIGINS", "*"),
        };

        Self {
            paths,
            limits,
            timeouts,
            transport,
            security,
            host: env_string("HOST", "0.0.0.0"),
            port: env_num("PORT", 8080),
        }
    }

    /// Collects range and existence errors instead of failing on the
    /// first one, so an operator sees everything wrong in one pass.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let l = &self.limits;

        if l.min_memory_mb > l.max_memory_mb {
            errors.push(format!(
                "min_memory_mb ({}) > max_memory_mb ({})",
                l.min_memory_mb, l.max_memory_mb
            ));
        }
        if l.default_memory_mb < l.min_memory_mb || l.default_memory_mb > l.max_memory_mb {
            errors.push(format!(
                "default_memory_mb ({}) outside [{}, {}]",
                l.default_memory_mb, l.min_memory_mb, l.max_memory_mb
            ));
        }
        if l.min_vcpu_count > l.max_vcpu_count {
            errors.push(format!(
                "min_vcpu_count ({}) > max_vcpu_count ({})",
                l.min_vcpu_count, l.max_vcpu_count
            ));
        }
        if l.default_vcpu_count < l.min_vcpu_count || l.default_vcpu_count > l.max_vcpu_count {
            errors.push(format!(
                "default_vcpu_count ({}) outside [{}, {}]",
                l.default_vcpu_count, l.min_vcpu_count, l.max_vcpu_count
            ));
        }
        if l.max_sandboxes < 1 {
            errors.push("max_sandboxes must be >= 1".to_string());
        }
        if !self.paths.firecracker_bin.exists() {
            errors.push(format!(
                "firecracker binary not found: {}",
                self.paths.firecracker_bin.display()
            ));
        }

        errors
    }

    /// `MemTotal` (from `/proc/meminfo`) minus `host_reserved_memory_mb`,
    /// falling back to `16384 - reserved` when meminfo can't be read or
    /// parsed.
    pub fn total_memory_budget_mb(&self) -> u32 {
        let reserved = self.limits.host_reserved_memory_mb;
        match read_mem_total_mb() {
            Some(total) => total.saturating_sub(reserved),
            None => 16384_u32.saturating_sub(reserved),
        }
    }
}

fn read_mem_total_mb() -> Option<u32> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = content.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;
    u32::try_from(kb / 1024).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_reports_min_over_max() {
        let mut config = ConfigStore::from_env();
        config.limits.min_memory_mb = 2048;
        config.limits.max_memory_mb = 256;
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("min_memory_mb")));
    }

    #[test]
    fn validate_reports_default_out_of_range() {
        let mut config = ConfigStore::from_env();
        config.limits.default_memory_mb = 128;
        config.limits.min_memory_mb = 256;
        config.limits.max_memory_mb = 2048;
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("default_memory_mb")));
    }

    #[test]
    fn validate_reports_max_sandboxes_below_one() {
        let mut config = ConfigStore::from_env();
        config.limits.max_sandboxes = 0;
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("max_sandboxes")));
    }

    #[test]
    fn total_memory_budget_subtracts_reserved() {
        let mut config = ConfigStore::from_env();
        config.limits.host_reserved_memory_mb = 99_999_999;
        // Whatever MemTotal is (or the 16384 fallback), subtracting an
        // absurd reservation saturates to zero rather than underflowing.
        assert_eq!(config.total_memory_budget_mb(), 0);
    }
}
