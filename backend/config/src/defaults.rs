//! Config defaults.

/// Default listen address.
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

/// Default per-call timeout for graph and backend requests.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Default cap on lookup results.
pub const DEFAULT_LOOKUP_LIMIT: usize = 1_000;

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_RETRY_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 2_000;

/// Default number of relationships printed per diagnostic snapshot.
pub const DEFAULT_SNAPSHOT_LIMIT: usize = 100;

pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

pub fn bind() -> String {
    DEFAULT_BIND.to_string()
}

pub fn timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

pub fn lookup_limit() -> usize {
    DEFAULT_LOOKUP_LIMIT
}

pub fn retry_max_attempts() -> u32 {
    DEFAULT_RETRY_MAX_ATTEMPTS
}

pub fn retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}

pub fn retry_backoff_factor() -> f64 {
    DEFAULT_RETRY_BACKOFF_FACTOR
}

pub fn retry_max_delay_ms() -> u64 {
    DEFAULT_RETRY_MAX_DELAY_MS
}

pub fn log_level() -> String {
    "info".to_string()
}

pub fn snapshot_limit() -> usize {
    DEFAULT_SNAPSHOT_LIMIT
}

pub fn shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
