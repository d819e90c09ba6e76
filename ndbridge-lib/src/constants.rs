/// TCP backlog size of the bridge listener
pub const TCP_BACKLOG: u32 = 1024;

/// Base delay between retry attempts in milliseconds
pub const RETRY_BASE_DELAY_MSEC: u64 = 100;

/// Linear backoff factor: the i-th retry (0-based) sleeps `base + i * factor * base`
pub const RETRY_BACKOFF_FACTOR: u32 = 1;

/// Timeout for a single upstream websocket connect attempt in milliseconds
pub const UPSTREAM_CONNECT_TIMEOUT_MSEC: u64 = 5_000;

/// Timeout for a single introspection endpoint lookup in milliseconds
pub const DISCOVERY_TIMEOUT_MSEC: u64 = 5_000;
