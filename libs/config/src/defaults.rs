//! Default values shared by the settings structures and the runtime.

/// Invocation defaults
pub mod invocation {
    /// Retry intervals (milliseconds); one immediate retry
    pub const RETRY_INTERVALS_MS: &[u64] = &[0];
}

/// Connection defaults
pub mod connection {
    /// Connect timeout (milliseconds)
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Largest frame accepted from a peer
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    /// Grace period for outstanding replies when the pool is destroyed (milliseconds)
    pub const CLOSE_TIMEOUT_MS: u64 = 5_000;

    /// Smallest accepted `max_message_size` setting
    pub const MIN_MESSAGE_SIZE: usize = 64;
}

/// Location service defaults
pub mod locator {
    /// Timeout for a single locator lookup (milliseconds)
    pub const LOOKUP_TIMEOUT_MS: u64 = 5_000;
}

/// Batch router defaults
pub mod router {
    /// Buffered routers queue requests for the flush worker
    pub const BUFFERED: bool = true;
}

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "REMOTING";
