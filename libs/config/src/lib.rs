//! # Remoting Configuration
//!
//! Settings and defaults for the remoting invocation runtime, kept apart from
//! the runtime itself so host processes can load, inspect and validate them
//! without pulling in the networking stack.
//!
//! ## Features
//!
//! - **Defaults**: timeouts, retry intervals, message size limits
//! - **Settings**: `serde` structures loaded from TOML plus `REMOTING_` environment overrides
//! - **Static locator table**: adapter ids and well-known objects mapped to endpoint strings
//!
//! ## Usage
//!
//! ```rust,no_run
//! use remoting_config::RemotingSettings;
//!
//! let settings = RemotingSettings::load(None).unwrap();
//! assert!(settings.invocation.retry_intervals_ms.len() >= 1);
//! ```

pub mod defaults;
pub mod settings;

// Re-export commonly used types
pub use settings::{
    ConnectionSettings, InvocationSettings, LocatorSettings, RemotingSettings, RouterSettings,
};
