//! Admission control primitives.
//!
//! - [`SlidingWindowLimiter`]: per-key sliding-window log deciding whether a request is admitted.
//! - [`SweeperHandle`]: background task that drops keys whose window has emptied.
//! - [`AdmissionLayer`]: tower middleware that gates requests before business logic.
//!
//! # Architecture
//!
//! The limiter owns a single map from [`WindowKey`] to an ordered log of admission timestamps,
//! guarded by one mutex. `allow` prunes the caller's log on every access, so a log never holds
//! more than `limit` entries; the sweeper exists only to forget keys that stopped sending.
//! The limiter is an owned value: share it with `Arc` between the middleware and the sweeper.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

pub mod middleware;
pub mod sweeper;
pub mod window;

pub use middleware::{AdmissionLayer, AdmissionService};
pub use sweeper::SweeperHandle;
pub use window::SlidingWindowLimiter;

/// The decision returned by an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request was admitted and recorded.
    Allowed {
        /// Admissions still available in the current window.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u32,
    },
    /// The request was rejected and not recorded.
    Denied {
        /// Time until the oldest admission leaves the window.
        /// Useful for `Retry-After` headers.
        retry_after: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Opaque identifier of a rate-limited subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey(String);

impl WindowKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for per-caller limiting by client address.
    pub fn ip(addr: IpAddr) -> Self {
        Self(addr.to_string())
    }

    /// Key for per-tenant limiting, `project:<id>`.
    pub fn project(project_id: &str) -> Self {
        Self(format!("project:{project_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for WindowKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WindowKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for WindowKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn project_keys_are_prefixed() {
        assert_eq!(WindowKey::project("abc").as_str(), "project:abc");
    }

    #[test]
    fn ip_keys_use_address_text() {
        let key = WindowKey::ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(key.to_string(), "10.0.0.7");
    }

    #[test]
    fn decision_helper() {
        assert!(Decision::Allowed { remaining: 0 }.is_allowed());
        assert!(!Decision::Denied { retry_after: Duration::from_secs(1) }.is_allowed());
    }
}
