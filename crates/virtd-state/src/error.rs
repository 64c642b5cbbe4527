//! Error types for the driver state core.
//!
//! Accounting errors (shared disk, close callback) are returned to the
//! immediate caller, who decides whether duplication or absence is fatal to
//! the higher-level operation. Configuration errors abort only the reload
//! that raised them; the previously published snapshot stays authoritative.
//!
//! There is deliberately no lock-order error: the one forbidden acquisition
//! order (inactive PCI list before active) is inexpressible through the
//! public API, so it cannot occur at runtime.

use thiserror::Error;

/// Errors raised while building or reloading a configuration snapshot.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field held an out-of-range or type-mismatched value.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable explanation.
        reason: String,
    },

    /// The configuration source could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
}

/// Errors from the shared-disk usage tracker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SharedDiskError {
    /// The exact (disk, domain) pair is already recorded. Idempotence
    /// signal, not a hard failure; the caller decides the policy.
    #[error("domain '{domain}' is already attached to shared disk {key}")]
    AlreadyAttached {
        /// Normalized disk key.
        key: String,
        /// Domain that was already attached.
        domain: String,
    },

    /// The (disk, domain) pair is not recorded.
    #[error("domain '{domain}' is not attached to shared disk {key}")]
    NotAttached {
        /// Normalized disk key.
        key: String,
        /// Domain that was not attached.
        domain: String,
    },
}

/// Errors from the close-callback registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    /// A close callback is already registered for the domain.
    #[error("close callback already set for domain '{0}'")]
    AlreadySet(String),

    /// No callback matching the supplied action is registered.
    #[error("no matching close callback for domain '{0}'")]
    NotFound(String),
}
