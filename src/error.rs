//! Error types for the syncer.
//!
//! Errors carry enough context to tell a failed API call apart from a
//! misconfigured CRD or a malformed object, because the three are handled
//! differently: API errors are retried with backoff, configuration errors
//! skip the CRD, and malformed objects skip the sync step.

use thiserror::Error;

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Kubernetes API error on either cluster.
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A CRD carries annotations the syncer cannot act on.
    #[error("configuration error for {crd}: {message}")]
    Config {
        /// Name of the offending CRD
        crd: String,
        /// Description of what's invalid
        message: String,
    },

    /// A managed object has an unexpected JSON shape.
    #[error("malformed object {name}: {message}")]
    Malformed {
        /// Name of the offending object
        name: String,
        /// Description of the shape mismatch
        message: String,
    },

    /// Serializing an object for the API server failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error.
    #[error("internal error: {message}")]
    Internal {
        /// Description of what failed
        message: String,
    },
}

impl SyncError {
    /// Create a configuration error for the given CRD.
    pub fn config(crd: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            crd: crd.into(),
            message: msg.into(),
        }
    }

    /// Create a malformed-object error for the given object.
    pub fn malformed(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Malformed {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
        }
    }

    /// Whether a failed sync step should be re-enqueued.
    ///
    /// Network failures, 5xx responses and write conflicts are transient.
    /// Other 4xx responses, bad CRD annotations and malformed objects
    /// will not get better by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => false,
                _ => true,
            },
            SyncError::Config { .. } => false,
            SyncError::Malformed { .. } => false,
            SyncError::Serialization { .. } => false,
            SyncError::Internal { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> SyncError {
        SyncError::Kube {
            source: kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "test".to_string(),
                reason: "test".to_string(),
                code,
            }),
        }
    }

    #[test]
    fn test_server_errors_are_retryable() {
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
    }

    #[test]
    fn test_conflict_is_retryable() {
        assert!(api_error(409).is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        assert!(!api_error(400).is_retryable());
        assert!(!api_error(403).is_retryable());
        assert!(!api_error(422).is_retryable());
    }

    #[test]
    fn test_config_error_is_not_retryable() {
        let err = SyncError::config("foos.example.com", "unknown spec-source");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("foos.example.com"));
        assert!(err.to_string().contains("unknown spec-source"));
    }

    #[test]
    fn test_malformed_error_is_not_retryable() {
        let err = SyncError::malformed("foo", "status is not an object");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("foo"));
    }

    #[test]
    fn test_serialization_error_is_not_retryable() {
        assert!(!SyncError::serialization("bad json").is_retryable());
    }

    #[test]
    fn test_internal_error_is_retryable() {
        assert!(SyncError::internal("watch ended").is_retryable());
    }
}
