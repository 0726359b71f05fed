//! Error types for the migration controller

use thiserror::Error;

/// Main error type for migration controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// Underlying client error
        #[from]
        source: kube::Error,
    },

    /// Validation error for resources read from the cache
    #[error("validation error: {message}")]
    Validation {
        /// Description of the problem
        message: String,
    },

    /// An object the reconcile depends on is missing from the cache
    #[error("{kind} {key} not found")]
    NotFound {
        /// Resource kind (e.g. "Node")
        kind: &'static str,
        /// namespace/name or name of the object
        key: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the problem
        message: String,
    },

    /// Another migration currently owns the workload
    #[error("migration not eligible: {message}")]
    IneligibleMigration {
        /// Description of the conflict
        message: String,
    },

    /// An external collaborator (template renderer, backend storage, ...) failed
    #[error("{collaborator} error: {message}")]
    Collaborator {
        /// Name of the collaborator
        collaborator: &'static str,
        /// Description of the failure
        message: String,
    },

    /// Internal invariant violated
    #[error("internal error: {message}")]
    Internal {
        /// Description of the problem
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error for an object of the given kind
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an ineligible-migration error
    pub fn ineligible(msg: impl Into<String>) -> Self {
        Self::IneligibleMigration {
            message: msg.into(),
        }
    }

    /// Create a collaborator error
    pub fn collaborator(collaborator: &'static str, msg: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
        }
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// Whether the API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. }) || self.api_code() == Some(404)
    }

    /// Whether the API server answered 409 (stale resource version or failed patch test)
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Whether the API server answered 403
    pub fn is_forbidden(&self) -> bool {
        self.api_code() == Some(403)
    }

    /// Whether retrying the same operation can reasonably succeed
    ///
    /// Client errors other than not-found and conflict are permanent: the
    /// request itself is wrong and retrying it unchanged will fail again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    ae.code == 404 || ae.code == 409 || ae.code == 429 || ae.code >= 500
                }
                _ => true,
            },
            Error::Validation { .. } | Error::Serialization { .. } => false,
            Error::IneligibleMigration { .. } => false,
            Error::NotFound { .. } | Error::Collaborator { .. } | Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
