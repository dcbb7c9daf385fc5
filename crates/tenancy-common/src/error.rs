//! Error types for the tenancy operator
//!
//! Errors carry enough context (resource kind and name) to be useful in
//! logs and status conditions. [`Error::is_retryable`] separates transient
//! failures, which the controller runtime redelivers, from terminal ones
//! that need a spec change.

use thiserror::Error;

/// Main error type for tenancy operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A referenced object does not exist (yet)
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object (e.g. "RoleTemplate")
        kind: String,
        /// Name of the missing object
        name: String,
    },

    /// The object is malformed and will not converge without a spec change
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource that failed validation
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Role template inclusion forms a cycle
    #[error("role template inclusion cycle: {}", chain.join(" -> "))]
    CyclicTemplate {
        /// Template names from the first visit to the repeated name
        chain: Vec<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "index", "identity")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Only a malformed binding or a template cycle needs a spec change.
    /// Every store error is redelivered with backoff, including 4xx
    /// responses such as 403, which clear once RBAC or admission changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } | Error::NotFound { .. } | Error::Internal { .. } => true,
            Error::Validation { .. } | Error::CyclicTemplate { .. } => false,
        }
    }

    /// True for Kubernetes 404 responses
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source } if crate::kube_utils::is_not_found(source))
    }

    /// True when a create failed because the object already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube { source } if crate::kube_utils::is_already_exists(source))
    }

    /// Short machine-readable reason, used for status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "KubernetesError",
            Error::NotFound { .. } => "NotFound",
            Error::Validation { .. } => "ValidationFailed",
            Error::CyclicTemplate { .. } => "CyclicTemplate",
            Error::Internal { .. } => "InternalError",
        }
    }
}
