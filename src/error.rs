//! Error types for the netsek controller
//!
//! The reconciler's idempotence depends on telling "not found" and "already
//! exists" apart from every other API failure, so those two conditions get
//! their own variants instead of hiding inside [`Error::Kube`].

use thiserror::Error;

/// Main error type for netsek operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that is neither "not found" nor "already exists"
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The requested object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind (Deployment, Service, NetworkPolicy)
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
    },

    /// An object with the same name already exists
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Resource kind (Service, NetworkPolicy)
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
    },

    /// A queue key could not be decoded into namespace and name
    #[error("invalid workload key '{0}'")]
    InvalidKey(String),

    /// A workload cannot be converged as specified
    #[error("validation error: {0}")]
    Validation(String),

    /// A same-named object exists that this controller does not own
    #[error("conflict: {0}")]
    Conflict(String),

    /// The local mirror did not finish its initial listing in time
    #[error("cache sync error: {0}")]
    CacheSync(String),

    /// Client or credential configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "queue", "feed")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for an object
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error for an object
    pub fn already_exists(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Translate a kube API error for a specific object into a typed error
    ///
    /// HTTP 404 becomes [`Error::NotFound`] and HTTP 409 with reason
    /// `AlreadyExists` becomes [`Error::AlreadyExists`]. Everything else stays
    /// a [`Error::Kube`].
    pub fn from_kube(source: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match &source {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, namespace, name),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::already_exists(kind, namespace, name)
            }
            _ => Self::Kube(source),
        }
    }

    /// True if this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True if this error reports a name collision on create
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Check if retrying the same work could succeed
    ///
    /// Transient API failures (timeouts, server errors, 409 conflicts, 429
    /// throttling) are retryable. Malformed keys, validation failures and
    /// ownership conflicts are not, since nothing changes between attempts.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(source) => !matches!(
                source,
                kube::Error::Api(ae)
                    if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::NotFound { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::InvalidKey(_) => false,
            Error::Validation(_) => false,
            Error::Conflict(_) => false,
            Error::CacheSync(_) => false,
            Error::Config(_) => false,
            Error::Internal { .. } => true,
        }
    }
}
