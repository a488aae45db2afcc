//! Engine error types.

use thiserror::Error;

use crate::cloud::CloudError;

/// Errors raised while turning routing declarations into resources.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssemblyError {
    /// The same port was declared twice.
    #[error("port {0} declared more than once")]
    DuplicatePort(u16),

    /// HTTPS listener without a certificate to present.
    #[error("HTTPS listener on port {0} requires a certificate")]
    MissingCertificate(u16),

    /// Host rule with an empty host name.
    #[error("host rule has an empty host name")]
    EmptyHost,

    /// Host rule without any paths.
    #[error("host rule {host:?} declares no paths")]
    NoPaths { host: Option<String> },

    /// Path rule without host or path, which the cloud cannot match on.
    #[error("path rule for {backend} has neither host nor path")]
    NoConditions { backend: String },

    /// Path patterns must be absolute.
    #[error("path {0:?} must start with '/'")]
    InvalidPath(String),

    /// Backend with no service name.
    #[error("backend for path {path:?} has an empty service name")]
    EmptyServiceName { path: Option<String> },

    /// Two declarations resolve to the same host/path on one listener.
    #[error("host {host:?} path {path:?} declared more than once")]
    DuplicateCondition {
        host: Option<String>,
        path: Option<String>,
    },

    /// Ran out of rule priorities.
    #[error("rule priority {0} exceeds the maximum")]
    PriorityExhausted(u32),
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A cloud API call failed.
    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// Routing declarations could not be assembled.
    #[error("assembly: {0}")]
    Assembly(#[from] AssemblyError),

    /// No resolved target group serves the rule's backend.
    #[error("no target group for backend {0}")]
    TargetGroupNotFound(String),

    /// Rule has neither a backend nor a target group.
    #[error("rule with priority {0} has no backend")]
    NoBackend(u32),

    /// Listener has no target group for its default action.
    #[error("no default target group for listener on port {0}")]
    NoDefaultTargetGroup(u16),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
