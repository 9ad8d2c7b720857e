use thiserror::Error;

/// All the ways a load can fail. Errors are captured at the operation boundary and
/// surfaced as `OperationStatus::Failed` plus one of these values; they are never
/// propagated as panics across a handle boundary. Composite operations wrap the child
/// error rather than discarding it, so the original cause stays reachable through
/// `source()`.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// No provider is registered that accepts the location's provider id and the
    /// requested type.
    #[error("no provider registered for location '{location}' with the requested type")]
    UnknownProvider { location: String },

    /// A required dependency did not succeed.
    #[error("dependency failed while loading '{context}'")]
    DependencyFailed {
        context: String,
        #[source]
        source: Box<LoadError>,
    },

    /// The provider reported an error (or dropped its provide handle without
    /// completing). The provider's own error is captured as a message because the
    /// failure may have been marshaled across a thread boundary.
    #[error("provider failed while loading '{location}': {message}")]
    ProviderFailed { location: String, message: String },

    /// The provider produced a value whose runtime type does not match the requested
    /// type.
    #[error("provider produced a value of an unexpected type for '{location}'")]
    TypeMismatch { location: String },

    /// A blocking `wait_for_completion` was attempted on a manager configured to forbid
    /// synchronous waits, or from within a tick.
    #[error("synchronous wait is not supported here")]
    SynchronousWaitUnsupported,

    /// The handle is null or refers to an operation slot that has since been recycled.
    #[error("handle is null or stale")]
    InvalidHandle,

    /// The operation has not completed yet.
    #[error("operation has not completed")]
    NotComplete,
}
