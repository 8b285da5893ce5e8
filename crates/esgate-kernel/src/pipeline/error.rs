//! Pipeline error types for `esgate-kernel`.
//!
//! [`PipelineError`] covers every structural failure detected while a runtime
//! is *built* (malformed routes, empty endpoints, conflicting connector
//! kinds). Such errors are fatal to startup.
//!
//! [`ProcessorError`] and [`BackendError`] are request-time failures; the
//! runtime turns them into an error response for the one request that
//! produced them.

use thiserror::Error;

/// Build-time structural error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PipelineError {
    /// A pipeline was added with an empty or whitespace-only name.
    #[error("pipeline name cannot be empty")]
    EmptyPipelineName,

    /// A frontend connector was declared without a listen address.
    #[error("frontend connector in pipeline '{0}' has an empty listen address")]
    EmptyEndpoint(String),

    /// A route pattern is syntactically invalid.
    #[error("route pattern '{0}' is invalid: {1}")]
    InvalidRoutePattern(String, String),

    /// Two declarations at one address disagree on the connector kind.
    #[error("listen address '{endpoint}' is declared as both {first} and {second}")]
    ConnectorKindConflict {
        endpoint: String,
        first: &'static str,
        second: &'static str,
    },

    /// A processor's `init` hook failed.
    #[error("processor '{0}' failed to initialise: {1}")]
    ProcessorInit(String, String),

    /// The builder was asked to build a runtime without any pipeline.
    #[error("runtime must contain at least one pipeline")]
    NoPipelines,
}

/// Backend transport failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendError {
    #[error("backend '{endpoint}' is unreachable: {message}")]
    Network { endpoint: String, message: String },

    #[error("backend '{endpoint}' returned {status}: {message}")]
    Upstream {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("backend '{endpoint}' returned an undecodable body: {message}")]
    Decode { endpoint: String, message: String },

    #[error("backend '{0}' is closed")]
    Closed(String),
}

/// Request-time processing failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessorError {
    /// The processor received input it cannot work with.
    #[error("processor '{processor}' received invalid input: {message}")]
    InvalidInput { processor: String, message: String },

    /// No backend of a kind the processor can talk to is attached.
    #[error("processor '{processor}' has no compatible backend: {message}")]
    UnsupportedBackend { processor: String, message: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A handler failed before processors ran.
    #[error("handler failed: {0}")]
    Handler(String),

    /// A panic was caught at the dispatch boundary.
    #[error("request processing panicked: {0}")]
    Panicked(String),

    #[error("processor initialisation failed: {0}")]
    Init(String),
}

impl ProcessorError {
    pub fn invalid_input(processor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            processor: processor.into(),
            message: message.into(),
        }
    }

    pub fn unsupported_backend(processor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnsupportedBackend {
            processor: processor.into(),
            message: message.into(),
        }
    }

    /// HTTP status that best represents this failure to a caller.
    pub fn status(&self) -> u16 {
        match self {
            ProcessorError::InvalidInput { .. } => 400,
            ProcessorError::Backend(BackendError::Upstream { status, .. }) if *status < 500 => {
                *status
            }
            ProcessorError::Backend(_) => 502,
            _ => 500,
        }
    }
}
