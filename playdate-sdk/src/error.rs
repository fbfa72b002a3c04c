//! Error type shared by the SDK.

/// Errors surfaced by the SDK.
///
/// Command-level failures (`success: false` replies) are not errors; they
/// reach the caller's callback as a [`crate::commands::CommandOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A frame or stored document was not valid JSON of the expected shape.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A command was invoked without one of its required parameters.
    #[error("{command}: missing required parameter `{field}`")]
    Validation {
        command: &'static str,
        field: &'static str,
    },

    /// An authenticated REST call was made without a session token.
    #[error("not logged in")]
    NotLoggedIn,

    /// The REST collaborator could not be reached.
    #[error("api request failed: {0}")]
    Api(#[from] reqwest::Error),

    /// The service answered with an error status and no reply envelope, or
    /// could not be reached at all.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The server answered but refused the request.
    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("secure storage: {0}")]
    Storage(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
