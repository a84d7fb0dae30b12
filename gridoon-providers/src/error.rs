use gridoon_common::PreconditionError;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider answered with its error envelope.
    #[error("provider API {operation} error: {message} (code={code}, status={status})")]
    Api {
        operation: &'static str,
        status: u16,
        code: String,
        message: String,
    },

    /// Non-success status whose body is not an error envelope.
    #[error("provider API {operation} failed: status={status} body={body}")]
    Http {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("unexpected response format from provider API ({operation}): {detail}")]
    MalformedResponse {
        operation: &'static str,
        detail: String,
    },

    #[error("transport error during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid provider credentials: {0}")]
    InvalidCredentials(String),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ProviderError::Api { status, code, .. } => *status == 404 || code == "not_found",
            ProviderError::Http { status, .. } => *status == 404,
            _ => false,
        }
    }
}
