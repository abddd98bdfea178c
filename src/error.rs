//! Error handling and HTTP response mapping.
//!
//! One error enum covers the whole pipeline: upstream transport, catalogue
//! resolution, archive repacking and cache bookkeeping. Handlers return
//! [`AppResult`] and the [`IntoResponse`] impl turns failures into the wire
//! format the package-manager clients expect: `401` with a Basic challenge
//! for credential problems, plain-text `500` for everything else.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

/// Challenge sent with every `401` response.
pub const WWW_AUTHENTICATE_VALUE: &str = "Basic realm=\"Comrade Pavlik\"";

/// Application-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The upstream rejected the caller's token.
    #[error("invalid gitlab token")]
    BadCredential,

    /// Neither supported API version answered on the configured endpoint.
    #[error("invalid gitlab endpoint: {0}")]
    BadEndpoint(String),

    /// Network failure, unexpected status or redirect on an API call.
    #[error("gitlab transport error: {0}")]
    Transport(String),

    /// One or more pages of a paginated listing could not be fetched.
    #[error("failed to fetch some pages of {0}")]
    PartialPaginationFailure(String),

    /// The file endpoint declared an encoding other than base64.
    #[error("unknown file encoding: {0}")]
    UnsupportedEncoding(String),

    /// The designated catalogue project is not visible to this token.
    #[error("catalogue project {0} not visible")]
    CatalogueProjectNotVisible(String),

    /// No package repository matches the requested name or uuid.
    #[error("package {0} not found")]
    PackageNotFound(String),

    /// The upstream archive does not have the expected shape.
    #[error("malformed upstream archive: {0}")]
    MalformedUpstreamArchive(String),

    /// A cache entry failed its type check on retrieval.
    #[error("cache broken for key: {0}")]
    CacheCorruption(String),

    /// A mandatory environment variable is unset. Aborts startup.
    #[error("missing configuration: {0} is not set")]
    ConfigurationMissing(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadCredential => {
                tracing::warn!("request rejected: bad credential");
                (
                    StatusCode::UNAUTHORIZED,
                    [
                        (header::WWW_AUTHENTICATE, WWW_AUTHENTICATE_VALUE),
                        (header::CONTENT_TYPE, "text/plain"),
                    ],
                    "Unauthorized",
                )
                    .into_response()
            }
            other => {
                tracing::error!(error = %other, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    [(header::CONTENT_TYPE, "text/plain")],
                    other.to_string(),
                )
                    .into_response()
            }
        }
    }
}

/// Convenient result type for application operations.
pub type AppResult<T> = Result<T, AppError>;
