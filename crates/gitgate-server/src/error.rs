//! Server error types and their HTTP mapping.

use crate::router::RouteError;
use crate::session::SessionError;
use crate::store::StoreError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use gitgate_protocol::Service;
use thiserror::Error;

/// Errors that end a request.
///
/// Every variant maps to exactly one HTTP response in [`IntoResponse`];
/// nothing below the outermost handler writes a response for a failure.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Unroutable request.
    #[error(transparent)]
    Route(#[from] RouteError),

    /// Missing or invalid credentials.
    #[error("{message}")]
    Unauthenticated { realm: String, message: String },

    /// Credentials were fine, policy said no.
    #[error("{0}")]
    Forbidden(String),

    /// The authorizer did not answer in time.
    #[error("authorization timed out")]
    AuthTimeout,

    /// Repository does not exist and auto-create is off.
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    /// Repository store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Request body uses a compression we cannot undo.
    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),

    /// A pack session failed before its response started.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The server was closed and no longer gates operations.
    #[error("server closed")]
    Closed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Status code this error answers with.
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Route(RouteError::NotFound) => StatusCode::NOT_FOUND,
            ServerError::Route(RouteError::BadRequest(_)) => StatusCode::BAD_REQUEST,
            ServerError::Route(RouteError::MethodNotAllowed) => StatusCode::METHOD_NOT_ALLOWED,
            ServerError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::AuthTimeout | ServerError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::RepoNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Session(e) => e.status(),
            ServerError::UnsupportedEncoding(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ServerError::Store(_) | ServerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ServerError {
    /// Whether the failure is worth an [`ErrorEvent`].
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            ServerError::Session(_) | ServerError::Store(_) | ServerError::Io(_)
        )
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = match &self {
            // Do not leak the on-disk layout through 404 bodies.
            ServerError::RepoNotFound(_) => "not found".to_string(),
            _ => self.to_string(),
        };

        let mut response = (status, body).into_response();
        if let ServerError::Unauthenticated { realm, .. } = &self {
            let challenge = format!("Basic realm=\"{}\"", realm.replace('"', ""));
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

/// Process-wide failure notification, broadcast to every
/// [`crate::GitServer::subscribe_errors`] receiver.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Repository the failing request addressed.
    pub repo: String,
    /// Service involved, if any.
    pub service: Option<Service>,
    /// Rendered error message.
    pub message: String,
}
