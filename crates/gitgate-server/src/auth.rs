//! Authorization gate.
//!
//! Every routed request passes through an application supplied
//! [`Authorize`] implementation before anything else happens. Whatever it
//! returns becomes the request's context and rides along on the operation
//! event seen by listeners.

use crate::error::ServerError;
use crate::router::{ParsedGitRequest, Route};
use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use gitgate_protocol::Service;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Whether a request reads from or writes to the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Clone, fetch, ref advertisement for upload-pack, HEAD probe.
    Fetch,
    /// Push, or the ref advertisement that precedes one.
    Push,
}

impl Access {
    /// Access level implied by a routed request.
    pub fn of(request: &ParsedGitRequest) -> Self {
        match request.service() {
            Some(Service::ReceivePack) => Access::Push,
            _ => Access::Fetch,
        }
    }
}

/// HTTP Basic credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Deferred access to the request's `Authorization` header.
///
/// Nothing is decoded until [`CredentialReader::basic`] is called, so
/// authorizers that let anonymous requests through never pay for it.
#[derive(Debug, Clone, Default)]
pub struct CredentialReader {
    header: Option<HeaderValue>,
}

impl CredentialReader {
    /// Captures the `Authorization` header, if any.
    pub fn new(headers: &HeaderMap) -> Self {
        Self {
            header: headers.get(header::AUTHORIZATION).cloned(),
        }
    }

    /// Decodes `Authorization: Basic <base64(user:pass)>`.
    pub fn basic(&self) -> Result<Credentials, AuthError> {
        let value = self
            .header
            .as_ref()
            .ok_or(AuthError::MissingCredentials)?
            .to_str()
            .map_err(|_| AuthError::InvalidCredentials("non-ascii header".to_string()))?;

        let (scheme, encoded) = value
            .split_once(' ')
            .ok_or_else(|| AuthError::InvalidCredentials("malformed header".to_string()))?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(AuthError::InvalidCredentials(format!(
                "unsupported scheme {scheme}"
            )));
        }

        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::InvalidCredentials(e.to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| AuthError::InvalidCredentials("credentials are not utf-8".to_string()))?;

        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| AuthError::InvalidCredentials("missing ':' separator".to_string()))?;

        Ok(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// What an authorizer gets to look at.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// Read or write.
    pub access: Access,
    /// Route the request was classified as.
    pub route: Route,
    /// Repository name without a trailing `.git`.
    pub repo: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Lazy credential accessor.
    pub credentials: CredentialReader,
}

/// Authorization failures.
///
/// The first two variants are authentication problems and answer with a
/// 401 challenge; [`AuthError::Denied`] is a policy decision and answers
/// with a 403.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// No `Authorization` header.
    #[error("authentication required")]
    MissingCredentials,

    /// Unparseable or wrong credentials.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Valid credentials, but the request is not allowed.
    #[error("{0}")]
    Denied(String),
}

impl AuthError {
    /// Shorthand for a policy denial.
    pub fn denied(message: impl Into<String>) -> Self {
        AuthError::Denied(message.into())
    }

    /// True for failures a client can fix by sending credentials.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            AuthError::MissingCredentials | AuthError::InvalidCredentials(_)
        )
    }
}

/// Decides whether a request may proceed and produces its context.
#[async_trait]
pub trait Authorize<C>: Send + Sync {
    /// Authorizes one request.
    async fn authorize(&self, request: AuthRequest) -> Result<C, AuthError>;
}

#[async_trait]
impl<C, F, Fut> Authorize<C> for F
where
    C: Send + 'static,
    F: Fn(AuthRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<C, AuthError>> + Send,
{
    async fn authorize(&self, request: AuthRequest) -> Result<C, AuthError> {
        (self)(request).await
    }
}

/// Runs the configured authorizer and converts failures to HTTP errors.
pub struct AuthGate<C> {
    authorizer: Option<Arc<dyn Authorize<C>>>,
    realm: String,
    timeout: Option<Duration>,
}

impl<C: Send + 'static> AuthGate<C> {
    /// Creates a gate. Without an authorizer every request passes.
    pub fn new(
        authorizer: Option<Arc<dyn Authorize<C>>>,
        realm: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            authorizer,
            realm: realm.into(),
            timeout,
        }
    }

    /// Authorizes `request`, returning its context.
    ///
    /// `Ok(None)` means no authorizer is configured.
    pub async fn check(
        &self,
        request: &ParsedGitRequest,
        headers: &HeaderMap,
    ) -> Result<Option<C>, ServerError> {
        let Some(authorizer) = &self.authorizer else {
            return Ok(None);
        };

        let auth_request = AuthRequest {
            access: Access::of(request),
            route: request.route(),
            repo: request.name().to_string(),
            headers: headers.clone(),
            credentials: CredentialReader::new(headers),
        };

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, authorizer.authorize(auth_request))
                .await
                .map_err(|_| ServerError::AuthTimeout)?,
            None => authorizer.authorize(auth_request).await,
        };

        match outcome {
            Ok(context) => Ok(Some(context)),
            Err(e) if e.is_authentication() => {
                tracing::debug!(repo = %request.name(), error = %e, "authentication failed");
                Err(ServerError::Unauthenticated {
                    realm: self.realm.clone(),
                    message: e.to_string(),
                })
            }
            Err(e) => {
                tracing::info!(repo = %request.name(), error = %e, "authorization denied");
                Err(ServerError::Forbidden(e.to_string()))
            }
        }
    }
}
