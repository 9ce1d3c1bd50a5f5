//! HTTP front end.
//!
//! [`GitServer`] ties the pieces together: every request goes through
//! [`parse_request`], then the [`AuthGate`], then one of three route
//! handlers. Failures anywhere are converted to a response exactly once,
//! in [`handle`].

use crate::auth::{AuthGate, Authorize};
use crate::body::BodyDecoder;
use crate::config::ServerConfig;
use crate::duplex::{Duplex, SessionStatus};
use crate::error::{ErrorEvent, ServerError};
use crate::event::{EventKind, ListenerRegistry, LogQueue, Operation, OperationEvent};
use crate::observability::request_id_layer;
use crate::process::{GitCommand, GitSpawner, ProcessSpawner};
use crate::router::{parse_request, ParsedGitRequest};
use crate::session::{decide, Bridge, PackSession, SessionConfig, SessionError};
use crate::store::RepositoryStore;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, request::Parts, HeaderValue},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use gitgate_protocol::{service_announcement, Service};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

const ERROR_CHANNEL_CAPACITY: usize = 256;

struct Inner<C> {
    store: Arc<dyn RepositoryStore>,
    auth: AuthGate<C>,
    listeners: Arc<ListenerRegistry<C>>,
    spawner: Arc<dyn ProcessSpawner>,
    errors: broadcast::Sender<ErrorEvent>,
    auto_create: bool,
    session: SessionConfig,
    closed: AtomicBool,
}

/// A git smart HTTP server.
///
/// `C` is the context type produced by the authorizer and carried on every
/// [`OperationEvent`].
pub struct GitServer<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for GitServer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Builder for [`GitServer`].
pub struct GitServerBuilder<C> {
    store: Arc<dyn RepositoryStore>,
    authorizer: Option<Arc<dyn Authorize<C>>>,
    spawner: Option<Arc<dyn ProcessSpawner>>,
    config: ServerConfig,
}

impl<C: Send + Sync + 'static> GitServerBuilder<C> {
    /// Sets the authorizer. Without one every request is let through with
    /// no context.
    pub fn authorize<A>(mut self, authorizer: A) -> Self
    where
        A: Authorize<C> + 'static,
    {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Replaces the process spawner.
    pub fn spawner<S>(mut self, spawner: S) -> Self
    where
        S: ProcessSpawner + 'static,
    {
        self.spawner = Some(Arc::new(spawner));
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn auto_create(mut self, enabled: bool) -> Self {
        self.config.auto_create = enabled;
        self
    }

    pub fn build(self) -> GitServer<C> {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let spawner = self
            .spawner
            .unwrap_or_else(|| Arc::new(GitSpawner::new(self.config.invocation)));

        GitServer {
            inner: Arc::new(Inner {
                store: self.store,
                auth: AuthGate::new(
                    self.authorizer,
                    self.config.realm.clone(),
                    self.config.auth_timeout(),
                ),
                listeners: Arc::new(ListenerRegistry::new()),
                spawner,
                errors,
                auto_create: self.config.auto_create,
                session: self.config.session(),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl<C: Send + Sync + 'static> GitServer<C> {
    /// Starts building a server over `store`.
    pub fn builder<S>(store: S) -> GitServerBuilder<C>
    where
        S: RepositoryStore + 'static,
    {
        GitServerBuilder {
            store: Arc::new(store),
            authorizer: None,
            spawner: None,
            config: ServerConfig::default(),
        }
    }

    /// Registers a listener for `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(OperationEvent<C>) + Send + Sync + 'static,
    {
        self.inner.listeners.on(kind, listener);
    }

    pub fn listeners(&self) -> &ListenerRegistry<C> {
        &self.inner.listeners
    }

    pub fn store(&self) -> &dyn RepositoryStore {
        self.inner.store.as_ref()
    }

    /// Receives spawn, protocol and git failures from every request.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.inner.errors.subscribe()
    }

    /// The HTTP application.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle::<C>)
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
            .layer(request_id_layer())
    }

    /// Serves on `listener` until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "gitgate listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.close();
        tracing::info!("gitgate stopped");
        Ok(())
    }

    /// Drops every registered listener. Routers built from this server
    /// answer 503 from then on instead of auto-accepting.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.listeners.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn dispatch(&self, request: Request) -> Result<Response, ServerError> {
        if self.is_closed() {
            return Err(ServerError::Closed);
        }
        let parsed = parse_request(request.method(), request.uri())?;
        let context = self.inner.auth.check(&parsed, request.headers()).await?;
        let (parts, body) = request.into_parts();

        let result = self.route(&parsed, context, parts, body).await;
        if let Err(e) = &result {
            if e.is_reportable() {
                let _ = self.inner.errors.send(ErrorEvent {
                    repo: parsed.name().to_string(),
                    service: parsed.service(),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    #[tracing::instrument(skip_all, fields(route = %parsed.route(), repo = %parsed.repo()))]
    async fn route(
        &self,
        parsed: &ParsedGitRequest,
        context: Option<C>,
        parts: Parts,
        body: Body,
    ) -> Result<Response, ServerError> {
        match parsed {
            ParsedGitRequest::Info { service, .. } => {
                self.info(parsed, *service, context, parts, body).await
            }
            ParsedGitRequest::Head { .. } => self.head(parsed, context, parts, body).await,
            ParsedGitRequest::Service { service, .. } => {
                self.service(parsed, *service, context, parts, body).await
            }
        }
    }

    /// Resolves the repository, creating it when allowed.
    async fn ensure_repo(
        &self,
        parsed: &ParsedGitRequest,
        may_create: bool,
    ) -> Result<PathBuf, ServerError> {
        let store = &self.inner.store;
        let repo = parsed.repo();

        if !store.exists(repo).await {
            if !(may_create && self.inner.auto_create) {
                return Err(ServerError::RepoNotFound(repo.to_string()));
            }
            store.create(repo).await?;
        }
        Ok(store.path(repo))
    }

    fn event(
        &self,
        operation: Operation,
        context: Option<C>,
        duplex: &Arc<Duplex>,
    ) -> OperationEvent<C> {
        OperationEvent::new(
            operation,
            context,
            Vec::new(),
            duplex.clone(),
            Arc::new(LogQueue::default()),
        )
    }

    async fn info(
        &self,
        parsed: &ParsedGitRequest,
        service: Service,
        context: Option<C>,
        parts: Parts,
        body: Body,
    ) -> Result<Response, ServerError> {
        let repo_path = self.ensure_repo(parsed, true).await?;
        let duplex = Arc::new(Duplex::new(parts, body));

        let operation = Operation::Info {
            repo: parsed.name().to_string(),
            service,
        };
        let event = self.event(operation, context, &duplex);
        let status = decide(
            &self.inner.listeners,
            &event,
            &duplex,
            self.inner.session.decision_timeout,
        )
        .await;
        if status == SessionStatus::Rejected {
            return Ok(duplex.response());
        }

        duplex.set_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static(service.advertisement_content_type()),
        );
        set_no_cache(&duplex);

        let command = GitCommand::advertise_refs(service, repo_path);
        let mut child = self
            .inner
            .spawner
            .spawn(&command)
            .map_err(|source| SessionError::Spawn {
                command: command.describe(),
                source,
            })?;
        // The advertisement reads nothing.
        drop(child.stdin.take());

        Bridge::new(
            duplex.clone(),
            child,
            command,
            parsed.name().to_string(),
            self.inner.errors.clone(),
        )?
        .with_preamble(service_announcement(service))
        .spawn();

        Ok(duplex.response())
    }

    async fn head(
        &self,
        parsed: &ParsedGitRequest,
        context: Option<C>,
        parts: Parts,
        body: Body,
    ) -> Result<Response, ServerError> {
        let repo_path = self.ensure_repo(parsed, false).await?;
        let duplex = Arc::new(Duplex::new(parts, body));

        let operation = Operation::Head {
            repo: parsed.name().to_string(),
        };
        let event = self.event(operation, context, &duplex);
        let status = decide(
            &self.inner.listeners,
            &event,
            &duplex,
            self.inner.session.decision_timeout,
        )
        .await;
        if status == SessionStatus::Rejected {
            return Ok(duplex.response());
        }

        let contents = tokio::fs::read(repo_path.join("HEAD"))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ServerError::RepoNotFound(parsed.repo().to_string()),
                _ => ServerError::Io(e),
            })?;

        duplex.set_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        duplex.write(Bytes::from(contents)).await?;
        duplex.end();
        Ok(duplex.response())
    }

    async fn service(
        &self,
        parsed: &ParsedGitRequest,
        service: Service,
        context: Option<C>,
        parts: Parts,
        body: Body,
    ) -> Result<Response, ServerError> {
        let decoder = BodyDecoder::from_headers(&parts.headers)?;
        let repo_path = self.ensure_repo(parsed, true).await?;

        let duplex = Arc::new(Duplex::new(parts, body));
        duplex.set_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static(service.result_content_type()),
        );
        set_no_cache(&duplex);

        let session = PackSession {
            duplex,
            decoder,
            service,
            repo: parsed.name().to_string(),
            repo_path,
            context,
            registry: self.inner.listeners.clone(),
            spawner: self.inner.spawner.clone(),
            errors: self.inner.errors.clone(),
            config: self.inner.session,
        };
        Ok(session.run().await?)
    }
}

fn set_no_cache(duplex: &Duplex) {
    duplex.set_header(
        header::EXPIRES,
        HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"),
    );
    duplex.set_header(header::PRAGMA, HeaderValue::from_static("no-cache"));
    duplex.set_header(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
    );
}

/// Fallback handler serving every request.
async fn handle<C: Send + Sync + 'static>(
    State(server): State<GitServer<C>>,
    request: Request,
) -> Response {
    let mut response = match server.dispatch(request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}
