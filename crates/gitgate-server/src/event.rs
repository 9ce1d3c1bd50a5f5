//! Operation events and the listener registry.
//!
//! Each routed request produces exactly one [`OperationEvent`]. The event is
//! handed to every listener registered for its [`EventKind`]; one of them
//! resolves it with [`OperationEvent::accept`] or [`OperationEvent::reject`].
//! A kind with no listeners is accepted without asking anyone.

use crate::duplex::{Duplex, SessionStatus};
use axum::http::HeaderMap;
use bytes::Bytes;
use futures::future::BoxFuture;
use gitgate_protocol::{progress, RefUpdate, Service, FLUSH_PKT, MAX_PKT_LEN};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;

/// Largest progress text that fits one sideband frame.
const MAX_LOG_CHUNK: usize = MAX_PKT_LEN - 5;

/// Listener table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Push,
    Tag,
    Fetch,
    Info,
    Head,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Push => "push",
            EventKind::Tag => "tag",
            EventKind::Fetch => "fetch",
            EventKind::Info => "info",
            EventKind::Head => "head",
        })
    }
}

/// What the client is trying to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Branch update.
    Push {
        repo: String,
        old_commit: String,
        new_commit: String,
        branch: String,
    },
    /// Tag update. `commit` is the id the tag will point at.
    Tag {
        repo: String,
        commit: String,
        version: String,
    },
    /// Clone or fetch. `commit` is the first wanted id.
    Fetch { repo: String, commit: Option<String> },
    /// Ref advertisement.
    Info { repo: String, service: Service },
    /// HEAD probe.
    Head { repo: String },
}

impl Operation {
    pub fn kind(&self) -> EventKind {
        match self {
            Operation::Push { .. } => EventKind::Push,
            Operation::Tag { .. } => EventKind::Tag,
            Operation::Fetch { .. } => EventKind::Fetch,
            Operation::Info { .. } => EventKind::Info,
            Operation::Head { .. } => EventKind::Head,
        }
    }

    /// Repository name, without a trailing `.git`.
    pub fn repo(&self) -> &str {
        match self {
            Operation::Push { repo, .. }
            | Operation::Tag { repo, .. }
            | Operation::Fetch { repo, .. }
            | Operation::Info { repo, .. }
            | Operation::Head { repo } => repo,
        }
    }
}

/// Sideband log lines waiting to be written, newest first.
#[derive(Debug, Default)]
pub struct LogQueue {
    pending: Mutex<VecDeque<Bytes>>,
}

impl LogQueue {
    /// Frames `message` on the progress channel and queues it.
    pub fn push(&self, message: &str) {
        let mut text = message.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }

        let mut pending = self.pending.lock();
        let mut rest = text.as_str();
        while !rest.is_empty() {
            // Split on a character boundary so no frame carries half a char.
            let mut end = rest.len().min(MAX_LOG_CHUNK);
            while !rest.is_char_boundary(end) {
                end -= 1;
            }
            let (chunk, tail) = rest.split_at(end);
            match progress(chunk) {
                Ok(frame) => pending.push_front(Bytes::from(frame)),
                Err(e) => tracing::warn!(error = %e, "dropping log line"),
            }
            rest = tail;
        }
    }

    /// Removes every queued frame, oldest first.
    pub fn drain(&self) -> Vec<Bytes> {
        let mut pending = self.pending.lock();
        let mut frames = Vec::with_capacity(pending.len());
        while let Some(frame) = pending.pop_back() {
            frames.push(frame);
        }
        frames
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Output hook installed with [`OperationEvent::on_response`].
pub type ResponseHook = Box<dyn FnOnce(ResponseSink) -> BoxFuture<'static, ()> + Send>;

/// Write access to a pack response after git finished writing it.
///
/// The closing flush-pkt has been held back; [`ResponseSink::end`] writes
/// it and ends the response. Dropping the sink without calling `end` still
/// ends the response, just without the flush-pkt.
pub struct ResponseSink {
    duplex: Arc<Duplex>,
}

impl ResponseSink {
    pub(crate) fn new(duplex: Arc<Duplex>) -> Self {
        Self { duplex }
    }

    /// Writes raw bytes.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> io::Result<()> {
        self.duplex.write(data.into()).await
    }

    /// Writes a progress message immediately.
    pub async fn log(&mut self, message: impl fmt::Display) -> io::Result<()> {
        let queue = LogQueue::default();
        queue.push(&message.to_string());
        for frame in queue.drain() {
            self.duplex.write(frame).await?;
        }
        Ok(())
    }

    /// Writes the flush-pkt and ends the response.
    pub async fn end(self) -> io::Result<()> {
        self.duplex.write(Bytes::from_static(FLUSH_PKT)).await
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        self.duplex.end();
    }
}

struct EventInner<C> {
    operation: Operation,
    context: Option<C>,
    ref_updates: Vec<RefUpdate>,
    duplex: Arc<Duplex>,
    logs: Arc<LogQueue>,
    response_hook: Mutex<Option<ResponseHook>>,
}

/// A pending operation handed to listeners.
///
/// Clones share the same underlying exchange, so a listener can move a clone
/// into a task and decide later.
pub struct OperationEvent<C> {
    inner: Arc<EventInner<C>>,
}

impl<C> Clone for OperationEvent<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> fmt::Debug for OperationEvent<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationEvent")
            .field("operation", &self.inner.operation)
            .field("status", &self.inner.duplex.status())
            .finish()
    }
}

impl<C> OperationEvent<C> {
    pub(crate) fn new(
        operation: Operation,
        context: Option<C>,
        ref_updates: Vec<RefUpdate>,
        duplex: Arc<Duplex>,
        logs: Arc<LogQueue>,
    ) -> Self {
        Self {
            inner: Arc::new(EventInner {
                operation,
                context,
                ref_updates,
                duplex,
                logs,
                response_hook: Mutex::new(None),
            }),
        }
    }

    pub fn operation(&self) -> &Operation {
        &self.inner.operation
    }

    pub fn kind(&self) -> EventKind {
        self.inner.operation.kind()
    }

    pub fn repo(&self) -> &str {
        self.inner.operation.repo()
    }

    /// Value returned by the authorizer, `None` without one.
    pub fn context(&self) -> Option<&C> {
        self.inner.context.as_ref()
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        self.inner.duplex.headers()
    }

    /// Every branch and tag update of a push, in request order.
    pub fn ref_updates(&self) -> &[RefUpdate] {
        &self.inner.ref_updates
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.duplex.status()
    }

    /// Lets the operation proceed. Later calls do nothing.
    pub fn accept(&self) {
        if self.inner.duplex.accept() {
            tracing::debug!(kind = %self.kind(), repo = %self.repo(), "operation accepted");
        }
    }

    /// Refuses the operation with `code` and `message`. No git process is
    /// started. Later calls do nothing.
    pub fn reject(&self, code: u16, message: impl Into<String>) {
        let message = message.into();
        if self.inner.duplex.reject(code, message.clone()) {
            tracing::info!(
                kind = %self.kind(),
                repo = %self.repo(),
                status = code,
                message = %message,
                "operation rejected"
            );
        }
    }

    /// Queues a progress message for the client, shown as `remote: ...`.
    ///
    /// Only pack exchanges carry a sideband channel; on other operations
    /// the message is dropped.
    pub fn log(&self, message: impl fmt::Display) {
        self.inner.logs.push(&message.to_string());
    }

    /// Installs a hook that runs once git's output has been written but
    /// before the response is closed. Only the first hook is kept.
    pub fn on_response<F, Fut>(&self, hook: F)
    where
        F: FnOnce(ResponseSink) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.inner.response_hook.lock();
        if slot.is_none() {
            let boxed: ResponseHook =
                Box::new(move |sink: ResponseSink| -> BoxFuture<'static, ()> { Box::pin(hook(sink)) });
            *slot = Some(boxed);
        }
    }

    pub(crate) fn take_response_hook(&self) -> Option<ResponseHook> {
        self.inner.response_hook.lock().take()
    }
}

/// Callback registered for one event kind.
pub type Listener<C> = Arc<dyn Fn(OperationEvent<C>) + Send + Sync>;

/// Listeners by event kind.
pub struct ListenerRegistry<C> {
    listeners: RwLock<HashMap<EventKind, Vec<Listener<C>>>>,
}

impl<C> Default for ListenerRegistry<C> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
        }
    }
}

impl<C> ListenerRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(OperationEvent<C>) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Number of listeners for `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Hands `event` to every listener of its kind, in registration order.
    ///
    /// Returns false when nobody is listening, in which case the event is
    /// accepted here.
    pub fn dispatch(&self, event: &OperationEvent<C>) -> bool {
        // Clone the list so listeners may register further listeners.
        let listeners = self
            .listeners
            .read()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        if listeners.is_empty() {
            tracing::debug!(kind = %event.kind(), repo = %event.repo(), "no listeners, accepting");
            event.accept();
            return false;
        }

        for listener in listeners {
            listener(event.clone());
        }
        true
    }
}
