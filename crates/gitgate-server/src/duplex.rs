//! Request/response duplex.
//!
//! A [`Duplex`] owns one HTTP exchange: the inbound body, the outbound
//! body channel, and the response head. Its `accept`/`reject` gate is the
//! only way to resolve a pending exchange. Bytes written while the gate is
//! still pending are held back and only reach the client once the exchange
//! is accepted.

use axum::body::{Body, BodyDataStream};
use axum::http::{request::Parts, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{broadcast, watch};

/// Outbound chunks buffered between the producer and hyper.
pub const OUTBOUND_CAPACITY: usize = 16;

/// Status used when a rejection names no valid code.
pub const DEFAULT_REJECT_STATUS: StatusCode = StatusCode::INTERNAL_SERVER_ERROR;

const EVENT_CAPACITY: usize = 64;

/// Decision state of an exchange. Leaves `Pending` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Accepted,
    Rejected,
}

/// Notifications observable through [`Duplex::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplexEvent {
    /// An inbound body chunk of this many bytes was read.
    Data(usize),
    /// The inbound body ended.
    End,
    /// Reading the inbound body failed.
    Error(String),
    /// The exchange was torn down.
    Close,
    /// A write that had to wait for the client completed.
    Drain,
}

struct ResponseHead {
    status: StatusCode,
    message: Option<String>,
    headers: HeaderMap,
}

/// Outbound body handed to hyper. Dropping it, whether because the body
/// completed or because the client went away, flips the `peer_closed` flag.
struct OutboundStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    peer_closed: Arc<watch::Sender<bool>>,
}

impl Stream for OutboundStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for OutboundStream {
    fn drop(&mut self) {
        self.peer_closed.send_replace(true);
    }
}

/// One HTTP request/response pair.
pub struct Duplex {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: tokio::sync::Mutex<Option<BodyDataStream>>,
    response: Mutex<ResponseHead>,
    status: watch::Sender<SessionStatus>,
    queued: Mutex<Vec<Bytes>>,
    outbound: Mutex<Option<mpsc::Sender<io::Result<Bytes>>>>,
    stream: Mutex<Option<OutboundStream>>,
    peer_closed: Arc<watch::Sender<bool>>,
    events: broadcast::Sender<DuplexEvent>,
    destroyed: AtomicBool,
}

impl Duplex {
    /// Wraps an incoming request.
    pub fn new(parts: Parts, body: Body) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (peer_closed, _) = watch::channel(false);
        let peer_closed = Arc::new(peer_closed);
        let (status, _) = watch::channel(SessionStatus::Pending);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body: tokio::sync::Mutex::new(Some(body.into_data_stream())),
            response: Mutex::new(ResponseHead {
                status: StatusCode::OK,
                message: None,
                headers: HeaderMap::new(),
            }),
            status,
            queued: Mutex::new(Vec::new()),
            outbound: Mutex::new(Some(tx)),
            stream: Mutex::new(Some(OutboundStream {
                rx,
                peer_closed: peer_closed.clone(),
            })),
            peer_closed,
            events,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Current response status.
    pub fn status_code(&self) -> StatusCode {
        self.response.lock().status
    }

    pub fn set_status_code(&self, status: StatusCode) {
        self.response.lock().status = status;
    }

    /// Message a rejection answered with.
    pub fn status_message(&self) -> Option<String> {
        self.response.lock().message.clone()
    }

    /// Sets a response header, replacing any previous value.
    pub fn set_header(&self, name: HeaderName, value: HeaderValue) {
        self.response.lock().headers.insert(name, value);
    }

    /// Response headers set so far.
    pub fn response_headers(&self) -> HeaderMap {
        self.response.lock().headers.clone()
    }

    /// Observes transport events.
    pub fn subscribe(&self) -> broadcast::Receiver<DuplexEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DuplexEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Accepts the exchange. Returns false if it was already decided.
    pub fn accept(&self) -> bool {
        self.status.send_if_modified(|status| {
            if *status == SessionStatus::Pending {
                *status = SessionStatus::Accepted;
                true
            } else {
                false
            }
        })
    }

    /// Rejects the exchange with `code` and `message`. Codes outside the
    /// valid HTTP range answer with [`DEFAULT_REJECT_STATUS`]. Returns false
    /// if the exchange was already decided.
    pub fn reject(&self, code: u16, message: impl Into<String>) -> bool {
        let changed = self.status.send_if_modified(|status| {
            if *status == SessionStatus::Pending {
                *status = SessionStatus::Rejected;
                true
            } else {
                false
            }
        });

        if changed {
            let mut head = self.response.lock();
            head.status = StatusCode::from_u16(code).unwrap_or(DEFAULT_REJECT_STATUS);
            head.message = Some(message.into());
            self.queued.lock().clear();
        }
        changed
    }

    /// Waits until the exchange leaves `Pending`.
    pub async fn decided(&self) -> SessionStatus {
        let mut rx = self.status.subscribe();
        let decided = rx
            .wait_for(|status| *status != SessionStatus::Pending)
            .await
            .map(|status| *status);
        // The sender lives in `self`, so the error arm is unreachable.
        decided.unwrap_or_else(|_| self.status())
    }

    /// Reads the next inbound body chunk, or `None` once the body ended.
    pub async fn read_chunk(&self) -> Option<io::Result<Bytes>> {
        let mut body = self.body.lock().await;
        let stream = body.as_mut()?;

        match stream.next().await {
            Some(Ok(chunk)) => {
                self.emit(DuplexEvent::Data(chunk.len()));
                Some(Ok(chunk))
            }
            Some(Err(e)) => {
                *body = None;
                let err = io::Error::other(e);
                self.emit(DuplexEvent::Error(err.to_string()));
                Some(Err(err))
            }
            None => {
                *body = None;
                self.emit(DuplexEvent::End);
                None
            }
        }
    }

    /// Writes a chunk to the client.
    ///
    /// Before acceptance the chunk is queued; after acceptance queued chunks
    /// go out first. Waits while the client is not keeping up, and fails
    /// with `BrokenPipe` once the client is gone or the exchange was
    /// rejected.
    pub async fn write(&self, chunk: Bytes) -> io::Result<()> {
        match self.status() {
            SessionStatus::Pending => {
                self.queued.lock().push(chunk);
                return Ok(());
            }
            SessionStatus::Rejected => return Err(broken_pipe("exchange was rejected")),
            SessionStatus::Accepted => {}
        }

        let queued = std::mem::take(&mut *self.queued.lock());
        for item in queued {
            self.send(Ok(item)).await?;
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.send(Ok(chunk)).await
    }

    /// Sends queued chunks without adding new data.
    pub async fn flush(&self) -> io::Result<()> {
        self.write(Bytes::new()).await
    }

    /// Fails the outbound body so the client sees a truncated response.
    pub async fn abort(&self, error: io::Error) {
        let _ = self.send(Err(error)).await;
        self.end();
    }

    async fn send(&self, item: io::Result<Bytes>) -> io::Result<()> {
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| broken_pipe("response already ended"))?;

        match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => {
                tx.send(item)
                    .await
                    .map_err(|_| broken_pipe("client disconnected"))?;
                self.emit(DuplexEvent::Drain);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(broken_pipe("client disconnected")),
        }
    }

    /// Ends the outbound body once buffered chunks are delivered.
    pub fn end(&self) {
        self.outbound.lock().take();
    }

    /// Resolves once the client stopped reading the response, either
    /// because the body completed or because the connection went away.
    pub async fn closed(&self) {
        let mut rx = self.peer_closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Releases both directions. Safe to call more than once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound.lock().take();
        self.stream.lock().take();
        if let Ok(mut body) = self.body.try_lock() {
            body.take();
        }
        self.emit(DuplexEvent::Close);
    }

    /// Builds the HTTP response for a decided exchange.
    ///
    /// A rejected exchange answers with its status and message. Otherwise
    /// the response streams whatever is written to this duplex.
    pub fn response(&self) -> Response {
        let (status, message, headers) = {
            let head = self.response.lock();
            (head.status, head.message.clone(), head.headers.clone())
        };

        if self.status() == SessionStatus::Rejected {
            return (status, message.unwrap_or_default()).into_response();
        }

        let body = self
            .stream
            .lock()
            .take()
            .map(Body::from_stream)
            .unwrap_or_else(Body::empty);

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

fn broken_pipe(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn duplex(body: &'static str) -> Duplex {
        let (parts, body) = Request::builder()
            .method("POST")
            .uri("/demo.git/git-upload-pack")
            .header("x-test", "1")
            .body(Body::from(body))
            .unwrap()
            .into_parts();
        Duplex::new(parts, body)
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_request_projection() {
        let d = duplex("");
        assert_eq!(d.method(), Method::POST);
        assert_eq!(d.uri().path(), "/demo.git/git-upload-pack");
        assert_eq!(d.headers().get("x-test").unwrap(), "1");
        assert_eq!(d.version(), Version::HTTP_11);
    }

    #[test]
    fn test_decision_is_final() {
        let d = duplex("");
        assert_eq!(d.status(), SessionStatus::Pending);
        assert!(d.accept());
        assert!(!d.accept());
        assert!(!d.reject(403, "too late"));
        assert_eq!(d.status(), SessionStatus::Accepted);
        assert_eq!(d.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_reject_discards_queued_writes() {
        let d = duplex("");
        d.write(Bytes::from_static(b"secret")).await.unwrap();
        assert!(d.reject(403, "nope"));
        assert!(d.write(Bytes::from_static(b"more")).await.is_err());

        let response = d.response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_text(response).await, "nope");
    }

    #[tokio::test]
    async fn test_invalid_reject_code_defaults_to_500() {
        let d = duplex("");
        d.reject(42, "odd");
        assert_eq!(d.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(d.status_message().as_deref(), Some("odd"));
    }

    #[tokio::test]
    async fn test_queued_writes_flush_in_order() {
        let d = duplex("");
        d.set_header(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        d.write(Bytes::from_static(b"a")).await.unwrap();
        d.write(Bytes::from_static(b"b")).await.unwrap();
        d.accept();
        d.write(Bytes::from_static(b"c")).await.unwrap();
        d.end();

        let response = d.response();
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
        assert_eq!(body_text(response).await, "abc");
    }

    #[tokio::test]
    async fn test_decided_wakes_waiter() {
        let d = Arc::new(duplex(""));
        let waiter = {
            let d = d.clone();
            tokio::spawn(async move { d.decided().await })
        };
        tokio::task::yield_now().await;
        d.reject(401, "who are you");
        assert_eq!(waiter.await.unwrap(), SessionStatus::Rejected);
    }

    #[tokio::test]
    async fn test_read_events() {
        let d = duplex("hello");
        let mut events = d.subscribe();

        let mut read = Vec::new();
        while let Some(chunk) = d.read_chunk().await {
            read.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(read, b"hello");
        assert!(d.read_chunk().await.is_none());

        assert_eq!(events.recv().await.unwrap(), DuplexEvent::Data(5));
        assert_eq!(events.recv().await.unwrap(), DuplexEvent::End);
    }

    #[tokio::test]
    async fn test_dropped_response_closes_writes() {
        let d = duplex("");
        d.accept();
        drop(d.response());

        d.closed().await;
        let err = d.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let d = duplex("body");
        let mut events = d.subscribe();
        d.destroy();
        d.destroy();

        assert_eq!(events.recv().await.unwrap(), DuplexEvent::Close);
        assert!(events.try_recv().is_err());
        assert!(d.read_chunk().await.is_none());
    }
}
