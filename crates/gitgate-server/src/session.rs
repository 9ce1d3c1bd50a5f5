//! Pack exchange sessions.
//!
//! A [`PackSession`] serves one `POST /{repo}/git-{service}` request:
//!
//! 1. read and decompress the body until the first command section is
//!    complete (or `max_header_bytes` have arrived),
//! 2. classify it as a push, tag or fetch and hand the event to listeners,
//! 3. wait for one of them to accept or reject,
//! 4. on acceptance spawn git and bridge its stdio to the HTTP exchange.
//!
//! Nothing reaches git's stdin before the exchange is accepted, and a
//! rejected exchange never spawns a process.

use crate::body::BodyDecoder;
use crate::duplex::{Duplex, SessionStatus};
use crate::error::ErrorEvent;
use crate::event::{ListenerRegistry, LogQueue, Operation, OperationEvent, ResponseHook, ResponseSink};
use crate::process::{collect_stderr, GitCommand, ProcessSpawner};
use axum::http::StatusCode;
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use gitgate_protocol::{sniff, ProtocolError, RefKind, RefUpdate, Service, Sniff, FLUSH_PKT};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

/// Default cap on the bytes buffered while looking for the command section.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// Failures that end a session before its response starts.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Reading or decompressing the request body failed.
    #[error("failed to read request body: {0}")]
    Body(#[source] io::Error),

    /// The body is not valid pkt-line framing.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// git could not be started.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A spawned process came back without one of its pipes.
    #[error("{0} was spawned without piped stdio")]
    MissingPipe(String),
}

impl SessionError {
    pub fn status(&self) -> StatusCode {
        match self {
            SessionError::Body(_) | SessionError::Protocol(_) => StatusCode::BAD_REQUEST,
            SessionError::Spawn { .. } | SessionError::MissingPipe(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Per-session limits.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Bytes buffered at most before classifying the request.
    pub max_header_bytes: usize,
    /// How long listeners get to decide. `None` waits forever.
    pub decision_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            decision_timeout: None,
        }
    }
}

/// Dispatches `event` and waits until it is decided.
///
/// With no listeners the event is already accepted. When the timeout runs
/// out the exchange is rejected with 504.
pub(crate) async fn decide<C>(
    registry: &ListenerRegistry<C>,
    event: &OperationEvent<C>,
    duplex: &Duplex,
    timeout: Option<Duration>,
) -> SessionStatus {
    if !registry.dispatch(event) {
        return duplex.status();
    }

    match timeout {
        Some(limit) => match tokio::time::timeout(limit, duplex.decided()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(
                    kind = %event.kind(),
                    repo = %event.repo(),
                    timeout_secs = limit.as_secs(),
                    "no decision in time"
                );
                duplex.reject(StatusCode::GATEWAY_TIMEOUT.as_u16(), "decision timed out");
                duplex.status()
            }
        },
        None => duplex.decided().await,
    }
}

/// Turns a sniffed header into the event listeners see.
fn classify(repo: &str, sniffed: Sniff) -> Option<(Operation, Vec<RefUpdate>)> {
    let repo = repo.to_string();
    match sniffed {
        Sniff::ReceivePack(header) => {
            let first = header.first()?.clone();
            let operation = match first.ref_kind {
                RefKind::Heads => Operation::Push {
                    repo,
                    old_commit: first.old,
                    new_commit: first.new,
                    branch: first.name,
                },
                RefKind::Tags => Operation::Tag {
                    repo,
                    commit: first.new,
                    version: first.name,
                },
                RefKind::Other => return None,
            };
            Some((operation, header.updates))
        }
        Sniff::UploadPack(header) => Some((
            Operation::Fetch {
                repo,
                commit: header.commit().map(str::to_string),
            },
            Vec::new(),
        )),
        Sniff::Empty | Sniff::Incomplete => None,
    }
}

/// One stateless-rpc exchange.
pub(crate) struct PackSession<C> {
    pub duplex: Arc<Duplex>,
    pub decoder: BodyDecoder,
    pub service: Service,
    /// Name shown to listeners.
    pub repo: String,
    pub repo_path: PathBuf,
    pub context: Option<C>,
    pub registry: Arc<ListenerRegistry<C>>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub errors: broadcast::Sender<ErrorEvent>,
    pub config: SessionConfig,
}

impl<C: Send + Sync + 'static> PackSession<C> {
    /// Runs the session up to the point where the response can be returned.
    /// Bridging continues in a background task.
    pub async fn run(mut self) -> Result<Response, SessionError> {
        let (head, sniffed, body_done) = self.ingest().await?;
        let logs = Arc::new(LogQueue::default());

        let hook = match classify(&self.repo, sniffed) {
            Some((operation, updates)) => {
                tracing::debug!(kind = %operation.kind(), repo = %self.repo, "sniffed operation");
                let event = OperationEvent::new(
                    operation,
                    self.context.take(),
                    updates,
                    self.duplex.clone(),
                    logs.clone(),
                );
                let status = decide(
                    &self.registry,
                    &event,
                    &self.duplex,
                    self.config.decision_timeout,
                )
                .await;
                if status == SessionStatus::Rejected {
                    return Ok(self.duplex.response());
                }
                event.take_response_hook()
            }
            None => {
                tracing::debug!(repo = %self.repo, "push without branch or tag updates");
                self.duplex.accept();
                None
            }
        };

        let command = GitCommand::stateless_rpc(self.service, self.repo_path.clone());
        let mut child = self
            .spawner
            .spawn(&command)
            .map_err(|source| SessionError::Spawn {
                command: command.describe(),
                source,
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::MissingPipe(command.describe()))?;

        let bridge = Bridge::new(
            self.duplex.clone(),
            child,
            command,
            self.repo.clone(),
            self.errors.clone(),
        )?
        .with_logs(logs)
        .with_hook(hook);

        let feeder = tokio::spawn(feed_stdin(
            self.duplex.clone(),
            self.decoder,
            head,
            body_done,
            stdin,
        ));
        bridge.with_feeder(feeder).spawn();

        Ok(self.duplex.response())
    }

    /// Buffers decoded body bytes until the first command section can be
    /// classified. Returns the buffered bytes, the classification and
    /// whether the body already ended.
    async fn ingest(&mut self) -> Result<(Vec<u8>, Sniff, bool), SessionError> {
        let mut head = Vec::new();

        loop {
            let eof = match self.duplex.read_chunk().await {
                Some(Ok(chunk)) => {
                    let data = self.decoder.decode(&chunk).map_err(SessionError::Body)?;
                    head.extend_from_slice(&data);
                    false
                }
                Some(Err(e)) => return Err(SessionError::Body(e)),
                None => {
                    let data = self.decoder.finish().map_err(SessionError::Body)?;
                    head.extend_from_slice(&data);
                    true
                }
            };

            let settle = eof || head.len() >= self.config.max_header_bytes;
            match sniff(self.service, &head, settle)? {
                Sniff::Incomplete => continue,
                sniffed => return Ok((head, sniffed, eof)),
            }
        }
    }
}

/// Writes the buffered head and then the rest of the body to git's stdin.
async fn feed_stdin(
    duplex: Arc<Duplex>,
    decoder: BodyDecoder,
    head: Vec<u8>,
    body_done: bool,
    stdin: ChildStdin,
) {
    if let Err(e) = pump_body(&duplex, decoder, head, body_done, stdin).await {
        tracing::debug!(error = %e, "stopped feeding git stdin");
    }
}

async fn pump_body(
    duplex: &Duplex,
    mut decoder: BodyDecoder,
    head: Vec<u8>,
    body_done: bool,
    mut stdin: ChildStdin,
) -> io::Result<()> {
    stdin.write_all(&head).await?;

    if !body_done {
        while let Some(chunk) = duplex.read_chunk().await {
            let data = decoder.decode(&chunk?)?;
            if !data.is_empty() {
                stdin.write_all(&data).await?;
            }
        }
        let tail = decoder.finish()?;
        stdin.write_all(&tail).await?;
    }

    // Closing stdin tells git the request is complete.
    stdin.shutdown().await
}

/// Holds back the final flush-pkt of git's output so a response hook can
/// write after it.
#[derive(Debug)]
pub(crate) struct ResponseFilter {
    hold_flush: bool,
    tail: Vec<u8>,
}

impl ResponseFilter {
    pub fn new(hold_flush: bool) -> Self {
        Self {
            hold_flush,
            tail: Vec::new(),
        }
    }

    /// Returns the part of `chunk` that can be written now.
    pub fn push(&mut self, chunk: Bytes) -> Bytes {
        if !self.hold_flush {
            return chunk;
        }

        let mut data = std::mem::take(&mut self.tail);
        data.extend_from_slice(&chunk);
        let keep = data.len().min(FLUSH_PKT.len());
        self.tail = data.split_off(data.len() - keep);
        Bytes::from(data)
    }

    /// Returns whatever is still held at end of output, minus a trailing
    /// flush-pkt.
    pub fn finish(&mut self) -> Bytes {
        let tail = std::mem::take(&mut self.tail);
        if self.hold_flush && tail.as_slice() == FLUSH_PKT {
            Bytes::new()
        } else {
            Bytes::from(tail)
        }
    }
}

/// Copies a git process's stdout into a duplex.
pub(crate) struct Bridge {
    duplex: Arc<Duplex>,
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    command: GitCommand,
    repo: String,
    errors: broadcast::Sender<ErrorEvent>,
    preamble: Option<Bytes>,
    logs: Option<Arc<LogQueue>>,
    hook: Option<ResponseHook>,
    feeder: Option<JoinHandle<()>>,
}

impl Bridge {
    pub fn new(
        duplex: Arc<Duplex>,
        mut child: Child,
        command: GitCommand,
        repo: String,
        errors: broadcast::Sender<ErrorEvent>,
    ) -> Result<Self, SessionError> {
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(SessionError::MissingPipe(command.describe()));
        };

        Ok(Self {
            duplex,
            child,
            stdout,
            stderr,
            command,
            repo,
            errors,
            preamble: None,
            logs: None,
            hook: None,
            feeder: None,
        })
    }

    /// Bytes written before git's output.
    pub fn with_preamble(mut self, preamble: impl Into<Bytes>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_logs(mut self, logs: Arc<LogQueue>) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn with_hook(mut self, hook: Option<ResponseHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Task feeding git's stdin, aborted if the client goes away.
    pub fn with_feeder(mut self, feeder: JoinHandle<()>) -> Self {
        self.feeder = Some(feeder);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let Bridge {
            duplex,
            mut child,
            stdout,
            stderr,
            command,
            repo,
            errors,
            preamble,
            logs,
            hook,
            feeder,
        } = self;

        let stderr = tokio::spawn(collect_stderr(stderr));
        let mut stdout = ReaderStream::new(stdout);
        let mut filter = ResponseFilter::new(hook.is_some());
        let flush_before_chunks = hook.is_none();

        let streamed = async {
            if let Some(preamble) = preamble {
                duplex.write(preamble).await?;
            }

            loop {
                let next = tokio::select! {
                    next = stdout.next() => next,
                    _ = duplex.closed() => {
                        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"));
                    }
                };

                match next {
                    Some(Ok(chunk)) => {
                        if flush_before_chunks {
                            write_logs(&duplex, logs.as_deref()).await?;
                        }
                        let data = filter.push(chunk);
                        if !data.is_empty() {
                            duplex.write(data).await?;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(command = %command.describe(), error = %e, "reading git stdout failed");
                        break;
                    }
                    None => break,
                }
            }

            let tail = filter.finish();
            if !tail.is_empty() {
                duplex.write(tail).await?;
            }
            Ok::<(), io::Error>(())
        };

        if let Err(e) = streamed.await {
            tracing::info!(
                command = %command.describe(),
                repo = %repo,
                error = %e,
                "client went away, stopping git"
            );
            if let Some(feeder) = feeder {
                feeder.abort();
            }
            stderr.abort();
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "kill failed");
            }
            let _ = child.wait().await;
            duplex.destroy();
            return;
        }

        match child.wait().await {
            Ok(status) if status.success() => {
                tracing::debug!(command = %command.describe(), repo = %repo, "git finished");
            }
            Ok(status) => {
                let stderr = stderr.await.unwrap_or_default();
                tracing::warn!(
                    command = %command.describe(),
                    repo = %repo,
                    status = %status,
                    stderr = %stderr,
                    "git exited unsuccessfully"
                );
                let _ = errors.send(ErrorEvent {
                    repo: repo.clone(),
                    service: Some(command.service),
                    message: format!("{} exited with {status}: {stderr}", command.describe()),
                });
            }
            Err(e) => {
                tracing::error!(command = %command.describe(), repo = %repo, error = %e, "waiting for git failed");
                let _ = errors.send(ErrorEvent {
                    repo: repo.clone(),
                    service: Some(command.service),
                    message: e.to_string(),
                });
            }
        }

        let flushed = match write_logs(&duplex, logs.as_deref()).await {
            Ok(flushed) => flushed,
            Err(_) => {
                duplex.destroy();
                return;
            }
        };

        match hook {
            Some(hook) => hook(ResponseSink::new(duplex.clone())).await,
            None if flushed > 0 => {
                if let Err(e) = duplex.write(Bytes::from_static(FLUSH_PKT)).await {
                    tracing::debug!(error = %e, "final flush-pkt not delivered");
                }
            }
            None => {}
        }

        duplex.end();
    }
}

/// Writes queued log frames, returning how many were written.
async fn write_logs(duplex: &Duplex, logs: Option<&LogQueue>) -> io::Result<usize> {
    let Some(logs) = logs else {
        return Ok(0);
    };

    let frames = logs.drain();
    let count = frames.len();
    for frame in frames {
        duplex.write(frame).await?;
    }
    Ok(count)
}
