//! # gitgate server
//!
//! A git smart HTTP server that lets the embedding application see, and
//! decide on, every operation before git runs it.
//!
//! ```text
//! request ─▶ router ─▶ auth gate ─▶ info/refs ─┐
//!                                   HEAD       ├─▶ listeners accept/reject ─▶ git ─▶ response
//!                                   git-*  ────┘        (push, tag, fetch, info, head)
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gitgate_server::{EventKind, FsRepositoryStore, GitServer};
//!
//! # async fn run() -> std::io::Result<()> {
//! let server: GitServer<()> = GitServer::builder(FsRepositoryStore::new("/srv/git"))
//!     .auto_create(true)
//!     .build();
//!
//! server.on(EventKind::Push, |event| {
//!     if let gitgate_server::Operation::Push { branch, .. } = event.operation() {
//!         if branch == "main" {
//!             event.reject(403, "main is protected");
//!             return;
//!         }
//!     }
//!     event.log("push accepted");
//!     event.accept();
//! });
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! server.serve(listener, async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`router`] - request classification
//! - [`auth`] - authorization gate
//! - [`duplex`] - request/response pair with the accept/reject gate
//! - [`event`] - operation events and listeners
//! - [`session`] - pack exchange state machine
//! - [`process`] - git process spawning
//! - [`store`] - repository store
//! - [`observability`] - logging and request ids

pub mod auth;
pub mod body;
pub mod config;
pub mod duplex;
pub mod error;
pub mod event;
pub mod observability;
pub mod process;
pub mod router;
pub mod server;
pub mod session;
pub mod store;

pub use auth::{Access, AuthError, AuthRequest, Authorize, CredentialReader, Credentials};
pub use config::{BasicAuthConfig, ConfigError, ServerConfig};
pub use duplex::{Duplex, DuplexEvent, SessionStatus};
pub use error::{ErrorEvent, ServerError};
pub use event::{EventKind, ListenerRegistry, Operation, OperationEvent, ResponseSink};
pub use process::{GitCommand, GitSpawner, Invocation, ProcessSpawner};
pub use router::{parse_request, ParsedGitRequest, Route, RouteError};
pub use server::{GitServer, GitServerBuilder};
pub use session::{SessionConfig, SessionError};
pub use store::{FsRepositoryStore, RepositoryStore, StoreError};
