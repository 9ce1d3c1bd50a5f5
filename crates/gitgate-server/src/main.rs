//! gitgate - git smart HTTP server.

use anyhow::Context;
use clap::Parser;
use gitgate_server::observability::{init_logging, LogFormat};
use gitgate_server::{
    AuthError, AuthRequest, EventKind, FsRepositoryStore, GitServer, Invocation, Operation,
    ServerConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

/// Serve git repositories over smart HTTP.
#[derive(Parser, Debug)]
#[command(name = "gitgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Directory holding the repositories
    #[arg(long)]
    repo_root: Option<PathBuf>,

    /// Create repositories on first push or fetch
    #[arg(long)]
    auto_create: bool,

    /// Invoke git-upload-pack/git-receive-pack directly instead of via `git`
    #[arg(long)]
    dashed: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(repo_root) = self.repo_root {
            config.repo_root = repo_root;
        }
        if self.auto_create {
            config.auto_create = true;
        }
        if self.dashed {
            config.invocation = Invocation::Dashed;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = LogFormat::parse(&format);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;
    init_logging(&config.log_level, config.log_format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        repo_root = %config.repo_root.display(),
        auto_create = config.auto_create,
        "starting gitgate"
    );

    std::fs::create_dir_all(&config.repo_root).with_context(|| {
        format!(
            "failed to create repository root {}",
            config.repo_root.display()
        )
    })?;

    let mut builder = GitServer::<String>::builder(FsRepositoryStore::new(&config.repo_root))
        .config(config.clone());

    if let Some(expected) = config.basic_auth.clone() {
        builder = builder.authorize(move |request: AuthRequest| {
            let expected = expected.clone();
            async move {
                let credentials = request.credentials.basic()?;
                if credentials.username != expected.username
                    || credentials.password != expected.password
                {
                    return Err(AuthError::InvalidCredentials(
                        "unknown user or wrong password".to_string(),
                    ));
                }
                Ok::<_, AuthError>(credentials.username)
            }
        });
    }

    let server = builder.build();

    for kind in [
        EventKind::Push,
        EventKind::Tag,
        EventKind::Fetch,
        EventKind::Info,
        EventKind::Head,
    ] {
        server.on(kind, |event| {
            let user = event.context().map(String::as_str).unwrap_or("anonymous");
            match event.operation() {
                Operation::Push { branch, new_commit, .. } => {
                    tracing::info!(repo = %event.repo(), %branch, commit = %new_commit, %user, "push");
                }
                Operation::Tag { version, commit, .. } => {
                    tracing::info!(repo = %event.repo(), %version, %commit, %user, "tag");
                }
                other => {
                    tracing::debug!(kind = %other.kind(), repo = %event.repo(), %user, "request");
                }
            }
            event.accept();
        });
    }

    let mut errors = server.subscribe_errors();
    tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(error) => tracing::warn!(
                    repo = %error.repo,
                    service = ?error.service,
                    message = %error.message,
                    "git error"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "error log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await
        .context("server failed")?;

    Ok(())
}
