//! HTTP control API.
//!
//! Served on a Unix socket and/or a TCP address. Routes:
//!   GET  /healthz                                    - liveness (no auth)
//!   GET  /readyz                                     - readiness (no auth)
//!   GET  /api/v1/processes                           - list processes
//!   GET  /api/v1/processes/{name}                    - one process
//!   POST /api/v1/processes/{name}/start              - start
//!   POST /api/v1/processes/{name}/stop               - stop
//!   POST /api/v1/processes/{name}/restart            - restart
//!   POST /api/v1/processes/{name}/signal             - deliver a signal
//!   POST /api/v1/processes/{name}/stdin              - write to stdin
//!   GET  /api/v1/processes/{name}/log/{stream}       - log snapshot
//!   GET  /api/v1/processes/{name}/log/{stream}/stream - log tail (SSE)
//!   GET  /api/v1/groups                              - list groups
//!   POST /api/v1/groups/{name}/{op}                  - group start/stop/restart
//!   GET  /api/v1/config                              - effective config
//!   POST /api/v1/config/reload                       - reload config
//!   POST /api/v1/shutdown                            - request shutdown
//!   GET  /api/v1/version                             - version info
//!   GET  /api/v1/events/stream                       - event firehose (SSE)
//!
//! Everything under `/api/v1` requires authentication on TCP when
//! credentials are configured; Unix-socket requests bypass it (each
//! bound listener tags requests with its [`Transport`]).

pub mod auth;
pub mod groups;
pub mod processes;
pub mod response;
pub mod sse;
pub mod system;

use crate::control::{ConfigManager, DaemonInfo, GroupManager, ProcessManager};
use axum::{
    Extension, Router, middleware,
    routing::{get, post},
};
use kahi_events::EventBus;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared handler state: the bus plus the four collaborator capabilities.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub processes: Arc<dyn ProcessManager>,
    pub groups: Arc<dyn GroupManager>,
    pub config: Arc<dyn ConfigManager>,
    pub daemon: Arc<dyn DaemonInfo>,
    pub auth: Option<Credentials>,
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    /// bcrypt hash (`$2` prefix) or, for test setups only, plaintext.
    pub password: String,
}

/// Which listener a request arrived on.  Installed as a request
/// extension by each `serve` call so the auth guard never has to
/// inspect peer-address strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Unix,
    Tcp,
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/processes", get(processes::list_processes))
        .route("/api/v1/processes/{name}", get(processes::get_process))
        .route(
            "/api/v1/processes/{name}/start",
            post(processes::start_process),
        )
        .route(
            "/api/v1/processes/{name}/stop",
            post(processes::stop_process),
        )
        .route(
            "/api/v1/processes/{name}/restart",
            post(processes::restart_process),
        )
        .route(
            "/api/v1/processes/{name}/signal",
            post(processes::signal_process),
        )
        .route(
            "/api/v1/processes/{name}/stdin",
            post(processes::write_stdin),
        )
        .route(
            "/api/v1/processes/{name}/log/{stream}",
            get(processes::read_log),
        )
        .route(
            "/api/v1/processes/{name}/log/{stream}/stream",
            get(sse::process_log_sse),
        )
        .route("/api/v1/groups", get(groups::list_groups))
        .route("/api/v1/groups/{name}/{op}", post(groups::group_op))
        .route("/api/v1/config", get(system::get_config))
        .route("/api/v1/config/reload", post(system::reload_config))
        .route("/api/v1/shutdown", post(system::shutdown))
        .route("/api/v1/version", get(system::version))
        .route("/api/v1/events/stream", get(sse::events_sse))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/healthz", get(system::healthz))
        .route("/readyz", get(system::readyz))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Server lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{path} exists and is not a socket")]
    NotASocket { path: String },
    #[error("{path}: {source}")]
    SocketFile {
        path: String,
        source: io::Error,
    },
    #[error("binding {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("shutdown: {0}")]
    Shutdown(String),
}

/// The control API server.  Owns its listeners; both are released by
/// [`Server::stop`].
pub struct Server {
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
    unix_task: Option<JoinHandle<io::Result<()>>>,
    tcp_task: Option<JoinHandle<io::Result<()>>>,
    socket_path: Option<PathBuf>,
    tcp_addr: Option<SocketAddr>,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state,
            shutdown_tx,
            unix_task: None,
            tcp_task: None,
            socket_path: None,
            tcp_addr: None,
        }
    }

    /// Bind a Unix socket at `path` with permission bits `mode` and
    /// begin serving.  A stale socket file is unlinked first; any other
    /// kind of file at `path` is an error.
    pub fn start_unix(&mut self, path: &Path, mode: u32) -> Result<(), ServerError> {
        remove_stale_socket(path)?;
        let listener = UnixListener::bind(path).map_err(|e| ServerError::Bind {
            addr: path.display().to_string(),
            source: e,
        })?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            ServerError::SocketFile {
                path: path.display().to_string(),
                source: e,
            }
        })?;
        info!(path = %path.display(), "control api listening on unix socket");

        let app = build_router(self.state.clone()).layer(Extension(Transport::Unix));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.unix_task = Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        }));
        self.socket_path = Some(path.to_owned());
        Ok(())
    }

    /// Bind a TCP listener at `addr` and begin serving.
    pub async fn start_tcp(&mut self, addr: &str) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
            addr: addr.to_owned(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            addr: addr.to_owned(),
            source: e,
        })?;
        if local_addr.ip().is_unspecified() {
            warn!(
                addr = %local_addr,
                "control api bound to all interfaces; make sure credentials are configured"
            );
        }
        info!(addr = %local_addr, "control api listening on tcp");

        let app = build_router(self.state.clone()).layer(Extension(Transport::Tcp));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.tcp_task = Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        }));
        self.tcp_addr = Some(local_addr);
        Ok(())
    }

    /// Path of the bound Unix socket, if serving one.
    pub fn unix_addr(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// Bound TCP address, if serving one (useful when port 0 was used).
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Gracefully shut both servers down, waiting up to `deadline` for
    /// each, and remove the socket file.  Errors from both listeners
    /// are aggregated; a missing socket file is not an error.
    pub async fn stop(&mut self, deadline: Duration) -> Result<(), ServerError> {
        let _ = self.shutdown_tx.send(true);
        let mut errors = Vec::new();
        let tasks = [
            ("unix", self.unix_task.take()),
            ("tcp", self.tcp_task.take()),
        ];
        for (label, task) in tasks {
            let Some(mut task) = task else { continue };
            match tokio::time::timeout(deadline, &mut task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(error))) => errors.push(format!("{label}: {error}")),
                Ok(Err(join_error)) => errors.push(format!("{label}: {join_error}")),
                Err(_) => {
                    task.abort();
                    errors.push(format!("{label}: shutdown deadline exceeded"));
                }
            }
        }
        if let Some(path) = self.socket_path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => errors.push(format!("removing {}: {error}", path.display())),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServerError::Shutdown(errors.join("; ")))
        }
    }
}

/// Unlink a leftover socket file at `path`.  Missing paths are fine;
/// anything that exists but is not a socket is refused.
pub fn remove_stale_socket(path: &Path) -> Result<(), ServerError> {
    match std::fs::symlink_metadata(path) {
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(ServerError::SocketFile {
            path: path.display().to_string(),
            source: error,
        }),
        Ok(metadata) if metadata.file_type().is_socket() => {
            std::fs::remove_file(path).map_err(|error| ServerError::SocketFile {
                path: path.display().to_string(),
                source: error,
            })
        }
        Ok(_) => Err(ServerError::NotASocket {
            path: path.display().to_string(),
        }),
    }
}
