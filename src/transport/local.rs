//! Local HTTP transport.
//!
//! A long-lived axum server exposes the artifact directory verbatim, so a
//! publish only has to compute the URL. The server is started lazily on the
//! first prepare/publish and runs on its own task so the device can fetch
//! while the main flow awaits playback confirmation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Backend, PublishResult, Transport};
use crate::artifact::Artifact;
use crate::config::LocalServeConfig;
use crate::error::{PublishError, SetupError};

pub struct LocalServe {
    config: LocalServeConfig,
    serve_dir: PathBuf,
    host_ip: IpAddr,
    server: Option<RunningServer>,
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl LocalServe {
    pub fn new(config: LocalServeConfig, serve_dir: PathBuf) -> Self {
        let host_ip = resolve_local_ip(&config.route_addr);
        info!("Local IP: {host_ip}");
        Self {
            config,
            serve_dir,
            host_ip,
            server: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }

    /// Address the server is bound to, once started.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.addr)
    }

    async fn ensure_started(&mut self) -> std::io::Result<SocketAddr> {
        if let Some(server) = &self.server {
            return Ok(server.addr);
        }

        let bind = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        let addr = listener.local_addr()?;

        let app = router(self.serve_dir.clone());
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!("Artifact server error: {e}");
            }
        });

        info!("HTTP server started on http://{addr} serving {}", self.serve_dir.display());
        self.server = Some(RunningServer {
            addr,
            shutdown,
            task: Some(task),
        });
        Ok(addr)
    }

    fn url_for(&self, port: u16, artifact: &Artifact) -> Result<String, PublishError> {
        let relative = artifact
            .local_path
            .strip_prefix(&self.serve_dir)
            .map_err(|_| {
                PublishError::Unavailable(format!(
                    "{} is outside the served directory {}",
                    artifact.local_path.display(),
                    self.serve_dir.display()
                ))
            })?;

        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!("http://{}:{port}/{path}", self.host_ip))
    }
}

#[async_trait]
impl Transport for LocalServe {
    fn backend(&self) -> Backend {
        Backend::LocalServe
    }

    async fn prepare(&mut self) -> Result<(), SetupError> {
        self.ensure_started()
            .await
            .map(|_| ())
            .map_err(|e| SetupError::Transport(format!("cannot start HTTP server: {e}")))
    }

    async fn publish(&mut self, artifact: &Artifact) -> Result<PublishResult, PublishError> {
        let addr = self
            .ensure_started()
            .await
            .map_err(|e| PublishError::step("serve", e.to_string()))?;
        let url = self.url_for(addr.port(), artifact)?;
        debug!("Audio URL: {url}");
        Ok(PublishResult::url(url, Backend::LocalServe))
    }

    async fn shutdown(&mut self) {
        let Some(mut server) = self.server.take() else {
            return;
        };
        server.shutdown.cancel();
        if let Some(task) = server.task.take() {
            if let Err(e) = task.await {
                warn!("Artifact server task ended abnormally: {e}");
            }
        }
        info!("HTTP server stopped");
    }
}

/// Find the local interface address that routes outward.
///
/// Connecting a UDP socket sends nothing; it only selects a route, so the
/// destination does not have to be reachable.
pub fn resolve_local_ip(route_addr: &str) -> IpAddr {
    let lookup = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(route_addr)?;
        Ok(socket.local_addr()?.ip())
    };
    match lookup() {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Failed to resolve local IP via {route_addr}: {e}, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn router(root: PathBuf) -> Router {
    Router::new()
        .route("/{*path}", get(serve_file))
        .with_state(Arc::new(root))
}

async fn serve_file(State(root): State<Arc<PathBuf>>, UrlPath(path): UrlPath<String>) -> Response {
    let Some(file) = resolve_under(&root, &path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(&file).await {
        Ok(bytes) => {
            debug!("Served {} ({} bytes)", file.display(), bytes.len());
            ([(header::CONTENT_TYPE, content_type(&file))], bytes).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Map a request path onto `root`, rejecting anything that could escape it.
fn resolve_under(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = Path::new(request_path.trim_start_matches('/'));
    if request_path.contains('\\') {
        return None;
    }
    let mut resolved = root.to_path_buf();
    let mut parts = 0;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                parts += 1;
            }
            _ => return None,
        }
    }
    (parts > 0).then_some(resolved)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    }
}
