//! Development HTTP server with live reload.
//!
//! Serves the output directory, injects a small client into HTML pages and
//! pushes reload notifications to connected browsers over Server-Sent Events.

use async_stream::stream;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::{klog, klog_debug, klog_error};

/// Endpoint browsers subscribe to for reload notifications.
pub const RELOAD_PATH: &str = "/__kiln/reload";

const RELOAD_SCRIPT: &str = r#"<script>
(function () {
  var source = new EventSource("/__kiln/reload");
  source.addEventListener("reload", function () { window.location.reload(); });
})();
</script>
"#;

/// Cloneable handle that tells connected browsers to reload.
#[derive(Debug, Clone)]
pub struct Reloader {
    tx: broadcast::Sender<u64>,
}

impl Reloader {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Notify every connected client; returns how many were listening.
    pub fn notify_clients(&self) -> usize {
        let generation = chrono::Utc::now().timestamp_millis() as u64;
        self.tx.send(generation).unwrap_or(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.tx.subscribe()
    }
}

#[derive(Clone)]
struct ServerState {
    root: Arc<PathBuf>,
    reloader: Reloader,
    cancel: CancellationToken,
}

/// A running development server.
pub struct DevServer {
    addr: SocketAddr,
    reloader: Reloader,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl DevServer {
    /// Bind `host:port` and start serving `root`. Port 0 picks a free port.
    ///
    /// The server stops when `cancel` fires or [`DevServer::shutdown`] is called.
    pub async fn start(root: &Path, host: &str, port: u16, cancel: CancellationToken) -> Result<Self> {
        let bind = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| Error::Server(format!("cannot bind {}: {}", bind, e)))?;
        let addr = listener.local_addr()?;

        let reloader = Reloader::new();
        let app = router(root.to_path_buf(), reloader.clone(), cancel.clone());
        let shutdown = cancel.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .map_err(|e| Error::Server(e.to_string()))
        });

        klog!("Dev server listening on http://{} serving {}", addr, root.display());
        Ok(Self {
            addr,
            reloader,
            cancel,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn reloader(&self) -> Reloader {
        self.reloader.clone()
    }

    pub fn notify_clients(&self) -> usize {
        self.reloader.notify_clients()
    }

    /// Stop accepting connections and wait for the server task to end.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::TaskJoin(e.to_string())),
        }
    }
}

fn router(root: PathBuf, reloader: Reloader, cancel: CancellationToken) -> Router {
    let state = ServerState {
        root: Arc::new(root),
        reloader,
        cancel,
    };
    Router::new()
        .route(RELOAD_PATH, get(reload_events))
        .fallback(serve_file)
        .with_state(state)
}

async fn reload_events(
    State(state): State<ServerState>,
) -> Sse<impl futures::Stream<Item = std::result::Result<SseEvent, std::convert::Infallible>>> {
    let mut rx = state.reloader.subscribe();
    let cancel = state.cancel.clone();
    klog_debug!("Live reload client connected");

    let event_stream = stream! {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                msg = rx.recv() => Some(msg),
            };
            match next {
                Some(Ok(generation)) => {
                    yield Ok(SseEvent::default().event("reload").data(generation.to_string()));
                }
                Some(Err(broadcast::error::RecvError::Lagged(_))) => {
                    yield Ok(SseEvent::default().event("reload").data("lagged"));
                }
                Some(Err(broadcast::error::RecvError::Closed)) | None => break,
            }
        }
    };

    Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

async fn serve_file(State(state): State<ServerState>, uri: Uri) -> Response {
    let Some(relative) = request_path(uri.path()) else {
        return (StatusCode::BAD_REQUEST, "Bad request path").into_response();
    };
    let mut path = state.root.join(&relative);

    if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
        if !uri.path().ends_with('/') {
            return Redirect::permanent(&format!("{}/", uri.path())).into_response();
        }
        path.push("index.html");
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = content_type(&path);
            let body = if mime.starts_with("text/html") {
                inject_reload_script(&String::from_utf8_lossy(&bytes)).into_bytes()
            } else {
                bytes
            };
            (
                [(header::CONTENT_TYPE, mime), (header::CACHE_CONTROL, "no-cache")],
                body,
            )
                .into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            klog_debug!("404 {}", uri.path());
            (StatusCode::NOT_FOUND, "Not found").into_response()
        }
        Err(e) => {
            klog_error!("Cannot read {}: {}", path.display(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Cannot read file").into_response()
        }
    }
}

/// Map a URL path to a path below the served root.
///
/// Returns `None` for paths that would escape the root.
fn request_path(url_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode(url_path)?;
    let mut relative = PathBuf::new();
    for component in Path::new(decoded.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(relative)
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Insert the live-reload client before the last `</body>`, or append it.
fn inject_reload_script(html: &str) -> String {
    match html.to_ascii_lowercase().rfind("</body>") {
        Some(pos) => {
            let mut out = String::with_capacity(html.len() + RELOAD_SCRIPT.len());
            out.push_str(&html[..pos]);
            out.push_str(RELOAD_SCRIPT);
            out.push_str(&html[pos..]);
            out
        }
        None => format!("{}{}", html, RELOAD_SCRIPT),
    }
}
