//! HTTP serving endpoint with range request support

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ServeError;
use crate::notify::Notifier;
use crate::registry::{FileDescriptor, FileRegistry};
use crate::state::ServerState;
use crate::token::{generate_shutdown_token, verify_shutdown_token};
use crate::utils::format_size;

/// How the endpoint confirms a freshly started listener
#[derive(Debug, Clone)]
pub struct ProbePolicy {
    /// Path requested on the bound address
    pub path: String,
    pub attempts: u32,
    /// Fixed delay between attempts
    pub backoff: Duration,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            attempts: 10,
            backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(1),
        }
    }
}

/// Settings for [`ServingEndpoint`]
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Interface to bind, usually `0.0.0.0`
    pub host: String,
    /// LAN address shown on the index page
    pub local_ip: IpAddr,
    pub probe: ProbePolicy,
    /// How long `stop` waits for in-flight downloads
    pub shutdown_grace: Duration,
    /// Secret mixed into the shutdown token
    pub secret: String,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            probe: ProbePolicy::default(),
            shutdown_grace: Duration::from_secs(5),
            secret: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// State shared by the request handlers of one run
#[derive(Clone)]
struct AppState {
    registry: FileRegistry,
    local_ip: IpAddr,
    port: u16,
    started_at: DateTime<Utc>,
    secret: Arc<str>,
    shutdown: Arc<watch::Sender<bool>>,
    /// Flips to `true` when in-flight bodies must be cut off
    abort: watch::Receiver<bool>,
}

/// A live listener
struct Run {
    addr: SocketAddr,
    token: String,
    shutdown: Arc<watch::Sender<bool>>,
    abort: watch::Sender<bool>,
    task: JoinHandle<std::io::Result<()>>,
}

impl Drop for Run {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.abort.send_replace(true);
    }
}

/// How long an aborted server gets to close its connections
const ABORT_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns the HTTP listener lifecycle and serves the registry
pub struct ServingEndpoint {
    registry: FileRegistry,
    notifier: Notifier,
    options: EndpointOptions,
    state: watch::Sender<ServerState>,
    run: Option<Run>,
    client: reqwest::Client,
}

impl ServingEndpoint {
    /// Create a stopped endpoint
    ///
    /// # Arguments
    /// * `registry` - Files to serve; read per request
    /// * `notifier` - Sink for state changes
    /// * `options` - Bind, probe and shutdown settings
    pub fn new(registry: FileRegistry, notifier: Notifier, options: EndpointOptions) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_default();
        Self {
            registry,
            notifier,
            options,
            state,
            run: None,
            client,
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Address the listener is bound to, while one exists
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.run.as_ref().map(|run| run.addr)
    }

    /// URL other machines on the LAN can use
    pub fn lan_url(&self) -> Option<String> {
        self.local_addr()
            .map(|addr| format!("http://{}:{}", self.options.local_ip, addr.port()))
    }

    /// Move Failed back to Stopped
    pub async fn acknowledge_failure(&mut self) {
        if self.state() == ServerState::Failed {
            self.transition(ServerState::Stopped, Some("Failure acknowledged".to_string()))
                .await;
        }
    }

    /// Bind, launch and health-probe the listener
    ///
    /// Returns once the listener answers its health probe. Port `0` binds an
    /// ephemeral port, see [`Self::local_addr`].
    pub async fn start(&mut self, port: u16) -> Result<(), ServeError> {
        match self.state() {
            ServerState::Running | ServerState::Starting => {
                tracing::warn!("Server already {}, ignoring start", self.state());
                return Ok(());
            }
            ServerState::Failed => self.acknowledge_failure().await,
            ServerState::Stopped => {}
        }

        let addr = format!("{}:{}", self.options.host, port);
        self.transition(ServerState::Starting, Some(addr.clone())).await;

        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let err = ServeError::Bind { addr, source };
                tracing::error!("{}", err);
                self.transition(ServerState::Failed, Some(err.to_string())).await;
                return Err(err);
            }
        };
        let bound = match listener.local_addr() {
            Ok(bound) => bound,
            Err(source) => {
                let err = ServeError::Bind { addr, source };
                self.transition(ServerState::Failed, Some(err.to_string())).await;
                return Err(err);
            }
        };

        let started_at = Utc::now();
        let token = generate_shutdown_token(bound.port(), started_at, &self.options.secret);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let (abort, abort_rx) = watch::channel(false);

        let app = router(AppState {
            registry: self.registry.clone(),
            local_ip: self.options.local_ip,
            port: bound.port(),
            started_at,
            secret: Arc::from(self.options.secret.as_str()),
            shutdown: shutdown.clone(),
            abort: abort_rx,
        });

        tracing::info!("File server listening on {}", bound);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        });

        let run = Run {
            addr: bound,
            token,
            shutdown,
            abort,
            task,
        };
        let probe_addr = reachable(bound);

        if !self.probe(probe_addr).await {
            let err = ServeError::StartupTimeout {
                addr: bound,
                attempts: self.options.probe.attempts,
            };
            tracing::error!("{}", err);
            run.task.abort();
            drop(run);
            self.transition(ServerState::Failed, Some(err.to_string())).await;
            return Err(err);
        }

        self.run = Some(run);
        let url = self.lan_url();
        self.transition(ServerState::Running, url).await;
        Ok(())
    }

    /// Shut the listener down cooperatively
    ///
    /// In-flight downloads get the configured grace period to finish.
    /// Idempotent: does nothing unless Running.
    pub async fn stop(&mut self) {
        if self.state() != ServerState::Running {
            return;
        }

        if let Some(mut run) = self.run.take() {
            let url = format!("http://{}/shutdown/{}", reachable(run.addr), run.token);
            match self
                .client
                .post(&url)
                .timeout(self.options.probe.timeout)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("Shutdown endpoint accepted the request");
                }
                Ok(response) => {
                    tracing::warn!("Shutdown endpoint answered {}, signalling directly", response.status());
                    run.shutdown.send_replace(true);
                }
                Err(e) => {
                    tracing::warn!("Shutdown endpoint unreachable ({}), signalling directly", e);
                    run.shutdown.send_replace(true);
                }
            }

            match tokio::time::timeout(self.options.shutdown_grace, &mut run.task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::warn!("File server exited with error: {}", e),
                Ok(Err(e)) => tracing::warn!("File server task failed: {}", e),
                Err(_) => {
                    tracing::warn!(
                        "In-flight requests still running after {:?}, aborting them",
                        self.options.shutdown_grace
                    );
                    run.abort.send_replace(true);
                    if tokio::time::timeout(ABORT_TIMEOUT, &mut run.task).await.is_err() {
                        run.task.abort();
                    }
                }
            }
            tracing::info!("File server on {} stopped", run.addr);
        }

        self.transition(ServerState::Stopped, None).await;
    }

    async fn probe(&self, addr: SocketAddr) -> bool {
        let policy = &self.options.probe;
        let url = format!("http://{}{}", addr, policy.path);

        for attempt in 1..=policy.attempts {
            match self.client.get(&url).timeout(policy.timeout).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("Health probe succeeded on attempt {}", attempt);
                    return true;
                }
                Ok(response) => {
                    tracing::debug!("Health probe {} answered {}", attempt, response.status())
                }
                Err(e) => tracing::debug!("Health probe {} failed: {}", attempt, e),
            }
            if attempt < policy.attempts {
                tokio::time::sleep(policy.backoff).await;
            }
        }
        false
    }

    async fn transition(&self, next: ServerState, detail: Option<String>) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            tracing::warn!("Unexpected server transition {} -> {}", previous, next);
        }
        tracing::info!("Server {} -> {}", previous, next);
        self.notifier.server_state(next, detail).await;
    }
}

/// Loopback stands in for the unspecified address when connecting
fn reachable(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        let ip = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(ip, addr.port())
    } else {
        addr
    }
}

/// Create the axum router with all routes configured
fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/download/:index", get(download))
        .route("/api/files", get(list_files))
        .route("/shutdown/:token", post(shutdown))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        format!("File server running. Shared files: {}", state.registry.len()),
    )
}

/// Human-readable listing
async fn index(State(state): State<AppState>) -> Html<String> {
    let files = state.registry.snapshot();
    let mut page = String::from(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Shared files</title></head>\n<body>\n<h1>Shared files</h1>\n",
    );
    let _ = writeln!(
        page,
        "<p>Served from <code>http://{}:{}</code></p>",
        state.local_ip, state.port
    );

    if files.is_empty() {
        page.push_str("<p>No files are shared right now.</p>\n");
    } else {
        page.push_str("<table>\n<tr><th>Name</th><th>Size</th><th></th></tr>\n");
        for (index, file) in files.iter().enumerate() {
            let _ = writeln!(
                page,
                "<tr><td>{}</td><td>{}</td><td><a href=\"/download/{}\">Download</a></td></tr>",
                escape_html(file.name()),
                format_size(file.size_bytes()),
                index
            );
        }
        page.push_str("</table>\n");
    }
    page.push_str("</body>\n</html>\n");

    Html(page)
}

/// Machine-readable listing
async fn list_files(State(state): State<AppState>) -> Json<Vec<FileDescriptor>> {
    Json(state.registry.snapshot().to_vec())
}

/// Cooperative shutdown trigger, only valid with this run's token
async fn shutdown(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<&'static str, AppError> {
    if !verify_shutdown_token(&token, state.port, state.started_at, &state.secret) {
        tracing::warn!("Rejected shutdown request with invalid token");
        return Err(AppError::Forbidden("Invalid shutdown token".to_string()));
    }

    tracing::info!("Shutdown requested");
    state.shutdown.send_replace(true);
    Ok("Shutting down")
}

/// Download handler with range request support
///
/// The index is resolved against the registry as it is now, not as it was
/// when the client fetched the listing.
async fn download(
    State(state): State<AppState>,
    Path(index): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let not_found = || AppError::NotFound("File not found".to_string());

    let index: usize = index.parse().map_err(|_| not_found())?;
    let files = state.registry.snapshot();
    let descriptor = files.get(index).ok_or_else(not_found)?;

    let file = match File::open(descriptor.path()).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Shared file vanished: {}", descriptor.path());
            return Err(not_found());
        }
        Err(e) => return Err(AppError::Internal(format!("Failed to open file: {}", e))),
    };

    let metadata = file
        .metadata()
        .await
        .map_err(|e| AppError::Internal(format!("Failed to get file metadata: {}", e)))?;
    if !metadata.is_file() {
        return Err(not_found());
    }
    let file_size = metadata.len();

    let mime_type = mime_guess::from_path(descriptor.path())
        .first_or_octet_stream()
        .to_string();
    let disposition = content_disposition(descriptor.name());

    tracing::info!("Serving {} ({})", descriptor.name(), format_size(file_size));

    if let Some(range_header) = headers.get(header::RANGE) {
        return handle_range_request(
            file,
            file_size,
            range_header,
            &mime_type,
            disposition,
            state.abort.clone(),
        )
        .await;
    }

    let body = Body::from_stream(until_aborted(ReaderStream::new(file), state.abort.clone()));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime_type)
        .header(header::CONTENT_LENGTH, file_size)
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::ACCEPT_RANGES, "bytes")
        .body(body)
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}

/// Handle HTTP range requests for resumable downloads
async fn handle_range_request(
    mut file: File,
    file_size: u64,
    range_header: &HeaderValue,
    mime_type: &str,
    disposition: HeaderValue,
    abort: watch::Receiver<bool>,
) -> Result<Response, AppError> {
    let range_str = range_header
        .to_str()
        .map_err(|_| AppError::BadRequest("Invalid range header".to_string()))?;
    let (start, end) = parse_range(range_str, file_size)?;
    let content_length = end - start + 1;

    file.seek(std::io::SeekFrom::Start(start))
        .await
        .map_err(|e| AppError::Internal(format!("Failed to seek file: {}", e)))?;

    let body = Body::from_stream(until_aborted(ReaderStream::new(file.take(content_length)), abort));

    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, mime_type)
        .header(header::CONTENT_LENGTH, content_length)
        .header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, file_size),
        )
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::ACCEPT_RANGES, "bytes")
        .body(body)
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}

/// End a body stream early once the server aborts
fn until_aborted<S>(stream: S, mut abort: watch::Receiver<bool>) -> impl Stream<Item = S::Item>
where
    S: Stream,
{
    stream.take_until(async move {
        if abort.wait_for(|abort| *abort).await.is_err() {
            std::future::pending::<()>().await;
        }
    })
}

/// Parse a single `bytes=` range into inclusive bounds
fn parse_range(range_str: &str, file_size: u64) -> Result<(u64, u64), AppError> {
    let range_str = range_str
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| AppError::BadRequest("Invalid range format".to_string()))?;

    let (start, end) = range_str
        .split_once('-')
        .ok_or_else(|| AppError::BadRequest("Invalid range format".to_string()))?;

    if file_size == 0 {
        return Err(AppError::RangeNotSatisfiable(file_size));
    }
    let last = file_size - 1;

    // Suffix form: the final N bytes
    if start.is_empty() {
        let suffix: u64 = end
            .parse()
            .map_err(|_| AppError::BadRequest("Invalid range end".to_string()))?;
        if suffix == 0 {
            return Err(AppError::RangeNotSatisfiable(file_size));
        }
        return Ok((file_size.saturating_sub(suffix), last));
    }

    let start: u64 = start
        .parse()
        .map_err(|_| AppError::BadRequest("Invalid range start".to_string()))?;
    let end: u64 = if end.is_empty() {
        last
    } else {
        end.parse::<u64>()
            .map_err(|_| AppError::BadRequest("Invalid range end".to_string()))?
            .min(last)
    };

    if start > end || start >= file_size {
        return Err(AppError::RangeNotSatisfiable(file_size));
    }
    Ok((start, end))
}

/// `attachment` disposition with an ASCII fallback and the UTF-8 name
fn content_disposition(name: &str) -> HeaderValue {
    let fallback: String = name
        .chars()
        .map(|c| if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' { c } else { '_' })
        .collect();
    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(name)
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Application error types
#[derive(Debug)]
enum AppError {
    NotFound(String),
    Forbidden(String),
    BadRequest(String),
    Internal(String),
    RangeNotSatisfiable(u64),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Internal(msg) => {
                tracing::error!("{}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
            AppError::RangeNotSatisfiable(size) => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", size))],
                format!("Range not satisfiable. File size: {}", size),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{self, Notification};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(registry: FileRegistry) -> (AppState, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        let state = AppState {
            registry,
            local_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            port: 5000,
            started_at: Utc::now(),
            secret: Arc::from("secret"),
            shutdown: Arc::new(tx),
            abort: watch::channel(false).1,
        };
        (state, rx)
    }

    async fn send_get(app: Router, uri: &str, range: Option<&str>) -> Response {
        let mut request = Request::builder().uri(uri);
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }
        app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    fn shared_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> FileDescriptor {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        FileDescriptor::from_path(path).unwrap()
    }

    #[tokio::test]
    async fn test_download_streams_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new();
        registry.add(shared_file(&dir, "notes.txt", b"hello world"));
        let (state, _rx) = test_state(registry);

        let response = send_get(router(state), "/download/0", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        assert!(response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("attachment; filename=\"notes.txt\""));
        assert_eq!(body_bytes(response).await, b"hello world");
    }

    #[tokio::test]
    async fn test_download_out_of_range_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new();
        registry.add(shared_file(&dir, "a.bin", b"a"));
        registry.add(shared_file(&dir, "b.bin", b"b"));
        let (state, _rx) = test_state(registry);
        let app = router(state);

        for uri in ["/download/2", "/download/3", "/download/18446744073709551615", "/download/-1", "/download/abc"] {
            let response = send_get(app.clone(), uri, None).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
            assert_eq!(body_bytes(response).await, b"File not found");
        }
    }

    #[tokio::test]
    async fn test_download_of_deleted_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = shared_file(&dir, "gone.txt", b"soon gone");
        std::fs::remove_file(descriptor.path()).unwrap();
        let registry = FileRegistry::new();
        registry.add(descriptor);
        let (state, _rx) = test_state(registry);

        let response = send_get(router(state), "/download/0", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_uses_current_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new();
        registry.add(shared_file(&dir, "first.txt", b"first"));
        let (state, _rx) = test_state(registry.clone());
        let app = router(state);

        registry.replace_all(vec![shared_file(&dir, "second.txt", b"second")]);

        let response = send_get(app, "/download/0", None).await;
        assert_eq!(body_bytes(response).await, b"second");
    }

    #[tokio::test]
    async fn test_range_request() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new();
        registry.add(shared_file(&dir, "movie.mp4", b"0123456789"));
        let (state, _rx) = test_state(registry);
        let app = router(state);

        let response = send_get(app.clone(), "/download/0", Some("bytes=2-5")).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(body_bytes(response).await, b"2345");

        let response = send_get(app.clone(), "/download/0", Some("bytes=7-")).await;
        assert_eq!(body_bytes(response).await, b"789");

        let response = send_get(app.clone(), "/download/0", Some("bytes=-3")).await;
        assert_eq!(body_bytes(response).await, b"789");

        let response = send_get(app.clone(), "/download/0", Some("bytes=20-30")).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");

        let response = send_get(app, "/download/0", Some("items=1-2")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_range_empty_file() {
        assert!(matches!(
            parse_range("bytes=0-", 0),
            Err(AppError::RangeNotSatisfiable(0))
        ));
    }

    #[tokio::test]
    async fn test_api_files_lists_in_order() {
        let registry = FileRegistry::new();
        registry.add(FileDescriptor::new("b.txt", 2, "/srv/b.txt"));
        registry.add(FileDescriptor::new("a.txt", 1, "/srv/a.txt"));
        let (state, _rx) = test_state(registry);

        let response = send_get(router(state), "/api/files", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let files: Vec<serde_json::Value> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(
            files,
            vec![
                serde_json::json!({"name": "b.txt", "size": 2, "path": "/srv/b.txt"}),
                serde_json::json!({"name": "a.txt", "size": 1, "path": "/srv/a.txt"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_index_lists_files_escaped() {
        let registry = FileRegistry::new();
        registry.add(FileDescriptor::new("<script>.txt", 2048, "/srv/x"));
        let (state, _rx) = test_state(registry);

        let response = send_get(router(state), "/", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let page = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(page.contains("&lt;script&gt;.txt"));
        assert!(page.contains("2.00 KB"));
        assert!(page.contains("href=\"/download/0\""));
        assert!(page.contains("http://192.168.1.20:5000"));
    }

    #[tokio::test]
    async fn test_index_empty() {
        let (state, _rx) = test_state(FileRegistry::new());
        let page = String::from_utf8(body_bytes(send_get(router(state), "/", None).await).await).unwrap();
        assert!(page.contains("No files are shared"));
    }

    #[tokio::test]
    async fn test_shutdown_requires_token() {
        let (state, rx) = test_state(FileRegistry::new());
        let token = generate_shutdown_token(state.port, state.started_at, &state.secret);
        let app = router(state);

        let bad = Request::builder()
            .method("POST")
            .uri("/shutdown/nope")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(bad).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!*rx.borrow());

        let good = Request::builder()
            .method("POST")
            .uri(format!("/shutdown/{}", token))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(good).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(*rx.borrow());
    }

    #[test]
    fn test_content_disposition_non_ascii() {
        let value = content_disposition("报告 \"final\".pdf");
        let value = value.to_str().unwrap();
        assert!(value.starts_with("attachment; filename=\"__ _final_.pdf\""));
        assert!(value.contains("filename*=UTF-8''%E6%8A%A5%E5%91%8A%20%22final%22.pdf"));
    }

    fn endpoint_options() -> EndpointOptions {
        EndpointOptions {
            host: "127.0.0.1".to_string(),
            probe: ProbePolicy {
                backoff: Duration::from_millis(50),
                ..ProbePolicy::default()
            },
            ..EndpointOptions::default()
        }
    }

    #[tokio::test]
    async fn test_endpoint_lifecycle() {
        let (notifier, mut queue) = notify::channel(64);
        let registry = FileRegistry::new();
        registry.add(FileDescriptor::new("x", 1, "/x"));
        let mut endpoint = ServingEndpoint::new(registry, notifier, endpoint_options());

        endpoint.start(0).await.unwrap();
        assert_eq!(endpoint.state(), ServerState::Running);
        let addr = endpoint.local_addr().unwrap();

        let files: Vec<FileDescriptor> = reqwest::get(format!("http://{}/api/files", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(files.len(), 1);

        endpoint.stop().await;
        assert_eq!(endpoint.state(), ServerState::Stopped);
        assert!(endpoint.local_addr().is_none());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());

        let states: Vec<ServerState> = std::iter::from_fn(|| queue.try_next())
            .filter_map(|n| match n {
                Notification::ServerStateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![ServerState::Starting, ServerState::Running, ServerState::Stopped]
        );

        // Stopping again is silent
        endpoint.stop().await;
        assert!(queue.try_next().is_none());
    }

    #[tokio::test]
    async fn test_endpoint_bind_error() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let (notifier, _queue) = notify::channel(64);
        let mut endpoint = ServingEndpoint::new(FileRegistry::new(), notifier, endpoint_options());

        let result = endpoint.start(port).await;
        assert!(matches!(result, Err(ServeError::Bind { .. })));
        assert_eq!(endpoint.state(), ServerState::Failed);

        endpoint.acknowledge_failure().await;
        assert_eq!(endpoint.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_endpoint_startup_timeout() {
        let (notifier, _queue) = notify::channel(64);
        let mut options = endpoint_options();
        options.probe = ProbePolicy {
            path: "/not-a-route".to_string(),
            attempts: 3,
            backoff: Duration::from_millis(10),
            timeout: Duration::from_millis(200),
        };
        let mut endpoint = ServingEndpoint::new(FileRegistry::new(), notifier, options);

        let result = endpoint.start(0).await;
        assert!(matches!(
            result,
            Err(ServeError::StartupTimeout { attempts: 3, .. })
        ));
        assert_eq!(endpoint.state(), ServerState::Failed);
        assert!(endpoint.local_addr().is_none());

        // A later start acknowledges the failure first
        endpoint.options.probe = endpoint_options().probe;
        endpoint.start(0).await.unwrap();
        assert_eq!(endpoint.state(), ServerState::Running);
        endpoint.stop().await;
    }

    fn large_file(size: usize) -> (tempfile::TempDir, FileRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.bin");
        std::fs::write(&path, vec![7u8; size]).unwrap();
        let registry = FileRegistry::new();
        registry.add(FileDescriptor::from_path(&path).unwrap());
        (dir, registry)
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_download_finish() {
        const SIZE: usize = 16 * 1024 * 1024;
        let (_dir, registry) = large_file(SIZE);
        let (notifier, _queue) = notify::channel(64);
        let mut endpoint = ServingEndpoint::new(registry, notifier, endpoint_options());
        endpoint.start(0).await.unwrap();
        let addr = endpoint.local_addr().unwrap();

        let response = reqwest::get(format!("http://{}/download/0", addr)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let ((), body) = tokio::join!(endpoint.stop(), response.bytes());
        assert_eq!(body.unwrap().len(), SIZE);
        assert_eq!(endpoint.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_aborts_download_after_grace() {
        const SIZE: usize = 32 * 1024 * 1024;
        let (_dir, registry) = large_file(SIZE);
        let (notifier, _queue) = notify::channel(64);
        let mut options = endpoint_options();
        options.shutdown_grace = Duration::from_millis(200);
        let mut endpoint = ServingEndpoint::new(registry, notifier, options);
        endpoint.start(0).await.unwrap();
        let addr = endpoint.local_addr().unwrap();

        // The body is not read, so the transfer stalls on back-pressure
        let response = reqwest::get(format!("http://{}/download/0", addr)).await.unwrap();

        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(5), endpoint.stop())
            .await
            .expect("stop must give up after the grace period");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(endpoint.state(), ServerState::Stopped);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());

        let body = tokio::time::timeout(Duration::from_secs(5), response.bytes())
            .await
            .expect("aborted body must end");
        assert!(!matches!(body, Ok(ref bytes) if bytes.len() == SIZE));
    }
}
