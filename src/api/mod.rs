//! HTTP surface: live stream, snapshot, detection toggles and access log.
//!
//! A minimal HTTP/1.1 server on `TcpListener`. The accept loop polls a
//! non-blocking listener so `ApiHandle::stop` can end it; each connection is
//! served on its own thread so long-lived stream viewers never hold up other
//! requests.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::event_log::AccessLogStore;
use crate::frame::SharedFrameState;
use crate::pipeline::PipelineStats;
use crate::stream::{write_multipart_chunk, FrameStream, StreamConfig, ViewerCount, CONTENT_TYPE};
use crate::toggle::{ToggleState, ToggleUpdate};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub stream: StreamConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
            stream: StreamConfig::default(),
        }
    }
}

/// Shared state the handlers read and mutate.
#[derive(Clone)]
pub struct ApiContext {
    pub frames: Arc<SharedFrameState>,
    pub toggles: Arc<ToggleState>,
    pub access_log: Arc<AccessLogStore>,
    pub stats: Arc<PipelineStats>,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    viewers: Arc<ViewerCount>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Currently connected `/video_feed` viewers.
    pub fn viewers(&self) -> usize {
        self.viewers.get()
    }

    /// Stop accepting connections. Open streams end at their next frame.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    ctx: ApiContext,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, ctx: ApiContext) -> Self {
        Self { cfg, ctx }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let viewers = Arc::new(ViewerCount::new());
        let server = Arc::new(Server {
            ctx: self.ctx,
            stream: self.cfg.stream,
            viewers: viewers.clone(),
            shutdown: shutdown.clone(),
        });
        let join = std::thread::Builder::new()
            .name("api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, server) {
                    log::error!("api server stopped: {}", err);
                }
            })?;
        log::info!("api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            viewers,
            shutdown,
            join: Some(join),
        })
    }
}

struct Server {
    ctx: ApiContext,
    stream: StreamConfig,
    viewers: Arc<ViewerCount>,
    shutdown: Arc<AtomicBool>,
}

fn run_api(listener: TcpListener, server: Arc<Server>) -> Result<()> {
    loop {
        if server.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let server = server.clone();
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &server) {
                            log::warn!("api request from {} failed: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("api: cannot spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Route {
    Health,
    VideoFeed,
    Snapshot,
    DetectionStatus,
    DetectionToggle,
    ListAccessLogs,
    ClearAccessLogs,
    AccessLogImage(String),
    DeleteAccessLog(String),
    MethodNotAllowed,
    NotFound,
}

fn route(method: &str, path: &str) -> Route {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        ("GET", ["health"]) => Route::Health,
        ("GET", ["video_feed"]) => Route::VideoFeed,
        ("GET", ["snapshot"]) => Route::Snapshot,
        ("GET", ["detection", "status"]) => Route::DetectionStatus,
        ("POST", ["detection", "toggle"]) => Route::DetectionToggle,
        ("GET", ["access-logs"]) => Route::ListAccessLogs,
        ("DELETE", ["access-logs"]) => Route::ClearAccessLogs,
        ("GET", ["access-logs", id, "image"]) => Route::AccessLogImage(id.to_string()),
        ("DELETE", ["access-logs", id]) => Route::DeleteAccessLog(id.to_string()),
        (
            _,
            ["health"]
            | ["video_feed"]
            | ["snapshot"]
            | ["detection", "status"]
            | ["detection", "toggle"]
            | ["access-logs"]
            | ["access-logs", _]
            | ["access-logs", _, "image"],
        ) => Route::MethodNotAllowed,
        _ => Route::NotFound,
    }
}

fn handle_connection(mut stream: TcpStream, server: &Server) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    let ctx = &server.ctx;

    match route(&request.method, &request.path) {
        Route::Health => {
            let source_healthy = ctx.stats.source_healthy();
            let frame_age_ms = ctx
                .frames
                .latest_raw()
                .map(|frame| frame.age().as_millis() as u64);
            let body = serde_json::json!({
                "status": if source_healthy { "ok" } else { "degraded" },
                "source_healthy": source_healthy,
                "frame_age_ms": frame_age_ms,
                "frames_captured": ctx.stats.frames_captured(),
                "viewers": server.viewers.get(),
                "timestamp": chrono::Local::now().to_rfc3339(),
            });
            write_json(&mut stream, 200, &body)
        }
        Route::VideoFeed => serve_video_feed(stream, server),
        Route::Snapshot => match ctx.frames.latest_encoded() {
            Some(frame) => write_response(&mut stream, 200, "image/jpeg", &frame.jpeg),
            None => write_error(&mut stream, 503, "no_frame"),
        },
        Route::DetectionStatus => write_json(&mut stream, 200, &ctx.toggles.get()),
        Route::DetectionToggle => {
            let update = ToggleUpdate::from_json_lenient(&request.body);
            if update.is_empty() {
                log::debug!("api: toggle request carried no boolean fields");
            }
            write_json(&mut stream, 200, &ctx.toggles.apply(update))
        }
        Route::ListAccessLogs => {
            let limit = request.limit();
            let entries = ctx.access_log.list(limit).unwrap_or_else(|err| {
                log::error!("api: access log unreadable: {:#}", err);
                Vec::new()
            });
            write_json(&mut stream, 200, &entries)
        }
        Route::AccessLogImage(id) => match ctx.access_log.image_path(&id) {
            Ok(Some(path)) => match std::fs::read(&path) {
                Ok(bytes) => write_response(&mut stream, 200, "image/jpeg", &bytes),
                Err(err) => {
                    log::warn!("api: snapshot {} unreadable: {}", path.display(), err);
                    write_error(&mut stream, 404, "not_found")
                }
            },
            Ok(None) => write_error(&mut stream, 404, "not_found"),
            Err(err) => {
                log::error!("api: snapshot lookup for {} failed: {:#}", id, err);
                write_error(&mut stream, 500, "internal_error")
            }
        },
        Route::DeleteAccessLog(id) => match ctx.access_log.delete(&id) {
            Ok(true) => {
                log::info!("access log entry {} deleted", id);
                write_json(&mut stream, 200, &serde_json::json!({ "deleted": id }))
            }
            Ok(false) => write_error(&mut stream, 404, "not_found"),
            Err(err) => {
                log::error!("api: delete of {} failed: {:#}", id, err);
                write_error(&mut stream, 500, "internal_error")
            }
        },
        Route::ClearAccessLogs => match ctx.access_log.clear() {
            Ok(cleared) => {
                log::info!("access log cleared ({} entries)", cleared);
                write_json(&mut stream, 200, &serde_json::json!({ "cleared": cleared }))
            }
            Err(err) => {
                log::error!("api: clear failed: {:#}", err);
                write_error(&mut stream, 500, "internal_error")
            }
        },
        Route::MethodNotAllowed => write_error(&mut stream, 405, "method_not_allowed"),
        Route::NotFound => write_error(&mut stream, 404, "not_found"),
    }
}

/// Stream until the client goes away or the server stops.
fn serve_video_feed(mut stream: TcpStream, server: &Server) -> Result<()> {
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        CONTENT_TYPE
    );
    let _viewer = server.viewers.enter();
    stream.write_all(header.as_bytes())?;

    let peer = stream.peer_addr().ok();
    log::debug!("stream viewer connected: {:?}", peer);
    let hangup = stream.try_clone()?;
    let frames = FrameStream::new(
        server.ctx.frames.clone(),
        server.shutdown.clone(),
        server.stream.clone(),
    )
    .until_closed(move || peer_closed(&hangup));
    for frame in frames {
        if let Err(err) = write_multipart_chunk(&mut stream, &frame.jpeg) {
            log::debug!("stream viewer {:?} disconnected: {}", peer, err);
            return Ok(());
        }
    }
    log::debug!("stream viewer {:?} ended", peer);
    Ok(())
}

/// True once the peer has shut down its side of the connection. The socket is
/// returned to blocking mode before the caller writes again.
fn peer_closed(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut byte = [0u8; 1];
    let closed = match stream.peek(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => err.kind() != std::io::ErrorKind::WouldBlock,
    };
    stream.set_nonblocking(false).is_err() || closed
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
    };
    if header_end > MAX_HEADER_BYTES {
        return Err(anyhow!("request headers too large"));
    }

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw_path, None),
    };
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        query: query.map(str::to_string),
        body,
    })
}

fn write_json<T: Serialize + ?Sized>(stream: &mut TcpStream, status: u16, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_error(stream: &mut TcpStream, status: u16, code: &str) -> Result<()> {
    write_json(stream, status, &serde_json::json!({ "error": code }))
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: Option<String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .as_deref()?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    /// `?limit=N`, defaulting when absent or unparsable and capped.
    fn limit(&self) -> usize {
        self.query_param("limit")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_LOG_LIMIT)
            .min(MAX_LOG_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw_path: &str) -> HttpRequest {
        let (path, query) = match raw_path.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (raw_path, None),
        };
        HttpRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            query,
            body: Vec::new(),
        }
    }

    #[test]
    fn routes_known_paths() {
        assert_eq!(route("GET", "/video_feed"), Route::VideoFeed);
        assert_eq!(route("POST", "/detection/toggle"), Route::DetectionToggle);
        assert_eq!(
            route("GET", "/access-logs/abc/image"),
            Route::AccessLogImage("abc".to_string())
        );
        assert_eq!(
            route("DELETE", "/access-logs/abc"),
            Route::DeleteAccessLog("abc".to_string())
        );
        assert_eq!(route("DELETE", "/access-logs"), Route::ClearAccessLogs);
        assert_eq!(route("GET", "/access-logs/"), Route::ListAccessLogs);
    }

    #[test]
    fn wrong_method_and_unknown_path() {
        assert_eq!(route("POST", "/snapshot"), Route::MethodNotAllowed);
        assert_eq!(route("GET", "/detection/toggle"), Route::MethodNotAllowed);
        assert_eq!(route("GET", "/access-logs/abc"), Route::MethodNotAllowed);
        assert_eq!(route("GET", "/"), Route::NotFound);
        assert_eq!(route("GET", "/access-logs/a/b/c"), Route::NotFound);
    }

    #[test]
    fn limit_defaults_and_caps() {
        assert_eq!(request("/access-logs").limit(), 100);
        assert_eq!(request("/access-logs?limit=5").limit(), 5);
        assert_eq!(request("/access-logs?limit=abc").limit(), 100);
        assert_eq!(request("/access-logs?limit=-3").limit(), 100);
        assert_eq!(request("/access-logs?x=1&limit=50000").limit(), 1000);
    }
}
