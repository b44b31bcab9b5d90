use anyhow::Result;
use serde_json::Value;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

use camwatch::api::{ApiConfig, ApiContext, ApiHandle, ApiServer};
use camwatch::event_log::{image_file_name, new_entry_id, AccessLogEntry, AccessLogStore};
use camwatch::stream::StreamConfig;
use camwatch::{EncodedFrame, Frame, PipelineStats, SharedFrameState, ToggleState};

struct TestApi {
    _dir: TempDir,
    frames: Arc<SharedFrameState>,
    store: Arc<AccessLogStore>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let store = Arc::new(AccessLogStore::open(
            &dir.path().join("access.db").to_string_lossy(),
            dir.path().join("images"),
            100,
        )?);
        let frames = Arc::new(SharedFrameState::new());
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            stream: StreamConfig {
                interval: Duration::from_millis(5),
                wait: Duration::from_millis(5),
            },
        };
        let ctx = ApiContext {
            frames: frames.clone(),
            toggles: Arc::new(ToggleState::default()),
            access_log: store.clone(),
            stats: Arc::new(PipelineStats::new()),
        };
        let api_handle = ApiServer::new(api_config, ctx).spawn()?;
        Ok(Self {
            _dir: dir,
            frames,
            store,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn addr(&self) -> SocketAddr {
        self.handle().addr
    }

    fn add_entry(&self, label: &str) -> Result<AccessLogEntry> {
        let id = new_entry_id();
        let entry = AccessLogEntry {
            image: image_file_name(&id),
            id,
            timestamp: "2024-05-01T12:00:00+00:00".to_string(),
            labels: vec![label.to_string()],
            count: 1,
        };
        self.store.insert(&entry, b"\xFF\xD8snapshot")?;
        Ok(entry)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn send(addr: SocketAddr, request: &str) -> Result<(String, Vec<u8>)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(request.as_bytes())?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    let body = response.get(split + 4..).unwrap_or_default().to_vec();
    Ok((headers, body))
}

fn get(addr: SocketAddr, path: &str) -> Result<(String, Vec<u8>)> {
    send(addr, &format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n"))
}

fn json(body: &[u8]) -> Value {
    serde_json::from_slice(body).expect("response body should be JSON")
}

/// Read whatever arrives within `window`.
fn read_for(stream: &mut TcpStream, window: Duration) -> Result<Vec<u8>> {
    stream.set_read_timeout(Some(Duration::from_millis(20)))?;
    let deadline = Instant::now() + window;
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(out)
}

fn count_parts(data: &[u8]) -> usize {
    data.windows(7).filter(|w| w == b"--frame").count()
}

#[test]
fn health_reports_ok() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = get(api.addr(), "/health")?;
    assert!(headers.contains("200 OK"));
    let value = json(&body);
    assert_eq!(value["status"], "ok");
    assert_eq!(value["source_healthy"], true);
    assert!(value["frame_age_ms"].is_null());
    assert_eq!(value["viewers"], 0);

    let frame = Frame::from_rgb(vec![0u8; 4 * 4 * 3], 4, 4, 1)?;
    api.frames.publish_raw(Arc::new(frame));
    let (_, body) = get(api.addr(), "/health")?;
    assert!(json(&body)["frame_age_ms"].is_u64());
    Ok(())
}

#[test]
fn snapshot_is_unavailable_until_first_frame() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = get(api.addr(), "/snapshot")?;
    assert!(headers.contains("503 Service Unavailable"));

    api.frames.publish_encoded(EncodedFrame {
        jpeg: vec![0xFF, 0xD8, 0x01, 0xFF, 0xD9],
        sequence: 1,
    });
    let (headers, body) = get(api.addr(), "/snapshot")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("image/jpeg"));
    assert_eq!(body, vec![0xFF, 0xD8, 0x01, 0xFF, 0xD9]);
    Ok(())
}

#[test]
fn toggle_merges_partial_updates() -> Result<()> {
    let api = TestApi::new()?;
    let body = r#"{"objects": false}"#;
    let request = format!(
        "POST /detection/toggle HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let (headers, body) = send(api.addr(), &request)?;
    assert!(headers.contains("200 OK"));
    let value = json(&body);
    assert_eq!(value["faces"], true);
    assert_eq!(value["objects"], false);

    let (_, body) = get(api.addr(), "/detection/status")?;
    assert_eq!(json(&body), serde_json::json!({"faces": true, "objects": false}));
    Ok(())
}

#[test]
fn malformed_toggle_is_a_no_op() -> Result<()> {
    let api = TestApi::new()?;
    let request =
        "POST /detection/toggle HTTP/1.1\r\nHost: localhost\r\nContent-Length: 8\r\n\r\nnot json";
    let (headers, body) = send(api.addr(), request)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(json(&body), serde_json::json!({"faces": true, "objects": true}));
    Ok(())
}

#[test]
fn access_logs_are_listed_newest_first_with_limit() -> Result<()> {
    let api = TestApi::new()?;
    let first = api.add_entry("person")?;
    let second = api.add_entry("face")?;

    let (headers, body) = get(api.addr(), "/access-logs")?;
    assert!(headers.contains("200 OK"));
    let value = json(&body);
    assert_eq!(value[0]["id"], second.id);
    assert_eq!(value[1]["id"], first.id);

    let (_, body) = get(api.addr(), "/access-logs?limit=1")?;
    assert_eq!(json(&body).as_array().map(Vec::len), Some(1));
    let (_, body) = get(api.addr(), "/access-logs?limit=bogus")?;
    assert_eq!(json(&body).as_array().map(Vec::len), Some(2));
    Ok(())
}

#[test]
fn access_log_image_and_delete() -> Result<()> {
    let api = TestApi::new()?;
    let entry = api.add_entry("person")?;

    let (headers, body) = get(api.addr(), &format!("/access-logs/{}/image", entry.id))?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body, b"\xFF\xD8snapshot".to_vec());

    let delete = format!(
        "DELETE /access-logs/{} HTTP/1.1\r\nHost: localhost\r\n\r\n",
        entry.id
    );
    let (headers, body) = send(api.addr(), &delete)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(json(&body)["deleted"], entry.id);

    let (headers, _) = send(api.addr(), &delete)?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = get(api.addr(), &format!("/access-logs/{}/image", entry.id))?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}

#[test]
fn clear_is_idempotent() -> Result<()> {
    let api = TestApi::new()?;
    api.add_entry("person")?;
    api.add_entry("person")?;
    let clear = "DELETE /access-logs HTTP/1.1\r\nHost: localhost\r\n\r\n";

    let (headers, body) = send(api.addr(), clear)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(json(&body)["cleared"], 2);
    let (_, body) = send(api.addr(), clear)?;
    assert_eq!(json(&body)["cleared"], 0);
    Ok(())
}

#[test]
fn unknown_paths_and_methods() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = get(api.addr(), "/nope")?;
    assert!(headers.contains("404 Not Found"));
    assert_eq!(json(&body)["error"], "not_found");

    let (headers, _) = send(
        api.addr(),
        "PUT /snapshot HTTP/1.1\r\nHost: localhost\r\n\r\n",
    )?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

#[test]
fn video_feed_waits_for_first_frame_and_viewers_are_independent() -> Result<()> {
    let api = TestApi::new()?;
    let request = "GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n";

    let mut first = TcpStream::connect(api.addr())?;
    first.write_all(request.as_bytes())?;
    let before = read_for(&mut first, Duration::from_millis(150))?;
    let before_text = String::from_utf8_lossy(&before);
    assert!(before_text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert_eq!(count_parts(&before), 0);

    api.frames.publish_encoded(EncodedFrame {
        jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
        sequence: 1,
    });
    let mut second = TcpStream::connect(api.addr())?;
    second.write_all(request.as_bytes())?;

    let chunks = read_for(&mut first, Duration::from_millis(200))?;
    assert!(count_parts(&chunks) >= 2);
    assert_eq!(api.handle().viewers(), 2);

    drop(first);
    let after = read_for(&mut second, Duration::from_millis(200))?;
    assert!(count_parts(&after) >= 2);

    // The dropped viewer is noticed on its next write.
    let deadline = Instant::now() + Duration::from_secs(2);
    while api.handle().viewers() > 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(api.handle().viewers(), 1);
    Ok(())
}

#[test]
fn viewer_leaving_before_first_frame_is_released() -> Result<()> {
    let api = TestApi::new()?;
    let mut viewer = TcpStream::connect(api.addr())?;
    viewer.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let header = read_for(&mut viewer, Duration::from_millis(100))?;
    assert!(String::from_utf8_lossy(&header).contains("200 OK"));
    assert_eq!(api.handle().viewers(), 1);

    drop(viewer);
    let deadline = Instant::now() + Duration::from_secs(2);
    while api.handle().viewers() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(api.handle().viewers(), 0);
    assert!(api.frames.latest_encoded().is_none());
    Ok(())
}
