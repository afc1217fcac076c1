//! End-to-end pipeline tests against a local HTTP stub.
//!
//! The stub is a bare TCP listener speaking just enough HTTP/1.1 for
//! reqwest: per-path canned responses, per-path hit counters, and
//! `Connection: close` on every response.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use memories_dl::{
    AppConfig, ConvertConfig, Converter, ErrorKind, FailedRun, FetchConfig, Fetcher, ItemStatus,
    MediaKind, NoProgress, Orchestrator, OutputTree, RetryPolicy, RunProgress, WorkItem,
};

const JPEG_BYTES: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x00,
];
const PNG_BYTES: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52,
];
const MP4_BYTES: &[u8] = &[
    0x00, 0x00, 0x00, 0x18, b'f', b't', b'y', b'p', b'i', b's', b'o', b'm', 0x00, 0x00, 0x00,
    0x00,
];

struct Stub {
    addr: SocketAddr,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl Stub {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));

        let accept_hits = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let hits = Arc::clone(&accept_hits);
                tokio::spawn(handle_connection(socket, hits));
            }
        });

        Self { addr, hits }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn hit_count(&self, path: &str) -> usize {
        self.hits.lock().await.get(path).copied().unwrap_or(0)
    }
}

async fn handle_connection(mut socket: TcpStream, hits: Arc<Mutex<HashMap<String, usize>>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return,
        }
    }
    let request_line = String::from_utf8_lossy(&buf);
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let hit = {
        let mut hits = hits.lock().await;
        let count = hits.entry(path.clone()).or_insert(0);
        *count += 1;
        *count
    };

    let addr = socket.local_addr().expect("stub has a local address");
    let (status, content_type, body) = response_for(&path, hit, addr);
    let reason = match status {
        200 => "OK",
        403 => "Forbidden",
        503 => "Service Unavailable",
        _ => "Unknown",
    };
    let header = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = socket.write_all(header.as_bytes()).await;
    let _ = socket.write_all(&body).await;
    let _ = socket.flush().await;
}

fn response_for(path: &str, hit: usize, addr: SocketAddr) -> (u16, &'static str, Vec<u8>) {
    match path {
        "/photo" => (200, "image/jpeg", JPEG_BYTES.to_vec()),
        "/clip" => (200, "video/mp4", MP4_BYTES.to_vec()),
        // Two transient failures, then success.
        "/flaky" if hit <= 2 => (503, "text/plain", b"try later".to_vec()),
        "/flaky" => (200, "image/png", PNG_BYTES.to_vec()),
        "/expired" => (403, "text/plain", b"signature expired".to_vec()),
        "/htmlpage" => (
            200,
            "text/html",
            b"<html><body>This link has expired</body></html>".to_vec(),
        ),
        // Intermediate page carrying the real media URL in a JSON field.
        "/indirect" => (
            200,
            "application/json",
            format!(r#"{{"url": "http://{addr}/photo"}}"#).into_bytes(),
        ),
        _ => (403, "text/plain", b"unknown path".to_vec()),
    }
}

fn image_item(index: u32, url: String) -> WorkItem {
    WorkItem {
        index,
        url,
        declared_kind: MediaKind::Image,
        captured_at: None,
    }
}

fn fast_fetch_config() -> FetchConfig {
    FetchConfig::default()
        .with_timeout(Duration::from_secs(5))
        .with_retry(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        })
}

fn orchestrator(config: &AppConfig, tree: OutputTree) -> Orchestrator {
    Orchestrator::new(
        Fetcher::new(&config.fetch).unwrap(),
        Converter::new(ConvertConfig::default()),
        tree,
        config,
    )
}

#[tokio::test]
async fn run_isolates_failures_and_persists_them_for_retry() {
    let stub = Stub::start().await;
    let out = tempfile::TempDir::new().unwrap();
    let state = tempfile::TempDir::new().unwrap();

    let items = vec![
        image_item(1, stub.url("/photo")),
        image_item(2, stub.url("/flaky")),
        image_item(3, stub.url("/expired")),
        image_item(4, stub.url("/htmlpage")),
    ];
    let mut config = AppConfig::default();
    config.fetch = fast_fetch_config();
    let tree = OutputTree::new(out.path().to_path_buf());
    let orch = orchestrator(&config, tree.clone());
    let progress: Arc<dyn RunProgress> = Arc::new(NoProgress);

    let summary = orch
        .run(&items, &[1, 2, 3, 4], &progress, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.attempted, 4);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.skipped, 0);
    assert!(!summary.cancelled);

    // The flaky item survived two transient failures.
    let flaky = summary.records.iter().find(|r| r.item_index == 2).unwrap();
    assert_eq!(flaky.status, ItemStatus::Succeeded);
    assert_eq!(flaky.attempt_count, 3);
    assert_eq!(stub.hit_count("/flaky").await, 3);

    // A terminal rejection is not retried.
    let expired = summary.records.iter().find(|r| r.item_index == 3).unwrap();
    assert_eq!(expired.status, ItemStatus::Failed);
    assert_eq!(expired.attempt_count, 1);

    // Failure kinds, ascending by index.
    let kinds: Vec<(u32, ErrorKind)> = summary.failures.iter().map(|f| (f.index, f.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (3, ErrorKind::LinkExpiredOrForbidden),
            (4, ErrorKind::InvalidPayload),
        ]
    );

    // Successful payloads landed under images/ with sniffed extensions.
    assert_eq!(
        std::fs::read(tree.images().join("memory_1.jpg")).unwrap(),
        JPEG_BYTES
    );
    assert_eq!(
        std::fs::read(tree.images().join("memory_2.png")).unwrap(),
        PNG_BYTES
    );

    // The invalid payload was captured for inspection, not stored as media.
    let capture = std::fs::read_to_string(tree.debug().join("response_4.html")).unwrap();
    assert!(capture.contains("expired"));
    assert!(!tree.images().join("memory_4.jpg").exists());

    // Persist and reload the failure list the way a CLI run would.
    FailedRun::new(4, summary.failures.clone())
        .save(state.path())
        .unwrap();
    let reloaded = FailedRun::load(state.path()).unwrap();
    assert_eq!(reloaded.indices(), vec![3, 4]);

    // A retry pass over the failure list touches exactly those items.
    let retry_summary = orch
        .run(&items, &reloaded.indices(), &progress, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(retry_summary.attempted, 2);
    assert_eq!(retry_summary.failed, 2);
    assert_eq!(stub.hit_count("/photo").await, 1);
}

#[tokio::test]
async fn rerun_skips_items_whose_output_already_exists() {
    let stub = Stub::start().await;
    let out = tempfile::TempDir::new().unwrap();

    let items = vec![image_item(1, stub.url("/photo"))];
    let mut config = AppConfig::default();
    config.fetch = fast_fetch_config();
    let tree = OutputTree::new(out.path().to_path_buf());
    let orch = orchestrator(&config, tree.clone());
    let progress: Arc<dyn RunProgress> = Arc::new(NoProgress);

    let first = orch
        .run(&items, &[1], &progress, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.succeeded, 1);
    assert_eq!(first.skipped, 0);
    assert_eq!(stub.hit_count("/photo").await, 1);

    let second = orch
        .run(&items, &[1], &progress, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.succeeded, 1);
    assert_eq!(second.skipped, 1);
    // No second network round trip.
    assert_eq!(stub.hit_count("/photo").await, 1);

    // A pre-cancelled run starts nothing at all.
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let third = orch.run(&items, &[1], &progress, cancelled).await.unwrap();
    assert_eq!(third.attempted, 0);
    assert!(third.cancelled);
    assert_eq!(stub.hit_count("/photo").await, 1);
}

#[tokio::test]
async fn unaddressable_selection_indices_are_ignored_not_fatal() {
    let out = tempfile::TempDir::new().unwrap();

    let items = vec![image_item(1, "http://127.0.0.1:1/unused".to_string())];
    let mut config = AppConfig::default();
    config.fetch = fast_fetch_config();
    let orch = orchestrator(&config, OutputTree::new(out.path().to_path_buf()));
    let progress: Arc<dyn RunProgress> = Arc::new(NoProgress);

    // A corrupt failure list can hand the run a 0 or stale index; neither
    // maps to an item, so the run completes empty instead of aborting.
    let summary = orch
        .run(&items, &[0, 99], &progress, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.attempted, 0);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn intermediate_page_is_followed_and_attempts_accumulate() {
    let stub = Stub::start().await;
    let out = tempfile::TempDir::new().unwrap();

    let items = vec![image_item(1, stub.url("/indirect"))];
    let mut config = AppConfig::default();
    config.fetch = fast_fetch_config();
    let tree = OutputTree::new(out.path().to_path_buf());
    let orch = orchestrator(&config, tree.clone());
    let progress: Arc<dyn RunProgress> = Arc::new(NoProgress);

    let summary = orch
        .run(&items, &[1], &progress, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(stub.hit_count("/indirect").await, 1);
    assert_eq!(stub.hit_count("/photo").await, 1);
    // One attempt on the intermediate page plus one on the real URL.
    let record = summary.records.iter().find(|r| r.item_index == 1).unwrap();
    assert_eq!(record.attempt_count, 2);
    assert_eq!(
        std::fs::read(tree.images().join("memory_1.jpg")).unwrap(),
        JPEG_BYTES
    );
}

#[cfg(unix)]
#[tokio::test]
async fn failed_conversion_leaves_no_artifacts_in_videos() {
    use std::os::unix::fs::PermissionsExt;

    let stub = Stub::start().await;
    let out = tempfile::TempDir::new().unwrap();
    let tools = tempfile::TempDir::new().unwrap();

    let write_script = |name: &str, body: &str| {
        let path = tools.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    };
    let ffprobe = write_script("ffprobe", r#"printf '{"streams":[{"codec_name":"h264"}]}'"#);
    let ffmpeg = write_script("ffmpeg", "echo 'muxer rejected input' >&2\nexit 1");

    let items = vec![WorkItem {
        index: 1,
        url: stub.url("/clip"),
        declared_kind: MediaKind::Video,
        captured_at: None,
    }];
    let mut config = AppConfig::default();
    config.fetch = fast_fetch_config();
    let tree = OutputTree::new(out.path().to_path_buf());
    let orch = Orchestrator::new(
        Fetcher::new(&config.fetch).unwrap(),
        Converter::new(ConvertConfig {
            ffmpeg,
            ffprobe,
            ..ConvertConfig::default()
        }),
        tree.clone(),
        &config,
    );
    let progress: Arc<dyn RunProgress> = Arc::new(NoProgress);

    let summary = orch
        .run(&items, &[1], &progress, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].kind, ErrorKind::ConversionFailed);
    // Neither the staged download, a temp output, nor a torn final file
    // survives the failed conversion.
    assert!(
        std::fs::read_dir(tree.videos()).unwrap().next().is_none(),
        "videos/ should be empty after a failed conversion"
    );
}
