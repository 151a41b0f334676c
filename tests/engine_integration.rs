//! End-to-end tests of the segmented HTTP engine against a mock server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};
use wiremock::matchers::{method, path};

use warpdl_core::config::Environment;
use warpdl_core::download::{
    DownloadError, DownloaderOptions, EventHandlers, HttpDownloader, MAIN_HASH, ProtocolDownloader,
    RetryConfig, SpeedLimiter,
};
use warpdl_core::manager::ItemPart;

/// Serves a fixed body with byte-range support, recording every Range
/// header it sees.
struct RangeFile {
    body: Vec<u8>,
    ranges_seen: Arc<Mutex<Vec<Option<String>>>>,
    support_ranges: bool,
}

impl RangeFile {
    fn new(body: Vec<u8>, ranges_seen: Arc<Mutex<Vec<Option<String>>>>) -> Self {
        Self {
            body,
            ranges_seen,
            support_ranges: true,
        }
    }

    fn without_ranges(body: Vec<u8>) -> Self {
        Self {
            body,
            ranges_seen: Arc::default(),
            support_ranges: false,
        }
    }
}

impl Respond for RangeFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        self.ranges_seen.lock().unwrap().push(range.clone());

        let Some(range) = range.filter(|_| self.support_ranges) else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.clone());
        };

        let spec = range.trim_start_matches("bytes=");
        let (start, end) = spec.split_once('-').unwrap();
        let start: usize = start.parse().unwrap();
        let end: usize = end
            .parse::<usize>()
            .map_or(self.body.len() - 1, |e| e.min(self.body.len() - 1));

        ResponseTemplate::new(206)
            .insert_header(
                "Content-Range",
                format!("bytes {start}-{end}/{}", self.body.len()).as_str(),
            )
            .set_body_bytes(self.body[start..=end].to_vec())
    }
}

/// Deterministic payload that makes offset mistakes visible.
fn patterned_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct Capture {
    spawned: Arc<Mutex<Vec<(String, i64, i64)>>>,
    progress: Arc<AtomicU64>,
    completed: Arc<Mutex<Vec<(String, i64)>>>,
}

fn capturing_handlers() -> (EventHandlers, Capture) {
    let spawned: Arc<Mutex<Vec<(String, i64, i64)>>> = Arc::default();
    let progress = Arc::new(AtomicU64::new(0));
    let completed: Arc<Mutex<Vec<(String, i64)>>> = Arc::default();

    let spawned_cb = Arc::clone(&spawned);
    let progress_cb = Arc::clone(&progress);
    let completed_cb = Arc::clone(&completed);

    let handlers = EventHandlers {
        spawn_part: Some(Arc::new(move |hash, init, fin| {
            spawned_cb.lock().unwrap().push((hash.to_string(), init, fin));
        })),
        download_progress: Some(Arc::new(move |_, n| {
            progress_cb.fetch_add(n, Ordering::SeqCst);
        })),
        download_complete: Some(Arc::new(move |hash, total| {
            completed_cb.lock().unwrap().push((hash.to_string(), total));
        })),
        ..EventHandlers::default()
    };
    (
        handlers,
        Capture {
            spawned,
            progress,
            completed,
        },
    )
}

fn downloader(tmp: &TempDir, url: &str, opts: DownloaderOptions) -> HttpDownloader {
    let env = Environment::with_config_dir(tmp.path().join("cfg")).unwrap();
    let opts = DownloaderOptions {
        save_dir: Some(tmp.path().join("out")),
        ..opts
    };
    HttpDownloader::new(
        reqwest::Client::new(),
        &env,
        url,
        SpeedLimiter::unlimited(),
        opts,
    )
    .unwrap()
}

#[tokio::test]
async fn parallel_download_four_parts_is_byte_identical() {
    let server = MockServer::start().await;
    let payload = patterned_payload(1_048_576);
    let ranges: Arc<Mutex<Vec<Option<String>>>> = Arc::default();

    Mock::given(method("GET"))
        .and(path("/big.bin"))
        .respond_with(RangeFile::new(payload.clone(), Arc::clone(&ranges)))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let mut dl = downloader(
        &tmp,
        &format!("{}/big.bin", server.uri()),
        DownloaderOptions {
            max_parts: Some(4),
            min_part_size: Some(256 * 1024),
            ..DownloaderOptions::default()
        },
    );

    let probe = dl.probe().await.unwrap();
    assert_eq!(probe.content_length.as_i64(), 1_048_576);
    assert!(probe.resumable);

    let (handlers, capture) = capturing_handlers();
    dl.download(handlers).await.unwrap();

    // Four parts with the expected ranges, in some spawn order.
    let mut spawned: Vec<(i64, i64)> = capture
        .spawned
        .lock()
        .unwrap()
        .iter()
        .map(|(_, i, f)| (*i, *f))
        .collect();
    spawned.sort_unstable();
    assert_eq!(
        spawned,
        vec![
            (0, 262_143),
            (262_144, 524_287),
            (524_288, 786_431),
            (786_432, 1_048_575),
        ]
    );

    // Progress sums to the payload size; exactly one aggregate
    // completion event.
    assert_eq!(capture.progress.load(Ordering::SeqCst), 1_048_576);
    let completed = capture.completed.lock().unwrap();
    assert_eq!(completed.as_slice(), &[(MAIN_HASH.to_string(), 1_048_576)]);

    let written = std::fs::read(dl.save_path()).unwrap();
    assert_eq!(written, payload, "destination must be byte-identical");

    // Staging files are gone after compilation.
    assert!(!dl.download_directory().exists() || std::fs::read_dir(dl.download_directory()).unwrap().next().is_none());
}

#[tokio::test]
async fn resume_refetches_only_missing_tail_bytes() {
    let server = MockServer::start().await;
    let payload = patterned_payload(786_432);
    let ranges: Arc<Mutex<Vec<Option<String>>>> = Arc::default();

    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(RangeFile::new(payload.clone(), Arc::clone(&ranges)))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let mut dl = downloader(
        &tmp,
        &format!("{}/file.bin", server.uri()),
        DownloaderOptions {
            hash: Some("resumetest".to_string()),
            ..DownloaderOptions::default()
        },
    );
    dl.probe().await.unwrap();

    // Persisted state: part 0 compiled, part 1 half staged, part 2
    // untouched.
    let mut parts = BTreeMap::new();
    parts.insert(
        0,
        ItemPart {
            hash: "part0".to_string(),
            final_offset: 262_143,
            compiled: true,
        },
    );
    parts.insert(
        262_144,
        ItemPart {
            hash: "part1".to_string(),
            final_offset: 524_287,
            compiled: false,
        },
    );
    parts.insert(
        524_288,
        ItemPart {
            hash: "part2".to_string(),
            final_offset: 786_431,
            compiled: false,
        },
    );

    // On-disk state matching the catalogue.
    std::fs::create_dir_all(tmp.path().join("out")).unwrap();
    std::fs::write(dl.save_path(), &payload[..262_144]).unwrap();
    std::fs::create_dir_all(dl.download_directory()).unwrap();
    std::fs::write(
        dl.download_directory().join("part1.warp"),
        &payload[262_144..362_144],
    )
    .unwrap();
    std::fs::write(dl.download_directory().join("part2.warp"), b"").unwrap();

    let (handlers, capture) = capturing_handlers();
    dl.resume(parts, handlers).await.unwrap();

    // Beyond the probe, only the missing ranges were requested.
    let mut requested: Vec<String> = ranges.lock().unwrap().iter().flatten().cloned().collect();
    requested.retain(|r| r != "bytes=0-0");
    requested.sort();
    assert_eq!(requested, ["bytes=362144-524287", "bytes=524288-786431"]);

    // Progress equals the refetched bytes: N - k.
    assert_eq!(
        capture.progress.load(Ordering::SeqCst),
        (524_288 - 362_144) + (786_432 - 524_288)
    );
    assert_eq!(
        capture.completed.lock().unwrap().as_slice(),
        &[(MAIN_HASH.to_string(), 786_432)]
    );

    let written = std::fs::read(dl.save_path()).unwrap();
    assert_eq!(written, payload);
}

#[tokio::test]
async fn resume_with_all_parts_compiled_returns_immediately() {
    let server = MockServer::start().await;
    let payload = patterned_payload(1024);
    let ranges: Arc<Mutex<Vec<Option<String>>>> = Arc::default();

    Mock::given(method("GET"))
        .and(path("/done.bin"))
        .respond_with(RangeFile::new(payload.clone(), Arc::clone(&ranges)))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let mut dl = downloader(
        &tmp,
        &format!("{}/done.bin", server.uri()),
        DownloaderOptions::default(),
    );
    dl.probe().await.unwrap();

    std::fs::create_dir_all(tmp.path().join("out")).unwrap();
    std::fs::write(dl.save_path(), &payload).unwrap();

    let mut parts = BTreeMap::new();
    parts.insert(
        0,
        ItemPart {
            hash: "p0".to_string(),
            final_offset: 1023,
            compiled: true,
        },
    );

    let (handlers, capture) = capturing_handlers();
    dl.resume(parts, handlers).await.unwrap();

    // Only the probe touched the server; no transfer events fired.
    assert_eq!(ranges.lock().unwrap().len(), 1);
    assert_eq!(capture.progress.load(Ordering::SeqCst), 0);
    assert!(capture.completed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn resume_refuses_when_destination_vanished() {
    let server = MockServer::start().await;
    let payload = patterned_payload(2048);
    let ranges: Arc<Mutex<Vec<Option<String>>>> = Arc::default();

    Mock::given(method("GET"))
        .and(path("/gone.bin"))
        .respond_with(RangeFile::new(payload, Arc::clone(&ranges)))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let mut dl = downloader(
        &tmp,
        &format!("{}/gone.bin", server.uri()),
        DownloaderOptions::default(),
    );
    dl.probe().await.unwrap();

    let mut parts = BTreeMap::new();
    parts.insert(
        0,
        ItemPart {
            hash: "p0".to_string(),
            final_offset: 1023,
            compiled: true,
        },
    );
    parts.insert(
        1024,
        ItemPart {
            hash: "p1".to_string(),
            final_offset: 2047,
            compiled: false,
        },
    );

    // No destination file on disk although part 0 claims compiled.
    let result = dl.resume(parts, EventHandlers::default()).await;
    assert!(matches!(
        result,
        Err(DownloadError::DestinationMissing { .. })
    ));
}

#[tokio::test]
async fn server_without_ranges_falls_back_to_single_stream() {
    let server = MockServer::start().await;
    let payload = patterned_payload(300_000);

    Mock::given(method("GET"))
        .and(path("/plain.bin"))
        .respond_with(RangeFile::without_ranges(payload.clone()))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let mut dl = downloader(
        &tmp,
        &format!("{}/plain.bin", server.uri()),
        DownloaderOptions {
            max_parts: Some(4),
            min_part_size: Some(1024),
            ..DownloaderOptions::default()
        },
    );

    let probe = dl.probe().await.unwrap();
    assert!(!probe.resumable, "200 without Accept-Ranges is not resumable");

    let (handlers, capture) = capturing_handlers();
    dl.download(handlers).await.unwrap();

    // One unranged part covering the whole file.
    let spawned = capture.spawned.lock().unwrap();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].1, 0);

    assert_eq!(capture.progress.load(Ordering::SeqCst), 300_000);
    let written = std::fs::read(dl.save_path()).unwrap();
    assert_eq!(written, payload);
}

/// Fails the first N requests with 500, then serves ranges normally.
struct FlakyRangeFile {
    inner: RangeFile,
    failures_left: AtomicUsize,
}

impl Respond for FlakyRangeFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let is_probe = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|r| r == "bytes=0-0");
        if is_probe {
            return self.inner.respond(request);
        }
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .failures_left
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return ResponseTemplate::new(500);
        }
        self.inner.respond(request)
    }
}

#[tokio::test]
async fn transient_server_errors_are_retried_to_completion() {
    let server = MockServer::start().await;
    let payload = patterned_payload(128 * 1024);
    let ranges: Arc<Mutex<Vec<Option<String>>>> = Arc::default();

    Mock::given(method("GET"))
        .and(path("/flaky.bin"))
        .respond_with(FlakyRangeFile {
            inner: RangeFile::new(payload.clone(), Arc::clone(&ranges)),
            failures_left: AtomicUsize::new(2),
        })
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let mut dl = downloader(
        &tmp,
        &format!("{}/flaky.bin", server.uri()),
        DownloaderOptions {
            retry: RetryConfig {
                max_retries: 5,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                jitter_factor: 0.0,
                backoff_factor: 1.0,
            },
            ..DownloaderOptions::default()
        },
    );

    dl.probe().await.unwrap();

    let (handlers, capture) = capturing_handlers();
    dl.download(handlers).await.unwrap();

    assert_eq!(capture.progress.load(Ordering::SeqCst), 128 * 1024);
    assert_eq!(std::fs::read(dl.save_path()).unwrap(), payload);
}

#[tokio::test]
async fn missing_file_fails_probe_without_retry_side_effects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/absent.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let mut dl = downloader(
        &tmp,
        &format!("{}/absent.bin", server.uri()),
        DownloaderOptions::default(),
    );

    let err = dl.probe().await.unwrap_err();
    match err {
        DownloadError::HttpStatus { status, .. } => assert_eq!(status, 404),
        other => panic!("expected HttpStatus, got {other:?}"),
    }
    assert!(!err.is_transient());
}

#[tokio::test]
async fn stop_before_start_is_a_graceful_noop() {
    let server = MockServer::start().await;
    let payload = patterned_payload(4096);
    let ranges: Arc<Mutex<Vec<Option<String>>>> = Arc::default();

    Mock::given(method("GET"))
        .and(path("/stopped.bin"))
        .respond_with(RangeFile::new(payload, Arc::clone(&ranges)))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let mut dl = downloader(
        &tmp,
        &format!("{}/stopped.bin", server.uri()),
        DownloaderOptions::default(),
    );
    dl.probe().await.unwrap();

    dl.stop();
    assert!(dl.is_stopped());

    let (handlers, capture) = capturing_handlers();
    dl.download(handlers).await.unwrap();

    // Probe was the only request; nothing was spawned or completed.
    assert_eq!(ranges.lock().unwrap().len(), 1);
    assert!(capture.spawned.lock().unwrap().is_empty());
    assert!(capture.completed.lock().unwrap().is_empty());
}
