use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, head},
};
use kinema::{
    CacheType, CoordinatorOptions, PlayOptions, PlaybackCoordinator, PlayerError, PlayerEvent,
    PlayerStatus, PolicyHooks, Readiness,
};
use kinema_cache::StoreOptions;
use kinema_fetch::FetchOptions;
use kinema_net::RetryPolicy;
use rstest::rstest;
use tempfile::TempDir;
use tokio::net::TcpListener;
use url::Url;

const BODY_LEN: u64 = 65_536;

#[derive(Clone)]
struct VideoState {
    body: Arc<Vec<u8>>,
    get_hits: Arc<AtomicU32>,
    not_found: Arc<std::sync::atomic::AtomicBool>,
}

impl VideoState {
    fn new(len: u64) -> Self {
        Self {
            body: Arc::new((0..len).map(|i| (i % 251) as u8).collect()),
            get_hits: Arc::new(AtomicU32::new(0)),
            not_found: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }
}

fn parse_range(headers: &HeaderMap, len: u64) -> Option<(u64, u64)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = match end {
        "" => len - 1,
        e => e.parse().ok()?,
    };
    Some((start, end.min(len - 1)))
}

async fn head_video(State(state): State<VideoState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_LENGTH, state.body.len().to_string())],
    )
}

async fn get_video(State(state): State<VideoState>, headers: HeaderMap) -> Response {
    state.get_hits.fetch_add(1, Ordering::SeqCst);
    if state.not_found.load(Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let len = state.body.len() as u64;
    let Some((start, end)) = parse_range(&headers, len) else {
        return (StatusCode::OK, state.body.as_ref().clone()).into_response();
    };
    (
        StatusCode::PARTIAL_CONTENT,
        [(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))],
        state.body[start as usize..=end as usize].to_vec(),
    )
        .into_response()
}

struct Server {
    url: Url,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Server {
    async fn start(state: VideoState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new()
            .route("/video.mp4", head(head_video))
            .route("/video.mp4", get(get_video))
            .with_state(state);

        let (shutdown, rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, router).with_graceful_shutdown(async {
            rx.await.ok();
        });
        tokio::spawn(async move {
            server.await.unwrap();
        });

        Self {
            url: Url::parse(&format!("http://{addr}/video.mp4")).unwrap(),
            shutdown: Some(shutdown),
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn coordinator(dir: &TempDir) -> PlaybackCoordinator {
    coordinator_with_hooks(dir, PolicyHooks::default())
}

fn coordinator_with_hooks(dir: &TempDir, hooks: PolicyHooks) -> PlaybackCoordinator {
    PlaybackCoordinator::new(
        CoordinatorOptions::new(StoreOptions::new(dir.path()))
            .with_fetch(FetchOptions::default().with_chunk_size(16_384).with_retry(
                RetryPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(10),
                },
            ))
            .with_hooks(hooks)
            .with_events_capacity(512),
    )
    .unwrap()
}

fn play_options() -> PlayOptions {
    PlayOptions::default().with_lookahead(16_384)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_idle_store(coordinator: &PlaybackCoordinator) {
    let store = Arc::clone(coordinator.store());
    wait_until(move || store.stats().live_sessions == 0).await;
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test]
async fn play_buffers_reads_and_finishes() {
    let state = VideoState::new(BODY_LEN);
    let server = Server::start(state.clone()).await;
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);

    let session = coordinator
        .play(server.url.clone(), play_options())
        .await
        .unwrap();

    assert_eq!(session.total_expected_size(), Some(BODY_LEN));

    // Renderer starts at 0 and waits for the first window.
    session.advance_to(0);
    session.wait_range(0..16_384).await.unwrap();

    match session.readiness() {
        Readiness::Ready(cache_type) => {
            assert!(matches!(cache_type, CacheType::WebFetching | CacheType::Disk));
        }
        other => panic!("expected Ready, got {other:?}"),
    }
    assert_eq!(session.status(), PlayerStatus::Playing);

    let bytes = session.read(0..4_096).await.unwrap();
    assert_eq!(&bytes[..], &state.body[..4_096]);

    // Consume to the end.
    {
        let session = session.clone();
        wait_until(move || session.fraction_complete() >= 1.0).await;
    }
    session.advance_to(BODY_LEN);
    assert_eq!(session.status(), PlayerStatus::Finished);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test]
async fn subscribers_see_ordered_deduplicated_events() {
    let state = VideoState::new(BODY_LEN);
    let server = Server::start(state.clone()).await;
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);

    let session = coordinator
        .play(server.url.clone(), play_options())
        .await
        .unwrap();
    let mut rx = session.subscribe();

    // Trigger delivery (flushes the pre-subscription backlog first).
    session.report_playback_clock(0.0, 0.0);

    {
        let session = session.clone();
        wait_until(move || session.fraction_complete() >= 1.0).await;
    }
    session.advance_to(0);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    // The backlog preserved the initial sequence.
    assert_eq!(events[0], PlayerEvent::FileLength { bytes: BODY_LEN });
    assert!(matches!(events[1], PlayerEvent::DownloadProgress { .. }));
    assert_eq!(
        events[2],
        PlayerEvent::StatusChanged {
            status: PlayerStatus::Buffering
        }
    );

    // Status eventually reached Playing, and Buffering came first.
    let statuses: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::StatusChanged { status } => Some(*status),
            _ => None,
        })
        .collect();
    assert!(statuses.contains(&PlayerStatus::Playing));
    assert!(
        statuses.iter().position(|s| *s == PlayerStatus::Buffering)
            < statuses.iter().position(|s| *s == PlayerStatus::Playing)
    );

    // At most once per logical change: no consecutive duplicates.
    for pair in events.windows(2) {
        assert_ne!(pair[0], pair[1], "duplicate consecutive event delivered");
    }
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test]
async fn replay_from_full_cache_touches_no_network() {
    let state = VideoState::new(BODY_LEN);
    let server = Server::start(state.clone()).await;
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);

    {
        let session = coordinator
            .play(server.url.clone(), play_options())
            .await
            .unwrap();
        let waiter = session.clone();
        wait_until(move || waiter.fraction_complete() >= 1.0).await;
        coordinator.stop(&session);
    }
    wait_for_idle_store(&coordinator).await;

    let hits_before = state.get_hits.load(Ordering::SeqCst);

    let session = coordinator
        .play(server.url.clone(), play_options())
        .await
        .unwrap();
    session.advance_to(0);

    assert!(matches!(
        session.readiness(),
        Readiness::Ready(CacheType::Disk)
    ));

    let bytes = session.read(0..BODY_LEN).await.unwrap();
    assert_eq!(&bytes[..], &state.body[..]);
    assert_eq!(state.get_hits.load(Ordering::SeqCst), hits_before);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test]
async fn offline_playback_from_complete_cache() {
    let state = VideoState::new(BODY_LEN);
    let mut server = Server::start(state.clone()).await;
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);
    let url = server.url.clone();

    {
        let session = coordinator.play(url.clone(), play_options()).await.unwrap();
        let waiter = session.clone();
        wait_until(move || waiter.fraction_complete() >= 1.0).await;
        coordinator.stop(&session);
    }
    wait_for_idle_store(&coordinator).await;

    // Network gone: the HEAD probe fails, playback runs from disk.
    server.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let session = coordinator.play(url, play_options()).await.unwrap();
    session.advance_to(0);
    assert!(matches!(
        session.readiness(),
        Readiness::Ready(CacheType::Disk)
    ));
    assert_eq!(session.read(0..1_024).await.unwrap().len(), 1_024);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test]
async fn offline_miss_surfaces_network_error() {
    let state = VideoState::new(BODY_LEN);
    let mut server = Server::start(state.clone()).await;
    let url = server.url.clone();
    server.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);

    let err = coordinator.play(url, play_options()).await.unwrap_err();
    assert!(matches!(err, PlayerError::Net(_)));
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test]
async fn download_veto_blocks_cache_miss_but_not_cached_playback() {
    let state = VideoState::new(BODY_LEN);
    let server = Server::start(state.clone()).await;
    let dir = TempDir::new().unwrap();

    // First: a denying hook with an empty cache fails the play call.
    {
        let coordinator =
            coordinator_with_hooks(&dir, PolicyHooks::new().with_should_download(|_| false));
        let err = coordinator
            .play(server.url.clone(), play_options())
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::DownloadDeclined(_)));
    }

    // Fill the cache with a permissive coordinator.
    {
        let coordinator = coordinator(&dir);
        let session = coordinator
            .play(server.url.clone(), play_options())
            .await
            .unwrap();
        let waiter = session.clone();
        wait_until(move || waiter.fraction_complete() >= 1.0).await;
        coordinator.stop(&session);
        wait_for_idle_store(&coordinator).await;
    }

    // Fully cached: the denying hook no longer blocks playback.
    let coordinator =
        coordinator_with_hooks(&dir, PolicyHooks::new().with_should_download(|_| false));
    let session = coordinator
        .play(server.url.clone(), play_options())
        .await
        .unwrap();
    session.advance_to(0);
    assert!(matches!(
        session.readiness(),
        Readiness::Ready(CacheType::Disk)
    ));
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test]
async fn auto_replay_honors_policy_veto() {
    let state = VideoState::new(BODY_LEN);
    let server = Server::start(state.clone()).await;
    let dir = TempDir::new().unwrap();

    // Vetoed: finishing stays Finished.
    {
        let coordinator =
            coordinator_with_hooks(&dir, PolicyHooks::new().with_should_auto_replay(|_| false));
        let session = coordinator
            .play(server.url.clone(), play_options().with_auto_replay(true))
            .await
            .unwrap();
        let waiter = session.clone();
        wait_until(move || waiter.fraction_complete() >= 1.0).await;

        session.advance_to(BODY_LEN);
        assert_eq!(session.status(), PlayerStatus::Finished);
        coordinator.stop(&session);
        wait_for_idle_store(&coordinator).await;
    }

    // Permitted (default): finishing restarts from offset zero.
    let coordinator = coordinator(&dir);
    let session = coordinator
        .play(server.url.clone(), play_options().with_auto_replay(true))
        .await
        .unwrap();
    let waiter = session.clone();
    wait_until(move || waiter.fraction_complete() >= 1.0).await;

    session.advance_to(BODY_LEN);
    assert_eq!(session.status(), PlayerStatus::Playing);
    let bytes = session.read(0..1_024).await.unwrap();
    assert_eq!(bytes.len(), 1_024);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test]
async fn joining_live_session_shares_state_and_reports_memory() {
    let state = VideoState::new(BODY_LEN);
    let server = Server::start(state.clone()).await;
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);

    let first = coordinator
        .play(server.url.clone(), play_options())
        .await
        .unwrap();
    let mut rx = first.subscribe();

    let second = coordinator
        .play(server.url.clone(), play_options())
        .await
        .unwrap();
    assert_eq!(first.cache_key(), second.cache_key());

    // Nudge delivery and look for the join event.
    first.report_playback_clock(0.0, 0.0);
    let mut saw_memory = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline && !saw_memory {
        match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Ok(PlayerEvent::DownloadProgress {
                cache_type: CacheType::Memory,
                ..
            })) => saw_memory = true,
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }
    assert!(saw_memory, "join must report a Memory cache hit");

    // Both handles observe the same coverage.
    {
        let second = second.clone();
        wait_until(move || second.fraction_complete() >= 1.0).await;
    }
    assert_eq!(first.fraction_complete(), 1.0);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test]
async fn terminal_fetch_failure_surfaces_once_then_stops() {
    let state = VideoState::new(BODY_LEN);
    state.not_found.store(true, Ordering::SeqCst);
    let server = Server::start(state.clone()).await;
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);

    let session = coordinator
        .play(server.url.clone(), play_options())
        .await
        .unwrap();
    let mut rx = session.subscribe();
    session.advance_to(0);

    {
        let session = session.clone();
        wait_until(move || session.status() == PlayerStatus::Stopped).await;
    }
    assert!(matches!(session.readiness(), Readiness::Error(_)));
    assert!(matches!(
        session.read(0..16).await.unwrap_err(),
        PlayerError::SessionStopped
    ));

    // Exactly one progress event carries the error.
    session.report_playback_clock(0.0, 0.0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut error_events = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(
            event,
            PlayerEvent::DownloadProgress { error: Some(_), .. }
        ) {
            error_events += 1;
        }
    }
    assert_eq!(error_events, 1);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test]
async fn lifecycle_pause_and_resume_apply_policy() {
    let state = VideoState::new(BODY_LEN);
    let server = Server::start(state.clone()).await;
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);

    let session = coordinator
        .play(server.url.clone(), play_options())
        .await
        .unwrap();
    session.advance_to(0);

    coordinator.on_pause();
    assert_eq!(session.status(), PlayerStatus::Paused);

    coordinator.on_resume();
    assert_ne!(session.status(), PlayerStatus::Paused);

    coordinator.stop(&session);
    wait_for_idle_store(&coordinator).await;

    // A vetoing pause policy leaves the session running.
    let coordinator = coordinator_with_hooks(
        &dir,
        PolicyHooks::new().with_should_pause_on_lifecycle(|_| false),
    );
    let session = coordinator
        .play(server.url.clone(), play_options())
        .await
        .unwrap();
    session.advance_to(0);
    {
        let session = session.clone();
        wait_until(move || session.status() == PlayerStatus::Playing).await;
    }
    coordinator.on_pause();
    assert_eq!(session.status(), PlayerStatus::Playing);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test]
async fn seek_into_uncached_region_buffers_then_recovers() {
    let state = VideoState::new(1_000_000);
    let server = Server::start(state.clone()).await;
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);

    let session = coordinator
        .play(server.url.clone(), play_options())
        .await
        .unwrap();

    // Jump straight into the tail with nothing cached there.
    session.advance_to(900_000);
    assert!(matches!(session.readiness(), Readiness::Buffering(_)));

    session.wait_range(900_000..916_384).await.unwrap();
    assert!(matches!(session.readiness(), Readiness::Ready(_)));

    let bytes = session.read(900_000..900_100).await.unwrap();
    assert_eq!(&bytes[..], &state.body[900_000..900_100]);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test]
async fn ignoring_cache_restarts_from_scratch() {
    let state = VideoState::new(BODY_LEN);
    let server = Server::start(state.clone()).await;
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&dir);

    {
        let session = coordinator
            .play(server.url.clone(), play_options())
            .await
            .unwrap();
        let waiter = session.clone();
        wait_until(move || waiter.fraction_complete() >= 1.0).await;
        coordinator.stop(&session);
        wait_for_idle_store(&coordinator).await;
    }

    let hits_before = state.get_hits.load(Ordering::SeqCst);
    let session = coordinator
        .play(
            server.url.clone(),
            play_options().with_use_cache_if_present(false),
        )
        .await
        .unwrap();

    // Cache was reset; the fetcher has to go back to the network.
    {
        let session = session.clone();
        wait_until(move || session.fraction_complete() >= 1.0).await;
    }
    assert!(state.get_hits.load(Ordering::SeqCst) > hits_before);
}
