use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_media_delivery::config::PlaybackOptions;
use rust_media_delivery::error::FetchError;
use rust_media_delivery::events::{
    AssetRef, DecodedImage, Endpoint, Playability, PlaybackLocator, PlayerEvent, PlayerOptions,
    PlayerTelemetry, TimeRange,
};
use rust_media_delivery::source::{ContentFetcher, Player, PlayerControl, PlayerSession};
use rust_media_delivery::tasks::playback::{
    PlaybackHandle, PlaybackServices, PlaybackStatus, SessionState,
};
use rust_media_delivery::tasks::slideshow::{Coordinator, PipelineId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const VIDEO: PipelineId = PipelineId(9);

#[derive(Debug, Clone, Copy)]
enum Verify {
    Playable,
    Unplayable,
    Fail(&'static str),
    Hang,
}

struct FakeFetcher;

#[async_trait]
impl ContentFetcher for FakeFetcher {
    async fn decode_image(&self, _asset: &AssetRef) -> Result<DecodedImage, FetchError> {
        Err(FetchError::Decode("videos only".into()))
    }

    async fn resolve_playback_locator(
        &self,
        asset: &AssetRef,
        use_fallback: bool,
    ) -> Result<PlaybackLocator, FetchError> {
        let scheme = if use_fallback { "fallback" } else { "primary" };
        Ok(PlaybackLocator {
            url: format!("{scheme}://{}", asset.id),
            headers: vec![("x-api-key".into(), "secret".into())],
        })
    }
}

/// A player instance handed out by `FakePlayer::open`.
struct Opened {
    url: String,
    options: PlayerOptions,
    events: mpsc::Sender<PlayerEvent>,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Opened {
    async fn emit(&self, event: PlayerEvent) {
        self.events.send(event).await.expect("session listening");
    }

    fn calls(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }
}

struct FakePlayer {
    verify: Mutex<HashMap<&'static str, Verify>>,
    opened: mpsc::UnboundedSender<Opened>,
}

impl FakePlayer {
    fn script(&self, scheme: &'static str, behavior: Verify) {
        self.verify.lock().unwrap().insert(scheme, behavior);
    }
}

#[async_trait]
impl Player for FakePlayer {
    async fn verify_playable(&self, locator: &PlaybackLocator) -> Result<Playability, FetchError> {
        let scheme = locator.url.split("://").next().unwrap_or_default();
        let behavior = self
            .verify
            .lock()
            .unwrap()
            .get(scheme)
            .copied()
            .unwrap_or(Verify::Playable);
        match behavior {
            Verify::Playable => Ok(Playability {
                is_playable: true,
                duration: Some(Duration::from_secs(60)),
            }),
            Verify::Unplayable => Ok(Playability {
                is_playable: false,
                duration: None,
            }),
            Verify::Fail(reason) => Err(FetchError::Network(reason.into())),
            Verify::Hang => std::future::pending().await,
        }
    }

    async fn open(
        &self,
        locator: &PlaybackLocator,
        options: &PlayerOptions,
    ) -> Result<PlayerSession, FetchError> {
        let (events, telemetry) = mpsc::channel(32);
        let log = Arc::new(Mutex::new(Vec::new()));
        let _ = self.opened.send(Opened {
            url: locator.url.clone(),
            options: *options,
            events,
            log: log.clone(),
        });
        Ok(PlayerSession {
            control: Box::new(FakeControl { log }),
            telemetry,
        })
    }
}

struct FakeControl {
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl PlayerControl for FakeControl {
    fn play(&mut self) {
        self.log.lock().unwrap().push("play");
    }

    fn pause(&mut self) {
        self.log.lock().unwrap().push("pause");
    }

    fn seek(&mut self, _to: Duration) {
        self.log.lock().unwrap().push("seek");
    }

    fn shutdown(&mut self) {
        self.log.lock().unwrap().push("shutdown");
    }
}

struct Harness {
    handle: PlaybackHandle,
    player: Arc<FakePlayer>,
    opened: mpsc::UnboundedReceiver<Opened>,
    coordinator: Coordinator,
    _cancel: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        let (opened_tx, opened) = mpsc::unbounded_channel();
        let player = Arc::new(FakePlayer {
            verify: Mutex::new(HashMap::new()),
            opened: opened_tx,
        });
        let coordinator = Coordinator::new();
        let cancel = CancellationToken::new();
        let services = PlaybackServices {
            fetcher: Arc::new(FakeFetcher),
            player: player.clone(),
            options: PlaybackOptions::default(),
            focus: Some((coordinator.clone(), VIDEO)),
        };
        let (handle, _task) =
            PlaybackHandle::spawn(services, AssetRef::video("clip", 0), cancel.clone());
        Self {
            handle,
            player,
            opened,
            coordinator,
            _cancel: cancel,
        }
    }

    async fn next_player(&mut self) -> Opened {
        self.opened.recv().await.expect("player opened")
    }

    async fn reach(&self, state: SessionState) -> PlaybackStatus {
        self.handle
            .wait_for(|s| s.state == state)
            .await
            .expect("playback task running")
    }
}

fn buffered(secs: f64, rate: f32) -> PlayerEvent {
    PlayerEvent::Telemetry(PlayerTelemetry {
        buffered: vec![TimeRange {
            start: 0.0,
            duration: secs,
        }],
        position: 0.0,
        rate,
        ..Default::default()
    })
}

async fn start_playing(harness: &mut Harness) -> Opened {
    harness.handle.load().await.unwrap();
    let player = harness.next_player().await;
    player.emit(buffered(6.0, 0.0)).await;
    player.emit(PlayerEvent::Ready).await;
    harness.reach(SessionState::Playing).await;
    player
}

#[tokio::test(start_paused = true)]
async fn plays_once_start_threshold_is_buffered() {
    let mut harness = Harness::new();
    harness.handle.load().await.unwrap();
    let player = harness.next_player().await;
    assert_eq!(player.url, "primary://clip");
    assert_eq!(player.options.forward_buffer, Duration::from_secs(30));
    assert!(player.options.network_resilient);

    player.emit(buffered(2.0, 0.0)).await;
    player.emit(PlayerEvent::Ready).await;
    let waiting = harness.reach(SessionState::WaitingForInitialBuffer).await;
    assert!(waiting.is_loading);
    assert!(waiting.is_buffering);
    assert_eq!(waiting.buffer_status, "Building buffer: 2s");
    assert_eq!(waiting.buffer_percentage, 40);

    player.emit(buffered(5.0, 0.0)).await;
    let playing = harness.reach(SessionState::Playing).await;
    assert!(!playing.is_loading);
    assert_eq!(playing.endpoint, Some(Endpoint::Primary));
    assert!(!playing.fallback_attempted);
    assert_eq!(player.calls(), ["play"]);
    assert_eq!(harness.coordinator.holder(), Some(VIDEO));
}

#[tokio::test(start_paused = true)]
async fn failed_primary_verification_falls_back() {
    let mut harness = Harness::new();
    harness
        .player
        .script("primary", Verify::Fail("HTTP 401 unauthorized"));

    harness.handle.load().await.unwrap();
    let player = harness.next_player().await;
    assert_eq!(player.url, "fallback://clip");

    player.emit(buffered(6.0, 0.0)).await;
    player.emit(PlayerEvent::Ready).await;
    let status = harness.reach(SessionState::Playing).await;
    assert_eq!(status.endpoint, Some(Endpoint::Fallback));
    assert!(status.fallback_attempted);
    assert_eq!(status.error_message, None);
}

#[tokio::test(start_paused = true)]
async fn flat_buffer_switches_endpoint_after_five_checks() {
    let mut harness = Harness::new();
    harness.handle.load().await.unwrap();
    let primary = harness.next_player().await;
    primary.emit(PlayerEvent::Ready).await;
    harness.reach(SessionState::WaitingForInitialBuffer).await;
    let waiting_since = Instant::now();

    let fallback = harness.next_player().await;
    let waited = waiting_since.elapsed();
    assert_eq!(fallback.url, "fallback://clip");
    assert!(waited >= Duration::from_secs(10), "switched after {waited:?}");
    assert!(waited < Duration::from_secs(11), "switched after {waited:?}");
    assert_eq!(primary.calls(), ["shutdown"]);
    assert!(primary.events.is_closed());
}

#[tokio::test(start_paused = true)]
async fn second_failure_is_terminal() {
    let mut harness = Harness::new();
    harness.handle.load().await.unwrap();
    let primary = harness.next_player().await;
    primary.emit(PlayerEvent::Ready).await;
    let fallback = harness.next_player().await;
    fallback.emit(PlayerEvent::Ready).await;

    let failed = harness.reach(SessionState::Failed).await;
    assert!(!failed.is_loading);
    assert!(!failed.is_buffering);
    assert!(failed.buffer_status.is_empty());
    assert!(failed.fallback_attempted);
    assert!(!failed.suggest_fallback_retry);
    let message = failed.error_message.expect("error message");
    assert!(message.contains("stalled"), "{message}");
    assert_eq!(fallback.calls(), ["shutdown"]);
    assert_eq!(harness.coordinator.holder(), None);
}

#[tokio::test(start_paused = true)]
async fn auth_failures_on_both_endpoints_suggest_fallback_retry() {
    let mut harness = Harness::new();
    harness.player.script("primary", Verify::Fail("HTTP 403"));
    harness.player.script("fallback", Verify::Fail("HTTP 401"));
    harness.handle.load().await.unwrap();

    let failed = harness.reach(SessionState::Failed).await;
    assert!(failed.suggest_fallback_retry);
    assert_eq!(failed.endpoint, Some(Endpoint::Fallback));
    assert!(harness.opened.try_recv().is_err(), "no player constructed");
}

#[tokio::test(start_paused = true)]
async fn unplayable_stream_uses_the_fallback() {
    let mut harness = Harness::new();
    harness.player.script("primary", Verify::Unplayable);
    harness.handle.load().await.unwrap();
    let player = harness.next_player().await;
    assert_eq!(player.url, "fallback://clip");
}

#[tokio::test(start_paused = true)]
async fn connection_timeout_is_terminal() {
    let mut harness = Harness::new();
    harness.player.script("primary", Verify::Hang);
    let started = Instant::now();
    harness.handle.load().await.unwrap();

    let failed = harness.reach(SessionState::Failed).await;
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(!failed.fallback_attempted);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("timed out after 30s waiting for the stream to start")
    );
}

#[tokio::test(start_paused = true)]
async fn unrequested_stop_recovers_at_resume_threshold() {
    let mut harness = Harness::new();
    let player = start_playing(&mut harness).await;

    player.emit(buffered(6.0, 0.0)).await;
    let recovering = harness.reach(SessionState::Recovering).await;
    assert_eq!(recovering.buffer_status, "Buffering: 6s / 10s");
    assert_eq!(recovering.buffer_percentage, 60);

    player.emit(buffered(9.9, 0.0)).await;
    player.emit(buffered(10.0, 0.0)).await;
    harness.reach(SessionState::Playing).await;
    assert_eq!(player.calls(), ["play", "pause", "play"]);
}

#[tokio::test(start_paused = true)]
async fn user_pause_is_not_treated_as_a_stall() {
    let mut harness = Harness::new();
    let player = start_playing(&mut harness).await;

    harness.handle.pause().await.unwrap();
    player.emit(buffered(8.0, 0.0)).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.handle.status().state, SessionState::Playing);
    assert_eq!(player.calls(), ["play", "pause"]);

    harness.handle.play().await.unwrap();
    harness.handle.seek(Duration::from_secs(12)).await.unwrap();
    player.emit(buffered(8.0, 1.0)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(player.calls(), ["play", "pause", "play", "seek"]);
}

#[tokio::test(start_paused = true)]
async fn end_of_media_completes_and_releases_focus() {
    let mut harness = Harness::new();
    let player = start_playing(&mut harness).await;
    assert_eq!(harness.coordinator.holder(), Some(VIDEO));

    player.emit(PlayerEvent::EndOfMedia).await;
    let done = harness.reach(SessionState::Completed).await;
    assert!(done.error_message.is_none());
    assert_eq!(player.calls(), ["play", "shutdown"]);
    assert_eq!(harness.coordinator.holder(), None);
}

#[tokio::test(start_paused = true)]
async fn player_failure_falls_back_once() {
    let mut harness = Harness::new();
    let primary = start_playing(&mut harness).await;

    primary
        .emit(PlayerEvent::Failed("decoder crashed".into()))
        .await;
    let fallback = harness.next_player().await;
    assert_eq!(fallback.url, "fallback://clip");
    assert_eq!(primary.calls(), ["play", "shutdown"]);
}

#[tokio::test(start_paused = true)]
async fn cleanup_is_idempotent() {
    let mut harness = Harness::new();
    let player = start_playing(&mut harness).await;

    harness.handle.cleanup().await;
    harness.handle.cleanup().await;
    let status = harness.handle.status();
    assert_eq!(status.state, SessionState::Idle);
    assert_eq!(status.endpoint, None);
    assert!(!status.is_loading);
    assert_eq!(player.calls(), ["play", "shutdown"]);
    assert!(player.events.is_closed());
    assert_eq!(harness.coordinator.holder(), None);

    // no timers survive the teardown
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(harness.handle.status().state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn retry_starts_over_with_a_fresh_fallback() {
    let mut harness = Harness::new();
    harness.player.script("primary", Verify::Fail("refused"));
    harness.player.script("fallback", Verify::Fail("refused"));
    harness.handle.load().await.unwrap();
    harness.reach(SessionState::Failed).await;

    harness.player.script("primary", Verify::Playable);
    harness.handle.retry().await.unwrap();
    let player = harness.next_player().await;
    assert_eq!(player.url, "primary://clip");
    let status = harness.handle.wait_for(|s| s.state == SessionState::Loading).await.unwrap();
    assert!(!status.fallback_attempted);
    assert!(status.error_message.is_none());
}

#[tokio::test(start_paused = true)]
async fn retry_with_fallback_skips_the_primary() {
    let mut harness = Harness::new();
    harness.player.script("primary", Verify::Fail("HTTP 401"));
    harness.player.script("fallback", Verify::Fail("HTTP 401"));
    harness.handle.load().await.unwrap();
    let failed = harness.reach(SessionState::Failed).await;
    assert!(failed.suggest_fallback_retry);

    harness.player.script("fallback", Verify::Playable);
    harness.handle.retry_with_fallback().await.unwrap();
    let player = harness.next_player().await;
    assert_eq!(player.url, "fallback://clip");

    // the fallback is spent: one more failure ends the session
    player.emit(PlayerEvent::Failed("lost".into())).await;
    let failed = harness.reach(SessionState::Failed).await;
    assert_eq!(failed.error_message.as_deref(), Some("playback error: lost"));
}
