mod session;

pub use session::{BufferSession, PlaybackStatus, SessionState, Step};

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::select;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PlaybackOptions;
use crate::error::SessionError;
use crate::events::{AssetRef, Endpoint, PlaybackLocator, PlayerEvent, PlayerOptions};
use crate::source::{ContentFetcher, Player, PlayerControl, PlayerSession};
use crate::tasks::slideshow::{Coordinator, PipelineId};

#[derive(Debug)]
pub enum PlaybackCommand {
    Load,
    Retry,
    RetryWithFallback,
    Play,
    Pause,
    Seek(Duration),
    Cleanup { ack: oneshot::Sender<()> },
}

/// Collaborators and policy for one video pipeline.
#[derive(Clone)]
pub struct PlaybackServices {
    pub fetcher: Arc<dyn ContentFetcher>,
    pub player: Arc<dyn Player>,
    pub options: PlaybackOptions,
    /// Presentation focus claimed while the video plays.
    pub focus: Option<(Coordinator, PipelineId)>,
}

enum Attempt {
    Verified(PlaybackLocator),
    Opened(PlayerSession),
}

type AttemptResult = (u64, Result<Attempt, SessionError>);

/// Timers scoped to the live session; dropping them stops them.
#[derive(Default)]
struct SessionTimers {
    stall: Option<Interval>,
    resume: Option<Interval>,
    rate: Option<Interval>,
    deadline: Option<Pin<Box<Sleep>>>,
}

struct Controller {
    services: PlaybackServices,
    asset: AssetRef,
    session: BufferSession,
    attempt_id: u64,
    attempts: JoinSet<AttemptResult>,
    control: Option<Box<dyn PlayerControl>>,
    telemetry: Option<Receiver<PlayerEvent>>,
    timers: SessionTimers,
    status: watch::Sender<PlaybackStatus>,
}

/// Owns the buffer session for one video asset.
///
/// Rules:
/// - Session state only changes on this task; player telemetry, timer ticks and endpoint
///   verification results are all delivered here.
/// - Verification and player construction run in a `JoinSet` tagged with an attempt id;
///   completions from a superseded attempt are discarded.
/// - Teardown (cleanup, retry, fallback, shutdown) aborts attempts, shuts the player down,
///   drops the telemetry subscription and every session timer before returning.
#[instrument(skip_all, fields(asset = %asset.id))]
pub async fn run(
    services: PlaybackServices,
    asset: AssetRef,
    mut commands: Receiver<PlaybackCommand>,
    status: watch::Sender<PlaybackStatus>,
    cancel: CancellationToken,
) -> Result<()> {
    let session = BufferSession::new(services.options.clone());
    let mut ctl = Controller {
        services,
        asset,
        session,
        attempt_id: 0,
        attempts: JoinSet::new(),
        control: None,
        telemetry: None,
        timers: SessionTimers::default(),
        status,
    };

    loop {
        select! {
            _ = cancel.cancelled() => {
                debug!("cancel received; exiting playback task");
                break;
            }

            maybe_cmd = commands.recv() => {
                let Some(cmd) = maybe_cmd else {
                    debug!("playback handle dropped; exiting");
                    break;
                };
                ctl.on_command(cmd);
            }

            Some(joined) = ctl.attempts.join_next() => ctl.on_attempt(joined),

            event = next_event(&mut ctl.telemetry) => ctl.on_player_event(event),

            _ = tick(&mut ctl.timers.stall) => {
                let step = ctl.session.stall_check();
                ctl.apply(step);
            }

            _ = tick(&mut ctl.timers.resume) => {
                let step = ctl.session.resume_check();
                ctl.apply(step);
            }

            _ = tick(&mut ctl.timers.rate) => {
                let step = ctl.session.rate_check();
                ctl.apply(step);
            }

            _ = expire(&mut ctl.timers.deadline) => {
                ctl.timers.deadline = None;
                let step = ctl.session.connection_timeout();
                ctl.apply(step);
            }
        }
        ctl.sync_timers();
        ctl.publish();
    }

    ctl.teardown();
    ctl.session.cleanup();
    ctl.publish();
    Ok(())
}

impl Controller {
    fn on_command(&mut self, cmd: PlaybackCommand) {
        match cmd {
            PlaybackCommand::Load => {
                if self.session.state().is_active() {
                    debug!(state = ?self.session.state(), "load ignored; session already running");
                    return;
                }
                self.begin(Endpoint::Primary);
            }
            PlaybackCommand::Retry => self.begin(Endpoint::Primary),
            PlaybackCommand::RetryWithFallback => self.begin(Endpoint::Fallback),
            PlaybackCommand::Play => {
                if self.session.play() {
                    self.apply(Step::Play);
                }
            }
            PlaybackCommand::Pause => {
                self.session.pause();
                if let Some(control) = self.control.as_mut() {
                    control.pause();
                }
            }
            PlaybackCommand::Seek(to) => {
                self.session.seek();
                if let Some(control) = self.control.as_mut() {
                    control.seek(to);
                }
            }
            PlaybackCommand::Cleanup { ack } => {
                self.teardown();
                self.session.cleanup();
                self.sync_timers();
                self.publish();
                let _ = ack.send(());
            }
        }
    }

    /// Start a new session from scratch against `endpoint`.
    fn begin(&mut self, endpoint: Endpoint) {
        self.teardown();
        info!(endpoint = %endpoint, "loading video");
        self.session.begin(endpoint);
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        self.attempt_id += 1;
        let id = self.attempt_id;
        let endpoint = self.session.endpoint();
        let fetcher = Arc::clone(&self.services.fetcher);
        let player = Arc::clone(&self.services.player);
        let asset = self.asset.clone();
        self.attempts.spawn(async move {
            let result = verify(fetcher.as_ref(), player.as_ref(), &asset, endpoint).await;
            (id, result.map(Attempt::Verified))
        });
        self.timers.deadline = Some(Box::pin(sleep(
            self.services.options.initial_connection_timeout,
        )));
    }

    fn on_attempt(&mut self, joined: Result<AttemptResult, JoinError>) {
        let (id, result) = match joined {
            Ok(done) => done,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                error!("playback attempt task failed: {err}");
                return;
            }
        };
        if id != self.attempt_id {
            debug!(id, current = self.attempt_id, "discarding superseded attempt");
            return;
        }
        match result {
            Ok(Attempt::Verified(locator)) => {
                self.session.verified();
                let options = PlayerOptions {
                    forward_buffer: self.services.options.forward_buffer,
                    network_resilient: true,
                };
                let endpoint = self.session.endpoint();
                let player = Arc::clone(&self.services.player);
                self.attempts.spawn(async move {
                    let opened = player.open(&locator, &options).await.map_err(|err| {
                        SessionError::LoadFailed {
                            endpoint,
                            reason: err.to_string(),
                        }
                    });
                    (id, opened.map(Attempt::Opened))
                });
            }
            Ok(Attempt::Opened(player)) => {
                debug!("player constructed; observing telemetry");
                self.control = Some(player.control);
                self.telemetry = Some(player.telemetry);
            }
            Err(err) => {
                let step = self.session.failure(err);
                self.apply(step);
            }
        }
    }

    fn on_player_event(&mut self, event: Option<PlayerEvent>) {
        let step = match event {
            Some(PlayerEvent::Ready) => self.session.player_ready(),
            Some(PlayerEvent::Telemetry(telemetry)) => self.session.on_telemetry(&telemetry),
            Some(PlayerEvent::Stalled) => self.session.on_stalled(),
            Some(PlayerEvent::EndOfMedia) => self.session.on_end_of_media(),
            Some(PlayerEvent::Failed(reason)) => {
                self.session.failure(SessionError::Playback(reason))
            }
            None => {
                warn!("player telemetry ended unexpectedly");
                self.telemetry = None;
                self.session
                    .failure(SessionError::Playback("player went away".to_owned()))
            }
        };
        self.apply(step);
    }

    fn apply(&mut self, step: Step) {
        match step {
            Step::Nothing => {}
            Step::Play => {
                if let Some(control) = self.control.as_mut() {
                    control.play();
                }
                self.claim_focus();
            }
            Step::Pause => {
                if let Some(control) = self.control.as_mut() {
                    control.pause();
                }
            }
            Step::Fallback(cause) => {
                self.teardown();
                if self.session.begin_fallback(cause) {
                    self.start_attempt();
                }
            }
            Step::Fail(err) => {
                error!(error = %err, "playback failed");
                self.teardown();
            }
            Step::Complete => {
                info!("playback completed");
                self.teardown();
            }
        }
    }

    /// Stop everything tied to the current attempt. Idempotent.
    fn teardown(&mut self) {
        self.attempt_id += 1;
        self.attempts.abort_all();
        if let Some(mut control) = self.control.take() {
            control.shutdown();
        }
        self.telemetry = None;
        self.timers = SessionTimers::default();
        self.release_focus();
    }

    fn sync_timers(&mut self) {
        let state = self.session.state();
        let options = &self.services.options;
        keep_interval(
            &mut self.timers.stall,
            state.is_buffering(),
            options.stall_check_interval,
        );
        keep_interval(
            &mut self.timers.resume,
            state == SessionState::Recovering,
            options.resume_retry_interval,
        );
        keep_interval(
            &mut self.timers.rate,
            state == SessionState::Playing,
            options.rate_monitor_interval,
        );
        if !state.is_connecting() {
            self.timers.deadline = None;
        }
    }

    fn claim_focus(&self) {
        if let Some((coordinator, id)) = &self.services.focus {
            coordinator.claim(*id);
        }
    }

    fn release_focus(&self) {
        if let Some((coordinator, id)) = &self.services.focus {
            coordinator.release(*id);
        }
    }

    fn publish(&self) {
        let next = self.session.status();
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn verify(
    fetcher: &dyn ContentFetcher,
    player: &dyn Player,
    asset: &AssetRef,
    endpoint: Endpoint,
) -> Result<PlaybackLocator, SessionError> {
    let use_fallback = endpoint == Endpoint::Fallback;
    let verification_failed = |err: crate::error::FetchError| SessionError::VerificationFailed {
        endpoint,
        reason: err.to_string(),
    };
    let locator = fetcher
        .resolve_playback_locator(asset, use_fallback)
        .await
        .map_err(verification_failed)?;
    let playability = player
        .verify_playable(&locator)
        .await
        .map_err(verification_failed)?;
    if !playability.is_playable {
        return Err(SessionError::NotPlayable { endpoint });
    }
    debug!(endpoint = %endpoint, duration = ?playability.duration, "stream verified");
    Ok(locator)
}

fn keep_interval(slot: &mut Option<Interval>, wanted: bool, period: Duration) {
    match (wanted, slot.is_some()) {
        (true, false) => {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            *slot = Some(interval);
        }
        (false, true) => *slot = None,
        _ => {}
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(deadline) => deadline.as_mut().await,
        None => pending().await,
    }
}

async fn next_event(telemetry: &mut Option<Receiver<PlayerEvent>>) -> Option<PlayerEvent> {
    match telemetry {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

/// Consumer-side handle to a running playback pipeline.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    commands: Sender<PlaybackCommand>,
    status: watch::Receiver<PlaybackStatus>,
}

impl PlaybackHandle {
    pub fn spawn(
        services: PlaybackServices,
        asset: AssetRef,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<Result<()>>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(PlaybackStatus::default());
        let task = tokio::spawn(run(services, asset, cmd_rx, status_tx, cancel));
        (
            Self {
                commands: cmd_tx,
                status: status_rx,
            },
            task,
        )
    }

    async fn send(&self, cmd: PlaybackCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| anyhow!("playback pipeline stopped"))
    }

    pub async fn load(&self) -> Result<()> {
        self.send(PlaybackCommand::Load).await
    }

    /// Restart from the primary endpoint with a fresh fallback allowance.
    pub async fn retry(&self) -> Result<()> {
        self.send(PlaybackCommand::Retry).await
    }

    /// Restart directly against the alternate endpoint.
    pub async fn retry_with_fallback(&self) -> Result<()> {
        self.send(PlaybackCommand::RetryWithFallback).await
    }

    pub async fn play(&self) -> Result<()> {
        self.send(PlaybackCommand::Play).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(PlaybackCommand::Pause).await
    }

    pub async fn seek(&self, to: Duration) -> Result<()> {
        self.send(PlaybackCommand::Seek(to)).await
    }

    /// Tear the session down. Idempotent; a no-op once the pipeline has stopped.
    pub async fn cleanup(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(PlaybackCommand::Cleanup { ack }).await.is_ok() {
            let _ = done.await;
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    /// Wait until a published status satisfies `pred`.
    pub async fn wait_for(
        &self,
        pred: impl FnMut(&PlaybackStatus) -> bool,
    ) -> Result<PlaybackStatus> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(pred)
            .await
            .map_err(|_| anyhow!("playback pipeline stopped"))?;
        Ok((*status).clone())
    }
}
