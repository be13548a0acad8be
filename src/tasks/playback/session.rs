use tracing::{debug, info, warn};

use crate::config::PlaybackOptions;
use crate::error::SessionError;
use crate::events::{Endpoint, PlayerTelemetry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Verifying,
    Loading,
    WaitingForInitialBuffer,
    Playing,
    Recovering,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != Self::Idle
    }

    /// States covered by the initial-connection timeout.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Verifying | Self::Loading | Self::WaitingForInitialBuffer
        )
    }

    pub fn is_buffering(self) -> bool {
        matches!(self, Self::WaitingForInitialBuffer | Self::Recovering)
    }
}

/// What the owning task has to do with the player after a session decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Nothing,
    Play,
    Pause,
    /// Tear down the player and restart against the alternate endpoint.
    Fallback(SessionError),
    Fail(SessionError),
    Complete,
}

/// Observable state of a playback session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackStatus {
    pub state: SessionState,
    pub is_loading: bool,
    pub is_buffering: bool,
    pub buffer_status: String,
    pub buffer_percentage: u8,
    pub error_message: Option<String>,
    /// The failure looks authentication related; offer a direct fallback retry.
    pub suggest_fallback_retry: bool,
    pub endpoint: Option<Endpoint>,
    pub fallback_attempted: bool,
}

/// One playback attempt's worth of buffering state.
///
/// Rules:
/// - Start when buffered-ahead reaches the start threshold OR the player says it is likely to
///   keep up.
/// - Resume from a stall when buffered-ahead reaches the (higher) resume threshold OR the
///   buffer is full OR the player says it is likely to keep up. The hint bypasses the
///   resume hysteresis: a stall entered with 2s buffered resumes on the first hinted reading.
/// - A rate reading taken before a user play/pause is discarded, so a user resume is never
///   mistaken for a stall.
/// - `max_buffer_stall_checks` consecutive flat stall checks make a hard stall.
/// - At most one fallback per session; the second failure of any kind is terminal.
#[derive(Debug)]
pub struct BufferSession {
    options: PlaybackOptions,
    state: SessionState,
    endpoint: Endpoint,
    fallback_attempted: bool,
    buffered_ahead: f64,
    stall_baseline: f64,
    stall_count: u32,
    resume_retries: u32,
    likely_to_keep_up: bool,
    buffer_empty: bool,
    buffer_full: bool,
    rate: Option<f32>,
    should_be_playing: bool,
    progress_observed: bool,
    error: Option<SessionError>,
}

impl BufferSession {
    pub fn new(options: PlaybackOptions) -> Self {
        Self {
            options,
            state: SessionState::Idle,
            endpoint: Endpoint::Primary,
            fallback_attempted: false,
            buffered_ahead: 0.0,
            stall_baseline: 0.0,
            stall_count: 0,
            resume_retries: 0,
            likely_to_keep_up: false,
            buffer_empty: false,
            buffer_full: false,
            rate: None,
            should_be_playing: false,
            progress_observed: false,
            error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn fallback_attempted(&self) -> bool {
        self.fallback_attempted
    }

    pub fn stall_count(&self) -> u32 {
        self.stall_count
    }

    pub fn buffered_ahead(&self) -> f64 {
        self.buffered_ahead
    }

    pub fn should_be_playing(&self) -> bool {
        self.should_be_playing
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    /// Start a fresh session against `endpoint`. Starting on the fallback endpoint uses up the
    /// session's one fallback.
    pub fn begin(&mut self, endpoint: Endpoint) {
        let options = self.options.clone();
        *self = Self::new(options);
        self.should_be_playing = true;
        self.enter_verifying(endpoint);
    }

    /// Switch to the alternate endpoint. Returns `false` (and fails the session) if the
    /// fallback was already used.
    pub fn begin_fallback(&mut self, cause: SessionError) -> bool {
        if self.fallback_attempted {
            self.fail(cause);
            return false;
        }
        info!(cause = %cause, "falling back to alternate endpoint");
        self.enter_verifying(Endpoint::Fallback);
        true
    }

    fn enter_verifying(&mut self, endpoint: Endpoint) {
        if endpoint == Endpoint::Fallback {
            self.fallback_attempted = true;
        }
        self.endpoint = endpoint;
        self.state = SessionState::Verifying;
        self.buffered_ahead = 0.0;
        self.stall_baseline = 0.0;
        self.stall_count = 0;
        self.resume_retries = 0;
        self.likely_to_keep_up = false;
        self.buffer_empty = false;
        self.buffer_full = false;
        self.rate = None;
        self.progress_observed = false;
    }

    pub fn verified(&mut self) {
        if self.state == SessionState::Verifying {
            self.transition(SessionState::Loading);
        }
    }

    /// The player instance reports it is ready to play.
    pub fn player_ready(&mut self) -> Step {
        if self.state != SessionState::Loading {
            return Step::Nothing;
        }
        if self.can_start() {
            return self.enter_playing();
        }
        self.stall_baseline = self.buffered_ahead;
        self.stall_count = 0;
        self.transition(SessionState::WaitingForInitialBuffer);
        Step::Nothing
    }

    pub fn on_telemetry(&mut self, telemetry: &PlayerTelemetry) -> Step {
        if !self.state.is_active() {
            return Step::Nothing;
        }
        self.buffered_ahead = telemetry.buffered_ahead();
        if self.buffered_ahead > 0.0 {
            self.progress_observed = true;
        }
        self.likely_to_keep_up = telemetry.likely_to_keep_up;
        self.buffer_empty = telemetry.buffer_empty;
        self.buffer_full = telemetry.buffer_full;
        self.rate = Some(telemetry.rate);

        match self.state {
            SessionState::WaitingForInitialBuffer if self.can_start() => self.enter_playing(),
            SessionState::Recovering if self.can_resume() => self.enter_playing(),
            _ => Step::Nothing,
        }
    }

    /// Periodic no-progress check while waiting for buffer.
    pub fn stall_check(&mut self) -> Step {
        if !self.state.is_buffering() {
            return Step::Nothing;
        }
        if self.buffered_ahead > self.stall_baseline {
            self.stall_count = 0;
        } else {
            self.stall_count += 1;
        }
        self.stall_baseline = self.buffered_ahead;
        debug!(
            count = self.stall_count,
            buffered = self.buffered_ahead,
            "stall check"
        );
        if self.stall_count >= self.options.max_buffer_stall_checks {
            warn!(checks = self.stall_count, "hard stall");
            return self.failure(SessionError::StallTimeout {
                checks: self.stall_count,
            });
        }
        Step::Nothing
    }

    /// Periodic rate monitor while playing.
    pub fn rate_check(&mut self) -> Step {
        if self.state != SessionState::Playing || !self.should_be_playing {
            return Step::Nothing;
        }
        if self.rate == Some(0.0) && !self.buffer_empty {
            info!(buffered = self.buffered_ahead, "playback stopped without a pause request");
            return self.enter_recovering();
        }
        Step::Nothing
    }

    /// The player reported that playback stalled.
    pub fn on_stalled(&mut self) -> Step {
        if self.state != SessionState::Playing || !self.should_be_playing {
            return Step::Nothing;
        }
        info!(buffered = self.buffered_ahead, "player stalled");
        self.enter_recovering()
    }

    /// Bounded re-check schedule while recovering.
    pub fn resume_check(&mut self) -> Step {
        if self.state != SessionState::Recovering {
            return Step::Nothing;
        }
        if self.can_resume() {
            return self.enter_playing();
        }
        self.resume_retries += 1;
        if self.resume_retries >= self.options.max_resume_retries {
            warn!(retries = self.resume_retries, "buffer never recovered");
            return self.failure(SessionError::StallTimeout {
                checks: self.resume_retries,
            });
        }
        Step::Nothing
    }

    pub fn on_end_of_media(&mut self) -> Step {
        if !self.state.is_active() {
            return Step::Nothing;
        }
        self.transition(SessionState::Completed);
        Step::Complete
    }

    /// The initial-connection window elapsed.
    pub fn connection_timeout(&mut self) -> Step {
        if !self.state.is_connecting() || self.progress_observed {
            return Step::Nothing;
        }
        let err = SessionError::ConnectionTimeout(self.options.initial_connection_timeout);
        self.fail(err.clone());
        Step::Fail(err)
    }

    /// A failure that is worth one fallback attempt.
    pub fn failure(&mut self, err: SessionError) -> Step {
        if !self.state.is_active() {
            return Step::Nothing;
        }
        if self.fallback_attempted {
            self.fail(err.clone());
            return Step::Fail(err);
        }
        debug!(error = %err, "failure eligible for fallback");
        Step::Fallback(err)
    }

    fn fail(&mut self, err: SessionError) {
        warn!(error = %err, endpoint = %self.endpoint, "session failed");
        self.error = Some(err);
        self.transition(SessionState::Failed);
    }

    /// Record the intent to play. Returns whether the player should be told to play now;
    /// while buffering, playback starts once the buffer allows it.
    pub fn play(&mut self) -> bool {
        self.should_be_playing = true;
        self.rate = None;
        self.state == SessionState::Playing
    }

    pub fn pause(&mut self) {
        self.should_be_playing = false;
        self.rate = None;
        if self.state == SessionState::Recovering {
            self.transition(SessionState::Playing);
        }
    }

    pub fn seek(&mut self) {
        self.stall_baseline = 0.0;
        self.stall_count = 0;
        self.rate = None;
    }

    pub fn cleanup(&mut self) {
        let options = self.options.clone();
        *self = Self::new(options);
    }

    fn can_start(&self) -> bool {
        self.buffered_ahead >= self.options.min_buffer_before_play.as_secs_f64()
            || self.likely_to_keep_up
    }

    fn can_resume(&self) -> bool {
        self.buffered_ahead >= self.options.min_buffer_before_resume.as_secs_f64()
            || self.buffer_full
            || self.likely_to_keep_up
    }

    fn enter_playing(&mut self) -> Step {
        self.transition(SessionState::Playing);
        self.rate = None;
        if self.should_be_playing {
            Step::Play
        } else {
            Step::Nothing
        }
    }

    fn enter_recovering(&mut self) -> Step {
        self.transition(SessionState::Recovering);
        self.stall_baseline = self.buffered_ahead;
        self.stall_count = 0;
        self.resume_retries = 0;
        Step::Pause
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, endpoint = %self.endpoint, "session transition");
            self.state = next;
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        let state = self.state;
        let buffered = self.buffered_ahead;
        let (buffer_status, target) = match state {
            SessionState::Verifying if self.endpoint == Endpoint::Fallback => {
                ("Trying alternate server".to_owned(), None)
            }
            SessionState::Verifying => ("Verifying stream".to_owned(), None),
            SessionState::Loading => ("Loading".to_owned(), None),
            SessionState::WaitingForInitialBuffer => (
                format!("Building buffer: {buffered:.0}s"),
                Some(self.options.min_buffer_before_play),
            ),
            SessionState::Recovering => (
                format!(
                    "Buffering: {buffered:.0}s / {:.0}s",
                    self.options.min_buffer_before_resume.as_secs_f64()
                ),
                Some(self.options.min_buffer_before_resume),
            ),
            SessionState::Playing => (String::new(), Some(self.options.forward_buffer)),
            SessionState::Idle | SessionState::Completed | SessionState::Failed => {
                (String::new(), None)
            }
        };
        let buffer_percentage = target.map_or(0, |target| {
            let target = target.as_secs_f64();
            if target <= 0.0 {
                100
            } else {
                (buffered / target * 100.0).clamp(0.0, 100.0).round() as u8
            }
        });
        PlaybackStatus {
            state,
            is_loading: state.is_connecting(),
            is_buffering: state.is_buffering(),
            buffer_status,
            buffer_percentage,
            error_message: self.error.as_ref().map(ToString::to_string),
            suggest_fallback_retry: self.error.as_ref().is_some_and(SessionError::is_auth_related),
            endpoint: (state != SessionState::Idle).then_some(self.endpoint),
            fallback_attempted: self.fallback_attempted,
        }
    }
}
