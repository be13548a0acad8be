use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(pub String);

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// Reference to one media item held by the asset source. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    pub id: AssetId,
    pub kind: MediaKind,
    pub order_key: i64,
}

impl AssetRef {
    pub fn image(id: impl Into<String>, order_key: i64) -> Self {
        Self {
            id: AssetId(id.into()),
            kind: MediaKind::Image,
            order_key,
        }
    }

    pub fn video(id: impl Into<String>, order_key: i64) -> Self {
        Self {
            id: AssetId(id.into()),
            kind: MediaKind::Video,
            order_key,
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind == MediaKind::Image
    }
}

/// One page of a sequential traversal.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<AssetRef>,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// A decoded image ready for immediate display.
#[derive(Debug, Clone)]
pub struct ReadyItem {
    pub asset: AssetRef,
    pub image: Arc<DecodedImage>,
}

/// Emitted by the slideshow after a new asset becomes the displayed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Displayed(pub AssetId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Primary,
    Fallback,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackLocator {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Playability {
    pub is_playable: bool,
    pub duration: Option<Duration>,
}

/// Options applied when a player instance is constructed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerOptions {
    pub forward_buffer: Duration,
    /// Let the player wait out network hiccups instead of failing fast.
    pub network_resilient: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub duration: f64,
}

impl TimeRange {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Buffer and rate snapshot published by the player.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerTelemetry {
    pub buffered: Vec<TimeRange>,
    /// Current playback position in seconds.
    pub position: f64,
    pub rate: f32,
    pub likely_to_keep_up: bool,
    pub buffer_empty: bool,
    pub buffer_full: bool,
}

impl PlayerTelemetry {
    /// Seconds loaded beyond the current position.
    pub fn buffered_ahead(&self) -> f64 {
        self.buffered
            .iter()
            .find(|range| range.start <= self.position && self.position <= range.end())
            .map(|range| (range.end() - self.position).max(0.0))
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Ready,
    Telemetry(PlayerTelemetry),
    Stalled,
    EndOfMedia,
    /// Unrecoverable decode or format error.
    Failed(String),
}
