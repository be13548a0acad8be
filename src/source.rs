//! Interfaces of the collaborators the delivery engine consumes.
//!
//! Implementations are shared, stateless services: several pipelines (and unrelated callers)
//! may hold the same `Arc<dyn ...>` and call it concurrently.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;

use crate::error::FetchError;
use crate::events::{
    AssetRef, DecodedImage, Page, Playability, PlaybackLocator, PlayerEvent, PlayerOptions,
};

#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Fetch one page of the ordered traversal. Pages are numbered from 1.
    async fn fetch_page(&self, page: usize, page_size: usize) -> Result<Page, FetchError>;

    /// Fetch up to `limit` randomly sampled assets.
    async fn fetch_random(&self, limit: usize) -> Result<Vec<AssetRef>, FetchError>;
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn decode_image(&self, asset: &AssetRef) -> Result<DecodedImage, FetchError>;

    /// Resolve a playable locator (with any authorization headers attached) for `asset`.
    async fn resolve_playback_locator(
        &self,
        asset: &AssetRef,
        use_fallback: bool,
    ) -> Result<PlaybackLocator, FetchError>;
}

#[async_trait]
pub trait Player: Send + Sync {
    async fn verify_playable(&self, locator: &PlaybackLocator) -> Result<Playability, FetchError>;

    /// Construct a player instance for `locator` and subscribe to its telemetry.
    async fn open(
        &self,
        locator: &PlaybackLocator,
        options: &PlayerOptions,
    ) -> Result<PlayerSession, FetchError>;
}

/// Control surface of one live player instance.
pub trait PlayerControl: Send {
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, to: Duration);
    /// Release the instance. Called exactly once, before the session is dropped.
    fn shutdown(&mut self);
}

pub struct PlayerSession {
    pub control: Box<dyn PlayerControl>,
    pub telemetry: Receiver<PlayerEvent>,
}

impl std::fmt::Debug for PlayerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerSession").finish_non_exhaustive()
    }
}
