use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use serde::Deserialize;

use crate::error::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    /// Root directory scanned by the local library.
    pub library_path: PathBuf,
    /// Optional deterministic seed for random sampling in the local library.
    pub library_seed: Option<u64>,
    /// Slideshow prefetch pipeline tuning.
    pub prefetch: PrefetchOptions,
    /// Video buffering and recovery policy.
    pub playback: PlaybackOptions,
}

impl Configuration {
    /// # Errors
    /// [`Error::Io`] when the file cannot be read, [`Error::Config`] when it is not valid YAML
    /// for this shape.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        self.prefetch.validate()?;
        self.playback.validate()?;
        Ok(self)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            library_path: PathBuf::new(),
            library_seed: None,
            prefetch: PrefetchOptions::default(),
            playback: PlaybackOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PrefetchOptions {
    /// Number of assets requested per page in sequential mode.
    pub page_size: usize,
    /// Below this many ready images the pipeline starts decoding.
    pub ready_low_watermark: usize,
    /// Ready images plus decodes in flight never exceed this.
    pub ready_high_watermark: usize,
    /// Below this many pending assets the pipeline requests another batch.
    pub pending_low_watermark: usize,
    /// Maximum decodes started by a single maintenance pass.
    pub decode_batch: usize,
    /// Pages inspected while searching for the starting asset before giving up.
    pub page_scan_limit: usize,
    /// Random traversal instead of paging.
    pub shuffle: bool,
    /// Assets requested per random batch.
    pub random_batch_size: usize,
    /// Dwell time between automatic advances.
    #[serde(with = "humantime_serde")]
    pub slideshow_interval: Duration,
    /// Wait before asking the source again after a failed batch left nothing to show.
    #[serde(with = "humantime_serde")]
    pub source_retry_backoff: Duration,
}

impl PrefetchOptions {
    fn validate(&self) -> Result<()> {
        ensure!(self.page_size > 0, "prefetch.page-size must be greater than zero");
        ensure!(
            self.ready_low_watermark > 0,
            "prefetch.ready-low-watermark must be greater than zero"
        );
        ensure!(
            self.ready_high_watermark >= self.ready_low_watermark,
            "prefetch.ready-high-watermark must be >= prefetch.ready-low-watermark"
        );
        ensure!(
            self.pending_low_watermark > 0,
            "prefetch.pending-low-watermark must be greater than zero"
        );
        ensure!(
            (1..=self.ready_high_watermark).contains(&self.decode_batch),
            "prefetch.decode-batch must be between 1 and prefetch.ready-high-watermark"
        );
        ensure!(
            self.page_scan_limit > 0,
            "prefetch.page-scan-limit must be greater than zero"
        );
        ensure!(
            self.random_batch_size > 0,
            "prefetch.random-batch-size must be greater than zero"
        );
        ensure!(
            self.slideshow_interval > Duration::ZERO,
            "prefetch.slideshow-interval must be positive"
        );
        ensure!(
            self.source_retry_backoff > Duration::ZERO,
            "prefetch.source-retry-backoff must be positive"
        );
        Ok(())
    }
}

impl Default for PrefetchOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            ready_low_watermark: 2,
            ready_high_watermark: 3,
            pending_low_watermark: 10,
            decode_batch: 2,
            page_scan_limit: 100,
            shuffle: false,
            random_batch_size: 50,
            slideshow_interval: Duration::from_secs(10),
            source_retry_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PlaybackOptions {
    /// How far ahead the player is asked to buffer.
    #[serde(with = "humantime_serde")]
    pub forward_buffer: Duration,
    #[serde(with = "humantime_serde")]
    pub min_buffer_before_play: Duration,
    /// Resume threshold after a stall; kept above the start threshold.
    #[serde(with = "humantime_serde")]
    pub min_buffer_before_resume: Duration,
    /// Consecutive flat stall checks that make a hard stall.
    pub max_buffer_stall_checks: u32,
    #[serde(with = "humantime_serde")]
    pub stall_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub initial_connection_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub resume_retry_interval: Duration,
    pub max_resume_retries: u32,
    #[serde(with = "humantime_serde")]
    pub rate_monitor_interval: Duration,
}

impl PlaybackOptions {
    fn validate(&self) -> Result<()> {
        ensure!(
            self.forward_buffer > Duration::ZERO,
            "playback.forward-buffer must be positive"
        );
        ensure!(
            self.min_buffer_before_play > Duration::ZERO,
            "playback.min-buffer-before-play must be positive"
        );
        ensure!(
            self.min_buffer_before_resume >= self.min_buffer_before_play,
            "playback.min-buffer-before-resume must be >= playback.min-buffer-before-play"
        );
        ensure!(
            self.max_buffer_stall_checks > 0,
            "playback.max-buffer-stall-checks must be greater than zero"
        );
        ensure!(
            self.stall_check_interval > Duration::ZERO,
            "playback.stall-check-interval must be positive"
        );
        ensure!(
            self.initial_connection_timeout > Duration::ZERO,
            "playback.initial-connection-timeout must be positive"
        );
        ensure!(
            self.resume_retry_interval > Duration::ZERO,
            "playback.resume-retry-interval must be positive"
        );
        ensure!(
            self.max_resume_retries > 0,
            "playback.max-resume-retries must be greater than zero"
        );
        ensure!(
            self.rate_monitor_interval > Duration::ZERO,
            "playback.rate-monitor-interval must be positive"
        );
        Ok(())
    }
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            forward_buffer: Duration::from_secs(30),
            min_buffer_before_play: Duration::from_secs(5),
            min_buffer_before_resume: Duration::from_secs(10),
            max_buffer_stall_checks: 5,
            stall_check_interval: Duration::from_secs(2),
            initial_connection_timeout: Duration::from_secs(30),
            resume_retry_interval: Duration::from_secs(1),
            max_resume_retries: 30,
            rate_monitor_interval: Duration::from_secs(1),
        }
    }
}
