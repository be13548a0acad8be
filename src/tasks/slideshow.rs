use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::select;
use tokio::sync::{mpsc::Sender, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::events::{Displayed, ReadyItem};
use crate::tasks::prefetch::{PrefetchHandle, QueueSnapshot};

/// Identifies one delivery pipeline (a slideshow or a video session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(pub u64);

/// Tracks which pipeline currently owns the screen.
///
/// A pipeline that claims focus pauses the auto-advance of every other pipeline until it
/// releases it again.
#[derive(Debug, Clone)]
pub struct Coordinator {
    focus: Arc<watch::Sender<Option<PipelineId>>>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        let (focus, _) = watch::channel(None);
        Self {
            focus: Arc::new(focus),
        }
    }

    pub fn claim(&self, id: PipelineId) {
        let previous = self.focus.send_replace(Some(id));
        if previous != Some(id) {
            debug!(pipeline = id.0, previous = ?previous.map(|p| p.0), "focus claimed");
        }
    }

    /// Give up focus; a no-op unless `id` currently holds it.
    pub fn release(&self, id: PipelineId) {
        let released = self.focus.send_if_modified(|holder| {
            if *holder == Some(id) {
                *holder = None;
                true
            } else {
                false
            }
        });
        if released {
            debug!(pipeline = id.0, "focus released");
        }
    }

    pub fn holder(&self) -> Option<PipelineId> {
        *self.focus.borrow()
    }

    /// Whether `id` may present right now.
    pub fn allows(&self, id: PipelineId) -> bool {
        self.holder().is_none_or(|holder| holder == id)
    }

    async fn wait_until_allowed(&self, id: PipelineId) {
        let mut rx = self.focus.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = rx
            .wait_for(|holder| holder.is_none_or(|holder| holder == id))
            .await;
    }
}

/// Auto-advance a prefetch pipeline every `interval`, reporting each displayed asset.
///
/// The timer only runs while the pipeline has focus. When nothing is ready the slideshow waits
/// for the queue instead of skipping; it stops once the source is exhausted.
#[instrument(skip_all, fields(pipeline = id.0))]
pub async fn run(
    handle: PrefetchHandle,
    interval: Duration,
    id: PipelineId,
    coordinator: Coordinator,
    displayed: Sender<Displayed>,
    cancel: CancellationToken,
) -> Result<()> {
    let first = select! {
        _ = cancel.cancelled() => return Ok(()),
        snapshot = handle.wait_for(|s| s.current.is_some() || finished(s)) => snapshot?,
    };
    let Some(first) = first.current else {
        info!("nothing to show");
        return Ok(());
    };
    show(&displayed, &first).await?;

    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = coordinator.wait_until_allowed(id) => {}
        }
        select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }
        if !coordinator.allows(id) {
            debug!("focus taken during interval; holding current item");
            continue;
        }

        let next = match handle.advance().await {
            Some(item) => item,
            None => {
                // the next released decode is promoted straight to current
                debug!("nothing ready; waiting for the next decode");
                let snapshot = select! {
                    _ = cancel.cancelled() => break,
                    snapshot = handle.wait_for(|s| s.current.is_some() || finished(s)) => snapshot?,
                };
                match snapshot.current {
                    Some(item) => item,
                    None => {
                        info!("source exhausted; slideshow finished");
                        break;
                    }
                }
            }
        };
        show(&displayed, &next).await?;
    }
    Ok(())
}

fn finished(snapshot: &QueueSnapshot) -> bool {
    snapshot.exhausted && snapshot.ready_len == 0
}

async fn show(displayed: &Sender<Displayed>, item: &ReadyItem) -> Result<()> {
    debug!(asset = %item.asset.id, "displaying");
    displayed
        .send(Displayed(item.asset.id.clone()))
        .await
        .context("display consumer went away")
}
