mod queue;

pub use queue::{FetchOutcome, FetchRequest, PrefetchQueue, StartPosition};

use std::future::{Future, pending};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::select;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Sleep, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::PrefetchOptions;
use crate::error::FetchError;
use crate::events::{AssetId, AssetRef, Page, ReadyItem};
use crate::source::{AssetSource, ContentFetcher};

#[derive(Debug)]
pub enum PrefetchCommand {
    Start {
        origin: Option<AssetId>,
        ack: oneshot::Sender<()>,
    },
    Advance {
        ack: oneshot::Sender<Option<ReadyItem>>,
    },
    Reset {
        ack: oneshot::Sender<()>,
    },
}

/// Published after every state change of the pipeline.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub current: Option<ReadyItem>,
    pub ready_len: usize,
    pub pending_len: usize,
    pub in_flight: usize,
    pub queue_depth: usize,
    pub exhausted: bool,
    pub generation: u64,
}

impl QueueSnapshot {
    fn of(queue: &PrefetchQueue) -> Self {
        Self {
            current: queue.current().cloned(),
            ready_len: queue.ready_len(),
            pending_len: queue.pending_len(),
            in_flight: queue.in_flight(),
            queue_depth: queue.queue_depth(),
            exhausted: queue.is_exhausted(),
            generation: queue.generation(),
        }
    }
}

/// Shared collaborators a fetch needs.
#[derive(Clone)]
struct Services {
    source: Arc<dyn AssetSource>,
    fetcher: Arc<dyn ContentFetcher>,
    options: PrefetchOptions,
}

/// Owns the prefetch queues for one slideshow.
///
/// Rules:
/// - All queue mutation happens on this task; fetches run in a `JoinSet` and their results are
///   applied here, tagged with the generation they were issued under.
/// - `Reset` (and `Start`, which resets first) cancels the generation token and aborts every
///   outstanding fetch before acknowledging.
/// - Snapshots are published before a command is acknowledged.
/// - A failed source fetch that leaves the consumer with nothing queued is retried after
///   `source-retry-backoff`, without waiting for an advance.
#[instrument(skip_all, fields(shuffle = options.shuffle))]
pub async fn run(
    source: Arc<dyn AssetSource>,
    fetcher: Arc<dyn ContentFetcher>,
    options: PrefetchOptions,
    mut commands: Receiver<PrefetchCommand>,
    snapshots: watch::Sender<QueueSnapshot>,
    cancel: CancellationToken,
) -> Result<()> {
    let services = Services {
        source,
        fetcher,
        options: options.clone(),
    };
    let mut queue = PrefetchQueue::new(options);
    let mut fetches: JoinSet<(u64, FetchOutcome)> = JoinSet::new();
    let mut generation_cancel = cancel.child_token();
    let backoff = services.options.source_retry_backoff;
    let mut source_retry: Option<(u64, Pin<Box<Sleep>>)> = None;

    loop {
        select! {
            _ = cancel.cancelled() => {
                debug!("cancel received; exiting prefetch task");
                break;
            }

            maybe_cmd = commands.recv() => {
                let Some(cmd) = maybe_cmd else {
                    debug!("prefetch handle dropped; exiting");
                    break;
                };
                match cmd {
                    PrefetchCommand::Start { origin, ack } => {
                        discard_outstanding(&mut fetches, &mut generation_cancel, &cancel);
                        info!(origin = ?origin, "starting traversal");
                        let requests = queue.start(origin);
                        dispatch(requests, &queue, &services, &generation_cancel, &mut fetches);
                        snapshots.send_replace(QueueSnapshot::of(&queue));
                        let _ = ack.send(());
                    }
                    PrefetchCommand::Advance { ack } => {
                        let requests = queue.advance();
                        dispatch(requests, &queue, &services, &generation_cancel, &mut fetches);
                        snapshots.send_replace(QueueSnapshot::of(&queue));
                        let _ = ack.send(queue.current().cloned());
                    }
                    PrefetchCommand::Reset { ack } => {
                        discard_outstanding(&mut fetches, &mut generation_cancel, &cancel);
                        queue.reset();
                        snapshots.send_replace(QueueSnapshot::of(&queue));
                        let _ = ack.send(());
                    }
                }
            }

            Some(joined) = fetches.join_next() => {
                match joined {
                    Ok((generation, outcome)) => {
                        if queue.apply(generation, outcome) {
                            let requests = queue.maintain();
                            dispatch(requests, &queue, &services, &generation_cancel, &mut fetches);
                        }
                    }
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => warn!("fetch task failed: {err}"),
                }
                snapshots.send_replace(QueueSnapshot::of(&queue));
            }

            generation = retry_due(&mut source_retry) => {
                source_retry = None;
                if generation == queue.generation() {
                    info!("asking the source again after a failed fetch");
                    let requests = queue.retry_source();
                    dispatch(requests, &queue, &services, &generation_cancel, &mut fetches);
                    snapshots.send_replace(QueueSnapshot::of(&queue));
                }
            }
        }

        if !queue.needs_source_retry() {
            source_retry = None;
        } else if source_retry.is_none() {
            debug!(backoff = ?backoff, "source fetch failed with nothing queued; retry scheduled");
            source_retry = Some((queue.generation(), Box::pin(sleep(backoff))));
        }
    }

    generation_cancel.cancel();
    fetches.abort_all();
    Ok(())
}

fn discard_outstanding(
    fetches: &mut JoinSet<(u64, FetchOutcome)>,
    generation_cancel: &mut CancellationToken,
    cancel: &CancellationToken,
) {
    if !fetches.is_empty() {
        debug!(outstanding = fetches.len(), "cancelling outstanding fetches");
    }
    generation_cancel.cancel();
    fetches.abort_all();
    *generation_cancel = cancel.child_token();
}

fn dispatch(
    requests: Vec<FetchRequest>,
    queue: &PrefetchQueue,
    services: &Services,
    token: &CancellationToken,
    fetches: &mut JoinSet<(u64, FetchOutcome)>,
) {
    let generation = queue.generation();
    for request in requests {
        debug!(?request, generation, "dispatching fetch");
        let services = services.clone();
        let token = token.clone();
        fetches.spawn(async move { (generation, execute(request, services, token).await) });
    }
}

async fn execute(
    request: FetchRequest,
    services: Services,
    token: CancellationToken,
) -> FetchOutcome {
    let page_size = services.options.page_size;
    match request {
        FetchRequest::Locate { origin } => FetchOutcome::Located(
            locate_start(
                services.source.as_ref(),
                &origin,
                page_size,
                services.options.page_scan_limit,
                &token,
            )
            .await,
        ),
        FetchRequest::Page { page } => FetchOutcome::Page {
            page,
            result: cancellable(&token, services.source.fetch_page(page, page_size)).await,
        },
        FetchRequest::Random { limit } => {
            FetchOutcome::Random(cancellable(&token, services.source.fetch_random(limit)).await)
        }
        FetchRequest::Decode { seq, asset } => {
            let result = cancellable(&token, services.fetcher.decode_image(&asset)).await;
            FetchOutcome::Decoded { seq, asset, result }
        }
    }
}

async fn retry_due(retry: &mut Option<(u64, Pin<Box<Sleep>>)>) -> u64 {
    match retry {
        Some((generation, delay)) => {
            delay.as_mut().await;
            *generation
        }
        None => pending().await,
    }
}

async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, FetchError>>,
) -> Result<T, FetchError> {
    select! {
        _ = token.cancelled() => Err(FetchError::Cancelled),
        res = fut => res,
    }
}

/// Page forward until `origin` is found, at most `scan_limit` pages.
///
/// Never fails once page 1 has been seen: an origin that is absent, beyond the scan limit, or
/// behind a failing page falls back to the start of page 1.
pub async fn locate_start(
    source: &dyn AssetSource,
    origin: &AssetId,
    page_size: usize,
    scan_limit: usize,
    token: &CancellationToken,
) -> Result<StartPosition, FetchError> {
    let mut first_page: Option<Page> = None;
    for page_no in 1..=scan_limit {
        let page = match cancellable(token, source.fetch_page(page_no, page_size)).await {
            Ok(page) => page,
            Err(err) if err.is_cancelled() || first_page.is_none() => return Err(err),
            Err(err) => {
                warn!(page = page_no, error = %err, "start scan interrupted");
                break;
            }
        };
        let has_more = page.has_more;
        let images: Vec<AssetRef> = page.items.into_iter().filter(AssetRef::is_image).collect();
        if let Some(pos) = images.iter().position(|asset| &asset.id == origin) {
            debug!(page = page_no, index = pos, "starting asset located");
            return Ok(StartPosition {
                items: images[pos..].to_vec(),
                next_page: page_no + 1,
                has_more,
                found: true,
            });
        }
        if first_page.is_none() {
            first_page = Some(Page {
                items: images,
                has_more,
            });
        }
        if !has_more {
            break;
        }
    }

    let first = first_page.unwrap_or_default();
    Ok(StartPosition {
        items: first.items,
        next_page: 2,
        has_more: first.has_more,
        found: false,
    })
}

/// Consumer-side handle to a running prefetch pipeline.
#[derive(Debug, Clone)]
pub struct PrefetchHandle {
    commands: Sender<PrefetchCommand>,
    snapshots: watch::Receiver<QueueSnapshot>,
}

impl PrefetchHandle {
    /// Spawn the owning task and return a handle to it.
    pub fn spawn(
        source: Arc<dyn AssetSource>,
        fetcher: Arc<dyn ContentFetcher>,
        options: PrefetchOptions,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<Result<()>>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (snap_tx, snap_rx) = watch::channel(QueueSnapshot::default());
        let task = tokio::spawn(run(source, fetcher, options, cmd_rx, snap_tx, cancel));
        (
            Self {
                commands: cmd_tx,
                snapshots: snap_rx,
            },
            task,
        )
    }

    /// Begin a traversal at `origin` (or the beginning), discarding any previous one.
    pub async fn start(&self, origin: Option<AssetId>) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(PrefetchCommand::Start { origin, ack })
            .await
            .map_err(|_| anyhow!("prefetch pipeline stopped"))?;
        done.await.map_err(|_| anyhow!("prefetch pipeline stopped"))
    }

    /// The item to display now.
    pub fn current(&self) -> Option<ReadyItem> {
        self.snapshots.borrow().current.clone()
    }

    /// Move to the next ready item; `None` means the consumer has to wait (or the source is
    /// exhausted). A stopped pipeline behaves like an exhausted one.
    pub async fn advance(&self) -> Option<ReadyItem> {
        let (ack, done) = oneshot::channel();
        if self
            .commands
            .send(PrefetchCommand::Advance { ack })
            .await
            .is_err()
        {
            return None;
        }
        done.await.ok().flatten()
    }

    /// Cancel all in-flight fetches and clear both queues. Idempotent, and a no-op on a
    /// pipeline that has already shut down.
    pub async fn reset(&self) {
        let (ack, done) = oneshot::channel();
        if self
            .commands
            .send(PrefetchCommand::Reset { ack })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.snapshots.borrow().queue_depth
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `pred`.
    pub async fn wait_for(
        &self,
        pred: impl FnMut(&QueueSnapshot) -> bool,
    ) -> Result<QueueSnapshot> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(pred)
            .await
            .map_err(|_| anyhow!("prefetch pipeline stopped"))?;
        Ok((*snapshot).clone())
    }
}
