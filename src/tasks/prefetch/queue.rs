use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::PrefetchOptions;
use crate::error::FetchError;
use crate::events::{AssetId, AssetRef, DecodedImage, Page, ReadyItem};

/// Work the owning task should run on behalf of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRequest {
    /// Page through the source until `origin` is found.
    Locate { origin: AssetId },
    Page { page: usize },
    Random { limit: usize },
    Decode { seq: u64, asset: AssetRef },
}

/// Result of a starting-position search.
#[derive(Debug, Clone)]
pub struct StartPosition {
    /// Images from the origin (inclusive) to the end of its page, or all of page 1.
    pub items: Vec<AssetRef>,
    pub next_page: usize,
    pub has_more: bool,
    pub found: bool,
}

#[derive(Debug)]
pub enum FetchOutcome {
    Located(Result<StartPosition, FetchError>),
    Page {
        page: usize,
        result: Result<Page, FetchError>,
    },
    Random(Result<Vec<AssetRef>, FetchError>),
    Decoded {
        seq: u64,
        asset: AssetRef,
        result: Result<DecodedImage, FetchError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Traversal {
    Sequential { next_page: usize, has_more: bool },
    Shuffle,
}

/// Two-stage buffer between the asset source and the display.
///
/// Rules:
/// - `pending` holds assets known to exist; `ready` holds decoded images, consumed FIFO.
/// - Decodes may finish in any order but are released in the order they left `pending`.
/// - `ready` + decodes in flight never exceed the high watermark.
/// - Every result is tagged with the generation it was requested under; `reset` bumps the
///   generation so late results are dropped.
#[derive(Debug)]
pub struct PrefetchQueue {
    options: PrefetchOptions,
    generation: u64,
    started: bool,
    traversal: Traversal,
    pending: VecDeque<AssetRef>,
    ready: VecDeque<ReadyItem>,
    current: Option<ReadyItem>,
    next_seq: u64,
    release_seq: u64,
    reorder: BTreeMap<u64, Option<ReadyItem>>,
    decoding: usize,
    source_busy: bool,
    // last source fetch failed; wait for the next advance or a retry before asking again
    source_parked: bool,
    promote_next: bool,
}

impl PrefetchQueue {
    pub fn new(options: PrefetchOptions) -> Self {
        Self {
            options,
            generation: 0,
            started: false,
            traversal: Traversal::Sequential {
                next_page: 1,
                has_more: true,
            },
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            current: None,
            next_seq: 0,
            release_seq: 0,
            reorder: BTreeMap::new(),
            decoding: 0,
            source_busy: false,
            source_parked: false,
            promote_next: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current(&self) -> Option<&ReadyItem> {
        self.current.as_ref()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Decodes requested but not yet released into the ready queue.
    pub fn in_flight(&self) -> usize {
        self.decoding + self.reorder.len()
    }

    pub fn queue_depth(&self) -> usize {
        self.pending.len() + self.in_flight() + self.ready.len()
    }

    pub fn pending_ids(&self) -> impl Iterator<Item = &AssetId> {
        self.pending.iter().map(|asset| &asset.id)
    }

    /// Nothing left to show beyond the current item, and nothing more will arrive.
    pub fn is_exhausted(&self) -> bool {
        self.started
            && self.queue_depth() == 0
            && !self.source_busy
            && !self.source_can_refill()
    }

    fn source_can_refill(&self) -> bool {
        match self.traversal {
            Traversal::Sequential { has_more, .. } => has_more,
            Traversal::Shuffle => true,
        }
    }

    /// The consumer is waiting and nothing is queued: only asking the source again can help.
    pub fn needs_source_retry(&self) -> bool {
        self.source_parked
            && self.promote_next
            && self.current.is_none()
            && self.queue_depth() == 0
    }

    /// Lift the park left by a failed source fetch and top up again.
    pub fn retry_source(&mut self) -> Vec<FetchRequest> {
        self.source_parked = false;
        self.maintain()
    }

    /// Clear both queues and invalidate everything in flight.
    pub fn reset(&mut self) {
        let generation = self.generation + 1;
        *self = Self::new(self.options.clone());
        self.generation = generation;
        debug!(generation, "prefetch queue reset");
    }

    /// Begin a traversal; the first released image becomes `current`.
    pub fn start(&mut self, origin: Option<AssetId>) -> Vec<FetchRequest> {
        self.reset();
        self.started = true;
        self.promote_next = true;
        self.source_busy = true;
        if self.options.shuffle {
            self.traversal = Traversal::Shuffle;
            return vec![FetchRequest::Random {
                limit: self.options.random_batch_size,
            }];
        }
        match origin {
            Some(origin) => vec![FetchRequest::Locate { origin }],
            None => vec![FetchRequest::Page { page: 1 }],
        }
    }

    /// Drop the displayed item and promote the next ready one.
    ///
    /// With an empty ready queue the consumer is left without an item until the next decode
    /// is released.
    pub fn advance(&mut self) -> Vec<FetchRequest> {
        if !self.started {
            return Vec::new();
        }
        self.current = self.ready.pop_front();
        self.promote_next = self.current.is_none() && !self.is_exhausted();
        self.source_parked = false;
        self.maintain()
    }

    /// Decide which top-up fetches to start now.
    pub fn maintain(&mut self) -> Vec<FetchRequest> {
        let mut requests = Vec::new();
        if !self.started {
            return requests;
        }
        let low = self.options.ready_low_watermark;
        let needs_ready = self.ready.len() < low;
        if !needs_ready && !self.pending.is_empty() {
            return requests;
        }

        if needs_ready {
            let occupied = self.ready.len() + self.in_flight();
            let room = self.options.ready_high_watermark.saturating_sub(occupied);
            let count = self
                .options
                .decode_batch
                .min(room)
                .min(self.pending.len());
            for asset in self.pending.drain(..count) {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.decoding += 1;
                requests.push(FetchRequest::Decode { seq, asset });
            }
        }

        if self.pending.len() < self.options.pending_low_watermark
            && !self.source_busy
            && !self.source_parked
        {
            let request = match self.traversal {
                Traversal::Sequential {
                    next_page,
                    has_more: true,
                } => Some(FetchRequest::Page { page: next_page }),
                Traversal::Sequential { .. } => None,
                Traversal::Shuffle => Some(FetchRequest::Random {
                    limit: self.options.random_batch_size,
                }),
            };
            if let Some(request) = request {
                self.source_busy = true;
                requests.push(request);
            }
        }
        requests
    }

    /// Apply a finished fetch. Returns `false` when the result was stale and discarded.
    pub fn apply(&mut self, generation: u64, outcome: FetchOutcome) -> bool {
        if generation != self.generation {
            debug!(
                generation,
                current = self.generation,
                "discarding result from superseded generation"
            );
            return false;
        }
        match outcome {
            FetchOutcome::Located(result) => {
                self.source_busy = false;
                match result {
                    Ok(position) => {
                        if !position.found {
                            info!("starting asset not found; starting from the beginning");
                        }
                        self.traversal = Traversal::Sequential {
                            next_page: position.next_page,
                            has_more: position.has_more,
                        };
                        self.extend_pending(position.items);
                    }
                    Err(err) => {
                        log_fetch_error("locate start", &err);
                        self.traversal = Traversal::Sequential {
                            next_page: 1,
                            has_more: true,
                        };
                    }
                }
            }
            FetchOutcome::Page { page, result } => {
                self.source_busy = false;
                match result {
                    Ok(batch) => {
                        debug!(
                            page,
                            items = batch.items.len(),
                            more = batch.has_more,
                            "page fetched"
                        );
                        if let Traversal::Sequential { .. } = self.traversal {
                            self.traversal = Traversal::Sequential {
                                next_page: page + 1,
                                has_more: batch.has_more,
                            };
                        }
                        self.extend_pending(batch.items);
                    }
                    Err(err) => {
                        log_fetch_error("page", &err);
                        self.source_parked = true;
                    }
                }
            }
            FetchOutcome::Random(result) => {
                self.source_busy = false;
                match result {
                    Ok(items) => {
                        if self.extend_pending(items) == 0 {
                            debug!("random batch had no images; waiting for next advance");
                            self.source_parked = true;
                        }
                    }
                    Err(err) => {
                        log_fetch_error("random batch", &err);
                        self.source_parked = true;
                    }
                }
            }
            FetchOutcome::Decoded { seq, asset, result } => {
                self.decoding = self.decoding.saturating_sub(1);
                let item = match result {
                    Ok(image) => Some(ReadyItem {
                        asset,
                        image: Arc::new(image),
                    }),
                    Err(err) => {
                        if err.is_cancelled() {
                            debug!(asset = %asset.id, "decode cancelled");
                        } else {
                            warn!(
                                asset = %asset.id,
                                error = %err,
                                "dropping asset after failed fetch"
                            );
                        }
                        None
                    }
                };
                self.reorder.insert(seq, item);
                self.release_in_order();
            }
        }
        true
    }

    fn extend_pending(&mut self, items: Vec<AssetRef>) -> usize {
        let before = self.pending.len();
        self.pending.extend(items.into_iter().filter(AssetRef::is_image));
        self.pending.len() - before
    }

    fn release_in_order(&mut self) {
        while let Some(slot) = self.reorder.remove(&self.release_seq) {
            self.release_seq += 1;
            let Some(item) = slot else { continue };
            if self.promote_next && self.current.is_none() {
                debug!(asset = %item.asset.id, "promoting straight to current");
                self.current = Some(item);
                self.promote_next = false;
            } else {
                self.ready.push_back(item);
            }
        }
    }
}

fn log_fetch_error(what: &str, err: &FetchError) {
    if err.is_cancelled() {
        debug!("{what} fetch cancelled");
    } else {
        warn!(error = %err, "{what} fetch failed");
    }
}
