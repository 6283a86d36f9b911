use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use super::cache::PictureCache;
use super::events::{ErrorContext, Event, EventSender};
use super::wallhaven::{Category, PictureSource};
use crate::error::{FetchError, Result};

struct GridSlot {
    page: u32,
    generation: u64,
    token: CancellationToken,
}

fn lock(slot: &Mutex<GridSlot>) -> MutexGuard<'_, GridSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fills the thumbnail grid of one category tab, one page at a time.
pub struct GridUpdater<S> {
    category: Category,
    source: Arc<S>,
    cache: PictureCache,
    events: EventSender,
    concurrency: usize,
    slot: Arc<Mutex<GridSlot>>,
}

impl<S: PictureSource> GridUpdater<S> {
    pub fn new(
        category: Category,
        source: Arc<S>,
        cache: PictureCache,
        concurrency: usize,
        events: EventSender,
    ) -> Self {
        Self {
            category,
            source,
            cache,
            events,
            concurrency: concurrency.max(1),
            slot: Arc::new(Mutex::new(GridSlot {
                page: 1,
                generation: 0,
                token: CancellationToken::new(),
            })),
        }
    }

    /// Drops whatever the grid was doing, clears it and starts loading `page`.
    /// Returns the generation tag of the new job.
    pub fn update_tab(&self, page: u32) -> u64 {
        let page = self.category.normalize_page(page);
        let job = {
            let mut slot = lock(&self.slot);
            slot.token.cancel();
            slot.generation += 1;
            slot.token = CancellationToken::new();
            slot.page = page;
            let _ = self.events.send(Event::GridCleared {
                category: self.category,
                page,
                generation: slot.generation,
            });
            GridJob {
                category: self.category,
                page,
                generation: slot.generation,
                token: slot.token.clone(),
                source: self.source.clone(),
                cache: self.cache.clone(),
                events: self.events.clone(),
                concurrency: self.concurrency,
                slot: self.slot.clone(),
            }
        };
        let generation = job.generation;
        tokio::spawn(job.run());
        generation
    }

    pub fn refresh(&self) -> u64 {
        self.update_tab(self.current_page())
    }

    /// `None` when the category has no further page to move to.
    pub fn next_page(&self) -> Option<u64> {
        if !self.category.is_paginated() {
            return None;
        }
        Some(self.update_tab(self.category.next_page(self.current_page())))
    }

    pub fn previous_page(&self) -> Option<u64> {
        let page = self.current_page();
        if !self.category.is_paginated() || page <= 1 {
            return None;
        }
        Some(self.update_tab(self.category.previous_page(page)))
    }
}

impl<S> GridUpdater<S> {
    pub fn category(&self) -> Category {
        self.category
    }

    pub fn current_page(&self) -> u32 {
        lock(&self.slot).page
    }

    pub fn generation(&self) -> u64 {
        lock(&self.slot).generation
    }

    /// In-flight thumbnail fetches still finish and fill the cache, but
    /// nothing more is emitted for the stopped page.
    pub fn stop(&self) {
        let mut slot = lock(&self.slot);
        slot.token.cancel();
        slot.generation += 1;
    }
}

struct GridJob<S> {
    category: Category,
    page: u32,
    generation: u64,
    token: CancellationToken,
    source: Arc<S>,
    cache: PictureCache,
    events: EventSender,
    concurrency: usize,
    slot: Arc<Mutex<GridSlot>>,
}

impl<S: PictureSource> GridJob<S> {
    fn emit(&self, event: Event) -> bool {
        let slot = lock(&self.slot);
        if slot.generation != self.generation {
            return false;
        }
        let _ = self.events.send(event);
        true
    }

    async fn run(self) {
        log::info!("updater restart: {} page {}", self.category, self.page);
        let listed = tokio::select! {
            biased;
            _ = self.token.cancelled() => return,
            listed = self.source.list_pictures(self.category, self.page) => listed,
        };
        let ids = match listed {
            Ok(ids) => ids,
            Err(e @ FetchError::Parse { .. }) => {
                log::warn!("{}; treating page as empty", e);
                Vec::new()
            }
            Err(e) => {
                log::warn!("listing {} page {} failed: {}", self.category, self.page, e);
                self.emit(Event::error(
                    ErrorContext::Listing {
                        category: self.category,
                        page: self.page,
                    },
                    &e,
                ));
                self.finished(0);
                return;
            }
        };
        let listed = ids.len();

        // each fetch is its own task so a stopped page still warms the cache
        let mut fetches = stream::iter(ids.into_iter().enumerate())
            .map(|(index, id)| {
                let source = self.source.clone();
                let cache = self.cache.clone();
                let task_id = id.clone();
                let handle = tokio::spawn(async move {
                    load_thumbnail(source.as_ref(), &cache, &task_id).await
                });
                async move { (index, id, handle.await) }
            })
            .buffer_unordered(self.concurrency);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                next = fetches.next() => next,
            };
            let Some((index, picture_id, joined)) = next else { break };
            let result = joined.unwrap_or_else(|e| {
                Err(FetchError::SourceUnavailable(format!("thumbnail task aborted: {e}")))
            });
            let event = match result {
                Ok((bytes, cached)) => Event::Thumbnail {
                    category: self.category,
                    page: self.page,
                    generation: self.generation,
                    picture_id,
                    index,
                    bytes,
                    cached,
                },
                Err(e) => {
                    log::warn!("thumbnail {} failed: {}", picture_id, e);
                    Event::error(ErrorContext::Thumbnail { picture_id, index }, &e)
                }
            };
            if !self.emit(event) {
                return;
            }
        }
        self.finished(listed);
        log::info!("updater stop: {} page {}", self.category, self.page);
    }

    fn finished(&self, listed: usize) {
        self.emit(Event::GridFinished {
            category: self.category,
            page: self.page,
            generation: self.generation,
            listed,
        });
    }
}

/// Cache first, network on a miss. The cache lock is never held over the fetch.
async fn load_thumbnail<S: PictureSource>(
    source: &S,
    cache: &PictureCache,
    id: &str,
) -> Result<(Bytes, bool)> {
    if let Some(bytes) = cache.get(id).await {
        log::debug!("load from cache, id:{}", id);
        return Ok((bytes, true));
    }
    let bytes = source.fetch_thumbnail(id).await?;
    cache.put(id, bytes.clone()).await;
    log::debug!("fetched thumbnail {}", id);
    Ok((bytes, false))
}
