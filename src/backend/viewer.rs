use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::cache::PictureCache;
use super::events::{self, ErrorContext, Event, EventReceiver, EventSender};
use super::grid::GridUpdater;
use super::loader::{write_picture, LoadState, ProgressiveLoader};
use super::range::RangeFetcher;
use super::wallhaven::{CatalogClient, Category, Picture, PictureSource};
use crate::config::Config;
use crate::error::Result;

/// Entry point for a UI: one grid per category tab, one preview slot, one
/// shared thumbnail cache. Calls return immediately; results arrive on the
/// event receiver handed out at construction.
pub struct Viewer<S> {
    source: Arc<S>,
    cache: PictureCache,
    grids: Vec<GridUpdater<S>>,
    preview: Arc<ProgressiveLoader<S>>,
    range: RangeFetcher<S>,
    events: EventSender,
}

impl Viewer<CatalogClient> {
    pub fn connect(config: &Config) -> Result<(Self, EventReceiver)> {
        let client = CatalogClient::new(&config.source)?;
        Ok(Viewer::with_source(client, config))
    }
}

impl<S: PictureSource> Viewer<S> {
    pub fn with_source(source: S, config: &Config) -> (Self, EventReceiver) {
        let source = Arc::new(source);
        let (events, rx) = events::channel();
        let cache = PictureCache::new(config.cache.capacity, config.cache.policy);
        let grids = Category::ALL
            .into_iter()
            .map(|category| {
                GridUpdater::new(
                    category,
                    source.clone(),
                    cache.clone(),
                    config.fetch.grid_concurrency,
                    events.clone(),
                )
            })
            .collect();
        let preview = Arc::new(ProgressiveLoader::new(
            source.clone(),
            &config.fetch,
            events.clone(),
        ));
        let range = RangeFetcher::new(source.clone(), &config.fetch);

        let viewer = Self {
            source,
            cache,
            grids,
            preview,
            range,
            events,
        };
        (viewer, rx)
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn cache(&self) -> &PictureCache {
        &self.cache
    }

    fn grid(&self, category: Category) -> &GridUpdater<S> {
        &self.grids[category as usize]
    }

    pub fn list_page(&self, category: Category, page: u32) -> u64 {
        self.grid(category).update_tab(page)
    }

    pub fn refresh(&self, category: Category) -> u64 {
        self.grid(category).refresh()
    }

    pub fn next_page(&self, category: Category) -> Option<u64> {
        self.grid(category).next_page()
    }

    pub fn previous_page(&self, category: Category) -> Option<u64> {
        self.grid(category).previous_page()
    }

    pub fn current_page(&self, category: Category) -> u32 {
        self.grid(category).current_page()
    }

    pub fn stop_grid(&self, category: Category) {
        self.grid(category).stop();
    }

    pub fn load_preview(&self, picture_id: &str) -> bool {
        self.preview.load_id(picture_id)
    }

    /// Preview with metadata the caller already holds.
    pub fn show_picture(&self, picture: Picture) -> bool {
        self.preview.load(picture)
    }

    pub fn cancel_preview(&self) {
        self.preview.cancel();
    }

    pub fn preview_state(&self) -> LoadState {
        self.preview.state()
    }

    /// Saves the previewed picture; reports `Saved` or a `Save` error.
    pub fn save_preview(&self, destination: impl Into<PathBuf>) {
        let destination = destination.into();
        let preview = self.preview.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let picture_id = preview.current_picture().unwrap_or_default();
            let event = match preview.save(&destination).await {
                Ok(path) => Event::Saved { picture_id, path },
                Err(e) => {
                    log::warn!("saving {} failed: {}", picture_id, e);
                    Event::error(ErrorContext::Save { picture_id }, &e)
                }
            };
            let _ = events.send(event);
        });
    }

    /// Full download straight to disk, independent of the preview slot.
    pub fn download(&self, picture_id: &str, destination: impl Into<PathBuf>) -> CancellationToken {
        let destination = destination.into();
        let picture_id = picture_id.to_string();
        let source = self.source.clone();
        let range = self.range.clone();
        let events = self.events.clone();
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            let result = async {
                let picture = source.get_metadata(&picture_id).await?;
                let bytes = range.fetch_or_stream(&picture, &cancel).await?;
                write_picture(&destination, &picture, &bytes).await
            }
            .await;
            let event = match result {
                Ok(path) => Event::Saved { picture_id, path },
                Err(e) => Event::error(ErrorContext::Save { picture_id }, &e),
            };
            let _ = events.send(event);
        });
        token
    }

    pub async fn picture_info(&self, picture_id: &str) -> Result<Picture> {
        self.source.get_metadata(picture_id).await
    }
}

impl<S> Drop for Viewer<S> {
    fn drop(&mut self) {
        for grid in &self.grids {
            grid.stop();
        }
        self.preview.cancel();
    }
}
