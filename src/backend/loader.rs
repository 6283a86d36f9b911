use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use super::events::{ErrorContext, Event, EventSender, Progress};
use super::range::{check_size, RangeFetcher, PREALLOC_LIMIT};
use super::wallhaven::{Picture, PictureSource};
use crate::config::FetchConfig;
use crate::error::{FetchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
    Complete,
    Cancelled,
    Failed,
}

struct PreviewSlot {
    generation: u64,
    token: CancellationToken,
    state: LoadState,
    picture_id: Option<String>,
    picture: Option<Arc<Picture>>,
    /// Full origin bytes once the current load completed.
    completed: Option<Bytes>,
}

fn lock(slot: &Mutex<PreviewSlot>) -> MutexGuard<'_, PreviewSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Loads one picture at a time into the preview slot, streaming it and
/// publishing a fresh decode after every chunk.
///
/// A new request for a different picture supersedes the running one: its
/// token is cancelled and the slot generation moves on, so anything the old
/// job produces afterwards is dropped instead of emitted.
pub struct ProgressiveLoader<S> {
    source: Arc<S>,
    range: RangeFetcher<S>,
    events: EventSender,
    chunk_size: usize,
    max_size: u64,
    slot: Arc<Mutex<PreviewSlot>>,
}

impl<S> ProgressiveLoader<S> {
    /// Stops the running load. Nothing more is emitted for it.
    pub fn cancel(&self) {
        let mut slot = lock(&self.slot);
        if slot.state != LoadState::Loading {
            return;
        }
        slot.token.cancel();
        slot.generation += 1;
        slot.state = LoadState::Cancelled;
        log::debug!("stop loader");
    }

    pub fn state(&self) -> LoadState {
        lock(&self.slot).state
    }

    pub fn generation(&self) -> u64 {
        lock(&self.slot).generation
    }

    pub fn current_picture(&self) -> Option<String> {
        lock(&self.slot).picture_id.clone()
    }
}

impl<S: PictureSource> ProgressiveLoader<S> {
    pub fn new(source: Arc<S>, config: &FetchConfig, events: EventSender) -> Self {
        Self {
            range: RangeFetcher::new(source.clone(), config),
            source,
            events,
            chunk_size: config.stream_chunk_size.max(1),
            max_size: config.max_picture_size,
            slot: Arc::new(Mutex::new(PreviewSlot {
                generation: 0,
                token: CancellationToken::new(),
                state: LoadState::Idle,
                picture_id: None,
                picture: None,
                completed: None,
            })),
        }
    }

    /// Starts loading `picture`. Returns false when it is already loading.
    pub fn load(&self, picture: Picture) -> bool {
        self.start(picture.id.clone(), Some(picture))
    }

    /// Like [`load`](Self::load), resolving metadata inside the job.
    pub fn load_id(&self, id: &str) -> bool {
        self.start(id.to_string(), None)
    }

    fn start(&self, id: String, picture: Option<Picture>) -> bool {
        let job = {
            let mut slot = lock(&self.slot);
            if slot.state == LoadState::Loading && slot.picture_id.as_deref() == Some(id.as_str()) {
                log::debug!("picture {} already loading", id);
                return false;
            }
            slot.token.cancel();
            slot.generation += 1;
            slot.token = CancellationToken::new();
            slot.state = LoadState::Loading;
            slot.picture_id = Some(id.clone());
            slot.picture = picture.clone().map(Arc::new);
            slot.completed = None;

            PreviewJob {
                source: self.source.clone(),
                events: self.events.clone(),
                slot: self.slot.clone(),
                generation: slot.generation,
                token: slot.token.clone(),
                chunk_size: self.chunk_size,
                max_size: self.max_size,
                id,
                picture,
            }
        };
        log::debug!("load new picture id {}", job.id);
        tokio::spawn(job.run());
        true
    }

    /// Writes the current picture to `destination`, reusing the preview buffer
    /// when the load completed and downloading it afresh otherwise.
    pub async fn save(&self, destination: &Path) -> Result<PathBuf> {
        let (picture_id, picture, completed) = {
            let slot = lock(&self.slot);
            (
                slot.picture_id.clone(),
                slot.picture.clone(),
                slot.completed.clone(),
            )
        };
        let picture_id = picture_id.ok_or(FetchError::NothingToSave)?;
        let picture = match picture {
            Some(picture) => picture,
            None => Arc::new(self.source.get_metadata(&picture_id).await?),
        };

        let bytes = match completed {
            Some(bytes) => {
                log::debug!("saving {} from preview buffer", picture.id);
                bytes
            }
            None => {
                self.range
                    .fetch_or_stream(&picture, &CancellationToken::new())
                    .await?
            }
        };
        write_picture(destination, &picture, &bytes).await
    }
}

struct PreviewJob<S> {
    source: Arc<S>,
    events: EventSender,
    slot: Arc<Mutex<PreviewSlot>>,
    generation: u64,
    token: CancellationToken,
    chunk_size: usize,
    max_size: u64,
    id: String,
    picture: Option<Picture>,
}

impl<S: PictureSource> PreviewJob<S> {
    async fn run(self) {
        match self.stream().await {
            Ok(()) => {}
            Err(FetchError::Cancelled) => log::debug!("stop load picture {}", self.id),
            Err(e) => self.fail(e),
        }
    }

    /// Sends `event` only while this job still owns the slot.
    fn emit(&self, event: Event) -> bool {
        let slot = lock(&self.slot);
        if slot.generation != self.generation {
            return false;
        }
        let _ = self.events.send(event);
        true
    }

    fn fail(&self, err: FetchError) {
        let mut slot = lock(&self.slot);
        if slot.generation != self.generation {
            return;
        }
        log::warn!("load picture {} failed: {}", self.id, err);
        slot.state = LoadState::Failed;
        let _ = self.events.send(Event::error(
            ErrorContext::Preview {
                picture_id: self.id.clone(),
            },
            &err,
        ));
    }

    fn finish(&self, bytes: Bytes) {
        let mut slot = lock(&self.slot);
        if slot.generation != self.generation {
            return;
        }
        slot.state = LoadState::Complete;
        slot.completed = Some(bytes.clone());
        let _ = self.events.send(Event::PreviewComplete {
            picture_id: self.id.clone(),
            generation: self.generation,
            bytes,
        });
    }

    /// Decodes on the blocking pool. Truncated data often fails to decode,
    /// which is reported as no image yet.
    async fn decode(&self, data: Bytes) -> Result<Option<Arc<DynamicImage>>> {
        let decoding =
            tokio::task::spawn_blocking(move || image::load_from_memory(&data).ok().map(Arc::new));
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(FetchError::Cancelled),
            decoded = decoding => Ok(decoded.unwrap_or_else(|e| {
                log::warn!("decoding {} aborted: {}", self.id, e);
                None
            })),
        }
    }

    /// Emits `chunk`, the bytes new since the last event, with a decode of
    /// everything in `received`.
    async fn progress(&self, received: &Bytes, chunk: Bytes, total_size: u64) -> Result<()> {
        let image = self.decode(received.clone()).await?;
        let sent = self.emit(Event::PreviewProgress {
            picture_id: self.id.clone(),
            generation: self.generation,
            progress: Progress {
                bytes_so_far: received.len() as u64,
                total_size,
            },
            chunk,
            image,
        });
        if sent { Ok(()) } else { Err(FetchError::Cancelled) }
    }

    fn started(&self, total_size: u64) -> Result<()> {
        let started = self.emit(Event::PreviewStarted {
            picture_id: self.id.clone(),
            generation: self.generation,
            total_size,
        });
        if started { Ok(()) } else { Err(FetchError::Cancelled) }
    }

    async fn resolve(&self) -> Result<Picture> {
        if let Some(picture) = &self.picture {
            return Ok(picture.clone());
        }
        let picture = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(FetchError::Cancelled),
            picture = self.source.get_metadata(&self.id) => picture?,
        };
        let mut slot = lock(&self.slot);
        if slot.generation == self.generation {
            slot.picture = Some(Arc::new(picture.clone()));
        }
        Ok(picture)
    }

    async fn stream(&self) -> Result<()> {
        let picture = self.resolve().await?;
        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(FetchError::Cancelled),
            opened = self.source.open_origin_stream(&picture) => opened,
        };
        let mut origin = match opened {
            Err(FetchError::SizeUnknown(_)) => return self.load_whole(&picture).await,
            other => other?,
        };
        let total = origin.total_size;
        check_size(&picture, total, self.max_size)?;
        log::info!("load picture {}, size {:.2}KB", self.id, total as f64 / 1024.0);
        self.started(total)?;

        let mut buffer = BytesMut::with_capacity(total.min(PREALLOC_LIMIT) as usize);
        let mut pending = BytesMut::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(FetchError::Cancelled),
                next = origin.chunks.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);
            pending.extend_from_slice(&chunk);

            let received = buffer.len();
            if pending.len() < self.chunk_size && (received as u64) < total {
                continue;
            }
            log::debug!(
                "load picture {} in {:.1}%",
                self.id,
                100.0 * received as f64 / total.max(1) as f64
            );
            let snapshot = std::mem::take(&mut buffer).freeze();
            self.progress(&snapshot, pending.split().freeze(), total).await?;
            buffer = reclaim(snapshot);
        }
        drop(origin);

        if (buffer.len() as u64) < total {
            return Err(FetchError::SourceUnavailable(format!(
                "origin stream for {} ended at {} of {} bytes",
                self.id,
                buffer.len(),
                total
            )));
        }
        self.finish(buffer.freeze());
        Ok(())
    }

    /// Fallback when the origin reports no length: one plain GET.
    async fn load_whole(&self, picture: &Picture) -> Result<()> {
        log::debug!("no length for {}, loading in one piece", self.id);
        let bytes = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(FetchError::Cancelled),
            bytes = self.source.fetch_origin(picture) => bytes?,
        };
        let total = bytes.len() as u64;
        self.started(total)?;
        self.progress(&bytes, bytes.clone(), total).await?;
        self.finish(bytes);
        Ok(())
    }
}

/// Takes the buffer back for appending; copies only if a snapshot is still shared.
fn reclaim(snapshot: Bytes) -> BytesMut {
    snapshot
        .try_into_mut()
        .unwrap_or_else(|shared| BytesMut::from(&shared[..]))
}

/// Writes `bytes` under `destination`. An existing directory, or a path
/// without an extension, receives the origin file name.
pub(crate) async fn write_picture(
    destination: &Path,
    picture: &Picture,
    bytes: &[u8],
) -> Result<PathBuf> {
    let is_dir = tokio::fs::metadata(destination)
        .await
        .map(|m| m.is_dir())
        .unwrap_or_else(|_| destination.extension().is_none());
    let path = if is_dir {
        destination.join(picture.file_name())
    } else {
        destination.to_path_buf()
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| FetchError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|source| FetchError::Io {
            path: path.clone(),
            source,
        })?;
    log::info!("saved picture {} to {}", picture.id, path.display());
    Ok(path)
}
