use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::wallhaven::{Picture, PictureSource};
use crate::config::FetchConfig;
use crate::error::{FetchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub index: usize,
    pub start: u64,
    pub len: u64,
}

/// Splits `[0, total)` into consecutive blocks of `block_size`; the last one may be short.
pub fn plan_ranges(total: u64, block_size: u64) -> Vec<ByteRange> {
    let block_size = block_size.max(1);
    (0..total)
        .step_by(block_size as usize)
        .enumerate()
        .map(|(index, start)| ByteRange {
            index,
            start,
            len: block_size.min(total - start),
        })
        .collect()
}

/// Most a streamed download reserves before any data arrived.
pub(crate) const PREALLOC_LIMIT: u64 = 8 * 1024 * 1024;

/// Refuses a reported size above `limit` before anything is allocated for it.
pub(crate) fn check_size(picture: &Picture, total: u64, limit: u64) -> Result<()> {
    if total > limit {
        return Err(FetchError::SourceUnavailable(format!(
            "{} reports {} bytes, over the {} byte limit",
            picture.id, total, limit
        )));
    }
    Ok(())
}

/// Downloads one origin picture as parallel byte ranges.
pub struct RangeFetcher<S> {
    source: Arc<S>,
    block_size: u64,
    concurrency: usize,
    retries: u32,
    backoff: Duration,
    max_size: u64,
}

impl<S> Clone for RangeFetcher<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            block_size: self.block_size,
            concurrency: self.concurrency,
            retries: self.retries,
            backoff: self.backoff,
            max_size: self.max_size,
        }
    }
}

impl<S: PictureSource> RangeFetcher<S> {
    pub fn new(source: Arc<S>, config: &FetchConfig) -> Self {
        Self {
            source,
            block_size: config.range_block_size.max(1),
            concurrency: config.range_concurrency.max(1),
            retries: config.range_retries,
            backoff: config.retry_backoff(),
            max_size: config.max_picture_size,
        }
    }

    /// Fetches the whole picture. Any range that exhausts its retries fails
    /// the fetch and nothing partial is returned.
    pub async fn fetch(&self, picture: &Picture, cancel: &CancellationToken) -> Result<Bytes> {
        let total = self.source.content_length(picture).await?;
        check_size(picture, total, self.max_size)?;
        let ranges = plan_ranges(total, self.block_size);
        log::debug!(
            "range fetch {}: {} bytes in {} ranges",
            picture.id,
            total,
            ranges.len()
        );

        let total = usize::try_from(total)
            .map_err(|_| FetchError::SourceUnavailable(format!("{total} bytes is too large")))?;
        let mut buffer = vec![0u8; total];
        let mut completed = stream::iter(ranges)
            .map(|range| async move { (range, self.fetch_range(picture, range, cancel).await) })
            .buffer_unordered(self.concurrency);

        while let Some((range, result)) = completed.next().await {
            let chunk = result?;
            let start = range.start as usize;
            buffer[start..start + chunk.len()].copy_from_slice(&chunk);
        }
        Ok(Bytes::from(buffer))
    }

    /// Ranged fetch when the origin allows it, otherwise one sequential stream.
    pub async fn fetch_or_stream(
        &self,
        picture: &Picture,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        match self.fetch(picture, cancel).await {
            Err(e) if e.is_capability() => {
                log::info!("{}; downloading {} sequentially", e, picture.id);
                self.fetch_sequential(picture, cancel).await
            }
            other => other,
        }
    }

    async fn fetch_sequential(&self, picture: &Picture, cancel: &CancellationToken) -> Result<Bytes> {
        let mut origin = match self.source.open_origin_stream(picture).await {
            Err(FetchError::SizeUnknown(_)) => return self.source.fetch_origin(picture).await,
            other => other?,
        };
        check_size(picture, origin.total_size, self.max_size)?;
        let mut buffer = BytesMut::with_capacity(origin.total_size.min(PREALLOC_LIMIT) as usize);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                next = origin.chunks.next() => next,
            };
            match next {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => break,
            }
        }
        if (buffer.len() as u64) < origin.total_size {
            return Err(FetchError::SourceUnavailable(format!(
                "origin stream for {} ended at {} of {} bytes",
                picture.id,
                buffer.len(),
                origin.total_size
            )));
        }
        Ok(buffer.freeze())
    }

    async fn fetch_range(
        &self,
        picture: &Picture,
        range: ByteRange,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                r = self.source.open_range(picture, range.start, range.len) => r,
            };
            let err = match result {
                Ok(chunk) if chunk.len() as u64 == range.len => return Ok(chunk),
                Ok(chunk) => FetchError::SourceUnavailable(format!(
                    "range {} returned {} of {} bytes",
                    range.index,
                    chunk.len(),
                    range.len
                )),
                Err(e @ FetchError::SourceUnavailable(_)) => e,
                Err(e) => return Err(e),
            };

            attempt += 1;
            if attempt > self.retries {
                log::warn!("range {} of {} gave up: {}", range.index, picture.id, err);
                return Err(err);
            }
            log::debug!("range {} of {} retry {}: {}", range.index, picture.id, attempt, err);
            tokio::time::sleep(self.backoff * attempt).await;
        }
    }
}
