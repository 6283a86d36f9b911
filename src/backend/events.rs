use bytes::Bytes;
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::wallhaven::Category;
use crate::error::{ErrorKind, FetchError};

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_so_far: u64,
    pub total_size: u64,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        100.0 * self.bytes_so_far as f64 / self.total_size as f64
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_so_far >= self.total_size
    }
}

/// Where an error happened, so the consumer can clear the right slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorContext {
    Listing { category: Category, page: u32 },
    Thumbnail { picture_id: String, index: usize },
    Preview { picture_id: String },
    Save { picture_id: String },
}

#[derive(Debug, Clone)]
pub enum Event {
    GridCleared {
        category: Category,
        page: u32,
        generation: u64,
    },
    Thumbnail {
        category: Category,
        page: u32,
        generation: u64,
        picture_id: String,
        index: usize,
        bytes: Bytes,
        cached: bool,
    },
    GridFinished {
        category: Category,
        page: u32,
        generation: u64,
        listed: usize,
    },
    PreviewStarted {
        picture_id: String,
        generation: u64,
        total_size: u64,
    },
    PreviewProgress {
        picture_id: String,
        generation: u64,
        progress: Progress,
        /// Bytes new since the previous progress event; they start at
        /// `progress.bytes_so_far - chunk.len()`.
        chunk: Bytes,
        /// Decode of the bytes received so far, when the decoder accepted them.
        image: Option<Arc<DynamicImage>>,
    },
    /// Carries the whole picture once.
    PreviewComplete {
        picture_id: String,
        generation: u64,
        bytes: Bytes,
    },
    Saved {
        picture_id: String,
        path: PathBuf,
    },
    Error {
        context: ErrorContext,
        kind: ErrorKind,
        message: String,
    },
}

impl Event {
    pub fn error(context: ErrorContext, err: &FetchError) -> Self {
        Event::Error {
            context,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Picture the event refers to, if any.
    pub fn picture_id(&self) -> Option<&str> {
        match self {
            Event::Thumbnail { picture_id, .. }
            | Event::PreviewStarted { picture_id, .. }
            | Event::PreviewProgress { picture_id, .. }
            | Event::PreviewComplete { picture_id, .. }
            | Event::Saved { picture_id, .. } => Some(picture_id),
            Event::Error { context, .. } => match context {
                ErrorContext::Thumbnail { picture_id, .. }
                | ErrorContext::Preview { picture_id }
                | ErrorContext::Save { picture_id } => Some(picture_id),
                ErrorContext::Listing { .. } => None,
            },
            Event::GridCleared { .. } | Event::GridFinished { .. } => None,
        }
    }
}

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
