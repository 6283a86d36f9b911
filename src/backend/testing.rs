//! In-memory `PictureSource` for exercising the fetch jobs without a network.

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use super::events::{Event, EventReceiver};
use super::wallhaven::{Category, OriginStream, Picture, PictureSource};
use crate::error::{FetchError, Result};

#[derive(Default)]
pub(crate) struct Calls {
    pub listings: AtomicUsize,
    pub metadata: AtomicUsize,
    pub thumbnails: AtomicUsize,
    pub streams: AtomicUsize,
    pub lengths: AtomicUsize,
    pub ranges: AtomicUsize,
    pub origins: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockSource {
    listings: HashMap<(Category, u32), Vec<String>>,
    failing_listings: HashSet<(Category, u32)>,
    thumbnails: HashMap<String, Bytes>,
    failing_thumbnails: HashSet<String>,
    panicking_thumbnails: HashSet<String>,
    thumbnail_gates: HashMap<String, Arc<Semaphore>>,
    origins: HashMap<String, Bytes>,
    stream_chunk: usize,
    stream_gates: HashMap<String, Arc<Semaphore>>,
    reports_length: bool,
    claimed_length: Option<u64>,
    supports_ranges: bool,
    range_failures: Mutex<HashMap<u64, u32>>,
    reverse_range_latency: bool,
    pub calls: Calls,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            listings: HashMap::new(),
            failing_listings: HashSet::new(),
            thumbnails: HashMap::new(),
            failing_thumbnails: HashSet::new(),
            panicking_thumbnails: HashSet::new(),
            thumbnail_gates: HashMap::new(),
            origins: HashMap::new(),
            stream_chunk: 64 * 1024,
            stream_gates: HashMap::new(),
            reports_length: true,
            claimed_length: None,
            supports_ranges: true,
            range_failures: Mutex::new(HashMap::new()),
            reverse_range_latency: false,
            calls: Calls::default(),
        }
    }

    pub fn picture(id: &str) -> Picture {
        Picture::new(
            id,
            format!("https://origin.test/full/wallhaven-{id}.jpg"),
            "General 1920x1080 test",
        )
    }

    pub fn listing(mut self, category: Category, page: u32, ids: &[&str]) -> Self {
        self.listings
            .insert((category, page), ids.iter().map(|s| s.to_string()).collect());
        for id in ids {
            self.thumbnails
                .entry(id.to_string())
                .or_insert_with(|| Bytes::from(format!("thumb-{id}")));
        }
        self
    }

    pub fn failing_listing(mut self, category: Category, page: u32) -> Self {
        self.failing_listings.insert((category, page));
        self
    }

    pub fn failing_thumbnail(mut self, id: &str) -> Self {
        self.failing_thumbnails.insert(id.to_string());
        self
    }

    pub fn panicking_thumbnail(mut self, id: &str) -> Self {
        self.panicking_thumbnails.insert(id.to_string());
        self
    }

    pub fn gate_thumbnail(mut self, id: &str, gate: Arc<Semaphore>) -> Self {
        self.thumbnail_gates.insert(id.to_string(), gate);
        self
    }

    pub fn origin(mut self, id: &str, payload: Bytes) -> Self {
        self.origins.insert(id.to_string(), payload);
        self
    }

    pub fn stream_chunk(mut self, size: usize) -> Self {
        self.stream_chunk = size.max(1);
        self
    }

    /// Every chunk after the first waits for a permit.
    pub fn gate_stream(mut self, id: &str, gate: Arc<Semaphore>) -> Self {
        self.stream_gates.insert(id.to_string(), gate);
        self
    }

    pub fn without_length(mut self) -> Self {
        self.reports_length = false;
        self
    }

    /// Reports `length` as the origin size whatever the payload is.
    pub fn claimed_length(mut self, length: u64) -> Self {
        self.claimed_length = Some(length);
        self
    }

    pub fn without_ranges(mut self) -> Self {
        self.supports_ranges = false;
        self
    }

    pub fn fail_range(self, start: u64, times: u32) -> Self {
        self.range_failures.lock().unwrap().insert(start, times);
        self
    }

    /// Later ranges answer first.
    pub fn reverse_range_latency(mut self) -> Self {
        self.reverse_range_latency = true;
        self
    }

    fn reported_length(&self, payload: &Bytes) -> u64 {
        self.claimed_length.unwrap_or(payload.len() as u64)
    }

    fn origin_bytes(&self, picture: &Picture) -> Result<Bytes> {
        self.origins
            .get(&picture.id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(picture.id.clone()))
    }
}

impl PictureSource for MockSource {
    async fn list_pictures(&self, category: Category, page: u32) -> Result<Vec<String>> {
        self.calls.listings.fetch_add(1, Ordering::SeqCst);
        if self.failing_listings.contains(&(category, page)) {
            return Err(FetchError::SourceUnavailable("connection refused".into()));
        }
        self.listings
            .get(&(category, page))
            .cloned()
            .ok_or_else(|| FetchError::Parse {
                url: format!("mock://{category}/{page}"),
                reason: "no picture markers".into(),
            })
    }

    async fn get_metadata(&self, id: &str) -> Result<Picture> {
        self.calls.metadata.fetch_add(1, Ordering::SeqCst);
        if self.origins.contains_key(id) {
            Ok(MockSource::picture(id))
        } else {
            Err(FetchError::NotFound(id.to_string()))
        }
    }

    async fn fetch_thumbnail(&self, id: &str) -> Result<Bytes> {
        self.calls.thumbnails.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = self.thumbnail_gates.get(id) {
            let _permit = gate.acquire().await;
        }
        if self.panicking_thumbnails.contains(id) {
            panic!("thumbnail {id} decoder blew up");
        }
        if self.failing_thumbnails.contains(id) {
            return Err(FetchError::SourceUnavailable(format!("thumbnail {id} reset")));
        }
        self.thumbnails
            .get(id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(id.to_string()))
    }

    async fn open_origin_stream(&self, picture: &Picture) -> Result<OriginStream> {
        self.calls.streams.fetch_add(1, Ordering::SeqCst);
        let payload = self.origin_bytes(picture)?;
        if !self.reports_length {
            return Err(FetchError::SizeUnknown(picture.origin_url.clone()));
        }

        let total_size = self.reported_length(&payload);
        let chunks: Vec<Bytes> = (0..payload.len())
            .step_by(self.stream_chunk)
            .map(|start| payload.slice(start..(start + self.stream_chunk).min(payload.len())))
            .collect();
        let gate = self.stream_gates.get(&picture.id).cloned();
        let chunks = stream::iter(chunks.into_iter().enumerate())
            .then(move |(i, chunk)| {
                let gate = gate.clone();
                async move {
                    if let (true, Some(gate)) = (i > 0, gate) {
                        let _permit = gate.acquire().await;
                    }
                    Ok::<_, FetchError>(chunk)
                }
            })
            .boxed();
        Ok(OriginStream { total_size, chunks })
    }

    async fn content_length(&self, picture: &Picture) -> Result<u64> {
        self.calls.lengths.fetch_add(1, Ordering::SeqCst);
        let payload = self.origin_bytes(picture)?;
        if !self.reports_length {
            return Err(FetchError::SizeUnknown(picture.origin_url.clone()));
        }
        Ok(self.reported_length(&payload))
    }

    async fn open_range(&self, picture: &Picture, start: u64, length: u64) -> Result<Bytes> {
        self.calls.ranges.fetch_add(1, Ordering::SeqCst);
        if !self.supports_ranges {
            return Err(FetchError::PartialContentUnsupported(picture.origin_url.clone()));
        }
        let payload = self.origin_bytes(picture)?;
        {
            let mut failures = self.range_failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&start).filter(|left| **left > 0) {
                *left -= 1;
                return Err(FetchError::SourceUnavailable(format!("range {start} reset")));
            }
        }
        if self.reverse_range_latency {
            let remaining = (payload.len() as u64).saturating_sub(start) / length.max(1);
            tokio::time::sleep(Duration::from_millis(2 + remaining * 3)).await;
        }
        let end = (start + length).min(payload.len() as u64);
        Ok(payload.slice(start as usize..end as usize))
    }

    async fn fetch_origin(&self, picture: &Picture) -> Result<Bytes> {
        self.calls.origins.fetch_add(1, Ordering::SeqCst);
        self.origin_bytes(picture)
    }
}

/// Deterministic non-image payload.
pub(crate) fn pattern(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

pub(crate) async fn next_event(rx: &mut EventReceiver) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Collects events until `done` matches, returning all of them.
pub(crate) async fn events_until(
    rx: &mut EventReceiver,
    mut done: impl FnMut(&Event) -> bool,
) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let finished = done(&event);
        events.push(event);
        if finished {
            return events;
        }
    }
}

/// Lets spawned tasks run, then returns whatever is queued.
pub(crate) async fn settle(rx: &mut EventReceiver) -> Vec<Event> {
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

pub(crate) fn temp_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("wallhaven-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Raw HTTP/1.1 answer from [`http_stub`].
pub(crate) struct StubReply {
    pub head: String,
    pub body: Vec<u8>,
    /// Keep the connection open after the body instead of closing it.
    pub stall: bool,
}

impl StubReply {
    pub fn new(status: &str, headers: &[(&str, String)], body: impl Into<Vec<u8>>) -> Self {
        let mut head = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        Self {
            head,
            body: body.into(),
            stall: false,
        }
    }

    pub fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }
}

/// Serves every connection on 127.0.0.1 with `respond(request_head)`, one
/// request per connection. Returns the base URL.
pub(crate) async fn http_stub(
    respond: impl Fn(&str) -> StubReply + Send + Sync + 'static,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond = Arc::new(respond);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let respond = respond.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let reply = respond(&String::from_utf8_lossy(&request));
                let _ = socket.write_all(reply.head.as_bytes()).await;
                let _ = socket.write_all(&reply.body).await;
                let _ = socket.flush().await;
                if reply.stall {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            });
        }
    });
    format!("http://{addr}")
}
