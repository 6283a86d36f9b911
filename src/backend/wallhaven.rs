use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use regex::Regex;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Response, StatusCode};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use crate::config::SourceConfig;
use crate::error::{FetchError, Result};

static LISTING_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"data-wallpaper-id="(\d+)""#).expect("valid regex"));
static MAIN_THUMB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"th-(\d+)\.\w{3,4}""#).expect("valid regex"));
static WALLPAPER_IMG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<img[^>]*\bid="wallpaper"[^>]*>"#).expect("valid regex"));
static ATTR_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bsrc="([^"]+)""#).expect("valid regex"));
static ATTR_ALT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\balt="([^"]*)""#).expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Category {
    Main,
    Latest,
    #[value(name = "toplist")]
    TopList,
    Random,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Main,
        Category::Latest,
        Category::TopList,
        Category::Random,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Category::Main => "main",
            Category::Latest => "latest",
            Category::TopList => "toplist",
            Category::Random => "random",
        }
    }

    pub fn is_paginated(self) -> bool {
        self != Category::Main
    }

    /// Clamps a requested page: `Main` is always page 1, the rest have a floor of 1.
    pub fn normalize_page(self, page: u32) -> u32 {
        if self.is_paginated() { page.max(1) } else { 1 }
    }

    pub fn next_page(self, page: u32) -> u32 {
        if self.is_paginated() { page.saturating_add(1) } else { 1 }
    }

    pub fn previous_page(self, page: u32) -> u32 {
        self.normalize_page(page.saturating_sub(1))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown category: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Known { width: u32, height: u32 },
    Unknown,
}

impl Resolution {
    /// Finds the first `<W>x<H>` token in an alt text such as
    /// `"General 4096x2304 landscape ..."`.
    pub fn from_alt(alt: &str) -> Self {
        alt.split_whitespace()
            .find_map(|token| {
                let (w, h) = token.split_once('x')?;
                Some(Resolution::Known {
                    width: w.parse().ok()?,
                    height: h.parse().ok()?,
                })
            })
            .unwrap_or(Resolution::Unknown)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Known { width, height } => write!(f, "{width}x{height}"),
            Resolution::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    pub id: String,
    pub origin_url: String,
    pub alt: String,
    pub resolution: Resolution,
}

impl Picture {
    pub fn new(id: impl Into<String>, origin_url: impl Into<String>, alt: impl Into<String>) -> Self {
        let alt = alt.into();
        Picture {
            id: id.into(),
            origin_url: origin_url.into(),
            resolution: Resolution::from_alt(&alt),
            alt,
        }
    }

    /// Last path segment of the origin URL, falling back to the id.
    pub fn file_name(&self) -> String {
        self.origin_url
            .rsplit('/')
            .next()
            .map(|name| name.split(['?', '#']).next().unwrap_or(name))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("wallhaven-{}", self.id))
    }
}

/// A streamed origin download. Dropping it closes the connection.
pub struct OriginStream {
    pub total_size: u64,
    pub chunks: BoxStream<'static, Result<Bytes>>,
}

/// Everything the fetch pipeline needs from the remote catalog.
pub trait PictureSource: Send + Sync + 'static {
    fn list_pictures(
        &self,
        category: Category,
        page: u32,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn get_metadata(&self, id: &str) -> impl Future<Output = Result<Picture>> + Send;

    fn fetch_thumbnail(&self, id: &str) -> impl Future<Output = Result<Bytes>> + Send;

    /// Fails with `SizeUnknown` when no length is reported.
    fn open_origin_stream(
        &self,
        picture: &Picture,
    ) -> impl Future<Output = Result<OriginStream>> + Send;

    /// HEAD-equivalent size probe for ranged access.
    fn content_length(&self, picture: &Picture) -> impl Future<Output = Result<u64>> + Send;

    /// Fails with `PartialContentUnsupported` when the range is ignored.
    fn open_range(
        &self,
        picture: &Picture,
        start: u64,
        length: u64,
    ) -> impl Future<Output = Result<Bytes>> + Send;

    /// Unranged one-shot download.
    fn fetch_origin(&self, picture: &Picture) -> impl Future<Output = Result<Bytes>> + Send;
}

pub fn parse_listing(category: Category, url: &str, html: &str) -> Result<Vec<String>> {
    let pattern = match category {
        Category::Main => &*MAIN_THUMB_ID,
        _ => &*LISTING_ID,
    };
    let mut seen = HashSet::new();
    let ids: Vec<String> = pattern
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect();

    if ids.is_empty() {
        return Err(FetchError::Parse {
            url: url.to_string(),
            reason: "no picture markers".to_string(),
        });
    }
    Ok(ids)
}

pub fn parse_metadata(id: &str, html: &str) -> Result<Picture> {
    let tag = WALLPAPER_IMG
        .find(html)
        .ok_or_else(|| FetchError::NotFound(id.to_string()))?
        .as_str();
    let src = ATTR_SRC
        .captures(tag)
        .map(|c| c[1].to_string())
        .ok_or_else(|| FetchError::NotFound(id.to_string()))?;
    let alt = ATTR_ALT
        .captures(tag)
        .map(|c| c[1].to_string())
        .unwrap_or_default();

    let origin_url = if src.starts_with("//") {
        format!("https:{src}")
    } else {
        src
    };
    Ok(Picture::new(id, origin_url, alt))
}

fn parse_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// reqwest-backed catalog client.
#[derive(Clone)]
pub struct CatalogClient {
    client: reqwest::Client,
    base_url: String,
    thumbnail_url: String,
    timeout: Duration,
}

impl CatalogClient {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = Self::builder(config).build()?;
        Ok(Self::with_client(config, client))
    }

    /// Client settings every request relies on; callers may add to them.
    pub fn builder(config: &SourceConfig) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.request_timeout())
    }

    pub fn with_client(config: &SourceConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            thumbnail_url: config.thumbnail_url.clone(),
            timeout: config.request_timeout(),
        }
    }

    pub fn listing_url(&self, category: Category, page: u32) -> String {
        match category {
            Category::Main => self.base_url.clone(),
            _ => format!(
                "{}/{}?page={}",
                self.base_url,
                category.name(),
                category.normalize_page(page)
            ),
        }
    }

    pub fn page_url(&self, id: &str) -> String {
        format!("{}/wallpaper/{}", self.base_url, id)
    }

    pub fn thumbnail_url(&self, id: &str) -> String {
        self.thumbnail_url.replace("{id}", id)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Response> {
        tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| FetchError::timed_out(what, self.timeout))?
            .map_err(FetchError::from)
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.send(self.client.get(url), url).await?;
        let response = response.error_for_status()?;
        tokio::time::timeout(self.timeout, response.text())
            .await
            .map_err(|_| FetchError::timed_out(url, self.timeout))?
            .map_err(FetchError::from)
    }

    async fn get_bytes(&self, url: &str, id: &str) -> Result<Bytes> {
        let response = self.send(self.client.get(url), url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(id.to_string()));
        }
        let response = response.error_for_status()?;
        tokio::time::timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| FetchError::timed_out(url, self.timeout))?
            .map_err(FetchError::from)
    }
}

impl PictureSource for CatalogClient {
    async fn list_pictures(&self, category: Category, page: u32) -> Result<Vec<String>> {
        let url = self.listing_url(category, page);
        let html = self.get_text(&url).await?;
        parse_listing(category, &url, &html)
    }

    async fn get_metadata(&self, id: &str) -> Result<Picture> {
        let url = self.page_url(id);
        let response = self.send(self.client.get(&url), &url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(id.to_string()));
        }
        let html = tokio::time::timeout(self.timeout, response.error_for_status()?.text())
            .await
            .map_err(|_| FetchError::timed_out(&url, self.timeout))??;
        parse_metadata(id, &html)
    }

    async fn fetch_thumbnail(&self, id: &str) -> Result<Bytes> {
        self.get_bytes(&self.thumbnail_url(id), id).await
    }

    async fn open_origin_stream(&self, picture: &Picture) -> Result<OriginStream> {
        let url = &picture.origin_url;
        let response = self.send(self.client.get(url), url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(picture.id.clone()));
        }
        let response = response.error_for_status()?;
        let total_size = parse_length(&response).ok_or_else(|| FetchError::SizeUnknown(url.clone()))?;

        let timeout = self.timeout;
        let chunks = stream::unfold(Some(response), move |state| async move {
            let mut response = state?;
            match tokio::time::timeout(timeout, response.chunk()).await {
                Ok(Ok(Some(chunk))) => Some((Ok(chunk), Some(response))),
                Ok(Ok(None)) => None,
                Ok(Err(e)) => Some((Err(FetchError::from(e)), None)),
                Err(_) => Some((Err(FetchError::timed_out("origin chunk", timeout)), None)),
            }
        })
        .boxed();

        Ok(OriginStream { total_size, chunks })
    }

    async fn content_length(&self, picture: &Picture) -> Result<u64> {
        let url = &picture.origin_url;
        let response = self.send(self.client.head(url), url).await?.error_for_status()?;
        let refuses_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("none"));
        if refuses_ranges {
            return Err(FetchError::PartialContentUnsupported(url.clone()));
        }
        parse_length(&response).ok_or_else(|| FetchError::SizeUnknown(url.clone()))
    }

    async fn open_range(&self, picture: &Picture, start: u64, length: u64) -> Result<Bytes> {
        let url = &picture.origin_url;
        if length == 0 {
            return Ok(Bytes::new());
        }
        let range = format!("bytes={}-{}", start, start + length - 1);
        let response = self
            .send(self.client.get(url).header(RANGE, range), url)
            .await?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => return Err(FetchError::PartialContentUnsupported(url.clone())),
            _ => {
                response.error_for_status()?;
                return Err(FetchError::PartialContentUnsupported(url.clone()));
            }
        }
        tokio::time::timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| FetchError::timed_out("range", self.timeout))?
            .map_err(FetchError::from)
    }

    async fn fetch_origin(&self, picture: &Picture) -> Result<Bytes> {
        self.get_bytes(&picture.origin_url, &picture.id).await
    }
}
