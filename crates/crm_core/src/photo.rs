use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::config::CrmConfig;
use crate::error::{CrmError, Result};

pub const MAX_PHOTO_BYTES: u64 = 5 * 1024 * 1024;
pub const PLACEHOLDER_MIME: &str = "image/svg+xml";

const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="160" height="100" viewBox="0 0 160 100"><rect width="160" height="100" rx="8" fill="#e5e7eb"/><circle cx="50" cy="42" r="16" fill="#9ca3af"/><rect x="28" y="64" width="44" height="14" rx="7" fill="#9ca3af"/><rect x="86" y="34" width="52" height="8" rx="4" fill="#9ca3af"/><rect x="86" y="50" width="40" height="8" rx="4" fill="#d1d5db"/></svg>"##;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Photo {
    pub mime: String,
    pub bytes: Vec<u8>,
    pub data_uri: String,
    pub is_placeholder: bool,
}

impl Photo {
    pub fn from_bytes(mime: &str, bytes: Vec<u8>) -> Self {
        let data_uri = format!("data:{mime};base64,{}", STANDARD.encode(&bytes));
        Self {
            mime: mime.to_string(),
            bytes,
            data_uri,
            is_placeholder: false,
        }
    }

    pub fn placeholder() -> Self {
        Self {
            is_placeholder: true,
            ..Self::from_bytes(PLACEHOLDER_MIME, PLACEHOLDER_SVG.as_bytes().to_vec())
        }
    }
}

pub struct PhotoFetcher {
    client: Client,
    timeout: Duration,
}

impl PhotoFetcher {
    pub fn from_config(config: &CrmConfig) -> Result<Self> {
        Self::new(config.http.photo_timeout_ms, &config.http.user_agent)
    }

    pub fn new(timeout_ms: u64, user_agent: &str) -> Result<Self> {
        let timeout = Duration::from_millis(timeout_ms.max(1));
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|error| {
                CrmError::Connection(format!("failed to build photo HTTP client: {error}"))
            })?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch `url`, falling back to the placeholder on any failure.
    pub fn fetch(&self, url: &str) -> Photo {
        match self.try_fetch(url) {
            Ok(photo) => photo,
            Err(reason) => {
                warn!(url, %reason, "using placeholder photo");
                Photo::placeholder()
            }
        }
    }

    fn try_fetch(&self, url: &str) -> std::result::Result<Photo, String> {
        let url = url.trim();
        if url.is_empty() {
            return Err("no photo URL".to_string());
        }
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|error| format!("request failed: {error}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase()
            })
            .unwrap_or_default();
        if !mime.starts_with("image/") {
            return Err(format!("content type is not an image: {mime:?}"));
        }
        if response
            .content_length()
            .is_some_and(|length| length > MAX_PHOTO_BYTES)
        {
            return Err("photo exceeds size limit".to_string());
        }

        let mut bytes = Vec::new();
        response
            .take(MAX_PHOTO_BYTES + 1)
            .read_to_end(&mut bytes)
            .map_err(|error| format!("failed to read photo body: {error}"))?;
        if bytes.len() as u64 > MAX_PHOTO_BYTES {
            return Err("photo exceeds size limit".to_string());
        }
        if bytes.is_empty() {
            return Err("photo body is empty".to_string());
        }
        debug!(url, %mime, bytes = bytes.len(), "fetched photo");
        Ok(Photo::from_bytes(&mime, bytes))
    }
}

/// Photos fetched during one page render. Dropped with the render.
pub struct PhotoSession<'a> {
    fetcher: &'a PhotoFetcher,
    cache: HashMap<String, Photo>,
}

impl<'a> PhotoSession<'a> {
    pub fn new(fetcher: &'a PhotoFetcher) -> Self {
        Self {
            fetcher,
            cache: HashMap::new(),
        }
    }

    pub fn photo(&mut self, url: &str) -> &Photo {
        let fetcher = self.fetcher;
        self.cache
            .entry(url.trim().to_string())
            .or_insert_with_key(|key| fetcher.fetch(key))
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
