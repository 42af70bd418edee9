//! HTTP client for the remote artifact cache.
//!
//! Speaks the `/1.0/artifacts` protocol served by `morph-cache-server`:
//! GET streams artifact bytes, HEAD checks existence, POST uploads
//! (write-enabled servers only) and `/1.0/fetch` asks the server to pull
//! a file from another cache, composing worker and shared caches.

use crate::error::{CacheError, CacheResult};
use reqwest::{StatusCode, Url};
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Clone)]
pub struct RemoteArtifactCache {
    http: reqwest::Client,
    base_url: Url,
}

impl RemoteArtifactCache {
    pub fn new(base_url: &str) -> CacheResult<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| CacheError::Remote(format!("invalid URL: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn artifacts_url(&self, filename: &str) -> CacheResult<Url> {
        let mut url = self
            .base_url
            .join("/1.0/artifacts")
            .map_err(|e| CacheError::Remote(e.to_string()))?;
        url.query_pairs_mut().append_pair("filename", filename);
        Ok(url)
    }

    /// Whether the named file exists on the remote. A 409 means a writer
    /// is mid-flight, which readers treat as busy rather than absent.
    pub async fn head(&self, filename: &str) -> CacheResult<bool> {
        let url = self.artifacts_url(filename)?;
        let response = self.http.head(url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::CONFLICT => Err(CacheError::Busy(filename.to_string())),
            status => Err(CacheError::Remote(format!(
                "HEAD {filename}: unexpected status {status}"
            ))),
        }
    }

    /// Download the named file, streaming it into `writer` chunk by
    /// chunk so artifacts never have to fit in memory. Returns the number
    /// of bytes written.
    pub async fn get<W>(&self, filename: &str, writer: &mut W) -> CacheResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let url = self.artifacts_url(filename)?;
        let mut response = self.http.get(url).send().await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(CacheError::NotFound(filename.to_string())),
            StatusCode::CONFLICT => return Err(CacheError::Busy(filename.to_string())),
            status => {
                return Err(CacheError::Remote(format!(
                    "GET {filename}: unexpected status {status}"
                )));
            }
        }
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(written)
    }

    /// Upload files as one multipart request. The server rejects this
    /// unless writes are enabled.
    pub async fn upload(&self, files: Vec<(String, Vec<u8>)>) -> CacheResult<()> {
        let url = self
            .base_url
            .join("/1.0/artifacts")
            .map_err(|e| CacheError::Remote(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new();
        for (filename, bytes) in files {
            let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.clone());
            form = form.part(filename, part);
        }
        let response = self.http.post(url).multipart(form).send().await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            StatusCode::FORBIDDEN => Err(CacheError::WritesDisabled),
            StatusCode::CONFLICT => Err(CacheError::Busy("upload".to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(CacheError::Remote(format!(
                    "POST artifacts: status {status}: {body}"
                )))
            }
        }
    }

    /// Ask the server to fetch `url` into its own store.
    pub async fn fetch_from(&self, url: &str) -> CacheResult<()> {
        let mut fetch_url = self
            .base_url
            .join("/1.0/fetch")
            .map_err(|e| CacheError::Remote(e.to_string()))?;
        fetch_url.query_pairs_mut().append_pair("url", url);
        let response = self.http.get(fetch_url).send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            StatusCode::FORBIDDEN => Err(CacheError::WritesDisabled),
            StatusCode::NOT_FOUND => Err(CacheError::NotFound(url.to_string())),
            status => Err(CacheError::Remote(format!(
                "fetch {url}: unexpected status {status}"
            ))),
        }
    }

    /// The public URL of a file on this cache, for server-side fetches.
    pub fn url_of(&self, filename: &str) -> CacheResult<String> {
        Ok(self.artifacts_url(filename)?.to_string())
    }
}
