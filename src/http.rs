// HTTP access for plugin downloads and forum thread scraping

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

pub const USER_AGENT: &str = concat!("tf2-provisioner/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Failed to create HTTP client: {0}")]
    Client(String),

    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Failed to write download from {url} to {}: {reason}", .dest.display())]
    Write {
        url: String,
        dest: PathBuf,
        reason: String,
    },
}

/// The two HTTP operations the installers need. Passed explicitly so the
/// resolver never relies on ambient session state.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// GET a page and return its body as text
    async fn get_text(&self, url: &str) -> Result<String, HttpError>;

    /// Download `url` into `dest`, replacing any existing file
    async fn download_to_file(&self, url: &str, dest: &Path) -> Result<(), HttpError>;
}

/// reqwest-backed implementation. No request timeout: a hung download
/// blocks the run until an operator intervenes.
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, HttpError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| HttpError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, HttpError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HttpError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(HttpError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl HttpFetch for HttpClient {
    async fn get_text(&self, url: &str) -> Result<String, HttpError> {
        tracing::debug!("GET {}", url);
        let response = self.send(url).await?;
        let bytes = response.bytes().await.map_err(|e| HttpError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        // Forum pages are not always valid UTF-8
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn download_to_file(&self, url: &str, dest: &Path) -> Result<(), HttpError> {
        tracing::info!("Downloading {} -> {:?}", url, dest);
        let response = self.send(url).await?;

        let write_error = |reason: String| HttpError::Write {
            url: url.to_string(),
            dest: dest.to_path_buf(),
            reason,
        };

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_error(e.to_string()))?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| write_error(e.to_string()))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| HttpError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| write_error(e.to_string()))?;
        }
        file.flush().await.map_err(|e| write_error(e.to_string()))?;
        Ok(())
    }
}

/// Canned pages and files for resolver tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeHttp {
        pages: HashMap<String, String>,
        files: HashMap<String, Vec<u8>>,
        pub requests: Mutex<Vec<String>>,
    }

    impl FakeHttp {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn page(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.to_string());
            self
        }

        pub fn file(mut self, url: &str, bytes: Vec<u8>) -> Self {
            self.files.insert(url.to_string(), bytes);
            self
        }

        pub fn requested(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpFetch for FakeHttp {
        async fn get_text(&self, url: &str) -> Result<String, HttpError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.pages.get(url).cloned().ok_or_else(|| HttpError::Status {
                url: url.to_string(),
                status: 404,
            })
        }

        async fn download_to_file(&self, url: &str, dest: &Path) -> Result<(), HttpError> {
            self.requests.lock().unwrap().push(url.to_string());
            let bytes = self.files.get(url).ok_or_else(|| HttpError::Status {
                url: url.to_string(),
                status: 404,
            })?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(dest, bytes).unwrap();
            Ok(())
        }
    }

    /// Build a gzipped tarball from (path, contents) pairs
    pub fn tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o600);
            header.set_cksum();
            builder.append_data(&mut header, path, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// Build a zip archive from (path, contents) pairs
    pub fn zip(entries: &[(&str, &str)]) -> Vec<u8> {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (path, contents) in entries {
            writer
                .start_file(*path, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }
}
