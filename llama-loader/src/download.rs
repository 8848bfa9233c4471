//! Streaming HTTP download of model files into the cache

use crate::cache::PARTIAL_SUFFIX;
use crate::error::ModelError;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use llama_common::{RetryConfig, RetryManager};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Draw an indicatif progress bar on stderr
    pub show_progress: bool,
    pub retry: RetryConfig,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            show_progress: true,
            retry: RetryConfig::default(),
        }
    }
}

/// Result of a completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub bytes: u64,
    /// Hex SHA-256 of the downloaded content
    pub sha256: String,
}

pub struct Downloader {
    client: reqwest::Client,
    options: DownloadOptions,
}

impl Downloader {
    pub fn new(options: DownloadOptions) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("avllm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ModelError::network(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, options })
    }

    /// Download `url` to `dest`, retrying transient network failures
    ///
    /// Data is streamed into `<dest>.part` and renamed into place only once
    /// the full body arrived, so an interrupted download never looks cached.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<DownloadReport, ModelError> {
        let retry = RetryManager::with_config(self.options.retry.clone());
        let operation = format!("download {}", url);
        let report = retry
            .retry(&operation, || self.download_once(url, dest))
            .await?;
        info!(
            "downloaded {} ({} bytes, sha256 {})",
            report.path.display(),
            report.bytes,
            report.sha256
        );
        Ok(report)
    }

    async fn download_once(&self, url: &str, dest: &Path) -> Result<DownloadReport, ModelError> {
        let partial = partial_path(dest);
        let result = self.stream_to(url, &partial).await;
        match result {
            Ok((bytes, sha256)) => {
                tokio::fs::rename(&partial, dest).await?;
                Ok(DownloadReport {
                    path: dest.to_path_buf(),
                    bytes,
                    sha256,
                })
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn stream_to(&self, url: &str, partial: &Path) -> Result<(u64, String), ModelError> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?.error_for_status()?;
        let total = response.content_length();

        let progress = self.progress_bar(total, partial);
        let mut file = tokio::fs::File::create(partial).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.set_position(written);
        }
        file.flush().await?;
        drop(file);

        if let Some(total) = total {
            if written != total {
                progress.abandon_with_message("Incomplete");
                return Err(ModelError::network(format!(
                    "connection closed after {} of {} bytes",
                    written, total
                )));
            }
        }
        progress.finish_with_message("Downloaded");

        Ok((written, format!("{:x}", hasher.finalize())))
    }

    fn progress_bar(&self, total: Option<u64>, partial: &Path) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(total.unwrap_or(0));
        let style = ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        let name = partial
            .file_name()
            .map(|n| n.to_string_lossy().trim_end_matches(PARTIAL_SUFFIX).to_string())
            .unwrap_or_default();
        bar.set_message(format!("Downloading {}", name));
        bar
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}
