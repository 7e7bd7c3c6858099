//! Resumable Core - range download engine
//!
//! Downloads an HTTP resource as a series of byte-range requests, recording
//! every confirmed window in a [`ProgressStore`]. An interrupted transfer
//! picks up at the first unconfirmed byte, and a change of the resource's
//! entity tag restarts it from zero so bytes of two versions never mix.
//!
//! ```no_run
//! # async fn run() -> Result<(), resumable_core::TransferError> {
//! use resumable_core::{download, HeaderMap};
//!
//! let payload = download("https://example.com/data.csv", HeaderMap::new()).await?;
//! println!("{} bytes", payload.len());
//! # Ok(())
//! # }
//! ```

mod engine;
mod error;
mod storage;

pub use engine::*;
pub use error::*;
pub use storage::*;

pub use bytes::Bytes;
pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use resumable_types::*;

/// Transfer task bound to the production HTTP transport
pub type Downloader = TransferTask<ReqwestTransport>;

impl Downloader {
    /// Build a downloader whose HTTP client honors `settings`
    pub fn with_settings(settings: TransferSettings) -> Result<Self, TransferError> {
        let transport = ReqwestTransport::new(&settings)?;
        Ok(TransferTask::new(transport, settings))
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Download `url` with default settings, keeping progress in memory
pub async fn download(url: &str, headers: HeaderMap) -> Result<Bytes, TransferError> {
    let store = MemoryStore::new();
    download_with_store(url, headers, &store).await
}

/// Download `url` with default settings, keeping progress in `store`.
///
/// Calling this again with the same store after a failure or a crash
/// resumes from the last confirmed range.
pub async fn download_with_store<S: ProgressStore>(
    url: &str,
    headers: HeaderMap,
    store: &S,
) -> Result<Bytes, TransferError> {
    let downloader = Downloader::with_settings(TransferSettings::default())?;
    downloader.run(url, &headers, store).await
}
