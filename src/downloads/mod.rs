pub mod queue;
pub mod transfer;

pub use queue::DownloadQueue;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not get content length from server")]
    NoContentLength,
    #[error("server returned status {0}")]
    Status(u16),
    #[error("Download cancelled by user")]
    Cancelled,
    #[error("range worker aborted")]
    Aborted,
}

/// Ids of downloads whose cancellation has been requested. Transfers consult
/// it cooperatively: at entry, after the HEAD, per streamed chunk, and after
/// all ranges complete.
#[derive(Clone, Default)]
pub struct CancelSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl CancelSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: &str) {
        self.inner.lock().unwrap().insert(id.to_string());
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().unwrap().remove(id);
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().contains(id)
    }
}
