//! Canned metadata documents.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ticketchain_core::{EventMetadata, LedgerError, LedgerFuture, MetadataFetcher};

/// Metadata fetcher serving documents from a map.
///
/// Unknown locators fail the way an HTTP 404 would.
#[derive(Clone, Debug, Default)]
pub struct StaticMetadataFetcher {
    documents: Arc<Mutex<HashMap<String, Result<EventMetadata, String>>>>,
    fetches: Arc<AtomicUsize>,
    delays: Arc<Mutex<VecDeque<Duration>>>,
}

impl StaticMetadataFetcher {
    /// An empty fetcher: every locator is missing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `metadata` at `uri`.
    #[must_use]
    pub fn with_document(self, uri: &str, metadata: EventMetadata) -> Self {
        self.documents
            .lock()
            .unwrap()
            .insert(uri.to_string(), Ok(metadata));
        self
    }

    /// Serve an image-only document at `uri`.
    #[must_use]
    pub fn with_image(self, uri: &str, image: &str) -> Self {
        let metadata = EventMetadata {
            image: image.to_string(),
            ..EventMetadata::placeholder()
        };
        self.with_document(uri, metadata)
    }

    /// Fail fetches of `uri` with `reason`.
    #[must_use]
    pub fn with_failure(self, uri: &str, reason: &str) -> Self {
        self.documents
            .lock()
            .unwrap()
            .insert(uri.to_string(), Err(reason.to_string()));
        self
    }

    /// Hold the next fetches open, one delay each.
    pub fn delay_next_fetches(&self, delays: impl IntoIterator<Item = Duration>) {
        self.delays.lock().unwrap().extend(delays);
    }

    /// Number of fetches performed.
    #[must_use]
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl MetadataFetcher for StaticMetadataFetcher {
    fn fetch<'a>(&'a self, uri: &'a str) -> LedgerFuture<'a, EventMetadata> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let delay = self.delays.lock().unwrap().pop_front();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match self.documents.lock().unwrap().get(uri) {
                Some(Ok(metadata)) => Ok(metadata.clone().normalized()),
                Some(Err(reason)) => Err(LedgerError::MetadataFetch(reason.clone())),
                None => Err(LedgerError::MetadataFetch(format!("{uri}: HTTP 404"))),
            }
        })
    }
}
