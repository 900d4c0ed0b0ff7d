//! Off-chain event metadata.

use crate::ledger::LedgerFuture;
use serde::{Deserialize, Serialize};

/// Image shown when an event has no usable metadata.
pub const PLACEHOLDER_IMAGE: &str = "/placeholder.svg?height=400&width=600";

/// JSON document referenced by an event's `metadataURI`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Image locator
    #[serde(default)]
    pub image: String,
    /// Arbitrary attributes, kept as raw JSON
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl EventMetadata {
    /// Metadata consisting only of the placeholder image.
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            image: PLACEHOLDER_IMAGE.to_string(),
            attributes: serde_json::Value::Null,
        }
    }

    /// Normalise a fetched document.
    ///
    /// Image locators pasted into metadata often carry stray whitespace or line
    /// breaks; both are stripped. An empty image becomes the placeholder.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let image: String = self
            .image
            .trim()
            .chars()
            .filter(|c| *c != '\n' && *c != '\r')
            .collect();
        self.image = if image.is_empty() {
            PLACEHOLDER_IMAGE.to_string()
        } else {
            image
        };
        self
    }

    /// Whether the image is the placeholder.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.image == PLACEHOLDER_IMAGE
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::placeholder()
    }
}

/// Fetches event metadata documents.
///
/// Implementations report every failure as [`LedgerError::MetadataFetch`](crate::LedgerError::MetadataFetch); callers
/// decide whether to degrade to [`EventMetadata::placeholder`].
pub trait MetadataFetcher: Send + Sync {
    /// Fetch and parse the document at `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::MetadataFetch`](crate::LedgerError::MetadataFetch) for malformed locators, non-2xx
    /// responses, non-JSON bodies or documents without an image.
    fn fetch<'a>(&'a self, uri: &'a str) -> LedgerFuture<'a, EventMetadata>;
}
