//! HTTP metadata fetcher.

use std::time::Duration;
use ticketchain_core::{EventMetadata, LedgerError, LedgerFuture, MetadataFetcher};
use url::Url;

/// Fetches event metadata over `http`/`https`.
#[derive(Clone, Debug)]
pub struct HttpMetadataFetcher {
    client: reqwest::Client,
}

impl HttpMetadataFetcher {
    /// Create a fetcher whose requests are bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::MetadataFetch`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::MetadataFetch(e.to_string()))?;
        Ok(Self { client })
    }
}

/// Parse a locator, accepting only `http` and `https`.
///
/// # Errors
///
/// Returns [`LedgerError::MetadataFetch`] for anything else.
pub fn parse_locator(uri: &str) -> Result<Url, LedgerError> {
    let url = Url::parse(uri.trim())
        .map_err(|e| LedgerError::MetadataFetch(format!("invalid locator '{uri}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(LedgerError::MetadataFetch(format!(
            "unsupported scheme '{scheme}' in '{uri}'"
        ))),
    }
}

impl MetadataFetcher for HttpMetadataFetcher {
    fn fetch<'a>(&'a self, uri: &'a str) -> LedgerFuture<'a, EventMetadata> {
        Box::pin(async move {
            let url = parse_locator(uri)?;
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| LedgerError::MetadataFetch(format!("{uri}: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(LedgerError::MetadataFetch(format!(
                    "{uri}: HTTP {}",
                    status.as_u16()
                )));
            }

            let metadata: EventMetadata = response
                .json()
                .await
                .map_err(|e| LedgerError::MetadataFetch(format!("{uri}: not JSON metadata: {e}")))?;
            if metadata.image.trim().is_empty() {
                return Err(LedgerError::MetadataFetch(format!("{uri}: document has no image")));
            }
            Ok(metadata.normalized())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_http_locators_are_accepted() {
        assert!(parse_locator("https://example.com/a.json").is_ok());
        assert!(parse_locator(" http://127.0.0.1:8080/a.json ").is_ok());
        assert!(parse_locator("ipfs://bafy/1.json").is_err());
        assert!(parse_locator("not a url").is_err());
        assert!(parse_locator("").is_err());
    }
}
