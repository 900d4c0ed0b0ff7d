//! Candidate token enumeration.
//!
//! The reconciler asks a [`TokenEnumeration`] which token ids might belong to an
//! account or be for sale, then verifies each candidate itself. Strategies differ
//! only in how they find candidates. Every ledger read a strategy makes goes
//! through the reconciler's [`RetryPolicy`].

use crate::config::EnumerationStrategy;
use std::sync::Arc;
use ticketchain_core::{Address, LedgerError, LedgerFuture, TokenId, ledger::Ledger};
use ticketchain_runtime::{RetryPolicy, retry_ledger_read};

/// Source of candidate token ids.
pub trait TokenEnumeration: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Tokens that may be owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if enumeration fails
    /// once `retry` is exhausted. Deterministic per-token failures of a scan are
    /// skipped.
    fn owned_candidates<'a>(
        &'a self,
        ledger: &'a dyn Ledger,
        retry: &'a RetryPolicy,
        owner: Address,
    ) -> LedgerFuture<'a, Vec<TokenId>>;

    /// Tokens that may be for sale.
    ///
    /// # Errors
    ///
    /// As [`TokenEnumeration::owned_candidates`].
    fn listing_candidates<'a>(
        &'a self,
        ledger: &'a dyn Ledger,
        retry: &'a RetryPolicy,
    ) -> LedgerFuture<'a, Vec<TokenId>>;
}

/// Uses the contract's own indexes.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexedEnumeration;

impl TokenEnumeration for IndexedEnumeration {
    fn name(&self) -> &'static str {
        "indexed"
    }

    fn owned_candidates<'a>(
        &'a self,
        ledger: &'a dyn Ledger,
        retry: &'a RetryPolicy,
        owner: Address,
    ) -> LedgerFuture<'a, Vec<TokenId>> {
        Box::pin(retry_ledger_read(retry, move || ledger.owned_tickets(owner)))
    }

    fn listing_candidates<'a>(
        &'a self,
        ledger: &'a dyn Ledger,
        retry: &'a RetryPolicy,
    ) -> LedgerFuture<'a, Vec<TokenId>> {
        Box::pin(retry_ledger_read(retry, move || ledger.show_listed_tickets()))
    }
}

/// Reads `ownerOf` over a fixed inclusive id range.
///
/// For contracts without an index. Ids that were never minted are absent, not
/// errors; tokens beyond `last` are never seen. A transport failure that
/// outlasts the retry policy fails the scan rather than hiding a token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundedScan {
    /// First id scanned
    pub first: u64,
    /// Last id scanned
    pub last: u64,
}

impl BoundedScan {
    /// Scan `first..=last`.
    #[must_use]
    pub const fn new(first: u64, last: u64) -> Self {
        Self { first, last }
    }

    /// Existing tokens in range with their owners.
    async fn owners(
        &self,
        ledger: &dyn Ledger,
        retry: &RetryPolicy,
    ) -> Result<Vec<(TokenId, Address)>, LedgerError> {
        let mut found = Vec::new();
        for id in self.first..=self.last {
            let token = TokenId(id);
            match retry_ledger_read(retry, || ledger.owner_of(token)).await {
                Ok(owner) => found.push((token, owner)),
                Err(err) if err.is_absence() => {},
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => {
                    tracing::warn!(%token, error = %err, "ownerOf failed during scan, skipping");
                    metrics::counter!("reconciler.token_failures", "stage" => "scan").increment(1);
                },
            }
        }
        Ok(found)
    }
}

impl Default for BoundedScan {
    fn default() -> Self {
        let (first, last) = crate::config::DEFAULT_SCAN_RANGE;
        Self::new(first, last)
    }
}

impl TokenEnumeration for BoundedScan {
    fn name(&self) -> &'static str {
        "bounded-scan"
    }

    fn owned_candidates<'a>(
        &'a self,
        ledger: &'a dyn Ledger,
        retry: &'a RetryPolicy,
        owner: Address,
    ) -> LedgerFuture<'a, Vec<TokenId>> {
        Box::pin(async move {
            Ok(self
                .owners(ledger, retry)
                .await?
                .into_iter()
                .filter(|(_, holder)| *holder == owner)
                .map(|(token, _)| token)
                .collect())
        })
    }

    fn listing_candidates<'a>(
        &'a self,
        ledger: &'a dyn Ledger,
        retry: &'a RetryPolicy,
    ) -> LedgerFuture<'a, Vec<TokenId>> {
        Box::pin(async move {
            Ok(self
                .owners(ledger, retry)
                .await?
                .into_iter()
                .map(|(token, _)| token)
                .collect())
        })
    }
}

/// Build the strategy selected in configuration.
#[must_use]
pub fn from_strategy(strategy: EnumerationStrategy) -> Arc<dyn TokenEnumeration> {
    match strategy {
        EnumerationStrategy::Indexed => Arc::new(IndexedEnumeration),
        EnumerationStrategy::BoundedScan { first, last } => Arc::new(BoundedScan::new(first, last)),
    }
}
