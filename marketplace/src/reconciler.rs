//! State reconciliation.
//!
//! The [`Reconciler`] is the only writer of the [`ViewModelCache`]. Full refreshes
//! rebuild one keyed set (an account's tickets, the listings, the event
//! catalogue); targeted reconciliation re-reads a single token or event after a
//! notification or a confirmed write.
//!
//! # Ordering
//!
//! Each [`RefreshKey`] has a FIFO gate. A request takes a sequence number before
//! it queues, so requests for the same key run one at a time and commit in the
//! order they were made. Every commit carries the ledger height read at the start
//! of the refresh; the cache refuses anything older than what it holds.
//!
//! # Partial failure
//!
//! A token whose `ownerOf` reports it as nonexistent is absent, not a failure.
//! Any other per-token error is logged and the token skipped. Metadata failures
//! degrade to [`PLACEHOLDER_IMAGE`]. Only failures of the enumeration itself (or of
//! the height read) fail a refresh, and then the cache is left untouched.

use crate::cache::{Commit, RefreshKey, ViewModelCache};
use crate::enumeration::TokenEnumeration;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use ticketchain_core::{
    Address, BlockNumber, EventId, EventMetadata, EventRecord, EventView, Ledger, LedgerError,
    MetadataFetcher, PLACEHOLDER_IMAGE, TicketRecord, TicketView, TokenId,
};
use ticketchain_runtime::{RetryPolicy, retry_ledger_read};
use tokio::sync::Mutex;

/// FIFO gate plus request counter for one refresh key.
#[derive(Debug, Default)]
struct KeyGate {
    issued: AtomicU64,
    turn: Mutex<()>,
}

impl KeyGate {
    fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Keeps the view-model cache consistent with the ledger.
pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    metadata: Arc<dyn MetadataFetcher>,
    enumeration: Arc<dyn TokenEnumeration>,
    cache: Arc<ViewModelCache>,
    gates: Mutex<HashMap<RefreshKey, Arc<KeyGate>>>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("enumeration", &self.enumeration.name())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Create a reconciler writing into `cache`.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        metadata: Arc<dyn MetadataFetcher>,
        enumeration: Arc<dyn TokenEnumeration>,
        cache: Arc<ViewModelCache>,
    ) -> Self {
        Self {
            ledger,
            metadata,
            enumeration,
            cache,
            gates: Mutex::new(HashMap::new()),
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for transient read failures.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The cache this reconciler writes.
    #[must_use]
    pub fn cache(&self) -> Arc<ViewModelCache> {
        Arc::clone(&self.cache)
    }

    /// Rebuild the set of tickets owned by `account`.
    ///
    /// Returns what this refresh observed. The cache is updated unless a newer
    /// observation already landed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the head block or the candidate list cannot be
    /// read. Per-token failures never fail the refresh.
    #[tracing::instrument(skip(self, account), fields(account = %account.short()))]
    pub async fn refresh_owned_tickets(&self, account: Address) -> Result<Vec<TicketView>, LedgerError> {
        let key = RefreshKey::Owned(account);
        let gate = self.gate(key).await;
        let seq = gate.issue();
        let _turn = gate.turn.lock().await;
        let started = Instant::now();

        let height = self.head().await?;
        let candidates = self
            .enumeration
            .owned_candidates(self.ledger.as_ref(), &self.retry, account)
            .await?;
        let tickets = self.load_tickets(&candidates, Some(account)).await;

        let commit = self.cache.commit_owned(account, seq, height, tickets.clone()).await;
        record_refresh("owned", commit, started, tickets.len());
        Ok(tickets)
    }

    /// Rebuild the set of tickets currently for sale.
    ///
    /// Listings priced above their event's resale cap are excluded.
    ///
    /// # Errors
    ///
    /// As [`Reconciler::refresh_owned_tickets`].
    #[tracing::instrument(skip(self))]
    pub async fn refresh_listings(&self) -> Result<Vec<TicketView>, LedgerError> {
        let gate = self.gate(RefreshKey::Listings).await;
        let seq = gate.issue();
        let _turn = gate.turn.lock().await;
        let started = Instant::now();

        let height = self.head().await?;
        let candidates = self
            .enumeration
            .listing_candidates(self.ledger.as_ref(), &self.retry)
            .await?;
        let tickets: Vec<TicketView> = self
            .load_tickets(&candidates, None)
            .await
            .into_iter()
            .filter(|view| view.record.for_sale && within_resale_cap(view))
            .collect();

        let commit = self.cache.commit_listings(seq, height, tickets.clone()).await;
        record_refresh("listings", commit, started, tickets.len());
        Ok(tickets)
    }

    /// Rebuild the event catalogue.
    ///
    /// Inactive events and deleted slots are left out.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the head block or `showEvents` cannot be read.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_events(&self) -> Result<Vec<EventView>, LedgerError> {
        let gate = self.gate(RefreshKey::Events).await;
        let seq = gate.issue();
        let _turn = gate.turn.lock().await;
        let started = Instant::now();

        let height = self.head().await?;
        let records = retry_ledger_read(&self.retry, || self.ledger.show_events()).await?;
        let listed: Vec<EventRecord> = records.into_iter().filter(EventRecord::is_listed).collect();
        let views = join_all(listed.into_iter().map(|record| async move {
            let metadata = self.event_metadata(&record).await;
            EventView { record, metadata }
        }))
        .await;

        let commit = self.cache.commit_events(seq, height, views.clone()).await;
        record_refresh("events", commit, started, views.len());
        Ok(views)
    }

    /// Re-read one token and update every cached set that may contain it.
    ///
    /// Returns the token's current view, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the token cannot be read; the cache keeps its
    /// previous entry.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_token(&self, token_id: TokenId) -> Result<Option<TicketView>, LedgerError> {
        let height = self.head().await?;
        let view = self.load_ticket(token_id, None).await?.map(|view| {
            if view.record.for_sale && !within_resale_cap(&view) {
                return unlisted(view);
            }
            view
        });
        if !self.cache.apply_token(token_id, height, view.clone()).await.applied() {
            tracing::debug!(%token_id, %height, "Token update superseded by a newer observation");
            metrics::counter!("reconciler.superseded", "key" => "token").increment(1);
        }
        Ok(view)
    }

    /// Re-read one event and update it, and its cached tickets, in the cache.
    ///
    /// Returns the event's current view, or `None` if it is no longer listed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the event list cannot be read.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_event(&self, event_id: EventId) -> Result<Option<EventView>, LedgerError> {
        let height = self.head().await?;
        let records = retry_ledger_read(&self.retry, || self.ledger.show_events()).await?;
        let record = records
            .into_iter()
            .find(|e| e.event_id == event_id)
            .filter(EventRecord::is_listed);
        let view = match record {
            Some(record) => {
                let metadata = self.event_metadata(&record).await;
                Some(EventView { record, metadata })
            },
            None => None,
        };
        if !self.cache.apply_event(event_id, height, view.clone()).await.applied() {
            tracing::debug!(%event_id, %height, "Event update superseded by a newer observation");
            metrics::counter!("reconciler.superseded", "key" => "event").increment(1);
        }
        Ok(view)
    }

    /// Make `account` the active account.
    ///
    /// The previous account's tickets are dropped from the cache. When an account
    /// is given its tickets are refreshed and returned.
    ///
    /// # Errors
    ///
    /// As [`Reconciler::refresh_owned_tickets`].
    #[tracing::instrument(skip(self))]
    pub async fn switch_account(&self, account: Option<Address>) -> Result<Vec<TicketView>, LedgerError> {
        if self.cache.switch_account(account).await {
            tracing::info!(account = ?account, "Active account changed");
            metrics::counter!("reconciler.account_switches").increment(1);
            self.prune_gates().await;
        }
        match account {
            Some(account) => self.refresh_owned_tickets(account).await,
            None => Ok(Vec::new()),
        }
    }

    /// Read the connected chain id; a chain different from the cached one clears
    /// the cache.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the chain id cannot be read.
    #[tracing::instrument(skip(self))]
    pub async fn switch_network(&self) -> Result<u64, LedgerError> {
        let chain_id = retry_ledger_read(&self.retry, || self.ledger.chain_id()).await?;
        if self.cache.switch_network(chain_id).await {
            tracing::info!(chain_id, "Connected network changed, cache cleared");
            metrics::counter!("reconciler.network_switches").increment(1);
            self.prune_gates().await;
        }
        Ok(chain_id)
    }

    async fn gate(&self, key: RefreshKey) -> Arc<KeyGate> {
        let mut gates = self.gates.lock().await;
        Arc::clone(gates.entry(key).or_default())
    }

    /// Forget idle gates of accounts whose tickets are no longer cached.
    async fn prune_gates(&self) {
        let cached: HashSet<Address> = self.cache.cached_accounts().await.into_iter().collect();
        self.gates.lock().await.retain(|key, gate| match key {
            RefreshKey::Owned(account) => cached.contains(account) || Arc::strong_count(gate) > 1,
            RefreshKey::Listings | RefreshKey::Events => true,
        });
    }

    async fn head(&self) -> Result<BlockNumber, LedgerError> {
        retry_ledger_read(&self.retry, || self.ledger.block_number()).await
    }

    /// Load candidates concurrently, skipping absent and failing tokens.
    async fn load_tickets(&self, candidates: &[TokenId], owner: Option<Address>) -> Vec<TicketView> {
        let unique: Vec<TokenId> = {
            let mut seen = HashSet::new();
            candidates.iter().copied().filter(|t| seen.insert(*t)).collect()
        };
        let loaded = join_all(unique.iter().map(|token| self.load_ticket(*token, owner))).await;

        let mut tickets = Vec::with_capacity(loaded.len());
        for (token_id, result) in unique.into_iter().zip(loaded) {
            match result {
                Ok(Some(view)) => tickets.push(view),
                Ok(None) => {},
                Err(err) => {
                    tracing::warn!(%token_id, error = %err, "Failed to load ticket, skipping");
                    metrics::counter!("reconciler.token_failures", "stage" => "load").increment(1);
                },
            }
        }
        tickets.sort_by_key(TicketView::token_id);
        tickets
    }

    /// Read one token's current state.
    ///
    /// `Ok(None)` when the token does not exist or is not held by `owner`.
    async fn load_ticket(
        &self,
        token_id: TokenId,
        owner: Option<Address>,
    ) -> Result<Option<TicketView>, LedgerError> {
        let Some(current_owner) =
            absent_as_none(retry_ledger_read(&self.retry, || self.ledger.owner_of(token_id)).await)?
                .filter(|holder| !holder.is_zero())
        else {
            return Ok(None);
        };
        if owner.is_some_and(|owner| owner != current_owner) {
            return Ok(None);
        }

        let Some(event) = absent_as_none(
            retry_ledger_read(&self.retry, || self.ledger.event_for_ticket(token_id)).await,
        )?
        else {
            return Ok(None);
        };
        let Some(history) = absent_as_none(
            retry_ledger_read(&self.retry, || self.ledger.ticket_owners(token_id)).await,
        )?
        else {
            return Ok(None);
        };

        let entry = history.iter().rev().find(|e| e.owner == current_owner);
        let record = TicketRecord::from_ownership(token_id, event.event_id, current_owner, entry);
        let image = self.event_metadata(&event).await.image;
        Ok(Some(TicketView::new(record, &event, image)))
    }

    /// Fetch an event's metadata, degrading to the placeholder.
    async fn event_metadata(&self, event: &EventRecord) -> EventMetadata {
        if event.metadata_uri.trim().is_empty() {
            return EventMetadata::placeholder();
        }
        match self.metadata.fetch(&event.metadata_uri).await {
            Ok(metadata) => metadata.normalized(),
            Err(err) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    uri = %event.metadata_uri,
                    error = %err,
                    image = PLACEHOLDER_IMAGE,
                    "Metadata unavailable, using placeholder"
                );
                metrics::counter!("reconciler.token_failures", "stage" => "metadata").increment(1);
                EventMetadata::placeholder()
            },
        }
    }
}

fn record_refresh(key: &'static str, commit: Commit, started: Instant, items: usize) {
    let elapsed = started.elapsed();
    metrics::counter!("reconciler.refreshes", "key" => key).increment(1);
    metrics::histogram!("reconciler.refresh.duration_ms", "key" => key)
        .record(elapsed.as_secs_f64() * 1000.0);
    match commit {
        Commit::Applied => {
            tracing::debug!(key, items, elapsed_ms = elapsed.as_millis(), "Refresh committed");
        },
        Commit::Superseded => {
            tracing::debug!(key, items, "Refresh superseded by a newer observation");
            metrics::counter!("reconciler.superseded", "key" => key).increment(1);
        },
    }
}

fn absent_as_none<T>(result: Result<T, LedgerError>) -> Result<Option<T>, LedgerError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_absence() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Listing price within the event's resale cap; logs violations.
fn within_resale_cap(view: &TicketView) -> bool {
    let Some(price) = view.record.listing_price else {
        return true;
    };
    if price <= view.max_resale_price {
        return true;
    }
    tracing::error!(
        token_id = %view.token_id(),
        %price,
        max_resale_price = %view.max_resale_price,
        "Listing exceeds the event's resale cap, excluding it"
    );
    metrics::counter!("reconciler.invariant_violations").increment(1);
    false
}

fn unlisted(mut view: TicketView) -> TicketView {
    view.record.for_sale = false;
    view.record.listing_price = None;
    view
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::enumeration::{BoundedScan, IndexedEnumeration};
    use std::time::Duration;
    use ticketchain_core::Wei;
    use ticketchain_testing::{InMemoryLedger, StaticMetadataFetcher};

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn reconciler(ledger: &InMemoryLedger, metadata: StaticMetadataFetcher) -> Reconciler {
        Reconciler::new(
            Arc::new(ledger.clone()),
            Arc::new(metadata),
            Arc::new(IndexedEnumeration),
            Arc::new(ViewModelCache::new()),
        )
        .with_retry(
            RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(1))
                .build(),
        )
    }

    #[tokio::test]
    async fn owned_refresh_resolves_images_per_event() {
        let ledger = InMemoryLedger::new();
        let event = ledger.create_event_with_uri(
            addr(9),
            "Concert",
            Wei::from(10u64),
            Wei::from(20u64),
            "https://meta.example/1.json",
        );
        let token = ledger.mint(addr(1), event);
        let metadata = StaticMetadataFetcher::new()
            .with_image("https://meta.example/1.json", "https://img.example/1.png");
        let fetches = metadata.clone();

        let reconciler = reconciler(&ledger, metadata);
        let owned = reconciler.refresh_owned_tickets(addr(1)).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].token_id(), token);
        assert_eq!(owned[0].image, "https://img.example/1.png");
        assert_eq!(owned[0].event_name, "Concert");
        assert_eq!(fetches.fetches(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let ledger = InMemoryLedger::new();
        let event = ledger.create_event(addr(9), "Concert", Wei::from(10u64), Wei::from(20u64));
        ledger.mint(addr(1), event);
        ledger.fail_next_reads(2);

        let reconciler = reconciler(&ledger, StaticMetadataFetcher::new());
        assert_eq!(reconciler.refresh_owned_tickets(addr(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enumeration_failure_leaves_cache_untouched() {
        let ledger = InMemoryLedger::new();
        let event = ledger.create_event(addr(9), "Concert", Wei::from(10u64), Wei::from(20u64));
        ledger.mint(addr(1), event);
        let reconciler = reconciler(&ledger, StaticMetadataFetcher::new());
        reconciler.refresh_owned_tickets(addr(1)).await.unwrap();

        ledger.fail_next_reads(10);
        let err = reconciler.refresh_owned_tickets(addr(1)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(reconciler.cache().owned_tickets(addr(1)).await.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_token_follows_a_sale() {
        let ledger = InMemoryLedger::new();
        let event = ledger.create_event(addr(9), "Concert", Wei::from(10u64), Wei::from(20u64));
        let token = ledger.mint(addr(1), event);
        ledger.list(addr(1), token, Wei::from(15u64));

        let reconciler = reconciler(&ledger, StaticMetadataFetcher::new());
        reconciler.refresh_owned_tickets(addr(1)).await.unwrap();
        reconciler.refresh_owned_tickets(addr(2)).await.unwrap();
        reconciler.refresh_listings().await.unwrap();
        assert_eq!(reconciler.cache().listings().await.len(), 1);

        assert!(ledger.buy(addr(2), token).success);
        let view = reconciler.reconcile_token(token).await.unwrap().unwrap();
        assert_eq!(view.record.current_owner, addr(2));
        assert!(!view.record.for_sale);

        let cache = reconciler.cache();
        assert!(cache.owned_tickets(addr(1)).await.is_empty());
        assert_eq!(cache.owned_tickets(addr(2)).await.len(), 1);
        assert!(cache.listings().await.is_empty());
    }

    #[tokio::test]
    async fn account_switch_forgets_gates_of_dropped_accounts() {
        let ledger = InMemoryLedger::new();
        let reconciler = reconciler(&ledger, StaticMetadataFetcher::new());
        reconciler.refresh_listings().await.unwrap();
        reconciler.switch_account(Some(addr(1))).await.unwrap();
        reconciler.switch_account(Some(addr(2))).await.unwrap();
        reconciler.switch_account(Some(addr(3))).await.unwrap();

        let mut keys: Vec<RefreshKey> = reconciler.gates.lock().await.keys().copied().collect();
        keys.sort_by_key(|key| format!("{key:?}"));
        assert_eq!(keys, vec![RefreshKey::Listings, RefreshKey::Owned(addr(3))]);

        ledger.set_chain_id(5);
        reconciler.switch_network().await.unwrap();
        let keys: Vec<RefreshKey> = reconciler.gates.lock().await.keys().copied().collect();
        assert_eq!(keys, vec![RefreshKey::Listings]);
    }

    #[tokio::test]
    async fn reconcile_token_reports_absence() {
        let ledger = InMemoryLedger::new();
        let reconciler = reconciler(&ledger, StaticMetadataFetcher::new());
        assert_eq!(reconciler.reconcile_token(TokenId(7)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn events_exclude_deleted_slots() {
        let ledger = InMemoryLedger::new();
        let kept = ledger.create_event(addr(9), "Concert", Wei::from(10u64), Wei::from(20u64));
        let gone = ledger.create_event(addr(9), "Opera", Wei::from(10u64), Wei::from(20u64));
        ledger.apply(ticketchain_core::TransactionRequest::new(
            addr(9),
            ticketchain_core::ContractWrite::DeleteEvent { event_id: gone },
        ));

        let reconciler = reconciler(&ledger, StaticMetadataFetcher::new());
        let events = reconciler.refresh_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].record.event_id, kept);
        assert!(events[0].metadata.is_placeholder());
        assert_eq!(reconciler.reconcile_event(gone).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bounded_scan_matches_indexed_enumeration() {
        let ledger = InMemoryLedger::new();
        let event = ledger.create_event(addr(9), "Concert", Wei::from(10u64), Wei::from(20u64));
        ledger.mint(addr(1), event);
        ledger.mint(addr(2), event);
        ledger.mint(addr(1), event);

        let indexed = reconciler(&ledger, StaticMetadataFetcher::new());
        let scanned = Reconciler::new(
            Arc::new(ledger.clone()),
            Arc::new(StaticMetadataFetcher::new()),
            Arc::new(BoundedScan::new(1, 10)),
            Arc::new(ViewModelCache::new()),
        );
        assert_eq!(
            indexed.refresh_owned_tickets(addr(1)).await.unwrap(),
            scanned.refresh_owned_tickets(addr(1)).await.unwrap()
        );
    }
}
