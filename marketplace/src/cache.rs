//! Process-local view-model cache.
//!
//! The cache is a read-only mirror of ledger state for the presentation layer. It
//! is never authoritative. Every entry remembers the ledger height it was observed
//! at, and a write carrying an older height never replaces a newer entry.
//!
//! Only the reconciler mutates the cache: mutators are crate-private, and the
//! public surface returns owned snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use ticketchain_core::{Address, BlockNumber, EventId, EventView, TicketView, TokenId};
use tokio::sync::RwLock;

#[derive(Clone, Debug)]
struct Observed<T> {
    value: T,
    height: BlockNumber,
}

impl<T> Observed<T> {
    const fn new(value: T, height: BlockNumber) -> Self {
        Self { value, height }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    chain_id: Option<u64>,
    account: Option<Address>,
    tickets: BTreeMap<TokenId, Observed<TicketView>>,
    owned: HashMap<Address, Observed<BTreeSet<TokenId>>>,
    listings: Option<Observed<BTreeSet<TokenId>>>,
    events: BTreeMap<EventId, Observed<EventView>>,
    events_height: Option<BlockNumber>,
    // Newest observation of tokens that no cached set references.
    detached: BTreeMap<TokenId, Observed<Option<TicketView>>>,
    // Heights at which events were seen removed.
    removed_events: BTreeMap<EventId, BlockNumber>,
    // Sequence of the last committed refresh, per key.
    committed: HashMap<RefreshKey, u64>,
    generation: u64,
}

impl CacheState {
    fn accepts(current: Option<BlockNumber>, height: BlockNumber) -> bool {
        current.is_none_or(|current| height >= current)
    }

    fn token_height(&self, token: TokenId) -> Option<BlockNumber> {
        let held = self.tickets.get(&token).map(|t| t.height);
        held.max(self.detached.get(&token).map(|t| t.height))
    }

    fn event_height(&self, event: EventId) -> Option<BlockNumber> {
        let held = self.events.get(&event).map(|e| e.height);
        held.max(self.removed_events.get(&event).copied())
    }

    fn put_ticket(&mut self, view: TicketView, height: BlockNumber) -> bool {
        let token = view.token_id();
        if !Self::accepts(self.token_height(token), height) {
            return false;
        }
        self.detached.remove(&token);
        self.tickets.insert(token, Observed::new(view, height));
        true
    }

    /// Merge a set read at `height` with every newer token observation.
    ///
    /// A token observed later keeps its newer view when it still satisfies
    /// `member` and leaves the set otherwise.
    fn settle(
        &self,
        incoming: Vec<TicketView>,
        height: BlockNumber,
        member: impl Fn(&TicketView) -> bool,
    ) -> Vec<Observed<TicketView>> {
        let mut settled: BTreeMap<TokenId, Observed<TicketView>> = incoming
            .into_iter()
            .map(|view| (view.token_id(), Observed::new(view, height)))
            .collect();
        let held = self.tickets.iter().map(|(id, t)| (*id, t.height, Some(&t.value)));
        let detached = self.detached.iter().map(|(id, t)| (*id, t.height, t.value.as_ref()));
        for (token, observed, view) in held.chain(detached) {
            if observed <= height {
                continue;
            }
            match view.filter(|view| member(view)) {
                Some(view) => {
                    settled.insert(token, Observed::new(view.clone(), observed));
                },
                None => {
                    settled.remove(&token);
                },
            }
        }
        settled.into_values().collect()
    }

    fn collect(&self, ids: &BTreeSet<TokenId>) -> Vec<TicketView> {
        ids.iter()
            .filter_map(|id| self.tickets.get(id).map(|t| t.value.clone()))
            .collect()
    }

    fn referenced(&self, token: TokenId) -> bool {
        self.owned.values().any(|set| set.value.contains(&token))
            || self.listings.as_ref().is_some_and(|l| l.value.contains(&token))
    }

    fn drop_unreferenced(&mut self, candidates: impl IntoIterator<Item = TokenId>) {
        for token in candidates {
            if !self.referenced(token) {
                self.tickets.remove(&token);
            }
        }
    }

    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Identifies one refreshable set in the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefreshKey {
    /// Tickets owned by an account
    Owned(Address),
    /// Tickets currently for sale
    Listings,
    /// The event catalogue
    Events,
}

/// Outcome of a commit attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Commit {
    /// The cache now holds the new value
    Applied,
    /// A newer request or a higher ledger height already committed
    Superseded,
}

impl Commit {
    /// Whether the write landed.
    #[must_use]
    pub const fn applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Cached view models keyed by account and token id.
#[derive(Debug, Default)]
pub struct ViewModelCache {
    state: RwLock<CacheState>,
}

impl ViewModelCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tickets owned by `account`, in token order; empty if never refreshed.
    pub async fn owned_tickets(&self, account: Address) -> Vec<TicketView> {
        let state = self.state.read().await;
        state
            .owned
            .get(&account)
            .map(|set| state.collect(&set.value))
            .unwrap_or_default()
    }

    /// Tickets currently for sale, in token order.
    pub async fn listings(&self) -> Vec<TicketView> {
        let state = self.state.read().await;
        state
            .listings
            .as_ref()
            .map(|set| state.collect(&set.value))
            .unwrap_or_default()
    }

    /// Listed events, in id order.
    pub async fn events(&self) -> Vec<EventView> {
        self.state
            .read()
            .await
            .events
            .values()
            .map(|e| e.value.clone())
            .collect()
    }

    /// One cached ticket.
    pub async fn ticket(&self, token_id: TokenId) -> Option<TicketView> {
        self.state
            .read()
            .await
            .tickets
            .get(&token_id)
            .map(|t| t.value.clone())
    }

    /// One cached event.
    pub async fn event(&self, event_id: EventId) -> Option<EventView> {
        self.state
            .read()
            .await
            .events
            .get(&event_id)
            .map(|e| e.value.clone())
    }

    /// Height at which a ticket was last observed, including observations of
    /// tokens no cached set holds.
    pub async fn ticket_height(&self, token_id: TokenId) -> Option<BlockNumber> {
        self.state.read().await.token_height(token_id)
    }

    /// The active account.
    pub async fn account(&self) -> Option<Address> {
        self.state.read().await.account
    }

    /// The chain the cache was populated from.
    pub async fn chain_id(&self) -> Option<u64> {
        self.state.read().await.chain_id
    }

    /// Incremented on every applied change; lets observers detect staleness.
    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    /// Accounts whose owned set is cached.
    pub async fn cached_accounts(&self) -> Vec<Address> {
        let mut accounts: Vec<_> = self.state.read().await.owned.keys().copied().collect();
        accounts.sort();
        accounts
    }

    // ----- mutation (reconciler only) ----------------------------------------

    /// Replace the owned set of `account` in one step.
    ///
    /// Tokens observed above `height` since the read keep their newer view.
    pub(crate) async fn commit_owned(
        &self,
        account: Address,
        seq: u64,
        height: BlockNumber,
        tickets: Vec<TicketView>,
    ) -> Commit {
        let mut state = self.state.write().await;
        let key = RefreshKey::Owned(account);
        if state.committed.get(&key).is_some_and(|last| *last > seq)
            || !CacheState::accepts(state.owned.get(&account).map(|s| s.height), height)
        {
            return Commit::Superseded;
        }

        let tickets = state.settle(tickets, height, |view| view.record.current_owner == account);
        let ids: BTreeSet<TokenId> = tickets.iter().map(|t| t.value.token_id()).collect();
        let previous = state
            .owned
            .insert(account, Observed::new(ids, height))
            .map(|old| old.value)
            .unwrap_or_default();
        for ticket in tickets {
            state.put_ticket(ticket.value, ticket.height);
        }
        state.drop_unreferenced(previous);
        state.committed.insert(key, seq);
        state.bump();
        Commit::Applied
    }

    /// Replace the listing set in one step.
    pub(crate) async fn commit_listings(
        &self,
        seq: u64,
        height: BlockNumber,
        tickets: Vec<TicketView>,
    ) -> Commit {
        let mut state = self.state.write().await;
        if state.committed.get(&RefreshKey::Listings).is_some_and(|last| *last > seq)
            || !CacheState::accepts(state.listings.as_ref().map(|s| s.height), height)
        {
            return Commit::Superseded;
        }

        let tickets = state.settle(tickets, height, |view| view.record.for_sale);
        let ids: BTreeSet<TokenId> = tickets.iter().map(|t| t.value.token_id()).collect();
        let previous = state
            .listings
            .replace(Observed::new(ids, height))
            .map(|old| old.value)
            .unwrap_or_default();
        for ticket in tickets {
            state.put_ticket(ticket.value, ticket.height);
        }
        state.drop_unreferenced(previous);
        state.committed.insert(RefreshKey::Listings, seq);
        state.bump();
        Commit::Applied
    }

    /// Replace the event catalogue in one step.
    pub(crate) async fn commit_events(
        &self,
        seq: u64,
        height: BlockNumber,
        events: Vec<EventView>,
    ) -> Commit {
        let mut state = self.state.write().await;
        if state.committed.get(&RefreshKey::Events).is_some_and(|last| *last > seq)
            || !CacheState::accepts(state.events_height, height)
        {
            return Commit::Superseded;
        }
        let mut merged: BTreeMap<EventId, Observed<EventView>> = events
            .into_iter()
            .filter(|e| {
                state
                    .removed_events
                    .get(&e.record.event_id)
                    .is_none_or(|removed| *removed <= height)
            })
            .map(|e| (e.record.event_id, Observed::new(e, height)))
            .collect();
        for (id, event) in &state.events {
            if event.height > height {
                merged.insert(*id, event.clone());
            }
        }
        state.events = merged;
        state.events_height = Some(height);
        state.committed.insert(RefreshKey::Events, seq);
        state.bump();
        Commit::Applied
    }

    /// Record the fresh state of one token.
    ///
    /// `view = None` means the token no longer exists. Set membership follows the
    /// record: the token joins its owner's set if that set is cached, leaves every
    /// other owned set, and joins or leaves the listings according to `for_sale`.
    pub(crate) async fn apply_token(
        &self,
        token_id: TokenId,
        height: BlockNumber,
        view: Option<TicketView>,
    ) -> Commit {
        let mut state = self.state.write().await;
        if !CacheState::accepts(state.token_height(token_id), height) {
            return Commit::Superseded;
        }

        let owner = view.as_ref().map(|v| v.record.current_owner);
        let listed = view.as_ref().is_some_and(|v| v.record.for_sale);

        for (account, set) in &mut state.owned {
            if Some(*account) == owner {
                set.value.insert(token_id);
            } else {
                set.value.remove(&token_id);
            }
            set.height = set.height.max(height);
        }
        if let Some(listings) = state.listings.as_mut() {
            if listed {
                listings.value.insert(token_id);
            } else {
                listings.value.remove(&token_id);
            }
            listings.height = listings.height.max(height);
        }

        match view {
            Some(view) => {
                state.put_ticket(view, height);
                if !state.referenced(token_id) {
                    if let Some(held) = state.tickets.remove(&token_id) {
                        state.detached.insert(token_id, Observed::new(Some(held.value), height));
                    }
                }
            },
            None => {
                state.tickets.remove(&token_id);
                state.detached.insert(token_id, Observed::new(None, height));
            },
        }
        state.bump();
        Commit::Applied
    }

    /// Record the fresh state of one event.
    ///
    /// `view = None` removes the event from the catalogue. Cached tickets of the
    /// event get its current name and prices.
    pub(crate) async fn apply_event(
        &self,
        event_id: EventId,
        height: BlockNumber,
        view: Option<EventView>,
    ) -> Commit {
        let mut state = self.state.write().await;
        if !CacheState::accepts(state.event_height(event_id), height) {
            return Commit::Superseded;
        }

        match view {
            Some(view) => {
                for ticket in state.tickets.values_mut() {
                    if ticket.value.record.event_id == event_id && ticket.height <= height {
                        ticket.value.event_name.clone_from(&view.record.name);
                        ticket.value.original_price = view.record.original_price;
                        ticket.value.max_resale_price = view.record.max_resale_price;
                        ticket.height = height;
                    }
                }
                state.removed_events.remove(&event_id);
                state.events.insert(event_id, Observed::new(view, height));
            },
            None => {
                state.events.remove(&event_id);
                state.removed_events.insert(event_id, height);
            },
        }
        state.bump();
        Commit::Applied
    }

    /// Switch the active account. The previous account's owned set is dropped.
    pub(crate) async fn switch_account(&self, account: Option<Address>) -> bool {
        let mut state = self.state.write().await;
        if state.account == account {
            return false;
        }
        if let Some(previous) = state.account.take() {
            if let Some(set) = state.owned.remove(&previous) {
                state.committed.remove(&RefreshKey::Owned(previous));
                state.drop_unreferenced(set.value);
            }
        }
        state.account = account;
        state.bump();
        true
    }

    /// Record the connected chain. A different chain clears everything.
    pub(crate) async fn switch_network(&self, chain_id: u64) -> bool {
        let mut state = self.state.write().await;
        if state.chain_id == Some(chain_id) {
            return false;
        }
        let generation = state.generation;
        let account = state.account;
        *state = CacheState {
            chain_id: Some(chain_id),
            account,
            generation,
            ..CacheState::default()
        };
        state.bump();
        true
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use ticketchain_core::{EventMetadata, EventRecord, TicketRecord, Wei};

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn event(id: u64, name: &str) -> EventRecord {
        EventRecord {
            event_id: EventId(id),
            name: name.into(),
            organizer: addr(9),
            original_price: Wei::from(100u64),
            max_resale_price: Wei::from(150u64),
            royalty_percentage: 10,
            active: true,
            metadata_uri: String::new(),
        }
    }

    fn ticket(token: u64, owner: Address, listed: Option<u64>) -> TicketView {
        let record = TicketRecord {
            token_id: TokenId(token),
            event_id: EventId(1),
            current_owner: owner,
            for_sale: listed.is_some(),
            listing_price: listed.map(Wei::from),
        };
        TicketView::new(record, &event(1, "Concert"), "img".into())
    }

    #[tokio::test]
    async fn older_heights_never_overwrite() {
        let cache = ViewModelCache::new();
        let alice = addr(1);
        assert!(cache
            .commit_owned(alice, 1, BlockNumber(10), vec![ticket(1, alice, None)])
            .await
            .applied());
        assert_eq!(
            cache.commit_owned(alice, 2, BlockNumber(9), vec![]).await,
            Commit::Superseded
        );
        assert_eq!(cache.owned_tickets(alice).await.len(), 1);

        assert_eq!(
            cache.apply_token(TokenId(1), BlockNumber(5), None).await,
            Commit::Superseded
        );
        assert!(cache.ticket(TokenId(1)).await.is_some());
    }

    #[tokio::test]
    async fn earlier_requests_cannot_overwrite_later_ones() {
        let cache = ViewModelCache::new();
        let alice = addr(1);
        cache
            .commit_owned(alice, 2, BlockNumber(10), vec![ticket(2, alice, None)])
            .await;
        assert_eq!(
            cache
                .commit_owned(alice, 1, BlockNumber(10), vec![ticket(1, alice, None)])
                .await,
            Commit::Superseded
        );
        let owned = cache.owned_tickets(alice).await;
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].token_id(), TokenId(2));
    }

    #[tokio::test]
    async fn token_updates_move_set_membership() {
        let cache = ViewModelCache::new();
        let (alice, bob) = (addr(1), addr(2));
        cache
            .commit_owned(alice, 1, BlockNumber(1), vec![ticket(1, alice, Some(120))])
            .await;
        cache.commit_owned(bob, 1, BlockNumber(1), vec![]).await;
        cache
            .commit_listings(1, BlockNumber(1), vec![ticket(1, alice, Some(120))])
            .await;

        cache
            .apply_token(TokenId(1), BlockNumber(2), Some(ticket(1, bob, None)))
            .await;

        assert!(cache.owned_tickets(alice).await.is_empty());
        assert_eq!(cache.owned_tickets(bob).await.len(), 1);
        assert!(cache.listings().await.is_empty());
    }

    #[tokio::test]
    async fn account_switch_drops_previous_owned_set() {
        let cache = ViewModelCache::new();
        let alice = addr(1);
        cache.switch_account(Some(alice)).await;
        cache
            .commit_owned(alice, 1, BlockNumber(1), vec![ticket(1, alice, None)])
            .await;
        assert!(cache.switch_account(Some(addr(2))).await);
        assert!(cache.owned_tickets(alice).await.is_empty());
        assert!(cache.ticket(TokenId(1)).await.is_none());
        assert!(!cache.switch_account(Some(addr(2))).await);
    }

    #[tokio::test]
    async fn network_switch_clears_everything() {
        let cache = ViewModelCache::new();
        cache.switch_network(1337).await;
        cache
            .commit_events(
                1,
                BlockNumber(3),
                vec![EventView {
                    record: event(1, "Concert"),
                    metadata: EventMetadata::placeholder(),
                }],
            )
            .await;
        let before = cache.generation().await;
        assert!(!cache.switch_network(1337).await);
        assert!(cache.switch_network(1).await);
        assert!(cache.events().await.is_empty());
        assert_eq!(cache.chain_id().await, Some(1));
        assert!(cache.generation().await > before);
    }

    #[tokio::test]
    async fn targeted_updates_outlive_unreferenced_tokens() {
        let cache = ViewModelCache::new();
        let (alice, bob) = (addr(1), addr(2));
        cache
            .apply_token(TokenId(1), BlockNumber(5), Some(ticket(1, bob, None)))
            .await;
        assert!(cache.ticket(TokenId(1)).await.is_none());
        assert_eq!(cache.ticket_height(TokenId(1)).await, Some(BlockNumber(5)));

        cache
            .commit_owned(alice, 1, BlockNumber(4), vec![ticket(1, alice, None)])
            .await;
        assert!(cache.owned_tickets(alice).await.is_empty());

        cache
            .commit_owned(bob, 1, BlockNumber(4), vec![])
            .await;
        let owned = cache.owned_tickets(bob).await;
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].record.current_owner, bob);
    }

    #[tokio::test]
    async fn removed_events_stay_removed_for_older_catalogues() {
        let cache = ViewModelCache::new();
        let view = |id, name| EventView {
            record: event(id, name),
            metadata: EventMetadata::placeholder(),
        };
        cache.apply_event(EventId(1), BlockNumber(6), None).await;
        cache
            .apply_event(EventId(2), BlockNumber(6), Some(view(2, "Opera")))
            .await;

        cache
            .commit_events(1, BlockNumber(5), vec![view(1, "Concert")])
            .await;

        let names: Vec<String> = cache.events().await.into_iter().map(|e| e.record.name).collect();
        assert_eq!(names, vec!["Opera".to_string()]);
    }

    #[tokio::test]
    async fn event_updates_refresh_ticket_fields() {
        let cache = ViewModelCache::new();
        let alice = addr(1);
        cache
            .commit_owned(alice, 1, BlockNumber(1), vec![ticket(1, alice, None)])
            .await;
        cache
            .apply_event(
                EventId(1),
                BlockNumber(2),
                Some(EventView {
                    record: event(1, "Concert (moved)"),
                    metadata: EventMetadata::placeholder(),
                }),
            )
            .await;
        assert_eq!(
            cache.ticket(TokenId(1)).await.unwrap().event_name,
            "Concert (moved)"
        );
    }
}
