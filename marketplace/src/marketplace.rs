//! Composition root and presentation facade.
//!
//! [`Marketplace::connect`] builds one ledger client for the configured endpoint
//! and contract and hands it, as `Arc<dyn Ledger>`, to the reconciler, the
//! subscriber and the write-intent store. The facade exposes read-only cache
//! snapshots and one method per write intent; it never mutates the cache itself.

use crate::cache::ViewModelCache;
use crate::config::{Config, ConfigError};
use crate::enumeration;
use crate::intent::{
    IntentAction, IntentEnvironment, IntentError, IntentId, IntentRecord, IntentReducer,
    IntentState, WriteIntent,
};
use crate::reconciler::Reconciler;
use crate::subscriber::{Subscriber, SubscriptionHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use ticketchain_core::{
    Address, BlockNumber, EventId, EventView, Ledger, LedgerError, MetadataFetcher, SignerGate,
    TicketView, TokenId, Wei, environment::{Clock, SystemClock},
};
use ticketchain_rpc::{HttpMetadataFetcher, RpcLedger};
use ticketchain_runtime::{Store, StoreError};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Store executing write intents.
pub type IntentStore = Store<IntentState, IntentAction, IntentEnvironment, IntentReducer>;

/// Errors of the marketplace facade.
#[derive(Error, Debug)]
pub enum MarketplaceError {
    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A ledger read failed
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The intent was refused before reaching the ledger
    #[error(transparent)]
    Intent(#[from] IntentError),

    /// The intent store is unavailable
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The node serves a different chain than configured
    #[error("Connected to chain {actual}, expected {expected}")]
    WrongNetwork {
        /// Configured chain id
        expected: u64,
        /// Chain id reported by the node
        actual: u64,
    },

    /// A write needs an active account
    #[error("No account connected")]
    NoAccount,

    /// The ticket does not exist
    #[error("Unknown ticket {0}")]
    UnknownTicket(TokenId),

    /// The event does not exist or was deleted
    #[error("Unknown event {0}")]
    UnknownEvent(EventId),

    /// The ticket is not listed, so it cannot be bought
    #[error("{0} is not for sale")]
    NotForSale(TokenId),
}

/// The marketplace client.
pub struct Marketplace {
    config: Config,
    ledger: Arc<dyn Ledger>,
    reconciler: Arc<Reconciler>,
    subscriber: Subscriber,
    intents: IntentStore,
    next_intent: AtomicU64,
}

impl std::fmt::Debug for Marketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marketplace")
            .field("rpc_url", &self.config.rpc_url.as_str())
            .field("contract", &self.config.contract_address)
            .field("reconciler", &self.reconciler)
            .field("subscriber", &self.subscriber)
            .finish_non_exhaustive()
    }
}

impl Marketplace {
    /// Connect to the configured node and contract.
    ///
    /// # Errors
    ///
    /// Returns [`MarketplaceError::WrongNetwork`] if the node serves another chain,
    /// or the [`LedgerError`] of the first failed read.
    #[tracing::instrument(skip(config), fields(rpc_url = %config.rpc_url, contract = %config.contract_address))]
    pub async fn connect(config: Config) -> Result<Self, MarketplaceError> {
        let ledger = RpcLedger::new(
            config.rpc_url.clone(),
            config.contract_address,
            config.read_timeout,
            SignerGate::new(),
        )?;
        let metadata = HttpMetadataFetcher::new(config.metadata_timeout)?;
        Self::from_parts(config, Arc::new(ledger), Arc::new(metadata), Arc::new(SystemClock)).await
    }

    /// Assemble the client around an existing ledger and metadata source.
    ///
    /// Verifies the chain id and, when the configuration names an account,
    /// loads its tickets.
    ///
    /// # Errors
    ///
    /// As [`Marketplace::connect`].
    pub async fn from_parts(
        config: Config,
        ledger: Arc<dyn Ledger>,
        metadata: Arc<dyn MetadataFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MarketplaceError> {
        let cache = Arc::new(ViewModelCache::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&ledger),
            metadata,
            enumeration::from_strategy(config.enumeration),
            cache,
        ));
        let subscriber = Subscriber::new(Arc::clone(&ledger), config.poll_interval);
        let intents = Store::new(
            IntentState::default(),
            IntentReducer,
            IntentEnvironment {
                ledger: Arc::clone(&ledger),
                reconciler: Some(Arc::clone(&reconciler)),
                clock,
                receipt_timeout: config.receipt_timeout,
            },
        );

        let marketplace = Self {
            config,
            ledger,
            reconciler,
            subscriber,
            intents,
            next_intent: AtomicU64::new(1),
        };
        marketplace.switch_network().await?;
        if let Some(account) = marketplace.config.account {
            marketplace.switch_account(Some(account)).await?;
        }
        tracing::info!(
            chain_id = marketplace.config.chain_id,
            enumeration = %marketplace.config.enumeration,
            "Marketplace connected"
        );
        Ok(marketplace)
    }

    // ----- read-only queries -------------------------------------------------

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The view-model cache, for read-only access.
    #[must_use]
    pub fn cache(&self) -> Arc<ViewModelCache> {
        self.reconciler.cache()
    }

    /// The reconciler behind the facade.
    #[must_use]
    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::clone(&self.reconciler)
    }

    /// Active account.
    pub async fn account(&self) -> Option<Address> {
        self.cache().account().await
    }

    /// Cached tickets of the active account.
    pub async fn my_tickets(&self) -> Vec<TicketView> {
        match self.account().await {
            Some(account) => self.cache().owned_tickets(account).await,
            None => Vec::new(),
        }
    }

    /// Cached listings.
    pub async fn listings(&self) -> Vec<TicketView> {
        self.cache().listings().await
    }

    /// Cached event catalogue.
    pub async fn events(&self) -> Vec<EventView> {
        self.cache().events().await
    }

    /// Current head block.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the node cannot be reached.
    pub async fn head(&self) -> Result<BlockNumber, MarketplaceError> {
        Ok(self.ledger.block_number().await?)
    }

    /// Phase and diagnostics of an intent.
    pub async fn intent(&self, id: IntentId) -> Option<IntentRecord> {
        self.intents.state(|s| s.get(id).cloned()).await
    }

    // ----- reconciliation ----------------------------------------------------

    /// Refresh the catalogue, the listings and the active account's tickets.
    ///
    /// # Errors
    ///
    /// Returns the first refresh failure; refreshes that succeeded stay committed.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(), MarketplaceError> {
        self.reconciler.refresh_events().await?;
        self.reconciler.refresh_listings().await?;
        if let Some(account) = self.account().await {
            self.reconciler.refresh_owned_tickets(account).await?;
        }
        Ok(())
    }

    /// Switch the active account, dropping the previous account's tickets.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the new account's tickets cannot be read.
    pub async fn switch_account(&self, account: Option<Address>) -> Result<Vec<TicketView>, MarketplaceError> {
        Ok(self.reconciler.switch_account(account).await?)
    }

    /// Re-read the chain id, clearing the cache if the network changed.
    ///
    /// # Errors
    ///
    /// Returns [`MarketplaceError::WrongNetwork`] if the node no longer serves the
    /// configured chain.
    pub async fn switch_network(&self) -> Result<u64, MarketplaceError> {
        let actual = self.reconciler.switch_network().await?;
        if actual != self.config.chain_id {
            tracing::error!(expected = self.config.chain_id, actual, "Wrong network");
            return Err(MarketplaceError::WrongNetwork {
                expected: self.config.chain_id,
                actual,
            });
        }
        Ok(actual)
    }

    /// Reconcile every notification from `from_block` onwards in the background.
    pub fn watch(&self, from_block: BlockNumber) -> (SubscriptionHandle, JoinHandle<()>) {
        self.subscriber
            .spawn_reconciliation(Arc::clone(&self.reconciler), None, from_block)
    }

    /// Stop a background watch. Returns `false` for unknown handles.
    pub fn unwatch(&self, handle: SubscriptionHandle) -> bool {
        self.subscriber.unsubscribe(handle)
    }

    /// The subscriber, for custom subscriptions.
    #[must_use]
    pub const fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    // ----- write intents -----------------------------------------------------

    /// Create an event.
    ///
    /// # Errors
    ///
    /// See [`Marketplace::execute`].
    pub async fn create_event(
        &self,
        name: &str,
        price: Wei,
        max_resale_price: Wei,
        royalty_percentage: u8,
        metadata_uri: &str,
    ) -> Result<IntentRecord, MarketplaceError> {
        self.execute(WriteIntent::CreateEvent {
            name: name.to_string(),
            price,
            max_resale_price,
            royalty_percentage,
            metadata_uri: metadata_uri.to_string(),
        })
        .await
    }

    /// Mint a ticket, paying the event's original price.
    ///
    /// # Errors
    ///
    /// Returns [`MarketplaceError::UnknownEvent`] if the event is not listed, or
    /// see [`Marketplace::execute`].
    pub async fn mint_ticket(&self, event_id: EventId) -> Result<IntentRecord, MarketplaceError> {
        let event = match self.cache().event(event_id).await {
            Some(event) => event,
            None => self
                .reconciler
                .reconcile_event(event_id)
                .await?
                .ok_or(MarketplaceError::UnknownEvent(event_id))?,
        };
        self.execute(WriteIntent::MintTicket {
            event_id,
            price: event.record.original_price,
        })
        .await
    }

    /// List an owned ticket for resale.
    ///
    /// # Errors
    ///
    /// Returns [`MarketplaceError::Intent`] if `price` is zero or above the
    /// event's resale cap, without contacting the ledger for the write.
    pub async fn list_ticket(&self, token_id: TokenId, price: Wei) -> Result<IntentRecord, MarketplaceError> {
        let ticket = self.ticket(token_id, false).await?;
        self.execute(WriteIntent::ListTicket {
            token_id,
            price,
            max_resale_price: ticket.max_resale_price,
        })
        .await
    }

    /// Withdraw a listing.
    ///
    /// # Errors
    ///
    /// See [`Marketplace::execute`].
    pub async fn cancel_listing(&self, token_id: TokenId) -> Result<IntentRecord, MarketplaceError> {
        self.execute(WriteIntent::CancelListing { token_id }).await
    }

    /// Buy a listed ticket at its current listing price.
    ///
    /// # Errors
    ///
    /// Returns [`MarketplaceError::NotForSale`] if the ticket is not listed, or see
    /// [`Marketplace::execute`].
    pub async fn buy_ticket(&self, token_id: TokenId) -> Result<IntentRecord, MarketplaceError> {
        let ticket = self.ticket(token_id, true).await?;
        let price = ticket
            .record
            .listing_price
            .filter(|_| ticket.record.for_sale)
            .ok_or(MarketplaceError::NotForSale(token_id))?;
        self.execute(WriteIntent::BuyTicket { token_id, price }).await
    }

    /// Delete an event.
    ///
    /// # Errors
    ///
    /// See [`Marketplace::execute`].
    pub async fn delete_event(&self, event_id: EventId) -> Result<IntentRecord, MarketplaceError> {
        self.execute(WriteIntent::DeleteEvent { event_id }).await
    }

    /// Run `intent` from the active account until it settles.
    ///
    /// Ledger failures do not make this fail: the returned record carries the
    /// final phase and the message for the account holder.
    ///
    /// # Errors
    ///
    /// Returns [`MarketplaceError::NoAccount`] without an active account,
    /// [`MarketplaceError::Intent`] if the intent is refused client-side, or
    /// [`MarketplaceError::Store`] if the intent store is shutting down.
    pub async fn execute(&self, intent: WriteIntent) -> Result<IntentRecord, MarketplaceError> {
        let from = self.account().await.ok_or(MarketplaceError::NoAccount)?;
        let id = IntentId(self.next_intent.fetch_add(1, Ordering::SeqCst));
        self.run(id, from, intent).await
    }

    /// Initiate `id` again with its last intent.
    ///
    /// A timed-out intent is re-confirmed rather than resubmitted.
    ///
    /// # Errors
    ///
    /// As [`Marketplace::execute`]. Unknown ids return `Ok(None)`.
    pub async fn resume(&self, id: IntentId) -> Result<Option<IntentRecord>, MarketplaceError> {
        let Some(record) = self.intent(id).await else {
            return Ok(None);
        };
        self.run(id, record.from, record.intent).await.map(Some)
    }

    /// Shut down the intent store, letting running effects finish.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownTimeout`] if effects are still running after
    /// `timeout`.
    pub async fn shutdown(&self, timeout: std::time::Duration) -> Result<(), MarketplaceError> {
        Ok(self.intents.shutdown(timeout).await?)
    }

    #[tracing::instrument(skip(self, intent), fields(method = intent.method()))]
    async fn run(&self, id: IntentId, from: Address, intent: WriteIntent) -> Result<IntentRecord, MarketplaceError> {
        let mut actions = self.intents.subscribe_actions();
        self.intents
            .send(IntentAction::Initiate { id, from, intent })
            .await?;

        loop {
            match actions.recv().await {
                Ok(IntentAction::Rejected { id: rejected, error }) if rejected == id => {
                    return Err(error.into());
                },
                Ok(action) if action.settles(id) => break,
                Ok(_) => {},
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Intent observer lagged");
                },
                Err(RecvError::Closed) => return Err(StoreError::ChannelClosed.into()),
            }
        }

        self.intent(id)
            .await
            .ok_or(MarketplaceError::Store(StoreError::ChannelClosed))
    }

    /// Cached ticket, or a fresh read when missing or when `fresh` is set.
    async fn ticket(&self, token_id: TokenId, fresh: bool) -> Result<TicketView, MarketplaceError> {
        if !fresh {
            if let Some(ticket) = self.cache().ticket(token_id).await {
                return Ok(ticket);
            }
        }
        self.reconciler
            .reconcile_token(token_id)
            .await?
            .ok_or(MarketplaceError::UnknownTicket(token_id))
    }
}
