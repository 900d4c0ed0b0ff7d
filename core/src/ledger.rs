//! The ledger trait and transaction types.
//!
//! [`Ledger`] is the seam between the client and the contract. The production
//! implementation speaks JSON-RPC; tests use an in-memory simulation. Both are
//! shared as `Arc<dyn Ledger>`, so every method returns a boxed future.

use crate::error::LedgerError;
use crate::notification::{LedgerEventKind, NotificationEnvelope};
use crate::types::{
    Address, BlockNumber, EventId, EventRecord, OwnershipEntry, TokenId, TxHash,
};
use crate::units::Wei;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by ledger operations.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Safety margin added on top of every gas estimate, in percent.
pub const GAS_SAFETY_MARGIN_PERCENT: u64 = 20;

/// Apply [`GAS_SAFETY_MARGIN_PERCENT`] to a gas estimate.
///
/// ```
/// use ticketchain_core::with_safety_margin;
///
/// assert_eq!(with_safety_margin(100_000), 120_000);
/// ```
#[must_use]
pub const fn with_safety_margin(estimate: u64) -> u64 {
    estimate.saturating_add(estimate.saturating_mul(GAS_SAFETY_MARGIN_PERCENT) / 100)
}

/// A state-changing contract call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractWrite {
    /// `createEvent(name, price, maxResalePrice, royaltyPercentage, eventURI)`
    CreateEvent {
        /// Display name
        name: String,
        /// Primary-sale price
        price: Wei,
        /// Resale cap
        max_resale_price: Wei,
        /// Organizer royalty on resale, percent
        royalty_percentage: u8,
        /// Metadata locator
        metadata_uri: String,
    },
    /// `mintTicket(eventId)`, payable
    MintTicket {
        /// Event to mint for
        event_id: EventId,
    },
    /// `listTicket(tokenId, price)`
    ListTicket {
        /// Ticket to list
        token_id: TokenId,
        /// Asking price
        price: Wei,
    },
    /// `cancelListing(tokenId)`
    CancelListing {
        /// Ticket to delist
        token_id: TokenId,
    },
    /// `buyTicket(tokenId)`, payable
    BuyTicket {
        /// Ticket to buy
        token_id: TokenId,
    },
    /// `deleteEvent(eventId)`
    DeleteEvent {
        /// Event to delete
        event_id: EventId,
    },
}

impl ContractWrite {
    /// Contract method name.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::CreateEvent { .. } => "createEvent",
            Self::MintTicket { .. } => "mintTicket",
            Self::ListTicket { .. } => "listTicket",
            Self::CancelListing { .. } => "cancelListing",
            Self::BuyTicket { .. } => "buyTicket",
            Self::DeleteEvent { .. } => "deleteEvent",
        }
    }

    /// Token the call targets, if any.
    #[must_use]
    pub const fn token_id(&self) -> Option<TokenId> {
        match self {
            Self::ListTicket { token_id, .. }
            | Self::CancelListing { token_id }
            | Self::BuyTicket { token_id } => Some(*token_id),
            _ => None,
        }
    }

    /// Event the call targets, if any.
    #[must_use]
    pub const fn event_id(&self) -> Option<EventId> {
        match self {
            Self::MintTicket { event_id } | Self::DeleteEvent { event_id } => Some(*event_id),
            _ => None,
        }
    }

    /// Whether the method accepts a payment.
    #[must_use]
    pub const fn is_payable(&self) -> bool {
        matches!(self, Self::MintTicket { .. } | Self::BuyTicket { .. })
    }
}

/// A transaction ready for estimation and submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Signing account
    pub from: Address,
    /// Contract call
    pub call: ContractWrite,
    /// Payment attached to the call
    pub value: Wei,
    /// Gas limit; filled from the estimate when `None`
    pub gas_limit: Option<u64>,
}

impl TransactionRequest {
    /// A request without payment.
    #[must_use]
    pub const fn new(from: Address, call: ContractWrite) -> Self {
        Self {
            from,
            call,
            value: Wei::ZERO,
            gas_limit: None,
        }
    }

    /// Attach a payment.
    #[must_use]
    pub const fn with_value(mut self, value: Wei) -> Self {
        self.value = value;
        self
    }

    /// Set an explicit gas limit.
    #[must_use]
    pub const fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }
}

/// Outcome of a mined transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Transaction hash
    pub tx_hash: TxHash,
    /// Block that included it
    pub block_number: BlockNumber,
    /// `false` if execution reverted
    pub success: bool,
    /// Gas consumed
    pub gas_used: u64,
    /// Revert reason, when the node reports one for a failed transaction
    pub revert_reason: Option<String>,
    /// Notifications emitted by the transaction
    pub notifications: Vec<NotificationEnvelope>,
}

impl Receipt {
    /// Error describing a failed receipt, `None` when it succeeded.
    #[must_use]
    pub fn failure(&self) -> Option<LedgerError> {
        if self.success {
            return None;
        }
        Some(LedgerError::Revert {
            reason: self
                .revert_reason
                .clone()
                .unwrap_or_else(|| "transaction reverted without a reason".to_string()),
        })
    }
}

/// Which notifications to fetch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotificationFilter {
    /// Restrict to these kinds; empty means all
    pub kinds: Vec<LedgerEventKind>,
    /// First block, inclusive
    pub from_block: BlockNumber,
    /// Last block, inclusive; `None` means the current head
    pub to_block: Option<BlockNumber>,
}

impl NotificationFilter {
    /// All kinds from `from_block` to the head.
    #[must_use]
    pub const fn from_block(from_block: BlockNumber) -> Self {
        Self {
            kinds: Vec::new(),
            from_block,
            to_block: None,
        }
    }

    /// Restrict to a single kind.
    #[must_use]
    pub fn with_kind(mut self, kind: LedgerEventKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Stop at `to_block`.
    #[must_use]
    pub const fn until(mut self, to_block: BlockNumber) -> Self {
        self.to_block = Some(to_block);
        self
    }

    /// Whether a notification of `kind` passes the filter.
    #[must_use]
    pub fn accepts(&self, kind: LedgerEventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// Access to the ticketing contract.
///
/// # Read path
///
/// Read methods are bounded by the implementation's read timeout and fail with
/// [`LedgerError::Rpc`] on transport problems or [`LedgerError::Revert`] when the
/// contract rejects the call. [`Ledger::owner_of`] reports unminted tokens as
/// [`LedgerError::NonexistentToken`].
///
/// # Write path
///
/// Writes are split into three phases so callers can observe each one:
/// [`Ledger::estimate_gas`], [`Ledger::submit`] (signature and broadcast) and
/// [`Ledger::wait_for_receipt`]. [`Ledger::send`] runs all three with the gas
/// safety margin applied.
///
/// # Dyn Compatibility
///
/// Methods return [`LedgerFuture`] instead of using `async fn` so the trait can be
/// shared as `Arc<dyn Ledger>` by the reconciler, subscriber and intent effects.
pub trait Ledger: Send + Sync {
    /// Chain id of the connected network.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Rpc`] if the node is unreachable.
    fn chain_id(&self) -> LedgerFuture<'_, u64>;

    /// Current head block.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Rpc`] if the node is unreachable.
    fn block_number(&self) -> LedgerFuture<'_, BlockNumber>;

    /// `showEvents()`: every event slot, including deleted ones.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on transport or decode failure.
    fn show_events(&self) -> LedgerFuture<'_, Vec<EventRecord>>;

    /// `showListedTickets()`: ids of tokens currently for sale.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on transport or decode failure.
    fn show_listed_tickets(&self) -> LedgerFuture<'_, Vec<TokenId>>;

    /// `getOwnedTickets(owner)`: ids of tokens held by `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on transport or decode failure.
    fn owned_tickets(&self, owner: Address) -> LedgerFuture<'_, Vec<TokenId>>;

    /// ERC-721 `ownerOf(tokenId)`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NonexistentToken`] for tokens that were never minted.
    fn owner_of(&self, token_id: TokenId) -> LedgerFuture<'_, Address>;

    /// `getEventForTicket(tokenId)`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on transport failure or if the token is unknown.
    fn event_for_ticket(&self, token_id: TokenId) -> LedgerFuture<'_, EventRecord>;

    /// `getTicketOwners(tokenId)`: ownership history with listing flags.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on transport failure or if the token is unknown.
    fn ticket_owners(&self, token_id: TokenId) -> LedgerFuture<'_, Vec<OwnershipEntry>>;

    /// Estimate gas for `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::GasEstimation`] when the call would revert, or
    /// [`LedgerError::InsufficientFunds`] when the account cannot pay.
    fn estimate_gas<'a>(&'a self, tx: &'a TransactionRequest) -> LedgerFuture<'a, u64>;

    /// Sign and broadcast `tx`.
    ///
    /// Signature prompts are serialized: at most one is outstanding at a time.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UserRejected`] if the holder declines, or
    /// [`LedgerError::InsufficientFunds`] when the account cannot pay.
    fn submit(&self, tx: TransactionRequest) -> LedgerFuture<'_, TxHash>;

    /// Wait until `tx_hash` is mined.
    ///
    /// With `timeout = None` the wait has no hard deadline.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ReceiptTimeout`] when the deadline passes first. The
    /// transaction may still be mined afterwards.
    fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Option<Duration>,
    ) -> LedgerFuture<'_, Receipt>;

    /// Notifications in the filter's block range, ordered by position.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Rpc`] on transport failure.
    fn notifications(&self, filter: NotificationFilter)
    -> LedgerFuture<'_, Vec<NotificationEnvelope>>;

    /// Estimate, sign, broadcast and wait.
    ///
    /// An explicit `gas_limit` on the request is kept; otherwise the estimate plus
    /// the safety margin is used. Estimation always runs, so a call that would
    /// revert is never sent.
    ///
    /// # Errors
    ///
    /// Any error of the three phases. A mined but reverted transaction is returned
    /// as [`LedgerError::Revert`].
    fn send(&self, mut tx: TransactionRequest, timeout: Option<Duration>) -> LedgerFuture<'_, Receipt> {
        Box::pin(async move {
            let estimate = self.estimate_gas(&tx).await?;
            if tx.gas_limit.is_none() {
                tx.gas_limit = Some(with_safety_margin(estimate));
            }
            let tx_hash = self.submit(tx).await?;
            let receipt = self.wait_for_receipt(tx_hash, timeout).await?;
            match receipt.failure() {
                Some(error) => Err(error),
                None => Ok(receipt),
            }
        })
    }
}
