//! Write-intent state machine.
//!
//! Every user-initiated mutation runs through the same phases:
//!
//! ```text
//! Idle ─▶ Estimating ─▶ AwaitingSignature ─▶ Pending ─▶ Confirmed
//!  ▲          │                 │               ├────▶ Reverted
//!  └──────────┴─────────────────┘               └────▶ TimedOut
//! ```
//!
//! A failed estimate or a declined signature returns the intent to `Idle` with a
//! diagnostic and nothing is retried. `Confirmed` triggers a targeted
//! reconciliation of whatever the transaction touched. A `TimedOut` intent may
//! still land, so initiating it again first re-checks the receipt of the
//! transaction already sent and submits nothing new.
//!
//! The reducer is pure; ledger traffic happens in the effects it returns, run by
//! the runtime `Store`.

use crate::reconciler::Reconciler;
use crate::subscriber::reconcile_notification;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ticketchain_core::{
    Address, ContractWrite, EventId, Ledger, LedgerError, Receipt, SmallVec, TokenId,
    TransactionRequest, TxHash, Wei, async_effect, effect::Effect, environment::Clock,
    reducer::Reducer, smallvec, with_safety_margin,
};

/// Caller-chosen identifier of a write intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntentId(pub u64);

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "intent-{}", self.0)
    }
}

/// A user-initiated state change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteIntent {
    /// Create an event
    CreateEvent {
        /// Display name
        name: String,
        /// Primary-sale price
        price: Wei,
        /// Resale cap
        max_resale_price: Wei,
        /// Organizer royalty, percent
        royalty_percentage: u8,
        /// Metadata locator
        metadata_uri: String,
    },
    /// Buy a ticket at its event's primary price
    MintTicket {
        /// Event to mint for
        event_id: EventId,
        /// Payment, the event's original price
        price: Wei,
    },
    /// Offer an owned ticket for resale
    ListTicket {
        /// Ticket to list
        token_id: TokenId,
        /// Asking price
        price: Wei,
        /// The event's resale cap
        max_resale_price: Wei,
    },
    /// Withdraw a listing
    CancelListing {
        /// Ticket to delist
        token_id: TokenId,
    },
    /// Buy a listed ticket
    BuyTicket {
        /// Ticket to buy
        token_id: TokenId,
        /// Payment, the listing price
        price: Wei,
    },
    /// Delete an event (organizer only)
    DeleteEvent {
        /// Event to delete
        event_id: EventId,
    },
}

impl WriteIntent {
    /// Checks that never need the ledger.
    ///
    /// # Errors
    ///
    /// Returns the first [`IntentError`] the intent violates.
    pub fn validate(&self) -> Result<(), IntentError> {
        match self {
            Self::CreateEvent {
                name,
                price,
                max_resale_price,
                royalty_percentage,
                ..
            } => {
                if name.trim().is_empty() {
                    return Err(IntentError::MissingName);
                }
                if *royalty_percentage > 100 {
                    return Err(IntentError::RoyaltyOutOfRange(*royalty_percentage));
                }
                if max_resale_price < price {
                    return Err(IntentError::CapBelowPrice);
                }
                Ok(())
            },
            Self::ListTicket {
                price,
                max_resale_price,
                ..
            } => {
                if price.is_zero() {
                    return Err(IntentError::ZeroPrice);
                }
                if price > max_resale_price {
                    return Err(IntentError::AboveResaleCap {
                        price: *price,
                        max_resale_price: *max_resale_price,
                    });
                }
                Ok(())
            },
            Self::MintTicket { price, .. } | Self::BuyTicket { price, .. } => {
                if price.is_zero() {
                    return Err(IntentError::MissingPayment);
                }
                Ok(())
            },
            Self::CancelListing { .. } | Self::DeleteEvent { .. } => Ok(()),
        }
    }

    /// The transaction this intent sends from `from`.
    #[must_use]
    pub fn to_request(&self, from: Address) -> TransactionRequest {
        let (call, value) = match self.clone() {
            Self::CreateEvent {
                name,
                price,
                max_resale_price,
                royalty_percentage,
                metadata_uri,
            } => (
                ContractWrite::CreateEvent {
                    name,
                    price,
                    max_resale_price,
                    royalty_percentage,
                    metadata_uri,
                },
                Wei::ZERO,
            ),
            Self::MintTicket { event_id, price } => (ContractWrite::MintTicket { event_id }, price),
            Self::ListTicket { token_id, price, .. } => {
                (ContractWrite::ListTicket { token_id, price }, Wei::ZERO)
            },
            Self::CancelListing { token_id } => (ContractWrite::CancelListing { token_id }, Wei::ZERO),
            Self::BuyTicket { token_id, price } => (ContractWrite::BuyTicket { token_id }, price),
            Self::DeleteEvent { event_id } => (ContractWrite::DeleteEvent { event_id }, Wei::ZERO),
        };
        TransactionRequest::new(from, call).with_value(value)
    }

    /// Contract method name, for logs.
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
}

/// Why an intent was refused before reaching the ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntentError {
    /// Listing price of zero
    #[error("Listing price must be greater than zero.")]
    ZeroPrice,

    /// Listing price above the event's cap
    #[error("Price exceeds maximum resale value.")]
    AboveResaleCap {
        /// Requested price
        price: Wei,
        /// The event's cap
        max_resale_price: Wei,
    },

    /// Event without a name
    #[error("Event name is required.")]
    MissingName,

    /// Royalty above 100%
    #[error("Royalty percentage must be between 0 and 100, got {0}.")]
    RoyaltyOutOfRange(u8),

    /// Resale cap below the primary price
    #[error("Maximum resale price must be at least the ticket price.")]
    CapBelowPrice,

    /// Payable call without payment
    #[error("A payment is required.")]
    MissingPayment,

    /// The intent already has a transaction under way
    #[error("{0} is already in progress.")]
    InFlight(IntentId),
}

/// Where an intent is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentPhase {
    /// Nothing under way
    Idle,
    /// Gas estimation running
    Estimating,
    /// Waiting for the wallet signature
    AwaitingSignature,
    /// Broadcast, waiting to be mined
    Pending,
    /// Mined successfully
    Confirmed,
    /// Mined and reverted
    Reverted,
    /// No receipt in time; the transaction may still land
    TimedOut,
}

impl IntentPhase {
    /// Whether a transaction for the intent may be under way.
    #[must_use]
    pub const fn in_flight(self) -> bool {
        matches!(self, Self::Estimating | Self::AwaitingSignature | Self::Pending)
    }

    /// Phase name, for logs and metrics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Estimating => "estimating",
            Self::AwaitingSignature => "awaiting_signature",
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Reverted => "reverted",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for IntentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything known about one intent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntentRecord {
    /// What is being done
    pub intent: WriteIntent,
    /// Signing account
    pub from: Address,
    /// Current phase
    pub phase: IntentPhase,
    /// Number of submissions started
    pub attempts: u32,
    /// Gas limit sent, estimate plus margin
    pub gas_limit: Option<u64>,
    /// Hash of the latest submitted transaction
    pub tx_hash: Option<TxHash>,
    /// Receipt, once mined
    pub receipt: Option<Receipt>,
    /// Latest ledger failure
    pub error: Option<LedgerError>,
    /// Message to show the account holder
    pub message: Option<String>,
    /// Every phase entered, with its time
    pub history: Vec<(IntentPhase, DateTime<Utc>)>,
}

impl IntentRecord {
    fn enter(&mut self, phase: IntentPhase, at: DateTime<Utc>) {
        self.phase = phase;
        self.history.push((phase, at));
        metrics::counter!("intents.transitions", "phase" => phase.name()).increment(1);
    }

    fn fail(&mut self, phase: IntentPhase, error: LedgerError, at: DateTime<Utc>) {
        self.message = Some(error.user_message());
        self.error = Some(error);
        self.enter(phase, at);
    }
}

/// State of every intent of the session.
#[derive(Clone, Debug, Default)]
pub struct IntentState {
    intents: HashMap<IntentId, IntentRecord>,
    rejections: HashMap<IntentId, IntentError>,
}

impl IntentState {
    /// Record of `id`, if it was ever accepted.
    #[must_use]
    pub fn get(&self, id: IntentId) -> Option<&IntentRecord> {
        self.intents.get(&id)
    }

    /// Current phase of `id`.
    #[must_use]
    pub fn phase(&self, id: IntentId) -> Option<IntentPhase> {
        self.intents.get(&id).map(|r| r.phase)
    }

    /// Latest client-side rejection of `id`.
    #[must_use]
    pub fn rejection(&self, id: IntentId) -> Option<&IntentError> {
        self.rejections.get(&id)
    }

    /// Intents with a transaction under way.
    #[must_use]
    pub fn in_flight(&self) -> Vec<IntentId> {
        let mut ids: Vec<IntentId> = self
            .intents
            .iter()
            .filter(|(_, r)| r.phase.in_flight())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn expect(&mut self, id: IntentId, phase: IntentPhase) -> Option<&mut IntentRecord> {
        let record = self.intents.get_mut(&id).filter(|r| r.phase == phase);
        if record.is_none() {
            tracing::warn!(%id, expected = %phase, "Ignoring stale intent action");
        }
        record
    }
}

/// Actions of the write-intent machine.
///
/// `Initiate` comes from the caller; everything else is produced by effects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntentAction {
    /// Start (or re-confirm) an intent
    Initiate {
        /// Intent id
        id: IntentId,
        /// Signing account
        from: Address,
        /// What to do
        intent: WriteIntent,
    },
    /// Refused before any ledger traffic
    Rejected {
        /// Intent id
        id: IntentId,
        /// Why
        error: IntentError,
    },
    /// Gas estimate available
    Estimated {
        /// Intent id
        id: IntentId,
        /// Raw estimate
        gas: u64,
    },
    /// Gas estimation failed
    EstimateFailed {
        /// Intent id
        id: IntentId,
        /// Cause
        error: LedgerError,
    },
    /// Signed and broadcast
    Submitted {
        /// Intent id
        id: IntentId,
        /// Transaction hash
        tx_hash: TxHash,
    },
    /// Signature declined or broadcast refused
    SubmitFailed {
        /// Intent id
        id: IntentId,
        /// Cause
        error: LedgerError,
    },
    /// Receipt arrived
    Mined {
        /// Intent id
        id: IntentId,
        /// The receipt
        receipt: Receipt,
    },
    /// No receipt before the deadline
    WaitFailed {
        /// Intent id
        id: IntentId,
        /// Cause
        error: LedgerError,
    },
    /// Targeted reconciliation after confirmation finished
    Reconciled {
        /// Intent id
        id: IntentId,
    },
}

impl IntentAction {
    /// Intent this action belongs to.
    #[must_use]
    pub const fn id(&self) -> IntentId {
        match self {
            Self::Initiate { id, .. }
            | Self::Rejected { id, .. }
            | Self::Estimated { id, .. }
            | Self::EstimateFailed { id, .. }
            | Self::Submitted { id, .. }
            | Self::SubmitFailed { id, .. }
            | Self::Mined { id, .. }
            | Self::WaitFailed { id, .. }
            | Self::Reconciled { id } => *id,
        }
    }

    /// Whether this is the last action an attempt of `id` produces.
    #[must_use]
    pub fn settles(&self, id: IntentId) -> bool {
        self.id() == id
            && match self {
                Self::Rejected { .. }
                | Self::EstimateFailed { .. }
                | Self::SubmitFailed { .. }
                | Self::WaitFailed { .. }
                | Self::Reconciled { .. } => true,
                Self::Mined { receipt, .. } => !receipt.success,
                Self::Initiate { .. } | Self::Estimated { .. } | Self::Submitted { .. } => false,
            }
    }
}

/// Dependencies of the intent effects.
#[derive(Clone)]
pub struct IntentEnvironment {
    /// Ledger to estimate, sign and submit against
    pub ledger: Arc<dyn Ledger>,
    /// Reconciler refreshed after confirmations
    pub reconciler: Option<Arc<Reconciler>>,
    /// Transition timestamps
    pub clock: Arc<dyn Clock>,
    /// Bound on waiting for a receipt; `None` waits until mined
    pub receipt_timeout: Option<Duration>,
}

impl fmt::Debug for IntentEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntentEnvironment")
            .field("reconciler", &self.reconciler.is_some())
            .field("receipt_timeout", &self.receipt_timeout)
            .finish_non_exhaustive()
    }
}

/// Reducer of the write-intent machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntentReducer;

impl IntentReducer {
    fn validate_initiate(
        state: &IntentState,
        id: IntentId,
        intent: &WriteIntent,
    ) -> Result<(), IntentError> {
        if state.phase(id).is_some_and(IntentPhase::in_flight) {
            return Err(IntentError::InFlight(id));
        }
        intent.validate()
    }

    fn emit(action: IntentAction) -> Effect<IntentAction> {
        async_effect! { Some(action) }
    }

    fn estimate(env: &IntentEnvironment, id: IntentId, request: TransactionRequest) -> Effect<IntentAction> {
        let ledger = Arc::clone(&env.ledger);
        async_effect! {
            Some(match ledger.estimate_gas(&request).await {
                Ok(gas) => IntentAction::Estimated { id, gas },
                Err(error) => IntentAction::EstimateFailed { id, error },
            })
        }
    }

    fn submit(env: &IntentEnvironment, id: IntentId, request: TransactionRequest) -> Effect<IntentAction> {
        let ledger = Arc::clone(&env.ledger);
        async_effect! {
            Some(match ledger.submit(request).await {
                Ok(tx_hash) => IntentAction::Submitted { id, tx_hash },
                Err(error) => IntentAction::SubmitFailed { id, error },
            })
        }
    }

    fn await_receipt(env: &IntentEnvironment, id: IntentId, tx_hash: TxHash) -> Effect<IntentAction> {
        let ledger = Arc::clone(&env.ledger);
        let timeout = env.receipt_timeout;
        async_effect! {
            Some(match ledger.wait_for_receipt(tx_hash, timeout).await {
                Ok(receipt) => IntentAction::Mined { id, receipt },
                Err(error) => IntentAction::WaitFailed { id, error },
            })
        }
    }

    /// Reconcile what the receipt reports, or what the intent names if it
    /// reports nothing.
    fn reconcile(env: &IntentEnvironment, id: IntentId, record: &IntentRecord) -> Effect<IntentAction> {
        let reconciler = env.reconciler.clone();
        let notifications = record
            .receipt
            .as_ref()
            .map(|r| r.notifications.clone())
            .unwrap_or_default();
        let call = record.intent.to_request(record.from).call;
        async_effect! {
            let Some(reconciler) = reconciler else {
                return Some(IntentAction::Reconciled { id });
            };
            let outcome = if notifications.is_empty() {
                match (call.token_id(), call.event_id()) {
                    (Some(token_id), _) => reconciler.reconcile_token(token_id).await.map(drop),
                    (None, Some(event_id)) => reconciler.reconcile_event(event_id).await.map(drop),
                    (None, None) => Ok(()),
                }
            } else {
                let mut outcome = Ok(());
                for envelope in &notifications {
                    if let Err(err) = reconcile_notification(&reconciler, envelope).await {
                        outcome = Err(err);
                    }
                }
                outcome
            };
            if let Err(error) = outcome {
                tracing::warn!(%id, %error, "Reconciliation after confirmation failed");
            }
            Some(IntentAction::Reconciled { id })
        }
    }
}

impl Reducer for IntentReducer {
    type State = IntentState;
    type Action = IntentAction;
    type Environment = IntentEnvironment;

    #[allow(clippy::too_many_lines)] // One arm per transition
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let now = env.clock.now();
        match action {
            // ========== Initiate ==========
            IntentAction::Initiate { id, from, intent } => {
                if let Err(error) = Self::validate_initiate(state, id, &intent) {
                    tracing::info!(%id, method = intent.method(), %error, "Intent rejected");
                    metrics::counter!("intents.rejected").increment(1);
                    return smallvec![Self::emit(IntentAction::Rejected { id, error })];
                }
                state.rejections.remove(&id);

                // A timed-out transaction may still be mined: confirm it first.
                if let Some(record) = state
                    .intents
                    .get_mut(&id)
                    .filter(|r| r.phase == IntentPhase::TimedOut)
                {
                    if let Some(tx_hash) = record.tx_hash {
                        tracing::info!(%id, %tx_hash, "Re-checking timed-out transaction");
                        record.error = None;
                        record.message = None;
                        record.enter(IntentPhase::Pending, now);
                        return smallvec![Self::await_receipt(env, id, tx_hash)];
                    }
                }

                let attempts = state.intents.get(&id).map_or(0, |r| r.attempts) + 1;
                let request = intent.to_request(from);
                let mut record = IntentRecord {
                    intent,
                    from,
                    phase: IntentPhase::Idle,
                    attempts,
                    gas_limit: None,
                    tx_hash: None,
                    receipt: None,
                    error: None,
                    message: None,
                    history: vec![(IntentPhase::Idle, now)],
                };
                record.enter(IntentPhase::Estimating, now);
                tracing::info!(%id, method = record.intent.method(), attempts, "Intent started");
                state.intents.insert(id, record);
                smallvec![Self::estimate(env, id, request)]
            },

            IntentAction::Rejected { id, error } => {
                state.rejections.insert(id, error);
                SmallVec::new()
            },

            // ========== Estimating ==========
            IntentAction::Estimated { id, gas } => {
                let Some(record) = state.expect(id, IntentPhase::Estimating) else {
                    return SmallVec::new();
                };
                let gas_limit = with_safety_margin(gas);
                record.gas_limit = Some(gas_limit);
                record.enter(IntentPhase::AwaitingSignature, now);
                let request = record.intent.to_request(record.from).with_gas_limit(gas_limit);
                smallvec![Self::submit(env, id, request)]
            },

            IntentAction::EstimateFailed { id, error } => {
                if let Some(record) = state.expect(id, IntentPhase::Estimating) {
                    tracing::info!(%id, %error, "Gas estimation failed, nothing sent");
                    record.fail(IntentPhase::Idle, error, now);
                }
                SmallVec::new()
            },

            // ========== AwaitingSignature ==========
            IntentAction::Submitted { id, tx_hash } => {
                let Some(record) = state.expect(id, IntentPhase::AwaitingSignature) else {
                    return SmallVec::new();
                };
                record.tx_hash = Some(tx_hash);
                record.enter(IntentPhase::Pending, now);
                tracing::info!(%id, %tx_hash, "Transaction submitted");
                smallvec![Self::await_receipt(env, id, tx_hash)]
            },

            IntentAction::SubmitFailed { id, error } => {
                if let Some(record) = state.expect(id, IntentPhase::AwaitingSignature) {
                    tracing::info!(%id, %error, "Submission failed");
                    record.fail(IntentPhase::Idle, error, now);
                }
                SmallVec::new()
            },

            // ========== Pending ==========
            IntentAction::Mined { id, receipt } => {
                let Some(record) = state.expect(id, IntentPhase::Pending) else {
                    return SmallVec::new();
                };
                let failure = receipt.failure();
                record.receipt = Some(receipt);
                match failure {
                    None => {
                        record.error = None;
                        record.message = None;
                        record.enter(IntentPhase::Confirmed, now);
                        tracing::info!(%id, "Transaction confirmed");
                        smallvec![Self::reconcile(env, id, record)]
                    },
                    Some(error) => {
                        tracing::warn!(%id, %error, "Transaction reverted");
                        record.fail(IntentPhase::Reverted, error, now);
                        SmallVec::new()
                    },
                }
            },

            IntentAction::WaitFailed { id, error } => {
                if let Some(record) = state.expect(id, IntentPhase::Pending) {
                    tracing::warn!(%id, %error, "No receipt yet, transaction may still land");
                    record.fail(IntentPhase::TimedOut, error, now);
                }
                SmallVec::new()
            },

            // ========== Confirmed ==========
            IntentAction::Reconciled { id } => {
                tracing::debug!(%id, "Intent settled");
                SmallVec::new()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use ticketchain_core::BlockNumber;
    use ticketchain_testing::{InMemoryLedger, ReducerTest, assertions, test_clock};

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn env() -> IntentEnvironment {
        IntentEnvironment {
            ledger: Arc::new(InMemoryLedger::new()),
            reconciler: None,
            clock: Arc::new(test_clock()),
            receipt_timeout: None,
        }
    }

    fn listing(price: u64) -> WriteIntent {
        WriteIntent::ListTicket {
            token_id: TokenId(1),
            price: Wei::from(price),
            max_resale_price: Wei::from(20u64),
        }
    }

    fn record(phase: IntentPhase) -> IntentRecord {
        IntentRecord {
            intent: listing(15),
            from: addr(1),
            phase,
            attempts: 1,
            gas_limit: None,
            tx_hash: Some(TxHash::new([7; 32])),
            receipt: None,
            error: None,
            message: None,
            history: Vec::new(),
        }
    }

    fn state_with(id: IntentId, phase: IntentPhase) -> IntentState {
        let mut state = IntentState::default();
        state.intents.insert(id, record(phase));
        state
    }

    #[test]
    fn validation_rules() {
        assert_eq!(listing(0).validate(), Err(IntentError::ZeroPrice));
        assert!(matches!(listing(21).validate(), Err(IntentError::AboveResaleCap { .. })));
        assert_eq!(listing(20).validate(), Ok(()));

        let event = |name: &str, price: u64, cap: u64, royalty: u8| WriteIntent::CreateEvent {
            name: name.to_string(),
            price: Wei::from(price),
            max_resale_price: Wei::from(cap),
            royalty_percentage: royalty,
            metadata_uri: String::new(),
        };
        assert_eq!(event(" ", 1, 2, 5).validate(), Err(IntentError::MissingName));
        assert_eq!(event("Gig", 1, 2, 101).validate(), Err(IntentError::RoyaltyOutOfRange(101)));
        assert_eq!(event("Gig", 3, 2, 5).validate(), Err(IntentError::CapBelowPrice));
        assert_eq!(event("Gig", 2, 2, 100).validate(), Ok(()));

        let buy = WriteIntent::BuyTicket {
            token_id: TokenId(1),
            price: Wei::ZERO,
        };
        assert_eq!(buy.validate(), Err(IntentError::MissingPayment));
    }

    #[test]
    fn listing_above_cap_is_rejected_without_effects_on_the_ledger() {
        let id = IntentId(1);
        ReducerTest::new(IntentReducer)
            .with_env(env())
            .given_state(IntentState::default())
            .when_action(IntentAction::Initiate {
                id,
                from: addr(1),
                intent: listing(25),
            })
            .then_state(move |state| assert_eq!(state.phase(id), None))
            .then_effects(|effects| assertions::assert_effects_count(effects, 1))
            .run();
    }

    #[test]
    fn valid_intent_starts_estimating() {
        let id = IntentId(2);
        ReducerTest::new(IntentReducer)
            .with_env(env())
            .given_state(IntentState::default())
            .when_action(IntentAction::Initiate {
                id,
                from: addr(1),
                intent: listing(15),
            })
            .then_state(move |state| {
                let record = state.get(id).unwrap();
                assert_eq!(record.phase, IntentPhase::Estimating);
                assert_eq!(record.attempts, 1);
                assert_eq!(record.history.last().unwrap().1, test_clock().now());
            })
            .then_effects(assertions::assert_has_future_effect)
            .run();
    }

    #[test]
    fn in_flight_intents_cannot_be_initiated_again() {
        let id = IntentId(3);
        for phase in [
            IntentPhase::Estimating,
            IntentPhase::AwaitingSignature,
            IntentPhase::Pending,
        ] {
            ReducerTest::new(IntentReducer)
                .with_env(env())
                .given_state(state_with(id, phase))
                .when_action(IntentAction::Initiate {
                    id,
                    from: addr(1),
                    intent: listing(15),
                })
                .then_state(move |state| assert_eq!(state.phase(id), Some(phase)))
                .then_effects(|effects| assertions::assert_effects_count(effects, 1))
                .run();
        }
    }

    #[test]
    fn estimate_applies_the_safety_margin() {
        let id = IntentId(4);
        ReducerTest::new(IntentReducer)
            .with_env(env())
            .given_state(state_with(id, IntentPhase::Estimating))
            .when_action(IntentAction::Estimated { id, gas: 100_000 })
            .then_state(move |state| {
                let record = state.get(id).unwrap();
                assert_eq!(record.phase, IntentPhase::AwaitingSignature);
                assert_eq!(record.gas_limit, Some(120_000));
            })
            .then_effects(assertions::assert_has_future_effect)
            .run();
    }

    #[test]
    fn failed_estimate_returns_to_idle_with_a_message() {
        let id = IntentId(5);
        ReducerTest::new(IntentReducer)
            .with_env(env())
            .given_state(state_with(id, IntentPhase::Estimating))
            .when_action(IntentAction::EstimateFailed {
                id,
                error: LedgerError::GasEstimation {
                    reason: "execution reverted: Price exceeds max resale value".into(),
                },
            })
            .then_state(move |state| {
                let record = state.get(id).unwrap();
                assert_eq!(record.phase, IntentPhase::Idle);
                assert_eq!(
                    record.message.as_deref(),
                    Some("Price exceeds maximum resale value.")
                );
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn declined_signature_returns_to_idle() {
        let id = IntentId(6);
        ReducerTest::new(IntentReducer)
            .with_env(env())
            .given_state(state_with(id, IntentPhase::AwaitingSignature))
            .when_action(IntentAction::SubmitFailed {
                id,
                error: LedgerError::UserRejected,
            })
            .then_state(move |state| {
                assert_eq!(state.phase(id), Some(IntentPhase::Idle));
                assert_eq!(state.get(id).unwrap().error, Some(LedgerError::UserRejected));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn reverted_receipt_surfaces_the_reason() {
        let id = IntentId(7);
        let receipt = Receipt {
            tx_hash: TxHash::new([7; 32]),
            block_number: BlockNumber(9),
            success: false,
            gas_used: 21_000,
            revert_reason: Some("Not owner".into()),
            notifications: Vec::new(),
        };
        ReducerTest::new(IntentReducer)
            .with_env(env())
            .given_state(state_with(id, IntentPhase::Pending))
            .when_action(IntentAction::Mined { id, receipt })
            .then_state(move |state| {
                let record = state.get(id).unwrap();
                assert_eq!(record.phase, IntentPhase::Reverted);
                assert_eq!(record.message.as_deref(), Some("You do not own this ticket."));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn timed_out_intent_is_rechecked_not_resubmitted() {
        let id = IntentId(8);
        ReducerTest::new(IntentReducer)
            .with_env(env())
            .given_state(state_with(id, IntentPhase::TimedOut))
            .when_action(IntentAction::Initiate {
                id,
                from: addr(1),
                intent: listing(15),
            })
            .then_state(move |state| {
                let record = state.get(id).unwrap();
                assert_eq!(record.phase, IntentPhase::Pending);
                assert_eq!(record.attempts, 1);
                assert_eq!(record.tx_hash, Some(TxHash::new([7; 32])));
            })
            .then_effects(assertions::assert_has_future_effect)
            .run();
    }

    #[test]
    fn stale_actions_are_ignored() {
        let id = IntentId(9);
        ReducerTest::new(IntentReducer)
            .with_env(env())
            .given_state(state_with(id, IntentPhase::Confirmed))
            .when_action(IntentAction::Estimated { id, gas: 1 })
            .then_state(move |state| assert_eq!(state.phase(id), Some(IntentPhase::Confirmed)))
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn settling_actions() {
        let id = IntentId(10);
        assert!(IntentAction::Reconciled { id }.settles(id));
        assert!(!IntentAction::Reconciled { id }.settles(IntentId(11)));
        assert!(!IntentAction::Submitted {
            id,
            tx_hash: TxHash::new([0; 32])
        }
        .settles(id));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use ticketchain_testing::properties::arb_wei;

        proptest! {
            #[test]
            fn listing_validation_matches_the_cap(price in arb_wei(), cap in arb_wei()) {
                let intent = WriteIntent::ListTicket {
                    token_id: TokenId(1),
                    price,
                    max_resale_price: cap,
                };
                let accepted = intent.validate().is_ok();
                prop_assert_eq!(accepted, !price.is_zero() && price <= cap);
            }
        }
    }
}
