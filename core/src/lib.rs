//! # Ticketchain Core
//!
//! Domain types and abstractions for the Ticketchain ledger client.
//!
//! The authoritative state of the ticket marketplace (events, tickets, ownership
//! and resale listings) lives in an external smart contract. This crate defines
//! the vocabulary the rest of the workspace uses to talk about that state:
//!
//! - **Types**: [`Address`], [`TokenId`], [`EventId`], [`TicketRecord`], [`EventRecord`]
//! - **Units**: [`Wei`] base-unit amounts and decimal conversion at the edges
//! - **Ledger**: the [`Ledger`] trait every chain client implements
//! - **Notifications**: ledger-emitted events ([`LedgerNotification`])
//! - **Metadata**: off-chain event metadata and the [`MetadataFetcher`] trait
//! - **Reducer / Effect**: the functional core used by the write-intent state machine
//!
//! ## Architecture Principles
//!
//! - Functional Core, Imperative Shell
//! - The ledger is the source of truth; local state is always reconcilable
//! - Explicit Effects (no hidden I/O)
//! - Dependency Injection via Environment
//!
//! ## Example
//!
//! ```ignore
//! use ticketchain_core::*;
//!
//! impl Reducer for IntentReducer {
//!     type State = IntentState;
//!     type Action = IntentAction;
//!     type Environment = IntentEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut IntentState,
//!         action: IntentAction,
//!         env: &IntentEnvironment,
//!     ) -> SmallVec<[Effect<IntentAction>; 4]> {
//!         smallvec![Effect::None]
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use primitive_types::U256;
pub use serde::{Deserialize, Serialize};
pub use smallvec::{smallvec, SmallVec};

/// Effect construction macros
pub mod effect_macros;

/// Ledger error taxonomy
pub mod error;

/// The ledger trait and transaction types
pub mod ledger;

/// Off-chain event metadata
pub mod metadata;

/// Ledger-emitted notifications
pub mod notification;

/// Serialization of wallet signature prompts
pub mod signer;

/// Identifiers and ledger records
pub mod types;

/// Base-unit amounts and decimal conversion
pub mod units;

pub use error::LedgerError;
pub use ledger::{
    with_safety_margin, ContractWrite, Ledger, LedgerFuture, NotificationFilter, Receipt,
    TransactionRequest, GAS_SAFETY_MARGIN_PERCENT,
};
pub use metadata::{EventMetadata, MetadataFetcher, PLACEHOLDER_IMAGE};
pub use notification::{LedgerEventKind, LedgerNotification, NotificationEnvelope};
pub use signer::SignerGate;
pub use types::{
    Address, AddressParseError, BlockNumber, EventId, EventRecord, EventView, OwnershipEntry,
    TicketRecord, TicketView, TokenId, TxHash,
};
pub use units::{format_units, parse_units, UnitsError, Wei, ETHER_DECIMALS};

/// Reducer module - The core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`
///
/// They contain all business logic and are deterministic and testable.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// This is a pure function that:
        /// 1. Validates the action
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects describe side effects to be performed by the runtime.
/// They are values (not execution) and are composable.
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Effect type - describes a side effect to be executed
    ///
    /// Effects are NOT executed immediately. They are descriptions of what should happen,
    /// returned from reducers and executed by the Store runtime.
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects in parallel
        Parallel(Vec<Effect<Action>>),

        /// Run effects sequentially
        Sequential(Vec<Effect<Action>>),

        /// Delayed action
        Delay {
            /// How long to wait
            duration: Duration,
            /// Action to dispatch after delay
            action: Box<Action>,
        },

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Whether this effect does nothing
        #[must_use]
        pub const fn is_none(&self) -> bool {
            matches!(self, Effect::None)
        }
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the Environment parameter. Ledger access lives in [`crate::ledger`].
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::Effect;
    use super::environment::{Clock, SystemClock};

    #[test]
    fn effect_debug_hides_futures() {
        let effect: Effect<u8> = Effect::Future(Box::pin(async { Some(1) }));
        assert_eq!(format!("{effect:?}"), "Effect::Future(<future>)");
    }

    #[test]
    fn merge_and_chain_wrap_effects() {
        let merged: Effect<u8> = Effect::merge(vec![Effect::None, Effect::None]);
        assert!(matches!(merged, Effect::Parallel(ref v) if v.len() == 2));

        let chained: Effect<u8> = Effect::chain(vec![Effect::None]);
        assert!(matches!(chained, Effect::Sequential(ref v) if v.len() == 1));
        assert!(Effect::<u8>::None.is_none());
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
