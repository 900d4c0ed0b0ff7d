//! # Ticketchain Testing
//!
//! Testing utilities for the Ticketchain client.
//!
//! This crate provides:
//! - [`InMemoryLedger`]: a simulated ticketing contract with failure injection
//! - [`StaticMetadataFetcher`]: canned metadata documents
//! - [`FixedClock`]: deterministic time
//! - [`ReducerTest`]: Given-When-Then reducer tests
//! - [`properties`]: proptest strategies for domain types
//!
//! ## Example
//!
//! ```ignore
//! use ticketchain_testing::{InMemoryLedger, StaticMetadataFetcher};
//!
//! #[tokio::test]
//! async fn owned_tickets_are_reconciled() {
//!     let ledger = Arc::new(InMemoryLedger::new());
//!     let event = ledger.create_event(organizer, "Concert", price, cap);
//!     let token = ledger.mint(account, event);
//!
//!     let reconciler = Reconciler::new(ledger.clone(), Arc::new(StaticMetadataFetcher::new()), ..);
//!     let owned = reconciler.refresh_owned_tickets(account).await?;
//!     assert_eq!(owned.len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use ticketchain_core::environment::Clock;

/// Simulated ledger
pub mod ledger_mock;

/// Canned metadata
pub mod metadata_mock;

/// Reducer test harness
pub mod reducer_test;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use ticketchain_testing::mocks::FixedClock;
    /// use ticketchain_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use ticketchain_core::{U256, Wei};

    /// Amounts up to 1000 ether, in base units.
    pub fn arb_wei() -> impl Strategy<Value = Wei> {
        (0u128..=1_000_000_000_000_000_000_000u128).prop_map(|raw| Wei(U256::from(raw)))
    }

    /// Decimal ether strings with at most 18 fractional digits.
    pub fn arb_ether_string() -> impl Strategy<Value = String> {
        (0u64..1_000_000, proptest::option::of("[0-9]{1,18}")).prop_map(|(whole, fraction)| {
            match fraction {
                Some(fraction) => format!("{whole}.{fraction}"),
                None => whole.to_string(),
            }
        })
    }
}

pub use ledger_mock::{INVALID_TOKEN_REASON, InMemoryLedger, SIMULATED_GAS};
pub use metadata_mock::StaticMetadataFetcher;
pub use mocks::{FixedClock, test_clock};
pub use reducer_test::{ReducerTest, assertions};

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;
    use ticketchain_core::Wei;

    /// Canonical rendering: no trailing fractional zeros, no bare point.
    fn normalized(amount: &str) -> String {
        match amount.split_once('.') {
            Some((whole, fraction)) => {
                let fraction = fraction.trim_end_matches('0');
                if fraction.is_empty() {
                    whole.to_string()
                } else {
                    format!("{whole}.{fraction}")
                }
            },
            None => amount.to_string(),
        }
    }

    proptest! {
        #[test]
        fn parse_then_format_is_identity(amount in properties::arb_ether_string()) {
            let wei = Wei::from_ether(&amount).unwrap();
            prop_assert_eq!(wei.to_ether(), normalized(&amount));
        }
    }

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
