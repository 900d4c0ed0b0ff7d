//! # Ticketchain Marketplace
//!
//! Client-side model of the ticketing contract.
//!
//! - [`config`]: environment-driven configuration
//! - [`cache`]: the view-model cache with per-key refresh ordering
//! - [`enumeration`]: candidate token enumeration strategies
//! - [`reconciler`]: rebuilds cache entries from ledger reads
//! - [`subscriber`]: polls contract notifications and feeds the reconciler
//! - [`intent`]: the write-intent reducer run on a [`ticketchain_runtime::Store`]
//! - [`marketplace`]: [`Marketplace`], the composition root
//!
//! ## Example
//!
//! ```no_run
//! use ticketchain_marketplace::{Config, Marketplace};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let marketplace = Marketplace::connect(Config::from_env()?).await?;
//! marketplace.refresh().await?;
//! for listing in marketplace.listings().await {
//!     println!("{} {}", listing.event_name, listing.token_id());
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod enumeration;
pub mod intent;
pub mod marketplace;
pub mod reconciler;
pub mod subscriber;

pub use cache::{Commit, RefreshKey, ViewModelCache};
pub use config::{Config, ConfigError, EnumerationStrategy};
pub use enumeration::{BoundedScan, IndexedEnumeration, TokenEnumeration};
pub use intent::{
    IntentAction, IntentEnvironment, IntentError, IntentId, IntentPhase, IntentRecord,
    IntentReducer, IntentState, WriteIntent,
};
pub use marketplace::{IntentStore, Marketplace, MarketplaceError};
pub use reconciler::Reconciler;
pub use subscriber::{
    NotificationResult, NotificationStream, Subscriber, SubscriptionError, SubscriptionHandle,
    reconcile_notification,
};
