//! # Ticketchain RPC
//!
//! JSON-RPC implementation of the ledger boundary.
//!
//! - [`abi`]: Solidity ABI encoding and revert decoding
//! - [`transport`]: JSON-RPC 2.0 over HTTP with node error classification
//! - [`contract`]: the ticketing contract's functions and a `call`/`send` client
//! - [`logs`]: contract log decoding into ledger notifications
//! - [`ledger`]: [`RpcLedger`], the production [`ticketchain_core::ledger::Ledger`]
//! - [`metadata`]: [`HttpMetadataFetcher`]
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use ticketchain_core::{SignerGate, ledger::Ledger};
//! use ticketchain_rpc::RpcLedger;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = RpcLedger::new(
//!     "http://127.0.0.1:8545".parse()?,
//!     "0x63b7accbee71a6a026a0bdc3a0734d74384ed15c".parse()?,
//!     Duration::from_secs(10),
//!     SignerGate::new(),
//! )?;
//! let events = ledger.show_events().await?;
//! println!("{} events", events.len());
//! # Ok(())
//! # }
//! ```

pub mod abi;
pub mod contract;
pub mod ledger;
pub mod logs;
pub mod metadata;
pub mod transport;

pub use abi::AbiError;
pub use contract::{ContractClient, Function, SendOptions};
pub use ledger::{RpcLedger, is_nonexistent_token_reason};
pub use metadata::HttpMetadataFetcher;
pub use transport::{RpcErrorObject, RpcTransport};
