//! Identifiers and ledger records.
//!
//! The records here are read-only copies of ledger state. The ledger owns them;
//! the client only caches and displays them.

use crate::metadata::EventMetadata;
use crate::units::Wei;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for [`Address`] and [`TxHash`] parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    /// Input was not `0x`-prefixed hex
    #[error("expected 0x-prefixed hex, got '{0}'")]
    MissingPrefix(String),

    /// Input had the wrong number of hex digits
    #[error("expected {expected} hex digits, got {actual}")]
    WrongLength {
        /// Expected hex digit count
        expected: usize,
        /// Actual hex digit count
        actual: usize,
    },

    /// Input contained non-hex characters
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], AddressParseError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| AddressParseError::MissingPrefix(s.to_string()))?;
    if digits.len() != N * 2 {
        return Err(AddressParseError::WrongLength {
            expected: N * 2,
            actual: digits.len(),
        });
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(digits, &mut out)
        .map_err(|e| AddressParseError::InvalidHex(e.to_string()))?;
    Ok(out)
}

/// A 20-byte account or contract address.
///
/// Parsing accepts any hex casing (checksummed or not); display is always
/// lowercase. Two addresses that differ only in casing are therefore equal.
///
/// # Examples
///
/// ```
/// use ticketchain_core::Address;
///
/// let a: Address = "0x63b7acCBeE71A6a026A0BdC3a0734D74384eD15C".parse().unwrap();
/// let b: Address = "0x63b7accbee71a6a026a0bdc3a0734d74384ed15c".parse().unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.to_string(), "0x63b7accbee71a6a026a0bdc3a0734d74384ed15c");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    /// The zero address (used by the contract for "no organizer").
    pub const ZERO: Self = Self([0u8; 20]);

    /// Create an address from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of the address.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Whether this is the zero address.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Shortened form for display, `0x63b7...d15c`.
    #[must_use]
    pub fn short(&self) -> String {
        let full = self.to_string();
        format!("{}...{}", &full[..6], &full[full.len() - 4..])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<20>(s.trim()).map(Self)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A 32-byte transaction hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash([u8; 32]);

impl TxHash {
    /// Create a hash from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of the hash.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

impl FromStr for TxHash {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<32>(s.trim()).map(Self)
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Create a new identifier.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// The raw integer value.
            #[must_use]
            pub const fn value(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a ticket NFT.
    TokenId,
    "token"
);

numeric_id!(
    /// Identifier of an event on the ledger.
    EventId,
    "event"
);

numeric_id!(
    /// Ledger height (block number).
    BlockNumber,
    "block"
);

impl BlockNumber {
    /// The following block.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Cached copy of a ticket's ledger state.
///
/// Invariant (ledger-enforced): at most one `for_sale = true` entry per token at
/// any ledger height, and `listing_price` is `Some` exactly when `for_sale`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRecord {
    /// Token identifier
    pub token_id: TokenId,
    /// Event this ticket admits to
    pub event_id: EventId,
    /// Current holder according to the ledger
    pub current_owner: Address,
    /// Whether the holder has listed it for resale
    pub for_sale: bool,
    /// Resale price when listed
    pub listing_price: Option<Wei>,
}

impl TicketRecord {
    /// Build a record from the current owner and that owner's listing entry.
    #[must_use]
    pub fn from_ownership(
        token_id: TokenId,
        event_id: EventId,
        current_owner: Address,
        entry: Option<&OwnershipEntry>,
    ) -> Self {
        let listing = entry.filter(|e| e.for_sale && e.owner == current_owner);
        Self {
            token_id,
            event_id,
            current_owner,
            for_sale: listing.is_some(),
            listing_price: listing.map(|e| e.price),
        }
    }
}

/// An event as stored on the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event identifier
    pub event_id: EventId,
    /// Display name
    pub name: String,
    /// Account that created the event
    pub organizer: Address,
    /// Primary-sale price
    pub original_price: Wei,
    /// Upper bound for resale listings
    pub max_resale_price: Wei,
    /// Royalty paid to the organizer on resale, in percent (0..=100)
    pub royalty_percentage: u8,
    /// Whether the event is still open
    pub active: bool,
    /// Off-chain metadata locator
    pub metadata_uri: String,
}

impl EventRecord {
    /// Whether `price` is an acceptable resale price for this event.
    #[must_use]
    pub fn allows_resale_at(&self, price: Wei) -> bool {
        price <= self.max_resale_price
    }

    /// Whether the event should be shown in the catalogue.
    ///
    /// Deleted slots come back from the contract as zeroed structs, so empty names
    /// and the zero organizer are filtered alongside inactive events.
    #[must_use]
    pub fn is_listed(&self) -> bool {
        self.active && !self.name.is_empty() && !self.organizer.is_zero()
    }
}

/// One row of the contract's per-token ownership history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipEntry {
    /// Holder recorded in this entry
    pub owner: Address,
    /// Whether this holder listed the ticket
    pub for_sale: bool,
    /// Listing price (zero when not listed)
    pub price: Wei,
}

/// What the presentation layer reads for a single ticket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketView {
    /// Ledger record
    pub record: TicketRecord,
    /// Name of the event the ticket belongs to
    pub event_name: String,
    /// Primary-sale price of the event
    pub original_price: Wei,
    /// Resale cap of the event
    pub max_resale_price: Wei,
    /// Image locator, or [`crate::PLACEHOLDER_IMAGE`]
    pub image: String,
}

impl TicketView {
    /// Combine a ticket record with its event and resolved image.
    #[must_use]
    pub fn new(record: TicketRecord, event: &EventRecord, image: String) -> Self {
        Self {
            record,
            event_name: event.name.clone(),
            original_price: event.original_price,
            max_resale_price: event.max_resale_price,
            image,
        }
    }

    /// Token identifier shortcut.
    #[must_use]
    pub const fn token_id(&self) -> TokenId {
        self.record.token_id
    }
}

/// What the presentation layer reads for a single event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventView {
    /// Ledger record
    pub record: EventRecord,
    /// Resolved off-chain metadata (placeholder on failure)
    pub metadata: EventMetadata,
}
