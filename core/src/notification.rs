//! Ledger-emitted notifications.
//!
//! The contract emits one log per state change. Each decoded log becomes a
//! [`LedgerNotification`]; the envelope carries its position in the chain so
//! replays after a reconnect can be deduplicated.

use crate::types::{Address, BlockNumber, EventId, TokenId, TxHash};
use crate::units::Wei;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of notification the contract emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerEventKind {
    /// A new event was created
    EventCreated,
    /// An event was deleted
    EventDeleted,
    /// A ticket was minted
    TicketMinted,
    /// A ticket was listed for resale
    TicketListed,
    /// A ticket changed hands
    TicketSold,
}

impl LedgerEventKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::EventCreated,
        Self::EventDeleted,
        Self::TicketMinted,
        Self::TicketListed,
        Self::TicketSold,
    ];

    /// Event name as declared in the contract ABI.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::EventCreated => "EventCreated",
            Self::EventDeleted => "EventDeleted",
            Self::TicketMinted => "TicketMinted",
            Self::TicketListed => "TicketListed",
            Self::TicketSold => "TicketSold",
        }
    }

    /// Look up a kind by its ABI name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for LedgerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded contract log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerNotification {
    /// `EventCreated(eventId, name, price, eventURI)`
    EventCreated {
        /// New event id
        event_id: EventId,
        /// Event name
        name: String,
        /// Primary-sale price
        price: Wei,
        /// Metadata locator
        metadata_uri: String,
    },
    /// `EventDeleted(eventId)`
    EventDeleted {
        /// Deleted event id
        event_id: EventId,
    },
    /// `TicketMinted(tokenId, eventId, owner)`
    TicketMinted {
        /// New token id
        token_id: TokenId,
        /// Event the ticket admits to
        event_id: EventId,
        /// First holder
        owner: Address,
    },
    /// `TicketListed(tokenId, owner, price)`
    TicketListed {
        /// Listed token
        token_id: TokenId,
        /// Holder who listed it
        owner: Address,
        /// Asking price
        price: Wei,
    },
    /// `TicketSold(tokenId, from, to, price)`
    TicketSold {
        /// Sold token
        token_id: TokenId,
        /// Previous holder
        from: Address,
        /// New holder
        to: Address,
        /// Price paid
        price: Wei,
    },
}

impl LedgerNotification {
    /// The kind of this notification.
    #[must_use]
    pub const fn kind(&self) -> LedgerEventKind {
        match self {
            Self::EventCreated { .. } => LedgerEventKind::EventCreated,
            Self::EventDeleted { .. } => LedgerEventKind::EventDeleted,
            Self::TicketMinted { .. } => LedgerEventKind::TicketMinted,
            Self::TicketListed { .. } => LedgerEventKind::TicketListed,
            Self::TicketSold { .. } => LedgerEventKind::TicketSold,
        }
    }

    /// Token affected, for ticket notifications.
    #[must_use]
    pub const fn token_id(&self) -> Option<TokenId> {
        match self {
            Self::TicketMinted { token_id, .. }
            | Self::TicketListed { token_id, .. }
            | Self::TicketSold { token_id, .. } => Some(*token_id),
            Self::EventCreated { .. } | Self::EventDeleted { .. } => None,
        }
    }

    /// Event affected, for event notifications (and mints, which name their event).
    #[must_use]
    pub const fn event_id(&self) -> Option<EventId> {
        match self {
            Self::EventCreated { event_id, .. }
            | Self::EventDeleted { event_id }
            | Self::TicketMinted { event_id, .. } => Some(*event_id),
            Self::TicketListed { .. } | Self::TicketSold { .. } => None,
        }
    }
}

/// A notification with its position in the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// Block that included the log
    pub block_number: BlockNumber,
    /// Index of the log within the block
    pub log_index: u64,
    /// Transaction that emitted it
    pub tx_hash: TxHash,
    /// Decoded payload
    pub notification: LedgerNotification,
}

impl NotificationEnvelope {
    /// Position used for deduplication across replays.
    #[must_use]
    pub const fn position(&self) -> (BlockNumber, u64) {
        (self.block_number, self.log_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in LedgerEventKind::ALL {
            assert_eq!(LedgerEventKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(LedgerEventKind::from_name("Transfer"), None);
    }

    #[test]
    fn scope_of_notifications() {
        let minted = LedgerNotification::TicketMinted {
            token_id: TokenId(3),
            event_id: EventId(1),
            owner: Address::ZERO,
        };
        assert_eq!(minted.kind(), LedgerEventKind::TicketMinted);
        assert_eq!(minted.token_id(), Some(TokenId(3)));
        assert_eq!(minted.event_id(), Some(EventId(1)));

        let deleted = LedgerNotification::EventDeleted { event_id: EventId(2) };
        assert_eq!(deleted.token_id(), None);
        assert_eq!(deleted.event_id(), Some(EventId(2)));
    }
}
