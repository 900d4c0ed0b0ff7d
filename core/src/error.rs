//! Ledger error taxonomy.
//!
//! Every ledger-facing operation in the workspace reports failures as a
//! [`LedgerError`]. The variants are chosen so callers can decide between
//! retrying, surfacing a message, or giving up without string matching.

use crate::types::TxHash;
use thiserror::Error;

/// Errors that can occur talking to the ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Transport or node failure (connection refused, timeout, 5xx, malformed reply)
    #[error("RPC error: {0}")]
    Rpc(String),

    /// The contract rejected the call
    #[error("Transaction reverted: {reason}")]
    Revert {
        /// Revert reason as reported by the contract
        reason: String,
    },

    /// The account holder declined the signature prompt
    #[error("User rejected the request")]
    UserRejected,

    /// The account cannot cover value plus gas
    #[error("Insufficient funds for value plus gas")]
    InsufficientFunds,

    /// Gas estimation failed, typically a revert that would happen on submit
    #[error("Gas estimation failed: {reason}")]
    GasEstimation {
        /// Underlying reason
        reason: String,
    },

    /// Off-chain metadata could not be fetched or parsed
    #[error("Metadata fetch failed: {0}")]
    MetadataFetch(String),

    /// The token does not exist (never minted or burned)
    #[error("Nonexistent token")]
    NonexistentToken,

    /// No receipt arrived before the deadline; the transaction may still land
    #[error("Timed out waiting for receipt of {tx_hash}")]
    ReceiptTimeout {
        /// Hash of the submitted transaction
        tx_hash: TxHash,
    },

    /// The ledger returned data that could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

impl LedgerError {
    /// Whether retrying the same request may succeed.
    ///
    /// Only transport failures qualify. Reverts, rejections and funding problems
    /// are deterministic for a given ledger state.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }

    /// Whether this reports the token as absent rather than a failure.
    #[must_use]
    pub const fn is_absence(&self) -> bool {
        matches!(self, Self::NonexistentToken)
    }

    /// Revert reason, if the failure carries one.
    #[must_use]
    pub fn revert_reason(&self) -> Option<&str> {
        match self {
            Self::Revert { reason } | Self::GasEstimation { reason } => Some(reason),
            _ => None,
        }
    }

    /// Message suitable for showing to the account holder.
    ///
    /// Known contract revert reasons are mapped to plain sentences; anything else
    /// falls back to the error's display form.
    #[must_use]
    pub fn user_message(&self) -> String {
        if let Some(reason) = self.revert_reason() {
            let lower = reason.to_lowercase();
            if lower.contains("max resale value") {
                return "Price exceeds maximum resale value.".to_string();
            }
            if lower.contains("not owner") || lower.contains("not the owner") {
                return "You do not own this ticket.".to_string();
            }
            if lower.contains("already listed") {
                return "This ticket is already listed for sale.".to_string();
            }
            if lower.contains("not for sale") {
                return "This ticket is not for sale.".to_string();
            }
            if lower.contains("incorrect") && lower.contains("value") {
                return "Payment does not match the asking price.".to_string();
            }
        }
        match self {
            Self::UserRejected => "Transaction was rejected in the wallet.".to_string(),
            Self::InsufficientFunds => {
                "Insufficient funds to cover the price plus gas.".to_string()
            },
            Self::NonexistentToken => "This ticket does not exist.".to_string(),
            Self::ReceiptTimeout { .. } => {
                "Transaction is taking longer than expected. Check back shortly.".to_string()
            },
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rpc_is_retryable() {
        assert!(LedgerError::Rpc("connection refused".into()).is_retryable());
        assert!(!LedgerError::UserRejected.is_retryable());
        assert!(!LedgerError::Revert { reason: "x".into() }.is_retryable());
        assert!(!LedgerError::InsufficientFunds.is_retryable());
        assert!(!LedgerError::ReceiptTimeout { tx_hash: TxHash::new([0; 32]) }.is_retryable());
    }

    #[test]
    fn maps_known_revert_reasons() {
        let err = LedgerError::Revert {
            reason: "Price exceeds max resale value".into(),
        };
        assert_eq!(err.user_message(), "Price exceeds maximum resale value.");

        let err = LedgerError::GasEstimation {
            reason: "execution reverted: Not owner".into(),
        };
        assert_eq!(err.user_message(), "You do not own this ticket.");

        let err = LedgerError::Revert {
            reason: "Ticket already listed".into(),
        };
        assert_eq!(err.user_message(), "This ticket is already listed for sale.");
    }

    #[test]
    fn unknown_reason_falls_back_to_display() {
        let err = LedgerError::Revert {
            reason: "Event inactive".into(),
        };
        assert_eq!(err.user_message(), "Transaction reverted: Event inactive");
        assert_eq!(err.revert_reason(), Some("Event inactive"));
    }
}
