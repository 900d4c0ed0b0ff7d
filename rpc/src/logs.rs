//! Contract log decoding.
//!
//! Indexed parameters are taken from the topics in declaration order, the rest
//! from the data section. The number of indexed parameters is read off the log
//! itself (`topics.len() - 1`), so the decoder works whether or not a deployment
//! marked ids and addresses as `indexed`.

use crate::abi::{self, ParamType, Token};
use crate::transport::parse_quantity;
use serde::Deserialize;
use ticketchain_core::{
    Address, BlockNumber, EventId, LedgerError, LedgerEventKind, LedgerNotification,
    NotificationEnvelope, TokenId, TxHash, Wei,
};

/// A log as returned by `eth_getLogs` or inside a receipt.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    /// Emitting contract
    pub address: Address,
    /// Topic hashes, `0x`-prefixed
    pub topics: Vec<String>,
    /// Non-indexed data, `0x`-prefixed
    pub data: String,
    /// Block quantity; absent for pending logs
    #[serde(default)]
    pub block_number: Option<String>,
    /// Position in the block
    #[serde(default)]
    pub log_index: Option<String>,
    /// Emitting transaction
    #[serde(default)]
    pub transaction_hash: Option<TxHash>,
    /// Set when the log was removed by a reorg
    #[serde(default)]
    pub removed: bool,
}

/// Canonical event signature for a notification kind.
#[must_use]
pub const fn signature(kind: LedgerEventKind) -> &'static str {
    match kind {
        LedgerEventKind::EventCreated => "EventCreated(uint256,string,uint256,string)",
        LedgerEventKind::EventDeleted => "EventDeleted(uint256)",
        LedgerEventKind::TicketMinted => "TicketMinted(uint256,uint256,address)",
        LedgerEventKind::TicketListed => "TicketListed(uint256,address,uint256)",
        LedgerEventKind::TicketSold => "TicketSold(uint256,address,address,uint256)",
    }
}

/// Topic hash for a notification kind, `0x`-prefixed.
#[must_use]
pub fn topic(kind: LedgerEventKind) -> String {
    abi::to_hex(&abi::event_topic(signature(kind)))
}

fn kind_for_topic(topic0: &str) -> Option<LedgerEventKind> {
    LedgerEventKind::ALL
        .iter()
        .copied()
        .find(|kind| topic(*kind).eq_ignore_ascii_case(topic0))
}

fn params(kind: LedgerEventKind) -> Vec<ParamType> {
    match kind {
        LedgerEventKind::EventCreated => vec![
            ParamType::Uint,
            ParamType::String,
            ParamType::Uint,
            ParamType::String,
        ],
        LedgerEventKind::EventDeleted => vec![ParamType::Uint],
        LedgerEventKind::TicketMinted => {
            vec![ParamType::Uint, ParamType::Uint, ParamType::Address]
        },
        LedgerEventKind::TicketListed => {
            vec![ParamType::Uint, ParamType::Address, ParamType::Uint]
        },
        LedgerEventKind::TicketSold => vec![
            ParamType::Uint,
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint,
        ],
    }
}

fn decode_err(kind: LedgerEventKind) -> impl Fn(abi::AbiError) -> LedgerError {
    move |e| LedgerError::Decode(format!("{} log: {e}", kind.name()))
}

fn values(kind: LedgerEventKind, log: &RawLog) -> Result<Vec<Token>, LedgerError> {
    let types = params(kind);
    let indexed = log.topics.len().saturating_sub(1);
    if indexed > types.len() || types[..indexed].iter().any(ParamType::is_dynamic) {
        return Err(LedgerError::Decode(format!(
            "{} log: unexpected topic count {}",
            kind.name(),
            log.topics.len()
        )));
    }

    let mut tokens = Vec::with_capacity(types.len());
    for (ty, topic) in types.iter().zip(&log.topics[1..]) {
        let word = abi::from_hex(topic).map_err(decode_err(kind))?;
        let mut decoded = abi::decode(std::slice::from_ref(ty), &word).map_err(decode_err(kind))?;
        tokens.append(&mut decoded);
    }
    let data = abi::from_hex(&log.data).map_err(decode_err(kind))?;
    tokens.extend(abi::decode(&types[indexed..], &data).map_err(decode_err(kind))?);
    Ok(tokens)
}

fn notification(kind: LedgerEventKind, tokens: Vec<Token>) -> Result<LedgerNotification, abi::AbiError> {
    let mut it = tokens.into_iter();
    let mut next = || it.next().ok_or(abi::AbiError::UnexpectedToken("log parameter"));
    Ok(match kind {
        LedgerEventKind::EventCreated => LedgerNotification::EventCreated {
            event_id: EventId(next()?.into_u64()?),
            name: next()?.into_string()?,
            price: Wei(next()?.into_uint()?),
            metadata_uri: next()?.into_string()?,
        },
        LedgerEventKind::EventDeleted => LedgerNotification::EventDeleted {
            event_id: EventId(next()?.into_u64()?),
        },
        LedgerEventKind::TicketMinted => LedgerNotification::TicketMinted {
            token_id: TokenId(next()?.into_u64()?),
            event_id: EventId(next()?.into_u64()?),
            owner: next()?.into_address()?,
        },
        LedgerEventKind::TicketListed => LedgerNotification::TicketListed {
            token_id: TokenId(next()?.into_u64()?),
            owner: next()?.into_address()?,
            price: Wei(next()?.into_uint()?),
        },
        LedgerEventKind::TicketSold => LedgerNotification::TicketSold {
            token_id: TokenId(next()?.into_u64()?),
            from: next()?.into_address()?,
            to: next()?.into_address()?,
            price: Wei(next()?.into_uint()?),
        },
    })
}

/// Decode one log.
///
/// Logs with an unknown first topic, no topics, or the `removed` flag yield
/// `Ok(None)`.
///
/// # Errors
///
/// Returns [`LedgerError::Decode`] for a known event whose payload is malformed.
pub fn decode_log(log: &RawLog) -> Result<Option<NotificationEnvelope>, LedgerError> {
    if log.removed {
        return Ok(None);
    }
    let Some(kind) = log.topics.first().and_then(|t| kind_for_topic(t)) else {
        return Ok(None);
    };

    let tokens = values(kind, log)?;
    let notification = notification(kind, tokens).map_err(decode_err(kind))?;

    Ok(Some(NotificationEnvelope {
        block_number: BlockNumber(log.block_number.as_deref().map(parse_quantity).transpose()?.unwrap_or(0)),
        log_index: log.log_index.as_deref().map(parse_quantity).transpose()?.unwrap_or(0),
        tx_hash: log.transaction_hash.unwrap_or(TxHash::new([0; 32])),
        notification,
    }))
}

/// Decode a batch of logs, skipping unrelated ones, ordered by position.
///
/// # Errors
///
/// Returns the first decode error.
pub fn decode_logs(logs: &[RawLog]) -> Result<Vec<NotificationEnvelope>, LedgerError> {
    let mut out = Vec::with_capacity(logs.len());
    for log in logs {
        if let Some(envelope) = decode_log(log)? {
            out.push(envelope);
        }
    }
    out.sort_by_key(NotificationEnvelope::position);
    Ok(out)
}
