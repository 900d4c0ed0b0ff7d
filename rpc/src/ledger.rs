//! [`Ledger`] over JSON-RPC.

use crate::abi::Token;
use crate::contract::{
    ContractClient, SendOptions, event_from_token, ownership_from_token, ticket_abi,
    token_ids_from_token,
};
use crate::logs::{RawLog, decode_logs, topic};
use crate::transport::{RpcTransport, parse_quantity, quantity};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use ticketchain_core::{
    Address, BlockNumber, EventRecord, LedgerError, LedgerEventKind, LedgerFuture,
    NotificationEnvelope, NotificationFilter, OwnershipEntry, Receipt, SignerGate, TokenId,
    TransactionRequest, TxHash, U256, ledger::Ledger,
};
use url::Url;

/// Whether a revert reason reports an unminted token.
///
/// Covers the OpenZeppelin 4.x message, older "nonexistent token" wording and
/// the 5.x `ERC721NonexistentToken(uint256)` custom error.
#[must_use]
pub fn is_nonexistent_token_reason(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("invalid token id")
        || lower.contains("nonexistent token")
        || lower.contains("erc721nonexistenttoken")
}

fn map_absence(err: LedgerError) -> LedgerError {
    match err {
        LedgerError::Revert { ref reason } if is_nonexistent_token_reason(reason) => {
            LedgerError::NonexistentToken
        },
        other => other,
    }
}

fn uint(value: u64) -> Token {
    Token::Uint(U256::from(value))
}

/// Ledger backed by a JSON-RPC node and one deployed contract.
#[derive(Clone, Debug)]
pub struct RpcLedger {
    contract: ContractClient,
}

impl RpcLedger {
    /// Connect to `endpoint` for the contract at `address`.
    ///
    /// No request is made here; use [`Ledger::chain_id`] to check the network.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Rpc`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: Url,
        address: Address,
        read_timeout: Duration,
        signer: SignerGate,
    ) -> Result<Self, LedgerError> {
        let transport = Arc::new(RpcTransport::new(endpoint, read_timeout)?);
        Ok(Self {
            contract: ContractClient::new(transport, address, signer),
        })
    }

    /// Wrap an existing contract client.
    #[must_use]
    pub const fn from_contract(contract: ContractClient) -> Self {
        Self { contract }
    }

    /// The contract client.
    #[must_use]
    pub const fn contract(&self) -> &ContractClient {
        &self.contract
    }
}

impl Ledger for RpcLedger {
    fn chain_id(&self) -> LedgerFuture<'_, u64> {
        Box::pin(async move {
            let id: String = self.contract.transport().request("eth_chainId", json!([])).await?;
            parse_quantity(&id)
        })
    }

    fn block_number(&self) -> LedgerFuture<'_, BlockNumber> {
        Box::pin(async move {
            let head: String = self
                .contract
                .transport()
                .request("eth_blockNumber", json!([]))
                .await?;
            parse_quantity(&head).map(BlockNumber)
        })
    }

    fn show_events(&self) -> LedgerFuture<'_, Vec<EventRecord>> {
        Box::pin(async move {
            let events = self
                .contract
                .call_one(&ticket_abi::show_events(), &[], None)
                .await?
                .into_array()
                .map_err(|e| LedgerError::Decode(e.to_string()))?;
            events.into_iter().map(event_from_token).collect()
        })
    }

    fn show_listed_tickets(&self) -> LedgerFuture<'_, Vec<TokenId>> {
        Box::pin(async move {
            let ids = self
                .contract
                .call_one(&ticket_abi::show_listed_tickets(), &[], None)
                .await?;
            token_ids_from_token(ids)
        })
    }

    fn owned_tickets(&self, owner: Address) -> LedgerFuture<'_, Vec<TokenId>> {
        Box::pin(async move {
            // The contract answers for msg.sender in some deployments, so send `from` too.
            let ids = self
                .contract
                .call_one(&ticket_abi::get_owned_tickets(), &[Token::Address(owner)], Some(owner))
                .await?;
            token_ids_from_token(ids)
        })
    }

    fn owner_of(&self, token_id: TokenId) -> LedgerFuture<'_, Address> {
        Box::pin(async move {
            let owner = self
                .contract
                .call_one(&ticket_abi::owner_of(), &[uint(token_id.value())], None)
                .await
                .map_err(map_absence)?
                .into_address()
                .map_err(|e| LedgerError::Decode(e.to_string()))?;
            // Some ERC-721 variants return the zero address instead of reverting.
            if owner.is_zero() {
                return Err(LedgerError::NonexistentToken);
            }
            Ok(owner)
        })
    }

    fn event_for_ticket(&self, token_id: TokenId) -> LedgerFuture<'_, EventRecord> {
        Box::pin(async move {
            let event = self
                .contract
                .call_one(&ticket_abi::get_event_for_ticket(), &[uint(token_id.value())], None)
                .await
                .map_err(map_absence)?;
            event_from_token(event)
        })
    }

    fn ticket_owners(&self, token_id: TokenId) -> LedgerFuture<'_, Vec<OwnershipEntry>> {
        Box::pin(async move {
            let rows = self
                .contract
                .call_one(&ticket_abi::get_ticket_owners(), &[uint(token_id.value())], None)
                .await
                .map_err(map_absence)?
                .into_array()
                .map_err(|e| LedgerError::Decode(e.to_string()))?;
            rows.into_iter().map(ownership_from_token).collect()
        })
    }

    fn estimate_gas<'a>(&'a self, tx: &'a TransactionRequest) -> LedgerFuture<'a, u64> {
        Box::pin(self.contract.estimate_gas(tx.from, &tx.call, tx.value))
    }

    fn submit(&self, tx: TransactionRequest) -> LedgerFuture<'_, TxHash> {
        Box::pin(async move {
            let options = SendOptions {
                value: tx.value,
                gas_limit: tx.gas_limit,
            };
            self.contract.submit(tx.from, &tx.call, options).await
        })
    }

    fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Option<Duration>,
    ) -> LedgerFuture<'_, Receipt> {
        Box::pin(self.contract.wait_for_receipt(tx_hash, timeout))
    }

    fn notifications(
        &self,
        filter: NotificationFilter,
    ) -> LedgerFuture<'_, Vec<NotificationEnvelope>> {
        Box::pin(async move {
            let kinds: Vec<LedgerEventKind> = if filter.kinds.is_empty() {
                LedgerEventKind::ALL.to_vec()
            } else {
                filter.kinds.clone()
            };
            let topics: Vec<String> = kinds.into_iter().map(topic).collect();
            let to_block = filter
                .to_block
                .map_or_else(|| "latest".to_string(), |b| quantity(b.value()));

            let logs: Vec<RawLog> = self
                .contract
                .transport()
                .request(
                    "eth_getLogs",
                    json!([{
                        "address": self.contract.address(),
                        "fromBlock": quantity(filter.from_block.value()),
                        "toBlock": to_block,
                        "topics": [topics],
                    }]),
                )
                .await?;

            let decoded = decode_logs(&logs)?;
            Ok(decoded
                .into_iter()
                .filter(|envelope| filter.accepts(envelope.notification.kind()))
                .collect())
        })
    }
}
