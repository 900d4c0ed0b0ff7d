//! The ticketing contract's ABI surface and a client for calling it.

use crate::abi::{self, ParamType, Token};
use crate::logs::{RawLog, decode_logs};
use crate::transport::{RpcTransport, parse_quantity, quantity, wei_quantity};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use ticketchain_core::{
    Address, BlockNumber, ContractWrite, EventId, EventRecord, LedgerError, OwnershipEntry,
    Receipt, SignerGate, TokenId, TxHash, U256, Wei, with_safety_margin,
};

/// A contract function: canonical signature plus output types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    signature: &'static str,
    outputs: Vec<ParamType>,
}

impl Function {
    /// Describe a function.
    #[must_use]
    pub const fn new(signature: &'static str, outputs: Vec<ParamType>) -> Self {
        Self { signature, outputs }
    }

    /// Canonical signature, e.g. `ownerOf(uint256)`.
    #[must_use]
    pub const fn signature(&self) -> &'static str {
        self.signature
    }

    /// Method name without the parameter list.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.signature
            .split_once('(')
            .map_or(self.signature, |(name, _)| name)
    }

    /// Calldata for `args`.
    #[must_use]
    pub fn encode_input(&self, args: &[Token]) -> Vec<u8> {
        abi::encode_call(self.signature, args)
    }

    /// Decode return data.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Decode`] if the data does not match the outputs.
    pub fn decode_output(&self, data: &[u8]) -> Result<Vec<Token>, LedgerError> {
        abi::decode(&self.outputs, data)
            .map_err(|e| LedgerError::Decode(format!("{}: {e}", self.signature)))
    }
}

/// ABI of the ticketing contract.
///
/// The event struct is returned as
/// `(eventId, name, price, maxResalePrice, royaltyPercentage, active, organizer, eventURI)`
/// and ownership rows as `(owner, forSale, price)`.
pub mod ticket_abi {
    use super::{Function, ParamType, Token};
    use ticketchain_core::{ContractWrite, U256};

    fn event_tuple() -> ParamType {
        ParamType::Tuple(vec![
            ParamType::Uint,
            ParamType::String,
            ParamType::Uint,
            ParamType::Uint,
            ParamType::Uint,
            ParamType::Bool,
            ParamType::Address,
            ParamType::String,
        ])
    }

    fn ownership_tuple() -> ParamType {
        ParamType::Tuple(vec![ParamType::Address, ParamType::Bool, ParamType::Uint])
    }

    fn uint_array() -> ParamType {
        ParamType::Array(Box::new(ParamType::Uint))
    }

    /// `showEvents()`
    #[must_use]
    pub fn show_events() -> Function {
        Function::new("showEvents()", vec![ParamType::Array(Box::new(event_tuple()))])
    }

    /// `showListedTickets()`
    #[must_use]
    pub fn show_listed_tickets() -> Function {
        Function::new("showListedTickets()", vec![uint_array()])
    }

    /// `getOwnedTickets(address)`
    #[must_use]
    pub fn get_owned_tickets() -> Function {
        Function::new("getOwnedTickets(address)", vec![uint_array()])
    }

    /// `ownerOf(uint256)`
    #[must_use]
    pub fn owner_of() -> Function {
        Function::new("ownerOf(uint256)", vec![ParamType::Address])
    }

    /// `getEventForTicket(uint256)`
    #[must_use]
    pub fn get_event_for_ticket() -> Function {
        Function::new("getEventForTicket(uint256)", vec![event_tuple()])
    }

    /// `getTicketOwners(uint256)`
    #[must_use]
    pub fn get_ticket_owners() -> Function {
        Function::new(
            "getTicketOwners(uint256)",
            vec![ParamType::Array(Box::new(ownership_tuple()))],
        )
    }

    /// Function and arguments for a state-changing call.
    #[must_use]
    pub fn write(call: &ContractWrite) -> (Function, Vec<Token>) {
        let uint = |v: u64| Token::Uint(U256::from(v));
        match call {
            ContractWrite::CreateEvent {
                name,
                price,
                max_resale_price,
                royalty_percentage,
                metadata_uri,
            } => (
                Function::new("createEvent(string,uint256,uint256,uint256,string)", Vec::new()),
                vec![
                    Token::String(name.clone()),
                    Token::Uint(price.0),
                    Token::Uint(max_resale_price.0),
                    uint(u64::from(*royalty_percentage)),
                    Token::String(metadata_uri.clone()),
                ],
            ),
            ContractWrite::MintTicket { event_id } => (
                Function::new("mintTicket(uint256)", Vec::new()),
                vec![uint(event_id.value())],
            ),
            ContractWrite::ListTicket { token_id, price } => (
                Function::new("listTicket(uint256,uint256)", Vec::new()),
                vec![uint(token_id.value()), Token::Uint(price.0)],
            ),
            ContractWrite::CancelListing { token_id } => (
                Function::new("cancelListing(uint256)", Vec::new()),
                vec![uint(token_id.value())],
            ),
            ContractWrite::BuyTicket { token_id } => (
                Function::new("buyTicket(uint256)", Vec::new()),
                vec![uint(token_id.value())],
            ),
            ContractWrite::DeleteEvent { event_id } => (
                Function::new("deleteEvent(uint256)", Vec::new()),
                vec![uint(event_id.value())],
            ),
        }
    }
}

/// Decode one event tuple.
///
/// # Errors
///
/// Returns [`LedgerError::Decode`] for malformed tuples.
pub fn event_from_token(token: Token) -> Result<EventRecord, LedgerError> {
    let decode = |e: abi::AbiError| LedgerError::Decode(format!("event tuple: {e}"));
    let mut fields = token.into_tuple().map_err(decode)?.into_iter();
    let mut next = || {
        fields
            .next()
            .ok_or_else(|| LedgerError::Decode("event tuple: missing field".into()))
    };

    let event_id = EventId(next()?.into_u64().map_err(decode)?);
    let name = next()?.into_string().map_err(decode)?;
    let original_price = Wei(next()?.into_uint().map_err(decode)?);
    let max_resale_price = Wei(next()?.into_uint().map_err(decode)?);
    let royalty = next()?.into_uint().map_err(decode)?;
    let active = next()?.into_bool().map_err(decode)?;
    let organizer = next()?.into_address().map_err(decode)?;
    let metadata_uri = next()?.into_string().map_err(decode)?;

    let royalty_percentage = u8::try_from(royalty.low_u64())
        .ok()
        .filter(|_| royalty <= U256::from(u8::MAX))
        .ok_or_else(|| LedgerError::Decode(format!("royalty out of range: {royalty}")))?;

    Ok(EventRecord {
        event_id,
        name,
        organizer,
        original_price,
        max_resale_price,
        royalty_percentage,
        active,
        metadata_uri,
    })
}

/// Decode one ownership row.
///
/// # Errors
///
/// Returns [`LedgerError::Decode`] for malformed rows.
pub fn ownership_from_token(token: Token) -> Result<OwnershipEntry, LedgerError> {
    let decode = |e: abi::AbiError| LedgerError::Decode(format!("ownership tuple: {e}"));
    let fields = token.into_tuple().map_err(decode)?;
    let [owner, for_sale, price]: [Token; 3] = fields
        .try_into()
        .map_err(|_| LedgerError::Decode("ownership tuple: expected 3 fields".into()))?;
    Ok(OwnershipEntry {
        owner: owner.into_address().map_err(decode)?,
        for_sale: for_sale.into_bool().map_err(decode)?,
        price: Wei(price.into_uint().map_err(decode)?),
    })
}

/// Decode a `uint256[]` of token ids.
///
/// # Errors
///
/// Returns [`LedgerError::Decode`] for malformed arrays or ids above `u64::MAX`.
pub fn token_ids_from_token(token: Token) -> Result<Vec<TokenId>, LedgerError> {
    let decode = |e: abi::AbiError| LedgerError::Decode(format!("token id array: {e}"));
    token
        .into_array()
        .map_err(decode)?
        .into_iter()
        .map(|id| id.into_u64().map(TokenId).map_err(decode))
        .collect()
}

/// Options for a state-changing call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Payment attached to the call
    pub value: Wei,
    /// Gas limit; the estimate plus safety margin when `None`
    pub gas_limit: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: TxHash,
    block_number: String,
    #[serde(default)]
    status: Option<String>,
    gas_used: String,
    #[serde(default)]
    logs: Vec<RawLog>,
    #[serde(default)]
    revert_reason: Option<String>,
}

/// Client for one deployed contract.
///
/// Reads go through `eth_call` against the latest block. Writes are signed by the
/// node's account management (`eth_sendTransaction`), one prompt at a time through
/// the shared [`SignerGate`].
#[derive(Clone, Debug)]
pub struct ContractClient {
    transport: Arc<RpcTransport>,
    address: Address,
    signer: SignerGate,
    receipt_poll: Duration,
}

impl ContractClient {
    /// Bind a client to the contract at `address`.
    #[must_use]
    pub fn new(transport: Arc<RpcTransport>, address: Address, signer: SignerGate) -> Self {
        Self {
            transport,
            address,
            signer,
            receipt_poll: Duration::from_millis(500),
        }
    }

    /// Change how often pending receipts are polled.
    #[must_use]
    pub const fn with_receipt_poll(mut self, interval: Duration) -> Self {
        self.receipt_poll = interval;
        self
    }

    /// Contract address.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &RpcTransport {
        &self.transport
    }

    fn call_object(&self, from: Option<Address>, data: &[u8], value: Wei) -> Map<String, Value> {
        let mut object = Map::new();
        if let Some(from) = from {
            object.insert("from".into(), json!(from));
        }
        object.insert("to".into(), json!(self.address));
        object.insert("data".into(), json!(abi::to_hex(data)));
        if !value.is_zero() {
            object.insert("value".into(), json!(wei_quantity(value)));
        }
        object
    }

    /// Read-only call.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Rpc`] on transport failure, [`LedgerError::Revert`] when the
    /// contract rejects the call, [`LedgerError::Decode`] for malformed return data.
    #[tracing::instrument(skip(self, function, args), fields(method = function.name()))]
    pub async fn call(
        &self,
        function: &Function,
        args: &[Token],
        from: Option<Address>,
    ) -> Result<Vec<Token>, LedgerError> {
        let data = function.encode_input(args);
        let params = json!([self.call_object(from, &data, Wei::ZERO), "latest"]);
        let result: String = self.transport.request("eth_call", params).await?;
        let bytes = abi::from_hex(&result).map_err(|e| LedgerError::Decode(e.to_string()))?;
        function.decode_output(&bytes)
    }

    /// Read-only call returning a single value.
    ///
    /// # Errors
    ///
    /// As [`ContractClient::call`], plus [`LedgerError::Decode`] when nothing was
    /// returned.
    pub async fn call_one(
        &self,
        function: &Function,
        args: &[Token],
        from: Option<Address>,
    ) -> Result<Token, LedgerError> {
        self.call(function, args, from)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LedgerError::Decode(format!("{}: empty return", function.name())))
    }

    /// Estimate gas for a call.
    ///
    /// # Errors
    ///
    /// Reverts are reported as [`LedgerError::GasEstimation`]; wallet and funding
    /// errors keep their own variants.
    pub async fn estimate_gas(
        &self,
        from: Address,
        call: &ContractWrite,
        value: Wei,
    ) -> Result<u64, LedgerError> {
        let (function, args) = ticket_abi::write(call);
        let data = function.encode_input(&args);
        let params = json!([self.call_object(Some(from), &data, value)]);
        let estimate: String = self
            .transport
            .request("eth_estimateGas", params)
            .await
            .map_err(|err| match err {
                LedgerError::Revert { reason } => LedgerError::GasEstimation { reason },
                other => other,
            })?;
        parse_quantity(&estimate)
    }

    /// Sign and broadcast a call; returns once the node has accepted it.
    ///
    /// # Errors
    ///
    /// [`LedgerError::UserRejected`] if signing is declined,
    /// [`LedgerError::InsufficientFunds`] if the account cannot pay.
    pub async fn submit(
        &self,
        from: Address,
        call: &ContractWrite,
        options: SendOptions,
    ) -> Result<TxHash, LedgerError> {
        let (function, args) = ticket_abi::write(call);
        let data = function.encode_input(&args);
        let mut tx = self.call_object(Some(from), &data, options.value);
        if let Some(gas) = options.gas_limit {
            tx.insert("gas".into(), json!(quantity(gas)));
        }

        let waited = std::time::Instant::now();
        let hash = self
            .signer
            .prompt(self.transport.request::<TxHash>("eth_sendTransaction", json!([tx])))
            .await?;
        tracing::info!(%hash, method = function.name(), waited_ms = waited.elapsed().as_millis(), "Transaction submitted");
        metrics::counter!("rpc.transactions.submitted", "method" => function.name()).increment(1);
        Ok(hash)
    }

    /// Fetch a receipt if the transaction has been mined.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Rpc`] on transport failure, [`LedgerError::Decode`] for
    /// malformed receipts.
    pub async fn receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, LedgerError> {
        let raw: Option<RawReceipt> = self
            .transport
            .request("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        raw.map(|raw| self.convert_receipt(raw)).transpose()
    }

    fn convert_receipt(&self, raw: RawReceipt) -> Result<Receipt, LedgerError> {
        let success = match raw.status.as_deref() {
            Some(status) => parse_quantity(status)? == 1,
            // Pre-Byzantium receipts have no status field.
            None => true,
        };
        let ours: Vec<RawLog> = raw
            .logs
            .into_iter()
            .filter(|log| log.address == self.address)
            .collect();
        Ok(Receipt {
            tx_hash: raw.transaction_hash,
            block_number: BlockNumber(parse_quantity(&raw.block_number)?),
            success,
            gas_used: parse_quantity(&raw.gas_used)?,
            revert_reason: raw.revert_reason,
            notifications: decode_logs(&ours)?,
        })
    }

    /// Poll until `tx_hash` is mined or `timeout` passes.
    ///
    /// Transport errors while polling are logged and polling continues; the
    /// transaction is already broadcast and cannot be abandoned.
    ///
    /// # Errors
    ///
    /// [`LedgerError::ReceiptTimeout`] when the deadline passes first.
    #[tracing::instrument(skip(self))]
    pub async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Option<Duration>,
    ) -> Result<Receipt, LedgerError> {
        let poll = async {
            loop {
                match self.receipt(tx_hash).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {},
                    Err(err) => tracing::warn!(error = %err, "Receipt poll failed, retrying"),
                }
                tokio::time::sleep(self.receipt_poll).await;
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, poll)
                .await
                .map_err(|_| LedgerError::ReceiptTimeout { tx_hash }),
            None => Ok(poll.await),
        }
    }

    /// Estimate, sign, broadcast and wait.
    ///
    /// # Errors
    ///
    /// Any error of the phases; a mined but reverted transaction is returned as
    /// [`LedgerError::Revert`].
    pub async fn send(
        &self,
        from: Address,
        call: &ContractWrite,
        mut options: SendOptions,
        timeout: Option<Duration>,
    ) -> Result<Receipt, LedgerError> {
        let estimate = self.estimate_gas(from, call, options.value).await?;
        options.gas_limit = options.gas_limit.or(Some(with_safety_margin(estimate)));
        let hash = self.submit(from, call, options).await?;
        let receipt = self.wait_for_receipt(hash, timeout).await?;
        match receipt.failure() {
            Some(err) => Err(err),
            None => Ok(receipt),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn event_token(id: u64, name: &str, royalty: u64) -> Token {
        Token::Tuple(vec![
            Token::Uint(U256::from(id)),
            Token::String(name.into()),
            Token::Uint(U256::from(100u64)),
            Token::Uint(U256::from(150u64)),
            Token::Uint(U256::from(royalty)),
            Token::Bool(true),
            Token::Address(Address::new([1; 20])),
            Token::String("https://example.com/1.json".into()),
        ])
    }

    #[test]
    fn decodes_event_tuples() {
        let event = event_from_token(event_token(3, "Concert", 10)).unwrap();
        assert_eq!(event.event_id, EventId(3));
        assert_eq!(event.name, "Concert");
        assert_eq!(event.max_resale_price, Wei::from(150u64));
        assert_eq!(event.royalty_percentage, 10);
        assert!(event.is_listed());
    }

    #[test]
    fn rejects_out_of_range_royalty() {
        assert!(matches!(
            event_from_token(event_token(1, "x", 256)),
            Err(LedgerError::Decode(_))
        ));
    }

    #[test]
    fn show_events_output_decodes_encoded_array() {
        let value = Token::Array(vec![event_token(1, "A", 5), event_token(2, "", 0)]);
        let data = abi::encode(&[value]);
        let tokens = ticket_abi::show_events().decode_output(&data).unwrap();
        let events: Vec<EventRecord> = tokens
            .into_iter()
            .next()
            .unwrap()
            .into_array()
            .unwrap()
            .into_iter()
            .map(|t| event_from_token(t).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert!(!events[1].is_listed());
    }

    #[test]
    fn write_calls_encode_their_selector() {
        let (function, args) = ticket_abi::write(&ContractWrite::ListTicket {
            token_id: TokenId(4),
            price: Wei::from(7u64),
        });
        assert_eq!(function.name(), "listTicket");
        let data = function.encode_input(&args);
        assert_eq!(&data[..4], &abi::selector("listTicket(uint256,uint256)"));
        assert_eq!(data.len(), 4 + 64);
    }

    #[test]
    fn ownership_rows_need_three_fields() {
        let row = Token::Tuple(vec![
            Token::Address(Address::new([2; 20])),
            Token::Bool(true),
            Token::Uint(U256::from(9u64)),
        ]);
        let entry = ownership_from_token(row).unwrap();
        assert!(entry.for_sale);
        assert_eq!(entry.price, Wei::from(9u64));
        assert!(ownership_from_token(Token::Tuple(vec![Token::Bool(true)])).is_err());
    }
}
