//! In-memory ledger for fast, deterministic tests.
//!
//! [`InMemoryLedger`] simulates the observable behaviour of the ticketing contract:
//! resale caps, ownership checks, exact payments, ownership history, emitted
//! notifications and block heights. It also exposes failure injection so tests can
//! exercise transport errors, declined signatures, pending transactions and races.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ticketchain_core::{
    Address, BlockNumber, ContractWrite, EventId, EventRecord, Ledger, LedgerError,
    LedgerFuture, LedgerNotification, NotificationEnvelope, NotificationFilter, OwnershipEntry,
    Receipt, SignerGate, TokenId, TransactionRequest, TxHash, Wei,
};

/// Gas the simulation reports for every call.
pub const SIMULATED_GAS: u64 = 100_000;

/// Revert reason for unminted tokens, as emitted by `OpenZeppelin`'s ERC-721.
pub const INVALID_TOKEN_REASON: &str = "ERC721: invalid token ID";

#[derive(Clone, Debug)]
struct TicketState {
    event_id: EventId,
    owners: Vec<OwnershipEntry>,
}

impl TicketState {
    fn current(&self) -> &OwnershipEntry {
        // Mint always pushes the first entry.
        &self.owners[self.owners.len() - 1]
    }

    fn current_mut(&mut self) -> &mut OwnershipEntry {
        let last = self.owners.len() - 1;
        &mut self.owners[last]
    }
}

#[derive(Clone, Debug, Default)]
struct Contract {
    events: BTreeMap<EventId, EventRecord>,
    tickets: BTreeMap<TokenId, TicketState>,
    next_event_id: u64,
    next_token_id: u64,
}

impl Contract {
    fn new() -> Self {
        Self {
            next_event_id: 1,
            next_token_id: 1,
            ..Self::default()
        }
    }

    fn execute(&mut self, tx: &TransactionRequest) -> Result<Vec<LedgerNotification>, String> {
        match &tx.call {
            ContractWrite::CreateEvent {
                name,
                price,
                max_resale_price,
                royalty_percentage,
                metadata_uri,
            } => {
                if name.is_empty() {
                    return Err("Event name required".into());
                }
                if *royalty_percentage > 100 {
                    return Err("Royalty too high".into());
                }
                if max_resale_price < price {
                    return Err("Max resale below price".into());
                }
                let event_id = EventId(self.next_event_id);
                self.next_event_id += 1;
                self.events.insert(
                    event_id,
                    EventRecord {
                        event_id,
                        name: name.clone(),
                        organizer: tx.from,
                        original_price: *price,
                        max_resale_price: *max_resale_price,
                        royalty_percentage: *royalty_percentage,
                        active: true,
                        metadata_uri: metadata_uri.clone(),
                    },
                );
                Ok(vec![LedgerNotification::EventCreated {
                    event_id,
                    name: name.clone(),
                    price: *price,
                    metadata_uri: metadata_uri.clone(),
                }])
            },
            ContractWrite::MintTicket { event_id } => {
                let event = self
                    .events
                    .get(event_id)
                    .filter(|e| e.active)
                    .ok_or("Event is not active")?;
                if tx.value != event.original_price {
                    return Err("Incorrect payment value".into());
                }
                let token_id = TokenId(self.next_token_id);
                self.next_token_id += 1;
                self.tickets.insert(
                    token_id,
                    TicketState {
                        event_id: *event_id,
                        owners: vec![OwnershipEntry {
                            owner: tx.from,
                            for_sale: false,
                            price: Wei::ZERO,
                        }],
                    },
                );
                Ok(vec![LedgerNotification::TicketMinted {
                    token_id,
                    event_id: *event_id,
                    owner: tx.from,
                }])
            },
            ContractWrite::ListTicket { token_id, price } => {
                let ticket = self.tickets.get(token_id).ok_or(INVALID_TOKEN_REASON)?;
                let max = self
                    .events
                    .get(&ticket.event_id)
                    .map_or(Wei::ZERO, |e| e.max_resale_price);
                let entry = ticket.current();
                if entry.owner != tx.from {
                    return Err("Not owner".into());
                }
                if entry.for_sale {
                    return Err("Ticket already listed".into());
                }
                if *price > max {
                    return Err("Price exceeds max resale value".into());
                }
                let ticket = self.tickets.get_mut(token_id).ok_or(INVALID_TOKEN_REASON)?;
                let entry = ticket.current_mut();
                entry.for_sale = true;
                entry.price = *price;
                Ok(vec![LedgerNotification::TicketListed {
                    token_id: *token_id,
                    owner: tx.from,
                    price: *price,
                }])
            },
            ContractWrite::CancelListing { token_id } => {
                let ticket = self.tickets.get_mut(token_id).ok_or(INVALID_TOKEN_REASON)?;
                let entry = ticket.current_mut();
                if entry.owner != tx.from {
                    return Err("Not owner".into());
                }
                if !entry.for_sale {
                    return Err("Ticket not listed".into());
                }
                entry.for_sale = false;
                entry.price = Wei::ZERO;
                // The contract emits no dedicated event for a cancellation; the
                // listing event with a zero price signals it.
                Ok(vec![LedgerNotification::TicketListed {
                    token_id: *token_id,
                    owner: tx.from,
                    price: Wei::ZERO,
                }])
            },
            ContractWrite::BuyTicket { token_id } => {
                let ticket = self.tickets.get_mut(token_id).ok_or(INVALID_TOKEN_REASON)?;
                let entry = ticket.current_mut();
                if !entry.for_sale {
                    return Err("Ticket not for sale".into());
                }
                if entry.owner == tx.from {
                    return Err("Cannot buy own ticket".into());
                }
                if tx.value != entry.price {
                    return Err("Incorrect payment value".into());
                }
                let seller = entry.owner;
                let price = entry.price;
                entry.for_sale = false;
                ticket.owners.push(OwnershipEntry {
                    owner: tx.from,
                    for_sale: false,
                    price: Wei::ZERO,
                });
                Ok(vec![LedgerNotification::TicketSold {
                    token_id: *token_id,
                    from: seller,
                    to: tx.from,
                    price,
                }])
            },
            ContractWrite::DeleteEvent { event_id } => {
                let event = self
                    .events
                    .get_mut(event_id)
                    .filter(|e| e.active)
                    .ok_or("Event does not exist")?;
                if event.organizer != tx.from {
                    return Err("Only organizer".into());
                }
                // Deleted slots read back as zeroed structs.
                *event = EventRecord {
                    event_id: *event_id,
                    name: String::new(),
                    organizer: Address::ZERO,
                    original_price: Wei::ZERO,
                    max_resale_price: Wei::ZERO,
                    royalty_percentage: 0,
                    active: false,
                    metadata_uri: String::new(),
                };
                Ok(vec![LedgerNotification::EventDeleted { event_id: *event_id }])
            },
        }
    }
}

#[derive(Debug)]
struct Chain {
    chain_id: u64,
    head: u64,
    contract: Contract,
    logs: Vec<NotificationEnvelope>,
    receipts: HashMap<TxHash, Receipt>,
    held: VecDeque<(TxHash, TransactionRequest)>,
    next_tx: u64,
    hold_receipts: bool,
    failing_reads: usize,
    reject_signatures: usize,
    insufficient_funds: bool,
    forced_revert: Option<String>,
    owner_of_errors: HashMap<TokenId, LedgerError>,
    read_delays: VecDeque<Duration>,
}

impl Chain {
    fn mine(&mut self, tx_hash: TxHash, tx: &TransactionRequest) -> Receipt {
        self.head += 1;
        let block_number = BlockNumber(self.head);

        let outcome = match self.forced_revert.take() {
            Some(reason) => Err(reason),
            None => self.contract.execute(tx),
        };

        let receipt = match outcome {
            Ok(notifications) => {
                let envelopes: Vec<_> = notifications
                    .into_iter()
                    .enumerate()
                    .map(|(index, notification)| NotificationEnvelope {
                        block_number,
                        log_index: index as u64,
                        tx_hash,
                        notification,
                    })
                    .collect();
                self.logs.extend(envelopes.iter().cloned());
                Receipt {
                    tx_hash,
                    block_number,
                    success: true,
                    gas_used: SIMULATED_GAS,
                    revert_reason: None,
                    notifications: envelopes,
                }
            },
            Err(reason) => Receipt {
                tx_hash,
                block_number,
                success: false,
                gas_used: SIMULATED_GAS,
                revert_reason: Some(reason),
                notifications: Vec::new(),
            },
        };
        self.receipts.insert(tx_hash, receipt.clone());
        receipt
    }

    fn check_read(&mut self) -> Result<(), LedgerError> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(LedgerError::Rpc("connection refused".into()));
        }
        Ok(())
    }
}

/// Simulated ticketing contract.
///
/// Clones share the same chain.
///
/// # Example
///
/// ```
/// use ticketchain_core::{Address, ContractWrite, Ledger, TransactionRequest, Wei};
/// use ticketchain_testing::InMemoryLedger;
///
/// # async fn example() -> Result<(), ticketchain_core::LedgerError> {
/// let ledger = InMemoryLedger::new();
/// let organizer = Address::new([1; 20]);
/// let event_id = ledger.create_event(organizer, "Concert", Wei::from(10u64), Wei::from(20u64));
///
/// let buyer = Address::new([2; 20]);
/// let mint = TransactionRequest::new(buyer, ContractWrite::MintTicket { event_id })
///     .with_value(Wei::from(10u64));
/// let receipt = ledger.send(mint, None).await?;
/// assert!(receipt.success);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryLedger {
    chain: Arc<Mutex<Chain>>,
    signer: SignerGate,
    signature_delay: Arc<Mutex<Duration>>,
    active_prompts: Arc<AtomicUsize>,
    peak_prompts: Arc<AtomicUsize>,
    estimate_calls: Arc<AtomicUsize>,
    submit_calls: Arc<AtomicUsize>,
    read_calls: Arc<AtomicUsize>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// A fresh chain (id 1337) with no events.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chain: Arc::new(Mutex::new(Chain {
                chain_id: 1337,
                head: 0,
                contract: Contract::new(),
                logs: Vec::new(),
                receipts: HashMap::new(),
                held: VecDeque::new(),
                next_tx: 1,
                hold_receipts: false,
                failing_reads: 0,
                reject_signatures: 0,
                insufficient_funds: false,
                forced_revert: None,
                owner_of_errors: HashMap::new(),
                read_delays: VecDeque::new(),
            })),
            signer: SignerGate::new(),
            signature_delay: Arc::new(Mutex::new(Duration::ZERO)),
            active_prompts: Arc::new(AtomicUsize::new(0)),
            peak_prompts: Arc::new(AtomicUsize::new(0)),
            estimate_calls: Arc::new(AtomicUsize::new(0)),
            submit_calls: Arc::new(AtomicUsize::new(0)),
            read_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    // ----- setup -------------------------------------------------------------

    /// Create an event directly (mined in its own block), returning its id.
    pub fn create_event(
        &self,
        organizer: Address,
        name: &str,
        price: Wei,
        max_resale_price: Wei,
    ) -> EventId {
        self.create_event_with_uri(organizer, name, price, max_resale_price, "")
    }

    /// Create an event with a metadata locator.
    pub fn create_event_with_uri(
        &self,
        organizer: Address,
        name: &str,
        price: Wei,
        max_resale_price: Wei,
        metadata_uri: &str,
    ) -> EventId {
        let receipt = self.apply(TransactionRequest::new(
            organizer,
            ContractWrite::CreateEvent {
                name: name.to_string(),
                price,
                max_resale_price,
                royalty_percentage: 10,
                metadata_uri: metadata_uri.to_string(),
            },
        ));
        match receipt.notifications.first().map(|e| &e.notification) {
            Some(LedgerNotification::EventCreated { event_id, .. }) => *event_id,
            _ => EventId(0),
        }
    }

    /// Mint a ticket for `owner` with exact payment, returning its id.
    pub fn mint(&self, owner: Address, event_id: EventId) -> TokenId {
        let price = self
            .chain
            .lock()
            .unwrap()
            .contract
            .events
            .get(&event_id)
            .map_or(Wei::ZERO, |e| e.original_price);
        let receipt = self.apply(
            TransactionRequest::new(owner, ContractWrite::MintTicket { event_id })
                .with_value(price),
        );
        match receipt.notifications.first().map(|e| &e.notification) {
            Some(LedgerNotification::TicketMinted { token_id, .. }) => *token_id,
            _ => TokenId(0),
        }
    }

    /// List a ticket directly.
    pub fn list(&self, owner: Address, token_id: TokenId, price: Wei) -> Receipt {
        self.apply(TransactionRequest::new(
            owner,
            ContractWrite::ListTicket { token_id, price },
        ))
    }

    /// Buy a ticket directly, paying its listing price.
    pub fn buy(&self, buyer: Address, token_id: TokenId) -> Receipt {
        let price = self
            .ticket_owners_now(token_id)
            .last()
            .map_or(Wei::ZERO, |e| e.price);
        self.apply(
            TransactionRequest::new(buyer, ContractWrite::BuyTicket { token_id })
                .with_value(price),
        )
    }

    /// Execute a transaction immediately, bypassing signature and estimation.
    pub fn apply(&self, tx: TransactionRequest) -> Receipt {
        let mut chain = self.chain.lock().unwrap();
        let hash = next_hash(&mut chain);
        chain.mine(hash, &tx)
    }

    /// Overwrite a listing without the resale-cap check, to simulate a
    /// misbehaving contract.
    pub fn corrupt_listing(&self, token_id: TokenId, price: Wei) {
        let mut chain = self.chain.lock().unwrap();
        if let Some(ticket) = chain.contract.tickets.get_mut(&token_id) {
            let entry = ticket.current_mut();
            entry.for_sale = true;
            entry.price = price;
        }
    }

    // ----- failure injection -------------------------------------------------

    /// Fail the next `count` read calls with a transport error.
    pub fn fail_next_reads(&self, count: usize) {
        self.chain.lock().unwrap().failing_reads = count;
    }

    /// Decline the next `count` signature prompts.
    pub fn reject_next_signatures(&self, count: usize) {
        self.chain.lock().unwrap().reject_signatures = count;
    }

    /// Report insufficient funds for every estimate and submission.
    pub fn set_insufficient_funds(&self, enabled: bool) {
        self.chain.lock().unwrap().insufficient_funds = enabled;
    }

    /// Mine the next submitted transaction as reverted with `reason`.
    pub fn revert_next_submission(&self, reason: &str) {
        self.chain.lock().unwrap().forced_revert = Some(reason.to_string());
    }

    /// Make `ownerOf(token_id)` fail with `error`.
    pub fn fail_owner_of(&self, token_id: TokenId, error: LedgerError) {
        self.chain
            .lock()
            .unwrap()
            .owner_of_errors
            .insert(token_id, error);
    }

    /// Delay the next `owned_tickets`/`show_listed_tickets` reads, one delay each.
    pub fn delay_next_enumerations(&self, delays: impl IntoIterator<Item = Duration>) {
        self.chain.lock().unwrap().read_delays.extend(delays);
    }

    /// Hold submitted transactions unmined until [`InMemoryLedger::mine_pending`].
    pub fn hold_receipts(&self, hold: bool) {
        self.chain.lock().unwrap().hold_receipts = hold;
    }

    /// Mine every held transaction in submission order.
    pub fn mine_pending(&self) -> Vec<Receipt> {
        let mut chain = self.chain.lock().unwrap();
        let held: Vec<_> = chain.held.drain(..).collect();
        held.into_iter()
            .map(|(hash, tx)| chain.mine(hash, &tx))
            .collect()
    }

    /// Hold each signature prompt open for `delay`.
    pub fn set_signature_delay(&self, delay: Duration) {
        *self.signature_delay.lock().unwrap() = delay;
    }

    /// Switch the reported chain id (network switch).
    pub fn set_chain_id(&self, chain_id: u64) {
        self.chain.lock().unwrap().chain_id = chain_id;
    }

    // ----- inspection --------------------------------------------------------

    /// Current head block.
    #[must_use]
    pub fn head(&self) -> BlockNumber {
        BlockNumber(self.chain.lock().unwrap().head)
    }

    /// Number of `estimate_gas` calls.
    #[must_use]
    pub fn estimate_calls(&self) -> usize {
        self.estimate_calls.load(Ordering::SeqCst)
    }

    /// Number of `submit` calls.
    #[must_use]
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Number of read calls of any kind.
    #[must_use]
    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Highest number of signature prompts ever open at once.
    #[must_use]
    pub fn peak_signature_prompts(&self) -> usize {
        self.peak_prompts.load(Ordering::SeqCst)
    }

    /// Current ownership history of a token.
    #[must_use]
    pub fn ticket_owners_now(&self, token_id: TokenId) -> Vec<OwnershipEntry> {
        self.chain
            .lock()
            .unwrap()
            .contract
            .tickets
            .get(&token_id)
            .map(|t| t.owners.clone())
            .unwrap_or_default()
    }

    /// Number of minted tokens.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.chain.lock().unwrap().contract.tickets.len()
    }

    fn read<T>(&self, f: impl FnOnce(&Chain) -> Result<T, LedgerError>) -> Result<T, LedgerError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let mut chain = self.chain.lock().unwrap();
        chain.check_read()?;
        f(&chain)
    }

    fn next_read_delay(&self) -> Option<Duration> {
        self.chain.lock().unwrap().read_delays.pop_front()
    }
}

fn next_hash(chain: &mut Chain) -> TxHash {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&chain.next_tx.to_be_bytes());
    chain.next_tx += 1;
    TxHash::new(bytes)
}

fn token_exists(chain: &Chain, token_id: TokenId) -> Result<&TicketState, LedgerError> {
    chain
        .contract
        .tickets
        .get(&token_id)
        .ok_or(LedgerError::NonexistentToken)
}

impl Ledger for InMemoryLedger {
    fn chain_id(&self) -> LedgerFuture<'_, u64> {
        Box::pin(async move { self.read(|c| Ok(c.chain_id)) })
    }

    fn block_number(&self) -> LedgerFuture<'_, BlockNumber> {
        Box::pin(async move { self.read(|c| Ok(BlockNumber(c.head))) })
    }

    fn show_events(&self) -> LedgerFuture<'_, Vec<EventRecord>> {
        Box::pin(async move { self.read(|c| Ok(c.contract.events.values().cloned().collect())) })
    }

    fn show_listed_tickets(&self) -> LedgerFuture<'_, Vec<TokenId>> {
        Box::pin(async move {
            if let Some(delay) = self.next_read_delay() {
                tokio::time::sleep(delay).await;
            }
            self.read(|c| {
                Ok(c.contract
                    .tickets
                    .iter()
                    .filter(|(_, t)| t.current().for_sale)
                    .map(|(id, _)| *id)
                    .collect())
            })
        })
    }

    fn owned_tickets(&self, owner: Address) -> LedgerFuture<'_, Vec<TokenId>> {
        Box::pin(async move {
            // Snapshot first, then sleep: a delayed read returns the state it
            // observed when it started, like a slow node would.
            let snapshot = self.read(|c| {
                Ok(c.contract
                    .tickets
                    .iter()
                    .filter(|(_, t)| t.current().owner == owner)
                    .map(|(id, _)| *id)
                    .collect())
            });
            if let Some(delay) = self.next_read_delay() {
                tokio::time::sleep(delay).await;
            }
            snapshot
        })
    }

    fn owner_of(&self, token_id: TokenId) -> LedgerFuture<'_, Address> {
        Box::pin(async move {
            self.read(|c| {
                if let Some(error) = c.owner_of_errors.get(&token_id) {
                    return Err(error.clone());
                }
                token_exists(c, token_id).map(|t| t.current().owner)
            })
        })
    }

    fn event_for_ticket(&self, token_id: TokenId) -> LedgerFuture<'_, EventRecord> {
        Box::pin(async move {
            self.read(|c| {
                let ticket = token_exists(c, token_id)?;
                c.contract
                    .events
                    .get(&ticket.event_id)
                    .cloned()
                    .ok_or_else(|| LedgerError::Revert {
                        reason: "Event does not exist".into(),
                    })
            })
        })
    }

    fn ticket_owners(&self, token_id: TokenId) -> LedgerFuture<'_, Vec<OwnershipEntry>> {
        Box::pin(async move { self.read(|c| token_exists(c, token_id).map(|t| t.owners.clone())) })
    }

    fn estimate_gas<'a>(&'a self, tx: &'a TransactionRequest) -> LedgerFuture<'a, u64> {
        Box::pin(async move {
            self.estimate_calls.fetch_add(1, Ordering::SeqCst);
            let chain = self.chain.lock().unwrap();
            if chain.insufficient_funds {
                return Err(LedgerError::InsufficientFunds);
            }
            let mut dry_run = chain.contract.clone();
            dry_run
                .execute(tx)
                .map(|_| SIMULATED_GAS)
                .map_err(|reason| LedgerError::GasEstimation {
                    reason: format!("execution reverted: {reason}"),
                })
        })
    }

    fn submit(&self, tx: TransactionRequest) -> LedgerFuture<'_, TxHash> {
        Box::pin(async move {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.signature_delay.lock().unwrap();

            let approved = self
                .signer
                .prompt(async {
                    let open = self.active_prompts.fetch_add(1, Ordering::SeqCst) + 1;
                    self.peak_prompts.fetch_max(open, Ordering::SeqCst);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    self.active_prompts.fetch_sub(1, Ordering::SeqCst);

                    let mut chain = self.chain.lock().unwrap();
                    if chain.reject_signatures > 0 {
                        chain.reject_signatures -= 1;
                        return Err(LedgerError::UserRejected);
                    }
                    Ok(())
                })
                .await;
            approved?;

            let mut chain = self.chain.lock().unwrap();
            if chain.insufficient_funds {
                return Err(LedgerError::InsufficientFunds);
            }
            let hash = next_hash(&mut chain);
            if chain.hold_receipts {
                chain.held.push_back((hash, tx));
            } else {
                chain.mine(hash, &tx);
            }
            Ok(hash)
        })
    }

    fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Option<Duration>,
    ) -> LedgerFuture<'_, Receipt> {
        Box::pin(async move {
            let started = tokio::time::Instant::now();
            loop {
                if let Some(receipt) = self.chain.lock().unwrap().receipts.get(&tx_hash) {
                    return Ok(receipt.clone());
                }
                if timeout.is_some_and(|t| started.elapsed() >= t) {
                    return Err(LedgerError::ReceiptTimeout { tx_hash });
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    }

    fn notifications(
        &self,
        filter: NotificationFilter,
    ) -> LedgerFuture<'_, Vec<NotificationEnvelope>> {
        Box::pin(async move {
            self.read(|c| {
                let to = filter.to_block.unwrap_or(BlockNumber(c.head));
                Ok(c.logs
                    .iter()
                    .filter(|e| e.block_number >= filter.from_block && e.block_number <= to)
                    .filter(|e| filter.accepts(e.notification.kind()))
                    .cloned()
                    .collect())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    #[tokio::test]
    async fn mint_requires_exact_payment() {
        let ledger = InMemoryLedger::new();
        let event = ledger.create_event(addr(1), "Concert", Wei::from(100u64), Wei::from(200u64));

        let underpaid = TransactionRequest::new(addr(2), ContractWrite::MintTicket { event_id: event })
            .with_value(Wei::from(99u64));
        let err = ledger.estimate_gas(&underpaid).await.unwrap_err();
        assert!(matches!(err, LedgerError::GasEstimation { ref reason } if reason.contains("Incorrect payment")));

        let token = ledger.mint(addr(2), event);
        assert_eq!(ledger.owner_of(token).await.unwrap(), addr(2));
    }

    #[tokio::test]
    async fn resale_flow_updates_history() {
        let ledger = InMemoryLedger::new();
        let event = ledger.create_event(addr(1), "Concert", Wei::from(100u64), Wei::from(200u64));
        let token = ledger.mint(addr(2), event);

        assert!(!ledger.list(addr(2), token, Wei::from(201u64)).success);
        assert!(!ledger.list(addr(3), token, Wei::from(150u64)).success);
        assert!(ledger.list(addr(2), token, Wei::from(150u64)).success);
        assert_eq!(ledger.show_listed_tickets().await.unwrap(), vec![token]);

        assert!(ledger.buy(addr(3), token).success);
        let owners = ledger.ticket_owners(token).await.unwrap();
        assert_eq!(owners.len(), 2);
        assert!(!owners[0].for_sale);
        assert_eq!(owners[1].owner, addr(3));
        assert!(ledger.show_listed_tickets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_token_is_absent() {
        let ledger = InMemoryLedger::new();
        assert_eq!(
            ledger.owner_of(TokenId(42)).await,
            Err(LedgerError::NonexistentToken)
        );
    }

    #[tokio::test]
    async fn held_receipts_time_out_then_mine() {
        let ledger = InMemoryLedger::new();
        let event = ledger.create_event(addr(1), "Concert", Wei::from(1u64), Wei::from(1u64));
        ledger.hold_receipts(true);

        let tx = TransactionRequest::new(addr(2), ContractWrite::MintTicket { event_id: event })
            .with_value(Wei::from(1u64));
        let hash = ledger.submit(tx).await.unwrap();
        let err = ledger
            .wait_for_receipt(hash, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::ReceiptTimeout { tx_hash: hash });

        ledger.mine_pending();
        assert!(ledger.wait_for_receipt(hash, None).await.unwrap().success);
    }

    #[tokio::test]
    async fn notifications_respect_filter() {
        let ledger = InMemoryLedger::new();
        let event = ledger.create_event(addr(1), "Concert", Wei::from(1u64), Wei::from(1u64));
        ledger.mint(addr(2), event);

        let all = ledger
            .notifications(NotificationFilter::from_block(BlockNumber(0)))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let mints = ledger
            .notifications(
                NotificationFilter::from_block(BlockNumber(0))
                    .with_kind(ticketchain_core::LedgerEventKind::TicketMinted),
            )
            .await
            .unwrap();
        assert_eq!(mints.len(), 1);
        assert_eq!(mints[0].block_number, BlockNumber(2));
    }

    #[tokio::test]
    async fn injected_read_failures_are_transient() {
        let ledger = InMemoryLedger::new();
        ledger.fail_next_reads(1);
        assert!(matches!(ledger.block_number().await, Err(LedgerError::Rpc(_))));
        assert_eq!(ledger.block_number().await, Ok(BlockNumber(0)));
    }
}
