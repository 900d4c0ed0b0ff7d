//! Ledger notification subscriptions.
//!
//! A subscription is a lazy, infinite stream of decoded contract logs, produced
//! by polling the ledger from a block cursor. Transport failures are yielded as
//! [`SubscriptionError::ConnectionLost`]; the stream then backs off and replays
//! from the last block it delivered, dropping logs it has already yielded.
//!
//! [`Subscriber::spawn_reconciliation`] couples a subscription to the
//! [`Reconciler`] so every notification refreshes exactly the token or event it
//! names.

use crate::reconciler::Reconciler;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use ticketchain_core::{
    BlockNumber, Ledger, LedgerError, LedgerEventKind, LedgerNotification, NotificationEnvelope,
    NotificationFilter,
};
use ticketchain_runtime::RetryPolicy;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors surfaced on a notification stream.
///
/// Neither ends the stream; the next item is a replay from the cursor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The node could not be reached
    #[error("Connection to ledger lost: {0}")]
    ConnectionLost(LedgerError),

    /// The node answered but the poll failed (bad reply, undecodable log)
    #[error("Notification poll failed: {0}")]
    PollFailed(LedgerError),
}

/// Item type of a notification stream.
pub type NotificationResult = Result<NotificationEnvelope, SubscriptionError>;

/// A notification stream.
pub type NotificationStream = BoxStream<'static, NotificationResult>;

/// Identifies a live subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Creates and cancels notification subscriptions against one ledger.
///
/// Dropping the subscriber ends every stream it created.
pub struct Subscriber {
    ledger: Arc<dyn Ledger>,
    poll_interval: Duration,
    backoff: RetryPolicy,
    next_handle: AtomicU64,
    live: Mutex<HashMap<SubscriptionHandle, watch::Sender<bool>>>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("poll_interval", &self.poll_interval)
            .field("live", &self.live_count())
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Poll `ledger` every `poll_interval`.
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, poll_interval: Duration) -> Self {
        Self {
            ledger,
            poll_interval,
            backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(500))
                .max_delay(Duration::from_secs(30))
                .build(),
            next_handle: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Backoff applied between polls after a failure.
    #[must_use]
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Subscribe to notifications of `kind` (all kinds when `None`) from
    /// `from_block` onwards.
    ///
    /// The stream starts polling when first polled and never ends on its own;
    /// [`Subscriber::unsubscribe`] ends it at the next poll boundary.
    #[tracing::instrument(skip(self))]
    pub fn subscribe(
        &self,
        kind: Option<LedgerEventKind>,
        from_block: BlockNumber,
    ) -> (SubscriptionHandle, NotificationStream) {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let (cancel, cancelled) = watch::channel(false);
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, cancel);

        let mut filter = NotificationFilter::from_block(from_block);
        if let Some(kind) = kind {
            filter = filter.with_kind(kind);
        }
        tracing::info!(%handle, ?kind, %from_block, "Subscription opened");
        metrics::gauge!("subscriber.live").increment(1.0);

        let stream = poll_notifications(
            Arc::clone(&self.ledger),
            filter,
            self.poll_interval,
            self.backoff.clone(),
            cancelled,
        );
        (handle, stream)
    }

    /// End a subscription. Returns `false` for unknown or already ended handles.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
        match removed {
            Some(cancel) => {
                let _ = cancel.send(true);
                tracing::info!(%handle, "Subscription closed");
                metrics::gauge!("subscriber.live").decrement(1.0);
                true
            },
            None => false,
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Subscribe and feed every notification to `reconciler`.
    ///
    /// The task ends when the subscription is cancelled.
    pub fn spawn_reconciliation(
        &self,
        reconciler: Arc<Reconciler>,
        kind: Option<LedgerEventKind>,
        from_block: BlockNumber,
    ) -> (SubscriptionHandle, JoinHandle<()>) {
        let (handle, mut stream) = self.subscribe(kind, from_block);
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(envelope) => {
                        if let Err(err) = reconcile_notification(&reconciler, &envelope).await {
                            tracing::warn!(
                                %handle,
                                block = %envelope.block_number,
                                kind = %envelope.notification.kind(),
                                error = %err,
                                "Targeted reconciliation failed"
                            );
                        }
                    },
                    Err(err) => tracing::warn!(%handle, error = %err, "Subscription interrupted"),
                }
            }
            tracing::debug!(%handle, "Reconciliation task finished");
        });
        (handle, task)
    }
}

/// Reconcile exactly what `envelope` names.
///
/// # Errors
///
/// Returns the reconciler's [`LedgerError`].
pub async fn reconcile_notification(
    reconciler: &Reconciler,
    envelope: &NotificationEnvelope,
) -> Result<(), LedgerError> {
    match &envelope.notification {
        LedgerNotification::TicketMinted { token_id, .. }
        | LedgerNotification::TicketListed { token_id, .. }
        | LedgerNotification::TicketSold { token_id, .. } => {
            reconciler.reconcile_token(*token_id).await.map(drop)
        },
        LedgerNotification::EventCreated { event_id, .. }
        | LedgerNotification::EventDeleted { event_id } => {
            reconciler.reconcile_event(*event_id).await.map(drop)
        },
    }
}

/// Cursor-driven polling loop behind every subscription.
fn poll_notifications(
    ledger: Arc<dyn Ledger>,
    filter: NotificationFilter,
    poll_interval: Duration,
    backoff: RetryPolicy,
    mut cancelled: watch::Receiver<bool>,
) -> NotificationStream {
    let stream = async_stream::stream! {
        let mut cursor = filter.from_block;
        // Positions already yielded at or after `replay_from`, the newest block
        // delivered by the last successful poll.
        let mut delivered: BTreeSet<(BlockNumber, u64)> = BTreeSet::new();
        let mut replay_from = cursor;
        let mut failures = 0usize;

        loop {
            if *cancelled.borrow() {
                break;
            }

            let polled = poll_once(ledger.as_ref(), &filter, cursor).await;
            let pause = match polled {
                Ok(Some((head, logs))) => {
                    failures = 0;
                    let mut last_block = None;
                    for envelope in logs {
                        if !delivered.insert(envelope.position()) {
                            metrics::counter!("subscriber.duplicates_dropped").increment(1);
                            continue;
                        }
                        metrics::counter!(
                            "subscriber.notifications",
                            "kind" => envelope.notification.kind().name()
                        )
                        .increment(1);
                        last_block = Some(envelope.block_number);
                        yield Ok(envelope);
                    }
                    replay_from = last_block.unwrap_or_else(|| head.next());
                    delivered.retain(|(block, _)| *block >= replay_from);
                    cursor = head.next();
                    poll_interval
                },
                Ok(None) => poll_interval,
                Err(err) => {
                    let delay = backoff.delay_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    cursor = replay_from.min(cursor);
                    tracing::warn!(
                        %cursor,
                        attempt = failures,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Notification poll failed, replaying after backoff"
                    );
                    metrics::counter!("subscriber.poll_failures").increment(1);
                    yield Err(if err.is_retryable() {
                        SubscriptionError::ConnectionLost(err)
                    } else {
                        SubscriptionError::PollFailed(err)
                    });
                    delay
                },
            };

            tokio::select! {
                () = tokio::time::sleep(pause) => {},
                changed = cancelled.changed() => {
                    if changed.is_err() {
                        break;
                    }
                },
            }
        }
    };
    Box::pin(stream)
}

/// Fetch `[cursor, head]`; `None` while the head has not reached the cursor.
async fn poll_once(
    ledger: &dyn Ledger,
    filter: &NotificationFilter,
    cursor: BlockNumber,
) -> Result<Option<(BlockNumber, Vec<NotificationEnvelope>)>, LedgerError> {
    let head = ledger.block_number().await?;
    if head < cursor {
        return Ok(None);
    }
    let window = NotificationFilter {
        kinds: filter.kinds.clone(),
        from_block: cursor,
        to_block: Some(head),
    };
    let mut logs = ledger.notifications(window).await?;
    logs.sort_by_key(NotificationEnvelope::position);
    Ok(Some((head, logs)))
}
