//! Correlation of outgoing dispositions with their acknowledgements

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use fe2o3_amqp_types::{
    definitions::{self, DeliveryNumber, ErrorCondition, Fields},
    messaging::{Accepted, DeliveryState, Modified, Rejected},
    primitives::{Symbol, Value},
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace, warn};

use crate::{
    constants::{DEAD_LETTER_CONDITION, DEAD_LETTER_ERROR_DESCRIPTION, DEAD_LETTER_REASON},
    error::{translate, Error, InvalidOperationError, MessagingError},
    link::ReceiverLinkHandle,
    lock_renewer::LockRenewer,
    message::{DispositionType, SettleOptions},
};

#[derive(Debug)]
struct PendingSettlement {
    seq: u64,
    operation: DispositionType,
    responder: oneshot::Sender<Result<(), Error>>,
}

type PendingMap = Mutex<HashMap<DeliveryNumber, PendingSettlement>>;

/// Tracks dispositions that have been sent but not yet acknowledged by the service
///
/// Each delivery id has at most one pending settlement. The settlement resolves when the
/// service acknowledges the disposition, and fails with [`Error::SettlementTimeout`] if no
/// acknowledgement arrives in time.
#[derive(Debug, Clone)]
pub struct DeliverySettlementTracker {
    pending: Arc<PendingMap>,
    next_seq: Arc<AtomicU64>,
    timeout: Duration,
}

impl DeliverySettlementTracker {
    /// Creates a tracker that waits up to `timeout` for each acknowledgement
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    /// Number of settlements awaiting acknowledgement
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether no settlement is awaiting acknowledgement
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Whether a settlement for `delivery_id` is awaiting acknowledgement
    pub fn is_pending(&self, delivery_id: DeliveryNumber) -> bool {
        self.pending.lock().contains_key(&delivery_id)
    }

    /// Sends the disposition for `operation` on `link` and waits for the acknowledgement
    #[instrument(skip(self, link, options, cancel), fields(link = %link.name()))]
    pub async fn settle(
        &self,
        link: &ReceiverLinkHandle,
        delivery_id: DeliveryNumber,
        operation: DispositionType,
        options: SettleOptions,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let state = delivery_state(operation, options);

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (responder, acknowledged) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&delivery_id) {
                return Err(InvalidOperationError::SettlementPending(delivery_id).into());
            }
            pending.insert(
                delivery_id,
                PendingSettlement {
                    seq,
                    operation,
                    responder,
                },
            );
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            delivery_id,
            seq,
        };

        link.send_disposition(delivery_id, state)?;
        trace!("Disposition sent");

        tokio::select! {
            result = tokio::time::timeout(self.timeout, acknowledged) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(Error::NotConnected("The settlement was dropped")),
                Err(_) => {
                    warn!(timeout = ?self.timeout, "Settlement was not acknowledged in time");
                    Err(Error::SettlementTimeout {
                        delivery_id,
                        timeout: self.timeout,
                    })
                }
            },
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Resolves the pending settlement for `delivery_id`, if any
    pub(crate) fn on_settled(&self, delivery_id: DeliveryNumber, state: Option<DeliveryState>) {
        let Some(pending) = self.pending.lock().remove(&delivery_id) else {
            trace!(delivery_id, "Ignoring settlement of an untracked delivery");
            return;
        };

        let outcome = match state {
            Some(DeliveryState::Rejected(Rejected { error: Some(error) }))
                if !is_dead_letter_echo(pending.operation, &error) =>
            {
                Err(Error::Messaging(translate(&error)))
            }
            _ => Ok(()),
        };
        let _ = pending.responder.send(outcome);
    }

    /// Fails every pending settlement with `error`
    pub(crate) fn fail_all(&self, error: Error) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            trace!(count = drained.len(), %error, "Failing pending settlements");
        }
        for (_, pending) in drained {
            let _ = pending.responder.send(Err(error.clone()));
        }
    }
}

/// Removes the pending entry when the settle future completes or is dropped
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    delivery_id: DeliveryNumber,
    seq: u64,
}

impl<'a> Drop for PendingGuard<'a> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if pending
            .get(&self.delivery_id)
            .map(|p| p.seq == self.seq)
            .unwrap_or(false)
        {
            pending.remove(&self.delivery_id);
        }
    }
}

fn is_dead_letter_echo(operation: DispositionType, error: &definitions::Error) -> bool {
    operation == DispositionType::DeadLetter
        && matches!(&error.condition, ErrorCondition::Custom(symbol) if symbol.as_str() == DEAD_LETTER_CONDITION)
}

/// Maps a settlement operation onto the AMQP outcome sent in the disposition
pub(crate) fn delivery_state(operation: DispositionType, options: SettleOptions) -> DeliveryState {
    match operation {
        DispositionType::Complete => DeliveryState::Accepted(Accepted {}),
        DispositionType::Abandon => DeliveryState::Modified(Modified {
            delivery_failed: None,
            undeliverable_here: Some(false),
            message_annotations: options.properties_to_modify,
        }),
        DispositionType::Defer => DeliveryState::Modified(Modified {
            delivery_failed: None,
            undeliverable_here: Some(true),
            message_annotations: options.properties_to_modify,
        }),
        DispositionType::DeadLetter => {
            let mut info = options.properties_to_modify.unwrap_or_else(Fields::new);
            if let Some(reason) = options.dead_letter_reason {
                info.insert(Symbol::from(DEAD_LETTER_REASON), Value::String(reason));
            }
            if let Some(description) = options.dead_letter_error_description {
                info.insert(
                    Symbol::from(DEAD_LETTER_ERROR_DESCRIPTION),
                    Value::String(description),
                );
            }
            let error = definitions::Error::new(
                ErrorCondition::Custom(Symbol::from(DEAD_LETTER_CONDITION)),
                None,
                Some(info),
            );
            DeliveryState::Rejected(Rejected { error: Some(error) })
        }
    }
}

/// Settles messages on the link that delivered them
#[derive(Debug, Clone)]
pub(crate) struct Settler {
    link: Weak<ReceiverLinkHandle>,
    tracker: DeliverySettlementTracker,
    lock_renewer: Option<LockRenewer>,
}

impl Settler {
    pub(crate) fn new(
        link: Weak<ReceiverLinkHandle>,
        tracker: DeliverySettlementTracker,
        lock_renewer: Option<LockRenewer>,
    ) -> Self {
        Self {
            link,
            tracker,
            lock_renewer,
        }
    }

    pub(crate) async fn settle(
        &self,
        delivery_id: DeliveryNumber,
        operation: DispositionType,
        options: SettleOptions,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let link = self
            .link
            .upgrade()
            .filter(|link| link.is_open())
            .ok_or_else(MessagingError::lock_lost)?;
        self.tracker
            .settle(&link, delivery_id, operation, options, cancel)
            .await
    }

    pub(crate) fn untrack(&self, message_id: &str) {
        if let Some(lock_renewer) = &self.lock_renewer {
            lock_renewer.untrack(message_id);
        }
    }
}
