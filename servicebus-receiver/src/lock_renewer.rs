//! Automatic renewal of message locks

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use fe2o3_amqp_types::primitives::Timestamp;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    constants::MIN_LOCK_RENEWAL_DELAY,
    error::Error,
    message::{LockExpiry, ReceivedMessage},
};

/// The management RPC that renews a message lock
#[async_trait]
pub trait LockRenewal: Send + Sync {
    /// Renews the lock identified by `lock_token` and returns the new expiry
    async fn renew_lock(&self, lock_token: Uuid) -> Result<Timestamp, Error>;
}

/// Callback invoked when renewing a lock fails
pub type RenewalErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;

/// Lifecycle of a renewal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    /// Tracked but no timer armed yet
    Pending,

    /// Waiting for the next renewal
    Scheduled,

    /// A renewal RPC is in flight
    Renewing,

    /// Untracked; no further renewal will be issued
    Cancelled,
}

#[derive(Debug)]
struct RenewalEntry {
    generation: u64,
    state: Arc<Mutex<RenewalState>>,
    cancel: CancellationToken,
}

impl RenewalEntry {
    fn cancel(&self) {
        *self.state.lock() = RenewalState::Cancelled;
        self.cancel.cancel();
    }
}

struct Inner {
    client: Arc<dyn LockRenewal>,
    entries: Mutex<HashMap<String, RenewalEntry>>,
    on_error: Mutex<Option<RenewalErrorCallback>>,
    next_generation: AtomicU64,
}

/// Keeps peek-locked messages alive until they are settled or a deadline passes
///
/// Each tracked message gets its own renewal chain. A renewal is scheduled once 80% of
/// the remaining lock time has elapsed. The chain stops when the message is untracked,
/// when the deadline passes, or when a renewal fails.
#[derive(Clone)]
pub struct LockRenewer {
    inner: Arc<Inner>,
}

impl fmt::Debug for LockRenewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRenewer")
            .field("entries", &self.inner.entries.lock().len())
            .finish()
    }
}

impl LockRenewer {
    /// Creates a renewer issuing renewals through `client`
    pub fn new(client: Arc<dyn LockRenewal>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                entries: Mutex::new(HashMap::new()),
                on_error: Mutex::new(None),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn client(&self) -> &Arc<dyn LockRenewal> {
        &self.inner.client
    }

    pub(crate) fn set_error_callback(&self, callback: Option<RenewalErrorCallback>) {
        *self.inner.on_error.lock() = callback;
    }

    #[cfg(test)]
    pub(crate) fn has_error_callback(&self) -> bool {
        self.inner.on_error.lock().is_some()
    }

    /// Starts renewing the lock of `message` for at most `max_auto_renew_duration`
    ///
    /// Does nothing if the message has no lock token or message id, or if the duration
    /// is zero. Tracking a message id that is already tracked replaces the old entry.
    pub fn track(&self, message: &ReceivedMessage, max_auto_renew_duration: Duration) {
        let (Some(message_id), Some(lock_token)) = (message.message_id(), message.lock_token())
        else {
            return;
        };
        if max_auto_renew_duration.is_zero() {
            return;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(Mutex::new(RenewalState::Pending));
        let cancel = CancellationToken::new();
        let previous = self.inner.entries.lock().insert(
            message_id.to_string(),
            RenewalEntry {
                generation,
                state: state.clone(),
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(message_id, "Replacing lock renewal of a message with the same id");
            previous.cancel();
        }

        let chain = RenewalChain {
            message_id: message_id.to_string(),
            lock_token: *lock_token,
            locked_until: message.lock_expiry().clone(),
            deadline: Instant::now() + max_auto_renew_duration,
            generation,
            state,
            cancel,
        };
        trace!(message_id, ?max_auto_renew_duration, "Tracking message lock");
        tokio::spawn(self.clone().run(chain));
    }

    /// Stops renewing the lock of `message_id`. Returns whether an entry was removed.
    pub fn untrack(&self, message_id: &str) -> bool {
        let entry = self.inner.entries.lock().remove(message_id);
        match entry {
            Some(entry) => {
                trace!(message_id, "Untracking message lock");
                entry.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops all renewals
    pub fn clear(&self) {
        let entries: Vec<_> = self.inner.entries.lock().drain().collect();
        if !entries.is_empty() {
            debug!(count = entries.len(), "Clearing lock renewals");
        }
        for (_, entry) in entries {
            entry.cancel();
        }
    }

    /// Whether the lock of `message_id` is being renewed
    pub fn is_tracking(&self, message_id: &str) -> bool {
        self.inner.entries.lock().contains_key(message_id)
    }

    /// Current state of the renewal of `message_id`
    pub fn state(&self, message_id: &str) -> Option<RenewalState> {
        self.inner
            .entries
            .lock()
            .get(message_id)
            .map(|entry| *entry.state.lock())
    }

    /// Number of tracked messages
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether no message is tracked
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    fn remove_entry(&self, message_id: &str, generation: u64) {
        let mut entries = self.inner.entries.lock();
        if entries
            .get(message_id)
            .map(|entry| entry.generation == generation)
            .unwrap_or(false)
        {
            entries.remove(message_id);
        }
    }

    fn report(&self, error: Error) {
        let callback = self.inner.on_error.lock().clone();
        match callback {
            Some(callback) => callback(error),
            None => debug!(%error, "No error callback registered for lock renewal"),
        }
    }

    async fn run(self, chain: RenewalChain) {
        let RenewalChain {
            message_id,
            lock_token,
            locked_until,
            deadline,
            generation,
            state,
            cancel,
        } = chain;

        loop {
            let remaining = lock_remaining(locked_until.get());
            let now = Instant::now();
            if now >= deadline || now + remaining >= deadline {
                trace!(message_id, "Lock renewal deadline reached");
                break;
            }

            let delay = calculate_renew_after(remaining);
            *state.lock() = RenewalState::Scheduled;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            {
                let mut state = state.lock();
                if *state == RenewalState::Cancelled {
                    return;
                }
                if Instant::now() >= deadline {
                    break;
                }
                *state = RenewalState::Renewing;
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.inner.client.renew_lock(lock_token) => result,
            };
            match result {
                Ok(renewed_until) => {
                    trace!(message_id, renewed_until = renewed_until.milliseconds(), "Lock renewed");
                    locked_until.set(&renewed_until);
                }
                Err(error) => {
                    warn!(message_id, %error, "Failed to renew message lock");
                    self.remove_entry(&message_id, generation);
                    self.report(error);
                    return;
                }
            }
        }

        self.remove_entry(&message_id, generation);
    }
}

struct RenewalChain {
    message_id: String,
    lock_token: Uuid,
    locked_until: LockExpiry,
    deadline: Instant,
    generation: u64,
    state: Arc<Mutex<RenewalState>>,
    cancel: CancellationToken,
}

/// Delay before renewing a lock that expires after `remaining`
///
/// Never shorter than [`MIN_LOCK_RENEWAL_DELAY`], so an expired lock or a skewed clock
/// does not turn the renewal chain into a busy loop.
pub fn calculate_renew_after(remaining: Duration) -> Duration {
    (remaining * 4 / 5).max(MIN_LOCK_RENEWAL_DELAY)
}

fn lock_remaining(locked_until: Option<Timestamp>) -> Duration {
    let Some(locked_until) = locked_until else {
        return Duration::ZERO;
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let remaining = locked_until.milliseconds().saturating_sub(now);
    Duration::from_millis(remaining.max(0) as u64)
}
