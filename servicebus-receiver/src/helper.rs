//! Credit management and suspend/resume for the current receiving link

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    error::{Error, InvalidOperationError, MessagingError, MessagingErrorCode},
    link::ReceiverLinkHandle,
};

/// Slot holding the link currently owned by a receiver
pub(crate) type LinkSlot = Arc<RwLock<Option<Arc<ReceiverLinkHandle>>>>;

/// Adds credit to and drains whatever link is current
///
/// The helper starts suspended and is activated by the first receive operation. A
/// [`suspend`](Self::suspend) pauses it until [`resume`](Self::resume) is called; receive
/// operations started in between fail instead of lifting the pause. Credit additions and
/// drains are serialized so a drain is never interleaved with a credit addition.
#[derive(Debug)]
pub struct ReceiverHelper {
    link: LinkSlot,
    active: AtomicBool,
    paused: AtomicBool,
    credit_lock: Arc<Mutex<()>>,
    drain_timeout: Duration,
}

impl ReceiverHelper {
    pub(crate) fn new(link: LinkSlot, drain_timeout: Duration) -> Self {
        Self {
            link,
            active: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            credit_lock: Arc::new(Mutex::new(())),
            drain_timeout,
        }
    }

    fn current_link(&self) -> Option<Arc<ReceiverLinkHandle>> {
        self.link.read().clone()
    }

    /// Grants `credit` on the current link
    ///
    /// Fails with [`InvalidOperationError::Suspended`] while suspended and with a
    /// retryable [`Error::NotConnected`] if there is no open link.
    pub async fn add_credit(&self, credit: u32) -> Result<(), Error> {
        let _guard = self.credit_lock.lock().await;

        if self.is_suspended() {
            return Err(InvalidOperationError::Suspended.into());
        }
        let link = self
            .current_link()
            .ok_or(Error::NotConnected("The receiving link is not created"))?;
        if !link.add_credit(credit) {
            return Err(Error::NotConnected("The receiving link is not open"));
        }
        trace!(link = link.name(), credit, "Added credit");
        Ok(())
    }

    /// Prevents further credit from being added until [`resume`](Self::resume) and
    /// drains the current link
    pub async fn suspend(&self) -> Result<(), Error> {
        self.paused.store(true, Ordering::Release);
        self.stop_and_drain().await
    }

    /// Refuses further credit without draining
    pub(crate) fn stop(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Refuses further credit and drains, without pausing later receive operations
    pub(crate) async fn stop_and_drain(&self) -> Result<(), Error> {
        self.stop();
        self.drain().await
    }

    /// Lifts a [`suspend`](Self::suspend) and allows credit to be added again. Does not
    /// add any credit.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.active.store(true, Ordering::Release);
    }

    /// Allows credit for a starting receive operation unless the user paused receiving
    pub(crate) fn activate(&self) -> Result<(), Error> {
        if self.paused.load(Ordering::Acquire) {
            return Err(InvalidOperationError::Suspended.into());
        }
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether credit additions are currently refused
    pub fn is_suspended(&self) -> bool {
        !self.active.load(Ordering::Acquire)
    }

    /// Whether the helper is active and the current link is open
    pub fn can_receive(&self) -> bool {
        !self.is_suspended()
            && self
                .current_link()
                .map(|link| link.is_open())
                .unwrap_or(false)
    }

    /// Drains the outstanding credit of the current link
    ///
    /// Returns immediately when there is no open link or no outstanding credit. The
    /// drain itself runs in a background task holding the credit lock, so a caller that
    /// stops waiting does not interrupt the drain.
    pub async fn drain(&self) -> Result<(), Error> {
        let guard = self.credit_lock.clone().lock_owned().await;

        let link = match self.current_link() {
            Some(link) if link.is_open() => link,
            _ => return Ok(()),
        };
        if link.credit() == 0 {
            trace!(link = link.name(), "Nothing to drain");
            return Ok(());
        }

        let drain_timeout = self.drain_timeout;
        let task = tokio::spawn(async move {
            let _guard = guard;
            debug!(link = link.name(), credit = link.credit(), "Draining");
            match tokio::time::timeout(drain_timeout, link.drain()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(link = link.name(), ?drain_timeout, "Drain timed out");
                    Err(Error::Messaging(MessagingError::new(
                        MessagingErrorCode::OperationTimeout,
                        "The receiving link did not report drained in time",
                    )))
                }
            }
        });

        match task.await {
            Ok(result) => result,
            Err(join_error) => Err(Error::Messaging(MessagingError::new(
                MessagingErrorCode::GeneralError,
                join_error.to_string(),
            ))),
        }
    }
}
