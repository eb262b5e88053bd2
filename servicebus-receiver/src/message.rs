//! Received messages and settlement options

use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use fe2o3_amqp_types::{
    definitions::{DeliveryNumber, Fields, ReceiverSettleMode, SenderSettleMode},
    primitives::Timestamp,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{Error, InvalidOperationError},
    link::IncomingMessage,
    settlement::Settler,
};

/// How the service hands out messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Messages are locked and must be settled explicitly
    #[default]
    PeekLock,

    /// Messages are removed from the entity as soon as they are delivered
    ReceiveAndDelete,
}

impl ReceiveMode {
    pub(crate) fn rcv_settle_mode(&self) -> ReceiverSettleMode {
        match self {
            ReceiveMode::PeekLock => ReceiverSettleMode::Second,
            ReceiveMode::ReceiveAndDelete => ReceiverSettleMode::First,
        }
    }

    pub(crate) fn snd_settle_mode(&self) -> SenderSettleMode {
        match self {
            ReceiveMode::PeekLock => SenderSettleMode::Unsettled,
            ReceiveMode::ReceiveAndDelete => SenderSettleMode::Settled,
        }
    }
}

/// Settlement operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispositionType {
    /// Remove the message from the entity
    Complete,

    /// Release the lock and make the message available again
    Abandon,

    /// Set the message aside so it can only be received by sequence number
    Defer,

    /// Move the message to the dead-letter sub-queue
    DeadLetter,
}

impl fmt::Display for DispositionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispositionType::Complete => "complete",
            DispositionType::Abandon => "abandon",
            DispositionType::Defer => "defer",
            DispositionType::DeadLetter => "deadletter",
        };
        f.write_str(s)
    }
}

impl FromStr for DispositionType {
    type Err = InvalidOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "complete" => Ok(DispositionType::Complete),
            "abandon" => Ok(DispositionType::Abandon),
            "defer" => Ok(DispositionType::Defer),
            "deadletter" | "dead-letter" => Ok(DispositionType::DeadLetter),
            _ => Err(InvalidOperationError::UnknownDisposition(s.to_string())),
        }
    }
}

/// Options attached to a settlement
#[derive(Debug, Clone, Default)]
pub struct SettleOptions {
    /// Application properties to modify on abandon, defer or dead-letter
    pub properties_to_modify: Option<Fields>,

    /// Reason recorded when dead-lettering
    pub dead_letter_reason: Option<String>,

    /// Description recorded when dead-lettering
    pub dead_letter_error_description: Option<String>,
}

impl SettleOptions {
    /// Sets the properties to modify
    pub fn properties_to_modify(mut self, properties: Fields) -> Self {
        self.properties_to_modify = Some(properties);
        self
    }

    /// Sets the dead-letter reason
    pub fn dead_letter_reason(mut self, reason: impl Into<String>) -> Self {
        self.dead_letter_reason = Some(reason.into());
        self
    }

    /// Sets the dead-letter description
    pub fn dead_letter_error_description(mut self, description: impl Into<String>) -> Self {
        self.dead_letter_error_description = Some(description.into());
        self
    }
}

const NO_LOCK: i64 = i64::MIN;

/// Shared cell holding the lock expiry of a message
///
/// Cloned into the lock renewer so that renewals are visible on the message
#[derive(Debug, Clone)]
pub(crate) struct LockExpiry(Arc<AtomicI64>);

impl LockExpiry {
    pub(crate) fn new(locked_until: Option<Timestamp>) -> Self {
        let value = locked_until.map(|t| t.milliseconds()).unwrap_or(NO_LOCK);
        Self(Arc::new(AtomicI64::new(value)))
    }

    pub(crate) fn get(&self) -> Option<Timestamp> {
        match self.0.load(Ordering::Acquire) {
            NO_LOCK => None,
            millis => Some(Timestamp::from_milliseconds(millis)),
        }
    }

    pub(crate) fn set(&self, locked_until: &Timestamp) {
        self.0.store(locked_until.milliseconds(), Ordering::Release)
    }
}

const UNSETTLED: u8 = 0;
const SETTLING: u8 = 1;
const SETTLED: u8 = 2;

/// A message handed out by the receiver
///
/// In peek-lock mode the message carries a lock and must be settled with one of
/// [`complete`](ReceivedMessage::complete), [`abandon`](ReceivedMessage::abandon),
/// [`defer`](ReceivedMessage::defer) or [`dead_letter`](ReceivedMessage::dead_letter).
///
/// # Example
///
/// ```rust,ignore
/// let messages = receiver.receive_batch(10, Duration::from_secs(5)).await?;
/// for message in &messages {
///     println!("{:?}", message.body());
///     message.complete().await?;
/// }
/// ```
pub struct ReceivedMessage {
    delivery_id: DeliveryNumber,
    message_id: Option<String>,
    lock_token: Option<Uuid>,
    locked_until: LockExpiry,
    body: Bytes,
    state: AtomicU8,
    renewal_released: AtomicBool,
    settler: Option<Settler>,
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("delivery_id", &self.delivery_id)
            .field("message_id", &self.message_id)
            .field("lock_token", &self.lock_token)
            .field("locked_until", &self.locked_until.get())
            .field("body", &self.body)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl ReceivedMessage {
    /// `settler` is `None` in receive-and-delete mode, in which case the message is
    /// pre-settled and the lock information from the transport is dropped.
    pub(crate) fn new(incoming: IncomingMessage, settler: Option<Settler>) -> Self {
        let (lock_token, locked_until, state) = match settler {
            Some(_) => (incoming.lock_token, incoming.locked_until, UNSETTLED),
            None => (None, None, SETTLED),
        };
        Self {
            delivery_id: incoming.delivery_id,
            message_id: incoming.message_id,
            lock_token,
            locked_until: LockExpiry::new(locked_until),
            body: incoming.body,
            state: AtomicU8::new(state),
            renewal_released: AtomicBool::new(false),
            settler,
        }
    }

    /// Delivery id assigned by the transport
    pub fn delivery_id(&self) -> DeliveryNumber {
        self.delivery_id
    }

    /// Application message id
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Lock token, present only in peek-lock mode
    pub fn lock_token(&self) -> Option<&Uuid> {
        self.lock_token.as_ref()
    }

    /// Time at which the lock expires, present only in peek-lock mode
    pub fn locked_until(&self) -> Option<Timestamp> {
        self.locked_until.get()
    }

    /// Message payload
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Whether a settlement of this message has been acknowledged
    pub fn is_settled(&self) -> bool {
        self.state.load(Ordering::Acquire) == SETTLED
    }

    pub(crate) fn is_peek_lock(&self) -> bool {
        self.settler.is_some()
    }

    pub(crate) fn settlement_started(&self) -> bool {
        self.state.load(Ordering::Acquire) != UNSETTLED
    }

    pub(crate) fn lock_expiry(&self) -> &LockExpiry {
        &self.locked_until
    }

    /// Completes the message
    pub async fn complete(&self) -> Result<(), Error> {
        self.settle(DispositionType::Complete, SettleOptions::default())
            .await
    }

    /// Abandons the message, optionally modifying its application properties
    pub async fn abandon(&self, properties_to_modify: Option<Fields>) -> Result<(), Error> {
        let options = SettleOptions {
            properties_to_modify,
            ..Default::default()
        };
        self.settle(DispositionType::Abandon, options).await
    }

    /// Defers the message, optionally modifying its application properties
    pub async fn defer(&self, properties_to_modify: Option<Fields>) -> Result<(), Error> {
        let options = SettleOptions {
            properties_to_modify,
            ..Default::default()
        };
        self.settle(DispositionType::Defer, options).await
    }

    /// Moves the message to the dead-letter sub-queue
    pub async fn dead_letter(&self, options: SettleOptions) -> Result<(), Error> {
        self.settle(DispositionType::DeadLetter, options).await
    }

    /// Settles the message with the given operation
    pub async fn settle(
        &self,
        operation: DispositionType,
        options: SettleOptions,
    ) -> Result<(), Error> {
        let cancel = CancellationToken::new();
        self.settle_with_cancellation(operation, options, &cancel)
            .await
    }

    /// Settles the message, giving up with [`Error::Cancelled`] once `cancel` fires
    pub async fn settle_with_cancellation(
        &self,
        operation: DispositionType,
        options: SettleOptions,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let settler = self
            .settler
            .as_ref()
            .ok_or(InvalidOperationError::ReceiveAndDeleteMode)?;

        let mut guard = SettlingGuard::acquire(&self.state, self.delivery_id)?;
        self.release_lock_renewal();

        let result = settler
            .settle(self.delivery_id, operation, options, cancel)
            .await;
        if result.is_ok() {
            guard.succeed();
        }
        result
    }

    /// Stops automatic lock renewal for this message. Only the first call has an effect.
    pub(crate) fn release_lock_renewal(&self) {
        if self.renewal_released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let (Some(settler), Some(message_id)) = (&self.settler, &self.message_id) {
            settler.untrack(message_id);
        }
    }
}

/// Moves a message into the settling state and back out of it
///
/// If the settlement does not succeed (including when the future is dropped) the
/// message returns to the unsettled state.
struct SettlingGuard<'a> {
    state: &'a AtomicU8,
    settled: bool,
}

impl<'a> SettlingGuard<'a> {
    fn acquire(state: &'a AtomicU8, delivery_id: DeliveryNumber) -> Result<Self, Error> {
        match state.compare_exchange(UNSETTLED, SETTLING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(Self {
                state,
                settled: false,
            }),
            Err(SETTLING) => Err(InvalidOperationError::SettlementPending(delivery_id).into()),
            Err(_) => Err(InvalidOperationError::AlreadySettled.into()),
        }
    }

    fn succeed(&mut self) {
        self.settled = true;
    }
}

impl<'a> Drop for SettlingGuard<'a> {
    fn drop(&mut self) {
        let next = if self.settled { SETTLED } else { UNSETTLED };
        self.state.store(next, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bytes::Bytes;
    use fe2o3_amqp_types::primitives::Timestamp;
    use uuid::Uuid;

    use crate::{
        error::{Error, InvalidOperationError},
        link::IncomingMessage,
    };

    use super::{DispositionType, ReceivedMessage};

    fn incoming() -> IncomingMessage {
        IncomingMessage {
            delivery_id: 7,
            message_id: Some("m-1".to_string()),
            lock_token: Some(Uuid::new_v4()),
            locked_until: Some(Timestamp::from_milliseconds(1_000)),
            body: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn disposition_type_from_str() {
        assert_eq!(
            DispositionType::from_str("complete").unwrap(),
            DispositionType::Complete
        );
        assert_eq!(
            DispositionType::from_str("deadletter").unwrap(),
            DispositionType::DeadLetter
        );
        let err = DispositionType::from_str("finish").unwrap_err();
        assert_eq!(
            err,
            InvalidOperationError::UnknownDisposition("finish".to_string())
        );
    }

    #[test]
    fn receive_and_delete_messages_carry_no_lock() {
        let message = ReceivedMessage::new(incoming(), None);
        assert!(message.lock_token().is_none());
        assert!(message.locked_until().is_none());
        assert_eq!(message.body().as_ref(), b"hello");
        assert!(message.is_settled());
    }

    #[tokio::test]
    async fn settling_receive_and_delete_message_is_invalid() {
        let message = ReceivedMessage::new(incoming(), None);
        let result = message.complete().await;
        assert!(matches!(
            result,
            Err(Error::InvalidOperation(
                InvalidOperationError::ReceiveAndDeleteMode
            ))
        ));
    }
}
