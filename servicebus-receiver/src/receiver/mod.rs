//! The message receiver core

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use fe2o3_amqp_types::{definitions::DeliveryNumber, messaging::DeliveryState, primitives::Timestamp};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    constants::{
        DEFAULT_DRAIN_TIMEOUT, DEFAULT_MAX_AUTO_RENEW_DURATION, DEFAULT_NEW_MESSAGE_WAIT_TIMEOUT,
        DEFAULT_OPERATION_TIMEOUT,
    },
    error::{Error, InvalidOperationError, MessagingError},
    helper::{LinkSlot, ReceiverHelper},
    link::{IncomingMessage, LinkFactory, LinkObserver, ReceiverLinkHandle, ReceiverLinkOptions},
    lock_renewer::{LockRenewal, LockRenewer},
    message::{DispositionType, ReceiveMode, ReceivedMessage, SettleOptions},
    retry::{retry, RetryOptions},
    settlement::{DeliverySettlementTracker, Settler},
};

pub mod batching;
pub mod streaming;

use batching::BatchingReceiveOperation;
use streaming::{MessageHandlers, StreamingReceiveOperation, StreamingReceiver, SubscribeOptions};

/// State of the link owned by a [`MessageReceiver`]
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveLinkState {
    /// No link is attached
    Closed,

    /// A link is being attached
    Connecting,

    /// The link is attached
    Open,

    /// The link was detached by the service
    Detached(MessagingError),
}

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Peek-lock or receive-and-delete
    pub receive_mode: ReceiveMode,

    /// How long to wait for the service to acknowledge a settlement
    pub settlement_timeout: Duration,

    /// Upper bound on a single drain
    pub drain_timeout: Duration,

    /// How long locks are renewed automatically. Zero disables auto-renewal.
    pub max_auto_renew_duration: Duration,

    /// Inactivity window that ends a peek-lock batch early once a message arrived.
    /// `None` disables it.
    pub new_message_wait_timeout: Option<Duration>,

    /// Retry policy for attaching the link
    pub retry: RetryOptions,

    /// Prefix of the link name. Defaults to the address.
    pub name: Option<String>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            receive_mode: ReceiveMode::default(),
            settlement_timeout: DEFAULT_OPERATION_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_auto_renew_duration: DEFAULT_MAX_AUTO_RENEW_DURATION,
            new_message_wait_timeout: Some(DEFAULT_NEW_MESSAGE_WAIT_TIMEOUT),
            retry: RetryOptions::default(),
            name: None,
        }
    }
}

/// Builder of a [`MessageReceiver`]
///
/// # Example
///
/// ```rust,ignore
/// let receiver = MessageReceiver::builder()
///     .address("orders")
///     .receive_mode(ReceiveMode::PeekLock)
///     .max_auto_renew_duration(Duration::from_secs(120))
///     .lock_renewal(management_client)
///     .build(link_factory)?;
/// ```
#[derive(Default)]
pub struct MessageReceiverBuilder {
    address: Option<String>,
    options: ReceiverOptions,
    lock_renewal: Option<Arc<dyn LockRenewal>>,
}

impl fmt::Debug for MessageReceiverBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReceiverBuilder")
            .field("address", &self.address)
            .field("options", &self.options)
            .field("lock_renewal", &self.lock_renewal.is_some())
            .finish()
    }
}

impl MessageReceiverBuilder {
    /// Address of the queue or subscription
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Receive mode
    pub fn receive_mode(mut self, mode: ReceiveMode) -> Self {
        self.options.receive_mode = mode;
        self
    }

    /// Settlement acknowledgement timeout
    pub fn settlement_timeout(mut self, timeout: Duration) -> Self {
        self.options.settlement_timeout = timeout;
        self
    }

    /// Drain timeout
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.options.drain_timeout = timeout;
        self
    }

    /// Maximum duration of automatic lock renewal
    pub fn max_auto_renew_duration(mut self, duration: Duration) -> Self {
        self.options.max_auto_renew_duration = duration;
        self
    }

    /// Inactivity window of a peek-lock batch
    pub fn new_message_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.new_message_wait_timeout = timeout;
        self
    }

    /// Retry policy for attaching the link
    pub fn retry_options(mut self, retry: RetryOptions) -> Self {
        self.options.retry = retry;
        self
    }

    /// Link name prefix
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    /// Replaces all options at once
    pub fn options(mut self, options: ReceiverOptions) -> Self {
        self.options = options;
        self
    }

    /// Management client used to renew locks
    pub fn lock_renewal(mut self, client: Arc<dyn LockRenewal>) -> Self {
        self.lock_renewal = Some(client);
        self
    }

    /// Builds the receiver. No link is attached until the first receive operation.
    pub fn build(self, factory: Arc<dyn LinkFactory>) -> Result<MessageReceiver, Error> {
        let address = self
            .address
            .ok_or(InvalidOperationError::InvalidArgument("address is required"))?;
        let options = self.options;

        let lock_renewer = match options.receive_mode {
            ReceiveMode::PeekLock => self.lock_renewal.map(LockRenewer::new),
            ReceiveMode::ReceiveAndDelete => None,
        };
        let link: LinkSlot = Arc::new(RwLock::new(None));
        let context = ReceiverContext {
            helper: ReceiverHelper::new(link.clone(), options.drain_timeout),
            settlements: DeliverySettlementTracker::new(options.settlement_timeout),
            address,
            factory,
            state: Mutex::new(ReceiveLinkState::Closed),
            link,
            open_lock: tokio::sync::Mutex::new(()),
            lock_renewer,
            close_initiated: AtomicBool::new(false),
            options,
        };

        Ok(MessageReceiver {
            context: Arc::new(context),
        })
    }
}

/// State shared by the receiver and its receive operations
pub(crate) struct ReceiverContext {
    pub(crate) address: String,
    pub(crate) options: ReceiverOptions,
    pub(crate) helper: ReceiverHelper,
    pub(crate) settlements: DeliverySettlementTracker,
    pub(crate) lock_renewer: Option<LockRenewer>,
    factory: Arc<dyn LinkFactory>,
    state: Mutex<ReceiveLinkState>,
    link: LinkSlot,
    open_lock: tokio::sync::Mutex<()>,
    close_initiated: AtomicBool,
}

impl fmt::Debug for ReceiverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverContext")
            .field("address", &self.address)
            .field("options", &self.options)
            .field("state", &*self.state.lock())
            .field("close_initiated", &self.is_closed())
            .finish()
    }
}

impl ReceiverContext {
    pub(crate) fn is_peek_lock(&self) -> bool {
        self.options.receive_mode == ReceiveMode::PeekLock
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_initiated.load(Ordering::Acquire)
    }

    pub(crate) fn current_link(&self) -> Option<Arc<ReceiverLinkHandle>> {
        self.link.read().clone()
    }

    fn link_options(&self) -> ReceiverLinkOptions {
        let prefix = self.options.name.as_deref().unwrap_or(&self.address);
        let mode = self.options.receive_mode;
        ReceiverLinkOptions {
            name: format!("{}-{}", prefix, Uuid::new_v4()),
            address: self.address.clone(),
            rcv_settle_mode: mode.rcv_settle_mode(),
            snd_settle_mode: mode.snd_settle_mode(),
            auto_accept: mode == ReceiveMode::ReceiveAndDelete,
            credit_window: 0,
        }
    }

    /// Returns the current link, attaching a new one if there is none or the current
    /// one is no longer open
    #[instrument(skip_all, fields(address = %self.address))]
    pub(crate) async fn ensure_open(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<Arc<ReceiverLinkHandle>, Error> {
        if self.is_closed() {
            return Err(InvalidOperationError::ReceiverClosed.into());
        }
        if let Some(link) = self.current_link().filter(|link| link.is_open()) {
            return Ok(link);
        }

        let _guard = tokio::select! {
            guard = self.open_lock.lock() => guard,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        if self.is_closed() {
            return Err(InvalidOperationError::ReceiverClosed.into());
        }
        if let Some(link) = self.current_link().filter(|link| link.is_open()) {
            return Ok(link);
        }

        let stale = self.link.write().take();
        if let Some(stale) = stale {
            debug!(link = stale.name(), "Discarding receiving link");
            if let Err(error) = stale.close().await {
                debug!(%error, "Failed to close the previous receiving link");
            }
        }

        *self.state.lock() = ReceiveLinkState::Connecting;
        let observer: Weak<dyn LinkObserver> = Arc::downgrade(self) as Weak<dyn LinkObserver>;
        let result = retry(
            || {
                ReceiverLinkHandle::open(
                    self.factory.as_ref(),
                    self.link_options(),
                    observer.clone(),
                )
            },
            &self.options.retry,
            cancel,
        )
        .await;

        match result {
            Ok(link) => {
                let link = Arc::new(link);
                if self.is_closed() {
                    let _ = link.close().await;
                    *self.state.lock() = ReceiveLinkState::Closed;
                    return Err(InvalidOperationError::ReceiverClosed.into());
                }
                *self.link.write() = Some(link.clone());
                *self.state.lock() = ReceiveLinkState::Open;
                Ok(link)
            }
            Err(error) => {
                warn!(%error, "Failed to attach the receiving link");
                *self.state.lock() = ReceiveLinkState::Closed;
                Err(error)
            }
        }
    }

    /// Wraps a delivered message, tracking its lock when auto-renewal is enabled
    pub(crate) fn to_received(
        &self,
        link: &Arc<ReceiverLinkHandle>,
        incoming: IncomingMessage,
        max_auto_renew_duration: Duration,
    ) -> ReceivedMessage {
        let settler = match self.options.receive_mode {
            ReceiveMode::PeekLock => Some(Settler::new(
                Arc::downgrade(link),
                self.settlements.clone(),
                self.lock_renewer.clone(),
            )),
            ReceiveMode::ReceiveAndDelete => None,
        };
        let message = ReceivedMessage::new(incoming, settler);
        if let Some(lock_renewer) = &self.lock_renewer {
            lock_renewer.track(&message, max_auto_renew_duration);
        }
        message
    }

    pub(crate) async fn close(&self) -> Result<(), Error> {
        self.close_initiated.store(true, Ordering::Release);
        self.helper.stop();
        if let Some(lock_renewer) = &self.lock_renewer {
            lock_renewer.clear();
            lock_renewer.set_error_callback(None);
        }
        self.settlements
            .fail_all(InvalidOperationError::ReceiverClosed.into());

        let link = self.link.write().take();
        *self.state.lock() = ReceiveLinkState::Closed;
        match link {
            Some(link) => link.close().await,
            None => Ok(()),
        }
    }
}

impl LinkObserver for ReceiverContext {
    fn on_settled(&self, delivery_id: DeliveryNumber, state: Option<DeliveryState>) {
        self.settlements.on_settled(delivery_id, state);
    }

    fn on_detached(&self, link_name: &str, error: &MessagingError) {
        let is_current = self
            .current_link()
            .map(|link| link.name() == link_name)
            .unwrap_or(false);
        if !is_current {
            return;
        }

        warn!(link = link_name, %error, "Receiving link detached");
        *self.state.lock() = ReceiveLinkState::Detached(error.clone());
        self.settlements.fail_all(Error::Messaging(error.clone()));
        if let Some(lock_renewer) = &self.lock_renewer {
            lock_renewer.clear();
        }
    }
}

impl Drop for ReceiverContext {
    fn drop(&mut self) {
        if let Some(lock_renewer) = &self.lock_renewer {
            lock_renewer.clear();
        }
        let link = self.link.write().take();
        if let (Some(link), Ok(runtime)) = (link, tokio::runtime::Handle::try_current()) {
            runtime.spawn(async move {
                let _ = link.close().await;
            });
        }
    }
}

/// A receive strategy run against the receiver's current link
#[async_trait]
pub(crate) trait ReceiveOperation: Send + Sized {
    type Output: Send;

    async fn run(
        self,
        context: &Arc<ReceiverContext>,
        cancel: &CancellationToken,
    ) -> Result<Self::Output, Error>;
}

/// Receives messages from a queue or subscription
///
/// # Example
///
/// ```rust,ignore
/// let receiver = MessageReceiver::builder()
///     .address("orders")
///     .build(link_factory)?;
///
/// let messages = receiver.receive_batch(10, Duration::from_secs(5)).await?;
/// for message in &messages {
///     receiver.settle(message, DispositionType::Complete, SettleOptions::default()).await?;
/// }
/// receiver.close().await?;
/// ```
#[derive(Debug)]
pub struct MessageReceiver {
    context: Arc<ReceiverContext>,
}

impl MessageReceiver {
    /// Creates a builder
    pub fn builder() -> MessageReceiverBuilder {
        MessageReceiverBuilder::default()
    }

    /// Address of the queue or subscription
    pub fn address(&self) -> &str {
        &self.context.address
    }

    /// Receive mode
    pub fn receive_mode(&self) -> ReceiveMode {
        self.context.options.receive_mode
    }

    /// Current state of the link
    pub fn link_state(&self) -> ReceiveLinkState {
        self.context.state.lock().clone()
    }

    /// Whether a link is attached and open
    pub fn is_open(&self) -> bool {
        self.context
            .current_link()
            .map(|link| link.is_open())
            .unwrap_or(false)
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.context.is_closed()
    }

    /// Credit and suspend/resume controller
    pub fn helper(&self) -> &ReceiverHelper {
        &self.context.helper
    }

    /// Lock renewer, present in peek-lock mode when a renewal client is configured
    pub fn lock_renewer(&self) -> Option<&LockRenewer> {
        self.context.lock_renewer.as_ref()
    }

    /// Receives up to `max_message_count` messages, waiting at most `max_wait`
    ///
    /// Resolves with an empty batch if nothing arrives in time.
    pub async fn receive_batch(
        &self,
        max_message_count: u32,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, Error> {
        let cancel = CancellationToken::new();
        self.receive_batch_with_cancellation(max_message_count, max_wait, &cancel)
            .await
    }

    /// Same as [`receive_batch`](Self::receive_batch), giving up with
    /// [`Error::Cancelled`] once `cancel` fires
    pub async fn receive_batch_with_cancellation(
        &self,
        max_message_count: u32,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, Error> {
        let idle_timeout = match self.context.is_peek_lock() {
            true => self.context.options.new_message_wait_timeout,
            false => None,
        };
        BatchingReceiveOperation::new(max_message_count, max_wait, idle_timeout)
            .run(&self.context, cancel)
            .await
    }

    /// Starts pushing messages to `handlers` until the returned receiver is closed
    pub async fn subscribe(
        &self,
        handlers: Arc<dyn MessageHandlers>,
        options: SubscribeOptions,
    ) -> Result<StreamingReceiver, Error> {
        let cancel = CancellationToken::new();
        self.subscribe_with_cancellation(handlers, options, &cancel)
            .await
    }

    /// Same as [`subscribe`](Self::subscribe), giving up with [`Error::Cancelled`] if
    /// `cancel` fires before the link is attached
    pub async fn subscribe_with_cancellation(
        &self,
        handlers: Arc<dyn MessageHandlers>,
        options: SubscribeOptions,
        cancel: &CancellationToken,
    ) -> Result<StreamingReceiver, Error> {
        StreamingReceiveOperation::new(handlers, options)
            .run(&self.context, cancel)
            .await
    }

    /// Settles `message` on the link that delivered it
    pub async fn settle(
        &self,
        message: &ReceivedMessage,
        operation: DispositionType,
        options: SettleOptions,
    ) -> Result<(), Error> {
        message.settle(operation, options).await
    }

    /// Same as [`settle`](Self::settle), giving up with [`Error::Cancelled`] once
    /// `cancel` fires
    pub async fn settle_with_cancellation(
        &self,
        message: &ReceivedMessage,
        operation: DispositionType,
        options: SettleOptions,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        message
            .settle_with_cancellation(operation, options, cancel)
            .await
    }

    /// Renews the lock of `message` and returns the new expiry
    pub async fn renew_lock(&self, message: &ReceivedMessage) -> Result<Timestamp, Error> {
        let cancel = CancellationToken::new();
        self.renew_lock_with_cancellation(message, &cancel).await
    }

    /// Same as [`renew_lock`](Self::renew_lock), giving up with [`Error::Cancelled`] once
    /// `cancel` fires
    pub async fn renew_lock_with_cancellation(
        &self,
        message: &ReceivedMessage,
        cancel: &CancellationToken,
    ) -> Result<Timestamp, Error> {
        let lock_token = *message
            .lock_token()
            .ok_or(InvalidOperationError::ReceiveAndDeleteMode)?;
        let lock_renewer = self
            .context
            .lock_renewer
            .as_ref()
            .ok_or(InvalidOperationError::LockRenewalUnavailable)?;

        let locked_until = tokio::select! {
            result = lock_renewer.client().renew_lock(lock_token) => result?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        message.lock_expiry().set(&locked_until);
        Ok(locked_until)
    }

    /// Stops issuing credit and drains the link
    pub async fn suspend(&self) -> Result<(), Error> {
        self.context.helper.suspend().await
    }

    /// Allows credit to be issued again
    pub fn resume(&self) {
        self.context.helper.resume()
    }

    /// Closes the receiver. Calling this more than once is a no-op.
    pub async fn close(&self) -> Result<(), Error> {
        self.context.close().await
    }
}
