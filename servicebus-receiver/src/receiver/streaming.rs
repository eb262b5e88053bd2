//! Push-based receive that keeps credit flowing and dispatches to user handlers

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    task::{JoinError, JoinHandle, JoinSet},
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    constants::{DEFAULT_MAX_CONCURRENT_HANDLERS, DEFAULT_OPERATION_TIMEOUT},
    error::{BoxError, Error, InvalidOperationError, MessagingError, MessagingErrorCode},
    link::{IncomingMessage, ReceiverLinkHandle, Subscription, SubscriptionEvent},
    lock_renewer::RenewalErrorCallback,
    message::ReceivedMessage,
};

use super::{ReceiveOperation, ReceiverContext};

/// User callbacks of a streaming receiver
///
/// # Example
///
/// ```rust,ignore
/// struct Printer;
///
/// #[async_trait]
/// impl MessageHandlers for Printer {
///     async fn process_message(&self, message: &ReceivedMessage) -> Result<(), BoxError> {
///         println!("{:?}", message.body());
///         Ok(())
///     }
///
///     async fn process_error(&self, error: Error) -> Result<(), BoxError> {
///         eprintln!("{}", error);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandlers: Send + Sync {
    /// Called once per received message
    async fn process_message(&self, message: &ReceivedMessage) -> Result<(), BoxError>;

    /// Called with errors that are not tied to a single handler invocation
    async fn process_error(&self, error: Error) -> Result<(), BoxError>;

    /// Called once the link is attached, before any message is dispatched
    async fn process_open(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called once all handlers have finished, before the link is closed
    async fn process_close(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Options of [`MessageReceiver::subscribe`](super::MessageReceiver::subscribe)
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Complete messages whose handler succeeded and abandon those whose handler failed,
    /// unless the handler settled the message itself
    pub auto_complete: bool,

    /// Number of handler invocations that may run at the same time
    pub max_concurrent_handlers: u32,

    /// Overrides the receiver's maximum auto-renew duration
    pub max_auto_renew_duration: Option<Duration>,

    /// Shut down when no message arrives within this window
    pub max_wait_time_between_messages: Option<Duration>,

    /// Bound on the drain performed when the subscription is closed
    pub close_timeout: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            auto_complete: true,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            max_auto_renew_duration: None,
            max_wait_time_between_messages: None,
            close_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl SubscribeOptions {
    /// Sets `auto_complete`
    pub fn auto_complete(mut self, value: bool) -> Self {
        self.auto_complete = value;
        self
    }

    /// Sets `max_concurrent_handlers`
    pub fn max_concurrent_handlers(mut self, value: u32) -> Self {
        self.max_concurrent_handlers = value;
        self
    }

    /// Sets `max_auto_renew_duration`
    pub fn max_auto_renew_duration(mut self, value: Duration) -> Self {
        self.max_auto_renew_duration = Some(value);
        self
    }

    /// Sets `max_wait_time_between_messages`
    pub fn max_wait_time_between_messages(mut self, value: Duration) -> Self {
        self.max_wait_time_between_messages = Some(value);
        self
    }

    /// Sets `close_timeout`
    pub fn close_timeout(mut self, value: Duration) -> Self {
        self.close_timeout = value;
        self
    }
}

/// Lifecycle of a streaming receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    /// Not started
    Created,

    /// Attaching the link
    Opening,

    /// Dispatching messages
    Running,

    /// Shutting down, waiting for the drain and outstanding handlers
    Draining,

    /// Shut down
    Closed,
}

#[derive(Debug)]
struct Control {
    state: Mutex<StreamingState>,
    shutdown: CancellationToken,
    drain_timeout: Mutex<Duration>,
}

impl Control {
    fn set_state(&self, state: StreamingState) {
        let mut current = self.state.lock();
        trace!(from = ?*current, to = ?state, "Streaming state changed");
        *current = state;
    }

    fn request_shutdown(&self, drain_timeout: Duration) {
        if self.shutdown.is_cancelled() {
            return;
        }
        *self.drain_timeout.lock() = drain_timeout;
        self.shutdown.cancel();
    }
}

#[derive(Debug)]
enum Shutdown {
    Requested,
    Idle,
    Detached(MessagingError),
    LinkClosed,
}

/// Dispatches every received message to a [`MessageHandlers`] implementation
///
/// At most `max_concurrent_handlers` handlers run at a time. The operation keeps count of
/// the messages it owes a handler (granted credit, buffered and in-flight messages) and
/// only grants credit while that count is below `max_concurrent_handlers`, so messages
/// left over from an earlier receive are worked off before any new credit is issued.
pub(crate) struct StreamingReceiveOperation {
    handlers: Arc<dyn MessageHandlers>,
    options: SubscribeOptions,
}

impl fmt::Debug for StreamingReceiveOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingReceiveOperation")
            .field("options", &self.options)
            .finish()
    }
}

impl StreamingReceiveOperation {
    pub(crate) fn new(handlers: Arc<dyn MessageHandlers>, options: SubscribeOptions) -> Self {
        Self { handlers, options }
    }

    fn max_concurrent_handlers(&self) -> usize {
        self.options.max_concurrent_handlers as usize
    }

    #[instrument(skip_all, fields(address = %context.address))]
    async fn start(
        self,
        context: &Arc<ReceiverContext>,
        cancel: &CancellationToken,
    ) -> Result<StreamingReceiver, Error> {
        if self.options.max_concurrent_handlers == 0 {
            return Err(InvalidOperationError::InvalidArgument(
                "max_concurrent_handlers must be at least 1",
            )
            .into());
        }

        let control = Arc::new(Control {
            state: Mutex::new(StreamingState::Created),
            shutdown: CancellationToken::new(),
            drain_timeout: Mutex::new(self.options.close_timeout),
        });

        control.set_state(StreamingState::Opening);
        let opened = async {
            let link = context.ensure_open(cancel).await?;
            let subscription = link.subscribe()?;
            context.helper.activate()?;
            Ok::<_, Error>((link, subscription))
        };
        let (link, subscription) = match opened.await {
            Ok(opened) => opened,
            Err(error) => {
                control.set_state(StreamingState::Closed);
                return Err(error);
            }
        };

        if let Err(source) = self.handlers.process_open().await {
            report(self.handlers.as_ref(), Error::hook("process_open", source)).await;
        }
        if let Some(lock_renewer) = &context.lock_renewer {
            lock_renewer.set_error_callback(Some(renewal_error_callback(self.handlers.clone())));
        }

        let max = self.max_concurrent_handlers();
        let mut owed = subscription.prefetched() + link.credit() as usize;
        let credit = max.saturating_sub(owed);
        if credit > 0 {
            if let Err(error) = context.helper.add_credit(credit as u32).await {
                self.abort_start(context, &control).await;
                return Err(error);
            }
            owed += credit;
        }
        control.set_state(StreamingState::Running);
        info!(
            max_concurrent_handlers = max,
            prefetched = subscription.prefetched(),
            "Streaming receive started"
        );

        let close_timeout = self.options.close_timeout;
        let task = tokio::spawn(self.event_loop(
            context.clone(),
            link,
            subscription,
            owed,
            control.clone(),
        ));

        Ok(StreamingReceiver {
            control,
            task: Mutex::new(Some(task)),
            close_timeout,
        })
    }

    /// Undoes a start that failed after the open hook ran
    async fn abort_start(&self, context: &ReceiverContext, control: &Control) {
        context.helper.stop();
        if let Some(lock_renewer) = &context.lock_renewer {
            lock_renewer.set_error_callback(None);
        }
        if let Err(source) = self.handlers.process_close().await {
            report(self.handlers.as_ref(), Error::hook("process_close", source)).await;
        }
        control.set_state(StreamingState::Closed);
    }

    async fn event_loop(
        self,
        context: Arc<ReceiverContext>,
        link: Arc<ReceiverLinkHandle>,
        mut subscription: Subscription,
        mut owed: usize,
        control: Arc<Control>,
    ) {
        let max = self.max_concurrent_handlers();
        let mut running = JoinSet::new();
        let idle_window = self.options.max_wait_time_between_messages;
        let idle = sleep(idle_window.unwrap_or(Duration::ZERO));
        tokio::pin!(idle);

        let shutdown = loop {
            tokio::select! {
                _ = control.shutdown.cancelled() => break Shutdown::Requested,
                event = subscription.recv(), if running.len() < max => match event {
                    Some(SubscriptionEvent::Message(message)) => {
                        if let Some(window) = idle_window {
                            idle.as_mut().reset(Instant::now() + window);
                        }
                        self.dispatch(&mut running, &context, &link, message);
                    }
                    Some(SubscriptionEvent::Detached(error)) => break Shutdown::Detached(error),
                    None => break Shutdown::LinkClosed,
                },
                Some(result) = running.join_next(), if !running.is_empty() => {
                    log_join_error(result);
                    if let Some(window) = idle_window {
                        idle.as_mut().reset(Instant::now() + window);
                    }
                    owed = owed.saturating_sub(1);
                    if owed < max && self.replenish(&context).await {
                        owed += 1;
                    }
                }
                _ = &mut idle, if idle_window.is_some() && running.len() < max => {
                    break Shutdown::Idle
                }
            }
        };
        debug!(?shutdown, in_flight = running.len(), "Streaming receive shutting down");
        control.set_state(StreamingState::Draining);

        match shutdown {
            Shutdown::Detached(error) => {
                // The link is gone, so no credit operations
                report(self.handlers.as_ref(), Error::Messaging(error)).await;
                context.helper.stop();
            }
            Shutdown::Requested | Shutdown::Idle | Shutdown::LinkClosed => {
                let drain_timeout = *control.drain_timeout.lock();
                self.drain_while_dispatching(
                    &context,
                    &link,
                    &mut subscription,
                    &mut running,
                    drain_timeout,
                )
                .await;
            }
        }

        // Messages that were delivered before the drain completed
        while let Some(event) = subscription.try_recv() {
            if let SubscriptionEvent::Message(message) = event {
                self.wait_for_slot(&mut running).await;
                self.dispatch(&mut running, &context, &link, message);
            }
        }
        drop(subscription);

        while let Some(result) = running.join_next().await {
            log_join_error(result);
        }

        if let Err(source) = self.handlers.process_close().await {
            report(self.handlers.as_ref(), Error::hook("process_close", source)).await;
        }
        if let Err(error) = context.close().await {
            warn!(%error, "Failed to close the receiver");
        }
        control.set_state(StreamingState::Closed);
        info!("Streaming receive closed");
    }

    async fn drain_while_dispatching(
        &self,
        context: &Arc<ReceiverContext>,
        link: &Arc<ReceiverLinkHandle>,
        subscription: &mut Subscription,
        running: &mut JoinSet<()>,
        drain_timeout: Duration,
    ) {
        let max = self.max_concurrent_handlers();
        let drain = tokio::time::timeout(drain_timeout, context.helper.stop_and_drain());
        tokio::pin!(drain);

        loop {
            tokio::select! {
                result = &mut drain => {
                    match result {
                        Ok(Ok(())) => trace!("Drained before shutdown"),
                        Ok(Err(error)) => debug!(%error, "Drain before shutdown failed"),
                        Err(_) => warn!(?drain_timeout, "Drain before shutdown timed out"),
                    }
                    break;
                }
                event = subscription.recv(), if running.len() < max => match event {
                    Some(SubscriptionEvent::Message(message)) => {
                        self.dispatch(running, context, link, message);
                    }
                    Some(SubscriptionEvent::Detached(_)) | None => break,
                },
                Some(result) = running.join_next(), if !running.is_empty() => {
                    log_join_error(result);
                }
            }
        }
    }

    async fn wait_for_slot(&self, running: &mut JoinSet<()>) {
        while running.len() >= self.max_concurrent_handlers() {
            match running.join_next().await {
                Some(result) => log_join_error(result),
                None => break,
            }
        }
    }

    fn dispatch(
        &self,
        running: &mut JoinSet<()>,
        context: &ReceiverContext,
        link: &Arc<ReceiverLinkHandle>,
        incoming: IncomingMessage,
    ) {
        let max_auto_renew_duration = self
            .options
            .max_auto_renew_duration
            .unwrap_or(context.options.max_auto_renew_duration);
        let message = context.to_received(link, incoming, max_auto_renew_duration);
        trace!(delivery_id = message.delivery_id(), "Dispatching message");
        running.spawn(handle_message(
            self.handlers.clone(),
            message,
            self.options.auto_complete,
        ));
    }

    /// Grants one credit for a finished handler. Returns whether the credit was granted.
    async fn replenish(&self, context: &ReceiverContext) -> bool {
        if !context.helper.can_receive() {
            return false;
        }
        match context.helper.add_credit(1).await {
            Ok(()) => true,
            Err(error) => {
                debug!(%error, "Failed to replenish credit");
                false
            }
        }
    }
}

#[async_trait]
impl ReceiveOperation for StreamingReceiveOperation {
    type Output = StreamingReceiver;

    async fn run(
        self,
        context: &Arc<ReceiverContext>,
        cancel: &CancellationToken,
    ) -> Result<Self::Output, Error> {
        self.start(context, cancel).await
    }
}

async fn handle_message(
    handlers: Arc<dyn MessageHandlers>,
    message: ReceivedMessage,
    auto_complete: bool,
) {
    let delivery_id = message.delivery_id();
    let result = handlers.process_message(&message).await;

    if !message.is_peek_lock() {
        if let Err(error) = result {
            debug!(delivery_id, %error, "Message handler failed");
        }
        return;
    }

    match (result, auto_complete) {
        (Ok(()), true) => {
            if !message.settlement_started() {
                if let Err(error) = message.complete().await {
                    report(handlers.as_ref(), error).await;
                }
            }
        }
        (Err(error), true) => {
            debug!(delivery_id, %error, "Message handler failed, abandoning the message");
            if !message.settlement_started() {
                if let Err(error) = message.abandon(None).await {
                    report(handlers.as_ref(), error).await;
                }
            }
        }
        (Err(error), false) => {
            warn!(delivery_id, %error, "Message handler failed");
        }
        (Ok(()), false) => {}
    }

    // Nothing can settle the message after this point, let the lock expire
    message.release_lock_renewal();
}

async fn report(handlers: &dyn MessageHandlers, error: Error) {
    if let Err(hook_error) = handlers.process_error(error).await {
        warn!(error = %hook_error, "Error handler failed");
    }
}

fn renewal_error_callback(handlers: Arc<dyn MessageHandlers>) -> RenewalErrorCallback {
    Arc::new(move |error: Error| {
        let handlers = handlers.clone();
        tokio::spawn(async move { report(handlers.as_ref(), error).await });
    })
}

fn log_join_error(result: Result<(), JoinError>) {
    if let Err(join_error) = result {
        error!(%join_error, "Message handler task failed");
    }
}

/// Handle of a running streaming receive
///
/// Dropping the handle requests a graceful shutdown that proceeds in the background.
#[derive(Debug)]
pub struct StreamingReceiver {
    control: Arc<Control>,
    task: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl StreamingReceiver {
    /// Current state
    pub fn state(&self) -> StreamingState {
        *self.control.state.lock()
    }

    /// Whether the receive has shut down
    pub fn is_closed(&self) -> bool {
        self.state() == StreamingState::Closed
    }

    /// Stops receiving and waits for the shutdown to finish
    ///
    /// Calling this again after the first call returns immediately.
    pub async fn close(&self) -> Result<(), Error> {
        self.close_with_timeout(self.close_timeout).await
    }

    /// Same as [`close`](Self::close) with the drain bounded by `timeout`
    pub async fn close_with_timeout(&self, timeout: Duration) -> Result<(), Error> {
        let task = self.task.lock().take();
        let task = match task {
            Some(task) => task,
            None => return Ok(()),
        };

        self.control.request_shutdown(timeout);
        task.await.map_err(|join_error| {
            Error::Messaging(MessagingError::new(
                MessagingErrorCode::GeneralError,
                join_error.to_string(),
            ))
        })
    }
}

impl Drop for StreamingReceiver {
    fn drop(&mut self) {
        self.control.request_shutdown(self.close_timeout);
    }
}
