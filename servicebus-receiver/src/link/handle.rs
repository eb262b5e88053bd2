use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use fe2o3_amqp_types::{definitions::DeliveryNumber, messaging::DeliveryState};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, instrument, trace};

use crate::error::{translate, Error, InvalidOperationError, MessagingError};

use super::{
    subscription::{Subscription, SubscriptionEvent},
    IncomingMessage, LinkEvent, LinkFactory, LinkObserver, ReceiverLinkOptions, TransportLink,
};

#[derive(Debug)]
pub(super) struct Shared {
    pub(super) name: String,
    pub(super) state: Mutex<RelayState>,
}

#[derive(Debug, Default)]
pub(super) struct RelayState {
    pub(super) subscriber: Option<Subscriber>,

    /// Messages delivered while nobody was subscribed
    pub(super) prefetched: VecDeque<IncomingMessage>,

    drain_waiters: Vec<oneshot::Sender<Result<(), MessagingError>>>,
    detached: Option<MessagingError>,
    next_subscription_id: u64,
}

#[derive(Debug)]
pub(super) struct Subscriber {
    pub(super) id: u64,
    pub(super) tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl Shared {
    fn dispatch(&self, message: IncomingMessage) {
        let mut state = self.state.lock();
        let undelivered = match state.subscriber.as_ref() {
            Some(subscriber) => subscriber
                .tx
                .send(SubscriptionEvent::Message(message))
                .err()
                .map(|err| err.0),
            None => Some(SubscriptionEvent::Message(message)),
        };
        if let Some(SubscriptionEvent::Message(message)) = undelivered {
            trace!(link = %self.name, delivery_id = message.delivery_id, "prefetched");
            state.prefetched.push_back(message);
        }
    }

    fn on_drained(&self) {
        let waiters = std::mem::take(&mut self.state.lock().drain_waiters);
        trace!(link = %self.name, waiters = waiters.len(), "drained");
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Returns `false` if the link was already detached
    fn on_detached(&self, error: &MessagingError) -> bool {
        let mut state = self.state.lock();
        if state.detached.is_some() {
            return false;
        }
        state.detached = Some(error.clone());
        for waiter in state.drain_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        if let Some(subscriber) = &state.subscriber {
            let _ = subscriber.tx.send(SubscriptionEvent::Detached(error.clone()));
        }
        true
    }
}

/// Owns one transport receiving link
///
/// A relay task reads the transport's event channel in order. Messages go to the
/// active [`Subscription`], settlement and detach notifications go to the receiver that
/// owns this handle, and drain completions resolve pending [`drain`](Self::drain) calls.
#[derive(Debug)]
pub struct ReceiverLinkHandle {
    link: Arc<dyn TransportLink>,
    shared: Arc<Shared>,
    closed: AtomicBool,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl ReceiverLinkHandle {
    /// Negotiates the claim for the address and attaches a new receiving link
    #[instrument(skip_all, fields(address = %options.address, name = %options.name))]
    pub(crate) async fn open(
        factory: &dyn LinkFactory,
        options: ReceiverLinkOptions,
        observer: Weak<dyn LinkObserver>,
    ) -> Result<Self, Error> {
        factory
            .negotiate_claim(&options.address)
            .await
            .map_err(|error| Error::LinkOpen(translate(&error)))?;
        let (link, events) = factory
            .create_receiving_link(options)
            .await
            .map_err(|error| Error::LinkOpen(translate(&error)))?;

        let shared = Arc::new(Shared {
            name: link.name().to_string(),
            state: Mutex::new(RelayState::default()),
        });
        let relay = tokio::spawn(relay(events, shared.clone(), observer));
        debug!("Receiving link attached");

        Ok(Self {
            link,
            shared,
            closed: AtomicBool::new(false),
            relay: Mutex::new(Some(relay)),
        })
    }

    /// Link name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the link is attached and has not been closed or detached
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.shared.state.lock().detached.is_none()
            && self.link.is_open()
    }

    /// Error the link was detached with
    pub fn detach_error(&self) -> Option<MessagingError> {
        self.shared.state.lock().detached.clone()
    }

    /// Outstanding link credit
    pub fn credit(&self) -> u32 {
        self.link.credit()
    }

    /// Grants additional credit. Returns `false` without doing anything if the link is
    /// not open.
    pub fn add_credit(&self, credit: u32) -> bool {
        if !self.is_open() {
            return false;
        }
        self.link.flow(credit, false);
        true
    }

    /// Asks the sender to use up or discard the outstanding credit and waits until the
    /// transport reports that the link is drained
    pub async fn drain(&self) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::NotConnected("The receiving link is not open"));
        }
        let waiter = {
            let (tx, rx) = oneshot::channel();
            self.shared.state.lock().drain_waiters.push(tx);
            rx
        };
        trace!(link = %self.shared.name, credit = self.link.credit(), "draining");
        self.link.flow(0, true);

        match waiter.await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(Error::NotConnected(
                "The receiving link was closed while draining",
            )),
        }
    }

    /// Registers the single active receive operation on this link
    pub fn subscribe(&self) -> Result<Subscription, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotConnected("The receiving link has been closed"));
        }

        let mut state = self.shared.state.lock();
        if state.subscriber.is_some() {
            return Err(InvalidOperationError::AlreadyReceiving.into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let prefetched = state.prefetched.len();
        for message in state.prefetched.drain(..) {
            let _ = tx.send(SubscriptionEvent::Message(message));
        }
        if let Some(error) = &state.detached {
            let _ = tx.send(SubscriptionEvent::Detached(error.clone()));
        }

        let id = state.next_subscription_id;
        state.next_subscription_id += 1;
        state.subscriber = Some(Subscriber { id, tx });

        Ok(Subscription::new(id, prefetched, rx, self.shared.clone()))
    }

    /// Puts messages back at the front of the prefetch buffer, keeping their order
    pub fn requeue(&self, messages: Vec<IncomingMessage>) {
        if messages.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock();
        for message in messages.into_iter().rev() {
            state.prefetched.push_front(message);
        }
    }

    /// Sends a disposition for an unsettled delivery
    pub(crate) fn send_disposition(
        &self,
        delivery_id: DeliveryNumber,
        state: DeliveryState,
    ) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::NotConnected("The receiving link is not open"));
        }
        self.link
            .send_disposition(delivery_id, state)
            .map_err(|error| Error::Messaging(translate(&error)))
    }

    /// Detaches the link. Calling this more than once is a no-op.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
        {
            let mut state = self.shared.state.lock();
            // Ends the active subscription
            state.subscriber = None;
            state.drain_waiters.clear();
        }

        debug!(link = %self.shared.name, "Closing receiving link");
        if !self.link.is_open() {
            return Ok(());
        }
        self.link
            .close()
            .await
            .map_err(|error| Error::Messaging(translate(&error)))
    }
}

impl Drop for ReceiverLinkHandle {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.get_mut().take() {
            relay.abort();
        }
    }
}

async fn relay(
    mut events: mpsc::Receiver<LinkEvent>,
    shared: Arc<Shared>,
    observer: Weak<dyn LinkObserver>,
) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Message(message) => shared.dispatch(message),
            LinkEvent::Settled { delivery_id, state } => match observer.upgrade() {
                Some(observer) => observer.on_settled(delivery_id, state),
                None => trace!(delivery_id, "settlement for a dropped receiver"),
            },
            LinkEvent::Drained => shared.on_drained(),
            LinkEvent::Detached(error) => {
                let error = error
                    .map(|error| translate(&error))
                    .unwrap_or_else(MessagingError::link_detached);
                notify_detached(&shared, &observer, error);
            }
        }
    }

    // The transport dropped its end of the event channel
    notify_detached(&shared, &observer, MessagingError::link_detached());
}

fn notify_detached(shared: &Shared, observer: &Weak<dyn LinkObserver>, error: MessagingError) {
    if !shared.on_detached(&error) {
        return;
    }
    debug!(link = %shared.name, %error, "Receiving link detached");
    if let Some(observer) = observer.upgrade() {
        observer.on_detached(&shared.name, &error);
    }
}
