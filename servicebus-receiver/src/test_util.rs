//! In-memory transport used by the unit tests

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use fe2o3_amqp_types::{
    definitions::{self, AmqpError, DeliveryNumber, LinkError},
    messaging::{DeliveryState, Rejected},
    primitives::Timestamp,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::{Error, MessagingError},
    link::{
        IncomingMessage, LinkEvent, LinkFactory, LinkObserver, ReceiverLinkHandle,
        ReceiverLinkOptions, TransportLink,
    },
    lock_renewer::LockRenewal,
    message::ReceivedMessage,
    settlement::{DeliverySettlementTracker, Settler},
};

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn incoming(
    delivery_id: DeliveryNumber,
    message_id: &str,
    lock_duration: Duration,
) -> IncomingMessage {
    IncomingMessage {
        delivery_id,
        message_id: Some(message_id.to_string()),
        lock_token: Some(Uuid::new_v4()),
        locked_until: Some(Timestamp::from_milliseconds(
            now_millis() + lock_duration.as_millis() as i64,
        )),
        body: Bytes::from(format!("body-{}", delivery_id)),
    }
}

pub(crate) fn incoming_batch(count: u32) -> Vec<IncomingMessage> {
    (0..count)
        .map(|i| incoming(i, &format!("m-{}", i), Duration::from_secs(30)))
        .collect()
}

/// A peek-locked message whose link is already gone
pub(crate) fn peek_lock_message(
    delivery_id: DeliveryNumber,
    message_id: &str,
    lock_duration: Duration,
) -> ReceivedMessage {
    let settler = Settler::new(
        Weak::new(),
        DeliverySettlementTracker::new(Duration::from_secs(60)),
        None,
    );
    ReceivedMessage::new(
        incoming(delivery_id, message_id, lock_duration),
        Some(settler),
    )
}

pub(crate) fn receive_and_delete_message(
    delivery_id: DeliveryNumber,
    message_id: &str,
) -> ReceivedMessage {
    ReceivedMessage::new(
        incoming(delivery_id, message_id, Duration::from_secs(30)),
        None,
    )
}

#[derive(Debug)]
struct MockLinkState {
    credit: u32,
    backlog: VecDeque<IncomingMessage>,
    flows: Vec<(u32, bool)>,
    dispositions: Vec<(DeliveryNumber, DeliveryState)>,
    settle_error: Option<definitions::Error>,
}

/// A transport link backed by an in-memory backlog
///
/// Messages in the backlog are delivered as soon as credit is available. Drains and
/// dispositions are acknowledged immediately unless disabled.
#[derive(Debug)]
pub(crate) struct MockLink {
    name: String,
    open: AtomicBool,
    auto_drain: AtomicBool,
    auto_settle: AtomicBool,
    closed: AtomicUsize,
    state: Mutex<MockLinkState>,
    events: mpsc::Sender<LinkEvent>,
}

impl MockLink {
    fn new(name: String, events: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            name,
            open: AtomicBool::new(true),
            auto_drain: AtomicBool::new(true),
            auto_settle: AtomicBool::new(true),
            closed: AtomicUsize::new(0),
            state: Mutex::new(MockLinkState {
                credit: 0,
                backlog: VecDeque::new(),
                flows: Vec::new(),
                dispositions: Vec::new(),
                settle_error: None,
            }),
            events,
        }
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.try_send(event);
    }

    fn deliver_backlog(&self, state: &mut MockLinkState) {
        while state.credit > 0 {
            let Some(message) = state.backlog.pop_front() else {
                break;
            };
            state.credit -= 1;
            self.emit(LinkEvent::Message(message));
        }
    }

    pub(crate) fn enqueue(&self, messages: impl IntoIterator<Item = IncomingMessage>) {
        let mut state = self.state.lock();
        state.backlog.extend(messages);
        self.deliver_backlog(&mut state);
    }

    pub(crate) fn set_auto_drain(&self, value: bool) {
        self.auto_drain.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_auto_settle(&self, value: bool) {
        self.auto_settle.store(value, Ordering::SeqCst);
    }

    pub(crate) fn reject_settlements_with(&self, error: definitions::Error) {
        self.state.lock().settle_error = Some(error);
    }

    pub(crate) fn complete_drain(&self) {
        self.state.lock().credit = 0;
        self.emit(LinkEvent::Drained);
    }

    pub(crate) fn detach(&self, error: Option<definitions::Error>) {
        self.open.store(false, Ordering::SeqCst);
        self.emit(LinkEvent::Detached(error));
    }

    pub(crate) fn credit_now(&self) -> u32 {
        self.state.lock().credit
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    pub(crate) fn flows(&self) -> Vec<(u32, bool)> {
        self.state.lock().flows.clone()
    }

    pub(crate) fn dispositions(&self) -> Vec<(DeliveryNumber, DeliveryState)> {
        self.state.lock().dispositions.clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportLink for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn credit(&self) -> u32 {
        self.state.lock().credit
    }

    fn flow(&self, credit: u32, drain: bool) {
        let mut state = self.state.lock();
        state.flows.push((credit, drain));
        state.credit += credit;
        self.deliver_backlog(&mut state);
        if drain && self.auto_drain.load(Ordering::SeqCst) {
            state.credit = 0;
            self.emit(LinkEvent::Drained);
        }
    }

    fn send_disposition(
        &self,
        delivery_id: DeliveryNumber,
        state: DeliveryState,
    ) -> Result<(), definitions::Error> {
        let mut link_state = self.state.lock();
        link_state.dispositions.push((delivery_id, state.clone()));
        if self.auto_settle.load(Ordering::SeqCst) {
            let remote = match link_state.settle_error.clone() {
                Some(error) => DeliveryState::Rejected(Rejected { error: Some(error) }),
                None => state,
            };
            self.emit(LinkEvent::Settled {
                delivery_id,
                state: Some(remote),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), definitions::Error> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`MockLink`]s
#[derive(Debug, Default)]
pub(crate) struct MockFactory {
    links: Mutex<Vec<Arc<MockLink>>>,
    options: Mutex<Vec<ReceiverLinkOptions>>,
    claims: Mutex<Vec<String>>,
    backlog: Mutex<Vec<IncomingMessage>>,
    transient_failures: AtomicU32,
    unauthorized: AtomicBool,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Messages delivered by the next link created
    pub(crate) fn with_backlog(self, messages: Vec<IncomingMessage>) -> Self {
        *self.backlog.lock() = messages;
        self
    }

    pub(crate) fn fail_next_opens(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn reject_claims(&self) {
        self.unauthorized.store(true, Ordering::SeqCst);
    }

    pub(crate) fn link(&self, index: usize) -> Arc<MockLink> {
        self.links.lock()[index].clone()
    }

    pub(crate) fn last_link(&self) -> Option<Arc<MockLink>> {
        self.links.lock().last().cloned()
    }

    pub(crate) fn links_created(&self) -> usize {
        self.links.lock().len()
    }

    pub(crate) fn link_options(&self, index: usize) -> ReceiverLinkOptions {
        self.options.lock()[index].clone()
    }

    pub(crate) fn claims(&self) -> Vec<String> {
        self.claims.lock().clone()
    }
}

#[async_trait]
impl LinkFactory for MockFactory {
    async fn negotiate_claim(&self, address: &str) -> Result<(), definitions::Error> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(definitions::Error::new(
                AmqpError::UnauthorizedAccess,
                Some("claim rejected".to_string()),
                None,
            ));
        }
        self.claims.lock().push(address.to_string());
        Ok(())
    }

    async fn create_receiving_link(
        &self,
        options: ReceiverLinkOptions,
    ) -> Result<(Arc<dyn TransportLink>, mpsc::Receiver<LinkEvent>), definitions::Error> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(definitions::Error::new(
                LinkError::DetachForced,
                Some("attach refused".to_string()),
                None,
            ));
        }

        let (tx, rx) = mpsc::channel(1024);
        let link = Arc::new(MockLink::new(options.name.clone(), tx));
        link.enqueue(std::mem::take(&mut *self.backlog.lock()));
        self.links.lock().push(link.clone());
        self.options.lock().push(options);
        let link: Arc<dyn TransportLink> = link;
        Ok((link, rx))
    }
}

/// Records what a link reports outside of receive operations
#[derive(Debug, Default)]
pub(crate) struct TestObserver {
    tracker: Mutex<Option<DeliverySettlementTracker>>,
    detached: Mutex<Vec<MessagingError>>,
}

impl TestObserver {
    pub(crate) fn forward_settlements(&self, tracker: DeliverySettlementTracker) {
        *self.tracker.lock() = Some(tracker);
    }

    pub(crate) fn detached(&self) -> Vec<MessagingError> {
        self.detached.lock().clone()
    }
}

impl LinkObserver for TestObserver {
    fn on_settled(&self, delivery_id: DeliveryNumber, state: Option<DeliveryState>) {
        if let Some(tracker) = self.tracker.lock().as_ref() {
            tracker.on_settled(delivery_id, state);
        }
    }

    fn on_detached(&self, _link_name: &str, error: &MessagingError) {
        self.detached.lock().push(error.clone());
    }
}

pub(crate) fn link_options(name: &str) -> ReceiverLinkOptions {
    use crate::message::ReceiveMode;

    ReceiverLinkOptions {
        name: name.to_string(),
        address: "queue".to_string(),
        rcv_settle_mode: ReceiveMode::PeekLock.rcv_settle_mode(),
        snd_settle_mode: ReceiveMode::PeekLock.snd_settle_mode(),
        auto_accept: false,
        credit_window: 0,
    }
}

/// Opens a link on `factory` observed by a fresh [`TestObserver`]
pub(crate) async fn open_link(
    factory: &MockFactory,
) -> (ReceiverLinkHandle, Arc<MockLink>, Arc<TestObserver>) {
    let observer = Arc::new(TestObserver::default());
    let weak: Weak<dyn LinkObserver> = Arc::downgrade(&observer) as Weak<dyn LinkObserver>;
    let handle = ReceiverLinkHandle::open(factory, link_options("queue-test"), weak)
        .await
        .expect("mock link opens");
    let link = factory.last_link().expect("link was created");
    (handle, link, observer)
}

/// Lock renewal RPC returning `now + lock_duration`
#[derive(Debug)]
pub(crate) struct MockLockRenewal {
    lock_duration: Duration,
    clock_offset: Mutex<Duration>,
    calls: AtomicUsize,
    failure: Mutex<Option<Error>>,
}

impl MockLockRenewal {
    pub(crate) fn new(lock_duration: Duration) -> Self {
        Self {
            lock_duration,
            clock_offset: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_with(&self, error: Error) {
        *self.failure.lock() = Some(error);
    }

    pub(crate) fn advance_clock(&self, by: Duration) {
        *self.clock_offset.lock() += by;
    }
}

#[async_trait]
impl LockRenewal for MockLockRenewal {
    async fn renew_lock(&self, _lock_token: Uuid) -> Result<Timestamp, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let offset = *self.clock_offset.lock();
        Ok(Timestamp::from_milliseconds(
            now_millis() + (offset + self.lock_duration).as_millis() as i64,
        ))
    }
}
