use std::{collections::VecDeque, sync::Arc};

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::MessagingError;

use super::{handle::Shared, IncomingMessage};

/// Events delivered to a [`Subscription`]
#[derive(Debug)]
pub enum SubscriptionEvent {
    /// A message was delivered
    Message(IncomingMessage),

    /// The link was detached
    Detached(MessagingError),
}

/// The registration of a receive operation on a link
///
/// Dropping the subscription unsubscribes. Messages still queued in a dropped
/// subscription are returned to the link's prefetch buffer and handed to the next
/// subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    prefetched: usize,
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
    shared: Arc<Shared>,
}

impl Subscription {
    pub(super) fn new(
        id: u64,
        prefetched: usize,
        rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            prefetched,
            rx,
            shared,
        }
    }

    /// Number of buffered messages that were queued when the subscription was created
    pub fn prefetched(&self) -> usize {
        self.prefetched
    }

    /// Waits for the next event. Returns `None` once the link has been closed locally.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.recv().await
    }

    /// Takes the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if state.subscriber.as_ref().map(|s| s.id) == Some(self.id) {
            state.subscriber = None;
        }

        self.rx.close();
        let mut leftovers = VecDeque::new();
        while let Ok(event) = self.rx.try_recv() {
            if let SubscriptionEvent::Message(message) = event {
                leftovers.push_back(message);
            }
        }
        if !leftovers.is_empty() {
            trace!(
                link = %self.shared.name,
                count = leftovers.len(),
                "Returning undelivered messages to the prefetch buffer"
            );
            leftovers.append(&mut state.prefetched);
            state.prefetched = leftovers;
        }
    }
}
