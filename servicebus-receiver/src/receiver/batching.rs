//! Pull-based receive of a bounded batch

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    constants::MAX_PEEK_LOCK_BATCH_SIZE,
    error::{Error, InvalidOperationError, MessagingError},
    link::{IncomingMessage, ReceiverLinkHandle, SubscriptionEvent},
    message::ReceivedMessage,
};

use super::{ReceiveOperation, ReceiverContext};

/// Why the collection loop stopped
#[derive(Debug)]
enum Completion {
    Full,
    MaxWaitElapsed,
    Idle,
    Detached(MessagingError),
    LinkClosed,
    Cancelled,
}

/// Collects up to a maximum number of messages within a deadline
///
/// Exactly `max_message_count` credit is granted up front (less whatever is already
/// buffered). Once the batch is complete the remaining credit is drained so that no
/// message arrives for a batch nobody waits on anymore.
#[derive(Debug)]
pub(crate) struct BatchingReceiveOperation {
    max_message_count: u32,
    max_wait: Duration,
    idle_timeout: Option<Duration>,
}

impl BatchingReceiveOperation {
    pub(crate) fn new(
        max_message_count: u32,
        max_wait: Duration,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            max_message_count,
            max_wait,
            idle_timeout,
        }
    }

    #[instrument(skip_all, fields(
        address = %context.address,
        max_message_count = self.max_message_count,
        max_wait = ?self.max_wait,
    ))]
    async fn receive(
        self,
        context: &Arc<ReceiverContext>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, Error> {
        if self.max_message_count == 0 {
            return Err(InvalidOperationError::InvalidArgument(
                "max_message_count must be at least 1",
            )
            .into());
        }
        let max_message_count = match context.is_peek_lock() {
            true => self.max_message_count.min(MAX_PEEK_LOCK_BATCH_SIZE),
            false => self.max_message_count,
        } as usize;

        let link = context.ensure_open(cancel).await?;
        if !link.is_open() {
            return Err(Error::NotConnected("The receiving link is not open"));
        }
        context.helper.activate()?;
        let mut subscription = link.subscribe()?;

        let credit = max_message_count.saturating_sub(subscription.prefetched());
        if credit > 0 {
            context.helper.add_credit(credit as u32).await?;
        }

        let mut messages: Vec<IncomingMessage> = Vec::with_capacity(max_message_count);
        let deadline = sleep(self.max_wait);
        tokio::pin!(deadline);
        let idle = sleep(Duration::ZERO);
        tokio::pin!(idle);
        let mut idle_armed = false;

        let completion = loop {
            if messages.len() >= max_message_count {
                break Completion::Full;
            }

            tokio::select! {
                _ = cancel.cancelled() => break Completion::Cancelled,
                event = subscription.recv() => match event {
                    Some(SubscriptionEvent::Message(message)) => {
                        trace!(delivery_id = message.delivery_id, "Received message");
                        messages.push(message);
                        if let Some(idle_timeout) = self.idle_timeout {
                            idle.as_mut().reset(Instant::now() + idle_timeout);
                            idle_armed = true;
                        }
                    }
                    Some(SubscriptionEvent::Detached(error)) => break Completion::Detached(error),
                    None => break Completion::LinkClosed,
                },
                _ = &mut deadline => break Completion::MaxWaitElapsed,
                _ = &mut idle, if idle_armed => break Completion::Idle,
            }
        };
        debug!(?completion, received = messages.len(), "Batch receive completed");

        // Messages still queued move back to the prefetch buffer
        drop(subscription);

        match completion {
            Completion::Cancelled => {
                link.requeue(messages);
                let background = context.clone();
                tokio::spawn(async move {
                    if let Err(error) = background.helper.drain().await {
                        debug!(%error, "Background drain after cancellation failed");
                    }
                });
                Err(Error::Cancelled)
            }
            Completion::Detached(error) => self.on_detached(context, &link, messages, error),
            Completion::LinkClosed => match context.is_peek_lock() || messages.is_empty() {
                true => Err(InvalidOperationError::ReceiverClosed.into()),
                false => Ok(self.wrap(context, &link, messages)),
            },
            Completion::Full | Completion::MaxWaitElapsed | Completion::Idle => {
                if link.is_open() && link.credit() > 0 {
                    let drained = tokio::select! {
                        result = context.helper.drain() => result,
                        _ = cancel.cancelled() => {
                            link.requeue(messages);
                            return Err(Error::Cancelled);
                        }
                    };
                    if let Err(error) = drained {
                        match link.detach_error() {
                            Some(detach) => {
                                return self.on_detached(context, &link, messages, detach)
                            }
                            None => warn!(%error, "Failed to drain the receiving link"),
                        }
                    }
                }
                Ok(self.wrap(context, &link, messages))
            }
        }
    }

    /// Receive-and-delete messages were already removed from the entity, so they are
    /// returned rather than lost
    fn on_detached(
        &self,
        context: &ReceiverContext,
        link: &Arc<ReceiverLinkHandle>,
        messages: Vec<IncomingMessage>,
        error: MessagingError,
    ) -> Result<Vec<ReceivedMessage>, Error> {
        if !context.is_peek_lock() && !messages.is_empty() {
            warn!(
                %error,
                received = messages.len(),
                "Link detached during receive, returning the messages already removed"
            );
            return Ok(self.wrap(context, link, messages));
        }
        Err(Error::Messaging(error))
    }

    fn wrap(
        &self,
        context: &ReceiverContext,
        link: &Arc<ReceiverLinkHandle>,
        messages: Vec<IncomingMessage>,
    ) -> Vec<ReceivedMessage> {
        let max_auto_renew_duration = context.options.max_auto_renew_duration;
        messages
            .into_iter()
            .map(|message| context.to_received(link, message, max_auto_renew_duration))
            .collect()
    }
}

#[async_trait]
impl ReceiveOperation for BatchingReceiveOperation {
    type Output = Vec<ReceivedMessage>;

    async fn run(
        self,
        context: &Arc<ReceiverContext>,
        cancel: &CancellationToken,
    ) -> Result<Self::Output, Error> {
        self.receive(context, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use fe2o3_amqp_types::definitions::{self, LinkError};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::{
        error::{Error, InvalidOperationError, MessagingErrorCode},
        message::ReceiveMode,
        receiver::MessageReceiver,
        test_util::{incoming_batch, MockFactory, MockLockRenewal},
    };

    fn receiver(factory: &Arc<MockFactory>, mode: ReceiveMode) -> MessageReceiver {
        MessageReceiver::builder()
            .address("orders")
            .receive_mode(mode)
            .new_message_wait_timeout(None)
            .build(factory.clone())
            .unwrap()
    }

    fn detach_forced() -> definitions::Error {
        definitions::Error::new(LinkError::DetachForced, None, None)
    }

    #[tokio::test(start_paused = true)]
    async fn returns_partial_batch_after_max_wait() {
        let factory = Arc::new(MockFactory::new().with_backlog(incoming_batch(3)));
        let receiver = receiver(&factory, ReceiveMode::PeekLock);

        let start = Instant::now();
        let messages = receiver
            .receive_batch(5, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(messages.len(), 3);
        assert!(start.elapsed() >= Duration::from_secs(1));

        let link = factory.link(0);
        assert_eq!(link.flows(), vec![(5, false), (0, true)]);
        assert_eq!(link.credit_now(), 0);
        let ids: Vec<_> = messages.iter().map(|m| m.delivery_id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_message_count() {
        let factory = Arc::new(MockFactory::new().with_backlog(incoming_batch(10)));
        let receiver = receiver(&factory, ReceiveMode::PeekLock);

        let start = Instant::now();
        let messages = receiver
            .receive_batch(5, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(messages.len(), 5);
        assert!(start.elapsed() < Duration::from_secs(10));

        let link = factory.link(0);
        // All granted credit was used, there is nothing to drain
        assert_eq!(link.flows(), vec![(5, false)]);
        assert_eq!(link.backlog_len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_when_nothing_arrives() {
        let factory = Arc::new(MockFactory::new());
        let receiver = receiver(&factory, ReceiveMode::PeekLock);

        let messages = receiver
            .receive_batch(4, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(messages.is_empty());
        assert_eq!(factory.link(0).flows(), vec![(4, false), (0, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_receiver_refuses_batches_until_resumed() {
        let factory = Arc::new(MockFactory::new().with_backlog(incoming_batch(1)));
        let receiver = receiver(&factory, ReceiveMode::PeekLock);

        receiver.suspend().await.unwrap();
        let result = receiver.receive_batch(1, Duration::from_millis(10)).await;
        assert!(matches!(
            result,
            Err(Error::InvalidOperation(InvalidOperationError::Suspended))
        ));
        assert!(receiver.helper().is_suspended());
        assert!(factory.link(0).flows().is_empty());

        receiver.resume();
        let messages = receiver
            .receive_batch(1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(factory.link(0).flows(), vec![(1, false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_message_count_is_rejected() {
        let factory = Arc::new(MockFactory::new());
        let receiver = receiver(&factory, ReceiveMode::PeekLock);

        let result = receiver.receive_batch(0, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(Error::InvalidOperation(
                InvalidOperationError::InvalidArgument(_)
            ))
        ));
        assert_eq!(factory.links_created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn peek_lock_batch_size_is_capped() {
        let factory = Arc::new(MockFactory::new());
        let receiver = receiver(&factory, ReceiveMode::PeekLock);

        receiver
            .receive_batch(5000, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(factory.link(0).flows()[0], (2047, false));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_ends_peek_lock_batch_early() {
        let factory = Arc::new(MockFactory::new().with_backlog(incoming_batch(2)));
        let receiver = MessageReceiver::builder()
            .address("orders")
            .new_message_wait_timeout(Some(Duration::from_millis(200)))
            .build(factory.clone())
            .unwrap();

        let start = Instant::now();
        let messages = receiver
            .receive_batch(10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn detach_in_receive_and_delete_returns_received_messages() {
        let factory = Arc::new(MockFactory::new().with_backlog(incoming_batch(2)));
        let receiver = receiver(&factory, ReceiveMode::ReceiveAndDelete);

        let detacher = factory.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            detacher.link(0).detach(Some(detach_forced()));
        });

        let messages = receiver
            .receive_batch(5, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.is_settled()));
        // No drain on a detached link
        assert_eq!(factory.link(0).flows(), vec![(5, false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_in_peek_lock_fails() {
        let factory = Arc::new(MockFactory::new().with_backlog(incoming_batch(2)));
        let receiver = receiver(&factory, ReceiveMode::PeekLock);

        let detacher = factory.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            detacher.link(0).detach(Some(detach_forced()));
        });

        let result = receiver.receive_batch(5, Duration::from_secs(1)).await;
        match result {
            Err(Error::Messaging(error)) => {
                assert_eq!(error.code, MessagingErrorCode::DetachForced);
                assert!(error.retryable);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn detach_without_messages_fails_in_receive_and_delete() {
        let factory = Arc::new(MockFactory::new());
        let receiver = receiver(&factory, ReceiveMode::ReceiveAndDelete);

        let detacher = factory.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            detacher.link(0).detach(Some(detach_forced()));
        });

        let result = receiver.receive_batch(5, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Messaging(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_still_returns_messages() {
        let factory = Arc::new(MockFactory::new().with_backlog(incoming_batch(1)));
        let receiver = MessageReceiver::builder()
            .address("orders")
            .new_message_wait_timeout(None)
            .drain_timeout(Duration::from_secs(2))
            .build(factory.clone())
            .unwrap();

        let first = receiver.receive_batch(1, Duration::from_millis(10));
        let messages = first.await.unwrap();
        assert_eq!(messages.len(), 1);

        factory.link(0).set_auto_drain(false);
        factory.link(0).enqueue(incoming_batch(1));
        let messages = receiver
            .receive_batch(3, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_batches_are_rejected() {
        let factory = Arc::new(MockFactory::new());
        let receiver = Arc::new(receiver(&factory, ReceiveMode::PeekLock));

        let first = {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.receive_batch(1, Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = receiver.receive_batch(1, Duration::from_secs(1)).await;
        assert!(matches!(
            second,
            Err(Error::InvalidOperation(
                InvalidOperationError::AlreadyReceiving
            ))
        ));
        assert!(first.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_keeps_messages_for_the_next_batch() {
        let factory = Arc::new(MockFactory::new().with_backlog(incoming_batch(2)));
        let receiver = receiver(&factory, ReceiveMode::PeekLock);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let result = receiver
            .receive_batch_with_cancellation(5, Duration::from_secs(5), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));

        // Let the background drain run
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(factory.link(0).credit_now(), 0);

        let messages = receiver
            .receive_batch(5, Duration::from_millis(100))
            .await
            .unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.delivery_id()).collect();
        assert_eq!(ids, vec![0, 1]);
        // The buffered messages reduce the credit of the next batch
        assert_eq!(factory.link(0).flows()[2], (3, false));
    }

    #[tokio::test(start_paused = true)]
    async fn peek_lock_messages_are_tracked_for_renewal() {
        let factory = Arc::new(MockFactory::new().with_backlog(incoming_batch(2)));
        let client = Arc::new(MockLockRenewal::new(Duration::from_secs(30)));
        let receiver = MessageReceiver::builder()
            .address("orders")
            .new_message_wait_timeout(None)
            .lock_renewal(client)
            .build(factory.clone())
            .unwrap();

        let messages = receiver
            .receive_batch(2, Duration::from_secs(1))
            .await
            .unwrap();
        let renewer = receiver.lock_renewer().unwrap();
        assert_eq!(renewer.len(), 2);

        messages[0].complete().await.unwrap();
        assert!(!renewer.is_tracking("m-0"));
        assert!(renewer.is_tracking("m-1"));
    }
}
