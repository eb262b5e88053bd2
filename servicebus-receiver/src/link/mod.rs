//! Receiving link abstraction
//!
//! The transport (connection, session, AMQP framing and claim negotiation) is provided
//! by the caller through [`LinkFactory`] and [`TransportLink`]. Events coming back from
//! the remote peer are delivered in order on an mpsc channel of [`LinkEvent`]s.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use fe2o3_amqp_types::{
    definitions::{self, DeliveryNumber, ReceiverSettleMode, SenderSettleMode},
    messaging::DeliveryState,
    primitives::Timestamp,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::MessagingError;

mod handle;
mod subscription;

pub use handle::ReceiverLinkHandle;
pub use subscription::{Subscription, SubscriptionEvent};

/// A message as delivered by the transport
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Transport assigned delivery id
    pub delivery_id: DeliveryNumber,

    /// Application message id
    pub message_id: Option<String>,

    /// Lock token from the delivery tag
    pub lock_token: Option<Uuid>,

    /// `x-opt-locked-until` message annotation
    pub locked_until: Option<Timestamp>,

    /// Encoded message body
    pub body: Bytes,
}

/// Events emitted by a transport link
#[derive(Debug)]
pub enum LinkEvent {
    /// A message was delivered
    Message(IncomingMessage),

    /// The remote peer settled a delivery
    Settled {
        /// Delivery that was settled
        delivery_id: DeliveryNumber,

        /// Remote delivery state
        state: Option<DeliveryState>,
    },

    /// A drain request completed and the outstanding credit is zero
    Drained,

    /// The link was detached by the remote peer or the session ended
    Detached(Option<definitions::Error>),
}

/// Parameters used to attach a receiving link
#[derive(Debug, Clone)]
pub struct ReceiverLinkOptions {
    /// Unique link name
    pub name: String,

    /// Source address
    pub address: String,

    /// Settle mode requested for the receiver
    pub rcv_settle_mode: ReceiverSettleMode,

    /// Settle mode requested for the sender
    pub snd_settle_mode: SenderSettleMode,

    /// Whether the transport accepts every delivery on arrival
    pub auto_accept: bool,

    /// Credit window maintained by the transport itself. Always zero here since
    /// credit is managed explicitly.
    pub credit_window: u32,
}

/// An attached receiving link provided by the transport
#[async_trait]
pub trait TransportLink: fmt::Debug + Send + Sync {
    /// Link name
    fn name(&self) -> &str;

    /// Whether the link is attached
    fn is_open(&self) -> bool;

    /// Outstanding link credit
    fn credit(&self) -> u32;

    /// Issues a flow that grants `credit` additional credit. When `drain` is set the
    /// sender is asked to use up or discard all outstanding credit.
    fn flow(&self, credit: u32, drain: bool);

    /// Sends a disposition for an unsettled delivery
    fn send_disposition(
        &self,
        delivery_id: DeliveryNumber,
        state: DeliveryState,
    ) -> Result<(), definitions::Error>;

    /// Detaches the link
    async fn close(&self) -> Result<(), definitions::Error>;
}

/// Creates receiving links on an existing connection
#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Acquires the authorization claim for `address`
    async fn negotiate_claim(&self, address: &str) -> Result<(), definitions::Error>;

    /// Attaches a new receiving link
    async fn create_receiving_link(
        &self,
        options: ReceiverLinkOptions,
    ) -> Result<(Arc<dyn TransportLink>, mpsc::Receiver<LinkEvent>), definitions::Error>;
}

/// Observes link level events that are not bound to a receive operation
pub(crate) trait LinkObserver: Send + Sync {
    fn on_settled(&self, delivery_id: DeliveryNumber, state: Option<DeliveryState>);

    fn on_detached(&self, link_name: &str, error: &MessagingError);
}
