#![deny(missing_docs, missing_debug_implementations)]

//! Credit-based AMQP 1.0 message receiver core for Azure Service Bus
//!
//! This crate implements the receiving side of a Service Bus client on top of a caller
//! supplied transport. It manages link credit, settles messages and renews message locks,
//! and offers two ways of receiving:
//!
//! - [`MessageReceiver::receive_batch`] pulls a bounded batch within a deadline
//! - [`MessageReceiver::subscribe`] pushes every message to a [`MessageHandlers`]
//!   implementation with bounded concurrency
//!
//! The transport (connection, session, framing and claim negotiation) is plugged in through
//! [`LinkFactory`](link::LinkFactory) and [`TransportLink`](link::TransportLink).
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::{sync::Arc, time::Duration};
//! use servicebus_receiver::{MessageReceiver, ReceiveMode};
//!
//! let receiver = MessageReceiver::builder()
//!     .address("orders")
//!     .receive_mode(ReceiveMode::PeekLock)
//!     .build(Arc::new(factory))?;
//!
//! let messages = receiver.receive_batch(10, Duration::from_secs(5)).await?;
//! for message in &messages {
//!     message.complete().await?;
//! }
//! receiver.close().await?;
//! ```

pub mod constants;
pub mod error;
pub mod helper;
pub mod link;
pub mod lock_renewer;
pub mod message;
pub mod receiver;
pub mod retry;
pub mod settlement;

#[cfg(test)]
mod test_util;

pub use error::{Error, MessagingError, MessagingErrorCode};
pub use helper::ReceiverHelper;
pub use lock_renewer::{LockRenewal, LockRenewer};
pub use message::{DispositionType, ReceiveMode, ReceivedMessage, SettleOptions};
pub use receiver::{
    streaming::{MessageHandlers, StreamingReceiver, StreamingState, SubscribeOptions},
    MessageReceiver, MessageReceiverBuilder, ReceiveLinkState, ReceiverOptions,
};
pub use retry::{RetryMode, RetryOptions};
pub use settlement::DeliverySettlementTracker;
