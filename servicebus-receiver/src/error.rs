//! Error types and the transport error translator

use std::{fmt, sync::Arc, time::Duration};

use fe2o3_amqp_types::definitions::{
    self, AmqpError, ConnectionError, DeliveryNumber, ErrorCondition, LinkError,
};

use crate::constants::{
    ARGUMENT_ERROR_CONDITION, ENTITY_DISABLED_CONDITION, ENTITY_NOT_FOUND_CONDITION,
    MESSAGE_LOCK_LOST_CONDITION, QUOTA_EXCEEDED_CONDITION, SERVER_BUSY_CONDITION,
    SESSION_LOCK_LOST_CONDITION, TIMEOUT_CONDITION,
};

/// Boxed error returned by user supplied handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Closed set of failure kinds produced by [`translate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessagingErrorCode {
    /// Unclassified failure
    GeneralError,

    /// The service is temporarily unavailable
    ServiceUnavailable,

    /// The service is too busy
    ServerBusy,

    /// The operation did not complete in time
    OperationTimeout,

    /// The message lock was lost
    MessageLockLost,

    /// The session lock was lost
    SessionLockLost,

    /// The queue, topic or subscription does not exist
    MessagingEntityNotFound,

    /// The queue, topic or subscription is disabled
    MessagingEntityDisabled,

    /// Authorization failed
    Unauthorized,

    /// A quota on the entity was exceeded
    QuotaExceeded,

    /// The message exceeds the maximum size
    MessageSizeExceeded,

    /// The service forcibly closed the connection
    ConnectionForced,

    /// The service forcibly detached the link
    DetachForced,

    /// Another link with the same name stole this link
    LinkStolen,

    /// The service encountered an internal error
    InternalError,

    /// The request used a feature the service does not implement
    NotImplemented,

    /// The request was not valid in the current state
    IllegalState,

    /// The request carried an invalid argument
    InvalidArgument,
}

impl MessagingErrorCode {
    /// Whether an operation failing with this code may succeed if retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable
                | Self::ServerBusy
                | Self::OperationTimeout
                | Self::ConnectionForced
                | Self::DetachForced
                | Self::InternalError
        )
    }
}

/// A transport failure translated into a Service Bus failure kind
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code:?}: {description}")]
pub struct MessagingError {
    /// Kind of failure
    pub code: MessagingErrorCode,

    /// Human readable description
    pub description: String,

    /// Condition reported by the remote peer, if any
    pub condition: Option<ErrorCondition>,

    /// Whether the failed operation may be retried
    pub retryable: bool,
}

impl MessagingError {
    /// Creates a new error with the retryable flag derived from the code
    pub fn new(code: MessagingErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            condition: None,
            retryable: code.is_retryable(),
        }
    }

    pub(crate) fn link_detached() -> Self {
        Self::new(
            MessagingErrorCode::DetachForced,
            "The receiving link was detached without an error",
        )
    }

    pub(crate) fn lock_lost() -> Self {
        Self::new(
            MessagingErrorCode::MessageLockLost,
            "The link the message was received on is no longer open",
        )
    }
}

impl From<definitions::Error> for MessagingError {
    fn from(error: definitions::Error) -> Self {
        translate(&error)
    }
}

/// Translates a remote AMQP error into a [`MessagingError`]
pub fn translate(error: &definitions::Error) -> MessagingError {
    use MessagingErrorCode::*;

    let code = match &error.condition {
        ErrorCondition::AmqpError(condition) => match condition {
            AmqpError::InternalError => InternalError,
            AmqpError::NotFound | AmqpError::ResourceDeleted => MessagingEntityNotFound,
            AmqpError::UnauthorizedAccess => Unauthorized,
            AmqpError::ResourceLimitExceeded => QuotaExceeded,
            AmqpError::NotImplemented => NotImplemented,
            AmqpError::IllegalState | AmqpError::NotAllowed => IllegalState,
            AmqpError::InvalidField | AmqpError::DecodeError => InvalidArgument,
            AmqpError::ResourceLocked => MessageLockLost,
            _ => GeneralError,
        },
        ErrorCondition::ConnectionError(ConnectionError::ConnectionForced) => ConnectionForced,
        ErrorCondition::ConnectionError(_) => GeneralError,
        ErrorCondition::LinkError(condition) => match condition {
            LinkError::DetachForced => DetachForced,
            LinkError::Stolen => LinkStolen,
            LinkError::MessageSizeExceeded => MessageSizeExceeded,
            _ => GeneralError,
        },
        ErrorCondition::Custom(symbol) => match symbol.as_str() {
            TIMEOUT_CONDITION => OperationTimeout,
            SERVER_BUSY_CONDITION => ServerBusy,
            MESSAGE_LOCK_LOST_CONDITION => MessageLockLost,
            SESSION_LOCK_LOST_CONDITION => SessionLockLost,
            ENTITY_DISABLED_CONDITION => MessagingEntityDisabled,
            ENTITY_NOT_FOUND_CONDITION => MessagingEntityNotFound,
            QUOTA_EXCEEDED_CONDITION => QuotaExceeded,
            ARGUMENT_ERROR_CONDITION => InvalidArgument,
            _ => GeneralError,
        },
        _ => GeneralError,
    };

    let description = error
        .description
        .clone()
        .unwrap_or_else(|| format!("{:?}", error.condition));

    MessagingError {
        code,
        description,
        condition: Some(error.condition.clone()),
        retryable: code.is_retryable(),
    }
}

/// Misuse of the receiver API
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidOperationError {
    /// The settlement operation name is not recognized
    #[error("'{0}' is not a valid settlement operation")]
    UnknownDisposition(String),

    /// The message has already been settled
    #[error("The message has already been settled")]
    AlreadySettled,

    /// A settlement for the delivery is still awaiting acknowledgement
    #[error("A settlement for delivery {0} is already in flight")]
    SettlementPending(DeliveryNumber),

    /// Credit was requested while the receiver is suspended
    #[error("Can't add credits to the receiver since it is suspended")]
    Suspended,

    /// Another receive operation holds the link
    #[error("The receiver is already receiving messages")]
    AlreadyReceiving,

    /// The receiver has been closed
    #[error("The receiver has been closed")]
    ReceiverClosed,

    /// The operation requires peek-lock mode
    #[error("The operation is not supported in receive-and-delete mode")]
    ReceiveAndDeleteMode,

    /// No lock renewal client was configured
    #[error("Lock renewal is not configured for this receiver")]
    LockRenewalUnavailable,

    /// An argument was out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Errors produced by the receiver
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The receiving link could not be attached
    #[error("Failed to open the receiving link: {0}")]
    LinkOpen(#[source] MessagingError),

    /// A translated transport failure
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    /// No acknowledgement arrived for a disposition before the timeout
    #[error(
        "Operation to settle the message has timed out. The disposition of the message \
         may or may not be successful (delivery {delivery_id}, after {timeout:?})"
    )]
    SettlementTimeout {
        /// Delivery that was being settled
        delivery_id: DeliveryNumber,

        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The API was used incorrectly
    #[error(transparent)]
    InvalidOperation(#[from] InvalidOperationError),

    /// There is no open link to operate on
    #[error("The receiver is not connected: {0}")]
    NotConnected(&'static str),

    /// The operation was cancelled by the caller
    #[error("The operation was cancelled")]
    Cancelled,

    /// A lifecycle hook failed
    #[error("The {hook} hook failed: {source}")]
    Hook {
        /// Name of the failing hook
        hook: &'static str,

        /// Error returned by the hook
        source: HookError,
    },
}

impl Error {
    /// Whether the failed operation may succeed if retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::LinkOpen(error) | Error::Messaging(error) => error.retryable,
            Error::NotConnected(_) => true,
            Error::SettlementTimeout { .. }
            | Error::InvalidOperation(_)
            | Error::Cancelled
            | Error::Hook { .. } => false,
        }
    }

    /// Failure kind, when the error originated from the service or transport
    pub fn code(&self) -> Option<MessagingErrorCode> {
        match self {
            Error::LinkOpen(error) | Error::Messaging(error) => Some(error.code),
            Error::SettlementTimeout { .. } => Some(MessagingErrorCode::ServiceUnavailable),
            _ => None,
        }
    }

    pub(crate) fn hook(hook: &'static str, source: BoxError) -> Self {
        Self::Hook {
            hook,
            source: HookError(Arc::from(source)),
        }
    }
}

/// A cloneable wrapper around a handler hook failure
#[derive(Clone)]
pub struct HookError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl HookError {
    /// The underlying error
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.0.as_ref()
    }
}

impl fmt::Debug for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for HookError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}
