//! Constants shared by the receiver components

use std::time::Duration;

/// Default timeout applied to settlement acknowledgements
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default upper bound on a single drain round trip
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum duration for which message locks are automatically renewed
pub const DEFAULT_MAX_AUTO_RENEW_DURATION: Duration = Duration::from_secs(300);

/// Default inactivity window of a batch receive in peek-lock mode
pub const DEFAULT_NEW_MESSAGE_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of concurrently running message handlers
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: u32 = 1;

/// Shortest delay between two lock renewals of the same message
pub const MIN_LOCK_RENEWAL_DELAY: Duration = Duration::from_secs(1);

/// Largest batch that can be locked in one receive call
pub const MAX_PEEK_LOCK_BATCH_SIZE: u32 = 2047;

/// Default number of retries for link creation
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retries
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Default upper bound on the delay between retries in exponential mode
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(90);

/// Error condition used to dead-letter a message
pub const DEAD_LETTER_CONDITION: &str = "com.microsoft:dead-letter";

/// Info key carrying the dead-letter reason
pub const DEAD_LETTER_REASON: &str = "DeadLetterReason";

/// Info key carrying the dead-letter description
pub const DEAD_LETTER_ERROR_DESCRIPTION: &str = "DeadLetterErrorDescription";

/* -------------------------------------------------------------------------- */
/*                         Service Bus error conditions                        */
/* -------------------------------------------------------------------------- */

/// The service did not respond within the allotted time
pub const TIMEOUT_CONDITION: &str = "com.microsoft:timeout";

/// The service is too busy to process the request
pub const SERVER_BUSY_CONDITION: &str = "com.microsoft:server-busy";

/// The lock on the message has been lost
pub const MESSAGE_LOCK_LOST_CONDITION: &str = "com.microsoft:message-lock-lost";

/// The lock on the session has been lost
pub const SESSION_LOCK_LOST_CONDITION: &str = "com.microsoft:session-lock-lost";

/// The messaging entity is disabled
pub const ENTITY_DISABLED_CONDITION: &str = "com.microsoft:entity-disabled";

/// The messaging entity does not exist
pub const ENTITY_NOT_FOUND_CONDITION: &str = "com.microsoft:entity-not-found";

/// The messaging entity has exceeded its quota
pub const QUOTA_EXCEEDED_CONDITION: &str = "com.microsoft:quota-exceeded";

/// The request was malformed
pub const ARGUMENT_ERROR_CONDITION: &str = "com.microsoft:argument-error";
