//! Trellis Message Queue
//!
//! Topic-addressed asynchronous delivery for the trellis mesh. Publishers
//! enqueue opaque payloads; a background delivery loop fans each due message
//! out to every handler subscribed to its topic, retrying failures with
//! exponential backoff until the retry budget is spent, at which point the
//! message is parked in the topic's dead-letter list for inspection and
//! manual reprocessing. A retention sweeper bounds memory by dropping
//! messages that outlive the retention window, handlers or not.

pub mod delivery;
pub mod message;
pub mod queue;

pub use delivery::{DeliveryLoop, RetentionSweeper};
pub use message::{PublishOptions, QueueMessage};
pub use queue::{HandlerId, MessageHandler, MessageQueue, QueueConfig, TopicStats};
