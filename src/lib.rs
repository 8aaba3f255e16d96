//! Messenger - multi-backend publish/subscribe
//!
//! Topic-bound producers and consumers over in-process channels, Kafka,
//! Azure Event Hubs and Azure storage queues, with W3C trace context carried
//! in message properties. The `dispatcher` module routes typed values to
//! registered handlers inside one process.

pub mod config;
pub mod dispatcher;
pub mod messenger;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{MessengerConfig, MessengerType};
pub use messenger::{
    init_messenger, Consumer, Message, Messenger, MessengerError, Producer, Subscription,
};
