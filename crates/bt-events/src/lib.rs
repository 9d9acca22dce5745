//! bt-events: the event bus that fans out lifecycle notifications to every
//! other interested component over a topic exchange. Publishing is
//! best-effort — a disconnected broker degrades to a logged warning rather
//! than failing the caller's operation.

pub mod error;
pub mod publisher;
pub mod reconnect;
pub mod subscriber;

pub use error::EventError;
pub use publisher::{FakePublisher, LapinPublisher, Publisher};
pub use reconnect::ConnectionState;
pub use subscriber::{run_subscriber, Handler, SubscriberConfig};
