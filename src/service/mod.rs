//! Delivery services and HTTP handlers for Tidings.

pub mod attach;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod registry;
pub mod routes;
pub mod session;
pub mod validate;

pub use connection::{ConnectionError, ConnectionHandle, ConnectionId, FrameSink, FrameStream};
pub use dispatch::{Delivery, DeliveryError, DeliveryOutcome, Dispatcher};
pub use error::ApiError;
pub use fanout::{FanOut, FanOutDriver, FanOutReport, TopicEvent, TopicEventSender};
pub use registry::ConnectionRegistry;
pub use routes::create_router;
pub use session::{run_session, SessionContext, SessionSettings};
