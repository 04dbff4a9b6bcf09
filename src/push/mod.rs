//! Legacy binary gateway delivery.

pub mod connection;
pub mod dispatcher;
pub mod frame;
pub mod listener;
pub mod payload;
pub mod retry;

pub use connection::TlsGatewayConnector;
pub use dispatcher::{Batch, DeliveryDispatcher, DispatchOptions};
pub use payload::PayloadBuilder;
