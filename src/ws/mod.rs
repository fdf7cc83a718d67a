//! WebSocket layer: STOMP codec, transport, subscriptions and the
//! connection state machine.
//!
//! Frames travel as WebSocket text messages. [`frame`] encodes and decodes
//! STOMP, [`codec`] turns message bodies into payloads, [`transport`] owns
//! the socket, and [`connection`] drives one broker session end to end.

pub mod codec;
pub mod connection;
pub mod frame;
pub mod subscription;
pub mod throttle;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::{Connection, ConnectionDeps};
pub use subscription::{
    MessageCallback, MessageFilter, SubscribeOptions, SubscriptionInfo, SubscriptionRegistry,
};
pub use throttle::Throttler;
pub use transport::{Connector, TransportEvent, TransportSession, WebSocketConnector};
