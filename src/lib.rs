//! # realtime-link
//!
//! Client library for STOMP brokers reached over WebSocket.
//!
//! A [`service::ConnectionManager`] keeps any number of named connections.
//! Each connection is a single task that owns its socket, its subscriptions
//! and its timers: it reconnects with exponential backoff, watches
//! heart-beats, replays subscriptions after every reconnect, and delivers
//! messages to callbacks either immediately or in throttled batches. Topics
//! that carry keyed change events can be mirrored into a
//! [`service::LiveDataSet`].
//!
//! ## Architecture
//!
//! ```text
//! Application
//!     │
//!     ├── ConnectionManager (service/)
//!     ├── LiveDataSet + DataSetReconciler (service/, domain/)
//!     ├── EventBus (domain/)
//!     │
//!     ├── Connection task (ws/connection)
//!     │     ├── SubscriptionRegistry, Throttler
//!     │     └── TimerSet (scheduler)
//!     │
//!     ├── STOMP frames + body codec (ws/frame, ws/codec)
//!     │
//!     └── WebSocket transport (tokio-tungstenite)
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod scheduler;
pub mod service;
pub mod ws;
