//! Domain layer: core types, events and the row-set reconciler.
//!
//! This module contains the client-side domain model: subscription identity,
//! the closed [`DataUpdate`] union delivered to subscribers, connection
//! status and metrics, the event bus and observer seam used to report
//! lifecycle changes, and the reconciler that materializes a live table from
//! a stream of updates.

pub mod connection_event;
pub mod connection_state;
pub mod data_update;
pub mod delivery;
pub mod event_bus;
pub mod reconciler;
pub mod subscription_id;

pub use connection_event::{ConnectionEvent, DataSourceEvent};
pub use connection_state::{ConnectionMetrics, ConnectionSnapshot, ConnectionStatus};
pub use data_update::{Change, DataUpdate, Row, UpdateKind, row_from_value};
pub use delivery::{Delivery, Payload};
pub use event_bus::{ConnectionObserver, EventBus, Observers};
pub use reconciler::{ApplyOutcome, DataSetReconciler, DataSetStatistics, RowSet};
pub use subscription_id::SubscriptionId;
