//! Service layer: connection orchestration.
//!
//! [`ConnectionManager`] owns every named connection, routes operations to
//! them and reports lifecycle changes through the
//! [`super::domain::EventBus`]. [`LiveDataSet`] turns a subscription into a
//! reconciled table.

pub mod connection_manager;
pub mod live_dataset;

pub use connection_manager::{ConnectionManager, ManagerStatistics};
pub use live_dataset::LiveDataSet;
