//! Client-side sync layer for a Pioreactor fleet: one bus session per
//! context, streaming throughput totals, REST rate snapshots, unit labels
//! and dosing commands.

pub mod api;
pub mod bus;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod identity;
pub mod logs;
pub mod router;
pub mod snapshot;
pub mod telemetry;
pub mod topic;

pub use api::{Backend, HttpBackend};
pub use bus::{BusConnection, BusPublisher, ConnectionState, InboundMessage};
pub use config::SyncConfig;
pub use context::{SyncContext, SyncView};
pub use dispatch::{Command, CommandDispatcher, DosingAutomation};
