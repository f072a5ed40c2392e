//! # txbulk
//!
//! Bulk transaction executor for a backend storage engine.
//!
//! Takes a user-defined stream of uniform work items, packs them into
//! backend transactions under the engine's per-transaction credit ceiling,
//! and runs those transactions in parallel, one worker per locality.
//! Completion is delivered through a single [`Op`]; the outcome is read with
//! [`Bulk::status`].

pub mod backend;
pub mod bulk;
pub mod config;
pub mod credit;
pub mod error;
pub mod locality;
pub mod model;
pub mod op;
pub mod source;
pub mod telemetry;

pub use backend::Backend;
pub use bulk::{Bulk, BulkConfig};
pub use credit::{Budget, Credit};
pub use error::{Error, Result};
pub use locality::{Localities, RuntimeLocalities, ThreadLocalities};
pub use model::{BulkId, BulkReport, WorkerId, WorkerState, WorkerSummary};
pub use op::Op;
pub use source::WorkSource;
