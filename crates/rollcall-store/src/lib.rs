//! rollcall-store: Bounded audit log of recognition attempts.
//!
//! Every attempt is appended fire-and-forget to a SQLite table owned by a
//! background writer task. The same task runs periodic maintenance that
//! evicts oldest-first entries once the count or byte budget is exceeded and
//! sweeps entries past the retention age.

pub mod entry;
pub mod error;
pub mod maintenance;
mod schema;
pub mod store;

pub use entry::{LogQuery, RecognitionLogEntry, ResultKind};
pub use error::StoreError;
pub use maintenance::{MaintenanceReport, RetentionPolicy};
pub use schema::LogStats;
pub use store::{LogStoreConfig, RecognitionLogStore};
