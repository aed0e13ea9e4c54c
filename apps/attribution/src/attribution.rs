pub mod service;
pub mod store;
pub mod types;

pub use service::{AttributionError, AttributionService};
pub use store::{AttributionStore, AttributionStoreError, TableName};
pub use types::AttributionRecord;
