pub mod config;
pub mod data_filter;
pub mod diff;
pub mod handler;
pub mod hashing;
pub mod memory_store;
pub mod metric_consts;
pub mod store;
pub mod types;
pub mod unsafe_fields;

pub use config::GrouperConfig;
pub use handler::Grouper;
pub use memory_store::MemoryEventStore;
pub use store::{DailyBucket, EventStore, GroupedEvent, Repetition, StoreError};
pub use types::{worker_names, EventPayload, EventUser, GroupTask, NotifierTask};
