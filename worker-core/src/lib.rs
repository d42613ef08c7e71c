pub mod broker;
pub mod config;
pub mod error;
pub mod memory_broker;
pub mod metric_consts;
pub mod registry;
pub mod worker;

pub use broker::{Broker, BrokerError, Delivery, DeliveryTag, Subscription};
pub use config::WorkerConfig;
pub use error::{PublishError, WorkerError};
pub use memory_broker::InMemoryBroker;
pub use registry::Registry;
pub use worker::{Publisher, TaskHandler, Worker};
