// Kafka module - rebalance-safe consumption and the publish path
pub mod connection;
pub mod coordinator;
pub mod handler;
pub mod ledger;
pub mod poll_loop;
pub mod producer;
pub mod serializer;
pub mod types;
pub mod worker;

// In-memory log and handlers for unit tests and the tests/ directory
pub mod test_utils;


pub use connection::{BrokerConnection, KafkaLog, RebalanceContext};
pub use coordinator::{RebalanceCoordinator, WorkerSettings};
pub use handler::{handler_fn, HandlerRegistry, RecordHandler};
pub use ledger::{CommitSet, OffsetLedger};
pub use poll_loop::{LogClient, OffsetCommitter, PollLoop, PollSettings};
pub use producer::{Delivery, Producer};
pub use serializer::JsonSerializer;
pub use types::{Fetch, FetchError, Record, TopicPartition};
pub use worker::{PartitionBatch, PartitionWorker, WorkerState};
