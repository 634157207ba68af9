//! Error types and result handling for ticket-relay.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Record handlers do not use this type: they return `anyhow::Result<()>`
//! and their failures never leave the partition worker that invoked them.
//!
//! # Example
//!
//! ```rust
//! use ticket_relay::{Error, Result};
//!
//! fn connect_to_cluster() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("no broker reachable".to_string()))
//! }
//!
//! match connect_to_cluster() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for ticket-relay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The cluster could not be joined: no broker reachable, authentication
    /// rejected, or a declared topic has no registered handler.
    ///
    /// Fatal at startup.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Kafka client error not covered by a more specific variant.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// A payload could not be encoded or decoded as JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker rejected a publish, it timed out, or the record was too large.
    ///
    /// Surfaced to the caller as-is; publishing is never retried internally.
    #[error("Failed to produce to topic {topic}: {message}")]
    Produce {
        /// Destination topic
        topic: String,
        /// Broker or local rejection reason
        message: String,
    },

    /// An offset commit failed. The same offsets are retried on the next poll cycle.
    #[error("Offset commit failed: {0}")]
    Commit(String),

    /// A partition worker did not acknowledge completion within the drain timeout.
    #[error("Partition {partition} did not drain within {waited_ms}ms")]
    ShutdownStall {
        /// `topic:partition` of the stalled worker
        partition: String,
        /// How long the revoke path waited
        waited_ms: u128,
    },

    /// A background task (poll loop or connection teardown) panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A convenient Result type alias for ticket-relay operations.
///
/// This is equivalent to `std::result::Result<T, ticket_relay::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
