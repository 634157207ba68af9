pub mod config;
pub mod error;
pub mod relay;

pub mod kafka;
pub mod tickets;

pub use config::Config;
pub use error::{Error, Result};
pub use relay::Relay;
