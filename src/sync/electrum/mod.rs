pub mod api;
pub mod connection;
pub mod message;
pub mod tasks;

#[cfg(test)]
pub mod mock;


pub use api::{StratumCallbacks, StratumIo};
pub use connection::{
    ConnectionCommand, ConnectionOptions, ConnectionPhase, ConnectionStats, StratumConnection,
};
pub use tasks::StratumTask;
