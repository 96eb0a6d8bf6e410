//! Wallet synchronization against a federation of Stratum servers.
//!
//! * `electrum` speaks the wire protocol, one connection at a time.
//! * `registry` keeps the per-currency height, headers and server scores.
//! * `engine` keeps one wallet's caches fresh using a pool of connections.
//! * `runtime` drives connections over real sockets with tokio.

pub mod domain;
pub mod electrum;
pub mod engine;
pub mod registry;
pub mod runtime;
pub mod types;
pub mod wallet;

pub use engine::{EngineCallbacks, EngineOptions, SyncEngine, SyncEvent};
pub use registry::ServerRegistry;
pub use runtime::TokioIo;
pub use wallet::{WalletEvent, WalletMonitor, WalletTransaction};
