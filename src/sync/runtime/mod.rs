//! Tokio sockets and timers behind [`crate::sync::electrum::StratumIo`].

pub mod driver;
pub mod io;

#[cfg(test)]
mod tests;

pub use driver::{DialSettings, Endpoint};
pub use io::TokioIo;
