use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::StratumError;
use crate::sync::electrum::connection::{ConnectionCommand, ConnectionStats, StratumConnection};
use crate::sync::electrum::tasks::StratumTask;

/// Events a connection reports to its owner (the engine's pool).
///
/// Every method is called from the task that owns the connection, never
/// while the connection is borrowed elsewhere.
pub trait StratumCallbacks: Send + Sync {
    fn on_open(&self, uri: &str);

    /// The connection reached `Closed`. `error` is `None` for a requested
    /// shutdown.
    fn on_close(&self, uri: &str, stats: ConnectionStats, error: Option<StratumError>);

    /// The connection is `Ready` and has room for another request.
    fn on_queue_space(&self, uri: &str) -> Option<StratumTask>;

    fn on_notify_height(&self, uri: &str, height: u32);

    fn on_notify_script_hash(&self, uri: &str, script_hash: &str, status: Option<String>);

    /// The server answered the opening `server.version`.
    fn on_version(&self, uri: &str, version: &str);

    /// An error reply matched the spam heuristic.
    fn on_spam_server(&self, uri: &str);
}

/// Transport capabilities and scheduling, supplied by the embedder.
pub trait StratumIo: Send + Sync {
    fn supports_tcp(&self) -> bool;

    fn supports_tls(&self) -> bool;

    /// Takes ownership of an `Idle` connection, dials it and drives it until
    /// it closes, applying commands from `commands` along the way.
    fn open_connection(
        &self,
        connection: StratumConnection,
        commands: UnboundedReceiver<ConnectionCommand>,
    );

    /// Calls `tick` every `period` until it returns false.
    fn start_timer(&self, period: Duration, tick: Box<dyn FnMut() -> bool + Send>);
}
