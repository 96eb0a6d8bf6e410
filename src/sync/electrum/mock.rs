//! In-memory stand-in for the socket layer.
//!
//! `MockIo` keeps every connection the engine opens instead of dialing it.
//! Tests then play the server by hand: connect the socket, read what the
//! connection sent, and feed replies back in.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::sync::electrum::api::StratumIo;
use crate::sync::electrum::connection::{ConnectionCommand, StratumConnection};

type Tick = Box<dyn FnMut() -> bool + Send>;

pub struct MockIo {
    tcp: bool,
    tls: bool,
    opened: Mutex<Vec<MockConnection>>,
    timers: Mutex<Vec<(Duration, Tick)>>,
}

impl MockIo {
    pub fn new() -> Self {
        Self::with_transports(true, true)
    }

    pub fn with_transports(tcp: bool, tls: bool) -> Self {
        Self {
            tcp,
            tls,
            opened: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Connections opened since the last call.
    pub fn take_opened(&self) -> Vec<MockConnection> {
        std::mem::take(&mut *self.opened.lock().unwrap())
    }

    pub fn timer_count(&self) -> usize {
        self.timers.lock().unwrap().len()
    }

    /// Runs every timer once, dropping those that ask to stop.
    pub fn fire_timers(&self) {
        let mut timers = std::mem::take(&mut *self.timers.lock().unwrap());
        timers.retain_mut(|(_, tick)| tick());
        self.timers.lock().unwrap().extend(timers);
    }
}

impl StratumIo for MockIo {
    fn supports_tcp(&self) -> bool {
        self.tcp
    }

    fn supports_tls(&self) -> bool {
        self.tls
    }

    fn open_connection(
        &self,
        connection: StratumConnection,
        commands: UnboundedReceiver<ConnectionCommand>,
    ) {
        self.opened.lock().unwrap().push(MockConnection {
            connection,
            commands,
            now: Instant::now(),
        });
    }

    fn start_timer(&self, period: Duration, tick: Box<dyn FnMut() -> bool + Send>) {
        self.timers.lock().unwrap().push((period, tick));
    }
}

/// A connection plus its command channel, driven by the test.
pub struct MockConnection {
    pub connection: StratumConnection,
    pub commands: UnboundedReceiver<ConnectionCommand>,
    /// Clock handed to the connection; tests move it forward by hand.
    pub now: Instant,
}

impl MockConnection {
    pub fn uri(&self) -> String {
        self.connection.uri().to_string()
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn connect(&mut self) {
        self.connection.on_connecting();
        self.connection.on_socket_connect(self.now);
    }

    /// Applies queued commands, then lets the connection pull work.
    pub fn pump(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.connection.handle_command(command, self.now);
        }
        self.connection.wake_up(self.now);
    }

    /// Requests written since the last call, as JSON.
    pub fn sent(&mut self) -> Vec<Value> {
        self.connection
            .take_outbox()
            .iter()
            .map(|line| serde_json::from_str(line.trim()).unwrap())
            .collect()
    }

    pub fn reply(&mut self, id: &Value, result: Value) {
        let line = json!({ "id": id, "result": result }).to_string() + "\n";
        self.connection.on_data(&line, self.now);
    }

    pub fn reply_error(&mut self, id: &Value, message: &str) {
        let line = json!({ "id": id, "error": { "code": 1, "message": message } }).to_string() + "\n";
        self.connection.on_data(&line, self.now);
    }

    pub fn notify(&mut self, method: &str, params: Value) {
        let line = json!({ "method": method, "params": params }).to_string() + "\n";
        self.connection.on_data(&line, self.now);
    }

    /// Connects and answers the opening version request.
    pub fn handshake(&mut self, version: &str) {
        self.connect();
        let sent = self.sent();
        let request = sent
            .iter()
            .find(|r| r["method"] == "server.version")
            .expect("version request goes out first");
        self.reply(&request["id"].clone(), json!(["mock server", version]));
    }
}
