//! One Stratum session, as a synchronous state machine.
//!
//! The connection never touches a socket. Its driver feeds it socket events
//! (`on_socket_connect`, `on_data`, `on_socket_close`), commands and timer
//! ticks, and drains [`StratumConnection::take_outbox`] onto the wire.
//!
//! Phases: `Idle -> Connecting -> Open -> Ready -> Closed`. A `server.version`
//! request is queued at construction, so it is the first thing sent once the
//! socket opens; its reply moves the connection to `Ready`, after which it
//! pulls work from [`StratumCallbacks::on_queue_space`] up to `queue_size`
//! requests in flight.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::SyncConfig;
use crate::error::StratumError;
use crate::sync::electrum::api::StratumCallbacks;
use crate::sync::electrum::message::{
    decode_message, encode_request, RpcError, StratumMessage, METHOD_PING, METHOD_VERSION,
};
use crate::sync::electrum::tasks::{parse_version, version_params, StratumTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Open,
    Ready,
    Closed,
}

/// Message counters handed to the registry when the connection closes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectionStats {
    pub good_messages: u32,
    pub bad_messages: u32,
    /// Moving average of the reply time, in milliseconds.
    pub latency: f64,
}

impl ConnectionStats {
    fn record_latency(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.latency = if self.good_messages <= 1 {
            ms
        } else {
            0.8 * self.latency + 0.2 * ms
        };
    }
}

/// What the engine can ask of a running connection.
#[derive(Debug)]
pub enum ConnectionCommand {
    Submit(StratumTask),
    WakeUp,
    /// Shut down. `Some` when closing because the server misbehaved.
    Close(Option<StratumError>),
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub queue_size: usize,
    pub timeout: Duration,
    pub keep_alive: Duration,
    pub client_name: String,
    pub protocol_version: String,
}

impl ConnectionOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            queue_size: config.queue_size.max(1),
            timeout: config.timeout(),
            keep_alive: config.keep_alive(),
            client_name: config.client_name.clone(),
            protocol_version: config.protocol_version.clone(),
        }
    }
}

#[derive(Debug)]
enum PendingKind {
    Version,
    KeepAlive,
    Task(StratumTask),
}

#[derive(Debug)]
struct PendingRequest {
    kind: PendingKind,
    method: &'static str,
    params: Vec<Value>,
    /// Submission time, reset when the request actually goes out.
    started: Instant,
}

pub struct StratumConnection {
    uri: String,
    phase: ConnectionPhase,
    options: ConnectionOptions,
    callbacks: Arc<dyn StratumCallbacks>,

    next_id: u64,
    pending: BTreeMap<u64, PendingRequest>,
    outbox: Vec<String>,
    partial: String,

    last_traffic: Instant,
    version: Option<String>,
    stats: ConnectionStats,
}

impl StratumConnection {
    pub fn new(
        uri: &str,
        options: ConnectionOptions,
        callbacks: Arc<dyn StratumCallbacks>,
        now: Instant,
    ) -> Self {
        let params = version_params(&options.client_name, &options.protocol_version);
        let mut connection = Self {
            uri: uri.to_string(),
            phase: ConnectionPhase::Idle,
            options,
            callbacks,
            next_id: 0,
            pending: BTreeMap::new(),
            outbox: Vec::new(),
            partial: String::new(),
            last_traffic: now,
            version: None,
            stats: ConnectionStats::default(),
        };
        connection.enqueue(PendingKind::Version, METHOD_VERSION, params, now);
        connection
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == ConnectionPhase::Closed
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Lines ready to be written to the socket.
    pub fn take_outbox(&mut self) -> Vec<String> {
        mem::take(&mut self.outbox)
    }

    pub fn on_connecting(&mut self) {
        if self.phase == ConnectionPhase::Idle {
            self.phase = ConnectionPhase::Connecting;
        }
    }

    pub fn on_socket_connect(&mut self, now: Instant) {
        if !matches!(self.phase, ConnectionPhase::Idle | ConnectionPhase::Connecting) {
            return;
        }

        log::debug!("[STRATUM] {} connected", self.uri);
        self.phase = ConnectionPhase::Open;
        self.last_traffic = now;
        self.partial.clear();
        self.callbacks.on_open(&self.uri);

        // Queued requests go out in id order, so the version check leads.
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        for id in ids {
            self.transmit(id, now);
        }
    }

    pub fn submit_task(&mut self, task: StratumTask, now: Instant) {
        if self.is_closed() {
            task.fail(StratumError::Closed {
                uri: self.uri.clone(),
            });
            return;
        }
        let method = task.method;
        let params = task.params.clone();
        self.enqueue(PendingKind::Task(task), method, params, now);
    }

    pub fn handle_command(&mut self, command: ConnectionCommand, now: Instant) {
        match command {
            ConnectionCommand::Submit(task) => self.submit_task(task, now),
            ConnectionCommand::WakeUp => self.wake_up(now),
            ConnectionCommand::Close(error) => self.close(error),
        }
    }

    /// Pulls work from the owner while there is queue space.
    pub fn wake_up(&mut self, now: Instant) {
        while self.phase == ConnectionPhase::Ready && self.pending.len() < self.options.queue_size {
            match self.callbacks.on_queue_space(&self.uri) {
                Some(task) => self.submit_task(task, now),
                None => break,
            }
        }
    }

    /// Feeds raw socket data. Lines may arrive split across chunks.
    pub fn on_data(&mut self, chunk: &str, now: Instant) {
        if self.is_closed() {
            return;
        }

        self.partial.push_str(chunk);
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim();
            if !line.is_empty() {
                self.on_message(line, now);
            }
            if self.is_closed() {
                return;
            }
        }
    }

    pub fn on_message(&mut self, line: &str, now: Instant) {
        log::trace!("[STRATUM] {} <- {}", self.uri, line);
        self.last_traffic = now;

        let message = match decode_message(line) {
            Ok(message) => message,
            Err(e) => {
                self.stats.bad_messages += 1;
                self.close(Some(StratumError::protocol(&self.uri, e)));
                return;
            }
        };

        match message {
            StratumMessage::Reply { id, result } => self.on_reply(id, result, now),
            StratumMessage::HeightNotification(height) => {
                self.callbacks.on_notify_height(&self.uri, height);
            }
            StratumMessage::ScriptHashNotification {
                script_hash,
                status,
            } => {
                self.callbacks
                    .on_notify_script_hash(&self.uri, &script_hash, status);
            }
            StratumMessage::OtherNotification(method) => {
                log::trace!("[STRATUM] {} ignoring {} notification", self.uri, method);
            }
        }
    }

    fn on_reply(&mut self, id: u64, result: Result<Value, RpcError>, now: Instant) {
        let Some(request) = self.pending.remove(&id) else {
            self.stats.bad_messages += 1;
            let error = StratumError::protocol(&self.uri, format!("reply with unknown id {}", id));
            self.close(Some(error));
            return;
        };

        let elapsed = now.saturating_duration_since(request.started);

        let result = match result {
            Ok(value) => value,
            Err(rpc) => {
                self.stats.bad_messages += 1;
                let error = if rpc.is_spam() {
                    log::warn!("[STRATUM] {} sent a spam error: {}", self.uri, rpc.message);
                    self.callbacks.on_spam_server(&self.uri);
                    StratumError::SpamServer {
                        uri: self.uri.clone(),
                    }
                } else {
                    StratumError::Rpc {
                        uri: self.uri.clone(),
                        code: rpc.code,
                        message: rpc.message,
                    }
                };

                match request.kind {
                    PendingKind::Task(task) => task.fail(error),
                    PendingKind::Version | PendingKind::KeepAlive => self.close(Some(error)),
                }
                return;
            }
        };

        match request.kind {
            PendingKind::Version => match parse_version(&result) {
                Some(version) => {
                    self.good_reply(elapsed);
                    log::debug!("[STRATUM] {} speaks protocol {}", self.uri, version);
                    self.version = Some(version.clone());
                    if self.phase == ConnectionPhase::Open {
                        self.phase = ConnectionPhase::Ready;
                    }
                    self.callbacks.on_version(&self.uri, &version);
                }
                None => {
                    self.stats.bad_messages += 1;
                    let error = StratumError::protocol(
                        &self.uri,
                        format!("unexpected version reply {}", result),
                    );
                    self.close(Some(error));
                }
            },
            PendingKind::KeepAlive => self.good_reply(elapsed),
            PendingKind::Task(task) => match task.succeed(&self.uri, result) {
                Ok(()) => self.good_reply(elapsed),
                Err(error) => {
                    self.stats.bad_messages += 1;
                    self.close(Some(error));
                }
            },
        }
    }

    fn good_reply(&mut self, elapsed: Duration) {
        self.stats.good_messages += 1;
        self.stats.record_latency(elapsed);
    }

    /// Keep-alive and timeout sweep.
    pub fn on_timer(&mut self, now: Instant) {
        if !matches!(self.phase, ConnectionPhase::Open | ConnectionPhase::Ready) {
            return;
        }

        let timed_out: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.started) >= self.options.timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in timed_out {
            let Some(request) = self.pending.remove(&id) else {
                continue;
            };
            log::debug!("[STRATUM] {} request {} ({}) timed out", self.uri, id, request.method);
            self.stats.bad_messages += 1;

            let error = StratumError::Timeout {
                uri: self.uri.clone(),
            };
            match request.kind {
                PendingKind::Task(task) => task.fail(error),
                PendingKind::Version | PendingKind::KeepAlive => {
                    self.close(Some(error));
                    return;
                }
            }
        }

        let keep_alive_pending = self
            .pending
            .values()
            .any(|p| matches!(p.kind, PendingKind::KeepAlive));
        if !keep_alive_pending
            && now.saturating_duration_since(self.last_traffic) >= self.options.keep_alive
        {
            // 1.1 servers predate server.ping.
            let (method, params) = if self.version.as_deref() == Some("1.1") {
                (
                    METHOD_VERSION,
                    version_params(&self.options.client_name, &self.options.protocol_version),
                )
            } else {
                (METHOD_PING, Vec::new())
            };
            log::trace!("[STRATUM] {} keep-alive via {}", self.uri, method);
            self.enqueue(PendingKind::KeepAlive, method, params, now);
        }
    }

    /// Next instant `on_timer` has something to do.
    pub fn next_wake(&self) -> Option<Instant> {
        if !matches!(self.phase, ConnectionPhase::Open | ConnectionPhase::Ready) {
            return None;
        }

        let keep_alive = self.last_traffic + self.options.keep_alive;
        let earliest_timeout = self
            .pending
            .values()
            .map(|p| p.started + self.options.timeout)
            .min();

        Some(match earliest_timeout {
            Some(t) if t < keep_alive => t,
            _ => keep_alive,
        })
    }

    /// Shuts the connection down, failing everything still pending.
    pub fn close(&mut self, error: Option<StratumError>) {
        self.finish(error);
    }

    /// The socket went away underneath us.
    pub fn on_socket_close(&mut self, error: Option<StratumError>) {
        let error = error.or_else(|| Some(StratumError::transport(&self.uri, "socket closed")));
        self.finish(error);
    }

    fn finish(&mut self, error: Option<StratumError>) {
        if self.is_closed() {
            return;
        }

        match &error {
            Some(e) => log::info!("[STRATUM] {} closing: {}", self.uri, e),
            None => log::info!("[STRATUM] {} closing", self.uri),
        }

        self.phase = ConnectionPhase::Closed;
        self.outbox.clear();
        self.partial.clear();

        for (_, request) in mem::take(&mut self.pending) {
            if let PendingKind::Task(task) = request.kind {
                task.fail(StratumError::Closed {
                    uri: self.uri.clone(),
                });
            }
        }

        self.callbacks.on_close(&self.uri, self.stats, error);
    }

    fn enqueue(&mut self, kind: PendingKind, method: &'static str, params: Vec<Value>, now: Instant) {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(
            id,
            PendingRequest {
                kind,
                method,
                params,
                started: now,
            },
        );

        if matches!(self.phase, ConnectionPhase::Open | ConnectionPhase::Ready) {
            self.transmit(id, now);
        }
    }

    fn transmit(&mut self, id: u64, now: Instant) {
        let Some(request) = self.pending.get_mut(&id) else {
            return;
        };
        request.started = now;
        self.last_traffic = now;

        let line = encode_request(id, request.method, &request.params);
        log::trace!("[STRATUM] {} -> {}", self.uri, line.trim_end());
        self.outbox.push(line);
    }
}
