use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::SyncConfig;
use crate::error::StratumError;
use crate::persistence::{Folder, LazyFlush};
use crate::sync::domain::parsed_tx::ParsedTx;
use crate::sync::electrum::{ConnectionCommand, StratumTask};
use crate::sync::engine::types::SyncEvent;
use crate::sync::registry::ServerRegistry;
use crate::sync::types::{AddressInfo, AddressRecord, TxHeightRecord};

/// `addresses.json`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AddressesDocument {
    pub addresses: BTreeMap<String, AddressRecord>,
    pub heights: BTreeMap<String, TxHeightRecord>,
}

/// `txs.json`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TxsDocument {
    pub txs: BTreeMap<String, String>,
}

/// Engine-side end of a connection actor.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub uri: String,
    tx: UnboundedSender<ConnectionCommand>,
}

impl ConnectionHandle {
    pub fn new(id: u64, uri: &str, tx: UnboundedSender<ConnectionCommand>) -> Self {
        Self {
            id,
            uri: uri.to_string(),
            tx,
        }
    }

    /// Hands a task to the connection. Gives the task back when the actor
    /// is already gone, so the caller can fail it.
    pub fn submit(&self, task: StratumTask) -> Result<(), StratumTask> {
        match self.tx.send(ConnectionCommand::Submit(task)) {
            Err(SendError(ConnectionCommand::Submit(task))) => Err(task),
            _ => Ok(()),
        }
    }

    pub fn wake_up(&self) {
        let _ = self.tx.send(ConnectionCommand::WakeUp);
    }

    pub fn close(&self, error: Option<StratumError>) {
        let _ = self.tx.send(ConnectionCommand::Close(error));
    }
}

/// What one connection knows about one address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressState {
    pub subscribed: bool,
    pub subscribing: bool,
    /// Last status hash the server reported. `None` means no history.
    pub hash: Option<String>,
    /// Stamp of the last subscribe reply or notification.
    pub last_update: u64,
    pub fetching_utxos: bool,
    pub fetching_txids: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ServerState {
    /// Matches [`ConnectionHandle::id`].
    pub id: u64,
    pub version: Option<String>,
    pub fetching_version: bool,
    pub height: Option<u32>,
    pub fetching_height: bool,
    pub addresses: HashMap<String, AddressState>,
    /// Txids this server listed in a history or utxo reply.
    pub txids: HashSet<String>,
    /// Block heights this server listed in a history or utxo reply.
    pub heights: HashSet<u32>,
    /// Listed txids this server then failed to send.
    pub unavailable_txs: HashSet<String>,
}

impl ServerState {
    pub fn new<'a>(id: u64, script_hashes: impl Iterator<Item = &'a String>) -> Self {
        Self {
            id,
            addresses: script_hashes
                .map(|sh| (sh.clone(), AddressState::default()))
                .collect(),
            ..Self::default()
        }
    }
}

/// Work that has to happen after the engine lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Notify(SyncEvent),
    /// Goes to the registry, which calls every engine back.
    RegistryHeight(u32),
}

pub struct EngineState {
    pub config: SyncConfig,
    pub registry: Arc<ServerRegistry>,
    pub folder: Arc<dyn Folder>,

    // Raw caches, persisted.
    pub address_cache: BTreeMap<String, AddressRecord>,
    pub tx_heights: BTreeMap<String, TxHeightRecord>,
    pub tx_cache: BTreeMap<String, String>,

    // Derived.
    pub address_infos: BTreeMap<String, AddressInfo>,
    pub parsed_txs: HashMap<String, ParsedTx>,
    /// display address -> scriptHash
    pub script_hashes: HashMap<String, String>,
    pub used_addresses: HashSet<String>,

    // Work queues.
    pub missing_txs: BTreeSet<String>,
    pub fetching_txs: HashSet<String>,
    pub missing_headers: BTreeSet<u32>,
    pub fetching_headers: HashSet<u32>,

    // Pool.
    pub connections: BTreeMap<String, ConnectionHandle>,
    pub server_states: HashMap<String, ServerState>,
    /// Servers that dropped with an error, and when.
    pub failed_at: HashMap<String, Instant>,
    pub next_connection_id: u64,
    pub started: bool,
    pub listener_id: Option<u64>,
    /// Bumped on every connect, so timers from older sessions stop.
    pub session: u64,

    pub address_flush: LazyFlush,
    pub tx_flush: LazyFlush,

    last_stamp: u64,
    pub effects: Vec<Effect>,
}

impl EngineState {
    pub fn new(config: SyncConfig, registry: Arc<ServerRegistry>, folder: Arc<dyn Folder>) -> Self {
        let laziness = config.time_laziness();
        Self {
            config,
            registry,
            folder,
            address_cache: BTreeMap::new(),
            tx_heights: BTreeMap::new(),
            tx_cache: BTreeMap::new(),
            address_infos: BTreeMap::new(),
            parsed_txs: HashMap::new(),
            script_hashes: HashMap::new(),
            used_addresses: HashSet::new(),
            missing_txs: BTreeSet::new(),
            fetching_txs: HashSet::new(),
            missing_headers: BTreeSet::new(),
            fetching_headers: HashSet::new(),
            connections: BTreeMap::new(),
            server_states: HashMap::new(),
            failed_at: HashMap::new(),
            next_connection_id: 0,
            started: false,
            listener_id: None,
            session: 0,
            address_flush: LazyFlush::new(laziness),
            tx_flush: LazyFlush::new(laziness),
            last_stamp: 0,
            effects: Vec::new(),
        }
    }

    /// Wall-clock milliseconds, strictly increasing across calls so two
    /// updates never tie.
    pub fn next_stamp(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }

    pub fn notify(&mut self, event: SyncEvent) {
        self.effects.push(Effect::Notify(event));
    }

    /// The server state for `uri`, if it still belongs to connection `id`.
    pub fn server_mut(&mut self, uri: &str, id: u64) -> Option<&mut ServerState> {
        self.server_states.get_mut(uri).filter(|s| s.id == id)
    }

    pub fn is_current(&self, uri: &str, id: u64) -> bool {
        self.connections.get(uri).is_some_and(|h| h.id == id)
    }

    pub fn close_connection(&mut self, uri: &str, id: u64, error: Option<StratumError>) {
        if let Some(handle) = self.connections.get(uri).filter(|h| h.id == id) {
            handle.close(error);
        }
    }

    /// Lets idle connections look for new work.
    pub fn wake_all(&self) {
        for handle in self.connections.values() {
            handle.wake_up();
        }
    }
}
