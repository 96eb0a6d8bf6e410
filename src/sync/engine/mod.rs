//! Per-wallet synchronization engine.
//!
//! The engine owns the wallet's address, transaction and height caches and
//! a pool of connections to the best-ranked servers. Connections ask it for
//! work whenever they have queue space; `logic::pick_next_task` decides what
//! that work is. Fetch results come back through task continuations and
//! land in the caches via `handlers`.
//!
//! # Locking
//! All engine state sits behind one mutex. Anything that could call back
//! into the engine (application callbacks, registry height updates) is
//! queued as an [`state::Effect`] and run after the lock is released.
//! When both locks are needed, the engine lock is taken before the
//! registry's.

pub mod handlers;
pub mod logic;
pub mod state;
pub mod types;


pub use types::{ChannelCallbacks, EngineCallbacks, EngineOptions, NoopCallbacks, SyncEvent};

use std::collections::BTreeMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{StratumError, SyncError};
use crate::persistence::{load_document, save_document, Folder, KEYS_FILE};
use crate::sync::domain::coin_select::{select_utxos, CandidateUtxo, Selection};
use crate::sync::domain::spk_tracker::AddressSink;
use crate::sync::electrum::tasks;
use crate::sync::electrum::{
    ConnectionOptions, ConnectionStats, StratumCallbacks, StratumConnection, StratumIo,
};
use crate::sync::registry::{RegistryListener, ServerRegistry};
use crate::sync::types::AddressInfo;
use crate::sync::wallet::WalletTransaction;

use state::{ConnectionHandle, Effect, EngineState, ServerState};

/// `keys.json`
#[derive(Debug, Serialize, Deserialize)]
struct KeysEnvelope {
    keys: Value,
}

pub(crate) struct EngineInner {
    state: Mutex<EngineState>,
    registry: Arc<ServerRegistry>,
    io: Arc<dyn StratumIo>,
    encrypted_folder: Arc<dyn Folder>,
    callbacks: Arc<dyn EngineCallbacks>,
    options: ConnectionOptions,
    this: Weak<EngineInner>,
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` under the engine lock, then the effects it queued.
    pub(crate) fn run<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let (result, effects) = {
            let mut state = self.lock();
            let result = f(&mut state);
            (result, mem::take(&mut state.effects))
        };
        self.apply(effects);
        result
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notify(SyncEvent::AddressInfoUpdated(script_hash)) => {
                    self.callbacks.on_address_info_updated(&script_hash)
                }
                Effect::Notify(SyncEvent::HeightUpdated(height)) => {
                    self.callbacks.on_height_updated(height)
                }
                Effect::Notify(SyncEvent::TxFetched(txid)) => self.callbacks.on_tx_fetched(&txid),
                Effect::RegistryHeight(height) => self.registry.update_height(height),
            }
        }
    }

    /// Opens connections to the best servers until the pool is full.
    fn refill(&self, state: &mut EngineState) {
        if !state.started {
            return;
        }

        let now = Instant::now();
        let delay = state.config.reconnect_delay();
        state
            .failed_at
            .retain(|_, at| now.saturating_duration_since(*at) < delay);

        let candidates: Vec<String> = self
            .registry
            .sort_servers(self.io.supports_tcp(), self.io.supports_tls())
            .into_iter()
            .filter(|uri| !state.connections.contains_key(uri) && !state.failed_at.contains_key(uri))
            .collect();

        for uri in candidates {
            if state.connections.len() >= state.config.pool_size {
                break;
            }
            self.open_connection(state, &uri);
        }
    }

    fn open_connection(&self, state: &mut EngineState, uri: &str) {
        state.next_connection_id += 1;
        let id = state.next_connection_id;

        let callbacks: Arc<dyn StratumCallbacks> = Arc::new(PoolCallbacks {
            engine: self.this.clone(),
            id,
        });
        let connection = StratumConnection::new(uri, self.options.clone(), callbacks, Instant::now());
        let (tx, rx) = mpsc::unbounded_channel();

        log::info!("[ENGINE] connecting to {}", uri);
        state
            .connections
            .insert(uri.to_string(), ConnectionHandle::new(id, uri, tx));
        state
            .server_states
            .insert(uri.to_string(), ServerState::new(id, state.address_cache.keys()));
        self.io.open_connection(connection, rx);
    }
}

impl RegistryListener for EngineInner {
    fn on_height_updated(&self, height: u32) {
        self.callbacks.on_height_updated(height);
    }

    fn on_servers_inserted(&self) {
        self.run(|state| self.refill(state));
    }
}

/// Connection events for one pooled connection.
struct PoolCallbacks {
    engine: Weak<EngineInner>,
    id: u64,
}

impl PoolCallbacks {
    fn with_engine<R: Default>(&self, f: impl FnOnce(&EngineInner) -> R) -> R {
        match self.engine.upgrade() {
            Some(engine) => f(&engine),
            None => R::default(),
        }
    }
}

impl StratumCallbacks for PoolCallbacks {
    fn on_open(&self, uri: &str) {
        log::info!("[ENGINE] connected to {}", uri);
    }

    fn on_close(&self, uri: &str, stats: ConnectionStats, error: Option<StratumError>) {
        let id = self.id;
        self.with_engine(|engine| {
            log::info!("[ENGINE] disconnected from {}", uri);
            engine.run(|state| {
                state.registry.record_disconnect(
                    uri,
                    stats.bad_messages,
                    error.is_some(),
                    stats.good_messages,
                    stats.latency,
                );

                if state.is_current(uri, id) {
                    state.connections.remove(uri);
                    state.server_states.remove(uri);
                    if error.is_some() {
                        state.failed_at.insert(uri.to_string(), Instant::now());
                    }
                    engine.refill(state);
                    // Addresses this server owned now belong to someone else.
                    state.wake_all();
                }
                state.flush(true);
            });
        })
    }

    fn on_queue_space(&self, uri: &str) -> Option<tasks::StratumTask> {
        let id = self.id;
        self.with_engine(|engine| {
            engine.run(|state| {
                if !state.is_current(uri, id) {
                    return None;
                }
                logic::pick_next_task(state, uri, id, &engine.this)
            })
        })
    }

    fn on_notify_height(&self, uri: &str, height: u32) {
        let id = self.id;
        self.with_engine(|engine| {
            engine.run(|state| {
                if let Some(server) = state.server_mut(uri, id) {
                    server.height = Some(height);
                }
                state.effects.push(Effect::RegistryHeight(height));
            })
        })
    }

    fn on_notify_script_hash(&self, uri: &str, script_hash: &str, status: Option<String>) {
        let id = self.id;
        self.with_engine(|engine| {
            engine.run(|state| {
                let stamp = state.next_stamp();
                let address = state
                    .server_mut(uri, id)
                    .and_then(|s| s.addresses.get_mut(script_hash));
                match address {
                    Some(address) => {
                        log::debug!("[ENGINE] {} reports {} changed", uri, script_hash);
                        address.hash = status;
                        address.last_update = stamp;
                    }
                    None => log::debug!("[ENGINE] {} notified unknown {}", uri, script_hash),
                }
            })
        })
    }

    fn on_version(&self, uri: &str, version: &str) {
        let id = self.id;
        self.with_engine(|engine| {
            engine.run(|state| {
                state.registry.record_version(uri, version);
                if let Some(server) = state.server_mut(uri, id) {
                    server.version = Some(version.to_string());
                }
            })
        })
    }

    fn on_spam_server(&self, uri: &str) {
        self.with_engine(|engine| engine.registry.record_spam(uri))
    }
}

/// Resolves a broadcast on the first success, or with the last error once
/// every connection has failed.
///
/// Tasks dropped unanswered settle the race when the last one goes away.
struct BroadcastRace {
    remaining: usize,
    last_error: Option<StratumError>,
    reply: Option<oneshot::Sender<Result<String, SyncError>>>,
}

impl BroadcastRace {
    fn succeed(race: &Mutex<BroadcastRace>, txid: String) {
        let mut race = race.lock().unwrap_or_else(|e| e.into_inner());
        race.remaining = race.remaining.saturating_sub(1);
        if let Some(reply) = race.reply.take() {
            let _ = reply.send(Ok(txid));
        }
    }

    fn fail(race: &Mutex<BroadcastRace>, error: StratumError) {
        let mut race = race.lock().unwrap_or_else(|e| e.into_inner());
        race.remaining = race.remaining.saturating_sub(1);
        log::debug!("[ENGINE] broadcast rejected: {}", error);
        if race.remaining == 0 {
            if let Some(reply) = race.reply.take() {
                let _ = reply.send(Err(SyncError::BroadcastFailed(error)));
            }
        } else {
            race.last_error = Some(error);
        }
    }
}

impl Drop for BroadcastRace {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            let result = match self.last_error.take() {
                Some(error) => SyncError::BroadcastFailed(error),
                None => SyncError::NoConnections,
            };
            let _ = reply.send(Err(result));
        }
    }
}

/// Handle to one wallet's engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(options: EngineOptions) -> Self {
        let EngineOptions {
            config,
            registry,
            io,
            folder,
            encrypted_folder,
            callbacks,
        } = options;

        let connection_options = ConnectionOptions::from_config(&config);
        let inner = Arc::new_cyclic(|this| EngineInner {
            state: Mutex::new(EngineState::new(config, registry.clone(), folder)),
            registry,
            io,
            encrypted_folder,
            callbacks,
            options: connection_options,
            this: this.clone(),
        });
        Self { inner }
    }

    /// Loads the transaction and address caches.
    pub fn load(&self) {
        self.inner.run(|state| state.load());
    }

    /// Starts watching an address. Adding a known address does nothing.
    pub fn add_address(&self, script_hash: &str, display_address: &str, path: &str) {
        self.inner
            .run(|state| state.add_address(script_hash, display_address, path));
    }

    pub fn mark_addresses_used<S: AsRef<str>>(&self, script_hashes: &[S]) {
        self.inner.run(|state| state.mark_addresses_used(script_hashes));
    }

    /// Joins the registry, fills the connection pool and starts the flush
    /// timer.
    pub fn connect(&self) {
        let inner = &self.inner;
        let session = inner.run(|state| {
            if state.started {
                return None;
            }
            state.started = true;
            state.session += 1;
            let listener: Weak<dyn RegistryListener> = inner.this.clone();
            state.listener_id = Some(inner.registry.add_engine(listener));
            inner.refill(state);
            Some((state.session, state.config.time_laziness()))
        });
        let Some((session, period)) = session else {
            return;
        };

        let engine = inner.this.clone();
        inner.io.start_timer(
            period.max(Duration::from_secs(1)),
            Box::new(move || {
                let Some(engine) = engine.upgrade() else {
                    return false;
                };
                let alive = engine.run(|state| {
                    if !state.started || state.session != session {
                        return false;
                    }
                    state.flush(false);
                    engine.refill(state);
                    true
                });
                if alive {
                    engine.registry.flush_due();
                }
                alive
            }),
        );

        let height = inner.registry.height();
        if height > 0 {
            inner.callbacks.on_height_updated(height);
        }
    }

    /// Closes every connection, leaves the registry and saves dirty caches.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.run(|state| {
            if !state.started {
                return;
            }
            state.started = false;
            if let Some(id) = state.listener_id.take() {
                inner.registry.remove_engine(id);
            }
            for handle in state.connections.values() {
                handle.close(None);
            }
            state.connections.clear();
            state.server_states.clear();
            state.fetching_txs.clear();
            state.fetching_headers.clear();
            state.flush(true);
            log::info!("[ENGINE] disconnected");
        });
    }

    /// Sends a raw transaction to every open connection.
    ///
    /// Resolves with the txid on the first acceptance and fails only once
    /// every connection has rejected it.
    pub async fn broadcast_tx(&self, raw_tx: &str) -> Result<String, SyncError> {
        let handles: Vec<ConnectionHandle> = self
            .inner
            .run(|state| state.connections.values().cloned().collect());
        if handles.is_empty() {
            return Err(SyncError::NoConnections);
        }

        let (tx, rx) = oneshot::channel();
        let race = Arc::new(Mutex::new(BroadcastRace {
            remaining: handles.len(),
            last_error: None,
            reply: Some(tx),
        }));

        for handle in handles {
            let ok = race.clone();
            let bad = race.clone();
            let task = tasks::broadcast_tx(
                raw_tx,
                move |txid: String| BroadcastRace::succeed(&ok, txid),
                move |error| BroadcastRace::fail(&bad, error),
            );
            if let Err(task) = handle.submit(task) {
                task.fail(StratumError::Closed {
                    uri: handle.uri.clone(),
                });
            }
        }
        drop(race);

        rx.await.unwrap_or(Err(SyncError::NoConnections))
    }

    /// Records a transaction this wallet just created.
    pub fn save_tx(&self, txid: &str, raw_tx: &str) -> Result<(), SyncError> {
        self.inner.run(|state| state.save_tx(txid, raw_tx))
    }

    /// Stores the opaque keys document.
    pub fn save_keys(&self, keys: &Value) -> Result<(), SyncError> {
        let doc = KeysEnvelope { keys: keys.clone() };
        save_document(self.inner.encrypted_folder.as_ref(), KEYS_FILE, &doc)?;
        log::info!("[ENGINE] saved keys");
        Ok(())
    }

    /// The keys document, or an empty object if there is none.
    pub fn load_keys(&self) -> Value {
        load_document::<KeysEnvelope>(self.inner.encrypted_folder.as_ref(), KEYS_FILE)
            .map(|doc| doc.keys)
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    pub fn address_info(&self, script_hash: &str) -> Option<AddressInfo> {
        self.inner
            .run(|state| state.address_infos.get(script_hash).cloned())
    }

    pub fn address_infos(&self) -> BTreeMap<String, AddressInfo> {
        self.inner.run(|state| state.address_infos.clone())
    }

    pub fn script_hash_of(&self, display_address: &str) -> Option<String> {
        self.inner
            .run(|state| state.script_hashes.get(display_address).cloned())
    }

    pub fn balance(&self) -> u64 {
        self.inner
            .run(|state| state.address_infos.values().map(AddressInfo::balance).sum())
    }

    pub fn height(&self) -> u32 {
        self.inner.registry.height()
    }

    /// Wallet view of a cached transaction.
    pub fn transaction(&self, txid: &str) -> Option<WalletTransaction> {
        self.inner.run(|state| WalletTransaction::from_state(state, txid))
    }

    /// Every cached transaction touching the wallet, newest first.
    pub fn transactions(&self) -> Vec<WalletTransaction> {
        self.inner.run(|state| {
            let state = &*state;
            let mut txs: Vec<WalletTransaction> = state
                .tx_cache
                .keys()
                .filter_map(|txid| WalletTransaction::from_state(state, txid))
                .collect();
            txs.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.txid.cmp(&b.txid)));
            txs
        })
    }

    /// Spendable outputs grouped by address, with their confirmation state.
    pub fn spendable_utxos(&self) -> BTreeMap<String, Vec<CandidateUtxo>> {
        self.inner.run(|state| {
            let state = &*state;
            state
                .address_infos
                .iter()
                .filter(|(_, info)| !info.utxos.is_empty())
                .map(|(script_hash, info)| {
                    let candidates = info
                        .utxos
                        .iter()
                        .map(|utxo| CandidateUtxo {
                            utxo: utxo.clone(),
                            confirmed: state
                                .tx_heights
                                .get(&utxo.txid)
                                .is_some_and(|h| h.is_confirmed()),
                        })
                        .collect();
                    (script_hash.clone(), candidates)
                })
                .collect()
        })
    }

    /// Inputs for a spend of `target` at `fee_rate` per vbyte.
    pub fn pick_utxos(&self, target: u64, fee_rate: u64, use_only_confirmed: bool) -> Result<Selection, SyncError> {
        select_utxos(&self.spendable_utxos(), target, fee_rate, use_only_confirmed)
    }

    /// Share of watched addresses whose history is in sync with at least
    /// one server.
    pub fn addresses_checked_ratio(&self) -> f64 {
        self.inner.run(|state| {
            let state = &*state;
            if state.address_cache.is_empty() {
                return 1.0;
            }
            let checked = state
                .address_cache
                .iter()
                .filter(|(script_hash, record)| {
                    state.server_states.values().any(|server| {
                        server.addresses.get(*script_hash).is_some_and(|a| {
                            a.subscribed
                                && a.hash
                                    .as_ref()
                                    .map_or(true, |h| *h == record.txid_stratum_hash)
                        })
                    })
                })
                .count();
            checked as f64 / state.address_cache.len() as f64
        })
    }

    pub fn connection_count(&self) -> usize {
        self.inner.run(|state| state.connections.len())
    }

    #[cfg(test)]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        self.inner.run(f)
    }
}

impl AddressSink for SyncEngine {
    fn add_address(&self, script_hash: &str, display_address: &str, path: &str) {
        SyncEngine::add_address(self, script_hash, display_address, path);
    }

    fn is_used(&self, script_hash: &str) -> bool {
        self.address_info(script_hash).is_some_and(|info| info.used)
    }
}
