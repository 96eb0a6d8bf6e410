//! Scheduling and derivation.
//!
//! `pick_next_task` hands a connection with spare queue space at most one
//! task, in strict priority order:
//!
//! 1. fetch the server version if unknown
//! 2. subscribe to the chain height
//! 3. stop here until the version is known; drop servers that are too old
//! 4. missing block headers
//! 5. missing transactions
//! 6. utxos of addresses whose status changed, on their best server
//! 7. subscribe addresses
//! 8. history of addresses whose status changed, on their best server

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Weak;

use crate::error::StratumError;
use crate::sync::domain::parsed_tx::{parse_header, ParsedTx};
use crate::sync::electrum::tasks::{self, HistoryRow, UtxoRow};
use crate::sync::electrum::StratumTask;
use crate::sync::engine::state::{AddressState, Effect, EngineState, ServerState};
use crate::sync::engine::EngineInner;
use crate::sync::types::{version_is_below, AddressInfo, AddressRecord, TxHeightRecord, UtxoRef};

/// Builds continuations that re-enter the engine for one connection.
struct TaskContext {
    engine: Weak<EngineInner>,
    uri: String,
    id: u64,
}

impl TaskContext {
    fn done<T, F>(&self, f: F) -> impl FnOnce(T) + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineState, &str, u64, T) + Send + 'static,
    {
        let engine = self.engine.clone();
        let uri = self.uri.clone();
        let id = self.id;
        move |value: T| {
            if let Some(engine) = engine.upgrade() {
                engine.run(|state| f(state, &uri, id, value));
            }
        }
    }

    /// Runs `cleanup`, then applies the default failure policy.
    fn fail<F>(&self, what: &'static str, cleanup: F) -> impl FnOnce(StratumError) + Send + 'static
    where
        F: FnOnce(&mut EngineState, &str, u64) + Send + 'static,
    {
        self.done(move |state, uri, id, error: StratumError| {
            cleanup(state, uri, id);
            on_task_failed(state, uri, id, error, what);
        })
    }
}

/// Timeouts and closed connections only release the in-flight flag; the
/// next scheduling pass redrives the work. Anything else closes the
/// connection.
pub fn on_task_failed(state: &mut EngineState, uri: &str, id: u64, error: StratumError, what: &str) {
    if error.is_transient() {
        log::debug!("[ENGINE] {} {} failed: {}", uri, what, error);
        return;
    }
    log::info!("[ENGINE] {} failed while {}: {}", uri, what, error);
    state.close_connection(uri, id, Some(error));
}

/// The connection whose status for `script_hash` is the most recent.
pub fn find_best_server<'a>(state: &'a EngineState, script_hash: &str) -> Option<&'a str> {
    let mut best_time = 0;
    let mut best_uri = None;
    for uri in state.connections.keys() {
        let time = state
            .server_states
            .get(uri)
            .and_then(|s| s.addresses.get(script_hash))
            .map_or(0, |a| a.last_update);
        if time > best_time {
            best_time = time;
            best_uri = Some(uri.as_str());
        }
    }
    best_uri
}

/// A server that listed the txid owns its fetch; if nobody did, anyone may try.
/// A server that already failed to send it is never asked again.
pub fn server_can_get_tx(state: &EngineState, uri: &str, txid: &str) -> bool {
    if state
        .server_states
        .get(uri)
        .is_some_and(|s| s.unavailable_txs.contains(txid))
    {
        return false;
    }
    server_can_get(state, uri, |s| s.txids.contains(txid) && !s.unavailable_txs.contains(txid))
}

pub fn server_can_get_header(state: &EngineState, uri: &str, height: u32) -> bool {
    server_can_get(state, uri, |s| s.heights.contains(&height))
}

fn server_can_get(
    state: &EngineState,
    uri: &str,
    knows: impl Fn(&ServerState) -> bool,
) -> bool {
    if state.server_states.get(uri).is_some_and(&knows) {
        return true;
    }
    !state
        .connections
        .keys()
        .filter_map(|other| state.server_states.get(other))
        .any(knows)
}

/// The derived view of one address.
///
/// Pure: the same record and caches always give the same result.
pub fn derive_address_info(
    script_hash: &str,
    record: &AddressRecord,
    marked_used: bool,
    tx_cache: &BTreeMap<String, String>,
    parsed_txs: &HashMap<String, ParsedTx>,
    tx_heights: &BTreeMap<String, TxHeightRecord>,
) -> AddressInfo {
    let used = marked_used || record.used || !record.txids.is_empty() || !record.utxos.is_empty();

    let txids: Vec<String> = record
        .txids
        .iter()
        .filter(|txid| tx_cache.contains_key(*txid))
        .cloned()
        .collect();

    let spent: HashSet<(&str, u32)> = txids
        .iter()
        .filter_map(|txid| parsed_txs.get(txid))
        .flat_map(|tx| tx.inputs.iter())
        .map(|input| (input.prev_txid.as_str(), input.prev_index))
        .collect();

    let mut seen: HashSet<(String, u32)> = HashSet::new();
    let mut utxos = Vec::new();

    for utxo in &record.utxos {
        if tx_cache.contains_key(&utxo.txid)
            && !spent.contains(&(utxo.txid.as_str(), utxo.index))
            && seen.insert((utxo.txid.clone(), utxo.index))
        {
            utxos.push(utxo.clone());
        }
    }

    // Outputs of our own pending transactions, which the server may not
    // list as unspent yet.
    for txid in &txids {
        let pending = tx_heights.get(txid).map_or(true, |h| !h.is_confirmed());
        if !pending {
            continue;
        }
        let Some(tx) = parsed_txs.get(txid) else {
            continue;
        };
        for (index, output) in tx.outputs.iter().enumerate() {
            let index = index as u32;
            if output.script_hash == script_hash
                && !spent.contains(&(txid.as_str(), index))
                && seen.insert((txid.clone(), index))
            {
                utxos.push(UtxoRef {
                    txid: txid.clone(),
                    index,
                    value: output.value,
                });
            }
        }
    }

    AddressInfo {
        txids,
        utxos,
        used,
        display_address: record.display_address.clone(),
        path: record.path.clone(),
    }
}

fn declare_rows<'a>(state: &mut EngineState, uri: &str, id: u64, rows: impl Iterator<Item = (&'a str, i64)>) {
    if let Some(server) = state.server_mut(uri, id) {
        for (txid, height) in rows {
            server.txids.insert(txid.to_string());
            if height > 0 {
                server.heights.insert(height as u32);
            }
        }
    }
}

fn address_state<'a>(state: &'a mut EngineState, uri: &str, id: u64, script_hash: &str) -> Option<&'a mut AddressState> {
    state
        .server_mut(uri, id)
        .and_then(|s| s.addresses.get_mut(script_hash))
}

/// Picks the single next task for the connection `uri`, or nothing.
pub(crate) fn pick_next_task(
    state: &mut EngineState,
    uri: &str,
    id: u64,
    engine: &Weak<EngineInner>,
) -> Option<StratumTask> {
    let ctx = TaskContext {
        engine: engine.clone(),
        uri: uri.to_string(),
        id,
    };
    let min_version = state.config.min_protocol_version.clone();
    let client_name = state.config.client_name.clone();
    let protocol_version = state.config.protocol_version.clone();

    let server = state.server_mut(uri, id)?;

    if server.version.is_none() && !server.fetching_version {
        server.fetching_version = true;
        return Some(tasks::fetch_version(
            &client_name,
            &protocol_version,
            ctx.done(|state, uri, id, version: String| {
                if let Some(server) = state.server_mut(uri, id) {
                    server.fetching_version = false;
                    server.version = Some(version);
                }
            }),
            ctx.fail("getting version", |state, uri, id| {
                if let Some(server) = state.server_mut(uri, id) {
                    server.fetching_version = false;
                }
            }),
        ));
    }

    if server.height.is_none() && !server.fetching_height {
        server.fetching_height = true;
        return Some(tasks::subscribe_height(
            ctx.done(|state, uri, id, height: u32| {
                log::debug!("[ENGINE] {} is at height {}", uri, height);
                if let Some(server) = state.server_mut(uri, id) {
                    server.fetching_height = false;
                    server.height = Some(height);
                }
                state.effects.push(Effect::RegistryHeight(height));
            }),
            ctx.fail("subscribing to height", |state, uri, id| {
                if let Some(server) = state.server_mut(uri, id) {
                    server.fetching_height = false;
                }
            }),
        ));
    }

    let version = server.version.clone()?;
    if version_is_below(&version, &min_version) {
        log::info!("[ENGINE] {} speaks {}, below {}", uri, version, min_version);
        let error = StratumError::protocol(uri, format!("protocol {} is too old", version));
        state.close_connection(uri, id, Some(error));
        return None;
    }

    // Headers.
    let header = state
        .missing_headers
        .iter()
        .copied()
        .find(|h| !state.fetching_headers.contains(h) && server_can_get_header(state, uri, *h));
    if let Some(height) = header {
        state.fetching_headers.insert(height);
        return Some(tasks::fetch_block_header(
            height,
            ctx.done(move |state, uri, id, raw: String| match parse_header(&raw) {
                Ok(header) => {
                    state.handle_header_fetch(height, header);
                }
                Err(e) => {
                    state.fetching_headers.remove(&height);
                    state.close_connection(uri, id, Some(StratumError::protocol(uri, e)));
                }
            }),
            ctx.fail("getting header", move |state, _, _| {
                state.fetching_headers.remove(&height);
            }),
        ));
    }

    // Transactions.
    let txid = state
        .missing_txs
        .iter()
        .find(|t| !state.fetching_txs.contains(*t) && server_can_get_tx(state, uri, t))
        .cloned();
    if let Some(txid) = txid {
        state.fetching_txs.insert(txid.clone());
        let failed_txid = txid.clone();
        return Some(tasks::fetch_transaction(
            &txid.clone(),
            ctx.done(move |state, uri, id, raw: String| {
                state.fetching_txs.remove(&txid);
                match state.handle_tx_fetch(&txid, &raw) {
                    Ok(()) => log::debug!("[ENGINE] {} sent tx {}", uri, txid),
                    Err(e) => {
                        let error = StratumError::protocol(uri, e.to_string());
                        state.close_connection(uri, id, Some(error));
                    }
                }
            }),
            ctx.done(move |state, uri, id, error: StratumError| {
                state.fetching_txs.remove(&failed_txid);
                let listed = state
                    .server_mut(uri, id)
                    .is_some_and(|s| s.txids.contains(&failed_txid));
                if !listed {
                    on_task_failed(state, uri, id, error, "getting transaction");
                    return;
                }
                // It did list the tx; stop asking it instead of penalizing it.
                log::debug!("[ENGINE] {} could not supply {}: {}", uri, failed_txid, error);
                if !error.is_transient() {
                    if let Some(server) = state.server_mut(uri, id) {
                        server.unavailable_txs.insert(failed_txid);
                    }
                }
            }),
        ));
    }

    // Utxos.
    if let Some((script_hash, hash)) = changed_address(state, uri, |record| &record.utxo_stratum_hash, |a| a.fetching_utxos) {
        if let Some(address) = address_state(state, uri, id, &script_hash) {
            address.fetching_utxos = true;
        }
        let failed = script_hash.clone();
        return Some(tasks::fetch_utxos(
            &script_hash.clone(),
            ctx.done(move |state, uri, id, rows: Vec<UtxoRow>| {
                if let Some(address) = address_state(state, uri, id, &script_hash) {
                    address.fetching_utxos = false;
                }
                declare_rows(state, uri, id, rows.iter().map(|r| (r.tx_hash.as_str(), r.height)));
                state.handle_utxo_fetch(&script_hash, &hash, &rows);
            }),
            ctx.fail("fetching utxos", move |state, uri, id| {
                if let Some(address) = address_state(state, uri, id, &failed) {
                    address.fetching_utxos = false;
                }
            }),
        ));
    }

    // Subscriptions.
    let unsubscribed = state.address_cache.keys().find(|sh| {
        state
            .server_states
            .get(uri)
            .and_then(|s| s.addresses.get(*sh))
            .is_some_and(|a| !a.subscribed && !a.subscribing)
    });
    if let Some(script_hash) = unsubscribed.cloned() {
        if let Some(address) = address_state(state, uri, id, &script_hash) {
            address.subscribing = true;
        }
        let failed = script_hash.clone();
        return Some(tasks::subscribe_script_hash(
            &script_hash.clone(),
            ctx.done(move |state, uri, id, status: Option<String>| {
                let stamp = state.next_stamp();
                if let Some(address) = address_state(state, uri, id, &script_hash) {
                    address.subscribing = false;
                    address.subscribed = true;
                    address.hash = status;
                    address.last_update = stamp;
                }
            }),
            ctx.fail("subscribing to address", move |state, uri, id| {
                if let Some(address) = address_state(state, uri, id, &failed) {
                    address.subscribing = false;
                }
            }),
        ));
    }

    // History.
    if let Some((script_hash, hash)) = changed_address(state, uri, |record| &record.txid_stratum_hash, |a| a.fetching_txids) {
        if let Some(address) = address_state(state, uri, id, &script_hash) {
            address.fetching_txids = true;
        }
        let failed = script_hash.clone();
        return Some(tasks::fetch_history(
            &script_hash.clone(),
            ctx.done(move |state, uri, id, history: Vec<HistoryRow>| {
                if let Some(address) = address_state(state, uri, id, &script_hash) {
                    address.fetching_txids = false;
                }
                declare_rows(state, uri, id, history.iter().map(|r| (r.tx_hash.as_str(), r.height)));
                state.handle_history_fetch(&script_hash, &hash, &history);
            }),
            ctx.fail("getting history", move |state, uri, id| {
                if let Some(address) = address_state(state, uri, id, &failed) {
                    address.fetching_txids = false;
                }
            }),
        ));
    }

    None
}

/// First address whose status on this server differs from the cached
/// watermark, is not being fetched, and is owned by this server. Returns the
/// address and the status the fetch will be recorded under.
fn changed_address(
    state: &EngineState,
    uri: &str,
    watermark: impl Fn(&AddressRecord) -> &String,
    fetching: impl Fn(&AddressState) -> bool,
) -> Option<(String, String)> {
    let server = state.server_states.get(uri)?;
    state.address_cache.iter().find_map(|(script_hash, record)| {
        let address = server.addresses.get(script_hash)?;
        let hash = address.hash.as_ref()?;
        if hash == watermark(record) || fetching(address) {
            return None;
        }
        if find_best_server(state, script_hash) != Some(uri) {
            return None;
        }
        Some((script_hash.clone(), hash.clone()))
    })
}
