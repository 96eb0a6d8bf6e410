//! Cache mutations: fetch results, locally saved transactions, load and
//! save. Every path that changes an address record ends in
//! `refresh_address_info`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::Serialize;

use crate::error::SyncError;
use crate::persistence::{load_document, save_document, LazyFlush, ADDRESSES_FILE, TXS_FILE};
use crate::sync::domain::parsed_tx::ParsedTx;
use crate::sync::electrum::tasks::{HistoryRow, UtxoRow};
use crate::sync::engine::logic::derive_address_info;
use crate::sync::engine::state::{AddressState, AddressesDocument, EngineState, TxsDocument};
use crate::sync::engine::types::SyncEvent;
use crate::sync::types::{
    unix_time, AddressRecord, HeaderRecord, TxHeightRecord, UtxoRef, UNCONFIRMED_HEIGHT,
};

#[derive(Serialize)]
struct AddressesView<'a> {
    addresses: &'a BTreeMap<String, AddressRecord>,
    heights: &'a BTreeMap<String, TxHeightRecord>,
}

#[derive(Serialize)]
struct TxsView<'a> {
    txs: &'a BTreeMap<String, String>,
}

/// Servers report 0 (and -1 for unconfirmed parents) for mempool entries.
pub fn normalise_height(height: i64) -> i64 {
    if height <= 0 {
        UNCONFIRMED_HEIGHT
    } else {
        height
    }
}

impl EngineState {
    /// Starts watching an address. Returns false if it was already known.
    pub fn add_address(&mut self, script_hash: &str, display_address: &str, path: &str) -> bool {
        if self.address_cache.contains_key(script_hash) {
            return false;
        }

        log::debug!("[ENGINE] watching {} ({} at {})", script_hash, display_address, path);
        self.address_cache.insert(
            script_hash.to_string(),
            AddressRecord::new(display_address, path),
        );
        self.script_hashes
            .insert(display_address.to_string(), script_hash.to_string());
        self.track_on_servers(script_hash);
        self.refresh_address_info(script_hash);
        self.dirty_address_cache();
        self.wake_all();
        true
    }

    pub fn mark_addresses_used<S: AsRef<str>>(&mut self, script_hashes: &[S]) {
        for script_hash in script_hashes {
            let script_hash = script_hash.as_ref();
            self.used_addresses.insert(script_hash.to_string());
            if let Some(record) = self.address_cache.get_mut(script_hash) {
                if !record.used {
                    record.used = true;
                    self.address_flush.mark_dirty(Instant::now());
                }
            }
            self.refresh_address_info(script_hash);
        }
    }

    fn track_on_servers(&mut self, script_hash: &str) {
        for server in self.server_states.values_mut() {
            server
                .addresses
                .entry(script_hash.to_string())
                .or_insert_with(AddressState::default);
        }
    }

    /// A server sent the history of an address.
    pub fn handle_history_fetch(&mut self, script_hash: &str, state_hash: &str, history: &[HistoryRow]) {
        if !self.address_cache.contains_key(script_hash) {
            log::warn!("[ENGINE] history for unknown address {}", script_hash);
            return;
        }

        let mut txids = Vec::with_capacity(history.len());
        for row in history {
            if !txids.contains(&row.tx_hash) {
                txids.push(row.tx_hash.clone());
            }
            self.handle_txid_fetch(&row.tx_hash, row.height);
        }

        if let Some(record) = self.address_cache.get_mut(script_hash) {
            record.txids = txids;
            record.txid_stratum_hash = state_hash.to_string();
        }
        self.refresh_address_info(script_hash);
        self.dirty_address_cache();
    }

    /// A server sent the unspent outputs of an address.
    pub fn handle_utxo_fetch(&mut self, script_hash: &str, state_hash: &str, rows: &[UtxoRow]) {
        if !self.address_cache.contains_key(script_hash) {
            log::warn!("[ENGINE] utxos for unknown address {}", script_hash);
            return;
        }

        let mut utxos: Vec<UtxoRef> = Vec::with_capacity(rows.len());
        for row in rows {
            let utxo = UtxoRef {
                txid: row.tx_hash.clone(),
                index: row.tx_pos,
                value: row.value,
            };
            if !utxos.contains(&utxo) {
                utxos.push(utxo);
            }
            self.handle_txid_fetch(&row.tx_hash, row.height);
        }

        if let Some(record) = self.address_cache.get_mut(script_hash) {
            record.utxos = utxos;
            record.utxo_stratum_hash = state_hash.to_string();
        }
        self.refresh_address_info(script_hash);
        self.dirty_address_cache();
    }

    /// Records the height a server reported for a txid.
    pub fn handle_txid_fetch(&mut self, txid: &str, height: i64) {
        let height = normalise_height(height);

        match self.tx_heights.get_mut(txid) {
            Some(record) => {
                if record.height != height {
                    record.height = height;
                    if self.tx_cache.contains_key(txid) {
                        self.notify(SyncEvent::TxFetched(txid.to_string()));
                    }
                }
            }
            None => {
                self.tx_heights.insert(
                    txid.to_string(),
                    TxHeightRecord {
                        height,
                        first_seen: unix_time(),
                    },
                );
            }
        }

        if height > 0 {
            self.want_header(height as u32);
        }
        self.handle_new_txid(txid);
    }

    pub fn handle_new_txid(&mut self, txid: &str) {
        if !self.tx_cache.contains_key(txid) && self.missing_txs.insert(txid.to_string()) {
            log::trace!("[ENGINE] missing tx {}", txid);
        }
    }

    fn want_header(&mut self, height: u32) {
        if self.registry.header(height).is_none() {
            self.missing_headers.insert(height);
        }
    }

    /// A server sent a raw transaction.
    pub fn handle_tx_fetch(&mut self, txid: &str, raw_tx: &str) -> Result<(), SyncError> {
        let parsed = ParsedTx::from_hex(raw_tx)?;
        if parsed.txid != txid {
            return Err(SyncError::InvalidTransaction(format!(
                "asked for {} but got {}",
                txid, parsed.txid
            )));
        }

        self.tx_cache.insert(txid.to_string(), raw_tx.trim().to_string());
        self.missing_txs.remove(txid);

        let touched = self.touched_addresses(&parsed);
        self.parsed_txs.insert(txid.to_string(), parsed);
        self.dirty_tx_cache();

        for script_hash in touched {
            self.refresh_address_info(&script_hash);
        }
        self.notify(SyncEvent::TxFetched(txid.to_string()));
        Ok(())
    }

    /// Watched addresses a transaction pays, spends from, or is listed by.
    fn touched_addresses(&self, parsed: &ParsedTx) -> BTreeSet<String> {
        let mut touched = BTreeSet::new();

        for output in &parsed.outputs {
            if self.address_cache.contains_key(&output.script_hash) {
                touched.insert(output.script_hash.clone());
            }
        }

        for input in &parsed.inputs {
            let prev_out = self
                .parsed_txs
                .get(&input.prev_txid)
                .and_then(|prev| prev.outputs.get(input.prev_index as usize));
            if let Some(out) = prev_out {
                if self.address_cache.contains_key(&out.script_hash) {
                    touched.insert(out.script_hash.clone());
                }
            }
        }

        for (script_hash, record) in &self.address_cache {
            let listed = record.txids.iter().any(|t| *t == parsed.txid)
                || record.utxos.iter().any(|u| u.txid == parsed.txid);
            if listed {
                touched.insert(script_hash.clone());
            }
        }

        touched
    }

    /// A server sent a block header we were missing.
    pub fn handle_header_fetch(&mut self, height: u32, header: HeaderRecord) {
        self.fetching_headers.remove(&height);
        self.missing_headers.remove(&height);

        if !self.registry.insert_header(height, header) {
            log::trace!("[ENGINE] header {} already known", height);
        }

        // These transactions just got their block date.
        let dated: Vec<String> = self
            .tx_heights
            .iter()
            .filter(|(txid, record)| record.height == height as i64 && self.tx_cache.contains_key(*txid))
            .map(|(txid, _)| txid.clone())
            .collect();
        for txid in dated {
            self.notify(SyncEvent::TxFetched(txid));
        }
    }

    /// Records a transaction this wallet created, before any server
    /// reports it.
    pub fn save_tx(&mut self, txid: &str, raw_tx: &str) -> Result<(), SyncError> {
        let parsed = ParsedTx::from_hex(raw_tx)?;
        if parsed.txid != txid {
            return Err(SyncError::InvalidTransaction(format!(
                "txid {} does not match transaction {}",
                txid, parsed.txid
            )));
        }

        let mut affected = BTreeSet::new();
        for input in &parsed.inputs {
            if let Some(out) = self
                .parsed_txs
                .get(&input.prev_txid)
                .and_then(|prev| prev.outputs.get(input.prev_index as usize))
            {
                affected.insert(out.script_hash.clone());
            }
        }
        for output in &parsed.outputs {
            affected.insert(output.script_hash.clone());
        }

        for script_hash in &affected {
            if let Some(record) = self.address_cache.get_mut(script_hash) {
                if !record.txids.iter().any(|t| t == txid) {
                    record.txids.push(txid.to_string());
                }
            }
        }

        self.handle_txid_fetch(txid, UNCONFIRMED_HEIGHT);
        self.handle_tx_fetch(txid, raw_tx)?;
        self.dirty_address_cache();
        log::info!("[ENGINE] saved local tx {}", txid);
        Ok(())
    }

    /// Recomputes the derived view of one address from the raw caches.
    pub fn refresh_address_info(&mut self, script_hash: &str) {
        let Some(record) = self.address_cache.get(script_hash) else {
            return;
        };

        let info = derive_address_info(
            script_hash,
            record,
            self.used_addresses.contains(script_hash),
            &self.tx_cache,
            &self.parsed_txs,
            &self.tx_heights,
        );
        self.address_infos.insert(script_hash.to_string(), info);
        self.notify(SyncEvent::AddressInfoUpdated(script_hash.to_string()));
    }

    /// Loads the transaction cache, then the address cache. A document that
    /// cannot be read starts over empty and gets resynced from the servers.
    pub fn load(&mut self) {
        let txs: Option<TxsDocument> = load_document(self.folder.as_ref(), TXS_FILE);
        if let Some(doc) = txs {
            for (txid, raw) in doc.txs {
                match ParsedTx::from_hex(&raw) {
                    Ok(parsed) if parsed.txid == txid => {
                        self.parsed_txs.insert(txid.clone(), parsed);
                        self.tx_cache.insert(txid, raw);
                    }
                    _ => log::warn!("[ENGINE] dropping unreadable cached tx {}", txid),
                }
            }
        }

        // Needs the transactions in place for the txid filtering.
        let addresses: Option<AddressesDocument> = load_document(self.folder.as_ref(), ADDRESSES_FILE);
        let Some(doc) = addresses else {
            log::info!("[ENGINE] no address cache, full resync");
            return;
        };

        for (txid, record) in doc.heights {
            self.tx_heights.entry(txid).or_insert(record);
        }

        let mut loaded = Vec::new();
        for (script_hash, record) in doc.addresses {
            if self.address_cache.contains_key(&script_hash) {
                continue;
            }
            self.address_cache.insert(script_hash.clone(), record);
            loaded.push(script_hash);
        }

        for script_hash in &loaded {
            let Some(record) = self.address_cache.get(script_hash) else {
                continue;
            };
            let txids: Vec<String> = record
                .txids
                .iter()
                .chain(record.utxos.iter().map(|u| &u.txid))
                .cloned()
                .collect();
            if record.used {
                self.used_addresses.insert(script_hash.clone());
            }
            self.script_hashes
                .insert(record.display_address.clone(), script_hash.clone());

            for txid in txids {
                self.handle_new_txid(&txid);
            }
            self.track_on_servers(script_hash);
            self.refresh_address_info(script_hash);
        }

        let confirmed: Vec<u32> = self
            .tx_heights
            .values()
            .filter(|r| r.is_confirmed())
            .map(|r| r.height as u32)
            .collect();
        for height in confirmed {
            self.want_header(height);
        }

        log::info!(
            "[ENGINE] loaded {} addresses, {} txs, {} missing",
            self.address_cache.len(),
            self.tx_cache.len(),
            self.missing_txs.len()
        );
    }

    pub fn dirty_address_cache(&mut self) {
        if self.address_flush.mark_dirty(Instant::now()) {
            self.save_address_cache();
        }
    }

    pub fn dirty_tx_cache(&mut self) {
        if self.tx_flush.mark_dirty(Instant::now()) {
            self.save_tx_cache();
        }
    }

    /// Saves the caches that are due, or every dirty one when `force` is set.
    pub fn flush(&mut self, force: bool) {
        let now = Instant::now();
        let due = |flush: &LazyFlush| {
            if force {
                flush.is_dirty()
            } else {
                flush.is_due(now)
            }
        };

        if due(&self.address_flush) {
            self.save_address_cache();
        }
        if due(&self.tx_flush) {
            self.save_tx_cache();
        }
    }

    fn save_address_cache(&mut self) {
        let doc = AddressesView {
            addresses: &self.address_cache,
            heights: &self.tx_heights,
        };
        match save_document(self.folder.as_ref(), ADDRESSES_FILE, &doc) {
            Ok(()) => self.address_flush.mark_saved(Instant::now()),
            Err(e) => log::warn!("[ENGINE] saving address cache failed: {}", e),
        }
    }

    fn save_tx_cache(&mut self) {
        let doc = TxsView { txs: &self.tx_cache };
        match save_document(self.folder.as_ref(), TXS_FILE, &doc) {
            Ok(()) => self.tx_flush.mark_saved(Instant::now()),
            Err(e) => log::warn!("[ENGINE] saving tx cache failed: {}", e),
        }
    }
}
