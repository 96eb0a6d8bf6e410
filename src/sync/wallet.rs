//! Wallet-level view on top of the engine: transactions with amounts and
//! dates, and change-only wallet events.

use std::collections::HashMap;

use crate::sync::domain::parsed_tx::ParsedTx;
use crate::sync::domain::spk_tracker::KeyManager;
use crate::sync::engine::state::EngineState;
use crate::sync::engine::{SyncEngine, SyncEvent};
use crate::sync::types::{HeaderRecord, TxHeightRecord, UNCONFIRMED_HEIGHT};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTransaction {
    pub txid: String,
    /// Unix seconds: the block time once confirmed and the header is known,
    /// otherwise when the transaction was first seen.
    pub date: u64,
    /// `-1` while unconfirmed.
    pub block_height: i64,
    /// Net effect on the wallet, in the smallest unit.
    pub native_amount: i64,
    /// Zero unless every input's previous output is known.
    pub network_fee: u64,
    pub our_receive_addresses: Vec<String>,
}

impl WalletTransaction {
    /// Derives the wallet view of `tx`.
    ///
    /// `our_address` maps a scriptHash to its display address when it
    /// belongs to the wallet.
    pub fn derive<'a>(
        tx: &ParsedTx,
        parsed_txs: &HashMap<String, ParsedTx>,
        our_address: impl Fn(&str) -> Option<&'a str>,
        height: Option<TxHeightRecord>,
        header: Option<HeaderRecord>,
    ) -> Self {
        let mut native_amount: i64 = 0;
        let mut our_receive_addresses = Vec::new();
        let mut total_out: u64 = 0;

        for output in &tx.outputs {
            total_out += output.value;
            if let Some(address) = our_address(&output.script_hash) {
                native_amount += output.value as i64;
                if !our_receive_addresses.iter().any(|a| a == address) {
                    our_receive_addresses.push(address.to_string());
                }
            }
        }

        let mut total_in: u64 = 0;
        let mut inputs_known = true;
        for input in &tx.inputs {
            let prev_out = parsed_txs
                .get(&input.prev_txid)
                .and_then(|prev| prev.outputs.get(input.prev_index as usize));
            match prev_out {
                Some(out) => {
                    total_in += out.value;
                    if our_address(&out.script_hash).is_some() {
                        native_amount -= out.value as i64;
                    }
                }
                None => inputs_known = false,
            }
        }

        let network_fee = if inputs_known && !tx.inputs.is_empty() {
            total_in.saturating_sub(total_out)
        } else {
            0
        };

        let block_height = height.map_or(UNCONFIRMED_HEIGHT, |h| h.height);
        let first_seen = height.map_or(0, |h| h.first_seen);
        let date = match header {
            Some(header) if block_height > 0 => header.timestamp as u64,
            _ => first_seen,
        };

        Self {
            txid: tx.txid.clone(),
            date,
            block_height,
            native_amount,
            network_fee,
            our_receive_addresses,
        }
    }

    pub(crate) fn from_state(state: &EngineState, txid: &str) -> Option<Self> {
        let tx = state.parsed_txs.get(txid)?;
        let height = state.tx_heights.get(txid).copied();
        let header = height
            .filter(|h| h.is_confirmed())
            .and_then(|h| state.registry.header(h.height as u32));

        let our_address = |script_hash: &str| {
            state
                .address_cache
                .get(script_hash)
                .map(|record| record.display_address.as_str())
        };
        Some(Self::derive(tx, &state.parsed_txs, our_address, height, header))
    }
}

/// What the wallet layer tells its user.
#[derive(Debug, Clone, PartialEq)]
pub enum WalletEvent {
    BalanceChanged(u64),
    TransactionsChanged(Vec<WalletTransaction>),
    BlockHeightChanged(u32),
    AddressesChecked(f64),
}

/// Turns engine events into wallet events, emitting balance and progress
/// only when they change. Also keeps the key manager's look-ahead topped up
/// as addresses get used.
pub struct WalletMonitor {
    key_manager: Option<Box<dyn KeyManager + Send>>,
    last_balance: Option<u64>,
    last_ratio: Option<f64>,
}

impl WalletMonitor {
    pub fn new(key_manager: Option<Box<dyn KeyManager + Send>>) -> Self {
        Self {
            key_manager,
            last_balance: None,
            last_ratio: None,
        }
    }

    /// Registers the key manager's initial addresses with the engine.
    pub fn start(&mut self, engine: &SyncEngine) -> anyhow::Result<usize> {
        match self.key_manager.as_mut() {
            Some(keys) => keys.set_look_ahead(engine),
            None => Ok(0),
        }
    }

    pub fn handle(&mut self, engine: &SyncEngine, event: SyncEvent) -> Vec<WalletEvent> {
        let mut events = Vec::new();

        match event {
            SyncEvent::AddressInfoUpdated(_) => {
                if let Some(keys) = self.key_manager.as_mut() {
                    match keys.set_look_ahead(engine) {
                        Ok(0) => {}
                        Ok(added) => log::debug!("[WALLET] look-ahead added {} addresses", added),
                        Err(e) => log::warn!("[WALLET] look-ahead failed: {}", e),
                    }
                }

                let balance = engine.balance();
                if self.last_balance != Some(balance) {
                    self.last_balance = Some(balance);
                    log::info!("[WALLET] balance {}", balance);
                    events.push(WalletEvent::BalanceChanged(balance));
                }
            }
            SyncEvent::TxFetched(txid) => {
                if let Some(tx) = engine.transaction(&txid) {
                    events.push(WalletEvent::TransactionsChanged(vec![tx]));
                }
            }
            SyncEvent::HeightUpdated(height) => {
                events.push(WalletEvent::BlockHeightChanged(height));
            }
        }

        let ratio = engine.addresses_checked_ratio();
        if self.last_ratio != Some(ratio) {
            self.last_ratio = Some(ratio);
            events.push(WalletEvent::AddressesChecked(ratio));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::domain::parsed_tx::test_util::{build_tx, script};
    use crate::sync::domain::parsed_tx::electrum_scripthash;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn header(timestamp: u32) -> HeaderRecord {
        HeaderRecord {
            timestamp,
            block_hash: "b".into(),
            prev_block_hash: "p".into(),
            merkle_root: "m".into(),
            bits: 0,
            nonce: 0,
            version: 1,
        }
    }

    #[test]
    fn receive_counts_only_our_outputs() {
        let ours = electrum_scripthash(script(1).as_bytes());
        let tx = ParsedTx::from_transaction(&build_tx(
            &[(Txid::all_zeros(), 7)],
            &[(script(1), 5_000), (script(2), 3_000)],
        ));
        let lookup = |sh: &str| (sh == ours).then_some("addr-1");

        let view = WalletTransaction::derive(
            &tx,
            &HashMap::new(),
            lookup,
            Some(TxHeightRecord {
                height: 100,
                first_seen: 50,
            }),
            Some(header(1_600_000_000)),
        );

        assert_eq!(view.native_amount, 5_000);
        assert_eq!(view.our_receive_addresses, vec!["addr-1".to_string()]);
        assert_eq!(view.network_fee, 0, "input value unknown");
        assert_eq!(view.block_height, 100);
        assert_eq!(view.date, 1_600_000_000);
    }

    #[test]
    fn spend_subtracts_inputs_and_reports_fee() {
        let ours = electrum_scripthash(script(1).as_bytes());
        let funding = build_tx(&[(Txid::all_zeros(), 0)], &[(script(1), 10_000)]);
        let funding_parsed = ParsedTx::from_transaction(&funding);
        let spend = ParsedTx::from_transaction(&build_tx(
            &[(funding.compute_txid(), 0)],
            &[(script(9), 7_000), (script(1), 2_500)],
        ));

        let mut parsed = HashMap::new();
        parsed.insert(funding_parsed.txid.clone(), funding_parsed);

        let lookup = |sh: &str| (sh == ours).then_some("addr-1");
        let view = WalletTransaction::derive(
            &spend,
            &parsed,
            lookup,
            Some(TxHeightRecord {
                height: UNCONFIRMED_HEIGHT,
                first_seen: 1234,
            }),
            Some(header(99)),
        );

        assert_eq!(view.native_amount, 2_500 - 10_000);
        assert_eq!(view.network_fee, 500);
        assert_eq!(view.block_height, -1);
        assert_eq!(view.date, 1234, "unconfirmed uses first seen");
    }
}
