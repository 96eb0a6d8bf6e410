//! UTXO coin selection.
//!
//! Two passes over the candidate set: an exact-match ("blackjack") pass that
//! looks for one input covering the target without change, then largest-first
//! accumulation. Confirmed outputs are tried first; unconfirmed ones join only
//! when the caller allows it and the confirmed set falls short.

use std::collections::BTreeMap;

use crate::error::SyncError;
use crate::sync::types::UtxoRef;

/// Outputs below this value are not worth creating.
pub const DUST_THRESHOLD: u64 = 546;

const TX_OVERHEAD_VBYTES: u64 = 10;
const INPUT_VBYTES: u64 = 148;
const OUTPUT_VBYTES: u64 = 34;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateUtxo {
    pub utxo: UtxoRef,
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedUtxo {
    pub script_hash: String,
    pub utxo: UtxoRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub utxos: Vec<SelectedUtxo>,
    pub fee: u64,
    /// Zero when the leftover was below dust and went to the fee.
    pub change: u64,
}

impl Selection {
    pub fn total(&self) -> u64 {
        self.utxos.iter().map(|s| s.utxo.value).sum()
    }
}

/// Estimated fee for a transaction with the given shape. `None` when it
/// does not fit in a `u64`.
pub fn estimate_fee(fee_rate: u64, inputs: usize, outputs: usize) -> Option<u64> {
    let inputs = INPUT_VBYTES.checked_mul(inputs as u64)?;
    let outputs = OUTPUT_VBYTES.checked_mul(outputs as u64)?;
    let vsize = TX_OVERHEAD_VBYTES.checked_add(inputs)?.checked_add(outputs)?;
    fee_rate.checked_mul(vsize)
}

/// Picks inputs paying `target` at `fee_rate` (per vbyte).
///
/// The returned selection always satisfies `total >= target + fee + change`.
pub fn select_utxos(
    utxos_by_address: &BTreeMap<String, Vec<CandidateUtxo>>,
    target: u64,
    fee_rate: u64,
    use_only_confirmed: bool,
) -> Result<Selection, SyncError> {
    let confirmed: Vec<SelectedUtxo> = flatten(utxos_by_address, true);
    if let Some(selection) = select_from(confirmed.clone(), target, fee_rate) {
        return Ok(selection);
    }

    let pool = if use_only_confirmed {
        confirmed
    } else {
        log::debug!("[WALLET] confirmed funds insufficient, retrying with unconfirmed");
        let all = flatten(utxos_by_address, false);
        if let Some(selection) = select_from(all.clone(), target, fee_rate) {
            return Ok(selection);
        }
        all
    };

    let available = pool.iter().fold(0u64, |sum, s| sum.saturating_add(s.utxo.value));
    let fee = estimate_fee(fee_rate, pool.len().max(1), 1).unwrap_or(u64::MAX);
    Err(SyncError::InsufficientFunds {
        needed: target.saturating_add(fee),
        available,
    })
}

fn flatten(
    utxos_by_address: &BTreeMap<String, Vec<CandidateUtxo>>,
    only_confirmed: bool,
) -> Vec<SelectedUtxo> {
    utxos_by_address
        .iter()
        .flat_map(|(script_hash, utxos)| {
            utxos
                .iter()
                .filter(move |c| c.confirmed || !only_confirmed)
                .map(move |c| SelectedUtxo {
                    script_hash: script_hash.clone(),
                    utxo: c.utxo.clone(),
                })
        })
        .collect()
}

fn select_from(mut pool: Vec<SelectedUtxo>, target: u64, fee_rate: u64) -> Option<Selection> {
    // Smallest first, so the exact match wastes as little as possible.
    pool.sort_by(|a, b| {
        a.utxo
            .value
            .cmp(&b.utxo.value)
            .then_with(|| a.utxo.txid.cmp(&b.utxo.txid))
            .then_with(|| a.utxo.index.cmp(&b.utxo.index))
    });

    let single_cost = estimate_fee(fee_rate, 1, 1)?.checked_add(target)?;
    for candidate in &pool {
        let value = candidate.utxo.value;
        if value >= single_cost && value - single_cost < DUST_THRESHOLD {
            return Some(Selection {
                utxos: vec![candidate.clone()],
                fee: value - target,
                change: 0,
            });
        }
    }

    let mut picked = Vec::new();
    let mut total = 0u64;
    for candidate in pool.into_iter().rev() {
        total = total.checked_add(candidate.utxo.value)?;
        picked.push(candidate);

        let no_change_cost = estimate_fee(fee_rate, picked.len(), 1)?.checked_add(target)?;
        if total < no_change_cost {
            continue;
        }

        let change_fee = estimate_fee(fee_rate, picked.len(), 2);
        let change = change_fee
            .and_then(|fee| total.checked_sub(target)?.checked_sub(fee))
            .filter(|change| *change >= DUST_THRESHOLD);
        if let (Some(fee), Some(change)) = (change_fee, change) {
            return Some(Selection {
                utxos: picked,
                fee,
                change,
            });
        }

        return Some(Selection {
            utxos: picked,
            fee: total - target,
            change: 0,
        });
    }

    None
}
