use bitcoin::consensus::Decodable;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::{block, Transaction};

use crate::error::SyncError;
use crate::sync::types::HeaderRecord;

/// Convert script bytes to electrum scripthash hex (little endian).
///
/// Electrum uses the sha256 hash of the script, reversed, represented as hex.
pub fn electrum_scripthash(script: &[u8]) -> String {
    let hash = sha256::Hash::hash(script);
    let mut bytes = hash.to_byte_array();
    bytes.reverse();
    hex::encode(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub prev_txid: String,
    pub prev_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub script_hash: String,
    pub value: u64,
}

/// The parts of a transaction the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTx {
    pub txid: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl ParsedTx {
    pub fn from_transaction(tx: &Transaction) -> Self {
        let inputs = tx
            .input
            .iter()
            .filter(|txin| !txin.previous_output.is_null())
            .map(|txin| TxInput {
                prev_txid: txin.previous_output.txid.to_string(),
                prev_index: txin.previous_output.vout,
            })
            .collect();

        let outputs = tx
            .output
            .iter()
            .map(|txout| TxOutput {
                script_hash: electrum_scripthash(txout.script_pubkey.as_bytes()),
                value: txout.value.to_sat(),
            })
            .collect();

        Self {
            txid: tx.compute_txid().to_string(),
            inputs,
            outputs,
        }
    }

    /// Decodes a raw transaction as sent by `blockchain.transaction.get`.
    pub fn from_hex(raw: &str) -> Result<Self, SyncError> {
        let bytes = hex::decode(raw.trim())
            .map_err(|e| SyncError::InvalidTransaction(format!("bad hex: {}", e)))?;
        let tx = Transaction::consensus_decode(&mut &bytes[..])
            .map_err(|e| SyncError::InvalidTransaction(e.to_string()))?;
        Ok(Self::from_transaction(&tx))
    }

    pub fn spends(&self, txid: &str, index: u32) -> bool {
        self.inputs
            .iter()
            .any(|i| i.prev_txid == txid && i.prev_index == index)
    }
}

/// Decodes an 80-byte block header as sent by `blockchain.block.header`.
pub fn parse_header(raw: &str) -> Result<HeaderRecord, String> {
    let bytes = hex::decode(raw.trim()).map_err(|e| format!("bad header hex: {}", e))?;
    let header = block::Header::consensus_decode(&mut &bytes[..])
        .map_err(|e| format!("bad header: {}", e))?;

    Ok(HeaderRecord {
        timestamp: header.time,
        block_hash: header.block_hash().to_string(),
        prev_block_hash: header.prev_blockhash.to_string(),
        merkle_root: header.merkle_root.to_string(),
        bits: header.bits.to_consensus(),
        nonce: header.nonce,
        version: header.version.to_consensus(),
    })
}
