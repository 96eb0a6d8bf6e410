use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Height recorded for transactions that are not in a block yet.
pub const UNCONFIRMED_HEIGHT: i64 = -1;

/// An unspent output as reported by `blockchain.scripthash.listunspent`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoRef {
    pub txid: String,
    pub index: u32,
    pub value: u64,
}

/// Raw, server-reported state of one watched address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub txids: Vec<String>,
    pub txid_stratum_hash: String,
    pub utxos: Vec<UtxoRef>,
    pub utxo_stratum_hash: String,
    /// Set by the gap-limit logic through `mark_addresses_used`.
    #[serde(default)]
    pub used: bool,
    pub display_address: String,
    pub path: String,
}

impl AddressRecord {
    pub fn new(display_address: &str, path: &str) -> Self {
        Self {
            txids: Vec::new(),
            txid_stratum_hash: String::new(),
            utxos: Vec::new(),
            utxo_stratum_hash: String::new(),
            used: false,
            display_address: display_address.to_string(),
            path: path.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxHeightRecord {
    pub height: i64,
    /// Unix seconds, used as the date of unconfirmed transactions.
    pub first_seen: u64,
}

impl TxHeightRecord {
    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }
}

/// Wallet-facing view of an address, derived from the raw caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    pub txids: Vec<String>,
    pub utxos: Vec<UtxoRef>,
    pub used: bool,
    pub display_address: String,
    pub path: String,
}

impl AddressInfo {
    pub fn balance(&self) -> u64 {
        self.utxos.iter().map(|u| u.value).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderRecord {
    pub timestamp: u32,
    pub block_hash: String,
    pub prev_block_hash: String,
    pub merkle_root: String,
    pub bits: u32,
    pub nonce: u32,
    pub version: i32,
}

/// Reliability statistics for one server URI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Messages completed with errors.
    pub bad_messages: u32,
    /// Unwanted socket disconnects.
    pub disconnects: u32,
    /// Messages completed successfully.
    pub good_messages: u32,
    /// Average milliseconds per reply.
    pub latency: f64,
    pub version: String,
}

pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Compares dotted protocol versions numerically ("1.10" > "1.4").
///
/// Empty or unparsable versions count as older than anything parsable.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn parts(v: &str) -> Option<Vec<u64>> {
        if v.trim().is_empty() {
            return None;
        }
        v.trim().split('.').map(|p| p.parse::<u64>().ok()).collect()
    }

    match (parts(a), parts(b)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(pa), Some(pb)) => {
            let len = pa.len().max(pb.len());
            for i in 0..len {
                let x = pa.get(i).copied().unwrap_or(0);
                let y = pb.get(i).copied().unwrap_or(0);
                match x.cmp(&y) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            Ordering::Equal
        }
    }
}

pub fn version_is_below(version: &str, threshold: &str) -> bool {
    compare_versions(version, threshold) == Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_compare_numerically() {
        assert!(version_is_below("1.0", "1.1"));
        assert!(version_is_below("1.4", "1.10"));
        assert!(!version_is_below("1.1", "1.1"));
        assert!(!version_is_below("1.1.0", "1.1"));
        assert!(!version_is_below("1.4.2", "1.0.0"));
    }

    #[test]
    fn unknown_versions_are_below_everything() {
        assert!(version_is_below("", "1.0.0"));
        assert!(version_is_below("ElectrumX", "0.1"));
        assert!(!version_is_below("", ""));
    }

    #[test]
    fn address_record_json_uses_camel_case() {
        let record = AddressRecord::new("1Addr", "m/0/0");
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["displayAddress"], "1Addr");
        assert_eq!(json["txidStratumHash"], "");
        assert_eq!(json["used"], false);
    }
}
