// Gap limit + derivation tracker

use std::collections::{btree_map, BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use bdk_wallet::miniscript::{Descriptor, DescriptorPublicKey};
use bitcoin::{Address, Network};
use serde::{Deserialize, Serialize};

use crate::sync::domain::parsed_tx::electrum_scripthash;

/// Where derived addresses go, and where their usage is read back from.
///
/// The synchronization engine implements this.
pub trait AddressSink {
    fn add_address(&self, script_hash: &str, display_address: &str, path: &str);

    fn is_used(&self, script_hash: &str) -> bool;
}

/// Key-side collaborator of the engine.
pub trait KeyManager {
    /// Watches enough fresh addresses past the last used one.
    ///
    /// Returns how many addresses were newly registered.
    fn set_look_ahead(&mut self, sink: &dyn AddressSink) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Keychain {
    External,
    Internal,
}

impl Keychain {
    fn branch(&self) -> u32 {
        match self {
            Keychain::External => 0,
            Keychain::Internal => 1,
        }
    }
}

impl fmt::Display for Keychain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Keychain::External => write!(f, "external"),
            Keychain::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub script_hash: String,
    pub display_address: String,
    pub path: String,
}

/// Persisted form of the key manager, stored in the encrypted keys document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysDocument {
    pub descriptors: BTreeMap<Keychain, String>,
    pub gap_limit: u32,
}

/// Derives addresses from output descriptors and keeps a gap-limit window
/// of unused ones registered with the engine.
///
/// Forward map `(keychain, index) -> address`, reverse map
/// `scripthash -> (keychain, index)`.
#[derive(Debug, Clone)]
pub struct DescriptorKeyManager {
    gap_limit: u32,
    network: Network,
    descriptors: BTreeMap<Keychain, Descriptor<DescriptorPublicKey>>,
    derived: BTreeMap<(Keychain, u32), DerivedAddress>,
    derived_rev: HashMap<String, (Keychain, u32)>,
}

impl DescriptorKeyManager {
    pub fn new(gap_limit: u32, network: Network) -> Self {
        Self {
            gap_limit: gap_limit.max(1),
            network,
            descriptors: BTreeMap::new(),
            derived: BTreeMap::new(),
            derived_rev: HashMap::new(),
        }
    }

    pub fn from_keys(keys: &KeysDocument, network: Network) -> Result<Self> {
        let mut manager = Self::new(keys.gap_limit, network);
        for (keychain, descriptor) in &keys.descriptors {
            manager.insert_descriptor_str(*keychain, descriptor)?;
        }
        Ok(manager)
    }

    pub fn to_keys(&self) -> KeysDocument {
        KeysDocument {
            descriptors: self
                .descriptors
                .iter()
                .map(|(k, d)| (*k, d.to_string()))
                .collect(),
            gap_limit: self.gap_limit,
        }
    }

    pub fn insert_descriptor_str(&mut self, keychain: Keychain, descriptor: &str) -> Result<()> {
        let descriptor = Descriptor::<DescriptorPublicKey>::from_str(descriptor)
            .with_context(|| format!("parsing {} descriptor", keychain))?;
        self.insert_descriptor(keychain, descriptor);
        Ok(())
    }

    /// Registers or replaces the descriptor for a keychain.
    ///
    /// Replacing a descriptor forgets every address derived from the old one.
    pub fn insert_descriptor(&mut self, keychain: Keychain, descriptor: Descriptor<DescriptorPublicKey>) {
        log::debug!("[KEYS] {} descriptor: {}", keychain, descriptor);
        if let Some(old) = self.descriptors.insert(keychain, descriptor.clone()) {
            if old != descriptor {
                self.clear_keychain(keychain);
            }
        }
    }

    pub fn index_of(&self, script_hash: &str) -> Option<(Keychain, u32)> {
        self.derived_rev.get(script_hash).copied()
    }

    /// First derived address on `keychain` the engine has not seen used.
    pub fn next_unused(&self, keychain: Keychain, sink: &dyn AddressSink) -> Option<&DerivedAddress> {
        self.derived
            .range((keychain, 0)..=(keychain, u32::MAX))
            .map(|(_, address)| address)
            .find(|address| !sink.is_used(&address.script_hash))
    }

    fn last_used(&self, keychain: Keychain, sink: &dyn AddressSink) -> Option<u32> {
        self.derived
            .range((keychain, 0)..=(keychain, u32::MAX))
            .filter(|(_, address)| sink.is_used(&address.script_hash))
            .map(|((_, index), _)| *index)
            .max()
    }

    /// Derives and stores a single address.
    ///
    /// Returns `None` when it was already tracked.
    fn add_derived(&mut self, keychain: Keychain, index: u32) -> Result<Option<DerivedAddress>> {
        let btree_map::Entry::Vacant(entry) = self.derived.entry((keychain, index)) else {
            return Ok(None);
        };

        let descriptor = self
            .descriptors
            .get(&keychain)
            .ok_or_else(|| anyhow!("no descriptor for {}", keychain))?;

        let spk = descriptor
            .at_derivation_index(index)
            .with_context(|| format!("deriving {} index {}", keychain, index))?
            .script_pubkey();

        let display_address = Address::from_script(&spk, self.network)
            .map(|a| a.to_string())
            .unwrap_or_else(|_| hex::encode(spk.as_bytes()));

        let address = DerivedAddress {
            script_hash: electrum_scripthash(spk.as_bytes()),
            display_address,
            path: format!("m/{}/{}", keychain.branch(), index),
        };

        entry.insert(address.clone());
        self.derived_rev
            .insert(address.script_hash.clone(), (keychain, index));

        Ok(Some(address))
    }

    fn clear_keychain(&mut self, keychain: Keychain) {
        let derived_rev = &mut self.derived_rev;
        self.derived.retain(|(kc, _), address| {
            if *kc == keychain {
                derived_rev.remove(&address.script_hash);
                false
            } else {
                true
            }
        });
    }
}

impl KeyManager for DescriptorKeyManager {
    fn set_look_ahead(&mut self, sink: &dyn AddressSink) -> Result<usize> {
        let keychains: Vec<Keychain> = self.descriptors.keys().copied().collect();
        let mut added = 0;

        for keychain in keychains {
            let wildcard = self
                .descriptors
                .get(&keychain)
                .map(|d| d.has_wildcard())
                .unwrap_or(false);

            // Newly derived addresses may already be used (cached history),
            // which moves the window again.
            loop {
                let end = match self.last_used(keychain, sink) {
                    Some(used) => used + 1 + self.gap_limit,
                    None => self.gap_limit,
                };
                let end = if wildcard { end } else { 1 };

                let mut fresh = Vec::new();
                for index in 0..end {
                    if let Some(address) = self.add_derived(keychain, index)? {
                        fresh.push(address);
                    }
                }

                if fresh.is_empty() {
                    break;
                }
                for address in &fresh {
                    log::trace!("[KEYS] watching {} at {}", address.display_address, address.path);
                    sink.add_address(&address.script_hash, &address.display_address, &address.path);
                }
                added += fresh.len();
            }
        }

        if added > 0 {
            log::info!("[KEYS] {} new addresses under watch", added);
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    const EXTERNAL: &str = "wpkh([73c5da0a/84h/1h/0h]tpubDC8msFGeGuwnKG9Upg7DM2b4DaRqg3CUZa5g8v2SRQ6K4NSkxUgd7HsL2XVWbVm39yBA4LAxysQAm397zwQSQoQgewGiYZqrA9DsP4zbQ1M/0/*)";
    const INTERNAL: &str = "wpkh([73c5da0a/84h/1h/0h]tpubDC8msFGeGuwnKG9Upg7DM2b4DaRqg3CUZa5g8v2SRQ6K4NSkxUgd7HsL2XVWbVm39yBA4LAxysQAm397zwQSQoQgewGiYZqrA9DsP4zbQ1M/1/*)";

    #[derive(Default)]
    struct MockSink {
        added: Mutex<Vec<String>>,
        used: Mutex<BTreeSet<String>>,
    }

    impl MockSink {
        fn mark_used(&self, script_hash: &str) {
            self.used.lock().unwrap().insert(script_hash.to_string());
        }

        fn added_count(&self) -> usize {
            self.added.lock().unwrap().len()
        }
    }

    impl AddressSink for MockSink {
        fn add_address(&self, script_hash: &str, _display_address: &str, _path: &str) {
            self.added.lock().unwrap().push(script_hash.to_string());
        }

        fn is_used(&self, script_hash: &str) -> bool {
            self.used.lock().unwrap().contains(script_hash)
        }
    }

    fn manager(gap_limit: u32) -> DescriptorKeyManager {
        let mut manager = DescriptorKeyManager::new(gap_limit, Network::Testnet);
        manager.insert_descriptor_str(Keychain::External, EXTERNAL).unwrap();
        manager.insert_descriptor_str(Keychain::Internal, INTERNAL).unwrap();
        manager
    }

    fn script_hash_at(manager: &DescriptorKeyManager, keychain: Keychain, index: u32) -> String {
        manager.derived[&(keychain, index)].script_hash.clone()
    }

    #[test]
    fn initial_look_ahead_fills_gap_per_keychain() {
        let mut manager = manager(3);
        let sink = MockSink::default();

        let added = manager.set_look_ahead(&sink).unwrap();

        assert_eq!(added, 6);
        assert_eq!(sink.added_count(), 6);

        let first = &manager.derived[&(Keychain::External, 0)];
        assert!(first.display_address.starts_with("tb1"));
        assert_eq!(first.path, "m/0/0");
        assert_eq!(manager.index_of(&first.script_hash), Some((Keychain::External, 0)));
    }

    #[test]
    fn look_ahead_is_idempotent() {
        let mut manager = manager(2);
        let sink = MockSink::default();

        manager.set_look_ahead(&sink).unwrap();
        let again = manager.set_look_ahead(&sink).unwrap();

        assert_eq!(again, 0);
        assert_eq!(sink.added_count(), 4);
    }

    #[test]
    fn using_an_address_extends_the_window() {
        let mut manager = manager(2);
        let sink = MockSink::default();
        manager.set_look_ahead(&sink).unwrap();

        sink.mark_used(&script_hash_at(&manager, Keychain::External, 1));
        let added = manager.set_look_ahead(&sink).unwrap();

        // Window is now [0 ..= 1 + 2] on the external chain.
        assert_eq!(added, 2);
        assert!(manager.derived.contains_key(&(Keychain::External, 3)));
        assert!(!manager.derived.contains_key(&(Keychain::Internal, 2)));

        let next = manager.next_unused(Keychain::External, &sink).unwrap();
        assert_eq!(next.path, "m/0/0");
    }

    #[test]
    fn used_fresh_addresses_keep_extending() {
        let mut scout = manager(2);
        let sink = MockSink::default();
        // Pre-derive to learn the scripthash at index 2, then mark it used
        // before a fresh manager ever registers it.
        scout.set_look_ahead(&sink).unwrap();
        sink.mark_used(&script_hash_at(&scout, Keychain::External, 1));
        scout.set_look_ahead(&sink).unwrap();
        sink.mark_used(&script_hash_at(&scout, Keychain::External, 3));

        let mut fresh = manager(2);
        let fresh_sink = MockSink::default();
        for used in sink.used.lock().unwrap().iter() {
            fresh_sink.mark_used(used);
        }
        fresh.set_look_ahead(&fresh_sink).unwrap();

        assert!(fresh.derived.contains_key(&(Keychain::External, 5)));
        assert!(!fresh.derived.contains_key(&(Keychain::External, 6)));
    }

    #[test]
    fn changing_descriptor_forgets_old_addresses() {
        let mut manager = manager(2);
        let sink = MockSink::default();
        manager.set_look_ahead(&sink).unwrap();
        let old = script_hash_at(&manager, Keychain::External, 0);

        let replacement = EXTERNAL.replace("84h/1h/0h", "84h/1h/1h");
        manager
            .insert_descriptor_str(Keychain::External, &replacement)
            .unwrap();

        assert_eq!(manager.index_of(&old), None);
        assert!(manager.derived.keys().all(|(kc, _)| *kc == Keychain::Internal));
    }

    #[test]
    fn keys_document_restores_descriptors() {
        let manager = manager(7);
        let doc = manager.to_keys();
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["gapLimit"], 7);

        let restored = DescriptorKeyManager::from_keys(&doc, Network::Testnet).unwrap();
        assert_eq!(restored.to_keys(), doc);
    }

    #[test]
    fn rejects_bad_descriptor() {
        let mut manager = DescriptorKeyManager::new(2, Network::Testnet);
        assert!(manager
            .insert_descriptor_str(Keychain::External, "wpkh(nope)")
            .is_err());
    }
}
