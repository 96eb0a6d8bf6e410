use anyhow::{anyhow, Result};
use bitcoin::Network;

pub mod config;
pub mod error;
pub mod persistence;
pub mod sync;

use sync::domain::spk_tracker::{DescriptorKeyManager, Keychain, KeysDocument};
use sync::SyncEngine;

/// Restores the wallet's key manager from the engine's keys document, or
/// creates one from the given descriptors and stores it.
///
/// Descriptors passed in replace stored ones that differ.
pub fn setup_key_manager(
    engine: &SyncEngine,
    descriptor: Option<String>,
    change_descriptor: Option<String>,
    network: Network,
    gap_limit: u32,
) -> Result<DescriptorKeyManager> {
    let stored: Option<KeysDocument> = serde_json::from_value(engine.load_keys()).ok();

    let mut manager = match stored {
        Some(keys) if !keys.descriptors.is_empty() => {
            log::info!("[KEYS] wallet loaded from persistence");
            DescriptorKeyManager::from_keys(&keys, network)?
        }
        _ => {
            log::info!("[KEYS] creating new wallet");
            DescriptorKeyManager::new(gap_limit, network)
        }
    };

    if let Some(descriptor) = &descriptor {
        manager.insert_descriptor_str(Keychain::External, descriptor)?;
    }
    if let Some(change) = &change_descriptor {
        manager.insert_descriptor_str(Keychain::Internal, change)?;
    }

    let keys = manager.to_keys();
    if !keys.descriptors.contains_key(&Keychain::External) {
        return Err(anyhow!("a descriptor is required for a new wallet"));
    }
    engine.save_keys(&serde_json::to_value(&keys)?)?;

    Ok(manager)
}
