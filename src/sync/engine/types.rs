use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::SyncConfig;
use crate::persistence::Folder;
use crate::sync::electrum::StratumIo;
use crate::sync::registry::ServerRegistry;

/// Notifications the engine raises for the embedding application.
///
/// They fire after the engine has released its lock, so implementations may
/// query the engine.
pub trait EngineCallbacks: Send + Sync {
    fn on_address_info_updated(&self, _script_hash: &str) {}

    fn on_height_updated(&self, _height: u32) {}

    /// A transaction arrived, or its confirmation date changed.
    fn on_tx_fetched(&self, _txid: &str) {}
}

pub struct NoopCallbacks;

impl EngineCallbacks for NoopCallbacks {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    AddressInfoUpdated(String),
    HeightUpdated(u32),
    TxFetched(String),
}

/// Forwards engine callbacks into a channel.
pub struct ChannelCallbacks {
    tx: UnboundedSender<SyncEvent>,
}

impl ChannelCallbacks {
    pub fn new(tx: UnboundedSender<SyncEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("[ENGINE] event receiver gone");
        }
    }
}

impl EngineCallbacks for ChannelCallbacks {
    fn on_address_info_updated(&self, script_hash: &str) {
        self.send(SyncEvent::AddressInfoUpdated(script_hash.to_string()));
    }

    fn on_height_updated(&self, height: u32) {
        self.send(SyncEvent::HeightUpdated(height));
    }

    fn on_tx_fetched(&self, txid: &str) {
        self.send(SyncEvent::TxFetched(txid.to_string()));
    }
}

/// Everything a [`super::SyncEngine`] is built from.
pub struct EngineOptions {
    pub config: SyncConfig,
    pub registry: Arc<ServerRegistry>,
    pub io: Arc<dyn StratumIo>,
    /// Holds `addresses.json` and `txs.json`.
    pub folder: Arc<dyn Folder>,
    /// Holds `keys.json`. Written as-is, so the folder does the encrypting.
    pub encrypted_folder: Arc<dyn Folder>,
    pub callbacks: Arc<dyn EngineCallbacks>,
}
