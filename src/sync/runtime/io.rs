use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::SyncConfig;
use crate::sync::electrum::{ConnectionCommand, StratumConnection, StratumIo};
use crate::sync::runtime::driver::{drive, DialSettings};

/// Runs connections and timers as tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioIo {
    handle: Handle,
    settings: DialSettings,
}

impl TokioIo {
    pub fn new(config: &SyncConfig, handle: Handle) -> Self {
        Self {
            handle,
            settings: DialSettings::from_config(config),
        }
    }
}

impl StratumIo for TokioIo {
    fn supports_tcp(&self) -> bool {
        true
    }

    fn supports_tls(&self) -> bool {
        true
    }

    fn open_connection(
        &self,
        connection: StratumConnection,
        commands: UnboundedReceiver<ConnectionCommand>,
    ) {
        self.handle
            .spawn(drive(connection, commands, self.settings.clone()));
    }

    fn start_timer(&self, period: Duration, mut tick: Box<dyn FnMut() -> bool + Send>) {
        self.handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                if !tick() {
                    log::trace!("[DRIVER] timer stopped");
                    return;
                }
            }
        });
    }
}
