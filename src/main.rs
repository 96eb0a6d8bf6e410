use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bitcoin::Network;
use clap::Parser;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use stratum_sync::config::SyncConfig;
use stratum_sync::persistence::DiskFolder;
use stratum_sync::setup_key_manager;
use stratum_sync::sync::engine::ChannelCallbacks;
use stratum_sync::sync::{
    EngineOptions, ServerRegistry, SyncEngine, TokioIo, WalletEvent, WalletMonitor,
};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "testnet")]
    network: Network,

    /// Receive descriptor. Only needed the first time.
    #[arg(long)]
    descriptor: Option<String>,

    #[arg(long)]
    change_descriptor: Option<String>,

    /// Extra server URI, e.g. electrums://host:50002. May be repeated.
    #[arg(long = "server")]
    servers: Vec<String>,

    #[arg(long, default_value = "stratum-data")]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 20)]
    gap_limit: u32,

    /// JSON file overriding the sync tunables.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop once every address has been checked.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SyncConfig::from_file(path, args.network)?,
        None => SyncConfig::for_network(args.network),
    };

    let root = DiskFolder::new(args.data_dir.join(args.network.to_string()));
    let registry = Arc::new(ServerRegistry::new(Arc::new(root.folder("registry")), config.clone()));
    registry.load();
    if let Err(e) = registry.fetch_servers().await {
        log::warn!("[MAIN] {}", e);
    }
    if !args.servers.is_empty() {
        let added = registry.insert_servers(args.servers.as_slice());
        log::info!("[MAIN] {} new servers", added);
    }

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let wallet_folder = root.folder("wallet");
    let engine = SyncEngine::new(EngineOptions {
        io: Arc::new(TokioIo::new(&config, Handle::current())),
        config,
        registry: registry.clone(),
        folder: Arc::new(wallet_folder.clone()),
        // DiskFolder stores plain JSON; point this at an encrypting folder to
        // keep the descriptors private.
        encrypted_folder: Arc::new(wallet_folder.folder("keys")),
        callbacks: Arc::new(ChannelCallbacks::new(events_tx)),
    });
    engine.load();

    let keys = setup_key_manager(
        &engine,
        args.descriptor.clone(),
        args.change_descriptor.clone(),
        args.network,
        args.gap_limit,
    )?;
    let mut monitor = WalletMonitor::new(Some(Box::new(keys)));
    let watched = monitor.start(&engine)?;
    println!("[MAIN] watching {} addresses", watched);

    engine.connect();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let mut checked = false;
                for wallet_event in monitor.handle(&engine, event) {
                    match wallet_event {
                        WalletEvent::BalanceChanged(balance) => {
                            println!("[MAIN] balance: {} sats", balance);
                        }
                        WalletEvent::TransactionsChanged(txs) => {
                            for tx in txs {
                                println!(
                                    "[MAIN] tx {} amount {} fee {} height {}",
                                    tx.txid, tx.native_amount, tx.network_fee, tx.block_height
                                );
                            }
                        }
                        WalletEvent::BlockHeightChanged(height) => {
                            println!("[MAIN] block height: {}", height);
                        }
                        WalletEvent::AddressesChecked(ratio) => {
                            println!("[MAIN] addresses checked: {:.0}%", ratio * 100.0);
                            checked = ratio >= 1.0;
                        }
                    }
                }
                if args.once && checked {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("[MAIN] interrupted");
                break;
            }
        }
    }

    println!("-----------------------------------");
    println!("Total Balance:    {} sats", engine.balance());
    println!("Transactions:     {}", engine.transactions().len());
    println!("Block Height:     {}", engine.height());
    println!("-----------------------------------");

    engine.disconnect();
    registry.close()?;
    Ok(())
}
