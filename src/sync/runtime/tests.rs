use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::Txid;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::persistence::MemoryFolder;
use crate::sync::domain::parsed_tx::electrum_scripthash;
use crate::sync::domain::parsed_tx::test_util::{build_tx, script, tx_hex};
use crate::sync::engine::{ChannelCallbacks, EngineOptions, SyncEngine, SyncEvent};
use crate::sync::registry::ServerRegistry;
use crate::sync::runtime::TokioIo;

/// Answers every request the way a small Electrum server with one
/// unconfirmed payment would.
async fn serve(listener: TcpListener, raw_tx: String, txid: String, value: u64) {
    while let Ok((socket, _)) = listener.accept().await {
        let raw_tx = raw_tx.clone();
        let txid = txid.clone();
        tokio::spawn(async move {
            let (r, mut w) = socket.into_split();
            let mut lines = BufReader::new(r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let result = match request["method"].as_str().unwrap() {
                    "server.version" => json!(["fake electrum", "1.4"]),
                    "server.ping" => Value::Null,
                    "blockchain.headers.subscribe" => json!({ "height": 123, "hex": "00" }),
                    "blockchain.scripthash.subscribe" => json!("status-a"),
                    "blockchain.scripthash.listunspent" => {
                        json!([{ "tx_hash": txid, "tx_pos": 0, "value": value, "height": 0 }])
                    }
                    "blockchain.scripthash.get_history" => json!([{ "tx_hash": txid, "height": 0 }]),
                    "blockchain.transaction.get" => json!(raw_tx),
                    "blockchain.transaction.broadcast" => json!("cafe"),
                    other => panic!("unexpected method {}", other),
                };
                let reply = json!({ "jsonrpc": "2.0", "id": request["id"], "result": result });
                if w.write_all((reply.to_string() + "\n").as_bytes()).await.is_err() {
                    return;
                }
            }
        });
    }
}

fn engine_for(uri: String, events: mpsc::UnboundedSender<SyncEvent>) -> (SyncEngine, Arc<ServerRegistry>) {
    let config = SyncConfig {
        pool_size: 1,
        default_servers: vec![uri],
        ..SyncConfig::default()
    };
    let registry = Arc::new(ServerRegistry::new(Arc::new(MemoryFolder::new()), config.clone()));
    registry.load();

    let engine = SyncEngine::new(EngineOptions {
        io: Arc::new(TokioIo::new(&config, Handle::current())),
        config,
        registry: registry.clone(),
        folder: Arc::new(MemoryFolder::new()),
        encrypted_folder: Arc::new(MemoryFolder::new()),
        callbacks: Arc::new(ChannelCallbacks::new(events)),
    });
    (engine, registry)
}

#[tokio::test]
async fn syncs_and_broadcasts_against_a_live_socket() {
    let tx = build_tx(&[(Txid::all_zeros(), 3)], &[(script(1), 42_000)]);
    let txid = tx.compute_txid().to_string();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve(listener, tx_hex(&tx), txid.clone(), 42_000));

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (engine, registry) = engine_for(format!("electrum://127.0.0.1:{}", port), events_tx);
    let sh = electrum_scripthash(script(1).as_bytes());
    engine.add_address(&sh, "addr", "m/0/0");
    engine.connect();

    let synced = tokio::time::timeout(Duration::from_secs(10), async {
        let mut fetched = false;
        let mut height = false;
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::TxFetched(id) if id == txid => fetched = true,
                SyncEvent::HeightUpdated(123) => height = true,
                _ => {}
            }
            if fetched && height && engine.balance() == 42_000 {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(synced, Ok(true));

    assert_eq!(registry.height(), 123);
    assert_eq!(engine.addresses_checked_ratio(), 1.0);
    assert_eq!(engine.transaction(&txid).unwrap().block_height, -1);

    assert_eq!(engine.broadcast_tx("0200").await.unwrap(), "cafe");

    engine.disconnect();
    assert_eq!(engine.connection_count(), 0);
}

#[tokio::test]
async fn refused_dial_counts_as_a_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let uri = format!("electrum://127.0.0.1:{}", port);
    let (events_tx, _events) = mpsc::unbounded_channel();
    let (engine, registry) = engine_for(uri.clone(), events_tx);
    engine.connect();

    let dropped = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if registry.server_info(&uri).is_some_and(|info| info.disconnects > 0) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    assert!(dropped.is_ok());
    assert_eq!(engine.connection_count(), 0, "cooling down before redial");
}
