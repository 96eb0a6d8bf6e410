//! Request values handed to a connection.
//!
//! A [`StratumTask`] is a method, its params and two continuations. The
//! constructors below decode the reply into typed data before calling
//! `on_done`; a reply that does not decode fails the task with a protocol
//! error instead.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::StratumError;
use crate::sync::electrum::message::*;

type DoneFn = Box<dyn FnOnce(Value) -> Result<(), String> + Send>;
type FailFn = Box<dyn FnOnce(StratumError) + Send>;

pub struct StratumTask {
    pub method: &'static str,
    pub params: Vec<Value>,
    on_done: DoneFn,
    on_fail: FailFn,
}

impl fmt::Debug for StratumTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StratumTask")
            .field("method", &self.method)
            .field("params", &self.params)
            .finish()
    }
}

impl StratumTask {
    pub fn new<T, D, F>(method: &'static str, params: Vec<Value>, on_done: D, on_fail: F) -> Self
    where
        T: DeserializeOwned,
        D: FnOnce(T) + Send + 'static,
        F: FnOnce(StratumError) + Send + 'static,
    {
        Self::from_parts(
            method,
            params,
            Box::new(move |result: Value| {
                let value = serde_json::from_value::<T>(result)
                    .map_err(|e| format!("unexpected {} reply: {}", method, e))?;
                on_done(value);
                Ok(())
            }),
            Box::new(on_fail),
        )
    }

    fn from_parts(method: &'static str, params: Vec<Value>, on_done: DoneFn, on_fail: FailFn) -> Self {
        Self {
            method,
            params,
            on_done,
            on_fail,
        }
    }

    /// Hands a result to the task.
    ///
    /// An undecodable result fails the task and is returned as the
    /// protocol error the connection should close with.
    pub fn succeed(self, uri: &str, result: Value) -> Result<(), StratumError> {
        let StratumTask {
            on_done, on_fail, ..
        } = self;

        if let Err(message) = on_done(result) {
            let error = StratumError::protocol(uri, message);
            on_fail(error.clone());
            return Err(error);
        }
        Ok(())
    }

    pub fn fail(self, error: StratumError) {
        (self.on_fail)(error)
    }
}

/// One row of `blockchain.scripthash.get_history`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HistoryRow {
    pub tx_hash: String,
    pub height: i64,
}

/// One row of `blockchain.scripthash.listunspent`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UtxoRow {
    pub tx_hash: String,
    pub tx_pos: u32,
    pub value: u64,
    #[serde(default)]
    pub height: i64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VersionReply {
    Pair(Vec<String>),
    Single(String),
}

impl VersionReply {
    fn protocol(self) -> Option<String> {
        match self {
            VersionReply::Pair(mut v) if v.len() >= 2 => Some(v.swap_remove(1)),
            VersionReply::Pair(_) => None,
            VersionReply::Single(v) => Some(v),
        }
    }
}

/// Protocol version out of a `server.version` result.
///
/// Protocol 1.1+ answers `[software, protocol]`, older servers a bare string.
pub fn parse_version(result: &Value) -> Option<String> {
    serde_json::from_value::<VersionReply>(result.clone())
        .ok()
        .and_then(VersionReply::protocol)
}

pub fn version_params(client_name: &str, protocol_version: &str) -> Vec<Value> {
    vec![json!(client_name), json!(protocol_version)]
}

pub fn fetch_version<D, F>(client_name: &str, protocol_version: &str, on_done: D, on_fail: F) -> StratumTask
where
    D: FnOnce(String) + Send + 'static,
    F: FnOnce(StratumError) + Send + 'static,
{
    StratumTask::from_parts(
        METHOD_VERSION,
        version_params(client_name, protocol_version),
        Box::new(move |result: Value| {
            let version = parse_version(&result)
                .ok_or_else(|| format!("unexpected version reply {}", result))?;
            on_done(version);
            Ok(())
        }),
        Box::new(on_fail),
    )
}

pub fn subscribe_height<D, F>(on_done: D, on_fail: F) -> StratumTask
where
    D: FnOnce(u32) + Send + 'static,
    F: FnOnce(StratumError) + Send + 'static,
{
    StratumTask::from_parts(
        METHOD_HEADERS_SUBSCRIBE,
        vec![],
        Box::new(move |result: Value| {
            let height = notified_height(&result)
                .ok_or_else(|| format!("unexpected header reply {}", result))?;
            on_done(height);
            Ok(())
        }),
        Box::new(on_fail),
    )
}

/// Subscribes to a scripthash. The reply is its current status hash, or
/// null for an address without history.
pub fn subscribe_script_hash<D, F>(script_hash: &str, on_done: D, on_fail: F) -> StratumTask
where
    D: FnOnce(Option<String>) + Send + 'static,
    F: FnOnce(StratumError) + Send + 'static,
{
    StratumTask::new(
        METHOD_SCRIPTHASH_SUBSCRIBE,
        vec![json!(script_hash)],
        on_done,
        on_fail,
    )
}

pub fn fetch_history<D, F>(script_hash: &str, on_done: D, on_fail: F) -> StratumTask
where
    D: FnOnce(Vec<HistoryRow>) + Send + 'static,
    F: FnOnce(StratumError) + Send + 'static,
{
    StratumTask::new(METHOD_GET_HISTORY, vec![json!(script_hash)], on_done, on_fail)
}

pub fn fetch_utxos<D, F>(script_hash: &str, on_done: D, on_fail: F) -> StratumTask
where
    D: FnOnce(Vec<UtxoRow>) + Send + 'static,
    F: FnOnce(StratumError) + Send + 'static,
{
    StratumTask::new(METHOD_LIST_UNSPENT, vec![json!(script_hash)], on_done, on_fail)
}

/// Fetches a raw transaction as hex.
pub fn fetch_transaction<D, F>(txid: &str, on_done: D, on_fail: F) -> StratumTask
where
    D: FnOnce(String) + Send + 'static,
    F: FnOnce(StratumError) + Send + 'static,
{
    StratumTask::new(METHOD_TRANSACTION_GET, vec![json!(txid)], on_done, on_fail)
}

/// Fetches a raw 80-byte header as hex.
pub fn fetch_block_header<D, F>(height: u32, on_done: D, on_fail: F) -> StratumTask
where
    D: FnOnce(String) + Send + 'static,
    F: FnOnce(StratumError) + Send + 'static,
{
    StratumTask::new(METHOD_BLOCK_HEADER, vec![json!(height)], on_done, on_fail)
}

/// Broadcasts a raw transaction. The reply is its txid.
pub fn broadcast_tx<D, F>(raw_tx: &str, on_done: D, on_fail: F) -> StratumTask
where
    D: FnOnce(String) + Send + 'static,
    F: FnOnce(StratumError) + Send + 'static,
{
    StratumTask::new(
        METHOD_TRANSACTION_BROADCAST,
        vec![json!(raw_tx)],
        on_done,
        on_fail,
    )
}
