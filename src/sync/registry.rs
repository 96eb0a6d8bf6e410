//! Per-currency state shared by every engine: best chain height, block
//! headers and server reliability scores.
//!
//! The registry holds one mutex. It never calls a listener while holding it,
//! so engines may call back into the registry from their notifications.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::persistence::{
    load_document, save_document, Folder, LazyFlush, HEADERS_FILE, SERVERS_FILE,
};
use crate::sync::types::{version_is_below, HeaderRecord, ServerInfo};

/// Bad-message penalty for a server caught sending spam errors.
pub const SPAM_PENALTY: u32 = 100;

/// Something that wants to hear about registry changes. Engines implement
/// this and register with [`ServerRegistry::add_engine`].
pub trait RegistryListener: Send + Sync {
    fn on_height_updated(&self, height: u32);

    /// New server URIs are available.
    fn on_servers_inserted(&self);
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HeadersDocument {
    height: u32,
    headers: BTreeMap<u32, HeaderRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServersDocument {
    servers: BTreeMap<String, ServerInfo>,
}

struct RegistryState {
    height: u32,
    headers: BTreeMap<u32, HeaderRecord>,
    /// In insertion order; ranking ties keep it.
    servers: Vec<(String, ServerInfo)>,
    headers_flush: LazyFlush,
    servers_flush: LazyFlush,
    listeners: Vec<(u64, Weak<dyn RegistryListener>)>,
    next_listener: u64,
}

impl RegistryState {
    fn server_mut(&mut self, uri: &str) -> Option<&mut ServerInfo> {
        self.servers
            .iter_mut()
            .find(|(u, _)| u == uri)
            .map(|(_, info)| info)
    }

    fn live_listeners(&mut self) -> Vec<Arc<dyn RegistryListener>> {
        self.listeners.retain(|(_, l)| l.strong_count() > 0);
        self.listeners
            .iter()
            .filter_map(|(_, l)| l.upgrade())
            .collect()
    }
}

pub struct ServerRegistry {
    folder: Arc<dyn Folder>,
    config: SyncConfig,
    state: Mutex<RegistryState>,
}

/// `latency * failures / (failures + successes)`, with disconnects counting
/// double. Lower is better; a server without history scores 0.
pub fn score_server(info: &ServerInfo) -> f64 {
    let failures = info.bad_messages as f64 + 2.0 * info.disconnects as f64;
    let successes = info.good_messages as f64;
    if failures + successes == 0.0 {
        return 0.0;
    }
    info.latency * failures / (failures + successes)
}

/// Which transport a URI needs: `(needs_tcp, needs_tls)`.
pub fn uri_transport(uri: &str) -> Option<(bool, bool)> {
    let scheme = uri.split("://").next()?;
    match scheme {
        "electrum" | "electrumws" => Some((true, false)),
        "electrums" | "electrumwss" => Some((false, true)),
        _ => None,
    }
}

impl ServerRegistry {
    pub fn new(folder: Arc<dyn Folder>, config: SyncConfig) -> Self {
        let laziness = config.time_laziness();
        Self {
            folder,
            config,
            state: Mutex::new(RegistryState {
                height: 0,
                headers: BTreeMap::new(),
                servers: Vec::new(),
                headers_flush: LazyFlush::new(laziness),
                servers_flush: LazyFlush::new(laziness),
                listeners: Vec::new(),
                next_listener: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Loads the header and server caches. A corrupt headers document
    /// starts empty; a missing or corrupt server list falls back to the
    /// configured defaults.
    pub fn load(&self) {
        let headers: HeadersDocument =
            load_document(self.folder.as_ref(), HEADERS_FILE).unwrap_or_default();
        let servers: Option<ServersDocument> = load_document(self.folder.as_ref(), SERVERS_FILE);

        let mut state = self.lock();
        state.height = state.height.max(headers.height);
        state.headers.extend(headers.headers);

        match servers {
            Some(doc) if !doc.servers.is_empty() => {
                for (uri, info) in doc.servers {
                    if state.server_mut(&uri).is_none() {
                        state.servers.push((uri, info));
                    }
                }
            }
            _ => {
                log::info!(
                    "[REGISTRY] no server cache, seeding {} defaults",
                    self.config.default_servers.len()
                );
                for uri in &self.config.default_servers {
                    if state.server_mut(uri).is_none() {
                        state.servers.push((uri.clone(), ServerInfo::default()));
                    }
                }
                state.servers_flush.mark_dirty(Instant::now());
            }
        }

        log::info!(
            "[REGISTRY] loaded height {}, {} headers, {} servers",
            state.height,
            state.headers.len(),
            state.servers.len()
        );
    }

    /// Flushes dirty caches and drops every listener.
    pub fn close(&self) -> Result<(), SyncError> {
        let mut state = self.lock();
        state.listeners.clear();
        self.save_dirty(&mut state, true)
    }

    pub fn height(&self) -> u32 {
        self.lock().height
    }

    pub fn header(&self, height: u32) -> Option<HeaderRecord> {
        self.lock().headers.get(&height).cloned()
    }

    pub fn server_info(&self, uri: &str) -> Option<ServerInfo> {
        self.lock().server_mut(uri).map(|info| info.clone())
    }

    pub fn server_count(&self) -> usize {
        self.lock().servers.len()
    }

    /// Usable servers, best first. Servers older than the blacklist
    /// version always come after the rest.
    pub fn sort_servers(&self, has_tcp: bool, has_tls: bool) -> Vec<String> {
        let state = self.lock();
        let blacklist = &self.config.blacklist_version;

        let mut ranked: Vec<(bool, f64, &String)> = state
            .servers
            .iter()
            .filter(|(uri, _)| match uri_transport(uri) {
                Some((tcp, tls)) => (tcp && has_tcp) || (tls && has_tls),
                None => false,
            })
            .map(|(uri, info)| (version_is_below(&info.version, blacklist), score_server(info), uri))
            .collect();

        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
        ranked.into_iter().map(|(_, _, uri)| uri.clone()).collect()
    }

    /// Folds a finished connection's counters into the server's record.
    pub fn record_disconnect(
        &self,
        uri: &str,
        bad_messages: u32,
        had_error: bool,
        good_messages: u32,
        latency: f64,
    ) {
        let mut state = self.lock();
        let Some(info) = state.server_mut(uri) else {
            log::warn!("[REGISTRY] disconnect from unknown server {}", uri);
            return;
        };

        info.bad_messages += bad_messages;
        info.good_messages += good_messages;
        if had_error {
            info.disconnects += 1;
        }
        if good_messages > 0 {
            info.latency = if info.latency == 0.0 {
                latency
            } else {
                0.7 * info.latency + 0.3 * latency
            };
        }
        log::debug!(
            "[REGISTRY] {} now scores {:.1} ({:?})",
            uri,
            score_server(info),
            info
        );

        state.servers_flush.mark_dirty(Instant::now());
        if let Err(e) = self.save_dirty(&mut state, false) {
            log::warn!("[REGISTRY] saving caches failed: {}", e);
        }
    }

    pub fn record_version(&self, uri: &str, version: &str) {
        let mut state = self.lock();
        if let Some(info) = state.server_mut(uri) {
            if info.version != version {
                info.version = version.to_string();
                state.servers_flush.mark_dirty(Instant::now());
            }
        }
    }

    pub fn record_spam(&self, uri: &str) {
        let mut state = self.lock();
        if let Some(info) = state.server_mut(uri) {
            info.bad_messages += SPAM_PENALTY;
            log::warn!("[REGISTRY] penalising {} for spam", uri);
            state.servers_flush.mark_dirty(Instant::now());
        }
    }

    /// Raises the best known height and tells every engine. Lower or equal
    /// heights are ignored.
    pub fn update_height(&self, height: u32) {
        let listeners = {
            let mut state = self.lock();
            if height <= state.height {
                return;
            }
            state.height = height;
            state.headers_flush.mark_dirty(Instant::now());
            state.live_listeners()
        };

        log::info!("[REGISTRY] chain height {}", height);
        for listener in listeners {
            listener.on_height_updated(height);
        }
    }

    /// Adds servers not seen before. Returns how many were new.
    pub fn insert_servers<S: AsRef<str>>(&self, uris: &[S]) -> usize {
        let (added, listeners) = {
            let mut state = self.lock();
            let mut added = 0;
            for uri in uris {
                let uri = uri.as_ref();
                if state.server_mut(uri).is_none() {
                    state.servers.push((uri.to_string(), ServerInfo::default()));
                    added += 1;
                }
            }
            if added == 0 {
                return 0;
            }
            state.servers_flush.mark_dirty(Instant::now());
            (added, state.live_listeners())
        };

        log::info!("[REGISTRY] {} new servers", added);
        for listener in listeners {
            listener.on_servers_inserted();
        }
        added
    }

    /// Pulls extra server URIs from the configured info server and inserts
    /// them. Does nothing when no info server is configured.
    pub async fn fetch_servers(&self) -> Result<usize, SyncError> {
        let Some(url) = self.config.info_server_uri.as_deref() else {
            return Ok(0);
        };
        log::info!("[REGISTRY] GET {}", url);

        let client = reqwest::Client::builder()
            .timeout(self.config.connect_timeout())
            .build()?;
        let uris: Vec<String> = client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(self.insert_servers(uris.as_slice()))
    }

    /// Stores a header unless one is already known for that height.
    pub fn insert_header(&self, height: u32, header: HeaderRecord) -> bool {
        let mut state = self.lock();
        if state.headers.contains_key(&height) {
            return false;
        }
        state.headers.insert(height, header);
        state.headers_flush.mark_dirty(Instant::now());
        true
    }

    pub fn add_engine(&self, listener: Weak<dyn RegistryListener>) -> u64 {
        let mut state = self.lock();
        state.next_listener += 1;
        let id = state.next_listener;
        state.listeners.push((id, listener));
        id
    }

    pub fn remove_engine(&self, id: u64) {
        self.lock().listeners.retain(|(lid, _)| *lid != id);
    }

    /// Saves whatever is past its laziness window.
    pub fn flush_due(&self) {
        let mut state = self.lock();
        if let Err(e) = self.save_dirty(&mut state, false) {
            log::warn!("[REGISTRY] saving caches failed: {}", e);
        }
    }

    fn save_dirty(&self, state: &mut RegistryState, force: bool) -> Result<(), SyncError> {
        let now = Instant::now();

        let headers_due = if force {
            state.headers_flush.is_dirty()
        } else {
            state.headers_flush.is_due(now)
        };
        if headers_due {
            let doc = HeadersDocument {
                height: state.height,
                headers: state.headers.clone(),
            };
            save_document(self.folder.as_ref(), HEADERS_FILE, &doc)?;
            state.headers_flush.mark_saved(now);
        }

        let servers_due = if force {
            state.servers_flush.is_dirty()
        } else {
            state.servers_flush.is_due(now)
        };
        if servers_due {
            let doc = ServersDocument {
                servers: state.servers.iter().cloned().collect(),
            };
            save_document(self.folder.as_ref(), SERVERS_FILE, &doc)?;
            state.servers_flush.mark_saved(now);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryFolder;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry() -> (ServerRegistry, Arc<MemoryFolder>) {
        let folder = Arc::new(MemoryFolder::new());
        let config = SyncConfig {
            default_servers: vec![],
            ..SyncConfig::default()
        };
        (ServerRegistry::new(folder.clone(), config), folder)
    }

    fn info(bad: u32, disconnects: u32, good: u32, latency: f64, version: &str) -> ServerInfo {
        ServerInfo {
            bad_messages: bad,
            disconnects,
            good_messages: good,
            latency,
            version: version.to_string(),
        }
    }

    #[derive(Default)]
    struct Listener {
        height: AtomicU32,
        inserted: AtomicU32,
    }

    impl RegistryListener for Listener {
        fn on_height_updated(&self, height: u32) {
            self.height.store(height, Ordering::SeqCst);
        }

        fn on_servers_inserted(&self) {
            self.inserted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn score_is_zero_without_history() {
        assert_eq!(score_server(&ServerInfo::default()), 0.0);
        assert_eq!(score_server(&info(0, 0, 10, 50.0, "1.4")), 0.0);
        assert_eq!(score_server(&info(1, 0, 1, 100.0, "1.4")), 50.0);
        assert_eq!(score_server(&info(0, 1, 2, 100.0, "1.4")), 50.0);
    }

    #[test]
    fn score_never_improves_with_more_failures() {
        for good in [0u32, 1, 5, 100] {
            for latency in [0.0, 1.0, 250.0] {
                let mut last = score_server(&info(0, 0, good, latency, ""));
                for bad in 1..20 {
                    let s = score_server(&info(bad, 0, good, latency, ""));
                    assert!(s >= last);
                    last = s;
                }
                let mut last = score_server(&info(3, 0, good, latency, ""));
                for disconnects in 1..20 {
                    let s = score_server(&info(3, disconnects, good, latency, ""));
                    assert!(s >= last);
                    last = s;
                }
            }
        }
    }

    #[test]
    fn blacklisted_versions_sort_last() {
        let (registry, _) = registry();
        registry.insert_servers(&["electrum://old:1", "electrum://slow:1", "electrum://fast:1"]);
        {
            let mut state = registry.lock();
            *state.server_mut("electrum://old:1").unwrap() = info(0, 0, 100, 1.0, "0.9");
            *state.server_mut("electrum://slow:1").unwrap() = info(50, 5, 1, 900.0, "1.4");
            *state.server_mut("electrum://fast:1").unwrap() = info(1, 0, 99, 10.0, "1.2");
        }

        assert_eq!(
            registry.sort_servers(true, true),
            vec!["electrum://fast:1", "electrum://slow:1", "electrum://old:1"]
        );
    }

    #[test]
    fn sort_filters_by_transport_and_keeps_insertion_order_on_ties() {
        let (registry, _) = registry();
        registry.insert_servers(&[
            "electrums://b:2",
            "electrum://a:1",
            "electrumwss://c:3",
            "electrumws://d:4",
            "http://nope:80",
        ]);
        for uri in ["electrums://b:2", "electrum://a:1", "electrumwss://c:3", "electrumws://d:4"] {
            registry.record_version(uri, "1.4");
        }

        assert_eq!(
            registry.sort_servers(true, false),
            vec!["electrum://a:1", "electrumws://d:4"]
        );
        assert_eq!(
            registry.sort_servers(false, true),
            vec!["electrums://b:2", "electrumwss://c:3"]
        );
        assert_eq!(registry.sort_servers(true, true).len(), 4);
        assert!(registry.sort_servers(false, false).is_empty());
    }

    #[test]
    fn insert_servers_is_idempotent() {
        let (registry, _) = registry();
        let listener = Arc::new(Listener::default());
        let weak: Weak<dyn RegistryListener> = Arc::downgrade(&listener) as Weak<dyn RegistryListener>;
        registry.add_engine(weak);

        assert_eq!(registry.insert_servers(&["electrum://a:1", "electrum://a:1"]), 1);
        assert_eq!(registry.insert_servers(&["electrum://a:1"]), 0);

        assert_eq!(registry.server_count(), 1);
        assert_eq!(registry.server_info("electrum://a:1"), Some(ServerInfo::default()));
        assert_eq!(listener.inserted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn height_only_moves_up_and_notifies() {
        let (registry, _) = registry();
        let listener = Arc::new(Listener::default());
        let id = registry.add_engine(Arc::downgrade(&listener) as Weak<dyn RegistryListener>);

        registry.update_height(100);
        registry.update_height(90);
        assert_eq!(registry.height(), 100);
        assert_eq!(listener.height.load(Ordering::SeqCst), 100);

        registry.remove_engine(id);
        registry.update_height(120);
        assert_eq!(registry.height(), 120);
        assert_eq!(listener.height.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn header_first_writer_wins() {
        let (registry, _) = registry();
        let header = |ts| HeaderRecord {
            timestamp: ts,
            block_hash: "h".into(),
            prev_block_hash: "p".into(),
            merkle_root: "m".into(),
            bits: 1,
            nonce: 2,
            version: 3,
        };

        assert!(registry.insert_header(5, header(111)));
        assert!(!registry.insert_header(5, header(222)));
        assert_eq!(registry.header(5).unwrap().timestamp, 111);
    }

    #[test]
    fn disconnect_accumulates_counters() {
        let (registry, _) = registry();
        registry.insert_servers(&["electrum://a:1"]);

        registry.record_disconnect("electrum://a:1", 2, true, 10, 100.0);
        registry.record_disconnect("electrum://a:1", 1, false, 10, 200.0);
        registry.record_spam("electrum://a:1");

        let info = registry.server_info("electrum://a:1").unwrap();
        assert_eq!(info.bad_messages, 3 + SPAM_PENALTY);
        assert_eq!(info.disconnects, 1);
        assert_eq!(info.good_messages, 20);
        assert!(info.latency > 100.0 && info.latency < 200.0);
    }

    #[test]
    fn caches_survive_reload() {
        let (registry, folder) = registry();
        registry.insert_servers(&["electrum://a:1"]);
        registry.record_version("electrum://a:1", "1.4");
        registry.update_height(700_000);
        registry.insert_header(
            700_000,
            HeaderRecord {
                timestamp: 42,
                block_hash: "h".into(),
                prev_block_hash: "p".into(),
                merkle_root: "m".into(),
                bits: 1,
                nonce: 2,
                version: 3,
            },
        );
        registry.close().unwrap();

        let reloaded = ServerRegistry::new(folder.clone(), SyncConfig::default());
        reloaded.load();
        assert_eq!(reloaded.height(), 700_000);
        assert_eq!(reloaded.header(700_000).unwrap().timestamp, 42);
        assert_eq!(reloaded.server_count(), 1);
        assert_eq!(reloaded.server_info("electrum://a:1").unwrap().version, "1.4");
    }

    #[test]
    fn corrupt_caches_fall_back() {
        let folder = Arc::new(MemoryFolder::new());
        folder.insert(HEADERS_FILE, "garbage");
        folder.insert(SERVERS_FILE, "{\"servers\": 5}");

        let registry = ServerRegistry::new(folder, SyncConfig::default());
        registry.load();

        assert_eq!(registry.height(), 0);
        assert_eq!(
            registry.server_count(),
            SyncConfig::default().default_servers.len()
        );
    }

    /// Serves one canned HTTP response per connection.
    async fn info_server(status: &'static str, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/servers", listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        url
    }

    #[tokio::test]
    async fn fetched_servers_join_the_pool() {
        let url = info_server("200 OK", r#"["electrum://a:1", "electrums://b:2"]"#).await;
        let folder = Arc::new(MemoryFolder::new());
        let config = SyncConfig {
            default_servers: vec!["electrum://a:1".to_string()],
            info_server_uri: Some(url),
            ..SyncConfig::default()
        };
        let registry = ServerRegistry::new(folder, config);
        registry.load();
        let listener = Arc::new(Listener::default());
        let weak: Weak<dyn RegistryListener> = Arc::downgrade(&listener) as Weak<dyn RegistryListener>;
        registry.add_engine(weak);

        assert_eq!(registry.fetch_servers().await.unwrap(), 1);
        assert_eq!(registry.server_count(), 2);
        assert_eq!(listener.inserted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_list_errors_leave_the_pool_alone() {
        let (registry, _) = registry();
        assert_eq!(registry.fetch_servers().await.unwrap(), 0);

        let url = info_server("500 Internal Server Error", "oops").await;
        let config = SyncConfig {
            default_servers: vec![],
            info_server_uri: Some(url),
            ..SyncConfig::default()
        };
        let registry = ServerRegistry::new(Arc::new(MemoryFolder::new()), config);

        assert!(matches!(
            registry.fetch_servers().await,
            Err(SyncError::ServerList(_))
        ));
        assert_eq!(registry.server_count(), 0);
    }
}
