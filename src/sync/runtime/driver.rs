//! Socket side of one connection.
//!
//! A dedicated reader task turns the socket into a channel of lines; the
//! driver loop selects over those lines, engine commands and the
//! connection's next timer, and writes whatever the connection queued.

use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_native_tls::TlsConnector;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::SyncConfig;
use crate::error::StratumError;
use crate::sync::electrum::{ConnectionCommand, StratumConnection};

/// Anything we can speak Stratum over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone)]
pub struct DialSettings {
    pub connect_timeout: Duration,
    pub accept_invalid_certs: bool,
}

impl DialSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            accept_invalid_certs: config.accept_invalid_certs,
        }
    }
}

/// Where a server URI points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub websocket: bool,
}

impl Endpoint {
    /// `electrum://`, `electrums://`, `electrumws://` or `electrumwss://`,
    /// followed by `host:port`.
    pub fn parse(uri: &str) -> Result<Self, StratumError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| StratumError::transport(uri, "missing scheme"))?;
        let (tls, websocket) = match scheme {
            "electrum" => (false, false),
            "electrums" => (true, false),
            "electrumws" => (false, true),
            "electrumwss" => (true, true),
            other => {
                return Err(StratumError::transport(uri, format!("unsupported scheme {}", other)))
            }
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| StratumError::transport(uri, "missing port"))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| StratumError::transport(uri, format!("bad port: {}", e)))?;
        if host.is_empty() {
            return Err(StratumError::transport(uri, "missing host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
            websocket,
        })
    }

    fn websocket_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

enum ReadEvent {
    Line(String),
    Closed(Option<String>),
}

enum Writer {
    Stream(WriteHalf<BoxedStream>),
    WebSocket(SplitSink<WebSocketStream<BoxedStream>, Message>),
}

impl Writer {
    async fn send(&mut self, line: &str) -> Result<(), String> {
        match self {
            Writer::Stream(w) => {
                w.write_all(line.as_bytes()).await.map_err(|e| e.to_string())?;
                w.flush().await.map_err(|e| e.to_string())
            }
            Writer::WebSocket(sink) => sink
                .send(Message::Text(line.trim_end().to_string()))
                .await
                .map_err(|e| e.to_string()),
        }
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            Writer::Stream(w) => w.shutdown().await.map_err(|e| e.to_string()),
            Writer::WebSocket(sink) => sink.close().await.map_err(|e| e.to_string()),
        };
    }
}

async fn dial_stream(endpoint: &Endpoint, settings: &DialSettings) -> Result<BoxedStream, String> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| e.to_string())?;
    let _ = tcp.set_nodelay(true);

    if !endpoint.tls {
        return Ok(Box::new(tcp));
    }

    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(settings.accept_invalid_certs)
        .danger_accept_invalid_hostnames(settings.accept_invalid_certs)
        .build()
        .map_err(|e| e.to_string())?;
    let tls = TlsConnector::from(connector)
        .connect(&endpoint.host, tcp)
        .await
        .map_err(|e| e.to_string())?;
    Ok(Box::new(tls))
}

async fn dial(
    endpoint: &Endpoint,
    settings: &DialSettings,
) -> Result<(UnboundedReceiver<ReadEvent>, JoinHandle<()>, Writer), String> {
    let stream = dial_stream(endpoint, settings).await?;
    let (tx, rx) = mpsc::unbounded_channel();

    if endpoint.websocket {
        let (ws, _) = tokio_tungstenite::client_async(endpoint.websocket_url(), stream)
            .await
            .map_err(|e| e.to_string())?;
        let (sink, stream) = ws.split();
        let reader = tokio::spawn(read_websocket(stream, tx));
        return Ok((rx, reader, Writer::WebSocket(sink)));
    }

    let (r, w) = tokio::io::split(stream);
    let reader = tokio::spawn(read_lines(BufReader::new(r), tx));
    Ok((rx, reader, Writer::Stream(w)))
}

async fn read_lines(mut reader: BufReader<ReadHalf<BoxedStream>>, tx: UnboundedSender<ReadEvent>) {
    loop {
        let mut line = String::new();
        let event = match reader.read_line(&mut line).await {
            Ok(0) => ReadEvent::Closed(None),
            Ok(_) => ReadEvent::Line(line),
            Err(e) => ReadEvent::Closed(Some(e.to_string())),
        };
        let closed = matches!(event, ReadEvent::Closed(_));
        if tx.send(event).is_err() || closed {
            return;
        }
    }
}

async fn read_websocket(
    mut stream: SplitStream<WebSocketStream<BoxedStream>>,
    tx: UnboundedSender<ReadEvent>,
) {
    loop {
        let event = match stream.next().await {
            Some(Ok(Message::Text(text))) => ReadEvent::Line(text + "\n"),
            Some(Ok(Message::Binary(bytes))) => {
                ReadEvent::Line(String::from_utf8_lossy(&bytes).into_owned() + "\n")
            }
            Some(Ok(Message::Close(_))) | None => ReadEvent::Closed(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => ReadEvent::Closed(Some(e.to_string())),
        };
        let closed = matches!(event, ReadEvent::Closed(_));
        if tx.send(event).is_err() || closed {
            return;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Dials the connection's server and drives it until it closes.
pub async fn drive(
    mut connection: StratumConnection,
    mut commands: UnboundedReceiver<ConnectionCommand>,
    settings: DialSettings,
) {
    let uri = connection.uri().to_string();
    connection.on_connecting();

    let endpoint = match Endpoint::parse(&uri) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            connection.on_socket_close(Some(e));
            return;
        }
    };

    log::debug!("[DRIVER] dialing {}", uri);
    let dialed = tokio::time::timeout(settings.connect_timeout, dial(&endpoint, &settings)).await;
    let (mut reads, reader, mut writer) = match dialed {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            connection.on_socket_close(Some(StratumError::transport(&uri, e)));
            return;
        }
        Err(_) => {
            connection.on_socket_close(Some(StratumError::transport(&uri, "connect timed out")));
            return;
        }
    };

    connection.on_socket_connect(Instant::now());

    loop {
        for line in connection.take_outbox() {
            if let Err(e) = writer.send(&line).await {
                connection.on_socket_close(Some(StratumError::transport(&uri, e)));
                break;
            }
        }
        if connection.is_closed() {
            break;
        }

        let wake = connection.next_wake();
        tokio::select! {
            event = reads.recv() => match event {
                Some(ReadEvent::Line(line)) => connection.on_data(&line, Instant::now()),
                Some(ReadEvent::Closed(error)) => {
                    connection.on_socket_close(error.map(|e| StratumError::transport(&uri, e)));
                }
                None => connection.on_socket_close(None),
            },
            command = commands.recv() => match command {
                Some(command) => connection.handle_command(command, Instant::now()),
                // The engine let go of this connection.
                None => connection.close(None),
            },
            _ = sleep_until(wake) => connection.on_timer(Instant::now()),
        }

        connection.wake_up(Instant::now());
    }

    writer.shutdown().await;
    reader.abort();
    log::debug!("[DRIVER] {} finished", uri);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_scheme() {
        assert_eq!(
            Endpoint::parse("electrum://host.example:50001").unwrap(),
            Endpoint {
                host: "host.example".into(),
                port: 50001,
                tls: false,
                websocket: false,
            }
        );
        let tls = Endpoint::parse("electrums://host.example:50002").unwrap();
        assert!(tls.tls && !tls.websocket);

        let wss = Endpoint::parse("electrumwss://host.example:50004/").unwrap();
        assert!(wss.tls && wss.websocket);
        assert_eq!(wss.websocket_url(), "wss://host.example:50004");
        assert_eq!(
            Endpoint::parse("electrumws://h:1").unwrap().websocket_url(),
            "ws://h:1"
        );
    }

    #[test]
    fn rejects_malformed_uris() {
        assert!(Endpoint::parse("host:50001").is_err());
        assert!(Endpoint::parse("http://host:80").is_err());
        assert!(Endpoint::parse("electrum://host").is_err());
        assert!(Endpoint::parse("electrum://host:notaport").is_err());
        assert!(Endpoint::parse("electrum://:50001").is_err());
    }
}
