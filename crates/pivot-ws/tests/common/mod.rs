//! Mock ticker server for price stream tests.
//!
//! Every accepted connection is served the same script: the queued frames
//! are sent in order, then the connection is either closed or held open
//! until the client leaves.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// What the server does after sending its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterFrames {
    Close,
    HoldOpen,
}

#[derive(Clone)]
struct Script {
    frames: Vec<String>,
    after: AfterFrames,
}

pub struct MockTickerServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    connections: Arc<AtomicU32>,
    paths: Arc<Mutex<Vec<String>>>,
}

impl MockTickerServer {
    pub async fn start(frames: Vec<String>, after: AfterFrames) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicU32::new(0));
        let paths = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let script = Script { frames, after };

        let connections_clone = connections.clone();
        let paths_clone = paths.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        connections_clone.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(handle_connection(stream, script.clone(), paths_clone.clone()));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            connections,
            paths,
        }
    }

    /// Base URL to hand to `PriceStreamConfig::base_url`.
    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Request paths seen during handshakes.
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(stream: TcpStream, script: Script, paths: Arc<Mutex<Vec<String>>>) {
    let record = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        paths.lock().push(req.uri().path().to_string());
        Ok(resp)
    };
    let Ok(ws_stream) = accept_hdr_async(stream, record).await else {
        return;
    };
    let (mut write, mut read) = ws_stream.split();

    for frame in script.frames {
        if write.send(Message::Text(frame)).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    if script.after == AfterFrames::Close {
        let _ = write.send(Message::Close(None)).await;
        return;
    }

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Ping(data)) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
}

/// A `24hrTicker` frame with last price `price`.
pub fn ticker_frame(symbol: &str, price: &str) -> String {
    serde_json::json!({
        "e": "24hrTicker",
        "E": 1_700_000_000_000_i64,
        "s": symbol,
        "c": price,
    })
    .to_string()
}
