//! Price stream lifecycle tests against a local WebSocket server.
//!
//! Covers:
//! - Tick delivery and last price tracking
//! - Reconnect after the server closes the connection
//! - Reconnect after a malformed frame
//! - Terminal event once reconnect attempts run out
//! - Terminal event when every connection only sends malformed frames
//! - Rejection of a second concurrent stream

mod common;
use common::{ticker_frame, AfterFrames, MockTickerServer};

use pivot_ws::{PriceFeed, PriceStream, PriceStreamConfig, StreamEvent, WsError};
use rust_decimal_macros::dec;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn config(base_url: String) -> PriceStreamConfig {
    PriceStreamConfig {
        base_url,
        reconnect_delay_ms: 20,
        max_reconnect_attempts: 3,
        stale_after_ms: 30_000,
    }
}

async fn next_event(rx: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within timeout")
        .expect("stream open")
}

#[tokio::test]
async fn test_delivers_ticks_and_tracks_last_price() {
    let server = MockTickerServer::start(
        vec![
            ticker_frame("ETHUSDT", "2000.10"),
            r#"{"result":null,"id":1}"#.to_string(),
            ticker_frame("ETHUSDT", "2011.00"),
        ],
        AfterFrames::HoldOpen,
    )
    .await;

    let stream = PriceStream::new(config(server.base_url()));
    let mut rx = stream.start("ETHUSDT").unwrap();

    match next_event(&mut rx).await {
        StreamEvent::Tick(tick) => {
            assert_eq!(tick.symbol, "ETHUSDT");
            assert_eq!(tick.price.inner(), dec!(2000.10));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut rx).await {
        StreamEvent::Tick(tick) => assert_eq!(tick.price.inner(), dec!(2011.00)),
        other => panic!("unexpected event: {other:?}"),
    }

    assert_eq!(stream.last_price().map(|p| p.inner()), Some(dec!(2011.00)));
    assert!(stream.is_connected());
    assert_eq!(stream.symbol().as_deref(), Some("ETHUSDT"));
    assert_eq!(server.paths(), vec!["/ethusdt@ticker".to_string()]);

    stream.stop().await;
    assert!(stream.symbol().is_none());
    server.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_after_server_close() {
    let server = MockTickerServer::start(
        vec![ticker_frame("ETHUSDT", "2000")],
        AfterFrames::Close,
    )
    .await;

    let stream = PriceStream::new(PriceStreamConfig {
        max_reconnect_attempts: 10,
        ..config(server.base_url())
    });
    let mut rx = stream.start("ETHUSDT").unwrap();

    // One tick per connection; the second proves a reconnect happened.
    for _ in 0..2 {
        assert!(matches!(next_event(&mut rx).await, StreamEvent::Tick(_)));
    }
    assert!(server.connection_count() >= 2);

    stream.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_triggers_reconnect() {
    let server = MockTickerServer::start(
        vec!["{not json".to_string(), ticker_frame("ETHUSDT", "1999")],
        AfterFrames::HoldOpen,
    )
    .await;

    let stream = PriceStream::new(PriceStreamConfig {
        max_reconnect_attempts: 10,
        ..config(server.base_url())
    });
    let _rx = stream.start("ETHUSDT").unwrap();

    // Each connection dies on the bad frame before its tick is read.
    let waited = timeout(Duration::from_secs(2), async {
        while server.connection_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "stream should reconnect after a decode error");
    assert!(stream.last_price().is_none());

    stream.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_terminates_after_bounded_attempts() {
    // Bind then drop to get a port nobody listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let stream = PriceStream::new(config(format!("ws://{addr}")));
    let mut rx = stream.start("ETHUSDT").unwrap();

    match next_event(&mut rx).await {
        StreamEvent::Terminated { reason } => assert!(reason.contains("3"), "{reason}"),
        other => panic!("unexpected event: {other:?}"),
    }
    // The first attempt plus three reconnects.
    assert_eq!(stream.reconnect_count(), 4);
    assert!(!stream.is_connected());

    // The task is done, so a new stream may start.
    timeout(Duration::from_secs(1), async {
        while stream.symbol().is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task finished");
    assert!(stream.start("BTCUSDT").is_ok());
    stream.stop().await;
}

#[tokio::test]
async fn test_garbage_only_server_runs_out_attempts() {
    let server = MockTickerServer::start(vec!["{not json".to_string()], AfterFrames::HoldOpen).await;

    let stream = PriceStream::new(config(server.base_url()));
    let mut rx = stream.start("ETHUSDT").unwrap();

    match next_event(&mut rx).await {
        StreamEvent::Terminated { reason } => assert!(reason.contains("3"), "{reason}"),
        other => panic!("unexpected event: {other:?}"),
    }
    // Handshakes succeed every time, yet the count is not reset without a tick.
    assert_eq!(server.connection_count(), 4);
    assert!(stream.last_price().is_none());

    stream.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_tick_resets_reconnect_budget() {
    let server = MockTickerServer::start(
        vec![ticker_frame("ETHUSDT", "2000"), "{not json".to_string()],
        AfterFrames::HoldOpen,
    )
    .await;

    let stream = PriceStream::new(PriceStreamConfig {
        max_reconnect_attempts: 1,
        ..config(server.base_url())
    });
    let mut rx = stream.start("ETHUSDT").unwrap();

    // Each session delivers a tick before failing, so one reconnect is
    // always enough and the stream keeps going.
    for _ in 0..3 {
        assert!(matches!(next_event(&mut rx).await, StreamEvent::Tick(_)));
    }
    assert!(server.connection_count() >= 3);

    stream.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_second_start_rejected_while_running() {
    let server = MockTickerServer::start(vec![], AfterFrames::HoldOpen).await;

    let stream = PriceStream::new(config(server.base_url()));
    let _rx = stream.start("ETHUSDT").unwrap();

    match stream.start("BTCUSDT") {
        Err(WsError::AlreadyRunning(symbol)) => assert_eq!(symbol, "ETHUSDT"),
        other => panic!("expected AlreadyRunning, got {:?}", other.map(|_| ())),
    }

    // Through the feed seam as well.
    assert!(stream.subscribe("BTCUSDT").await.is_err());
    stream.unsubscribe().await;
    assert!(stream.subscribe("BTCUSDT").await.is_ok());

    stream.stop().await;
    server.shutdown().await;
}
