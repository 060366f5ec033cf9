//! Integration tests for the bind relay

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tunrelay::metrics::Metrics;
use tunrelay::{BindRelay, Config};

/// Echo every connection until the client closes
fn spawn_echo_server(listener: TcpListener) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    })
}

fn test_config(target: SocketAddr) -> Config {
    let mut config = Config::default();
    config.bind.listen_addr = "127.0.0.1:0".to_string();
    config.bind.target_addr = target.to_string();
    config.server.connect_timeout = Duration::from_secs(2);
    config.monitoring.verbose = false;
    config
}

async fn echo_once(relay_addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(payload).await.unwrap();

    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(2), client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    echoed
}

#[tokio::test]
async fn test_bind_relay_echo() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    spawn_echo_server(echo);

    let metrics = Arc::new(Metrics::new().unwrap());
    let mut relay = BindRelay::new(Arc::new(test_config(echo_addr))).with_metrics(metrics.clone());
    let relay_addr = relay.bind().await.unwrap();
    assert_eq!(relay.local_addr(), Some(relay_addr));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = tokio::spawn(async move { relay.serve(shutdown_rx).await });

    assert_eq!(echo_once(relay_addr, b"abc").await, b"abc");

    // Sequential mode: the second client is served after the first one leaves
    assert_eq!(echo_once(relay_addr, b"second").await, b"second");

    // Give the second session time to observe the double close
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(metrics.total_sessions() >= 1);
    assert!(metrics.total_bytes() >= 6);

    shutdown_tx.send(()).unwrap();
    let result = timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_bind_relay_survives_failed_dial() {
    // Reserve a port, then leave it closed so the first dial is refused
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = reserved.local_addr().unwrap();
    drop(reserved);

    let metrics = Arc::new(Metrics::new().unwrap());
    let mut relay = BindRelay::new(Arc::new(test_config(target_addr))).with_metrics(metrics.clone());
    let relay_addr = relay.bind().await.unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = tokio::spawn(async move { relay.serve(shutdown_rx).await });

    // The relay drops the client when the target is unreachable
    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(metrics.connect_failures(), 1);

    // Bring the target up and check that the listener is still serving
    let echo = tunrelay::net::bind_listener(&target_addr.to_string(), 25).await.unwrap();
    spawn_echo_server(echo);
    assert_eq!(echo_once(relay_addr, b"abc").await, b"abc");

    shutdown_tx.send(()).unwrap();
    assert!(timeout(Duration::from_secs(2), server).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn test_bind_relay_concurrent_sessions() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    spawn_echo_server(echo);

    let mut config = test_config(echo_addr);
    config.bind.concurrent = true;
    config.server.max_sessions = 4;

    let mut relay = BindRelay::new(Arc::new(config));
    let relay_addr = relay.bind().await.unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = tokio::spawn(async move { relay.serve(shutdown_rx).await });

    // Hold the first session open while a second one completes
    let mut held = TcpStream::connect(relay_addr).await.unwrap();
    held.write_all(b"held").await.unwrap();
    let mut buf = [0u8; 4];
    held.read_exact(&mut buf).await.unwrap();

    assert_eq!(echo_once(relay_addr, b"concurrent").await, b"concurrent");

    drop(held);
    shutdown_tx.send(()).unwrap();
    assert!(timeout(Duration::from_secs(2), server).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn test_bind_relay_half_close_delivers_pending_reply() {
    // Target answers only after the client has finished sending
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = target.accept().await.unwrap();
        let mut request = Vec::new();
        stream.read_to_end(&mut request).await.unwrap();
        stream.write_all(&request).await.unwrap();
    });

    let mut config = test_config(target_addr);
    // A generous interval keeps the reply inside the remote side's turn
    config.server.poll_interval = Duration::from_millis(200);
    let mut relay = BindRelay::new(Arc::new(config));
    let relay_addr = relay.bind().await.unwrap();

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move { relay.serve(shutdown_rx).await });

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(b"request").await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"request");
}

#[tokio::test]
async fn test_shutdown_mid_session_balances_active_gauge() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    spawn_echo_server(echo);

    let metrics = Arc::new(Metrics::new().unwrap());
    let mut relay = BindRelay::new(Arc::new(test_config(echo_addr))).with_metrics(metrics.clone());
    let relay_addr = relay.bind().await.unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = tokio::spawn(async move { relay.serve(shutdown_rx).await });

    // Keep the session open across the shutdown
    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(b"open").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(metrics.active_sessions(), 1);

    shutdown_tx.send(()).unwrap();
    assert!(timeout(Duration::from_secs(2), server).await.unwrap().unwrap().is_ok());

    assert_eq!(metrics.active_sessions(), 0);
    assert!(metrics.export_prometheus().contains("reason=\"cancelled\"} 1"));
}
