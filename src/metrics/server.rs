//! Metrics HTTP Server
//! 
//! Provides HTTP endpoint for Prometheus metrics scraping

use crate::metrics::Metrics;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, error, debug};

/// HTTP server for serving Prometheus metrics
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    listener: TcpListener,
}

impl MetricsServer {
    /// Bind the metrics server
    pub async fn bind(metrics: Arc<Metrics>, bind_addr: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(bind_addr = %bind_addr, "Metrics server listening");
        Ok(Self { metrics, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve metrics requests until the task is dropped
    pub async fn serve(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((mut stream, addr)) => {
                    debug!(client_addr = %addr, "Metrics request received");

                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_request(&mut stream, metrics).await {
                            error!(error = %e, client_addr = %addr, "Failed to handle metrics request");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}

/// Handle a single HTTP request for metrics
async fn handle_request(
    stream: &mut tokio::net::TcpStream,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let mut buffer = [0; 1024];
    let bytes_read = stream.read(&mut buffer).await?;

    if bytes_read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);

    let (status, content_type, body) = if request.starts_with("GET /metrics") {
        ("200 OK", "text/plain; version=0.0.4; charset=utf-8", metrics.export_prometheus())
    } else if request.starts_with("GET /health") {
        ("200 OK", "text/plain", "OK".to_string())
    } else {
        ("404 Not Found", "text/plain", "Not Found".to_string())
    };

    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        content_type,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    debug!(status = status, "Sent metrics response");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_metrics_endpoint() -> anyhow::Result<()> {
        let metrics = Arc::new(Metrics::new()?);
        let server = MetricsServer::bind(metrics, "127.0.0.1:0").await?;
        let addr = server.local_addr()?;
        let handle = tokio::spawn(server.serve());

        let response = get(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("tunrelay_sessions_total 0"));

        let response = get(addr, "/health").await;
        assert!(response.ends_with("OK"));

        let response = get(addr, "/nope").await;
        assert!(response.starts_with("HTTP/1.1 404"));

        handle.abort();
        Ok(())
    }
}
