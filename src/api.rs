//! Health & status endpoints:
//! - GET /health  - liveness
//! - GET /metrics - Prometheus metrics
//! - GET /status  - queue counts from the database

use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use sqlx::PgPool;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::db;
use crate::metrics;

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    queues: db::QueueCounts,
}

/// Start the API server.
pub async fn start_api_server(addr: SocketAddr, db: PgPool) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server started");
    metrics::UP.set(1.0);

    loop {
        let (mut socket, _) = listener.accept().await?;
        let db = db.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let n = match socket.read(&mut buf).await {
                Ok(n) if n > 0 => n,
                _ => return,
            };

            let (method, path) = match parse_request(&buf[..n]) {
                Some(mp) => mp,
                None => {
                    let _ = socket
                        .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                        .await;
                    return;
                }
            };

            match (method.as_str(), path.as_str()) {
                ("GET", "/health") => {
                    let response =
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK";
                    let _ = socket.write_all(response.as_bytes()).await;
                }
                ("GET", "/metrics") => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    let _ = encoder.encode(&metric_families, &mut buffer);
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
                        buffer.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.write_all(&buffer).await;
                }
                ("GET", "/status") => {
                    let queues = db::queue_counts(&db).await.unwrap_or_default();
                    let status = StatusResponse {
                        status: "ok".to_string(),
                        queues,
                    };
                    let body =
                        serde_json::to_string(&status).unwrap_or_else(|_| "{}".to_string());
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                }
                _ => {
                    let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
                    let _ = socket.write_all(response.as_bytes()).await;
                }
            }
        });
    }
}

/// Parse HTTP method and path from the raw request bytes.
fn parse_request(buf: &[u8]) -> Option<(String, String)> {
    let request = std::str::from_utf8(buf).ok()?;
    let first_line = request.lines().next()?;
    let mut parts = first_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    Some((method, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let (method, path) = parse_request(b"GET /status HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(path, "/status");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_request(&[0xff, 0xfe]).is_none());
        assert!(parse_request(b"").is_none());
    }
}
