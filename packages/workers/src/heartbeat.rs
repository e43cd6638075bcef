//! Heartbeat endpoint for worker pods.
//!
//! Ephemeral pods probe this endpoint to decide whether the scheduler that
//! launched them is still alive; a pod that cannot reach it self-terminates
//! (see the sidecar built in [`crate::kubernetes`]). The handler is intentionally
//! trivial: any 2xx response counts as a heartbeat.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default port worker pods probe.
pub const KUBE_HEARTBEAT_PORT: u16 = 9000;

/// Tiny HTTP server answering `200 OK` to any GET on `/`.
pub struct HeartbeatServer {
    port: u16,
}

impl HeartbeatServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let app = Router::new().route("/", get(beat));
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind heartbeat port {}", self.port))?;

        info!(port = self.port, "heartbeat server listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("heartbeat server error")?;

        info!(port = self.port, "heartbeat server stopped");
        Ok(())
    }
}

async fn beat() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_ok_and_stops_on_cancel() {
        // Bind an ephemeral port first so the test never collides.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let shutdown = CancellationToken::new();
        let server = HeartbeatServer::new(port);
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve(shutdown).await })
        };

        // The probe is a plain GET /.
        let mut ok = false;
        for _ in 0..50 {
            match reqwest_free_get(port).await {
                Some(status) if status == 200 => {
                    ok = true;
                    break;
                }
                _ => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
        assert!(ok, "heartbeat endpoint never answered 200");

        shutdown.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    /// Minimal HTTP GET without pulling an HTTP client into the crate.
    async fn reqwest_free_get(port: u16) -> Option<u16> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .ok()?;
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .ok()?;
        let mut buf = String::new();
        stream.read_to_string(&mut buf).await.ok()?;
        let status = buf.split_whitespace().nth(1)?;
        status.parse().ok()
    }
}
