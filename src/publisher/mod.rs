//! Publisher module for IPC communication
//!
//! Publishes risk reports to local consumers over a Unix socket. Each frame is
//! a 4-byte big-endian length followed by a MessagePack body.

use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};
use crate::tracker::RiskReport;

/// Length-prefix a MessagePack encoding of `report`
pub fn encode_frame(report: &RiskReport) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(report)
        .map_err(|e| FeedError::SerializationError(format!("Failed to serialize: {}", e)))?;
    let len = u32::try_from(body.len())
        .map_err(|_| FeedError::SerializationError("frame too large".to_string()))?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Publisher for sending risk reports via Unix socket
pub struct Publisher {
    socket_path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl Publisher {
    /// Create a new publisher
    pub async fn new(socket_path: &str) -> Self {
        let publisher = Self {
            socket_path: socket_path.to_string(),
            stream: Mutex::new(None),
        };

        // The consumer may not be listening yet
        if let Err(e) = publisher.connect().await {
            warn!(error = %e, "Initial IPC connection failed, will retry on publish");
        }

        publisher
    }

    async fn connect(&self) -> Result<()> {
        let path = Path::new(&self.socket_path);

        if !path.exists() {
            return Err(FeedError::IpcError(format!(
                "Socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            FeedError::IpcError(format!("Failed to connect to {}: {}", self.socket_path, e))
        })?;

        *self.stream.lock().await = Some(stream);

        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Publish one report; delivery failures are logged, never returned
    pub async fn publish(&self, report: &RiskReport) -> Result<()> {
        let frame = encode_frame(report)?;

        if !self.is_connected().await {
            if let Err(e) = self.connect().await {
                debug!(error = %e, "Failed to reconnect to IPC socket");
                return Ok(());
            }
        }

        let mut guard = self.stream.lock().await;
        if let Some(stream) = guard.as_mut() {
            match stream.write_all(&frame).await {
                Ok(()) => {
                    debug!(
                        symbol = %report.symbol,
                        risk_level = ?report.metrics.risk_level,
                        "Published risk report"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Failed to write to IPC socket");
                    *guard = None;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::{Collateral, MarginMode, PositionSide, PositionSnapshot, RiskMetrics, RiskParams};
    use rust_decimal_macros::dec;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    fn report() -> RiskReport {
        let position = PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            size: dec!(0.1),
            entry_price: dec!(60000),
            mark_price: dec!(59000),
            leverage: 20,
            margin_mode: MarginMode::Isolated,
            isolated_margin: None,
            maint_margin_rate: None,
            update_time: 5,
        };
        let metrics = RiskMetrics::compute(&position, Collateral::Isolated, &RiskParams::default());
        RiskReport {
            symbol: position.symbol.clone(),
            position,
            metrics,
        }
    }

    #[test]
    fn test_frame_is_length_prefixed() {
        let frame = encode_frame(&report()).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let decoded: RiskReport = rmp_serde::from_slice(&frame[4..]).unwrap();
        assert_eq!(decoded, report());
    }

    #[tokio::test]
    async fn test_publish_to_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("risk.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let publisher = Publisher::new(path.to_str().unwrap()).await;
        let (mut server, _) = listener.accept().await.unwrap();
        assert!(publisher.is_connected().await);

        publisher.publish(&report()).await.unwrap();

        let mut len = [0u8; 4];
        server.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        server.read_exact(&mut body).await.unwrap();

        let decoded: RiskReport = rmp_serde::from_slice(&body).unwrap();
        assert_eq!(decoded.symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn test_missing_socket_does_not_fail_publish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");

        let publisher = Publisher::new(path.to_str().unwrap()).await;
        assert!(!publisher.is_connected().await);
        tokio_test::assert_ok!(publisher.publish(&report()).await);
    }
}
