//! REST bootstrap for position and account snapshots

use std::time::Duration;
use tracing::info;

use crate::error::{FeedError, Result};
use crate::parser::AccountUpdate;
use crate::risk::PositionSnapshot;

/// Fetches full snapshots so a fresh connection starts from a complete book
#[derive(Debug, Clone)]
pub struct SnapshotClient {
    http: reqwest::Client,
    base_url: String,
}

impl SnapshotClient {
    /// `timeout` bounds each request from connect to the end of the body
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::RestApiError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Every open position
    pub async fn positions(&self) -> Result<Vec<PositionSnapshot>> {
        let url = format!("{}/positions", self.base_url);
        info!(url = %url, "Fetching position snapshot");

        let mut positions: Vec<PositionSnapshot> = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        for position in &mut positions {
            position.normalize();
            position.validate()?;
        }
        Ok(positions)
    }

    /// Current account balances
    pub async fn account(&self) -> Result<AccountUpdate> {
        let url = format!("{}/account", self.base_url);
        info!(url = %url, "Fetching account snapshot");

        let account = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<AccountUpdate>()
            .await
            .map_err(|e| FeedError::RestApiError(format!("Invalid account body: {}", e)))?;
        account.validate()?;
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::PositionSide;
    use rust_decimal_macros::dec;
    use tokio::net::TcpListener;

    fn client(url: &str) -> SnapshotClient {
        SnapshotClient::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_positions() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/positions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"symbol":"btcusdt","side":"LONG","size":"0.25","entryPrice":"60000",
                     "markPrice":"61000","leverage":25}]"#,
            )
            .create_async()
            .await;

        let positions = client(&format!("{}/", server.url())).positions().await.unwrap();

        mock.assert_async().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTCUSDT");
        assert_eq!(positions[0].side, PositionSide::Long);
        assert_eq!(positions[0].size, dec!(0.25));
    }

    #[tokio::test]
    async fn test_fetch_account() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/account")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"walletBalance":"12500.5","availableBalance":"8000"}"#)
            .create_async()
            .await;

        let account = client(&server.url()).account().await.unwrap();
        assert_eq!(account.wallet_balance, dec!(12500.5));
        assert_eq!(account.available_balance, Some(dec!(8000)));
    }

    #[tokio::test]
    async fn test_http_errors_surface() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/positions")
            .with_status(503)
            .create_async()
            .await;

        let err = client(&server.url()).positions().await.unwrap_err();
        assert!(matches!(err, FeedError::RestApiError(_)));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // Accepts connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let _held = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                open.push(stream);
            }
        });

        let snapshots = SnapshotClient::new(&url, Duration::from_millis(200)).unwrap();
        let started = std::time::Instant::now();
        let err = snapshots.positions().await.unwrap_err();

        assert!(matches!(err, FeedError::RestApiError(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
