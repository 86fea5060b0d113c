//! Position Feed - live futures position risk monitor
//!
//! Connects to the venue's position stream, keeps a position book current and
//! publishes margin / liquidation metrics to logs, HTTP and local IPC.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use position_feed::logging::init_logging;
use position_feed::{
    metrics, AppState, Config, FeedEvent, FeedManager, FeedMetrics, PositionBook, Publisher,
    RiskLevel,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Arc::new(Config::load()?);

    // Initialize logging
    init_logging(config.log_format);

    info!("Starting position feed");
    info!(
        endpoint = %config.ws_endpoint,
        channels = ?config.channels.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
        "Configuration loaded"
    );

    let registry = prometheus::Registry::new();
    let feed_metrics = FeedMetrics::register(&registry)?;
    let (feed, manager) = FeedManager::new(config.clone(), feed_metrics)?;
    let events = feed.events();

    let publisher = match config.ipc_socket_path.as_deref() {
        Some(path) => Some(Arc::new(Publisher::new(path).await)),
        None => None,
    };

    let state = Arc::new(AppState {
        book: Arc::new(RwLock::new(PositionBook::new(config.risk))),
        publisher,
        feed,
        registry,
        config: config.clone(),
    });

    // Start health check server
    let health_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    tokio::spawn(consume_events(state.clone(), events));
    tokio::spawn(log_status(state.clone()));

    let mut feed_task = tokio::spawn(manager.run());

    tokio::select! {
        result = &mut feed_task => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            state.feed.shutdown().await?;
            feed_task.await??;
        }
    }

    Ok(())
}

/// Apply feed messages to the book and fan out the affected risk reports
async fn consume_events(state: Arc<AppState>, mut events: broadcast::Receiver<FeedEvent>) {
    loop {
        match events.recv().await {
            Ok(FeedEvent::Message(message)) => {
                let reports = {
                    let mut book = state.book.write().await;
                    let changed = book.apply(&message);
                    changed
                        .iter()
                        .filter_map(|symbol| book.report(symbol))
                        .collect::<Vec<_>>()
                };

                for report in reports {
                    if report.metrics.risk_level != RiskLevel::Safe {
                        warn!(
                            symbol = %report.symbol,
                            risk_level = ?report.metrics.risk_level,
                            margin_ratio = ?report.metrics.margin_ratio,
                            liquidation_price = ?report.metrics.liquidation_price,
                            "Position at risk"
                        );
                    }
                    if let Some(publisher) = &state.publisher {
                        if let Err(e) = publisher.publish(&report).await {
                            warn!(error = %e, "Failed to publish risk report");
                        }
                    }
                }
            }
            Ok(FeedEvent::SubscriptionRejected { channel, reason }) => {
                warn!(channel = %channel, reason = %reason, "Channel rejected by venue");
            }
            Ok(other) => debug!(event = ?other, "Feed event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event consumer lagged behind the feed");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Periodic position status logging
async fn log_status(state: Arc<AppState>) {
    let mut ticker = interval(Duration::from_secs(state.config.status_log_interval_secs.max(1)));
    loop {
        ticker.tick().await;
        let book = state.book.read().await;
        for report in book.reports() {
            info!(
                symbol = %report.symbol,
                mark_price = %report.position.mark_price,
                unrealized_pnl = %report.metrics.unrealized_pnl,
                margin_ratio = ?report.metrics.margin_ratio,
                liquidation_price = ?report.metrics.liquidation_price,
                roe_pct = ?report.metrics.roe_pct,
                risk_level = ?report.metrics.risk_level,
                "Position status"
            );
        }
        if let Some(summary) = book.account_summary() {
            info!(
                wallet_balance = %summary.wallet_balance,
                margin_ratio = ?summary.margin_ratio,
                open_positions = summary.open_positions,
                "Account status"
            );
        }
    }
}

/// Start HTTP server for health checks, metrics and current positions
async fn start_health_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = state.config.health_addr;

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_text))
        .route("/positions", get(positions))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "component": "position-feed",
        "connection": format!("{:?}", state.feed.state()),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> Result<String, (StatusCode, String)> {
    metrics::encode(&state.registry).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn positions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let book = state.book.read().await;
    Json(serde_json::json!({
        "positions": book.reports(),
        "account": book.account_summary(),
    }))
}
