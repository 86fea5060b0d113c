//! Position Feed Library
//!
//! This crate keeps a live WebSocket connection to a futures venue's position
//! stream and derives margin, liquidation and return metrics from the
//! positions it reports.

use std::sync::Arc;
use tokio::sync::RwLock;

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod publisher;
pub mod rest;
pub mod risk;
pub mod tracker;
pub mod websocket;

pub use config::Config;
pub use error::{FeedError, Result};
pub use metrics::FeedMetrics;
pub use parser::{AccountUpdate, Channel, FeedMessage, MarkPriceUpdate, Request};
pub use publisher::Publisher;
pub use risk::{PositionSnapshot, RiskLevel, RiskMetrics, RiskParams};
pub use tracker::{AccountRisk, PositionBook, RiskReport};
pub use websocket::{ConnectionState, FeedEvent, FeedHandle, FeedManager};

/// Application state shared across components
pub struct AppState {
    pub book: Arc<RwLock<PositionBook>>,
    pub publisher: Option<Arc<Publisher>>,
    pub feed: FeedHandle,
    pub registry: prometheus::Registry,
    pub config: Arc<Config>,
}
