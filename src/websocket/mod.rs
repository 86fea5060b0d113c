//! WebSocket module for the position stream connection

mod backoff;
mod client;
mod handle;
mod manager;
mod subscriptions;

pub use backoff::Backoff;
pub use client::WebSocketClient;
pub use handle::{ConnectionState, FeedCommand, FeedEvent, FeedHandle};
pub use manager::FeedManager;
pub use subscriptions::{SubscriptionSet, SubscriptionState};
