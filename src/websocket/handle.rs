//! Consumer-side handle to a running feed manager

use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

use crate::error::{FeedError, Result};
use crate::parser::{Channel, FeedMessage};

/// Instructions accepted by the manager while it runs
#[derive(Debug, Clone, PartialEq)]
pub enum FeedCommand {
    Subscribe(Channel),
    Unsubscribe(Channel),
    Shutdown,
}

/// Notifications fanned out to every listener
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    SubscriptionRejected { channel: Channel, reason: String },
    Message(FeedMessage),
    GaveUp { attempts: u32 },
}

/// Socket lifecycle as seen by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

/// Cloneable handle for subscribing, listening and stopping the feed
#[derive(Debug, Clone)]
pub struct FeedHandle {
    commands: mpsc::Sender<FeedCommand>,
    events: broadcast::Sender<FeedEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl FeedHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<FeedCommand>,
        events: broadcast::Sender<FeedEvent>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            commands,
            events,
            state,
        }
    }

    /// Add a channel; it is requested now if connected, else on the next connect
    pub async fn subscribe(&self, channel: Channel) -> Result<()> {
        self.send(FeedCommand::Subscribe(channel)).await
    }

    pub async fn unsubscribe(&self, channel: Channel) -> Result<()> {
        self.send(FeedCommand::Unsubscribe(channel)).await
    }

    /// Close the socket and stop reconnecting
    pub async fn shutdown(&self) -> Result<()> {
        self.send(FeedCommand::Shutdown).await
    }

    /// New listener; receives events published after this call
    pub fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn send(&self, command: FeedCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| FeedError::ChannelClosed)
    }
}
