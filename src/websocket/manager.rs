//! WebSocket connection manager
//!
//! Handles reconnection, heartbeat, subscription replay and message dispatch.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::backoff::Backoff;
use super::handle::{ConnectionState, FeedCommand, FeedEvent, FeedHandle};
use super::subscriptions::{SubscriptionSet, SubscriptionState};
use super::WebSocketClient;
use crate::config::Config;
use crate::error::{FeedError, Result};
use crate::metrics::FeedMetrics;
use crate::parser::{Channel, FeedMessage, Request};
use crate::rest::SnapshotClient;

/// Pending commands before senders start waiting
const COMMAND_BUFFER: usize = 64;

/// Whether to keep going after handling a command offline
#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Owns the single socket and reconnects it until told to stop
pub struct FeedManager {
    config: Arc<Config>,
    client: WebSocketClient,
    subscriptions: SubscriptionSet,
    backoff: Backoff,
    snapshots: Option<SnapshotClient>,
    metrics: FeedMetrics,
    commands: mpsc::Receiver<FeedCommand>,
    events: broadcast::Sender<FeedEvent>,
    state: watch::Sender<ConnectionState>,
    connected_at: Option<Instant>,
}

impl FeedManager {
    /// Create a manager and the handle that controls it
    ///
    /// Take listeners from the handle before calling `run` to see every event.
    pub fn new(config: Arc<Config>, metrics: FeedMetrics) -> Result<(FeedHandle, Self)> {
        let snapshots = match config.rest_endpoint.as_deref() {
            Some(url) => Some(SnapshotClient::new(url, config.rest_timeout())?),
            None => None,
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(config.event_buffer);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let handle = FeedHandle::new(command_tx, event_tx.clone(), state_rx);
        let manager = Self {
            client: WebSocketClient::new(&config.ws_endpoint),
            subscriptions: SubscriptionSet::with_channels(config.channels.iter().cloned()),
            backoff: Backoff::new(
                config.reconnect_delay(),
                config.max_reconnect_delay(),
                config.max_reconnect_attempts,
            ),
            snapshots,
            metrics,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            connected_at: None,
            config,
        };

        Ok((handle, manager))
    }

    /// Run until shutdown or until reconnect attempts are exhausted
    pub async fn run(mut self) -> Result<()> {
        info!(
            endpoint = %self.client.endpoint(),
            channels = self.subscriptions.len(),
            max_attempts = self.config.max_reconnect_attempts,
            "Starting feed manager"
        );

        loop {
            let outcome = self.connect_and_process().await;

            let session = self.connected_at.take().map(|at| at.elapsed());
            self.subscriptions.reset();
            self.metrics.connected.set(0);

            let reason = match outcome {
                Ok(()) => {
                    self.client.close().await;
                    self.set_state(ConnectionState::Closed);
                    info!("Feed manager shut down");
                    return Ok(());
                }
                Err(e) => e,
            };

            if let Some(duration) = session {
                warn!(error = %reason, session_secs = duration.as_secs(), "Position stream lost");
                self.emit(FeedEvent::Disconnected {
                    reason: reason.to_string(),
                });
                // A session that stayed up long enough wipes the failure history
                if duration >= self.config.backoff_reset_after() && self.backoff.attempts() > 0 {
                    info!(
                        previous_attempts = self.backoff.attempts(),
                        "Resetting reconnect counter after stable session"
                    );
                    self.backoff.reset();
                }
            } else {
                error!(error = %reason, "Connection attempt failed");
            }

            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempts();
                error!(attempts, "Giving up on position stream");
                self.emit(FeedEvent::GaveUp { attempts });
                self.set_state(ConnectionState::Closed);
                return Err(FeedError::MaxReconnectAttemptsExceeded { attempts });
            };

            let attempt = self.backoff.attempts();
            self.metrics.reconnect_attempts.inc();
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting after error...");
            self.set_state(ConnectionState::Reconnecting { attempt });
            self.emit(FeedEvent::Reconnecting { attempt, delay });

            if self.wait(delay).await == Flow::Shutdown {
                self.set_state(ConnectionState::Closed);
                info!("Feed manager shut down while reconnecting");
                return Ok(());
            }
        }
    }

    /// Connect, replay subscriptions, then process frames until the socket dies
    ///
    /// Returns `Ok` only when asked to shut down.
    async fn connect_and_process(&mut self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        self.client.connect(self.config.connect_timeout()).await?;

        self.connected_at = Some(Instant::now());
        self.metrics.connects.inc();
        self.metrics.connected.set(1);
        self.set_state(ConnectionState::Connected);
        self.emit(FeedEvent::Connected);

        if let Some(request) = self.subscriptions.resubscribe_all() {
            info!(channels = ?self.subscriptions.pending().iter().map(Channel::to_string).collect::<Vec<_>>(), "Subscribing");
            self.client.send(&request).await?;
        }

        // Fetched alongside the stream so a slow REST endpoint stalls nothing
        let bootstrap = fetch_snapshots(
            self.snapshots.clone(),
            self.subscriptions.is_wanted(&Channel::Positions),
            self.subscriptions.is_wanted(&Channel::Account),
        );
        tokio::pin!(bootstrap);
        let mut bootstrapped = false;

        let period = self.config.heartbeat_interval();
        let stale_after = self.config.heartbeat_timeout();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                frame = self.client.recv() => {
                    let frame = frame?;
                    // Control frames count as liveness too
                    last_inbound = Instant::now();
                    if let Some(text) = frame {
                        self.handle_frame(&text);
                    }
                }
                _ = heartbeat.tick() => {
                    let silent = last_inbound.elapsed();
                    if silent >= stale_after {
                        warn!(silent_ms = silent.as_millis() as u64, "Connection stale, dropping it");
                        return Err(FeedError::HeartbeatTimeout {
                            elapsed_ms: silent.as_millis() as u64,
                        });
                    }
                    let ping = Request::ping(chrono::Utc::now().timestamp_millis());
                    self.client.send(&ping).await?;
                }
                messages = &mut bootstrap, if !bootstrapped => {
                    bootstrapped = true;
                    for message in messages {
                        // A channel may have been dropped while the fetch ran
                        if message.channel().map_or(true, |c| self.subscriptions.is_wanted(&c)) {
                            self.emit(FeedEvent::Message(message));
                        }
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(FeedCommand::Shutdown) | None => return Ok(()),
                        Some(command) => {
                            if let Some(request) = self.record_command(command, true) {
                                self.client.send(&request).await?;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Sleep out a backoff delay while still taking commands
    async fn wait(&mut self, delay: Duration) -> Flow {
        let timer = sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return Flow::Continue,
                command = self.commands.recv() => match command {
                    Some(FeedCommand::Shutdown) | None => return Flow::Shutdown,
                    Some(command) => {
                        self.record_command(command, false);
                    }
                },
            }
        }
    }

    /// Update the desired set; returns the request to send when online
    fn record_command(&mut self, command: FeedCommand, online: bool) -> Option<Request> {
        match command {
            FeedCommand::Subscribe(channel) => {
                let added = self.subscriptions.insert(channel.clone());
                info!(channel = %channel, added, online, "Subscribe requested");
                if added && online {
                    self.subscriptions.subscribe_request(std::slice::from_ref(&channel))
                } else {
                    None
                }
            }
            FeedCommand::Unsubscribe(channel) => {
                let previous = self.subscriptions.remove(&channel);
                info!(channel = %channel, previous = ?previous, online, "Unsubscribe requested");
                // The venue never accepted a rejected channel
                let live = matches!(
                    previous,
                    Some(SubscriptionState::Pending | SubscriptionState::Active)
                );
                if live && online {
                    Some(self.subscriptions.unsubscribe_request(&channel))
                } else {
                    None
                }
            }
            FeedCommand::Shutdown => None,
        }
    }

    /// Parse one text frame and fan it out
    fn handle_frame(&mut self, raw: &str) {
        let message = match FeedMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.parse_errors.inc();
                warn!(error = %e, "Failed to process message");
                return;
            }
        };
        self.metrics.messages.with_label_values(&[message.kind()]).inc();

        match &message {
            FeedMessage::Subscribed { channel, .. } => {
                if !self.subscriptions.acknowledge(channel) {
                    debug!(channel = %channel, "Ack for channel no longer wanted");
                    return;
                }
                info!(channel = %channel, "Subscription active");
            }
            FeedMessage::Unsubscribed { channel } => {
                debug!(channel = %channel, "Unsubscribed");
            }
            FeedMessage::Pong { ts } => {
                let latency = (chrono::Utc::now().timestamp_millis() - ts).max(0);
                self.metrics.heartbeat_latency_ms.set(latency as f64);
                debug!(latency_ms = latency, "Heartbeat");
                return;
            }
            FeedMessage::Error { id, code, message: reason } => {
                warn!(id = ?id, code = ?code, reason = %reason, "Venue reported an error");
                if let Some(id) = id {
                    for channel in self.subscriptions.reject(*id) {
                        warn!(channel = %channel, "Subscription rejected");
                        self.emit(FeedEvent::SubscriptionRejected {
                            channel,
                            reason: reason.clone(),
                        });
                    }
                }
            }
            FeedMessage::Unknown(msg) => {
                trace!(msg = %msg, "Unknown message type");
                return;
            }
            data => {
                if let Some(channel) = data.channel() {
                    if !self.subscriptions.is_wanted(&channel) {
                        self.metrics.dropped_messages.inc();
                        debug!(channel = %channel, "Dropping data for unsubscribed channel");
                        return;
                    }
                }
            }
        }

        self.emit(FeedEvent::Message(message));
    }

    fn emit(&self, event: FeedEvent) {
        // No listeners is not an error
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

/// REST snapshots so listeners start from a complete book
///
/// Failures are logged; the socket session carries on without them.
async fn fetch_snapshots(
    snapshots: Option<SnapshotClient>,
    want_positions: bool,
    want_account: bool,
) -> Vec<FeedMessage> {
    let mut messages = Vec::new();
    let Some(snapshots) = snapshots else {
        return messages;
    };

    if want_positions {
        match snapshots.positions().await {
            Ok(positions) => {
                info!(count = positions.len(), "Position snapshot loaded");
                messages.push(FeedMessage::Positions {
                    snapshot: true,
                    positions,
                });
            }
            Err(e) => warn!(error = %e, "Failed to fetch position snapshot"),
        }
    }

    if want_account {
        match snapshots.account().await {
            Ok(account) => messages.push(FeedMessage::Account(account)),
            Err(e) => warn!(error = %e, "Failed to fetch account snapshot"),
        }
    }

    messages
}
