//! Channel subscription tracking
//!
//! The set holds the channels consumers asked for. It survives reconnects:
//! on disconnect every active channel falls back to pending and the whole set
//! is requested again on the next connection.

use std::collections::{BTreeMap, HashMap};

use crate::parser::{Channel, Request};

/// Lifecycle of one desired channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Requested (or waiting to be requested), no ack yet
    Pending,
    /// Acknowledged by the venue on the current connection
    Active,
    /// Refused by the venue; not retried until subscribed again
    Rejected,
}

#[derive(Debug, Default)]
pub struct SubscriptionSet {
    channels: BTreeMap<Channel, SubscriptionState>,
    inflight: HashMap<u64, Vec<Channel>>,
    next_id: u64,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels<I>(channels: I) -> Self
    where
        I: IntoIterator<Item = Channel>,
    {
        let mut set = Self::new();
        for channel in channels {
            set.insert(channel);
        }
        set
    }

    /// Add a channel; returns false if it was already desired and not rejected
    pub fn insert(&mut self, channel: Channel) -> bool {
        match self.channels.get(&channel) {
            Some(SubscriptionState::Rejected) | None => {
                self.channels.insert(channel, SubscriptionState::Pending);
                true
            }
            Some(_) => false,
        }
    }

    /// Drop a channel and any in-flight reference to it
    pub fn remove(&mut self, channel: &Channel) -> Option<SubscriptionState> {
        let state = self.channels.remove(channel)?;
        self.inflight.retain(|_, channels| {
            channels.retain(|c| c != channel);
            !channels.is_empty()
        });
        Some(state)
    }

    /// Whether data on `channel` should reach listeners
    pub fn is_wanted(&self, channel: &Channel) -> bool {
        matches!(
            self.channels.get(channel),
            Some(SubscriptionState::Pending | SubscriptionState::Active)
        )
    }

    pub fn state(&self, channel: &Channel) -> Option<SubscriptionState> {
        self.channels.get(channel).copied()
    }

    /// Build a subscribe request for `channels` that are in the set
    pub fn subscribe_request(&mut self, channels: &[Channel]) -> Option<Request> {
        let wanted: Vec<Channel> = channels
            .iter()
            .filter(|c| self.is_wanted(c))
            .cloned()
            .collect();
        if wanted.is_empty() {
            return None;
        }

        for channel in &wanted {
            self.channels.insert(channel.clone(), SubscriptionState::Pending);
        }
        let id = self.allocate_id();
        let request = Request::subscribe(id, &wanted);
        self.inflight.insert(id, wanted);
        Some(request)
    }

    /// Request every non-rejected channel again after a reconnect
    pub fn resubscribe_all(&mut self) -> Option<Request> {
        let channels: Vec<Channel> = self
            .channels
            .iter()
            .filter(|(_, state)| **state != SubscriptionState::Rejected)
            .map(|(channel, _)| channel.clone())
            .collect();
        self.subscribe_request(&channels)
    }

    pub fn unsubscribe_request(&mut self, channel: &Channel) -> Request {
        let id = self.allocate_id();
        Request::unsubscribe(id, std::slice::from_ref(channel))
    }

    /// Mark a channel active; returns false for channels no longer desired
    ///
    /// A late ack does not revive a rejected channel.
    pub fn acknowledge(&mut self, channel: &Channel) -> bool {
        match self.channels.get_mut(channel) {
            Some(SubscriptionState::Rejected) => false,
            Some(state) => {
                *state = SubscriptionState::Active;
                self.inflight.retain(|_, channels| {
                    channels.retain(|c| c != channel);
                    !channels.is_empty()
                });
                true
            }
            None => false,
        }
    }

    /// Mark every still-unacknowledged channel of request `id` rejected
    pub fn reject(&mut self, id: u64) -> Vec<Channel> {
        let channels = self.inflight.remove(&id).unwrap_or_default();
        for channel in &channels {
            if let Some(state) = self.channels.get_mut(channel) {
                *state = SubscriptionState::Rejected;
            }
        }
        channels
    }

    /// Connection lost: nothing is active any more and in-flight ids are void
    pub fn reset(&mut self) {
        for state in self.channels.values_mut() {
            if *state == SubscriptionState::Active {
                *state = SubscriptionState::Pending;
            }
        }
        self.inflight.clear();
    }

    pub fn active(&self) -> Vec<Channel> {
        self.with_state(SubscriptionState::Active)
    }

    pub fn pending(&self) -> Vec<Channel> {
        self.with_state(SubscriptionState::Pending)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn with_state(&self, wanted: SubscriptionState) -> Vec<Channel> {
        self.channels
            .iter()
            .filter(|(_, state)| **state == wanted)
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}
