//! Parser module for the position feed wire protocol
//!
//! Inbound frames are JSON objects carrying either an `event` field (control
//! frames: acks, pongs, errors) or a `channel` field (data). Outbound frames
//! are `op`-tagged requests.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{FeedError, Result};
use crate::risk::position::check_magnitude;
use crate::risk::{PositionSnapshot, MAX_MAGNITUDE};

const MARK_PRICE_PREFIX: &str = "markPrice:";

/// A subscribable stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Positions,
    Account,
    MarkPrice(String),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Positions => write!(f, "positions"),
            Channel::Account => write!(f, "account"),
            Channel::MarkPrice(symbol) => write!(f, "{}{}", MARK_PRICE_PREFIX, symbol),
        }
    }
}

impl FromStr for Channel {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "positions" => Ok(Channel::Positions),
            "account" => Ok(Channel::Account),
            other => match other.strip_prefix(MARK_PRICE_PREFIX) {
                Some(symbol) if !symbol.trim().is_empty() => {
                    Ok(Channel::MarkPrice(symbol.trim().to_uppercase()))
                }
                _ => Err(FeedError::ParseError(format!("Unknown channel: {}", other))),
            },
        }
    }
}

/// Outbound request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request {
    Subscribe { id: u64, args: Vec<String> },
    Unsubscribe { id: u64, args: Vec<String> },
    Ping { ts: i64 },
}

impl Request {
    pub fn subscribe(id: u64, channels: &[Channel]) -> Self {
        Request::Subscribe {
            id,
            args: channels.iter().map(Channel::to_string).collect(),
        }
    }

    pub fn unsubscribe(id: u64, channels: &[Channel]) -> Self {
        Request::Unsubscribe {
            id,
            args: channels.iter().map(Channel::to_string).collect(),
        }
    }

    pub fn ping(ts: i64) -> Self {
        Request::Ping { ts }
    }
}

/// Mark price tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkPriceUpdate {
    pub symbol: String,
    pub mark_price: Decimal,
    #[serde(default)]
    pub index_price: Option<Decimal>,
    #[serde(default)]
    pub funding_rate: Option<Decimal>,
    /// Event time (milliseconds)
    #[serde(default)]
    pub ts: u64,
}

/// Account balance update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUpdate {
    pub wallet_balance: Decimal,
    #[serde(default)]
    pub available_balance: Option<Decimal>,
    #[serde(default)]
    pub update_time: u64,
}

impl AccountUpdate {
    /// Balances may be negative but stay within the calculator's range
    pub fn validate(&self) -> Result<()> {
        let balances = [Some(self.wallet_balance), self.available_balance];
        if balances.iter().flatten().any(|b| b.abs() > MAX_MAGNITUDE) {
            return Err(FeedError::ParseError(format!(
                "account balance exceeds {}",
                MAX_MAGNITUDE
            )));
        }
        Ok(())
    }
}

/// Raw envelope shared by every inbound frame
#[derive(Debug, Deserialize)]
struct Envelope {
    event: Option<String>,
    channel: Option<String>,
    id: Option<u64>,
    #[serde(rename = "type")]
    kind: Option<String>,
    data: Option<serde_json::Value>,
    code: Option<i64>,
    message: Option<String>,
    ts: Option<i64>,
}

/// `data` may carry one position or a list of them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<PositionSnapshot>),
    One(PositionSnapshot),
}

/// Parsed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// `snapshot` replaces every tracked position; otherwise an upsert
    Positions {
        snapshot: bool,
        positions: Vec<PositionSnapshot>,
    },
    MarkPrice(MarkPriceUpdate),
    Account(AccountUpdate),
    Subscribed {
        channel: Channel,
        id: Option<u64>,
    },
    Unsubscribed {
        channel: Channel,
    },
    Pong {
        ts: i64,
    },
    Error {
        id: Option<u64>,
        code: Option<i64>,
        message: String,
    },
    Unknown(String),
}

impl FeedMessage {
    /// Parse a raw text frame
    pub fn parse(raw: &str) -> Result<Self> {
        let mut envelope: Envelope = serde_json::from_str(raw)?;

        if let Some(event) = envelope.event.take() {
            return Self::parse_event(&event, envelope, raw);
        }

        match envelope.channel.as_deref() {
            Some(channel) => {
                let channel: Channel = channel.parse()?;
                let data = envelope
                    .data
                    .ok_or_else(|| FeedError::ParseError(format!("{} frame without data", channel)))?;
                Self::parse_channel_data(channel, envelope.kind.as_deref(), data)
            }
            None => Ok(FeedMessage::Unknown(raw.to_string())),
        }
    }

    fn parse_event(event: &str, envelope: Envelope, raw: &str) -> Result<Self> {
        match event {
            "subscribed" => Ok(FeedMessage::Subscribed {
                channel: Self::required_channel(&envelope)?,
                id: envelope.id,
            }),
            "unsubscribed" => Ok(FeedMessage::Unsubscribed {
                channel: Self::required_channel(&envelope)?,
            }),
            "pong" => Ok(FeedMessage::Pong {
                ts: envelope.ts.unwrap_or_default(),
            }),
            "error" => Ok(FeedMessage::Error {
                id: envelope.id,
                code: envelope.code,
                message: envelope.message.unwrap_or_else(|| "unspecified error".to_string()),
            }),
            _ => Ok(FeedMessage::Unknown(raw.to_string())),
        }
    }

    fn required_channel(envelope: &Envelope) -> Result<Channel> {
        envelope
            .channel
            .as_deref()
            .ok_or_else(|| FeedError::ParseError("event without channel".to_string()))?
            .parse()
    }

    fn parse_channel_data(channel: Channel, kind: Option<&str>, data: serde_json::Value) -> Result<Self> {
        match channel {
            Channel::Positions => {
                let mut positions = match serde_json::from_value::<OneOrMany>(data)? {
                    OneOrMany::Many(list) => list,
                    OneOrMany::One(single) => vec![single],
                };
                for position in &mut positions {
                    position.normalize();
                    position.validate()?;
                }
                Ok(FeedMessage::Positions {
                    snapshot: kind == Some("snapshot"),
                    positions,
                })
            }
            Channel::Account => {
                let account: AccountUpdate = serde_json::from_value(data)?;
                account.validate()?;
                Ok(FeedMessage::Account(account))
            }
            Channel::MarkPrice(symbol) => {
                let mut update: MarkPriceUpdate = serde_json::from_value(data)?;
                // The channel name is authoritative for routing
                if !update.symbol.eq_ignore_ascii_case(&symbol) {
                    return Err(FeedError::ParseError(format!(
                        "mark price for {} on channel markPrice:{}",
                        update.symbol, symbol
                    )));
                }
                check_magnitude(&symbol, "mark price", update.mark_price)?;
                update.symbol = symbol;
                Ok(FeedMessage::MarkPrice(update))
            }
        }
    }

    /// Data channel this message arrived on, if it is a data message
    pub fn channel(&self) -> Option<Channel> {
        match self {
            FeedMessage::Positions { .. } => Some(Channel::Positions),
            FeedMessage::Account(_) => Some(Channel::Account),
            FeedMessage::MarkPrice(update) => Some(Channel::MarkPrice(update.symbol.clone())),
            _ => None,
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            FeedMessage::Positions { .. } => "positions",
            FeedMessage::MarkPrice(_) => "mark_price",
            FeedMessage::Account(_) => "account",
            FeedMessage::Subscribed { .. } => "subscribed",
            FeedMessage::Unsubscribed { .. } => "unsubscribed",
            FeedMessage::Pong { .. } => "pong",
            FeedMessage::Error { .. } => "error",
            FeedMessage::Unknown(_) => "unknown",
        }
    }
}
