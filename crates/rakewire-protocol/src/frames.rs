//! Frame types for the Rakewire protocol.
//!
//! Every frame is a JSON object tagged by its `type` field. Frames travel in
//! one direction only: [`ClientFrame`] from dashboard to server,
//! [`ServerFrame`] from server to dashboard.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Every envelope type known to the protocol, in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Subscribe,
    Unsubscribe,
    Message,
    Subscribed,
    Update,
    Error,
    Heartbeat,
}

impl FrameType {
    /// Wire name of the type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Subscribe => "subscribe",
            FrameType::Unsubscribe => "unsubscribe",
            FrameType::Message => "message",
            FrameType::Subscribed => "subscribed",
            FrameType::Update => "update",
            FrameType::Error => "error",
            FrameType::Heartbeat => "heartbeat",
        }
    }

    /// Whether a client is allowed to send this type.
    #[must_use]
    pub fn is_client_type(&self) -> bool {
        matches!(
            self,
            FrameType::Subscribe | FrameType::Unsubscribe | FrameType::Message | FrameType::Heartbeat
        )
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscribe" => Ok(FrameType::Subscribe),
            "unsubscribe" => Ok(FrameType::Unsubscribe),
            "message" => Ok(FrameType::Message),
            "subscribed" => Ok(FrameType::Subscribed),
            "update" => Ok(FrameType::Update),
            "error" => Ok(FrameType::Error),
            "heartbeat" => Ok(FrameType::Heartbeat),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A frame sent by a dashboard client.
///
/// `subscribe` and `unsubscribe` accept either a single `channel` or a
/// `channels` list; older dashboards only ever sent the list form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Join one or more channels.
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        channels: Vec<String>,
    },

    /// Leave one or more channels.
    Unsubscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        channels: Vec<String>,
    },

    /// Broadcast a payload to every member of a channel, sender included.
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Application level keepalive.
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            ClientFrame::Subscribe { .. } => FrameType::Subscribe,
            ClientFrame::Unsubscribe { .. } => FrameType::Unsubscribe,
            ClientFrame::Message { .. } => FrameType::Message,
            ClientFrame::Heartbeat { .. } => FrameType::Heartbeat,
        }
    }

    /// Create a Subscribe frame for a single channel.
    #[must_use]
    pub fn subscribe(channel: impl Into<String>) -> Self {
        ClientFrame::Subscribe {
            channel: Some(channel.into()),
            channels: Vec::new(),
        }
    }

    /// Create an Unsubscribe frame for a single channel.
    #[must_use]
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        ClientFrame::Unsubscribe {
            channel: Some(channel.into()),
            channels: Vec::new(),
        }
    }

    /// Create a Message frame.
    #[must_use]
    pub fn message(channel: impl Into<String>, data: Value) -> Self {
        ClientFrame::Message {
            channel: Some(channel.into()),
            data: Some(data),
        }
    }

    /// Create a Heartbeat frame.
    #[must_use]
    pub fn heartbeat() -> Self {
        ClientFrame::Heartbeat { timestamp: None }
    }

    /// Channel names targeted by a subscribe or unsubscribe frame.
    ///
    /// The single `channel` comes first, duplicates are dropped. Other frame
    /// types return an empty list.
    #[must_use]
    pub fn channel_names(&self) -> Vec<&str> {
        let (channel, channels) = match self {
            ClientFrame::Subscribe { channel, channels }
            | ClientFrame::Unsubscribe { channel, channels } => (channel, channels),
            _ => return Vec::new(),
        };

        let mut names: Vec<&str> = Vec::with_capacity(channels.len() + 1);
        for name in channel.iter().chain(channels.iter()) {
            if !names.contains(&name.as_str()) {
                names.push(name.as_str());
            }
        }
        names
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Subscription confirmed.
    Subscribed { channel: String },

    /// Backend event. `channel` is absent for directly addressed updates.
    Update {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Payload relayed from another client of the channel.
    Message {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },

    /// Request could not be honoured; the connection stays open.
    Error { message: String },

    /// Reply to a client heartbeat.
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerFrame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            ServerFrame::Subscribed { .. } => FrameType::Subscribed,
            ServerFrame::Update { .. } => FrameType::Update,
            ServerFrame::Message { .. } => FrameType::Message,
            ServerFrame::Error { .. } => FrameType::Error,
            ServerFrame::Heartbeat { .. } => FrameType::Heartbeat,
        }
    }

    /// Create a Subscribed frame.
    #[must_use]
    pub fn subscribed(channel: impl Into<String>) -> Self {
        ServerFrame::Subscribed {
            channel: channel.into(),
        }
    }

    /// Create a channel Update frame.
    #[must_use]
    pub fn update(channel: impl Into<String>, data: Value) -> Self {
        ServerFrame::Update {
            channel: Some(channel.into()),
            data: Some(data),
        }
    }

    /// Create an Update frame that is not bound to a channel.
    #[must_use]
    pub fn direct_update(data: Value) -> Self {
        ServerFrame::Update {
            channel: None,
            data: Some(data),
        }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    /// Create the error frame sent when a channel is refused.
    #[must_use]
    pub fn access_denied(channel: &str) -> Self {
        Self::error(format!("Access denied to channel: {channel}"))
    }

    /// Create a Heartbeat reply echoing the client's timestamp.
    #[must_use]
    pub fn heartbeat(timestamp: Option<u64>) -> Self {
        ServerFrame::Heartbeat { timestamp }
    }

    /// Channel the frame belongs to, if any.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            ServerFrame::Subscribed { channel } | ServerFrame::Message { channel, .. } => {
                Some(channel.as_str())
            }
            ServerFrame::Update { channel, .. } => channel.as_deref(),
            ServerFrame::Error { .. } | ServerFrame::Heartbeat { .. } => None,
        }
    }
}
