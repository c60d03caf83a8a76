// src/types/mod.rs - Normalized inbound events and outbound requests

use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel-name prefix reserved for the gateway-proxied platform
pub const GATEWAY_CHANNEL_PREFIX: &str = "&";

/// Pseudo-channel the gateway proxy interprets as a presence update
pub const PRESENCE_CHANNEL: &str = "&#+!presence";

/// Platforms the bot can be connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// IRC-based streaming-site chat
    Twitch,
    /// Discord, reached through a local IRC-speaking gateway proxy
    Discord,
}

impl Platform {
    /// Derive the platform that owns a channel from its name prefix
    pub fn for_channel(channel: &str) -> Self {
        if channel.starts_with(GATEWAY_CHANNEL_PREFIX) {
            Platform::Discord
        } else {
            Platform::Twitch
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Platform::Twitch => "twitch",
            Platform::Discord => "discord",
        }
    }

    /// Capitalised name for user-facing text
    pub fn title(&self) -> &'static str {
        match self {
            Platform::Twitch => "Twitch",
            Platform::Discord => "Discord",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kinds of inbound events an adapter can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Welcome,
    PubMsg,
    Action,
    Whisper,
    Join,
    Part,
    Notice,
    Clear,
}

impl EventType {
    /// Channel text that is eligible for command matching
    pub fn is_chat_text(&self) -> bool {
        matches!(self, EventType::PubMsg | EventType::Action)
    }
}

/// Normalized inbound event.
///
/// Adapters guarantee `username` and `channel` are already lowercased.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub event_type: EventType,
    pub channel: Option<String>,
    pub username: String,
    pub display_name: Option<String>,
    pub user_id: Option<String>,
    pub text: Option<String>,
    pub source: Platform,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Message {
    pub fn new(event_type: EventType, source: Platform) -> Self {
        Self {
            event_type,
            channel: None,
            username: String::new(),
            display_name: None,
            user_id: None,
            text: None,
            source,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Channel text message, mostly useful for tests and adapters
    pub fn chat(source: Platform, channel: &str, username: &str, text: &str) -> Self {
        Self {
            channel: Some(channel.to_string()),
            username: username.to_string(),
            text: Some(text.to_string()),
            ..Self::new(EventType::PubMsg, source)
        }
    }

    pub fn channel(&self) -> &str {
        self.channel.as_deref().unwrap_or("")
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    /// Original-case name, falling back to the identity key
    pub fn nick(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

/// Requests handed from the dispatcher to a connection adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundRequest {
    SendText {
        target: String,
        text: String,
        action: bool,
    },
    Join {
        channel: String,
    },
    Part {
        channel: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_from_channel_prefix() {
        assert_eq!(Platform::for_channel("#test"), Platform::Twitch);
        assert_eq!(Platform::for_channel("&1234"), Platform::Discord);
        assert_eq!(Platform::for_channel(PRESENCE_CHANNEL), Platform::Discord);
    }

    #[test]
    fn test_message_accessors() {
        let mut message = Message::chat(Platform::Twitch, "#test", "alice", "hi");
        assert_eq!(message.nick(), "alice");
        message.display_name = Some("Alice".to_string());
        assert_eq!(message.nick(), "Alice");
        assert!(message.event_type.is_chat_text());
        assert!(!EventType::Join.is_chat_text());
    }
}
