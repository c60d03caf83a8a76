//! # relaybot
//!
//! A chat bot that sits in Twitch channels and, through a local IRC-speaking
//! gateway proxy, Discord channels.
//!
//! Every connection adapter feeds normalized [`types::Message`]s into one
//! bounded queue. A single dispatcher task owns all mutable state and runs
//! the registered handlers, the rate limiters and the cooperative scheduler,
//! so handlers never need locks. Outbound text goes through the formatter in
//! [`bot::outbound`] before it is queued to the connection that owns the
//! channel.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relaybot::prelude::*;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BotConfig::load(std::path::Path::new("bot.yaml")).await?;
//!     let (inbound_tx, inbound_rx) = mpsc::channel(config.queues.inbound_capacity);
//!
//!     let twitch = spawn_connection(
//!         Arc::new(TwitchConnection::new(config.twitch_config())),
//!         inbound_tx,
//!         config.queues.outbound_capacity,
//!     );
//!
//!     let features = Features::new(config.feature_settings(), Box::new(MemoryMailbox::new()));
//!     let mut bot = Bot::new(config.bot_settings(), vec![twitch], inbound_rx, features);
//!     Features::install(&mut bot)?;
//!     bot.run().await
//! }
//! ```

pub mod bot;
pub mod config;
pub mod features;
pub mod platforms;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::{Bot, BotCore, BotSettings, SendOptions, Session};
    pub use crate::config::BotConfig;
    pub use crate::features::mail::{Mailbox, MemoryMailbox};
    pub use crate::features::{FeatureSettings, Features};
    pub use crate::platforms::{
        gateway::{GatewayConfig, GatewayConnection},
        spawn_connection,
        twitch::{TwitchConfig, TwitchConnection},
        ConnectionHandle, PlatformConnection,
    };
    pub use crate::types::{EventType, Message, OutboundRequest, Platform};
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
