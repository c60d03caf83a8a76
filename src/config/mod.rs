// src/config/mod.rs - Bot configuration file loading and validation

use anyhow::{bail, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;
use tokio::fs;
use tokio::time::Duration;

use crate::bot::rate_limit::DEFAULT_TABLE_CAPACITY;
use crate::bot::BotSettings;
use crate::features::FeatureSettings;
use crate::platforms::gateway::GatewayConfig;
use crate::platforms::twitch::{TwitchConfig, DEFAULT_TWITCH_URL};

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Account name used on every platform
    pub username: String,
    pub channels: Vec<String>,
    /// Channels joined only to listen; commands are ignored there
    #[serde(default)]
    pub lurk_channels: Vec<String>,
    #[serde(default)]
    pub ignored_users: Vec<String>,
    pub twitch: TwitchSection,
    #[serde(default)]
    pub gateway: Option<GatewaySection>,
    #[serde(default)]
    pub help_text: String,
    #[serde(default)]
    pub rate_limits: RateLimitSection,
    #[serde(default)]
    pub queues: QueueSection,
    #[serde(default)]
    pub mail: MailSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitchSection {
    #[serde(default = "default_twitch_url")]
    pub url: String,
    /// May be left empty and supplied through `TWITCH_OAUTH_TOKEN`
    #[serde(default)]
    pub oauth_token: String,
    #[serde(default)]
    pub extended_char_limit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    /// `host:port` of the local proxy
    pub address: String,
    /// May be left empty and supplied through `GATEWAY_PASSWORD`
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub user_interval_secs: f64,
    pub channel_interval_secs: f64,
    pub table_capacity: usize,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            user_interval_secs: 3.0,
            channel_interval_secs: 0.2,
            table_capacity: DEFAULT_TABLE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub poll_interval_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            inbound_capacity: 100,
            outbound_capacity: 10,
            poll_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MailSection {
    pub disabled_channels: Vec<String>,
    /// Channels that only read mail posted in the same channel
    pub restricted_channels: Vec<String>,
}

fn default_twitch_url() -> String {
    DEFAULT_TWITCH_URL.to_string()
}

impl BotConfig {
    /// Load from `path`; the extension picks YAML, JSON or TOML
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let mut config = Self::parse(&content, &extension)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;

        info!(
            "Loaded configuration from {} ({} channels, gateway {})",
            path.display(),
            config.channels.len(),
            if config.gateway.is_some() { "enabled" } else { "disabled" }
        );
        Ok(config)
    }

    fn parse(content: &str, extension: &str) -> Result<Self> {
        let config = match extension {
            "yaml" | "yml" => serde_yaml::from_str(content)?,
            "json" => serde_json::from_str(content)?,
            "toml" => toml::from_str(content)?,
            other => bail!("Unsupported config format '{}'", other),
        };
        Ok(config)
    }

    /// Secrets from the environment win over the file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var("TWITCH_OAUTH_TOKEN") {
            debug!("Using Twitch OAuth token from environment");
            self.twitch.oauth_token = token;
        }
        if let (Some(gateway), Ok(password)) = (self.gateway.as_mut(), env::var("GATEWAY_PASSWORD")) {
            debug!("Using gateway password from environment");
            gateway.password = password;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            bail!("username must not be empty");
        }
        if self.channels.is_empty() {
            bail!("at least one channel must be configured");
        }
        if let Some(channel) = self
            .channels
            .iter()
            .chain(&self.lurk_channels)
            .find(|channel| !crate::platforms::irc::is_channel(channel))
        {
            bail!("'{}' is not a channel name", channel);
        }

        self.twitch_config().validate()?;

        if let Some(gateway) = &self.gateway {
            if gateway.address.trim().is_empty() {
                bail!("gateway address must not be empty");
            }
        }

        let limits = &self.rate_limits;
        for (name, value) in [
            ("user_interval_secs", limits.user_interval_secs),
            ("channel_interval_secs", limits.channel_interval_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("rate_limits.{} must be a non-negative number, got {}", name, value);
            }
        }
        if limits.table_capacity == 0 {
            bail!("rate_limits.table_capacity must be positive");
        }

        let queues = &self.queues;
        if queues.inbound_capacity == 0 || queues.outbound_capacity == 0 {
            bail!("queue capacities must be positive");
        }
        if queues.poll_interval_ms == 0 {
            bail!("queues.poll_interval_ms must be positive");
        }

        Ok(())
    }

    pub fn bot_settings(&self) -> BotSettings {
        BotSettings {
            channels: self.channels.clone(),
            lurk_channels: self.lurk_channels.clone(),
            ignored_users: self.ignored_users.clone(),
            user_interval: Duration::from_secs_f64(self.rate_limits.user_interval_secs),
            channel_interval: Duration::from_secs_f64(self.rate_limits.channel_interval_secs),
            limiter_capacity: self.rate_limits.table_capacity,
            poll_interval: Duration::from_millis(self.queues.poll_interval_ms),
        }
    }

    pub fn feature_settings(&self) -> FeatureSettings {
        let lowered = |channels: &[String]| -> HashSet<String> {
            channels
                .iter()
                .map(|channel| crate::bot::outbound::irc_lower(channel))
                .collect()
        };

        FeatureSettings {
            help_text: self.help_text.clone(),
            mail_disabled_channels: lowered(&self.mail.disabled_channels),
            mail_restricted_channels: lowered(&self.mail.restricted_channels),
        }
    }

    pub fn twitch_config(&self) -> TwitchConfig {
        TwitchConfig {
            url: self.twitch.url.clone(),
            username: self.username.clone(),
            oauth_token: self.twitch.oauth_token.clone(),
            extended_char_limit: self.twitch.extended_char_limit,
        }
    }

    pub fn gateway_config(&self) -> Option<GatewayConfig> {
        self.gateway.as_ref().map(|gateway| GatewayConfig {
            address: gateway.address.clone(),
            username: self.username.clone(),
            password: gateway.password.clone(),
        })
    }
}
