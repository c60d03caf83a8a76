use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use crate::platforms::{irc, spawn_forwarder, spawn_keepalive, LineLink, PlatformConnection};
use crate::types::{Message, Platform};

pub const DEFAULT_TWITCH_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

/// Configuration for Twitch connection
#[derive(Debug, Clone)]
pub struct TwitchConfig {
    pub url: String,
    pub username: String,
    pub oauth_token: String, // oauth:your_token_here
    pub extended_char_limit: bool,
}

impl TwitchConfig {
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.url).with_context(|| format!("Invalid Twitch URL: {}", self.url))?;

        if !self.oauth_token.starts_with("oauth:") {
            bail!(
                "Twitch OAuth token must start with 'oauth:' - got: {}...",
                self.oauth_token.chars().take(6).collect::<String>()
            );
        }
        Ok(())
    }
}

/// Twitch IRC-over-WebSocket connection
pub struct TwitchConnection {
    config: TwitchConfig,
}

impl TwitchConnection {
    pub fn new(config: TwitchConfig) -> Self {
        Self { config }
    }

    fn login_lines(&self) -> Vec<String> {
        vec![
            format!("PASS {}", self.config.oauth_token),
            format!("NICK {}", self.config.username),
            "CAP REQ :twitch.tv/membership".to_string(),
            "CAP REQ :twitch.tv/commands".to_string(),
            "CAP REQ :twitch.tv/tags".to_string(),
        ]
    }
}

#[async_trait]
impl PlatformConnection for TwitchConnection {
    fn platform(&self) -> Platform {
        Platform::Twitch
    }

    fn nickname(&self) -> &str {
        &self.config.username
    }

    fn extended_char_limit(&self) -> bool {
        self.config.extended_char_limit
    }

    async fn run_session(&self, inbound: &mpsc::Sender<Message>, link: &LineLink) -> Result<()> {
        let url = Url::parse(&self.config.url).context("Failed to parse Twitch WebSocket URL")?;

        let (ws_stream, _) = connect_async(url)
            .await
            .context("Failed to connect to Twitch WebSocket")?;
        let (mut write, mut read) = ws_stream.split();

        let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
        let writer = tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(format!("{}\r\n", line))).await {
                    error!("Failed to write to Twitch: {}", e);
                    break;
                }
            }
        });

        for line in self.login_lines() {
            line_tx.send(line).await.context("Twitch writer stopped during login")?;
        }
        *link.write().await = Some(line_tx.clone());
        info!("Logged in to Twitch as {}", self.config.username);

        let keepalive = spawn_keepalive(Platform::Twitch, line_tx.clone());
        let forward = spawn_forwarder(Platform::Twitch, inbound.clone());

        let result: Result<()> = 'session: loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    // Several protocol lines may share one frame
                    for raw in text.split('\n').filter(|raw| !raw.trim().is_empty()) {
                        if let Err(e) = irc::handle_line(Platform::Twitch, raw, &line_tx, &forward).await {
                            break 'session Err(e);
                        }
                    }
                }
                Some(Ok(WsMessage::Ping(_))) => debug!("Received WebSocket ping"),
                Some(Ok(WsMessage::Close(close_frame))) => {
                    info!("WebSocket connection closed: {:?}", close_frame);
                    break 'session Ok(());
                }
                Some(Ok(_)) => debug!("Ignoring non-text WebSocket frame"),
                Some(Err(e)) => break 'session Err(anyhow::Error::new(e).context("WebSocket error")),
                None => {
                    warn!("WebSocket stream ended");
                    break 'session Ok(());
                }
            }
        };

        keepalive.abort();
        *link.write().await = None;
        writer.abort();
        result
    }
}
