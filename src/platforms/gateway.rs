// src/platforms/gateway.rs - Discord reached through a local IRC-speaking gateway proxy

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::platforms::{irc, spawn_forwarder, spawn_keepalive, LineLink, PlatformConnection};
use crate::types::{Message, Platform};

/// Configuration for the gateway proxy connection
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// `host:port` of the proxy
    pub address: String,
    pub username: String,
    /// Discord bot token, passed through the proxy's PASS command
    pub password: String,
}

pub struct GatewayConnection {
    config: GatewayConfig,
}

impl GatewayConnection {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    fn login_lines(&self) -> Vec<String> {
        vec![
            format!("PASS {}", self.config.password),
            format!("NICK {}", self.config.username),
            format!("USER {} 0 * :{}", self.config.username, self.config.username),
        ]
    }
}

#[async_trait]
impl PlatformConnection for GatewayConnection {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    fn nickname(&self) -> &str {
        &self.config.username
    }

    async fn run_session(&self, inbound: &mpsc::Sender<Message>, link: &LineLink) -> Result<()> {
        let stream = TcpStream::connect(&self.config.address)
            .await
            .with_context(|| format!("Failed to connect to gateway at {}", self.config.address))?;
        let (read_half, mut write_half) = stream.into_split();

        let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
        let writer = tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                let data = format!("{}\r\n", line);
                if let Err(e) = write_half.write_all(data.as_bytes()).await {
                    error!("Failed to write to gateway: {}", e);
                    break;
                }
            }
        });

        for line in self.login_lines() {
            line_tx.send(line).await.context("Gateway writer stopped during login")?;
        }
        *link.write().await = Some(line_tx.clone());
        info!("Logged in to gateway at {}", self.config.address);

        let keepalive = spawn_keepalive(Platform::Discord, line_tx.clone());
        let forward = spawn_forwarder(Platform::Discord, inbound.clone());
        let mut lines = BufReader::new(read_half).lines();

        let result: Result<()> = loop {
            match lines.next_line().await {
                Ok(Some(raw)) => {
                    if let Err(e) = irc::handle_line(Platform::Discord, &raw, &line_tx, &forward).await {
                        break Err(e);
                    }
                }
                Ok(None) => {
                    warn!("Gateway closed the connection");
                    break Ok(());
                }
                Err(e) => break Err(anyhow::Error::new(e).context("Gateway read error")),
            }
        };

        keepalive.abort();
        *link.write().await = None;
        writer.abort();
        result
    }
}
