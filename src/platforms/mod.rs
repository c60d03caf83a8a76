use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

use crate::types::{Message, OutboundRequest, Platform};

pub mod gateway;
pub mod irc;
pub mod twitch;

/// Delay before reconnecting after a dropped or failed session
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(120);

/// Interval between keepalive PINGs on an idle session
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(300);

/// Minimum spacing between outbound requests (19.5 messages per 30 seconds)
pub const OUTBOUND_INTERVAL: Duration = Duration::from_millis(1539);

/// Parsed events a session may hold while the dispatcher is busy
pub const FORWARD_BUFFER: usize = 100;

/// Raw-line sender of the currently connected session, if any
pub type LineLink = Arc<RwLock<Option<mpsc::Sender<String>>>>;

/// Dispatcher-side view of a running connection adapter
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub platform: Platform,
    /// Lowercased account name the adapter logs in with
    pub nickname: String,
    /// Whether the service accepts 500-character lines
    pub extended_char_limit: bool,
    outbound: mpsc::Sender<OutboundRequest>,
}

impl ConnectionHandle {
    pub fn new(
        platform: Platform,
        nickname: &str,
        extended_char_limit: bool,
        outbound: mpsc::Sender<OutboundRequest>,
    ) -> Self {
        Self {
            platform,
            nickname: crate::bot::outbound::irc_lower(nickname),
            extended_char_limit,
            outbound,
        }
    }

    /// Queue a request without waiting; a full queue drops the request
    pub fn enqueue(&self, request: OutboundRequest) -> bool {
        match self.outbound.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!("Outbound queue for {} is full, dropping {:?}", self.platform, request);
                false
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                error!("Outbound queue for {} is closed, dropping {:?}", self.platform, request);
                false
            }
        }
    }

    /// Queue every request or none of them
    pub fn enqueue_all(&self, requests: Vec<OutboundRequest>) -> bool {
        if requests.is_empty() {
            return true;
        }

        match self.outbound.try_reserve_many(requests.len()) {
            Ok(permits) => {
                for (permit, request) in permits.zip(requests) {
                    permit.send(request);
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(())) => {
                info!(
                    "Outbound queue for {} has no room for {} requests, dropping all of them",
                    self.platform,
                    requests.len()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                error!("Outbound queue for {} is closed, dropping {:?}", self.platform, requests);
                false
            }
        }
    }
}

/// PING the server on an idle timer, independent of the read loop
pub(crate) fn spawn_keepalive(platform: Platform, lines: mpsc::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(KEEPALIVE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if lines.send("PING :keep-alive".to_string()).await.is_err() {
                debug!("{} keepalive stopped", platform);
                break;
            }
        }
    })
}

/// Move parsed events into the dispatcher queue so the reader never waits on it.
///
/// The task ends once the returned sender is dropped and the buffer drained,
/// or when the dispatcher queue closes.
pub(crate) fn spawn_forwarder(platform: Platform, inbound: mpsc::Sender<Message>) -> mpsc::Sender<Message> {
    let (forward_tx, mut forward_rx) = mpsc::channel::<Message>(FORWARD_BUFFER);
    tokio::spawn(async move {
        while let Some(message) = forward_rx.recv().await {
            if inbound.send(message).await.is_err() {
                debug!("Inbound queue closed, {} forwarder stopping", platform);
                break;
            }
        }
    });
    forward_tx
}

/// Trait defining the interface all platform connections must implement
#[async_trait]
pub trait PlatformConnection: Send + Sync {
    /// Get the platform identifier
    fn platform(&self) -> Platform;

    /// Account name used to log in
    fn nickname(&self) -> &str;

    /// Whether the service accepts 500-character lines
    fn extended_char_limit(&self) -> bool {
        false
    }

    /// Connect, log in and pump inbound lines until the session ends.
    ///
    /// While connected, `link` holds the sender for raw outbound lines.
    async fn run_session(&self, inbound: &mpsc::Sender<Message>, link: &LineLink) -> Result<()>;
}

/// Start the reconnect loop and the outbound pump for `connection`.
///
/// Returns the handle the dispatcher uses to queue outbound requests.
pub fn spawn_connection(
    connection: Arc<dyn PlatformConnection>,
    inbound: mpsc::Sender<Message>,
    outbound_capacity: usize,
) -> ConnectionHandle {
    let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity.max(1));
    let handle = ConnectionHandle::new(
        connection.platform(),
        connection.nickname(),
        connection.extended_char_limit(),
        outbound_tx,
    );

    let link: LineLink = Arc::new(RwLock::new(None));
    tokio::spawn(pump_outbound(connection.platform(), outbound_rx, Arc::clone(&link)));
    tokio::spawn(async move {
        let platform = connection.platform();
        loop {
            info!("Connecting to {}...", platform);
            match connection.run_session(&inbound, &link).await {
                Ok(()) => info!("Disconnected from {}", platform),
                Err(e) => error!("{} session failed: {:#}", platform, e),
            }
            *link.write().await = None;

            if inbound.is_closed() {
                info!("Inbound queue closed, {} connection stopping", platform);
                break;
            }
            sleep(RECONNECT_INTERVAL).await;
        }
    });

    handle
}

/// Drain the outbound queue into the connected session at the service's pace
async fn pump_outbound(platform: Platform, mut outbound: mpsc::Receiver<OutboundRequest>, link: LineLink) {
    while let Some(request) = outbound.recv().await {
        let lines = match irc::encode_request(&request) {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Skipping outbound {} request {:?}: {}", platform, request, e);
                continue;
            }
        };

        let sender = link.read().await.clone();
        let Some(sender) = sender else {
            error!("Not connected to {}. Dropping output item {:?}", platform, request);
            continue;
        };

        debug!("Process outbound queue item {:?} for {}", request, platform);
        for line in lines {
            if sender.send(line).await.is_err() {
                warn!("{} session closed while sending", platform);
                break;
            }
        }

        sleep(OUTBOUND_INTERVAL).await;
    }
    debug!("{} outbound queue closed", platform);
}
