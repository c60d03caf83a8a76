use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

use crate::platforms::ConnectionHandle;
use crate::types::{EventType, Message, OutboundRequest, Platform, PRESENCE_CHANNEL};

pub mod outbound;
pub mod rate_limit;
pub mod scheduler;
pub mod session;

use outbound::{check_text, escape_links, irc_lower, split_multiline, strip_unsafe_chars, MessageLimits};
use rate_limit::RateLimiter;
use scheduler::Scheduler;
pub use session::Session;

/// Channels joined per JOIN request
const JOIN_BATCH_SIZE: usize = 10;

/// Budget for private messages on the primary platform
const WHISPER_LIMITS: MessageLimits = MessageLimits {
    max_chars: 400,
    max_bytes: 450,
};

/// Target the primary platform routes whispers through
const WHISPER_CHANNEL: &str = "#jtv";

/// Handler invoked with the per-message session
pub type Handler<S> = Box<dyn FnMut(&mut Session<'_, S>) -> Result<()> + Send>;

/// Command pattern with its handler, consulted in registration order
pub struct RegisteredCommand<S> {
    pub pattern: Regex,
    handler: Handler<S>,
    pub ignore_rate_limit: bool,
}

/// Handler run for every message of one event type
pub struct MessageHandler<S> {
    pub event_type: EventType,
    handler: Handler<S>,
}

/// Dispatcher settings, already validated by the bootstrap layer
#[derive(Debug, Clone)]
pub struct BotSettings {
    pub channels: Vec<String>,
    pub lurk_channels: Vec<String>,
    pub ignored_users: Vec<String>,
    pub user_interval: Duration,
    pub channel_interval: Duration,
    pub limiter_capacity: usize,
    pub poll_interval: Duration,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            lurk_channels: Vec::new(),
            ignored_users: Vec::new(),
            user_interval: Duration::from_secs(3),
            channel_interval: Duration::from_millis(200),
            limiter_capacity: rate_limit::DEFAULT_TABLE_CAPACITY,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Options for [`BotCore::send_text`]
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Send as a `/me` action
    pub action: bool,
    /// Mention this user (nick on the primary platform, id on the gateway)
    pub reply_to: Option<String>,
    /// Split long text over several lines instead of dropping it
    pub multiline: bool,
    /// Keep the gateway platform from embedding links
    pub escape_links: bool,
}

impl SendOptions {
    pub fn action() -> Self {
        Self { action: true, ..Self::default() }
    }

    pub fn multiline() -> Self {
        Self { multiline: true, ..Self::default() }
    }

    pub fn escaped() -> Self {
        Self { escape_links: true, ..Self::default() }
    }
}

/// State owned by the dispatcher task and shared with every handler
pub struct BotCore {
    channels: HashSet<String>,
    lurk_channels: HashSet<String>,
    ignored_users: HashSet<String>,
    connections: HashMap<Platform, ConnectionHandle>,
    user_limiter: RateLimiter,
    channel_limiter: RateLimiter,
    rng: StdRng,
}

impl BotCore {
    pub fn new(settings: &BotSettings, connections: Vec<ConnectionHandle>) -> Self {
        let lower_all = |names: &[String]| names.iter().map(|name| irc_lower(name)).collect::<HashSet<_>>();

        Self {
            channels: lower_all(&settings.channels),
            lurk_channels: lower_all(&settings.lurk_channels),
            ignored_users: lower_all(&settings.ignored_users),
            connections: connections
                .into_iter()
                .map(|connection| (connection.platform, connection))
                .collect(),
            user_limiter: RateLimiter::with_capacity(settings.user_interval, settings.limiter_capacity),
            channel_limiter: RateLimiter::with_capacity(settings.channel_interval, settings.limiter_capacity),
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn user_limiter(&mut self) -> &mut RateLimiter {
        &mut self.user_limiter
    }

    pub fn channel_limiter(&mut self) -> &mut RateLimiter {
        &mut self.channel_limiter
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Replace the RNG with a freshly OS-seeded one
    pub fn reseed_rng(&mut self) {
        self.rng = StdRng::from_os_rng();
        debug!("RNG reseeded");
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    pub fn is_lurking(&self, channel: &str) -> bool {
        self.lurk_channels.contains(channel)
    }

    pub fn is_ignored(&self, username: &str) -> bool {
        self.ignored_users.contains(username)
    }

    /// Lowercased nickname the bot uses on `platform`
    pub fn nickname(&self, platform: Platform) -> Option<&str> {
        self.connections.get(&platform).map(|connection| connection.nickname.as_str())
    }

    /// Connection owning `platform`, falling back to the primary one
    fn connection(&self, platform: Platform) -> Option<&ConnectionHandle> {
        self.connections
            .get(&platform)
            .or_else(|| self.connections.get(&Platform::Twitch))
    }

    /// Line budget of the connection that carries messages for `platform`
    pub fn limits_for(&self, platform: Platform) -> MessageLimits {
        match self.connection(platform) {
            Some(connection) => connection_limits(connection),
            None => MessageLimits::for_platform(platform, false),
        }
    }

    /// Format `text` for the channel's platform and queue it line by line.
    ///
    /// A line that fails the safety check, or a channel the bot is not
    /// configured for, discards that line and everything after it.
    pub fn send_text(&self, channel: &str, text: &str, options: &SendOptions) {
        let channel = irc_lower(channel);
        let Some(connection) = self.connection(Platform::for_channel(&channel)) else {
            warn!("No connection available for {}", channel);
            return;
        };
        let platform = connection.platform;

        let mut text = if options.escape_links && platform == Platform::Discord {
            escape_links(text)
        } else {
            text.to_string()
        };

        if let Some(reply_to) = &options.reply_to {
            text = match platform {
                Platform::Discord => format!("<@{}>, {}", reply_to, text),
                Platform::Twitch => format!("@{}, {}", reply_to, text),
            };
        }

        let extended = platform == Platform::Twitch && connection.extended_char_limit;
        let limits = connection_limits(connection);

        let lines = if !options.multiline {
            vec![text]
        } else if extended {
            split_multiline(&text, limits.max_chars - 100, true)
        } else {
            split_multiline(&text, limits.max_bytes, false)
        };

        let mut requests = Vec::with_capacity(lines.len());
        for line in lines {
            let line = strip_unsafe_chars(&line);

            if let Err(reason) = check_text(&line, false, limits) {
                info!("Discarded message {} {:?}: {}", channel, line, reason);
                break;
            }
            if !self.is_joined(&channel) {
                info!("Discarded message {} {:?}: channel not joined", channel, line);
                break;
            }

            requests.push(OutboundRequest::SendText {
                target: channel.clone(),
                text: line,
                action: options.action,
            });
        }

        // Lines of one message go out together or not at all
        connection.enqueue_all(requests);
    }

    /// Private message on the primary platform
    pub fn send_whisper(&self, username: &str, text: &str, allow_command_prefix: bool) {
        let text = strip_unsafe_chars(text);

        if let Err(reason) = check_text(&text, allow_command_prefix, WHISPER_LIMITS) {
            info!("Discarded whisper {} {:?}: {}", username, text, reason);
            return;
        }

        if let Some(connection) = self.connections.get(&Platform::Twitch) {
            connection.enqueue(OutboundRequest::SendText {
                target: WHISPER_CHANNEL.to_string(),
                text: format!("/w {} {}", username, text),
                action: false,
            });
        }
    }

    /// Private message on the gateway platform, addressed by user id
    pub fn send_private_message(&self, user_id: &str, text: &str, allow_command_prefix: bool) {
        let text = strip_unsafe_chars(text);

        if let Err(reason) = check_text(&text, allow_command_prefix, WHISPER_LIMITS) {
            info!("Discarded private message {} {:?}: {}", user_id, text, reason);
            return;
        }

        match self.connections.get(&Platform::Discord) {
            Some(connection) => {
                connection.enqueue(OutboundRequest::SendText {
                    target: user_id.to_string(),
                    text,
                    action: false,
                });
            }
            None => debug!("No gateway connection for private message to {}", user_id),
        }
    }

    /// Update the "playing" status shown on the gateway platform
    pub fn set_presence(&self, text: &str) {
        if let Some(connection) = self.connections.get(&Platform::Discord) {
            connection.enqueue(OutboundRequest::SendText {
                target: PRESENCE_CHANNEL.to_string(),
                text: strip_unsafe_chars(text),
                action: false,
            });
        }
    }

    /// Join a channel (or a comma-separated group) on its platform
    pub fn join(&self, channel: &str) {
        if let Some(connection) = self.connection(Platform::for_channel(channel)) {
            info!("Join {}", channel);
            connection.enqueue(OutboundRequest::Join {
                channel: channel.to_string(),
            });
        }
    }

    /// Join every configured channel that lives on `platform`
    pub fn join_configured_channels(&self, platform: Platform) {
        let mut channels: Vec<&String> = self
            .channels
            .union(&self.lurk_channels)
            .filter(|channel| Platform::for_channel(channel) == platform)
            .collect();
        channels.sort();

        for group in channels.chunks(JOIN_BATCH_SIZE) {
            let group = group.iter().map(|channel| channel.as_str()).collect::<Vec<_>>().join(",");
            self.join(&group);
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(&BotSettings::default(), Vec::new())
    }
}

fn connection_limits(connection: &ConnectionHandle) -> MessageLimits {
    let extended = connection.platform == Platform::Twitch && connection.extended_char_limit;
    MessageLimits::for_platform(connection.platform, extended)
}

/// The dispatcher: one task consuming the inbound queue and driving the scheduler
pub struct Bot<S> {
    core: BotCore,
    state: S,
    scheduler: Scheduler<S>,
    commands: Vec<RegisteredCommand<S>>,
    message_handlers: Vec<MessageHandler<S>>,
    inbound: mpsc::Receiver<Message>,
    poll_interval: Duration,
}

impl<S: Send + 'static> Bot<S> {
    pub fn new(
        settings: BotSettings,
        connections: Vec<ConnectionHandle>,
        inbound: mpsc::Receiver<Message>,
        state: S,
    ) -> Self {
        let mut bot = Self {
            core: BotCore::new(&settings, connections),
            state,
            scheduler: Scheduler::new(),
            commands: Vec::new(),
            message_handlers: Vec::new(),
            inbound,
            poll_interval: settings.poll_interval,
        };

        bot.register_message_handler(EventType::Welcome, |session| {
            let platform = session.message().source;
            session.core().join_configured_channels(platform);
            Ok(())
        });

        bot
    }

    /// Register a command; `pattern` is matched at the start of the text
    pub fn register_command<F>(&mut self, pattern: &str, handler: F, ignore_rate_limit: bool) -> Result<()>
    where
        F: FnMut(&mut Session<'_, S>) -> Result<()> + Send + 'static,
    {
        let anchored = Regex::new(&format!("^(?:{})", pattern))
            .with_context(|| format!("Invalid command pattern: {}", pattern))?;

        self.commands.push(RegisteredCommand {
            pattern: anchored,
            handler: Box::new(handler),
            ignore_rate_limit,
        });
        debug!("Registered command pattern {}", pattern);
        Ok(())
    }

    pub fn register_message_handler<F>(&mut self, event_type: EventType, handler: F)
    where
        F: FnMut(&mut Session<'_, S>) -> Result<()> + Send + 'static,
    {
        self.message_handlers.push(MessageHandler {
            event_type,
            handler: Box::new(handler),
        });
    }

    pub fn core(&self) -> &BotCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut BotCore {
        &mut self.core
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn scheduler(&mut self) -> &mut Scheduler<S> {
        &mut self.scheduler
    }

    /// Consume the inbound queue until every producer has gone away
    pub async fn run(mut self) -> Result<()> {
        info!(
            "Dispatcher started with {} commands and {} message handlers",
            self.commands.len(),
            self.message_handlers.len()
        );

        loop {
            self.run_scheduled();

            let wait = self
                .scheduler
                .next_deadline()
                .map_or(self.poll_interval, |deadline| {
                    deadline.saturating_duration_since(Instant::now()).min(self.poll_interval)
                });

            match timeout(wait, self.inbound.recv()).await {
                Ok(Some(message)) => {
                    debug!("Process inbound queue item {:?}", message);
                    self.process_message(message);
                }
                Ok(None) => {
                    info!("Inbound queue closed, dispatcher stopping");
                    return Ok(());
                }
                Err(_) => continue,
            }
        }
    }

    /// Run every scheduler task that is due
    pub fn run_scheduled(&mut self) {
        let now = Instant::now();
        while let Some((name, task)) = self.scheduler.pop_due(now) {
            let Bot { core, state, scheduler, .. } = self;
            match panic::catch_unwind(AssertUnwindSafe(|| task(core, state, scheduler))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Scheduled task '{}' failed: {:#}", name, e),
                Err(payload) => error!("Scheduled task '{}' panicked: {}", name, panic_message(&*payload)),
            }
        }
    }

    /// Dispatch one inbound message to the handlers and the command registry
    pub fn process_message(&mut self, message: Message) {
        let Bot {
            core,
            state,
            scheduler,
            commands,
            message_handlers,
            ..
        } = self;
        let mut session = Session::new(&message, core, state, scheduler);

        for registered in message_handlers
            .iter_mut()
            .filter(|registered| registered.event_type == message.event_type)
        {
            invoke_isolated("Message handler", &message, || (registered.handler)(&mut session));
        }

        if message.event_type.is_chat_text() {
            process_text_commands(&mut session, commands);
        }
    }
}

fn process_text_commands<S>(session: &mut Session<'_, S>, commands: &mut [RegisteredCommand<S>]) {
    let message = session.message();
    let username = message.username.as_str();
    let channel = message.channel();

    if session.core.is_ignored(username) {
        return;
    }
    if session.core.is_lurking(channel) {
        return;
    }
    if session.is_own_message() {
        return;
    }

    let text = message.text();

    for command in commands.iter_mut() {
        let Some(captures) = command.pattern.captures(text) else {
            continue;
        };

        if !command.ignore_rate_limit
            && !(session.core.user_limiter.is_ok(username) && session.core.channel_limiter.is_ok(channel))
        {
            debug!("Throttled {} in {}: {:?}", username, channel, text);
            return;
        }

        session.captures = Some(captures);
        invoke_isolated("Command", message, || (command.handler)(session));

        if !command.ignore_rate_limit && !session.skip_rate_limit {
            session.core.user_limiter.update(username, Duration::ZERO);
            session.core.channel_limiter.update(channel, Duration::ZERO);
        }
        break;
    }
}

/// Run a handler so that neither an error nor a panic escapes the dispatcher
fn invoke_isolated<F>(kind: &str, message: &Message, handler: F)
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{} failed on {:?}: {:#}", kind, message, e),
        Err(payload) => error!("{} panicked on {:?}: {}", kind, message, panic_message(&*payload)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct Harness {
        bot: Bot<Vec<&'static str>>,
        twitch: mpsc::Receiver<OutboundRequest>,
        discord: mpsc::Receiver<OutboundRequest>,
        _inbound: mpsc::Sender<Message>,
    }

    fn harness(settings: BotSettings) -> Harness {
        let (twitch_tx, twitch) = mpsc::channel(64);
        let (discord_tx, discord) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(100);
        let connections = vec![
            ConnectionHandle::new(Platform::Twitch, "Groudonger", false, twitch_tx),
            ConnectionHandle::new(Platform::Discord, "groudonger", false, discord_tx),
        ];
        Harness {
            bot: Bot::new(settings, connections, inbound_rx, Vec::new()),
            twitch,
            discord,
            _inbound: inbound_tx,
        }
    }

    fn settings() -> BotSettings {
        BotSettings {
            channels: vec!["#test".into(), "#other".into(), "&123".into()],
            lurk_channels: vec!["#lurk".into()],
            ignored_users: vec!["spambot".into()],
            ..BotSettings::default()
        }
    }

    fn chat(username: &str, text: &str) -> Message {
        Message::chat(Platform::Twitch, "#test", username, text)
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundRequest>) -> Vec<OutboundRequest> {
        let mut out = Vec::new();
        while let Ok(request) = rx.try_recv() {
            out.push(request);
        }
        out
    }

    fn sent_texts(rx: &mut mpsc::Receiver<OutboundRequest>) -> Vec<String> {
        drain(rx)
            .into_iter()
            .filter_map(|request| match request {
                OutboundRequest::SendText { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    fn say_handler(reply: &'static str) -> impl FnMut(&mut Session<'_, Vec<&'static str>>) -> Result<()> + Send {
        move |session| {
            session.state.push(reply);
            session.say(reply, SendOptions::default());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_matching_command_wins() {
        let mut h = harness(settings());
        h.bot.register_command(r"(?i)!ro", say_handler("first"), false).unwrap();
        h.bot.register_command(r"(?i)!roar", say_handler("second"), false).unwrap();

        h.bot.process_message(chat("alice", "!roar"));

        assert_eq!(h.bot.state(), &vec!["first"]);
        assert_eq!(sent_texts(&mut h.twitch), vec!["first".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pattern_matches_only_at_start() {
        let mut h = harness(settings());
        h.bot.register_command(r"!roar", say_handler("roar"), false).unwrap();

        h.bot.process_message(chat("alice", "please !roar"));
        assert!(h.bot.state().is_empty());

        h.bot.process_message(chat("alice", "!roar and more"));
        assert_eq!(h.bot.state(), &vec!["roar"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pick_scenario() {
        let mut h = harness(settings());
        h.bot
            .register_command(
                r"^!pick\s+(.*)",
                |session: &mut Session<'_, Vec<&'static str>>| {
                    let choices: Vec<String> = session.group(1).split(',').map(|c| c.trim().to_string()).collect();
                    let index = rand::Rng::random_range(session.rng(), 0..choices.len());
                    let picked = choices[index].clone();
                    session.say(&format!("Picked! {}", picked), SendOptions::default());
                    Ok(())
                },
                false,
            )
            .unwrap();

        h.bot.process_message(chat("alice", "!pick a,b,c"));

        let sent = drain(&mut h.twitch);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            OutboundRequest::SendText { target, text, .. } => {
                assert_eq!(target, "#test");
                assert!(["Picked! a", "Picked! b", "Picked! c"].contains(&text.as_str()));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_rate_limit_drops_second_command() {
        let mut h = harness(settings());
        h.bot.register_command(r"!roar", say_handler("roar"), false).unwrap();

        h.bot.process_message(chat("alice", "!roar"));
        tokio::time::advance(Duration::from_secs(1)).await;
        h.bot.process_message(chat("alice", "!roar"));

        assert_eq!(sent_texts(&mut h.twitch).len(), 1);

        tokio::time::advance(Duration::from_millis(2500)).await;
        h.bot.process_message(chat("alice", "!roar"));
        assert_eq!(sent_texts(&mut h.twitch).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_command_mutates_nothing() {
        let mut h = harness(settings());
        h.bot.register_command(r"!roar", say_handler("roar"), false).unwrap();

        h.bot.process_message(chat("alice", "!roar"));
        tokio::time::advance(Duration::from_millis(100)).await;

        // Bob passes the user check but the channel limiter (0.2s) rejects him
        h.bot.process_message(chat("bob", "!roar"));
        assert_eq!(h.bot.state().len(), 1);
        assert!(h.bot.core_mut().user_limiter().is_ok("bob"));

        tokio::time::advance(Duration::from_millis(150)).await;
        h.bot.process_message(chat("bob", "!roar"));
        assert_eq!(h.bot.state().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exempt_command_skips_limiter() {
        let mut h = harness(settings());
        h.bot.register_command(r"!free", say_handler("free"), true).unwrap();

        for _ in 0..3 {
            h.bot.process_message(chat("alice", "!free"));
        }
        assert_eq!(h.bot.state().len(), 3);
        assert!(h.bot.core_mut().user_limiter().is_empty());
        assert!(h.bot.core_mut().channel_limiter().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_can_veto_rate_limit_bookkeeping() {
        let mut h = harness(settings());
        h.bot
            .register_command(
                r"s/",
                |session: &mut Session<'_, Vec<&'static str>>| {
                    session.state.push("skipped");
                    session.skip_rate_limit = true;
                    Ok(())
                },
                false,
            )
            .unwrap();

        h.bot.process_message(chat("alice", "s/a/b/"));
        h.bot.process_message(chat("alice", "s/a/b/"));
        assert_eq!(h.bot.state().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_through_channel_limiter() {
        let mut h = harness(settings());
        h.bot
            .register_command(
                r"!mute",
                |session: &mut Session<'_, Vec<&'static str>>| {
                    let channel = session.message().channel().to_string();
                    let limiter = session.core_mut().channel_limiter();
                    if limiter.is_ok(&channel) {
                        limiter.update(&channel, Duration::from_secs(60));
                    }
                    Ok(())
                },
                true,
            )
            .unwrap();
        h.bot.register_command(r"!roar", say_handler("roar"), false).unwrap();

        h.bot.process_message(chat("alice", "!mute"));
        tokio::time::advance(Duration::from_secs(30)).await;
        h.bot.process_message(chat("bob", "!roar"));
        assert!(h.bot.state().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        h.bot.process_message(chat("bob", "!roar"));
        assert_eq!(h.bot.state(), &vec!["roar"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_ignored_and_lurk_messages_skip_commands() {
        let mut h = harness(settings());
        h.bot.register_command(r"!roar", say_handler("command"), true).unwrap();
        h.bot.register_message_handler(EventType::PubMsg, |session| {
            session.state.push("handler");
            Ok(())
        });

        h.bot.process_message(chat("groudonger", "!roar"));
        h.bot.process_message(chat("spambot", "!roar"));
        h.bot.process_message(Message::chat(Platform::Twitch, "#lurk", "alice", "!roar"));

        assert_eq!(h.bot.state(), &vec!["handler", "handler", "handler"]);
        assert!(drain(&mut h.twitch).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_handlers_run_for_matching_event_type_only() {
        let mut h = harness(settings());
        h.bot.register_message_handler(EventType::Join, |session| {
            session.state.push("join");
            Ok(())
        });
        h.bot.register_command(r".*", say_handler("command"), true).unwrap();

        let join = Message {
            channel: Some("#test".into()),
            username: "alice".into(),
            ..Message::new(EventType::Join, Platform::Twitch)
        };
        h.bot.process_message(join);
        h.bot.process_message(Message {
            event_type: EventType::Whisper,
            ..chat("alice", "!roar")
        });

        assert_eq!(h.bot.state(), &vec!["join"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_handlers_do_not_stop_processing() {
        let mut h = harness(settings());
        h.bot
            .register_command(r"!fail", |_: &mut Session<'_, Vec<&'static str>>| bail!("boom"), true)
            .unwrap();
        h.bot
            .register_command(r"!panic", |_: &mut Session<'_, Vec<&'static str>>| panic!("kaboom"), false)
            .unwrap();
        h.bot.register_command(r"!roar", say_handler("roar"), true).unwrap();

        h.bot.process_message(chat("alice", "!fail"));
        h.bot.process_message(chat("bob", "!panic"));
        h.bot.process_message(chat("carol", "!roar"));

        assert_eq!(sent_texts(&mut h.twitch), vec!["roar".to_string()]);
        // The panicking command still counts as fired
        assert!(!h.bot.core_mut().user_limiter().is_ok("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_welcome_joins_platform_channels() {
        let mut h = harness(settings());
        h.bot.process_message(Message::new(EventType::Welcome, Platform::Twitch));

        assert_eq!(
            drain(&mut h.twitch),
            vec![OutboundRequest::Join { channel: "#lurk,#other,#test".into() }]
        );
        assert!(drain(&mut h.discord).is_empty());

        h.bot.process_message(Message::new(EventType::Welcome, Platform::Discord));
        assert_eq!(drain(&mut h.discord), vec![OutboundRequest::Join { channel: "&123".into() }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_welcome_batches_joins_by_ten() {
        let channels = (0..23).map(|i| format!("#chan{:02}", i)).collect();
        let mut h = harness(BotSettings { channels, ..BotSettings::default() });
        h.bot.process_message(Message::new(EventType::Welcome, Platform::Twitch));

        let joins = drain(&mut h.twitch);
        assert_eq!(joins.len(), 3);
        match &joins[2] {
            OutboundRequest::Join { channel } => assert_eq!(channel.split(',').count(), 3),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_text_formats_replies_per_platform() {
        let mut h = harness(settings());
        h.bot.core().send_text("#TEST", "hi", &SendOptions { reply_to: Some("Alice".into()), ..SendOptions::default() });
        h.bot.core().send_text("&123", "hi", &SendOptions { reply_to: Some("42".into()), ..SendOptions::default() });
        h.bot.core().send_text("&123", "see https://example.com", &SendOptions::escaped());
        h.bot.core().send_text("#test", "see https://example.com", &SendOptions::escaped());

        assert_eq!(
            sent_texts(&mut h.twitch),
            vec!["@Alice, hi".to_string(), "see https://example.com".to_string()]
        );
        assert_eq!(
            sent_texts(&mut h.discord),
            vec!["<@42>, hi".to_string(), "see <https://example.com>".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_text_discards_unsafe_lines() {
        let mut h = harness(settings());
        let core = h.bot.core();

        core.send_text("#test", "!ban everyone", &SendOptions::default());
        core.send_text("#notjoined", "hello", &SendOptions::default());
        core.send_text("#test", &"x".repeat(401), &SendOptions::default());
        core.send_text("#test", "a\x01b", &SendOptions::default());

        assert_eq!(sent_texts(&mut h.twitch), vec!["ab".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiline_send_splits_with_continuation_marker() {
        let mut h = harness(settings());
        h.bot.core().send_text("#test", &"x".repeat(1000), &SendOptions::multiline());

        let lines = sent_texts(&mut h.twitch);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with(outbound::CONTINUATION_PREFIX));
        assert!(lines[2].starts_with(outbound::CONTINUATION_PREFIX));
        assert!(lines.iter().all(|line| line.len() <= 400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiline_aborts_after_first_bad_line() {
        let mut h = harness(settings());
        h.bot.core().send_text("#test", &format!("!{}", "x".repeat(500)), &SendOptions::multiline());
        assert!(sent_texts(&mut h.twitch).is_empty());
    }

    #[tokio::test]
    async fn test_multiline_send_needs_room_for_every_line() {
        let (twitch_tx, mut twitch) = mpsc::channel(10);
        let connections = vec![ConnectionHandle::new(Platform::Twitch, "groudonger", false, twitch_tx)];
        let core = BotCore::new(&settings(), connections);

        // 12 lines never fit a 10-slot queue
        core.send_text("#test", &"x".repeat(4500), &SendOptions::multiline());
        assert!(drain(&mut twitch).is_empty());

        core.send_text("#test", &"x".repeat(1000), &SendOptions::multiline());
        core.send_text("#test", &"x".repeat(3000), &SendOptions::multiline());
        assert_eq!(sent_texts(&mut twitch).len(), 3);
    }

    #[tokio::test]
    async fn test_extended_limit_chunks_by_characters() {
        let (twitch_tx, mut twitch) = mpsc::channel(64);
        let connections = vec![ConnectionHandle::new(Platform::Twitch, "groudonger", true, twitch_tx)];
        let core = BotCore::new(&settings(), connections);

        assert_eq!(
            core.limits_for(Platform::Twitch),
            MessageLimits { max_chars: 500, max_bytes: 1800 }
        );

        core.send_text("#test", &"é".repeat(1000), &SendOptions::multiline());
        let lines = sent_texts(&mut twitch);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].chars().count(), 400);
        assert_eq!(lines[1].chars().count(), 400 + outbound::CONTINUATION_PREFIX.len());
        assert!(lines.iter().all(|line| line.len() <= 1800));

        core.send_text("#test", &"x".repeat(450), &SendOptions::default());
        assert_eq!(sent_texts(&mut twitch).len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_connection_sets_the_budget() {
        let (twitch_tx, mut twitch) = mpsc::channel(64);
        let connections = vec![ConnectionHandle::new(Platform::Twitch, "groudonger", false, twitch_tx)];
        let core = BotCore::new(&settings(), connections);

        // No gateway: `&` channels ride the primary connection and its budget
        assert_eq!(core.limits_for(Platform::Discord), MessageLimits::for_platform(Platform::Twitch, false));

        core.send_text("&123", "hi", &SendOptions::default());
        assert_eq!(
            drain(&mut twitch),
            vec![OutboundRequest::SendText { target: "&123".into(), text: "hi".into(), action: false }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_messages_trigger_commands() {
        let mut h = harness(settings());
        h.bot.register_command(r"!roar", say_handler("roar"), false).unwrap();

        h.bot.process_message(Message {
            event_type: EventType::Action,
            ..chat("alice", "!roar")
        });

        assert_eq!(h.bot.state(), &vec!["roar"]);
        assert_eq!(sent_texts(&mut h.twitch), vec!["roar".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whisper_routes() {
        let mut h = harness(settings());
        h.bot.core().send_whisper("alice", "psst", false);
        h.bot.core().send_private_message("42", "psst", false);
        h.bot.core().send_whisper("alice", "/ban bob", false);

        assert_eq!(
            drain(&mut h.twitch),
            vec![OutboundRequest::SendText { target: "#jtv".into(), text: "/w alice psst".into(), action: false }]
        );
        assert_eq!(
            drain(&mut h.discord),
            vec![OutboundRequest::SendText { target: "42".into(), text: "psst".into(), action: false }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_drives_queue_and_scheduler() {
        let (twitch_tx, mut twitch) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(100);
        let connections = vec![ConnectionHandle::new(Platform::Twitch, "groudonger", false, twitch_tx)];
        let mut bot: Bot<Vec<&'static str>> = Bot::new(settings(), connections, inbound_rx, Vec::new());

        bot.register_command(r"!fail", |_: &mut Session<'_, Vec<&'static str>>| bail!("boom"), true).unwrap();
        bot.register_command(r"!roar", say_handler("roar"), false).unwrap();
        bot.scheduler().schedule_in(Duration::from_secs(1), "announce", |core, _, _| {
            core.send_text("#test", "scheduled", &SendOptions::default());
            Ok(())
        });

        inbound_tx.send(chat("alice", "!fail")).await.unwrap();
        inbound_tx.send(chat("bob", "!roar")).await.unwrap();

        let dispatcher = tokio::spawn(bot.run());
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(inbound_tx);
        dispatcher.await.unwrap().unwrap();

        assert_eq!(sent_texts(&mut twitch), vec!["roar".to_string(), "scheduled".to_string()]);
    }
}
