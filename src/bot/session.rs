use rand::rngs::StdRng;
use regex::Captures;

use super::scheduler::Scheduler;
use super::{BotCore, SendOptions};
use crate::types::{Message, Platform};

/// Per-message context handed to command and message handlers.
///
/// Borrows the dispatcher's state for the duration of one dispatch; handlers
/// therefore run without any locking.
pub struct Session<'a, S> {
    pub(crate) message: &'a Message,
    pub(crate) core: &'a mut BotCore,
    pub(crate) scheduler: &'a mut Scheduler<S>,
    /// Feature state shared by every handler of this bot
    pub state: &'a mut S,
    /// Capture groups of the command pattern that matched, if any
    pub captures: Option<Captures<'a>>,
    /// Set by a handler to skip rate-limit bookkeeping for this invocation
    pub skip_rate_limit: bool,
}

impl<'a, S> Session<'a, S> {
    pub fn new(
        message: &'a Message,
        core: &'a mut BotCore,
        state: &'a mut S,
        scheduler: &'a mut Scheduler<S>,
    ) -> Self {
        Self {
            message,
            core,
            scheduler,
            state,
            captures: None,
            skip_rate_limit: false,
        }
    }

    pub fn message(&self) -> &'a Message {
        self.message
    }

    pub fn core(&self) -> &BotCore {
        &*self.core
    }

    pub fn core_mut(&mut self) -> &mut BotCore {
        &mut *self.core
    }

    pub fn scheduler(&mut self) -> &mut Scheduler<S> {
        &mut *self.scheduler
    }

    pub fn rng(&mut self) -> &mut StdRng {
        self.core.rng()
    }

    /// Feature state and the RNG borrowed together
    pub fn state_and_rng(&mut self) -> (&mut S, &mut StdRng) {
        (&mut *self.state, self.core.rng())
    }

    /// Capture group `index` of the matched pattern, empty if it did not participate
    pub fn group(&self, index: usize) -> &'a str {
        self.captures
            .as_ref()
            .and_then(|captures| captures.get(index))
            .map_or("", |m| m.as_str())
    }

    /// Platform the message came from, judged by its channel when it has one
    pub fn platform(&self) -> Platform {
        match &self.message.channel {
            Some(channel) => Platform::for_channel(channel),
            None => self.message.source,
        }
    }

    /// True if the message was sent by this bot's own account
    pub fn is_own_message(&self) -> bool {
        self.core.nickname(self.message.source) == Some(self.message.username.as_str())
    }

    /// Send `text` to the message's channel, mentioning its author
    pub fn reply(&mut self, text: &str, options: SendOptions) {
        let reply_to = match self.platform() {
            Platform::Discord => self.message.user_id.clone(),
            Platform::Twitch => Some(self.message.nick().to_string()),
        };
        let options = SendOptions { reply_to, ..options };
        self.core.send_text(self.message.channel(), text, &options);
    }

    /// Send `text` to the message's channel
    pub fn say(&mut self, text: &str, options: SendOptions) {
        self.core.send_text(self.message.channel(), text, &options);
    }

    /// Send `text` privately to the message's author
    pub fn whisper(&mut self, text: &str) {
        match self.platform() {
            Platform::Discord => {
                if let Some(user_id) = &self.message.user_id {
                    self.core.send_private_message(user_id, text, false);
                }
            }
            Platform::Twitch => self.core.send_whisper(&self.message.username, text, false),
        }
    }
}
