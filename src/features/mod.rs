// src/features/mod.rs - Chat commands and background tasks registered on the dispatcher

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info};
use rand::seq::IndexedRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::time::Duration;

use crate::bot::rate_limit::RateLimiter;
use crate::bot::scheduler::Scheduler;
use crate::bot::{Bot, BotCore, SendOptions, Session};
use crate::types::EventType;

pub mod correction;
pub mod mail;
pub mod roar;

use correction::Correction;
use mail::{MailError, MailFilter, MailStatus, Mailbox, Sender, MAX_MAIL_CHARS};

/// Recent lines kept per channel for corrections
const HISTORY_CAPACITY: usize = 100;
const RESEED_INTERVAL: Duration = Duration::from_secs(300);
const PRESENCE_INTERVAL: Duration = Duration::from_secs(300);
/// First presence update waits for the gateway to finish logging in
const INITIAL_PRESENCE_DELAY: Duration = Duration::from_secs(60);
const SONG_INTERVAL: Duration = Duration::from_secs(10);

const DEFAULT_SUBJECT: &str = "Groudonger";
const DOUBLE_TEAM: &str = "ヽ༼ຈل͜ຈ༽ﾉ DOUBLE TEAM ヽ༼ຈل͜ຈ༽ﾉ";

const DONGER_SONG_TEMPLATE: &str = "I like to raise my {donger} I do it all the time ヽ༼ຈل͜ຈ༽ﾉ \
and every time its lowered┌༼ຈل͜ຈ༽┐ I cry and start to whine ┌༼@ل͜@༽┐\
But never need to worry ༼ ºل͟º༽ my {donger}'s staying strong ヽ༼ຈل͜ຈ༽ﾉ\
A {donger} saved is a {donger} earned so sing the {donger} song! ᕦ༼ຈل͜ຈ༽ᕤ";

/// Configuration the commands read
#[derive(Debug, Clone, Default)]
pub struct FeatureSettings {
    pub help_text: String,
    pub mail_disabled_channels: HashSet<String>,
    pub mail_restricted_channels: HashSet<String>,
}

/// Probabilities behind the commands' random behaviour
#[derive(Debug, Clone, Copy)]
pub struct Chances {
    /// A correction answers with a roar instead of the corrected text
    pub fake_correction: f64,
    /// Reading mail may deliver the reader's own mail
    pub own_mail: f64,
    /// Reading mail picks an already-read letter
    pub old_mail: f64,
}

impl Default for Chances {
    fn default() -> Self {
        Self {
            fake_correction: 0.05,
            own_mail: 0.05,
            old_mail: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    nick: String,
    text: String,
    /// Produced by an earlier correction
    stacked: bool,
}

/// State shared by every command handler
pub struct Features {
    settings: FeatureSettings,
    chances: Chances,
    history: HashMap<String, VecDeque<HistoryEntry>>,
    /// Last non-command line per channel
    last_message: HashMap<String, String>,
    user_lists: HashMap<String, HashSet<String>>,
    song_limiter: RateLimiter,
    mailbox: Box<dyn Mailbox>,
}

impl Features {
    pub fn new(settings: FeatureSettings, mailbox: Box<dyn Mailbox>) -> Self {
        Self {
            settings,
            chances: Chances::default(),
            history: HashMap::new(),
            last_message: HashMap::new(),
            user_lists: HashMap::new(),
            song_limiter: RateLimiter::new(SONG_INTERVAL),
            mailbox,
        }
    }

    pub fn with_chances(mut self, chances: Chances) -> Self {
        self.chances = chances;
        self
    }

    pub fn room_size(&self, channel: &str) -> usize {
        self.user_lists.get(channel).map_or(0, HashSet::len)
    }

    fn remember(&mut self, channel: &str, entry: HistoryEntry) {
        let history = self.history.entry(channel.to_string()).or_default();
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(entry);
    }

    /// Register every command, message handler and background task
    pub fn install(bot: &mut Bot<Features>) -> Result<()> {
        bot.register_message_handler(EventType::PubMsg, collect_recent_message);
        bot.register_message_handler(EventType::Action, collect_recent_message);
        bot.register_message_handler(EventType::Join, join_callback);
        bot.register_message_handler(EventType::Part, part_callback);

        bot.register_command(r"!?s/(.+/.*)", correction_command, false)?;
        bot.register_command(r"(?i)!double(team)?($|\s.*)", double_command, false)?;
        bot.register_command(r"(?i)!(groudonger)?(help|commands)($|\s.*)", help_command, false)?;
        bot.register_command(r"(?i)!groudon(ger)?($|\s.*)", roar_command, false)?;
        bot.register_command(r"(?i)!(mail|post)($|\s.*)$", mail_command, false)?;
        bot.register_command(r"(?i)!(mail|post)status($|\s.*)", mail_status_command, false)?;
        bot.register_command(r"(?i)!mute($|\s.*)", mute_command, true)?;
        bot.register_command(r"(?i)!pick\s+(.*)", pick_command, false)?;
        bot.register_command(r"(?i)!praise($|\s.{0,100})$", praise_command, false)?;
        bot.register_command(r"(?i)!song($|\s.{0,50})$", song_command, false)?;
        bot.register_command(r"(?i)!sort($|\s.*)", sort_command, false)?;
        bot.register_command(r"(?i)!reverse($|\s.*)", reverse_command, false)?;
        bot.register_command(r"(?i)!rip($|\s.{0,100})$", rip_command, false)?;
        bot.register_command(r"(?i)!roomsize?($|\s.*)", room_size_command, false)?;

        schedule_reseed(bot.scheduler());
        bot.scheduler()
            .schedule_in(INITIAL_PRESENCE_DELAY, "presence", update_presence);

        info!("Features installed");
        Ok(())
    }
}

fn schedule_reseed(scheduler: &mut Scheduler<Features>) {
    scheduler.schedule_in(RESEED_INTERVAL, "reseed_rng", |core, _, scheduler| {
        core.reseed_rng();
        schedule_reseed(scheduler);
        Ok(())
    });
}

fn update_presence(core: &mut BotCore, features: &mut Features, scheduler: &mut Scheduler<Features>) -> Result<()> {
    let unread = features.mailbox.count(MailStatus::Unread);
    let text = if unread > 0 {
        format!("Mail Delivery: {} unread", unread)
    } else {
        roar::generate(core.rng())
    };
    core.set_presence(&text);

    scheduler.schedule_in(PRESENCE_INTERVAL, "presence", update_presence);
    Ok(())
}

fn roar(session: &mut Session<'_, Features>) -> String {
    roar::generate(session.rng())
}

/// Say `text` if it fits the platform's line budget, otherwise apologise
fn say_or_reply_too_long(session: &mut Session<'_, Features>, text: &str) -> bool {
    let limits = session.core().limits_for(session.platform());

    if limits.fits(text) {
        session.say(text, SendOptions::default());
        true
    } else {
        let apology = format!("{} Message length exceeds my capabilities!", roar(session));
        session.reply(&apology, SendOptions::default());
        false
    }
}

/// Trimmed argument, else the channel's last line, else the default subject
fn subject(session: &Session<'_, Features>, group: usize) -> String {
    let text = session.group(group).trim();
    if !text.is_empty() {
        return text.to_string();
    }
    session
        .state
        .last_message
        .get(session.message().channel())
        .cloned()
        .unwrap_or_else(|| DEFAULT_SUBJECT.to_string())
}

fn collect_recent_message(session: &mut Session<'_, Features>) -> Result<()> {
    if session.is_own_message() {
        return Ok(());
    }

    let message = session.message();
    let channel = message.channel();
    session.state.remember(
        channel,
        HistoryEntry {
            nick: message.nick().to_string(),
            text: message.text().to_string(),
            stacked: false,
        },
    );

    if !message.text().starts_with('!') {
        session
            .state
            .last_message
            .insert(channel.to_string(), message.text().to_string());
    }
    Ok(())
}

fn join_callback(session: &mut Session<'_, Features>) -> Result<()> {
    let message = session.message();
    session
        .state
        .user_lists
        .entry(message.channel().to_string())
        .or_default()
        .insert(message.username.clone());
    Ok(())
}

fn part_callback(session: &mut Session<'_, Features>) -> Result<()> {
    let message = session.message();
    if let Some(users) = session.state.user_lists.get_mut(message.channel()) {
        users.remove(&message.username);
    }
    Ok(())
}

fn correction_command(session: &mut Session<'_, Features>) -> Result<()> {
    let correction = match Correction::parse(session.group(1)) {
        Ok(Some(correction)) => correction,
        Ok(None) => return Ok(()),
        Err(description) => {
            let text = format!("{} {}!", roar(session), description);
            session.reply(&text, SendOptions::default());
            return Ok(());
        }
    };

    let channel = session.message().channel();
    let found = session.state.history.get(channel).and_then(|history| {
        history
            .iter()
            .rev()
            .filter(|entry| !entry.text.starts_with("s/") && !entry.text.starts_with("!s/"))
            .find_map(|entry| {
                correction
                    .apply(&entry.text)
                    .map(|corrected| (entry.nick.clone(), corrected, entry.stacked))
            })
    });

    let Some((target, corrected, stacked)) = found else {
        let text = format!("{} Your request does not apply to any recent messages!", roar(session));
        session.reply(&text, SendOptions::default());
        return Ok(());
    };

    let fake_chance = session.state.chances.fake_correction;
    let fake_out = session.rng().random_bool(fake_chance);
    let corrected = if fake_out { roar(session) } else { corrected };

    let text = format!(
        "{} wishes to {}correct {}: {}",
        session.message().nick(),
        if stacked { "re" } else { "" },
        target,
        corrected
    );
    if !say_or_reply_too_long(session, &text) {
        return Ok(());
    }

    if !fake_out {
        session.state.remember(
            channel,
            HistoryEntry {
                nick: target,
                text: corrected,
                stacked: true,
            },
        );
    }
    Ok(())
}

fn double_command(session: &mut Session<'_, Features>) -> Result<()> {
    let argument = session.group(2).trim();
    let last = session.state.last_message.get(session.message().channel());

    let text = match (argument.is_empty(), last) {
        (false, _) => argument.to_string(),
        (true, Some(last)) if session.group(1).is_empty() => last.clone(),
        (true, _) => DOUBLE_TEAM.to_string(),
    };

    let doubled: String = text.chars().flat_map(|c| [c, c]).collect();
    let text = format!("{} Doubled! {}", roar(session), doubled);
    say_or_reply_too_long(session, &text);
    Ok(())
}

fn help_command(session: &mut Session<'_, Features>) -> Result<()> {
    let text = format!("{} {}", roar(session), session.state.settings.help_text);
    session.reply(&text, SendOptions::escaped());
    Ok(())
}

fn roar_command(session: &mut Session<'_, Features>) -> Result<()> {
    let text = format!("{} {} {}", roar(session), roar(session), roar(session).to_uppercase());
    session.say(&text, SendOptions::default());
    Ok(())
}

fn mute_command(session: &mut Session<'_, Features>) -> Result<()> {
    let channel = session.message().channel();
    let limiter = session.core_mut().channel_limiter();
    if limiter.is_ok(channel) {
        limiter.update(channel, Duration::from_secs(60));
        info!("Muted {} for a minute", channel);
    }
    Ok(())
}

fn pick_command(session: &mut Session<'_, Features>) -> Result<()> {
    let mut choices = session.group(1).trim();
    if choices.is_empty() {
        choices = "heads,tails";
    }

    let options: Vec<&str> = choices.split(',').collect();
    let picked = options.choose(session.rng()).map_or("", |choice| choice.trim());
    let text = format!("{} Picked! {}", roar(session), picked);
    say_or_reply_too_long(session, &text);
    Ok(())
}

fn praise_command(session: &mut Session<'_, Features>) -> Result<()> {
    let argument = session.group(1).trim();
    let text = if argument.is_empty() {
        format!("{} Praise it! Raise it!", roar(session))
    } else {
        format!("{} Praise {}!", roar(session), argument)
    };
    say_or_reply_too_long(session, &text);
    Ok(())
}

fn song_command(session: &mut Session<'_, Features>) -> Result<()> {
    let channel = session.message().channel();
    if !session.state.song_limiter.is_ok(channel) {
        debug!("Song limited in {}", channel);
        return Ok(());
    }

    let mut donger = session.group(1).trim();
    if donger.is_empty() {
        donger = DEFAULT_SUBJECT;
    }
    let text = DONGER_SONG_TEMPLATE.replace("{donger}", donger);
    say_or_reply_too_long(session, &text);

    session.state.song_limiter.update(channel, Duration::ZERO);
    Ok(())
}

fn sort_command(session: &mut Session<'_, Features>) -> Result<()> {
    let mut chars: Vec<char> = subject(session, 1).chars().collect();
    chars.sort_unstable();
    let sorted: String = chars.into_iter().collect();

    let text = format!("{} Sorted! {}", roar(session), sorted.trim());
    say_or_reply_too_long(session, &text);
    Ok(())
}

fn reverse_command(session: &mut Session<'_, Features>) -> Result<()> {
    let reversed: String = subject(session, 1).chars().rev().collect();
    let text = format!("{} Reversed! {}", roar(session), reversed);
    say_or_reply_too_long(session, &text);
    Ok(())
}

fn rip_command(session: &mut Session<'_, Features>) -> Result<()> {
    let mut subject = session.group(1).trim();
    if subject.is_empty() {
        subject = session.message().nick();
    }

    let phrase = ["RIP", "Rest in peace"].choose(session.rng()).copied().unwrap_or("RIP");
    let text = format!("{} {}, {}. Press F to pay your respects.", roar(session), phrase, subject);
    say_or_reply_too_long(session, &text);
    Ok(())
}

fn room_size_command(session: &mut Session<'_, Features>) -> Result<()> {
    let size = session.state.room_size(session.message().channel());
    let text = format!("{} {} users in chat room.", roar(session), size);
    say_or_reply_too_long(session, &text);
    Ok(())
}

fn mail_command(session: &mut Session<'_, Features>) -> Result<()> {
    let channel = session.message().channel();
    if session.state.settings.mail_disabled_channels.contains(channel) {
        let text = format!("{} My mail services cannot be used here.", roar(session).replace('!', "."));
        session.reply(&text, SendOptions::default());
        return Ok(());
    }

    let mail_text = session.group(2).trim();
    if mail_text.is_empty() {
        read_mail(session);
    } else {
        send_mail(session, mail_text);
    }
    Ok(())
}

fn sender_of(session: &Session<'_, Features>) -> Sender {
    let message = session.message();
    Sender {
        username: message.username.clone(),
        display_name: message.nick().to_string(),
        user_id: message.user_id.clone(),
        platform: session.platform(),
    }
}

fn send_mail(session: &mut Session<'_, Features>, mail_text: &str) {
    let length = mail_text.chars().count();
    if length > MAX_MAIL_CHARS {
        let text = format!(
            "{} Your message is too burdensome! Send a concise version instead. ({}/{})",
            roar(session),
            length,
            MAX_MAIL_CHARS
        );
        session.reply(&text, SendOptions::default());
        return;
    }

    let sender = sender_of(session);
    let channel = session.message().channel();
    let stored = session.state.mailbox.put(sender, mail_text, channel);
    let text = match stored {
        Ok(()) => format!(
            "Tremendous! I will deliver this mail to the next recipient without fail! {}",
            roar(session)
        ),
        Err(MailError::OutboxFull) => format!("{} How embarrassing! Your outbox is full!", roar(session)),
        Err(MailError::MailbagFull) => {
            format!("{} Incredulous! My mailbag is full! Read one instead!", roar(session))
        }
    };
    session.reply(&text, SendOptions::default());
}

fn read_mail(session: &mut Session<'_, Features>) {
    let chances = session.state.chances;
    let channel = session.message().channel();
    let reader = sender_of(session);

    let skip_own = !session.rng().random_bool(chances.own_mail);
    let restricted_to = session
        .state
        .settings
        .mail_restricted_channels
        .contains(channel)
        .then(|| channel.to_string());
    if restricted_to.is_some() {
        debug!("Restricting mail to channel {}", channel);
    }

    let filter = MailFilter {
        skip_sender: skip_own.then(|| reader.clone()),
        channel: restricted_to.clone(),
    };
    let any_sender = MailFilter {
        skip_sender: None,
        channel: restricted_to,
    };

    let old_first = session.rng().random_bool(chances.old_mail);
    let old_fallback = session.rng().random_bool(chances.old_mail);
    let (features, rng) = session.state_and_rng();

    let mail = if old_first {
        features.mailbox.random_read(&filter, rng)
    } else {
        features
            .mailbox
            .take_unread(&filter)
            .or_else(|| old_fallback.then(|| features.mailbox.random_read(&any_sender, rng)).flatten())
    };

    let text = match mail {
        None => format!("{} Outlandish! There is no new mail! You should send some!", roar(session)),
        Some(mail) => {
            let origin = if mail.sender.platform == reader.platform {
                String::new()
            } else {
                format!(" ({})", mail.sender.platform.title())
            };
            format!(
                "{} I am delivering mail! Here it is, {}, from {}{}: {}",
                roar(session),
                humanize(Utc::now() - mail.timestamp),
                mail.sender.display_name,
                origin,
                mail.text
            )
        }
    };

    session.reply(
        &text,
        SendOptions {
            multiline: true,
            escape_links: true,
            ..SendOptions::default()
        },
    );
}

fn mail_status_command(session: &mut Session<'_, Features>) -> Result<()> {
    let unread = session.state.mailbox.count(MailStatus::Unread);
    let read = session.state.mailbox.count(MailStatus::Read);
    let channel = session.message().channel();
    let settings = &session.state.settings;
    let disabled = settings.mail_disabled_channels.contains(channel);
    let restricted = settings.mail_restricted_channels.contains(channel);

    let text = format!(
        "{} {} unread, {} read, {} total! (Channel={}, Disabled={}, Restricted={})",
        roar(session),
        unread,
        read,
        unread + read,
        channel,
        disabled,
        restricted
    );
    session.reply(&text, SendOptions::default());
    Ok(())
}

/// Rough "how long ago" phrase
fn humanize(elapsed: ChronoDuration) -> String {
    let plural = |count: i64, unit: &str| {
        if count == 1 {
            format!("a {} ago", unit)
        } else {
            format!("{} {}s ago", count, unit)
        }
    };

    match elapsed.num_seconds() {
        seconds if seconds < 10 => "just now".to_string(),
        seconds if seconds < 60 => "seconds ago".to_string(),
        seconds if seconds < 3600 => plural(seconds / 60, "minute"),
        seconds if seconds < 86_400 => match seconds / 3600 {
            1 => "an hour ago".to_string(),
            hours => format!("{} hours ago", hours),
        },
        seconds if seconds < 86_400 * 30 => plural(seconds / 86_400, "day"),
        seconds if seconds < 86_400 * 365 => plural(seconds / (86_400 * 30), "month"),
        seconds => plural(seconds / (86_400 * 365), "year"),
    }
}
