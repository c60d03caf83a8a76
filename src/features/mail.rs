use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use rand::RngCore;
use thiserror::Error;

use crate::types::Platform;

/// Unread mail one sender may have waiting
pub const OUTBOX_CAPACITY: usize = 20;
/// Unread mail the whole bag may hold
pub const MAILBAG_CAPACITY: usize = 500;
/// Longest accepted mail text, in characters
pub const MAX_MAIL_CHARS: usize = 500;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MailError {
    #[error("sender outbox is full")]
    OutboxFull,
    #[error("mailbag is full")]
    MailbagFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailStatus {
    Unread,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub username: String,
    /// Name as shown in chat
    pub display_name: String,
    pub user_id: Option<String>,
    pub platform: Platform,
}

impl Sender {
    fn same_account(&self, other: &Sender) -> bool {
        self.username == other.username
            || (self.platform == other.platform && self.user_id.is_some() && self.user_id == other.user_id)
    }
}

#[derive(Debug, Clone)]
pub struct Mail {
    pub sender: Sender,
    pub text: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub status: MailStatus,
}

/// Which mail a reader may receive
#[derive(Debug, Clone, Default)]
pub struct MailFilter {
    /// Skip mail this account sent
    pub skip_sender: Option<Sender>,
    /// Only mail posted in this channel
    pub channel: Option<String>,
}

impl MailFilter {
    fn accepts(&self, mail: &Mail) -> bool {
        if let Some(sender) = &self.skip_sender {
            if sender.same_account(&mail.sender) {
                return false;
            }
        }
        self.channel.as_ref().map_or(true, |channel| *channel == mail.channel)
    }
}

/// Storage behind the mail commands
pub trait Mailbox: Send {
    /// Store a new unread mail
    fn put(&mut self, sender: Sender, text: &str, channel: &str) -> Result<(), MailError>;

    /// Oldest unread mail passing `filter`, marked read on return
    fn take_unread(&mut self, filter: &MailFilter) -> Option<Mail>;

    /// A random already-read mail passing `filter`
    fn random_read(&self, filter: &MailFilter, rng: &mut dyn RngCore) -> Option<Mail>;

    fn count(&self, status: MailStatus) -> usize;
}

/// Mailbox held in memory for the life of the process
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    mail: Vec<Mail>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mailbox for MemoryMailbox {
    fn put(&mut self, sender: Sender, text: &str, channel: &str) -> Result<(), MailError> {
        let unread = self.mail.iter().filter(|mail| mail.status == MailStatus::Unread);

        if unread.clone().filter(|mail| mail.sender.username == sender.username).count() >= OUTBOX_CAPACITY {
            return Err(MailError::OutboxFull);
        }
        if unread.count() >= MAILBAG_CAPACITY {
            return Err(MailError::MailbagFull);
        }

        self.mail.push(Mail {
            sender,
            text: text.to_string(),
            channel: channel.to_string(),
            timestamp: Utc::now(),
            status: MailStatus::Unread,
        });
        Ok(())
    }

    fn take_unread(&mut self, filter: &MailFilter) -> Option<Mail> {
        let mail = self
            .mail
            .iter_mut()
            .find(|mail| mail.status == MailStatus::Unread && filter.accepts(mail))?;
        mail.status = MailStatus::Read;
        Some(mail.clone())
    }

    fn random_read(&self, filter: &MailFilter, rng: &mut dyn RngCore) -> Option<Mail> {
        let candidates: Vec<&Mail> = self
            .mail
            .iter()
            .filter(|mail| mail.status == MailStatus::Read && filter.accepts(mail))
            .collect();
        candidates.choose(rng).map(|mail| (*mail).clone())
    }

    fn count(&self, status: MailStatus) -> usize {
        self.mail.iter().filter(|mail| mail.status == status).count()
    }
}
