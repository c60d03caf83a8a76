// src/platforms/irc.rs - IRC line parsing and encoding shared by both adapters

use anyhow::{bail, Result};
use log::{debug, warn};
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::bot::outbound::irc_lower;
use crate::types::{EventType, Message, OutboundRequest, Platform};

const CTCP_ACTION_PREFIX: &str = "\x01ACTION ";

/// One parsed protocol line:
/// `@tags :nick!user@host COMMAND param param :trailing`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcLine {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut rest = raw.trim_end_matches(['\r', '\n']);
        let mut tags = HashMap::new();

        if let Some(tagged) = rest.strip_prefix('@') {
            let (tag_part, remainder) = tagged.split_once(' ')?;
            for tag in tag_part.split(';').filter(|tag| !tag.is_empty()) {
                let (key, value) = tag.split_once('=').unwrap_or((tag, ""));
                tags.insert(key.to_string(), unescape_tag_value(value));
            }
            rest = remainder.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(prefixed) = rest.strip_prefix(':') {
            let (source, remainder) = prefixed.split_once(' ')?;
            prefix = Some(source.to_string());
            rest = remainder.trim_start_matches(' ');
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, remainder)) => (command, remainder),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, remainder)) => {
                    params.push(param.to_string());
                    rest = remainder;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Self {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Nickname part of the prefix
    pub fn nick(&self) -> Option<&str> {
        self.prefix.as_deref().map(|prefix| prefix.split('!').next().unwrap_or(prefix))
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str).filter(|value| !value.is_empty())
    }

    /// Normalize into an inbound event, if this line is one the bot cares about
    pub fn to_message(&self, platform: Platform) -> Option<Message> {
        let nick = self.nick().unwrap_or("");
        let mut message = Message::new(EventType::Welcome, platform);
        message.username = irc_lower(nick);
        message.display_name = Some(self.tag("display-name").unwrap_or(nick).to_string());
        message.user_id = self.tag("user-id").map(str::to_string);

        match self.command.as_str() {
            "001" => {
                message.username = String::new();
                message.display_name = None;
            }
            "PRIVMSG" => {
                let target = self.param(0)?;
                if !is_channel(target) {
                    return None;
                }
                let text = self.param(1)?;
                message.channel = Some(irc_lower(target));
                match text.strip_prefix(CTCP_ACTION_PREFIX) {
                    Some(action) => {
                        message.event_type = EventType::Action;
                        message.text = Some(action.trim_end_matches('\x01').to_string());
                    }
                    None => {
                        message.event_type = EventType::PubMsg;
                        message.text = Some(text.to_string());
                    }
                }
            }
            "WHISPER" => {
                message.event_type = EventType::Whisper;
                message.text = Some(self.param(1)?.to_string());
            }
            "JOIN" | "PART" => {
                message.event_type = if self.command == "JOIN" { EventType::Join } else { EventType::Part };
                message.channel = Some(irc_lower(self.param(0)?));
                message.display_name = Some(nick.to_string());
            }
            "NOTICE" => {
                let target = self.param(0)?;
                if !is_channel(target) {
                    return None;
                }
                message.event_type = EventType::Notice;
                message.channel = Some(irc_lower(target));
                message.text = Some(self.param(1).unwrap_or("").to_string());
                message.username = String::new();
                message.display_name = None;
            }
            "CLEARCHAT" => {
                message.event_type = EventType::Clear;
                message.channel = Some(irc_lower(self.param(0)?));
                let cleared = self.param(1);
                message.username = cleared.map(irc_lower).unwrap_or_default();
                message.display_name = cleared.map(str::to_string);
            }
            _ => return None,
        }

        Some(message)
    }
}

fn unescape_tag_value(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            unescaped.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => unescaped.push(';'),
            Some('s') => unescaped.push(' '),
            Some('r') => unescaped.push('\r'),
            Some('n') => unescaped.push('\n'),
            Some(other) => unescaped.push(other),
            None => {}
        }
    }
    unescaped
}

pub fn is_channel(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}

fn has_control_chars(text: &str) -> bool {
    text.chars().any(|c| (c as u32) < 0x20)
}

/// Encode an outbound request as raw protocol lines (without CRLF)
pub fn encode_request(request: &OutboundRequest) -> Result<Vec<String>> {
    match request {
        OutboundRequest::SendText { target, text, action } => {
            if has_control_chars(target) || has_control_chars(text) {
                bail!("forbidden control characters");
            }
            let line = if *action {
                format!("PRIVMSG {} :{}{}\x01", target, CTCP_ACTION_PREFIX, text)
            } else {
                format!("PRIVMSG {} :{}", target, text)
            };
            Ok(vec![line])
        }
        OutboundRequest::Join { channel } => {
            if has_control_chars(channel) {
                bail!("forbidden control characters");
            }
            Ok(vec![format!("JOIN {}", channel)])
        }
        OutboundRequest::Part { channel } => {
            if has_control_chars(channel) {
                bail!("forbidden control characters");
            }
            Ok(vec![format!("PART {}", channel)])
        }
    }
}

/// Handle one raw inbound line: answer PINGs, hand events to the forwarder.
///
/// Never waits on the dispatcher, so a full inbound queue cannot stall the
/// reader. Events that overflow the forward buffer are dropped. Returns an
/// error once the forwarder is gone.
pub async fn handle_line(
    platform: Platform,
    raw: &str,
    lines: &mpsc::Sender<String>,
    forward: &mpsc::Sender<Message>,
) -> Result<()> {
    let Some(line) = IrcLine::parse(raw) else {
        if !raw.trim().is_empty() {
            debug!("Unparseable {} line: {}", platform, raw);
        }
        return Ok(());
    };

    if line.command == "PING" {
        let token = line.param(0).unwrap_or("");
        if lines.send(format!("PONG :{}", token)).await.is_err() {
            warn!("Failed to send PONG to {}", platform);
        }
        return Ok(());
    }

    if line.command == "RECONNECT" {
        bail!("{} asked us to reconnect", platform);
    }

    if let Some(message) = line.to_message(platform) {
        debug!("Parsed {:?} from {} in {:?}", message.event_type, message.username, message.channel);
        match forward.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!("{} forward buffer is full, dropping {:?}", platform, message);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => bail!("inbound queue closed"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_privmsg() {
        let line = IrcLine::parse(
            "@badges=moderator/1;display-name=Alice;user-id=1234 :alice!alice@alice.tmi.twitch.tv PRIVMSG #Test :!pick a,b,c\r\n",
        )
        .unwrap();

        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.nick(), Some("alice"));
        assert_eq!(line.params, vec!["#Test".to_string(), "!pick a,b,c".to_string()]);

        let message = line.to_message(Platform::Twitch).unwrap();
        assert_eq!(message.event_type, EventType::PubMsg);
        assert_eq!(message.channel.as_deref(), Some("#test"));
        assert_eq!(message.username, "alice");
        assert_eq!(message.display_name.as_deref(), Some("Alice"));
        assert_eq!(message.user_id.as_deref(), Some("1234"));
        assert_eq!(message.text(), "!pick a,b,c");
    }

    #[test]
    fn test_parse_action_and_tag_escapes() {
        let line = IrcLine::parse("@display-name=Big\\sBob :Bob!b@h PRIVMSG &42 :\x01ACTION waves\x01").unwrap();
        let message = line.to_message(Platform::Discord).unwrap();

        assert_eq!(message.event_type, EventType::Action);
        assert_eq!(message.text(), "waves");
        assert_eq!(message.display_name.as_deref(), Some("Big Bob"));
        assert_eq!(message.username, "bob");
        assert_eq!(message.channel(), "&42");
    }

    #[test]
    fn test_parse_membership_and_welcome() {
        let join = IrcLine::parse(":Carol!c@h JOIN #test").unwrap().to_message(Platform::Twitch).unwrap();
        assert_eq!(join.event_type, EventType::Join);
        assert_eq!(join.username, "carol");

        let welcome = IrcLine::parse(":tmi.twitch.tv 001 bot :Welcome, GLHF!").unwrap().to_message(Platform::Twitch).unwrap();
        assert_eq!(welcome.event_type, EventType::Welcome);

        let clear = IrcLine::parse(":tmi.twitch.tv CLEARCHAT #test :Spammer").unwrap().to_message(Platform::Twitch).unwrap();
        assert_eq!(clear.event_type, EventType::Clear);
        assert_eq!(clear.username, "spammer");
    }

    #[test]
    fn test_private_privmsg_is_ignored() {
        let line = IrcLine::parse(":alice!a@h PRIVMSG bot :hello").unwrap();
        assert!(line.to_message(Platform::Twitch).is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(IrcLine::parse("").is_none());
        assert!(IrcLine::parse("@only-tags").is_none());
        assert_eq!(IrcLine::parse("PING :tmi.twitch.tv").unwrap().param(0), Some("tmi.twitch.tv"));
    }

    #[test]
    fn test_encode_requests() {
        let say = OutboundRequest::SendText { target: "#test".into(), text: "hi".into(), action: false };
        assert_eq!(encode_request(&say).unwrap(), vec!["PRIVMSG #test :hi".to_string()]);

        let action = OutboundRequest::SendText { target: "#test".into(), text: "roars".into(), action: true };
        assert_eq!(encode_request(&action).unwrap(), vec!["PRIVMSG #test :\x01ACTION roars\x01".to_string()]);

        let join = OutboundRequest::Join { channel: "#a,#b".into() };
        assert_eq!(encode_request(&join).unwrap(), vec!["JOIN #a,#b".to_string()]);

        let bad = OutboundRequest::SendText { target: "#test".into(), text: "a\r\nQUIT".into(), action: false };
        assert!(encode_request(&bad).is_err());
    }

    #[tokio::test]
    async fn test_handle_line_answers_ping_and_forwards_events() {
        let (line_tx, mut line_rx) = mpsc::channel(4);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(4);

        handle_line(Platform::Twitch, "PING :tmi.twitch.tv", &line_tx, &inbound_tx).await.unwrap();
        assert_eq!(line_rx.recv().await.unwrap(), "PONG :tmi.twitch.tv");

        handle_line(Platform::Twitch, ":a!a@h PRIVMSG #test :hello", &line_tx, &inbound_tx).await.unwrap();
        assert_eq!(inbound_rx.recv().await.unwrap().text(), "hello");
    }

    #[tokio::test]
    async fn test_handle_line_keeps_answering_pings_when_forward_buffer_is_full() {
        let (line_tx, mut line_rx) = mpsc::channel(4);
        let (forward_tx, mut forward_rx) = mpsc::channel(1);

        for text in ["one", "two", "three"] {
            let raw = format!(":a!a@h PRIVMSG #test :{}", text);
            handle_line(Platform::Twitch, &raw, &line_tx, &forward_tx).await.unwrap();
        }
        handle_line(Platform::Twitch, "PING :alive", &line_tx, &forward_tx).await.unwrap();

        assert_eq!(line_rx.recv().await.unwrap(), "PONG :alive");
        assert_eq!(forward_rx.recv().await.unwrap().text(), "one");
        assert!(forward_rx.try_recv().is_err());

        drop(forward_rx);
        assert!(handle_line(Platform::Twitch, ":a!a@h PRIVMSG #test :four", &line_tx, &forward_tx)
            .await
            .is_err());
    }
}
