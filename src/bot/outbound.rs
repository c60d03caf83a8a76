// src/bot/outbound.rs - Platform-aware line splitting and text safety checks

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use crate::types::Platform;

/// Marker prepended to every line after the first of a multiline reply
pub const CONTINUATION_PREFIX: &str = "(...) ";

/// Leading characters that chat services interpret as commands
const COMMAND_PREFIX_CHARS: &[char] = &['.', '/', '!', '`', '_'];

/// Length budget for one outbound line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    pub max_chars: usize,
    pub max_bytes: usize,
}

impl MessageLimits {
    /// Budget for a destination platform.
    ///
    /// `extended_char_limit` is the primary connection's flag for services that
    /// accept 500 characters per line instead of the IRC-safe 400 bytes.
    pub fn for_platform(platform: Platform, extended_char_limit: bool) -> Self {
        match platform {
            Platform::Discord => Self {
                max_chars: 2000,
                max_bytes: 2000 * 4,
            },
            Platform::Twitch if extended_char_limit => Self {
                max_chars: 500,
                max_bytes: 1800,
            },
            Platform::Twitch => Self {
                max_chars: 400,
                max_bytes: 400,
            },
        }
    }

    pub fn fits(&self, text: &str) -> bool {
        text.chars().count() <= self.max_chars && text.len() <= self.max_bytes
    }
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self::for_platform(Platform::Twitch, false)
    }
}

/// Why a line was refused by the safety check
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnsafeText {
    #[error("text is {chars} chars / {bytes} bytes, over the {max_chars} / {max_bytes} budget")]
    TooLong {
        chars: usize,
        bytes: usize,
        max_chars: usize,
        max_bytes: usize,
    },
    #[error("text starts with command prefix {0:?}")]
    CommandPrefix(char),
    #[error("text contains control characters")]
    ControlCharacters,
}

fn control_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\x00-\x1f]").expect("static pattern"))
}

fn bare_links() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<?(https?://[^\s<>]+)>?").expect("static pattern"))
}

/// Remove the forbidden `0x00-0x1F` range
pub fn strip_unsafe_chars(text: &str) -> String {
    control_chars().replace_all(text, "").into_owned()
}

/// Validate a line against the budget and the chat-safety rules.
///
/// The empty string is always accepted.
pub fn check_text(text: &str, allow_command_prefix: bool, limits: MessageLimits) -> Result<(), UnsafeText> {
    let Some(first) = text.chars().next() else {
        return Ok(());
    };

    let chars = text.chars().count();
    if chars > limits.max_chars || text.len() > limits.max_bytes {
        return Err(UnsafeText::TooLong {
            chars,
            bytes: text.len(),
            max_chars: limits.max_chars,
            max_bytes: limits.max_bytes,
        });
    }

    if !allow_command_prefix && COMMAND_PREFIX_CHARS.contains(&first) {
        return Err(UnsafeText::CommandPrefix(first));
    }

    if control_chars().is_match(text) {
        return Err(UnsafeText::ControlCharacters);
    }

    Ok(())
}

/// Wrap bare URLs in angle brackets so the gateway platform does not embed them
pub fn escape_links(text: &str) -> String {
    bare_links().replace_all(text, "<$1>").into_owned()
}

/// Split `text` into chunks of at most `max_bytes` bytes without cutting a
/// codepoint. Chunks after the first are sized so they still fit once the
/// continuation prefix is added.
pub fn split_utf8(text: &str, max_bytes: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    let mut budget = max_bytes;

    while rest.len() > budget {
        let mut cut = budget;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // Budget smaller than one codepoint: emit the codepoint whole
            cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }

        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
        budget = max_bytes.saturating_sub(CONTINUATION_PREFIX.len()).max(1);
    }

    chunks.push(rest);
    chunks
}

/// Split `text` into chunks of at most `max_chars` characters
pub fn split_chars(text: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    loop {
        match rest.char_indices().nth(max_chars) {
            Some((cut, _)) => {
                let (head, tail) = rest.split_at(cut);
                chunks.push(head);
                rest = tail;
            }
            None => {
                chunks.push(rest);
                return chunks;
            }
        }
    }
}

/// Break a long reply into prefixed lines.
///
/// With `by_chars` the text is cut every `max_length` characters, otherwise
/// every `max_length` UTF-8 bytes.
pub fn split_multiline(text: &str, max_length: usize, by_chars: bool) -> Vec<String> {
    let parts = if by_chars {
        split_chars(text, max_length)
    } else {
        split_utf8(text, max_length)
    };

    parts
        .into_iter()
        .enumerate()
        .map(|(index, part)| {
            if index == 0 {
                part.to_string()
            } else {
                format!("{}{}", CONTINUATION_PREFIX, part)
            }
        })
        .collect()
}

/// rfc1459 lowercase as used by IRC servers for nick and channel comparison
pub fn irc_lower(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            '~' => '^',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}
