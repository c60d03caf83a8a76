//! `s/pattern/replacement/flags` corrections of recent chat lines

use regex::{Regex, RegexBuilder};

/// Compiled program size allowed for user-supplied patterns
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug)]
pub struct Correction {
    pub pattern: Regex,
    /// Replacement in `regex` crate syntax
    pub replacement: String,
    pub global: bool,
}

impl Correction {
    /// Parse the part after `s/`, e.g. `colour/color/gi`.
    ///
    /// `Ok(None)` means the text is not a well-formed substitution and should
    /// be ignored; `Err` carries a message fit for the user.
    pub fn parse(body: &str) -> Result<Option<Self>, String> {
        let parts = split_unescaped(body);
        if !(2..=3).contains(&parts.len()) {
            return Ok(None);
        }

        let flags = parts.get(2).copied().unwrap_or("");
        let pattern = RegexBuilder::new(parts[0])
            .case_insensitive(flags.contains('i'))
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map_err(|e| describe_error(&e))?;

        Ok(Some(Self {
            pattern,
            replacement: translate_replacement(&parts[1].replace("\\/", "/")),
            global: flags.contains('g'),
        }))
    }

    /// Apply to `text`, `None` when the pattern does not match
    pub fn apply(&self, text: &str) -> Option<String> {
        if !self.pattern.is_match(text) {
            return None;
        }
        let limit = if self.global { 0 } else { 1 };
        Some(self.pattern.replacen(text, limit, self.replacement.as_str()).into_owned())
    }
}

/// Split on `/` not preceded by a backslash
fn split_unescaped(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut previous = None;

    for (index, c) in text.char_indices() {
        if c == '/' && previous != Some('\\') {
            parts.push(&text[start..index]);
            start = index + 1;
        }
        previous = Some(c);
    }
    parts.push(&text[start..]);
    parts
}

/// Convert `\1` and `\g<name>` group references to `${1}` / `${name}` and
/// escape literal dollar signs.
fn translate_replacement(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(digit) if digit.is_ascii_digit() => {
                    let mut group = String::new();
                    while let Some(digit) = chars.peek().copied().filter(char::is_ascii_digit) {
                        group.push(digit);
                        chars.next();
                    }
                    out.push_str(&format!("${{{}}}", group));
                }
                Some('g') => {
                    chars.next();
                    if chars.peek() == Some(&'<') {
                        chars.next();
                        let name: String = chars.by_ref().take_while(|&c| c != '>').collect();
                        out.push_str(&format!("${{{}}}", name));
                    } else {
                        out.push_str("\\g");
                    }
                }
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                _ => out.push('\\'),
            },
            other => out.push(other),
        }
    }

    out
}

/// First line of the error's own message, capitalised
fn describe_error(error: &regex::Error) -> String {
    let text = match error {
        regex::Error::CompiledTooBig(_) => "pattern too large".to_string(),
        other => {
            let full = other.to_string();
            full.lines()
                .find_map(|line| line.trim().strip_prefix("error: "))
                .unwrap_or_else(|| full.lines().next().unwrap_or("invalid pattern"))
                .to_string()
        }
    };

    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => text,
    }
}
