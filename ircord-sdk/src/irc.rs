//! IRC wire format: parsing lines into [`Message`]s and encoding them back.
//!
//! Grammar handled: `[@tags] [:prefix] COMMAND [params...] [:trailing]`.
//! Lines may end in `\r\n`, `\n` or nothing. Tag values are unescaped on
//! parse and escaped on encode.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EncodeError, ParseError};

/// Maximum length of an encoded line (without tags), including the CRLF.
pub const MAX_LINE_BYTES: usize = 512;

/// A single IRC protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// IRCv3 message tags (empty if none).
    pub tags: BTreeMap<String, String>,
    /// Source of the message (`nick!user@host` or a server name).
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Build a message with no tags and no prefix.
    pub fn new<I, S>(command: &str, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: BTreeMap::new(),
            prefix: None,
            command: command.to_string(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse one line from the wire.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut rest = line.trim_start_matches(' ');
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut tags = BTreeMap::new();
        if let Some(stripped) = rest.strip_prefix('@') {
            let (raw, tail) = stripped.split_once(' ').ok_or(ParseError::MissingCommand)?;
            for item in raw.split(';').filter(|s| !s.is_empty()) {
                match item.split_once('=') {
                    Some((k, v)) => tags.insert(k.to_string(), unescape_tag_value(v)),
                    None => tags.insert(item.to_string(), String::new()),
                };
            }
            rest = tail.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (p, tail) = stripped.split_once(' ').unwrap_or((stripped, ""));
            if p.is_empty() {
                return Err(ParseError::EmptyPrefix);
            }
            prefix = Some(p.to_string());
            rest = tail.trim_start_matches(' ');
        }

        if rest.is_empty() {
            return Err(ParseError::MissingCommand);
        }
        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if !is_valid_command(command) {
            return Err(ParseError::InvalidCommand(command.to_string()));
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
            let (param, tail) = rest.split_once(' ').unwrap_or((rest, ""));
            params.push(param.to_string());
            rest = tail;
        }

        Ok(Self {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Encode to a wire line terminated by CRLF.
    ///
    /// When there are two or more parameters, or the last one needs it, the
    /// final parameter is written in trailing (`:`) form.
    pub fn encode(&self) -> Result<String, EncodeError> {
        if !is_valid_command(&self.command) {
            return Err(EncodeError::InvalidCommand(self.command.clone()));
        }

        let mut tags = String::new();
        if !self.tags.is_empty() {
            tags.push('@');
            let joined: Vec<String> = self
                .tags
                .iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        k.clone()
                    } else {
                        format!("{k}={}", escape_tag_value(v))
                    }
                })
                .collect();
            tags.push_str(&joined.join(";"));
            tags.push(' ');
        }

        let mut line = String::new();
        if let Some(prefix) = &self.prefix {
            line.push(':');
            line.push_str(prefix);
            line.push(' ');
        }
        line.push_str(&self.command);

        let last = self.params.len().saturating_sub(1);
        for (index, param) in self.params.iter().enumerate() {
            if param.contains(['\r', '\n', '\0']) {
                return Err(EncodeError::ForbiddenByte { index });
            }
            line.push(' ');
            if index == last {
                let needs_trailing =
                    param.is_empty() || param.contains(' ') || param.starts_with(':');
                if needs_trailing || self.params.len() > 1 {
                    line.push(':');
                }
            } else if param.is_empty() || param.contains(' ') || param.starts_with(':') {
                return Err(EncodeError::InvalidMiddle { index });
            }
            line.push_str(param);
        }
        line.push_str("\r\n");

        if line.len() > MAX_LINE_BYTES {
            return Err(EncodeError::TooLong {
                len: line.len(),
                max: MAX_LINE_BYTES,
            });
        }
        Ok(format!("{tags}{line}"))
    }

    /// Nick portion of the prefix (`nick` in `nick!user@host`).
    pub fn source_nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split_once('!').map_or(prefix, |(nick, _)| nick))
    }
}

impl fmt::Display for Message {
    /// Best-effort rendering for logs; use [`Message::encode`] for the wire.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        for param in &self.params {
            write!(f, " {param:?}")?;
        }
        Ok(())
    }
}

/// Split `text` into pieces of at most `size` bytes, never cutting a char.
///
/// A `size` of 0 means "don't split". A single char wider than `size` still
/// gets a piece of its own.
pub fn split_message(text: &str, size: usize) -> Vec<String> {
    if size == 0 || text.len() <= size {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (piece, tail) = rest.split_at(end);
        pieces.push(piece.to_string());
        rest = tail;
    }
    pieces
}

fn is_valid_command(command: &str) -> bool {
    if command.is_empty() {
        return false;
    }
    command.chars().all(|c| c.is_ascii_alphabetic())
        || (command.len() == 3 && command.chars().all(|c| c.is_ascii_digit()))
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}
