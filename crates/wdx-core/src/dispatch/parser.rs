use serde::Serialize;

use crate::domain::{ChatId, InboundMessage, SenderId};

/// Prefix, case-folded name and positional args of one command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedCommand {
    pub prefix: char,
    pub name: String,
    pub args: Vec<String>,
}

/// Per-message dispatch input. Never shared across messages.
#[derive(Clone, Debug, Serialize)]
pub struct DispatchRequest {
    pub chat_id: ChatId,
    pub sender_id: SenderId,
    pub sender_name: Option<String>,
    pub raw_text: String,
    pub prefix: char,
    pub parsed_name: String,
    pub args: Vec<String>,
}

impl DispatchRequest {
    pub fn new(msg: InboundMessage, parsed: ParsedCommand) -> Self {
        Self {
            chat_id: msg.chat_id,
            sender_id: msg.sender_id,
            sender_name: msg.sender_name,
            raw_text: msg.text,
            prefix: parsed.prefix,
            parsed_name: parsed.name,
            args: parsed.args,
        }
    }

    /// Arguments re-joined with single spaces.
    pub fn args_text(&self) -> String {
        self.args.join(" ")
    }
}

#[derive(Clone, Debug)]
pub struct CommandParser {
    prefixes: Vec<char>,
    bot_username: Option<String>,
}

impl CommandParser {
    pub fn new(prefixes: Vec<char>) -> Self {
        Self {
            prefixes,
            bot_username: None,
        }
    }

    /// Commands addressed as `/name@other_bot` are ignored once this is set.
    pub fn with_bot_username(mut self, username: impl Into<String>) -> Self {
        let username = username.into();
        let username = username.trim_start_matches('@').to_string();
        self.bot_username = (!username.is_empty()).then_some(username);
        self
    }

    pub fn prefixes(&self) -> &[char] {
        &self.prefixes
    }

    /// `None` when the text is not a command line.
    pub fn parse(&self, text: &str) -> Option<ParsedCommand> {
        let trimmed = text.trim();
        let prefix = trimmed.chars().next()?;
        if !self.prefixes.contains(&prefix) {
            return None;
        }

        let rest = &trimmed[prefix.len_utf8()..];
        // The name must follow the prefix directly: "/ start" is plain text.
        if rest.starts_with(char::is_whitespace) {
            return None;
        }

        let mut tokens = rest.split_whitespace();
        let head = tokens.next()?;

        let name = match head.split_once('@') {
            Some((name, target)) => {
                if let Some(me) = &self.bot_username {
                    if !target.eq_ignore_ascii_case(me) {
                        return None;
                    }
                }
                name
            }
            None => head,
        };
        if name.is_empty() {
            return None;
        }

        Some(ParsedCommand {
            prefix,
            name: name.to_lowercase(),
            args: tokens.map(str::to_string).collect(),
        })
    }
}
