//! IRC message types and the line codec.
//!
//! Grammar: `[':' origin ' '] command (' ' param)* [' :' trailing]`
//!
//! `origin` is `name['!'user]['@'host]` (or a bare server name), `command`
//! is letters or exactly three digits. The trailing parameter is kept
//! separate from the middle params so that "absent" and "empty" survive a
//! round trip.

use std::collections::HashMap;
use std::fmt;

/// Line delimiter the reader splits on.
pub const DELIMITER: u8 = b'\n';

/// Terminator appended to every serialized line.
pub const LINE_ENDING: &str = "\r\n";

/// Longest line accepted from the wire (IRCv3 message-tags limit).
pub const MAX_LINE_LENGTH: usize = 8191;

/// A line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("line has no command")]
    MissingCommand,
    #[error("invalid command {0:?}")]
    InvalidCommand(String),
    #[error("line exceeds maximum length ({0} bytes)")]
    LineTooLong(usize),
    #[error("invalid parameter {0:?}")]
    InvalidParam(String),
    #[error("invalid origin {0:?}")]
    InvalidOrigin(String),
    #[error("line break or NUL inside message")]
    ForbiddenCharacter,
}

/// Sender identity carried in the line prefix.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Origin {
    /// Nick, or the server name for server-originated lines.
    pub name: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl Origin {
    /// Parse `name[!user][@host]`.
    pub fn parse(s: &str) -> Self {
        let (rest, host) = match s.split_once('@') {
            Some((rest, host)) => (rest, Some(host.to_string())),
            None => (s, None),
        };
        let (name, user) = match rest.split_once('!') {
            Some((name, user)) => (name, Some(user.to_string())),
            None => (rest, None),
        };
        Self {
            name: name.to_string(),
            user,
            host,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(ref user) = self.user {
            write!(f, "!{user}")?;
        }
        if let Some(ref host) = self.host {
            write!(f, "@{host}")?;
        }
        Ok(())
    }
}

/// One protocol unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Present only on server-originated lines.
    pub origin: Option<Origin>,
    pub command: String,
    /// Middle parameters, in order. None of them contains a space or
    /// starts with `:`.
    pub params: Vec<String>,
    /// Final parameter. `Some("")` and `None` are different lines.
    pub trailing: Option<String>,
    /// Session-scoped tags attached by the runtime (network name, server).
    /// Never serialized.
    pub context: HashMap<String, String>,
}

impl Message {
    /// Parse a raw IRC line. A trailing `\r\n` or `\n` is stripped first.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() > MAX_LINE_LENGTH {
            return Err(ParseError::LineTooLong(line.len()));
        }
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut rest = line;

        // Prefix: :server or :nick!user@host
        let origin = match rest.strip_prefix(':') {
            Some(prefixed) => {
                let (origin, after) = prefixed
                    .split_once(' ')
                    .ok_or(ParseError::MissingCommand)?;
                rest = after.trim_start_matches(' ');
                Some(Origin::parse(origin))
            }
            None => None,
        };

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, after)) => (command, after),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }
        if !is_valid_command(command) {
            return Err(ParseError::InvalidCommand(command.to_string()));
        }

        let mut params = Vec::new();
        let mut trailing = None;
        while !rest.is_empty() {
            if let Some(text) = rest.strip_prefix(':') {
                trailing = Some(text.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, after)) => {
                    if !param.is_empty() {
                        params.push(param.to_string());
                    }
                    rest = after;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(Message {
            origin,
            command: command.to_string(),
            params,
            trailing,
            context: HashMap::new(),
        })
    }

    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Default::default()
        }
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    pub fn with_trailing(mut self, trailing: impl Into<String>) -> Self {
        self.trailing = Some(trailing.into());
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Identity announcement sent first on every registration.
    pub fn nick(nick: &str) -> Self {
        Self::new("NICK").with_trailing(nick)
    }

    /// User registration, sent right after [`Message::nick`].
    pub fn user(user: &str, realname: &str) -> Self {
        Self::new("USER")
            .with_params([user, "0", "*"])
            .with_trailing(realname)
    }

    pub fn pong(token: Option<&str>) -> Self {
        let msg = Self::new("PONG");
        match token {
            Some(token) => msg.with_trailing(token),
            None => msg,
        }
    }

    pub fn privmsg(target: &str, text: &str) -> Self {
        Self::new("PRIVMSG").with_params([target]).with_trailing(text)
    }

    /// Look up a runtime context tag.
    pub fn context(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    /// Check that the message serializes to exactly one line that parses
    /// back to the same message.
    ///
    /// Middle params must be non-empty, contain no space and not start with
    /// `:`. No part may contain CR, LF or NUL.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.command.is_empty() {
            return Err(ParseError::MissingCommand);
        }
        if !is_valid_command(&self.command) {
            return Err(ParseError::InvalidCommand(self.command.clone()));
        }
        if let Some(ref origin) = self.origin {
            let parts = [Some(&origin.name), origin.user.as_ref(), origin.host.as_ref()];
            let bad = origin.name.is_empty()
                || parts
                    .into_iter()
                    .flatten()
                    .any(|part| part.contains(' ') || has_line_break(part));
            if bad {
                return Err(ParseError::InvalidOrigin(origin.to_string()));
            }
        }
        for param in &self.params {
            if has_line_break(param) {
                return Err(ParseError::ForbiddenCharacter);
            }
            if param.is_empty() || param.contains(' ') || param.starts_with(':') {
                return Err(ParseError::InvalidParam(param.clone()));
            }
        }
        if self.trailing.as_deref().is_some_and(has_line_break) {
            return Err(ParseError::ForbiddenCharacter);
        }
        let len = self.to_string().len();
        if len > MAX_LINE_LENGTH {
            return Err(ParseError::LineTooLong(len));
        }
        Ok(())
    }

    /// Serialized form including the line terminator.
    pub fn to_wire(&self) -> String {
        format!("{self}{LINE_ENDING}")
    }
}

fn has_line_break(s: &str) -> bool {
    s.contains(['\r', '\n', '\0'])
}

fn is_valid_command(command: &str) -> bool {
    let bytes = command.as_bytes();
    bytes.iter().all(u8::is_ascii_alphabetic)
        || (bytes.len() == 3 && bytes.iter().all(u8::is_ascii_digit))
}

/// Renders the line without its terminator; see [`Message::to_wire`].
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref origin) = self.origin {
            write!(f, ":{origin} ")?;
        }
        write!(f, "{}", self.command)?;
        for param in &self.params {
            write!(f, " {param}")?;
        }
        if let Some(ref trailing) = self.trailing {
            write!(f, " :{trailing}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_command() {
        let msg = Message::parse("QUIT").unwrap();
        assert!(msg.origin.is_none());
        assert_eq!(msg.command, "QUIT");
        assert!(msg.params.is_empty());
        assert!(msg.trailing.is_none());
    }

    #[test]
    fn parse_full_origin() {
        let msg = Message::parse(":alice!al@example.org PRIVMSG #chan :hello there").unwrap();
        let origin = msg.origin.unwrap();
        assert_eq!(origin.name, "alice");
        assert_eq!(origin.user.as_deref(), Some("al"));
        assert_eq!(origin.host.as_deref(), Some("example.org"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan"]);
        assert_eq!(msg.trailing.as_deref(), Some("hello there"));
    }

    #[test]
    fn parse_server_origin_and_numeric() {
        let msg = Message::parse(":irc.example.net 001 bot :Welcome to the network\r\n").unwrap();
        let origin = msg.origin.unwrap();
        assert_eq!(origin.name, "irc.example.net");
        assert!(origin.user.is_none());
        assert!(origin.host.is_none());
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["bot"]);
        assert_eq!(msg.trailing.as_deref(), Some("Welcome to the network"));
    }

    #[test]
    fn parse_origin_with_host_only() {
        let origin = Origin::parse("alice@host");
        assert_eq!(origin.name, "alice");
        assert!(origin.user.is_none());
        assert_eq!(origin.host.as_deref(), Some("host"));
        assert_eq!(origin.to_string(), "alice@host");
    }

    #[test]
    fn parse_strips_carriage_return() {
        let msg = Message::parse("PING :token\r\n").unwrap();
        assert_eq!(msg.trailing.as_deref(), Some("token"));
        let msg = Message::parse("PING token\r").unwrap();
        assert_eq!(msg.params, vec!["token"]);
    }

    #[test]
    fn parse_trailing_keeps_colons_and_spaces() {
        let msg = Message::parse("PRIVMSG #c ::)  two  spaces ").unwrap();
        assert_eq!(msg.trailing.as_deref(), Some(":)  two  spaces "));
    }

    #[test]
    fn empty_and_absent_trailing_differ() {
        let empty = Message::parse("TOPIC #chan :").unwrap();
        assert_eq!(empty.trailing.as_deref(), Some(""));
        let absent = Message::parse("TOPIC #chan").unwrap();
        assert!(absent.trailing.is_none());
        assert_ne!(empty, absent);
    }

    #[test]
    fn parse_rejects_missing_command() {
        assert_eq!(Message::parse(""), Err(ParseError::Empty));
        assert_eq!(Message::parse("\r\n"), Err(ParseError::Empty));
        assert_eq!(Message::parse(":onlyprefix"), Err(ParseError::MissingCommand));
        assert_eq!(Message::parse(":prefix "), Err(ParseError::MissingCommand));
        assert_eq!(Message::parse(" NICK x"), Err(ParseError::MissingCommand));
    }

    #[test]
    fn parse_rejects_bad_command_tokens() {
        assert!(matches!(Message::parse("12 x"), Err(ParseError::InvalidCommand(_))));
        assert!(matches!(Message::parse("1234 x"), Err(ParseError::InvalidCommand(_))));
        assert!(matches!(Message::parse("PRIV-MSG x"), Err(ParseError::InvalidCommand(_))));
        assert!(matches!(Message::parse("N1CK x"), Err(ParseError::InvalidCommand(_))));
    }

    #[test]
    fn parse_rejects_oversized_line() {
        let line = format!("PRIVMSG #c :{}", "x".repeat(MAX_LINE_LENGTH));
        assert!(matches!(Message::parse(&line), Err(ParseError::LineTooLong(_))));
    }

    #[test]
    fn serialize_registration() {
        assert_eq!(Message::nick("bot").to_wire(), "NICK :bot\r\n");
        assert_eq!(
            Message::user("botuser", "Repost Bot").to_wire(),
            "USER botuser 0 * :Repost Bot\r\n"
        );
    }

    #[test]
    fn serialize_omits_absent_origin() {
        let msg = Message::privmsg("#chan", "hi");
        assert_eq!(msg.to_string(), "PRIVMSG #chan :hi");
        let msg = msg.with_origin(Origin::parse("a!b@c"));
        assert_eq!(msg.to_string(), ":a!b@c PRIVMSG #chan :hi");
    }

    #[test]
    fn validate_rejects_line_injection() {
        let msg = Message::privmsg("#c", "hi\r\nQUIT :gone");
        assert_eq!(msg.validate(), Err(ParseError::ForbiddenCharacter));
        let msg = Message::new("JOIN").with_params(["#c\n"]);
        assert_eq!(msg.validate(), Err(ParseError::ForbiddenCharacter));
        let msg = Message::privmsg("#c", "nul\0byte");
        assert_eq!(msg.validate(), Err(ParseError::ForbiddenCharacter));
    }

    #[test]
    fn validate_rejects_params_that_would_reparse_differently() {
        for param in ["#c two", ":x", ""] {
            let msg = Message::new("PRIVMSG").with_params([param]).with_trailing("t");
            assert_eq!(
                msg.validate(),
                Err(ParseError::InvalidParam(param.to_string())),
                "param {param:?}"
            );
        }
    }

    #[test]
    fn validate_rejects_bad_command_and_origin() {
        assert_eq!(Message::new("").validate(), Err(ParseError::MissingCommand));
        assert!(matches!(
            Message::new("PRIV MSG").validate(),
            Err(ParseError::InvalidCommand(_))
        ));
        let msg = Message::pong(None).with_origin(Origin::parse("a b!u@h"));
        assert!(matches!(msg.validate(), Err(ParseError::InvalidOrigin(_))));
    }

    #[test]
    fn validate_rejects_oversized_message() {
        let msg = Message::privmsg("#c", &"x".repeat(MAX_LINE_LENGTH));
        assert!(matches!(msg.validate(), Err(ParseError::LineTooLong(_))));
    }

    #[test]
    fn valid_messages_pass_validation() {
        let messages = [
            Message::nick("bot"),
            Message::user("bot", "Real Name"),
            Message::pong(None),
            Message::privmsg("#chan", ": leading colon and  spaces"),
            Message::new("TOPIC").with_params(["#chan"]).with_trailing(""),
            Message::parse(":n!u@h PRIVMSG #chan :text").unwrap(),
        ];
        for msg in messages {
            assert_eq!(msg.validate(), Ok(()), "{msg}");
            assert_eq!(Message::parse(&msg.to_wire()).unwrap(), msg);
        }
    }

    #[test]
    fn context_is_not_serialized() {
        let mut msg = Message::pong(Some("x"));
        msg.context.insert("network".into(), "libera".into());
        assert_eq!(msg.to_wire(), "PONG :x\r\n");
        assert_eq!(msg.context("network"), Some("libera"));
    }

    #[test]
    fn wire_lines_survive_parse_and_serialize() {
        let lines = [
            "QUIT",
            "PING :",
            "JOIN #a,#b key",
            ":srv 353 bot = #chan :@op +voice plain",
            ":n!u@h PRIVMSG #chan :multi word text",
            ":srv.example NOTICE * :*** Looking up your hostname",
            "MODE #chan +o alice",
        ];
        for line in lines {
            let msg = Message::parse(line).unwrap();
            assert_eq!(msg.to_string(), line, "line {line:?}");
        }
    }

    #[test]
    fn trailing_with_spaces_survives_serialize_and_parse() {
        for trailing in [Some(" leading"), Some("a b c"), Some(""), None] {
            let mut msg = Message::new("PRIVMSG").with_params(["#chan"]);
            msg.trailing = trailing.map(str::to_string);
            let back = Message::parse(&msg.to_wire()).unwrap();
            assert_eq!(back.trailing, msg.trailing);
            assert_eq!(back, msg);
        }
    }
}
