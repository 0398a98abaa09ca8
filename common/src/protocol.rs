//! Wire codec for the boss control protocol.
//!
//! - Requests are a single line: `VERSION=<n> <command> [args...] `. The agent then
//!   reads until the boss closes the connection.
//! - Responses are zero or more lines of `DIRECTIVE KEY=value KEY="quoted value"`,
//!   where the leading directive is optional (e.g. mount lines have none).

use core::{fmt, str::FromStr};
use std::{collections::HashMap, sync::LazyLock};

use regex::Regex;
use sha2::{Digest as _, Sha256};
use thiserror::Error as ThisError;

/// Default TCP port of the boss control daemon.
pub const DEFAULT_BOSS_PORT: u16 = 7777;

/// Protocol revision announced with every request.
pub const PROTOCOL_VERSION: u32 = 44;

// Macro to define the enum from variant => string mappings
macro_rules! define_enum_with_str {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident => $str:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant,
            )*
        }

        impl $name {
            /// The wire representation.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match *self {
                    $($name::$variant => $str,)*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ();

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($str => Ok($name::$variant),)*
                    _ => Err(()),
                }
            }
        }
    };
}

define_enum_with_str! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Lifecycle states reported to the boss.
    pub enum NodeState {
        /// The node has booted and is about to be configured.
        Booted => "MFSSETUP",
        /// The initial configuration has been applied.
        Ready => "ISUP",
        /// The node is going down.
        Shutdown => "SHUTDOWN",
    }
}

/// A request to the boss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    line: String,
}

impl Request {
    /// Start a request for `command`.
    #[must_use]
    pub fn new(command: &str) -> Self {
        Self {
            line: format!("VERSION={PROTOCOL_VERSION} {command}"),
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: &str) -> Self {
        self.line.push(' ');
        self.line.push_str(arg);
        self
    }

    /// The command word, for logging.
    #[must_use]
    pub fn command(&self) -> &str {
        self.line.split(' ').nth(1).unwrap_or_default()
    }

    /// Bytes as sent on the wire. The boss expects a trailing separator.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.line.clone().into_bytes();
        bytes.push(b' ');
        bytes
    }
}

/// Reasons a response line cannot be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ParseError {
    #[error("unparsable response at byte {position}: {line}")]
    BadLine { line: String, position: usize },
    #[error("key {key} missing from response: {line}")]
    MissingKey { key: String, line: String },
    #[error("invalid value {value:?} for key {key}")]
    BadValue { key: String, value: String },
}

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^([A-Z][A-Z0-9_]*)(?:=(?:"([^"]*)"|'([^']*)'|([^\s"']*)))?"#)
        .expect("token pattern is a valid regex")
});

/// A single parsed response line.
#[derive(Debug, Clone)]
pub struct ResponseLine<'line> {
    line: &'line str,
    directive: Option<&'line str>,
    fields: HashMap<&'line str, &'line str>,
}

impl<'line> ResponseLine<'line> {
    /// Parse one line. Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::BadLine`] if a token is malformed or a bare word
    /// appears anywhere but first.
    pub fn parse(line: &'line str) -> Result<Self, ParseError> {
        let line = line.trim();
        let mut directive = None;
        let mut fields = HashMap::new();
        let mut rest = line;
        let mut first = true;

        while !rest.is_empty() {
            let position = line.len() - rest.len();
            let bad_line = || ParseError::BadLine {
                line: line.to_string(),
                position,
            };
            let captures = TOKEN.captures(rest).ok_or_else(bad_line)?;
            let (Some(whole), Some(key)) = (captures.get(0), captures.get(1)) else {
                return Err(bad_line());
            };
            let value = captures
                .get(2)
                .or_else(|| captures.get(3))
                .or_else(|| captures.get(4));

            match value {
                Some(value) => {
                    fields.insert(key.as_str(), value.as_str());
                }
                None if first => directive = Some(key.as_str()),
                None => return Err(bad_line()),
            }
            first = false;

            let remaining = rest.get(whole.end()..).unwrap_or_default();
            if !remaining.is_empty() && !remaining.starts_with(char::is_whitespace) {
                return Err(bad_line());
            }
            rest = remaining.trim_start();
        }

        Ok(Self {
            line,
            directive,
            fields,
        })
    }

    /// The leading bare word, if any (`ADDUSER`, `FREE`, ...).
    #[must_use]
    pub const fn directive(&self) -> Option<&'line str> {
        self.directive
    }

    /// The raw line.
    #[must_use]
    pub const fn line(&self) -> &'line str {
        self.line
    }

    /// Optional field lookup.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&'line str> {
        self.fields.get(key).copied()
    }

    /// Required field lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::MissingKey`] if the key is absent.
    pub fn get(&self, key: &str) -> Result<&'line str, ParseError> {
        self.field(key).ok_or_else(|| ParseError::MissingKey {
            key: key.to_string(),
            line: self.line.to_string(),
        })
    }

    /// Required field lookup converted with [`FromStr`].
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::MissingKey`] or [`ParseError::BadValue`].
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<T, ParseError> {
        let value = self.get(key)?;
        value.parse().map_err(|_| ParseError::BadValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// Stable content identifier of a set of response lines (hex SHA-256).
///
/// Lines are hashed in order with a newline terminator so that
/// `["a", "b"]` and `["ab"]` differ.
#[must_use]
pub fn content_digest<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
