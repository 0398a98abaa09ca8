//! Error taxonomy of the agent.
//!
//! Only configuration errors abort the process, and only at startup. Everything
//! else is contained by the component that produced it and degrades to a log
//! entry (and, for reconciliation, an `AppletError` on the bus).

use std::{io, path::PathBuf};

use nodeagent_common::ParseError;
use thiserror::Error as ThisError;

use crate::model::{Gid, Uid};

/// The local configuration file could not be used.
#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("Failed to read config file at: {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config as TOML at: {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// No boss candidate could be resolved and reached. Retried with backoff.
#[derive(Debug, ThisError)]
pub enum DiscoveryError {
    #[error("boss candidate {host}:{port} did not resolve")]
    Unresolvable { host: String, port: u16 },
    #[error("boss candidate {host}:{port} resolved but is unreachable")]
    Unreachable {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("none of {tried} boss candidates is reachable")]
    Exhausted { tried: usize },
}

/// A request could not be carried to the boss and back.
#[derive(Debug, ThisError)]
pub enum TransportError {
    #[error("connecting to {addr} failed")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` request to {addr} timed out")]
    Timeout { addr: String, command: String },
    #[error("I/O error during `{command}` request")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("boss endpoint is not known yet")]
    NoEndpoint,
}

/// The boss answered, but the answer makes no sense. The poll cycle is skipped.
#[derive(Debug, ThisError)]
pub enum ProtocolError {
    #[error("`{command}` response is not valid UTF-8")]
    InvalidUtf8 { command: String },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("unknown directive {directive} in response: {line}")]
    UnknownDirective { directive: String, line: String },
    #[error("missing directive in response: {line}")]
    MissingDirective { line: String },
    #[error("duplicate user {login} in response")]
    DuplicateUser { login: String },
    #[error("duplicate group {name} in response")]
    DuplicateGroup { name: String },
    #[error("public key for unknown user {login}")]
    UnknownUser { login: String },
    #[error("duplicate mount of {export} in response")]
    DuplicateMount { export: String },
    #[error("{first} and {second} are both mounted at {mountpoint}")]
    SharedMountpoint {
        mountpoint: String,
        first: String,
        second: String,
    },
    #[error("`{command}` response exceeds {limit} bytes")]
    TooLarge { command: String, limit: u64 },
    #[error("malformed remote {remote:?}, expected host:/path")]
    BadRemote { remote: String },
}

/// Either half of a failed fetch.
#[derive(Debug, ThisError)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A best-effort lifecycle notification failed. Never fatal.
#[derive(Debug, ThisError)]
#[error("failed to report {state} to the boss")]
pub struct NotificationError {
    pub state: nodeagent_common::NodeState,
    #[source]
    pub source: TransportError,
}

/// An OS primitive failed.
#[derive(Debug, ThisError)]
pub enum SystemError {
    #[error("`{command}` exited with {status}")]
    CommandFailed { command: String, status: String },
    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Os(#[from] nix::errno::Errno),
    #[error("{what} contains an interior NUL byte")]
    InvalidName { what: String },
    #[error("{} is not a directory, refusing to write through it", path.display())]
    NotADirectory { path: PathBuf },
    #[error("blocking file operation did not complete")]
    Blocking(#[from] tokio::task::JoinError),
}

/// A single entry of one applet's reconciliation failed.
#[derive(Debug, ThisError)]
pub enum ReconciliationError {
    #[error("{action} for {target} failed")]
    Action {
        action: &'static str,
        target: String,
        #[source]
        source: SystemError,
    },
    #[error("refusing to change UID of {login} from {current} to {requested}")]
    UidChange {
        login: String,
        current: Uid,
        requested: Uid,
    },
    #[error("UID {uid} requested for {login} already belongs to {existing}")]
    DuplicateUid {
        login: String,
        uid: Uid,
        existing: String,
    },
    #[error("group {name} exists with GID {current}, refusing to change it to {requested}")]
    GidChange {
        name: String,
        current: Gid,
        requested: Gid,
    },
    #[error("{action} of {} failed", path.display())]
    File {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} was not generated by the agent, leaving it alone", path.display())]
    Unmanaged { path: PathBuf },
    #[error("{} of {total} entries failed: {}", failures.len(), join_messages(failures))]
    Partial {
        total: usize,
        failures: Vec<ReconciliationError>,
    },
}

fn join_messages(failures: &[ReconciliationError]) -> String {
    failures
        .iter()
        .map(|failure| render_chain(failure))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Render an error with its source chain on one line.
pub(crate) fn render_chain(error: &(dyn core::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

impl ReconciliationError {
    /// Collapse per-entry failures into one error, or `Ok` if there were none.
    pub(crate) fn collect(total: usize, mut failures: Vec<Self>) -> Result<(), Self> {
        match failures.len() {
            0 => Ok(()),
            1 if total == 1 => Err(failures.remove(0)),
            _ => Err(Self::Partial { total, failures }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_lists_every_entry() {
        let err = ReconciliationError::collect(
            3,
            vec![
                ReconciliationError::DuplicateUid {
                    login: "bob".into(),
                    uid: 1001,
                    existing: "carol".into(),
                },
                ReconciliationError::Action {
                    action: "create user",
                    target: "dave".into(),
                    source: SystemError::CommandFailed {
                        command: "useradd".into(),
                        status: "exit status: 9".into(),
                    },
                },
            ],
        )
        .unwrap_err();
        let message = render_chain(&err);
        assert!(message.starts_with("2 of 3 entries failed"), "{message}");
        assert!(message.contains("already belongs to carol"), "{message}");
        assert!(message.contains("`useradd` exited with exit status: 9"), "{message}");
    }

    #[test]
    fn no_failures_is_ok() {
        assert!(ReconciliationError::collect(4, Vec::new()).is_ok(), "nothing failed");
    }
}
