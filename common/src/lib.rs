//! Shared building blocks for the node agent.
//!
//! This crate provides:
//! - The boss wire codec (requests, response lines, lifecycle states)
//! - systemd unit name escaping and mount unit rendering

pub mod protocol;
pub mod systemd;

pub use protocol::{
    DEFAULT_BOSS_PORT, NodeState, ParseError, Request, ResponseLine, content_digest,
};
