//! Device lifecycle control
//!
//! Owns the authoritative video state of the single attached capture device
//! and arbitrates every transition between idle, previewing and recording.
//! State-mutating calls are serialized through one request gate; background
//! workers drive the actual preview process and camera session.

/// Log a loud, non-fatal error banner.
///
/// The server never crashes on these; they mark conditions an operator should
/// look at (dead workers, hung transitions, camera failures).
macro_rules! critical {
    ($($arg:tt)*) => {{
        let banner = format!("!! {} !!", format_args!($($arg)*));
        let frame = "!".repeat(banner.len());
        tracing::error!("{}", frame);
        tracing::error!("{}", banner);
        tracing::error!("{}", frame);
    }};
}

pub(crate) use critical;

mod controller;
mod worker;

pub use controller::{Controller, StatusSnapshot};
pub(crate) use worker::{await_state, SharedState};

use serde::Serialize;
use std::fmt;

/// What the device is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoState {
    #[default]
    Idle,
    Previewing,
    Recording,
}

impl fmt::Display for VideoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VideoState::Idle => "idle",
            VideoState::Previewing => "previewing",
            VideoState::Recording => "recording",
        };
        f.write_str(name)
    }
}

/// The two kinds of background activity, each with its own worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activity {
    Preview,
    Recording,
}

impl Activity {
    /// The video state this activity holds while its worker is active
    pub fn active_state(self) -> VideoState {
        match self {
            Activity::Preview => VideoState::Previewing,
            Activity::Recording => VideoState::Recording,
        }
    }
}

/// Errors surfaced to control-plane callers
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The requested activity is incompatible with the current state
    #[error("{0}")]
    Conflict(&'static str),

    /// Pre-flight free space check failed
    #[error("not enough of free space ({free_bytes} bytes available)")]
    InsufficientStorage { free_bytes: u64 },

    /// A background transition did not complete in time; state was force-cleaned
    #[error("couldn't {0}")]
    OperationTimeout(&'static str),

    /// Unknown bitrate name
    #[error("could not find a bitrate with short name {0}")]
    UnknownSetting(String),

    /// Required query parameter missing
    #[error("missing query parameter `{0}`")]
    MissingParameter(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
