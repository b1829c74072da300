//! Typed events surfaced by the persistent push channel.
//!
//! Every payload shape is checked at compile time; consumers match
//! exhaustively instead of inspecting stringly-typed payloads.

use crate::types::SystemStats;
use serde::Deserialize;

/// Backend processing state pushed over the `status` wire event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    /// The backend has accepted a command and is working on it.
    Processing,
    /// Any state the client does not act on.
    #[serde(other)]
    Other,
}

/// Events delivered to the channel's single consumer, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The connection is up (initial connect or reconnect).
    Opened,
    /// The connection dropped or was torn down.
    Closed,
    /// A connect or reconnect attempt failed.
    OpenFailed(String),
    /// A fresh telemetry reading; replaces the previous one wholesale.
    Telemetry(SystemStats),
    /// A reply to a command sent over the channel. `text` is `None` when
    /// the backend answered without reply text; the turn's generating
    /// state still ends, with nothing to append.
    TurnCompleted {
        text: Option<String>,
        intent: Option<String>,
        origin: Option<String>,
    },
    /// Processing-state change for an in-flight command.
    TurnState(TurnState),
}
