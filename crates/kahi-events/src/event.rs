//! Event model: the closed tag set and the event record.
//!
//! Every notification in the supervisor is an [`Event`]: a tag from the
//! closed [`EventType`] set, a timestamp (filled at publish time when
//! absent), and an optional map of short string key/value pairs.  The
//! data map is a `BTreeMap` so iteration order is deterministic wherever
//! an event is rendered to a wire format.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The closed set of event tags, partitioned into five families:
/// process state, process log, supervisor state, process group, and tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    ProcessStateStopped,
    ProcessStateStarting,
    ProcessStateRunning,
    ProcessStateBackoff,
    ProcessStateStopping,
    ProcessStateExited,
    ProcessStateFatal,
    ProcessLogStdout,
    ProcessLogStderr,
    SupervisorStateRunning,
    SupervisorStateStopping,
    ProcessGroupAdded,
    ProcessGroupRemoved,
    Tick5,
    Tick60,
    Tick3600,
}

impl EventType {
    pub const PROCESS_STATE: [Self; 7] = [
        Self::ProcessStateStopped,
        Self::ProcessStateStarting,
        Self::ProcessStateRunning,
        Self::ProcessStateBackoff,
        Self::ProcessStateStopping,
        Self::ProcessStateExited,
        Self::ProcessStateFatal,
    ];
    pub const PROCESS_LOG: [Self; 2] = [Self::ProcessLogStdout, Self::ProcessLogStderr];
    pub const SUPERVISOR_STATE: [Self; 2] =
        [Self::SupervisorStateRunning, Self::SupervisorStateStopping];
    pub const PROCESS_GROUP: [Self; 2] = [Self::ProcessGroupAdded, Self::ProcessGroupRemoved];
    pub const TICK: [Self; 3] = [Self::Tick5, Self::Tick60, Self::Tick3600];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProcessStateStopped => "PROCESS_STATE_STOPPED",
            Self::ProcessStateStarting => "PROCESS_STATE_STARTING",
            Self::ProcessStateRunning => "PROCESS_STATE_RUNNING",
            Self::ProcessStateBackoff => "PROCESS_STATE_BACKOFF",
            Self::ProcessStateStopping => "PROCESS_STATE_STOPPING",
            Self::ProcessStateExited => "PROCESS_STATE_EXITED",
            Self::ProcessStateFatal => "PROCESS_STATE_FATAL",
            Self::ProcessLogStdout => "PROCESS_LOG_STDOUT",
            Self::ProcessLogStderr => "PROCESS_LOG_STDERR",
            Self::SupervisorStateRunning => "SUPERVISOR_STATE_RUNNING",
            Self::SupervisorStateStopping => "SUPERVISOR_STATE_STOPPING",
            Self::ProcessGroupAdded => "PROCESS_GROUP_ADDED",
            Self::ProcessGroupRemoved => "PROCESS_GROUP_REMOVED",
            Self::Tick5 => "TICK_5",
            Self::Tick60 => "TICK_60",
            Self::Tick3600 => "TICK_3600",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = match s {
            "PROCESS_STATE_STOPPED" => Self::ProcessStateStopped,
            "PROCESS_STATE_STARTING" => Self::ProcessStateStarting,
            "PROCESS_STATE_RUNNING" => Self::ProcessStateRunning,
            "PROCESS_STATE_BACKOFF" => Self::ProcessStateBackoff,
            "PROCESS_STATE_STOPPING" => Self::ProcessStateStopping,
            "PROCESS_STATE_EXITED" => Self::ProcessStateExited,
            "PROCESS_STATE_FATAL" => Self::ProcessStateFatal,
            "PROCESS_LOG_STDOUT" => Self::ProcessLogStdout,
            "PROCESS_LOG_STDERR" => Self::ProcessLogStderr,
            "SUPERVISOR_STATE_RUNNING" => Self::SupervisorStateRunning,
            "SUPERVISOR_STATE_STOPPING" => Self::SupervisorStateStopping,
            "PROCESS_GROUP_ADDED" => Self::ProcessGroupAdded,
            "PROCESS_GROUP_REMOVED" => Self::ProcessGroupRemoved,
            "TICK_5" => Self::Tick5,
            "TICK_60" => Self::Tick60,
            "TICK_3600" => Self::Tick3600,
            other => return Err(UnknownEventType(other.to_owned())),
        };
        Ok(tag)
    }
}

/// A single typed notification.
///
/// `timestamp` is `None` until publish; [`EventBus::publish`] fills it
/// with the current instant and preserves an already-set value verbatim.
///
/// [`EventBus::publish`]: crate::bus::EventBus::publish
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: Option<DateTime<Utc>>,
    pub data: BTreeMap<String, String>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: None,
            data: BTreeMap::new(),
        }
    }

    /// Pin the timestamp so publish preserves it instead of stamping now.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}
