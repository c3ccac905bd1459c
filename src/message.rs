// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a node. Unique within a run and totally ordered; the order is
/// the tie-break between requests stamped with the same Lamport time.
pub type PeerId = u32;

/// A Lamport clock reading. Unsigned, so a negative timestamp on the wire is
/// rejected as malformed at decode time.
pub type Timestamp = u64;

/// The priority of a request. Ordered lexicographically by `(timestamp,
/// peer)`, so two distinct requests never compare equal and the smaller one
/// is the earlier, higher-priority request.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub timestamp: Timestamp,
    pub peer: PeerId,
}

impl Stamp {
    pub fn new(timestamp: Timestamp, peer: PeerId) -> Self {
        Stamp { timestamp, peer }
    }

    pub fn precedes(&self, other: &Stamp) -> bool {
        self < other
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer, self.timestamp)
    }
}

/// Messages exchanged between nodes. Both kinds are point-to-point; a
/// broadcast request is just one `Request` per peer.
///
/// A `Grant` answers one specific `Request`: its `timestamp` is the timestamp
/// of the request being granted, which is what lets a requester tell a grant
/// for its current request from a late grant for one it has since abandoned.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request {
        from: PeerId,
        to: PeerId,
        timestamp: Timestamp,
    },
    Grant {
        from: PeerId,
        to: PeerId,
        timestamp: Timestamp,
    },
}

impl Message {
    pub fn from(&self) -> PeerId {
        match self {
            Message::Request { from, .. } | Message::Grant { from, .. } => *from,
        }
    }

    pub fn to(&self) -> PeerId {
        match self {
            Message::Request { to, .. } | Message::Grant { to, .. } => *to,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Message::Request { timestamp, .. } | Message::Grant { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_grant(&self) -> bool {
        matches!(self, Message::Grant { .. })
    }

    /// Returns the message as a single-line JSON `String`.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::MalformedMessage(e.to_string()))
    }

    /// Parses a message from a JSON `String`; anything that doesn't decode
    /// (including negative timestamps) is `MalformedMessage`.
    pub fn from_json_string(line: &str) -> Result<Self> {
        serde_json::from_str::<Self>(line)
            .map_err(|e| Error::MalformedMessage(format!("{}: {:?}", e, line)))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request {
                from,
                to,
                timestamp,
            } => write!(f, "request {} -> {} (ts {})", from, to, timestamp),
            Message::Grant {
                from,
                to,
                timestamp,
            } => write!(f, "grant {} -> {} (ts {})", from, to, timestamp),
        }
    }
}
