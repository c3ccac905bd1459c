// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{MutexState, PeerId, Timestamp};
use itertools::Itertools;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in a node. Apart from `Config` and `Io` at
/// startup, none of these is fatal: the node logs them and carries on.
#[derive(Debug, Error)]
pub enum Error {
    /// Sending to a peer failed at the transport level. Never counts as a
    /// grant.
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: PeerId, reason: String },

    /// The printer call failed or reported failure. The mutex is still
    /// released.
    #[error("printer server failure: {0}")]
    ResourceServerFailure(String),

    /// Grant collection exceeded the configured bound. The node is still
    /// Wanting.
    #[error(
        "request with timestamp {timestamp} stalled after {waited:?}, missing grants from [{}]",
        .missing.iter().join(", ")
    )]
    StalledRequest {
        timestamp: Timestamp,
        waited: Duration,
        missing: Vec<PeerId>,
    },

    /// A received message failed validation. Rejected before it can touch
    /// the clock or the state.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("node {node} cannot {op} while {state}")]
    InvalidTransition {
        node: PeerId,
        state: MutexState,
        op: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),
}
