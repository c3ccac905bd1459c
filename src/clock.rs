// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::Timestamp;

/// A Lamport scalar clock. Every node owns exactly one; it only ever moves
/// forwards.
///
/// `tick` is called before stamping anything the node sends. `observe` is
/// called on receipt of any timestamped message, before that message is
/// otherwise looked at, so that the priority decision downstream sees a clock
/// that already accounts for the sender's history.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct LamportClock {
    time: Timestamp,
}

impl LamportClock {
    pub fn new() -> Self {
        LamportClock { time: 0 }
    }

    pub fn time(&self) -> Timestamp {
        self.time
    }

    /// Local (send) event.
    pub fn tick(&mut self) -> Timestamp {
        self.time = self.time.saturating_add(1);
        self.time
    }

    /// Receive event: `max(local, received) + 1`.
    pub fn observe(&mut self, received: Timestamp) -> Timestamp {
        self.time = self.time.max(received).saturating_add(1);
        self.time
    }
}
