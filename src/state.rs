// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use std::fmt;

/// Where a node is in its mutual-exclusion cycle. Nodes go round
/// Released -> Wanting -> Held -> Released for as long as they run.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum MutexState {
    #[default]
    Released, // Not using the printer and not asking to.
    Wanting,  // Request broadcast; collecting grants.
    Held,     // Every peer granted; using the printer.
}

impl fmt::Display for MutexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutexState::Released => "RELEASED",
            MutexState::Wanting => "WANTING",
            MutexState::Held => "HELD",
        };
        f.write_str(s)
    }
}
