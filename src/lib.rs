// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate coordinates exclusive use of a single shared printer among a
 * fixed group of processes that share no memory and talk only by messages.
 * There is no lock server: each node decides for itself whether to let a
 * peer go ahead, using nothing but a Lamport clock and its own state.
 *
 * The algorithm is Ricart and Agrawala's permission-based mutual exclusion:
 *
 *   - A node that wants the printer stamps a request with its Lamport time
 *     and sends it to every peer, then waits for a grant from each of them.
 *
 *   - A node receiving a request grants it at once unless it is using the
 *     printer, or is itself waiting with an earlier request. Earlier means
 *     smaller `(timestamp, id)`, so ties on the timestamp go to the lower id
 *     and two requests never compare equal. Requests it doesn't grant are
 *     queued and granted, in order, when it releases.
 *
 * That is enough for safety (at most one node holds the printer) and, with
 * reliable delivery, liveness (every request is eventually granted). It costs
 * `2(N-1)` messages per use of the printer.
 *
 * The crate is split the usual way for such things:
 *
 *   - `Node` is the protocol as a plain, cloneable state machine with no I/O
 *     in it. It is what the property tests drive.
 *
 *   - `Coordinator` (the node's own requester side) and `Responder` (the side
 *     serving its peers) share one `Node` behind one lock and do the sending,
 *     always after letting go of that lock.
 *
 *   - `Transport` and `Printer` are the edges: line-delimited JSON over TCP
 *     in production, channels or fakes in tests.
 *
 * ## Reference
 *
 * Glenn Ricart, Ashok K. Agrawala. An Optimal Algorithm for Mutual Exclusion
 * in Computer Networks. Communications of the ACM 24(1), 1981.
 *
 * Leslie Lamport. Time, Clocks, and the Ordering of Events in a Distributed
 * System. Communications of the ACM 21(7), 1978.
 */

mod clock;
pub mod config;
pub mod coordinator;
mod error;
pub mod logging;
mod message;
mod node;
pub mod printer;
mod state;
pub mod transport;

pub use clock::LamportClock;
pub use coordinator::{Coordinator, Responder, Shared};
pub use error::{Error, Result};
pub use message::{Message, PeerId, Stamp, Timestamp};
pub use node::{Node, Stats};
pub use printer::{Printer, PrintRequest, PrintResponse};
pub use state::MutexState;
pub use transport::Transport;

#[cfg(test)]
mod tests;
