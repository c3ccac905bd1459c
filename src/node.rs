// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, LamportClock, Message, MutexState, PeerId, Result, Stamp, Timestamp};
use im::{OrdSet, Vector};
use tracing::{debug, info, trace, warn};

// Like any protocol state machine this could be written as one long async fn
// that awaits grants inline. It isn't, because the interesting part (the
// grant-or-defer decision and the bookkeeping around it) has to be callable
// from two places at once: the node's own requester loop and the handler
// serving its peers. So the Node is plain data with explicit transitions;
// every call consumes at most one input, pushes messages onto an outgoing
// queue, and possibly changes `MutexState`. The caller owns the guard around
// it and does the actual sending after dropping that guard.
//
// Being plain data also means a Node can be cloned and stepped by hand, which
// is how the simulated network in the tests drives whole groups of them.

/// Counters for things worth reporting about a node's history.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct Stats {
    /// Completed Held -> Released cycles.
    pub cycles: u64,
    /// Peer requests queued instead of granted.
    pub deferrals: u64,
    /// Grants sent, immediate or flushed.
    pub grants_sent: u64,
    pub printer_failures: u64,
}

/// One participant in Ricart-Agrawala mutual exclusion.
///
/// To use the printer a node broadcasts a `Request` stamped with its Lamport
/// time and waits for a `Grant` from every peer. A peer grants at once unless
/// it is holding the printer, or is itself waiting with an earlier request
/// (by `(timestamp, id)`), in which case it queues the requester and grants on
/// release. Since two distinct requests always compare strictly, of any two
/// concurrent requesters exactly one defers the other, so at most one node is
/// ever admitted.
///
/// Delivery of messages between nodes is left to the caller and is assumed
/// reliable. A lost `Grant` leaves the requester Wanting until the caller
/// notices (see `missing_grants`, `rebroadcast` and `abandon`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: PeerId,
    pub(crate) peers: OrdSet<PeerId>,
    pub(crate) clock: LamportClock,
    pub(crate) state: MutexState,

    // Set exactly while Wanting or Held.
    pub(crate) request_timestamp: Option<Timestamp>,
    // Peers that granted the current request; its size is the grant count.
    pub(crate) granted: OrdSet<PeerId>,
    // Requests we owe a grant, in arrival order, at most one per peer.
    pub(crate) deferred: Vector<Stamp>,

    pub(crate) stats: Stats,
}

impl Node {
    /// A Released node with clock 0. Our own id is dropped from `peers` if
    /// present.
    pub fn new<I>(id: PeerId, peers: I) -> Self
    where
        I: IntoIterator<Item = PeerId>,
    {
        Node {
            id,
            peers: peers.into_iter().filter(|p| *p != id).collect(),
            clock: LamportClock::new(),
            state: MutexState::Released,
            request_timestamp: None,
            granted: OrdSet::new(),
            deferred: Vector::new(),
            stats: Stats::default(),
        }
    }

    pub fn state(&self) -> MutexState {
        self.state
    }

    pub fn clock(&self) -> Timestamp {
        self.clock.time()
    }

    pub fn request_timestamp(&self) -> Option<Timestamp> {
        self.request_timestamp
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().copied()
    }

    pub fn pending_grant_count(&self) -> usize {
        self.granted.len()
    }

    pub fn deferred_requesters(&self) -> Vec<PeerId> {
        self.deferred.iter().map(|s| s.peer).collect()
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Peers whose grant for the current request hasn't arrived.
    pub fn missing_grants(&self) -> Vec<PeerId> {
        if self.state != MutexState::Wanting {
            return Vec::new();
        }
        self.peers
            .iter()
            .filter(|p| !self.granted.contains(p))
            .copied()
            .collect()
    }

    /// True once every peer has granted the outstanding request.
    pub fn is_ready(&self) -> bool {
        self.state == MutexState::Wanting && self.granted.len() == self.peers.len()
    }

    fn own_stamp(&self) -> Option<Stamp> {
        self.request_timestamp.map(|ts| Stamp::new(ts, self.id))
    }

    fn expect_state(&self, want: MutexState, op: &'static str) -> Result<()> {
        if self.state != want {
            return Err(Error::InvalidTransition {
                node: self.id,
                state: self.state,
                op,
            });
        }
        Ok(())
    }

    fn request_to(&self, peer: PeerId, timestamp: Timestamp) -> Message {
        Message::Request {
            from: self.id,
            to: peer,
            timestamp,
        }
    }

    /// Released -> Wanting. Stamps a fresh request and pushes one `Request`
    /// per peer onto `outgoing`. Returns the request's timestamp.
    pub fn request_access(&mut self, outgoing: &mut Vec<Message>) -> Result<Timestamp> {
        self.expect_state(MutexState::Released, "request access")?;
        let ts = self.clock.tick();
        self.request_timestamp = Some(ts);
        self.granted.clear();
        self.state = MutexState::Wanting;
        info!(
            "node {} [{}] clock {} requesting with timestamp {}",
            self.id,
            self.state,
            self.clock.time(),
            ts
        );
        for peer in self.peers.iter() {
            outgoing.push(self.request_to(*peer, ts));
        }
        Ok(ts)
    }

    /// Re-sends the outstanding request to every peer that hasn't granted it.
    /// The request keeps its original timestamp, so its priority is unchanged.
    pub fn rebroadcast(&mut self, outgoing: &mut Vec<Message>) -> Result<usize> {
        self.expect_state(MutexState::Wanting, "rebroadcast")?;
        let ts = match self.request_timestamp {
            Some(ts) => ts,
            None => return Err(self.missing_timestamp("rebroadcast")),
        };
        self.clock.tick();
        let missing = self.missing_grants();
        debug!(
            "node {} re-sending request ts {} to {:?}",
            self.id, ts, missing
        );
        for peer in missing.iter() {
            outgoing.push(self.request_to(*peer, ts));
        }
        Ok(missing.len())
    }

    /// Wanting -> Held, once every peer has granted. Returns the clock
    /// reading to stamp the printer job with.
    pub fn enter(&mut self) -> Result<Timestamp> {
        self.expect_state(MutexState::Wanting, "enter")?;
        if !self.is_ready() {
            return Err(Error::InvalidTransition {
                node: self.id,
                state: self.state,
                op: "enter without every grant",
            });
        }
        let now = self.clock.tick();
        self.state = MutexState::Held;
        info!(
            "node {} [{}] clock {} entering critical section",
            self.id, self.state, now
        );
        Ok(now)
    }

    /// Held -> Released. Clears the request and pushes one `Grant` for every
    /// deferred requester, in the order they were deferred. Returns how many
    /// grants were flushed.
    pub fn release(&mut self, outgoing: &mut Vec<Message>) -> Result<usize> {
        self.expect_state(MutexState::Held, "release")?;
        self.clock.tick();
        self.request_timestamp = None;
        self.granted.clear();
        self.state = MutexState::Released;
        self.stats.cycles += 1;
        info!(
            "node {} [{}] clock {} leaving critical section",
            self.id,
            self.state,
            self.clock.time()
        );
        Ok(self.flush_deferred(outgoing))
    }

    /// Wanting -> Released without ever entering. Used to give up on a
    /// stalled request: since we no longer compete, everyone we deferred is
    /// granted now. Grants that still arrive for the abandoned request are
    /// recognised by their timestamp and ignored.
    pub fn abandon(&mut self, outgoing: &mut Vec<Message>) -> Result<usize> {
        self.expect_state(MutexState::Wanting, "abandon")?;
        self.clock.tick();
        warn!(
            "node {} abandoning request ts {:?} with {} of {} grants",
            self.id,
            self.request_timestamp,
            self.granted.len(),
            self.peers.len()
        );
        self.request_timestamp = None;
        self.granted.clear();
        self.state = MutexState::Released;
        Ok(self.flush_deferred(outgoing))
    }

    pub fn record_printer_failure(&mut self) {
        self.stats.printer_failures += 1;
    }

    fn flush_deferred(&mut self, outgoing: &mut Vec<Message>) -> usize {
        let deferred = std::mem::take(&mut self.deferred);
        let n = deferred.len();
        for stamp in deferred {
            debug!("node {} sending deferred grant to {}", self.id, stamp);
            outgoing.push(Message::Grant {
                from: self.id,
                to: stamp.peer,
                timestamp: stamp.timestamp,
            });
            self.stats.grants_sent += 1;
        }
        n
    }

    fn missing_timestamp(&self, op: &'static str) -> Error {
        Error::InvalidTransition {
            node: self.id,
            state: self.state,
            op,
        }
    }

    // Reject anything not addressed to us or not from a known peer, before
    // it gets a chance to move the clock.
    fn validate(&self, m: &Message) -> Result<()> {
        if m.to() != self.id {
            return Err(Error::MalformedMessage(format!(
                "node {} got {} addressed elsewhere",
                self.id, m
            )));
        }
        if !self.peers.contains(&m.from()) {
            return Err(Error::MalformedMessage(format!(
                "node {} got {} from unknown peer",
                self.id, m
            )));
        }
        Ok(())
    }

    /// Consumes one inbound message, pushing any immediate reply onto
    /// `outgoing`. Invalid messages are rejected without changing anything.
    pub fn receive(&mut self, m: &Message, outgoing: &mut Vec<Message>) -> Result<()> {
        self.validate(m)?;
        match *m {
            Message::Request {
                from, timestamp, ..
            } => self.on_request(Stamp::new(timestamp, from), outgoing),
            Message::Grant {
                from, timestamp, ..
            } => self.on_grant(from, timestamp),
        }
        Ok(())
    }

    /// True if `theirs` must wait for us: we hold the printer, or we want it
    /// and our request is earlier.
    pub fn should_defer(&self, theirs: &Stamp) -> bool {
        match self.state {
            MutexState::Held => true,
            MutexState::Wanting => match self.own_stamp() {
                Some(ours) => ours.precedes(theirs),
                None => false,
            },
            MutexState::Released => false,
        }
    }

    fn on_request(&mut self, theirs: Stamp, outgoing: &mut Vec<Message>) {
        // Clock first, unconditionally.
        self.clock.observe(theirs.timestamp);
        trace!(
            "node {} got request {} | clock {}",
            self.id,
            theirs,
            self.clock.time()
        );
        if self.should_defer(&theirs) {
            self.defer(theirs);
        } else {
            debug!("node {} granting {} immediately", self.id, theirs);
            outgoing.push(Message::Grant {
                from: self.id,
                to: theirs.peer,
                timestamp: theirs.timestamp,
            });
            self.stats.grants_sent += 1;
        }
    }

    fn defer(&mut self, theirs: Stamp) {
        if let Some(i) = self.deferred.iter().position(|s| s.peer == theirs.peer) {
            // A re-sent request keeps its place in line; a newer one from the
            // same peer replaces what it superseded.
            if self.deferred[i].timestamp < theirs.timestamp {
                self.deferred.set(i, theirs);
            }
            trace!("node {} already deferring {}", self.id, theirs.peer);
            return;
        }
        info!(
            "node {} [{}] deferring reply to {}",
            self.id, self.state, theirs
        );
        self.deferred.push_back(theirs);
        self.stats.deferrals += 1;
    }

    fn on_grant(&mut self, from: PeerId, timestamp: Timestamp) {
        if self.state != MutexState::Wanting || self.request_timestamp != Some(timestamp) {
            debug!(
                "node {} ignoring stale grant from {} for ts {}",
                self.id, from, timestamp
            );
            return;
        }
        if self.granted.insert(from).is_some() {
            trace!("node {} duplicate grant from {}", self.id, from);
            return;
        }
        trace!(
            "node {} has {} of {} grants",
            self.id,
            self.granted.len(),
            self.peers.len()
        );
    }
}
