// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{LamportClock, Message, MutexState, Node, PeerId, Stamp};
use proptest::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

struct PeerRecord {
    node: Node,
    // How many more times this node wants the printer.
    wants: usize,
    // How many more times it may re-send or give up on a request.
    detours: usize,
}

// Every enabled step of the whole system. Which one happens next is up to
// the scheduler, so a sequence of choices is one interleaving.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Deliver(PeerId, PeerId),
    Request(PeerId),
    Enter(PeerId),
    Release(PeerId),
    Rebroadcast(PeerId),
    Abandon(PeerId),
}

#[derive(Default)]
struct Network {
    peers: BTreeMap<PeerId, PeerRecord>,
    // One FIFO channel per ordered pair of nodes.
    channels: BTreeMap<(PeerId, PeerId), VecDeque<Message>>,
    max_held: usize,
    entries: Vec<PeerId>,
}

impl Network {
    fn new(n: PeerId, wants: usize) -> Self {
        let mut net = Network::default();
        let ids: Vec<PeerId> = (1..=n).collect();
        for id in ids.iter() {
            debug!("created peer {}", id);
            net.peers.insert(
                *id,
                PeerRecord {
                    node: Node::new(*id, ids.clone()),
                    wants,
                    detours: 0,
                },
            );
        }
        net
    }

    fn with_detours(mut self, detours: usize) -> Self {
        for p in self.peers.values_mut() {
            p.detours = detours;
        }
        self
    }

    fn node(&self, id: PeerId) -> &Node {
        &self.peers[&id].node
    }

    fn post(&mut self, outgoing: Vec<Message>) {
        for msg in outgoing {
            debug!("point-to-point send {}", msg);
            self.channels
                .entry((msg.from(), msg.to()))
                .or_default()
                .push_back(msg);
        }
    }

    fn held(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.node.state() == MutexState::Held)
            .count()
    }

    fn in_flight(&self) -> usize {
        self.channels.values().map(|c| c.len()).sum()
    }

    fn enabled(&self) -> Vec<Step> {
        let mut steps = Vec::new();
        for ((from, to), chan) in self.channels.iter() {
            if !chan.is_empty() {
                steps.push(Step::Deliver(*from, *to));
            }
        }
        for (id, p) in self.peers.iter() {
            match p.node.state() {
                MutexState::Released if p.wants > 0 => steps.push(Step::Request(*id)),
                MutexState::Wanting if p.node.is_ready() => steps.push(Step::Enter(*id)),
                MutexState::Wanting if p.detours > 0 => {
                    steps.push(Step::Rebroadcast(*id));
                    steps.push(Step::Abandon(*id));
                }
                MutexState::Held => steps.push(Step::Release(*id)),
                _ => (),
            }
        }
        steps
    }

    fn step(&mut self, step: Step) {
        let mut outgoing = Vec::new();
        match step {
            Step::Deliver(from, to) => {
                let msg = self
                    .channels
                    .get_mut(&(from, to))
                    .and_then(|c| c.pop_front())
                    .unwrap();
                let p = self.peers.get_mut(&to).unwrap();
                p.node.receive(&msg, &mut outgoing).unwrap();
            }
            Step::Request(id) => {
                let p = self.peers.get_mut(&id).unwrap();
                p.wants -= 1;
                p.node.request_access(&mut outgoing).unwrap();
            }
            Step::Enter(id) => {
                self.peers.get_mut(&id).unwrap().node.enter().unwrap();
                self.entries.push(id);
            }
            Step::Release(id) | Step::Abandon(id) => {
                let p = self.peers.get_mut(&id).unwrap();
                let owed = p.node.deferred_requesters();
                let flushed = if step == Step::Release(id) {
                    p.node.release(&mut outgoing).unwrap()
                } else {
                    p.detours = p.detours.saturating_sub(1);
                    p.wants += 1;
                    p.node.abandon(&mut outgoing).unwrap()
                };
                assert_eq!(flushed, owed.len());
                // Exactly one grant per deferred peer, in deferral order.
                let granted: Vec<PeerId> = outgoing.iter().map(|m| m.to()).collect();
                assert_eq!(granted, owed);
                assert!(outgoing.iter().all(|m| m.is_grant()));
                assert!(p.node.deferred_requesters().is_empty());
            }
            Step::Rebroadcast(id) => {
                let p = self.peers.get_mut(&id).unwrap();
                p.detours = p.detours.saturating_sub(1);
                let missing = p.node.missing_grants();
                let ts = p.node.request_timestamp();
                assert_eq!(p.node.rebroadcast(&mut outgoing).unwrap(), missing.len());
                assert!(outgoing
                    .iter()
                    .all(|m| !m.is_grant() && Some(m.timestamp()) == ts));
            }
        }
        self.post(outgoing);
        self.max_held = self.max_held.max(self.held());
    }

    // Run to quiescence. `choices` picks among enabled steps while it lasts;
    // after that the first enabled step is always taken.
    fn run(&mut self, choices: &[usize]) -> usize {
        let mut steps = 0;
        let mut choices = choices.iter();
        loop {
            let enabled = self.enabled();
            if enabled.is_empty() {
                return steps;
            }
            let pick = choices.next().map(|c| c % enabled.len()).unwrap_or(0);
            self.step(enabled[pick]);
            assert!(self.held() <= 1, "two nodes held the printer at once");
            steps += 1;
            assert!(steps < 100_000, "no quiescence");
        }
    }

    fn assert_all_served(&self, wants: usize) {
        assert_eq!(self.in_flight(), 0);
        for p in self.peers.values() {
            assert_eq!(p.node.state(), MutexState::Released);
            assert_eq!(p.node.stats().cycles, wants as u64);
            assert_eq!(p.node.request_timestamp(), None);
            assert!(p.node.deferred_requesters().is_empty());
        }
        assert_eq!(self.entries.len(), self.peers.len() * wants);
    }
}

#[test]
fn run_sim() {
    crate::logging::init_for_tests();
    let mut n = Network::new(3, 1);
    n.run(&[]);
    n.assert_all_served(1);
    assert_eq!(n.max_held, 1);
}

#[test]
fn single_pair_without_contention() {
    let mut n = Network::new(2, 0);
    n.peers.get_mut(&1).unwrap().wants = 1;
    n.run(&[]);
    n.peers.get_mut(&2).unwrap().wants = 1;
    n.run(&[]);
    n.assert_all_served(1);
    assert_eq!(n.entries, vec![1, 2]);
    assert_eq!(n.node(1).stats().deferrals, 0);
    assert_eq!(n.node(2).stats().deferrals, 0);
}

#[test]
fn symmetric_contention_favours_lower_id() {
    let mut n = Network::new(2, 1);
    // Both stamp their request before seeing the other's: a tie at 1.
    n.step(Step::Request(2));
    n.step(Step::Request(1));
    assert_eq!(n.node(1).request_timestamp(), Some(1));
    assert_eq!(n.node(2).request_timestamp(), Some(1));

    n.step(Step::Deliver(2, 1));
    assert_eq!(n.node(1).deferred_requesters(), vec![2]);
    n.step(Step::Deliver(1, 2));
    assert_eq!(n.node(2).deferred_requesters(), Vec::<PeerId>::new());

    n.step(Step::Deliver(2, 1));
    assert!(n.node(1).is_ready());
    assert!(!n.node(2).is_ready());
    assert_eq!(n.enabled(), vec![Step::Enter(1)]);

    n.run(&[]);
    n.assert_all_served(1);
    assert_eq!(n.entries, vec![1, 2]);
}

#[test]
fn lone_node_needs_no_messages() {
    let mut n = Network::new(1, 3);
    n.run(&[]);
    n.assert_all_served(3);
    assert_eq!(n.node(1).stats().grants_sent, 0);
}

#[test]
fn late_requester_waits_for_holder() {
    let mut n = Network::new(3, 0);
    n.peers.get_mut(&3).unwrap().wants = 1;
    // Let 3 get all the way in.
    while n.node(3).state() != MutexState::Held {
        let first = n.enabled()[0];
        n.step(first);
    }
    n.peers.get_mut(&1).unwrap().wants = 1;
    n.step(Step::Request(1));
    n.step(Step::Deliver(1, 3));
    assert_eq!(n.node(3).deferred_requesters(), vec![1]);
    n.run(&[]);
    n.assert_all_served(1);
    assert_eq!(n.entries, vec![3, 1]);
}

#[test]
fn grant_for_abandoned_request_is_ignored() {
    let mut n = Network::new(2, 0);
    n.peers.get_mut(&1).unwrap().wants = 1;
    n.step(Step::Request(1));
    n.step(Step::Deliver(1, 2));
    n.step(Step::Abandon(1));
    n.step(Step::Request(1));
    assert_eq!(n.node(1).request_timestamp(), Some(3));

    // 2's grant answers the timestamp-1 request.
    n.step(Step::Deliver(2, 1));
    assert_eq!(n.node(1).pending_grant_count(), 0);
    assert!(!n.node(1).is_ready());

    n.run(&[]);
    assert_eq!(n.in_flight(), 0);
    assert_eq!(n.entries, vec![1]);
    assert_eq!(n.node(1).stats().cycles, 1);
}

#[test]
fn rebroadcast_is_answered_once_per_request() {
    let mut n = Network::new(3, 0).with_detours(1);
    n.peers.get_mut(&1).unwrap().wants = 1;
    n.step(Step::Request(1));
    n.step(Step::Deliver(1, 2));
    n.step(Step::Deliver(2, 1));
    assert_eq!(n.node(1).missing_grants(), vec![3]);
    n.step(Step::Rebroadcast(1));
    // The original and the re-sent request are both answered.
    n.step(Step::Deliver(1, 3));
    n.step(Step::Deliver(1, 3));
    n.step(Step::Deliver(3, 1));
    n.step(Step::Deliver(3, 1));
    assert_eq!(n.node(1).pending_grant_count(), 2);
    assert!(n.node(1).is_ready());
    n.run(&[]);
    assert_eq!(n.entries, vec![1]);
    assert_eq!(n.in_flight(), 0);
}

proptest! {
    #[test]
    fn mutual_exclusion_and_liveness(
        n in 1u32..5,
        wants in 1usize..4,
        detours in 0usize..3,
        choices in proptest::collection::vec(any::<usize>(), 0..400)
    ) {
        let mut net = Network::new(n, wants).with_detours(detours);
        net.run(&choices);
        prop_assert!(net.max_held <= 1);
        net.assert_all_served(wants);
    }

    #[test]
    fn stamps_order_totally(t1 in 0u64..8, t2 in 0u64..8, a in 0u32..8, b in 0u32..8) {
        let x = Stamp::new(t1, a);
        let y = Stamp::new(t2, b);
        if (t1, a) != (t2, b) {
            // Exactly one of two distinct requests is earlier.
            prop_assert!(x.precedes(&y) ^ y.precedes(&x));
        }
        if t1 == t2 && a != b {
            prop_assert_eq!(x.precedes(&y), a < b);
        }
    }

    #[test]
    fn clock_never_goes_back(ops in proptest::collection::vec(proptest::option::of(0u64..1000), 0..64)) {
        let mut c = LamportClock::new();
        for op in ops {
            let before = c.time();
            let after = match op {
                Some(t) => c.observe(t),
                None => c.tick(),
            };
            prop_assert!(after > before);
            if let Some(t) = op {
                prop_assert!(after > t);
            }
        }
    }

    // A node's clock is strictly later than every request it has accepted
    // into its deferred queue.
    #[test]
    fn deferred_requests_precede_clock(choices in proptest::collection::vec(any::<usize>(), 0..200)) {
        let mut net = Network::new(3, 2);
        let mut picks = choices.iter();
        loop {
            let enabled = net.enabled();
            if enabled.is_empty() {
                break;
            }
            let pick = picks.next().map(|c| c % enabled.len()).unwrap_or(0);
            net.step(enabled[pick]);
            for p in net.peers.values() {
                for s in p.node.deferred.iter() {
                    prop_assert!(s.timestamp < p.node.clock());
                }
            }
        }
        net.assert_all_served(2);
    }
}
