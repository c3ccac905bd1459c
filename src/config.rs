// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Startup configuration for the two binaries. Fixed for the life of the
//! process: in particular the peer set never changes during a run.

use crate::{Error, PeerId, Result};
use clap::Parser;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

/// A peer as given on the command line: `ID=HOST:PORT`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddr {
    pub id: PeerId,
    pub address: String,
}

impl FromStr for PeerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id, address) = s
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("peer {:?} is not ID=HOST:PORT", s)))?;
        let id = id
            .trim()
            .parse::<PeerId>()
            .map_err(|e| Error::Config(format!("peer id {:?}: {}", id, e)))?;
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::Config(format!("peer {} has no address", id)));
        }
        Ok(PeerAddr {
            id,
            address: address.to_string(),
        })
    }
}

/// One mutex participant.
#[derive(Clone, Debug, Parser)]
#[command(name = "node", about = "Shares a printer with its peers using Ricart-Agrawala")]
pub struct NodeConfig {
    /// This node's id; unique across the group.
    #[arg(long)]
    pub id: PeerId,

    /// Address to accept peer connections on.
    #[arg(long)]
    pub listen: String,

    /// Printer server address.
    #[arg(long, default_value = "127.0.0.1:50051")]
    pub printer: String,

    /// Another node, as ID=HOST:PORT. Repeat once per peer.
    #[arg(long = "peer")]
    pub peers: Vec<PeerAddr>,

    /// Report a stalled request after this long without every grant.
    /// Unbounded when absent.
    #[arg(long)]
    pub grant_timeout_ms: Option<u64>,

    #[arg(long, default_value_t = 5000)]
    pub min_think_ms: u64,

    #[arg(long, default_value_t = 10000)]
    pub max_think_ms: u64,

    /// Time to let the other nodes come up before the first request.
    #[arg(long, default_value_t = 5000)]
    pub startup_delay_ms: u64,
}

/// What a node does once it's up: wait, then print forever with random
/// pauses between jobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workload {
    pub startup_delay: Duration,
    pub min_think: Duration,
    pub max_think: Duration,
    pub message: String,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for peer in self.peers.iter() {
            if peer.id == self.id {
                return Err(Error::Config(format!(
                    "peer list contains this node's own id {}",
                    self.id
                )));
            }
            if !seen.insert(peer.id) {
                return Err(Error::Config(format!("peer id {} given twice", peer.id)));
            }
        }
        if self.min_think_ms > self.max_think_ms {
            return Err(Error::Config(format!(
                "think time range {}..{} ms is inverted",
                self.min_think_ms, self.max_think_ms
            )));
        }
        if self.grant_timeout_ms == Some(0) {
            return Err(Error::Config("grant timeout must be positive".to_string()));
        }
        Ok(())
    }

    pub fn grant_timeout(&self) -> Option<Duration> {
        self.grant_timeout_ms.map(Duration::from_millis)
    }

    pub fn workload(&self) -> Workload {
        Workload {
            startup_delay: Duration::from_millis(self.startup_delay_ms),
            min_think: Duration::from_millis(self.min_think_ms),
            max_think: Duration::from_millis(self.max_think_ms),
            message: format!("Hello, printer! I am client {}.", self.id),
        }
    }
}

/// The printer server.
#[derive(Clone, Debug, Parser)]
#[command(name = "printer", about = "A printer that prints whatever it is sent")]
pub struct PrinterConfig {
    #[arg(long, default_value = "0.0.0.0:50051")]
    pub listen: String,

    #[arg(long, default_value_t = 2000)]
    pub min_latency_ms: u64,

    #[arg(long, default_value_t = 3000)]
    pub max_latency_ms: u64,

    /// Probability in [0, 1] that a job fails.
    #[arg(long, default_value_t = 0.0)]
    pub failure_rate: f64,
}

impl PrinterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_latency_ms > self.max_latency_ms {
            return Err(Error::Config(format!(
                "latency range {}..{} ms is inverted",
                self.min_latency_ms, self.max_latency_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(Error::Config(format!(
                "failure rate {} is not in [0, 1]",
                self.failure_rate
            )));
        }
        Ok(())
    }
}
