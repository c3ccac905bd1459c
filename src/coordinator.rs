// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The two halves of a running node. `Coordinator` is driven by the node's
//! own wish to print; `Responder` answers the peers. They share one `Node`
//! behind one lock, and both follow the same rule: compute under the lock,
//! send after dropping it. A slow peer therefore never stops this node from
//! answering the others.

use crate::config::Workload;
use crate::{Error, Message, MutexState, Node, PeerId, PrintRequest, Printer, Result, Timestamp, Transport};
use futures::future::join_all;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// State shared by the requester and responder sides of one node.
#[derive(Clone)]
pub struct Shared {
    id: PeerId,
    node: Arc<Mutex<Node>>,
    // Woken when the last missing grant arrives.
    all_granted: Arc<Notify>,
    transport: Arc<dyn Transport>,
}

impl Shared {
    pub fn new(node: Node, transport: Arc<dyn Transport>) -> Self {
        Shared {
            id: node.id,
            node: Arc::new(Mutex::new(node)),
            all_granted: Arc::new(Notify::new()),
            transport,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// A copy of the node as it is right now.
    pub async fn snapshot(&self) -> Node {
        self.node.lock().await.clone()
    }

    // Send everything, concurrently. Failures are logged and otherwise
    // dropped: in particular an undeliverable request is never counted as
    // granted.
    async fn dispatch(&self, outgoing: Vec<Message>) {
        if outgoing.is_empty() {
            return;
        }
        let transport = &self.transport;
        let sends = outgoing
            .into_iter()
            .map(|msg| async move { (msg, transport.send(msg.to(), msg).await) });
        for (msg, sent) in join_all(sends).await {
            match sent {
                Ok(()) => debug!("node {} sent {}", self.id, msg),
                Err(e) => warn!("node {} could not deliver {}: {}", self.id, msg, e),
            }
        }
    }
}

/// Builds both halves of a node around one shared state.
pub fn pair(
    node: Node,
    transport: Arc<dyn Transport>,
    printer: Arc<dyn Printer>,
    grant_timeout: Option<Duration>,
) -> (Coordinator, Responder) {
    let shared = Shared::new(node, transport);
    let responder = Responder::new(shared.clone());
    (Coordinator::new(shared, printer, grant_timeout), responder)
}

/// The requester side: asks for the printer, waits for it, uses it and
/// gives it back.
pub struct Coordinator {
    shared: Shared,
    printer: Arc<dyn Printer>,
    grant_timeout: Option<Duration>,
}

impl Coordinator {
    pub fn new(shared: Shared, printer: Arc<dyn Printer>, grant_timeout: Option<Duration>) -> Self {
        Coordinator {
            shared,
            printer,
            grant_timeout,
        }
    }

    pub fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Released -> Wanting, then broadcast the request.
    pub async fn request_access(&self) -> Result<Timestamp> {
        let mut outgoing = Vec::new();
        let ts = self.shared.node.lock().await.request_access(&mut outgoing)?;
        self.shared.dispatch(outgoing).await;
        Ok(ts)
    }

    /// Blocks until every peer has granted the outstanding request. With a
    /// grant timeout configured, gives up after that long with
    /// `StalledRequest`; the node is left Wanting, still owing whatever it
    /// deferred, and may wait again, `rebroadcast` or `abandon`.
    pub async fn await_grants(&self) -> Result<()> {
        let started = Instant::now();
        loop {
            {
                let node = self.shared.node.lock().await;
                if node.is_ready() {
                    debug!("node {} has every grant", node.id);
                    return Ok(());
                }
                if node.state() != MutexState::Wanting {
                    return Err(Error::InvalidTransition {
                        node: node.id,
                        state: node.state(),
                        op: "await grants",
                    });
                }
            }
            // A grant landing between the check above and here leaves a
            // permit in the Notify, so it isn't missed.
            let notified = self.shared.all_granted.notified();
            match self.grant_timeout {
                None => notified.await,
                Some(limit) => {
                    let remaining = limit.saturating_sub(started.elapsed());
                    if remaining.is_zero() || timeout(remaining, notified).await.is_err() {
                        return self.stalled(started.elapsed()).await;
                    }
                }
            }
        }
    }

    async fn stalled(&self, waited: Duration) -> Result<()> {
        let node = self.shared.node.lock().await;
        if node.is_ready() {
            return Ok(());
        }
        Err(Error::StalledRequest {
            timestamp: node.request_timestamp().unwrap_or_default(),
            waited,
            missing: node.missing_grants(),
        })
    }

    /// Wanting -> Held -> Released around one print job. The mutex is
    /// released and deferred grants flushed whether or not the job worked;
    /// the job's outcome is returned afterwards.
    pub async fn critical_section(&self, message: &str) -> Result<String> {
        let timestamp = self.shared.node.lock().await.enter()?;
        let request = PrintRequest {
            client_id: self.shared.id,
            message: message.to_string(),
            timestamp,
        };
        let outcome = self.printer.send_to_printer(request).await;

        let mut outgoing = Vec::new();
        {
            let mut node = self.shared.node.lock().await;
            if outcome.is_err() {
                node.record_printer_failure();
            }
            node.release(&mut outgoing)?;
        }
        self.shared.dispatch(outgoing).await;

        match &outcome {
            Ok(confirmation) => info!("node {} printer says: {}", self.shared.id, confirmation),
            Err(e) => warn!("node {} print job failed: {}", self.shared.id, e),
        }
        outcome
    }

    /// One full cycle: request, wait for every grant, print, release.
    pub async fn use_resource(&self, message: &str) -> Result<String> {
        self.request_access().await?;
        self.await_grants().await?;
        self.critical_section(message).await
    }

    /// Re-sends the outstanding request to the peers that haven't granted it.
    pub async fn rebroadcast(&self) -> Result<usize> {
        let mut outgoing = Vec::new();
        let n = self.shared.node.lock().await.rebroadcast(&mut outgoing)?;
        self.shared.dispatch(outgoing).await;
        Ok(n)
    }

    /// Drops a stalled request and pays back any grants it was holding up.
    pub async fn abandon(&self) -> Result<usize> {
        let mut outgoing = Vec::new();
        let n = self.shared.node.lock().await.abandon(&mut outgoing)?;
        self.shared.dispatch(outgoing).await;
        Ok(n)
    }

    /// The node's main loop: after the startup delay, print forever with a
    /// random think time between jobs. A stalled request is reported and
    /// re-sent rather than dropped. Only protocol violations end the loop.
    pub async fn run(&self, workload: &Workload) -> Result<()> {
        sleep(workload.startup_delay).await;
        loop {
            sleep(think_time(workload)).await;
            self.request_access().await?;
            loop {
                match self.await_grants().await {
                    Ok(()) => break,
                    Err(e @ Error::StalledRequest { .. }) => {
                        error!("node {}: {}", self.shared.id, e);
                        self.rebroadcast().await?;
                    }
                    Err(e) => return Err(e),
                }
            }
            match self.critical_section(&workload.message).await {
                Ok(_) | Err(Error::ResourceServerFailure(_)) => (),
                Err(e) => return Err(e),
            }
        }
    }
}

fn think_time(workload: &Workload) -> Duration {
    rand::rng().random_range(workload.min_think..=workload.max_think)
}

/// The responder side: applies each peer message to the node and sends
/// whatever it produced.
#[derive(Clone)]
pub struct Responder {
    shared: Shared,
}

impl Responder {
    pub fn new(shared: Shared) -> Self {
        Responder { shared }
    }

    pub fn id(&self) -> PeerId {
        self.shared.id
    }

    /// Never fails: a message the node rejects is logged and dropped.
    pub async fn handle(&self, msg: Message) {
        let mut outgoing = Vec::new();
        let ready = {
            let mut node = self.shared.node.lock().await;
            if let Err(e) = node.receive(&msg, &mut outgoing) {
                warn!("node {} rejected {}: {}", self.shared.id, msg, e);
                return;
            }
            node.is_ready()
        };
        if ready && msg.is_grant() {
            self.shared.all_granted.notify_one();
        }
        self.shared.dispatch(outgoing).await;
    }
}
