// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use clap::Parser;
use ricart::config::NodeConfig;
use ricart::coordinator::pair;
use ricart::printer::TcpPrinter;
use ricart::transport::{serve_peers, TcpTransport};
use ricart::{logging, Node, Printer, Transport};
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = NodeConfig::parse();
    logging::init();
    config.validate()?;

    // Failing to bind is the one error we don't survive.
    let listener = TcpListener::bind(&config.listen).await?;

    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(
        config.peers.iter().map(|p| (p.id, p.address.clone())),
    ));
    let printer: Arc<dyn Printer> = Arc::new(TcpPrinter::new(config.printer.clone()));
    let node = Node::new(config.id, config.peers.iter().map(|p| p.id));
    info!(
        "node {} connected to peers {:?}",
        config.id,
        config.peers.iter().map(|p| &p.address).collect::<Vec<_>>()
    );

    let (coordinator, responder) = pair(node, transport, printer, config.grant_timeout());
    let server = tokio::spawn(async move {
        if let Err(e) = serve_peers(listener, responder).await {
            error!("peer listener failed: {}", e);
        }
    });

    let result = coordinator.run(&config.workload()).await;
    server.abort();
    result?;
    Ok(())
}
