// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The shared resource: a printer server that knows nothing about mutual
//! exclusion, and the client nodes use to reach it while they hold the mutex.

use crate::{config::PrinterConfig, Error, PeerId, Result, Timestamp};
use async_trait::async_trait;
use crate::transport::{framed, next_line};
use futures::SinkExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// One print job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintRequest {
    pub client_id: PeerId,
    pub message: String,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintResponse {
    pub success: bool,
    pub confirmation_message: String,
}

impl PrintRequest {
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::MalformedMessage(e.to_string()))
    }

    pub fn from_json_string(line: &str) -> Result<Self> {
        serde_json::from_str::<Self>(line).map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}

impl PrintResponse {
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::MalformedMessage(e.to_string()))
    }

    pub fn from_json_string(line: &str) -> Result<Self> {
        serde_json::from_str::<Self>(line).map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}

/// Whatever a node calls while it holds the mutex. Holding the mutex is the
/// only thing that makes calling this safe; implementations don't check.
///
/// Any failure, including a response with `success: false`, comes back as
/// `ResourceServerFailure`: the job did not happen.
#[async_trait]
pub trait Printer: Send + Sync + 'static {
    /// Returns the server's confirmation message.
    async fn send_to_printer(&self, request: PrintRequest) -> Result<String>;
}

/// Talks to a `PrinterServer` over TCP, one connection per job.
#[derive(Clone, Debug)]
pub struct TcpPrinter {
    address: String,
}

impl TcpPrinter {
    pub fn new(address: String) -> Self {
        TcpPrinter { address }
    }

    async fn exchange(&self, request: &PrintRequest) -> Result<PrintResponse> {
        let stream = TcpStream::connect(&self.address).await?;
        let mut lines = framed(stream);
        lines.send(request.to_json_string()?).await?;
        match next_line(&mut lines, &self.address).await? {
            Some(line) => PrintResponse::from_json_string(&line),
            None => Err(Error::ResourceServerFailure(
                "connection closed before a response".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Printer for TcpPrinter {
    async fn send_to_printer(&self, request: PrintRequest) -> Result<String> {
        match self.exchange(&request).await {
            Ok(PrintResponse {
                success: true,
                confirmation_message,
            }) => Ok(confirmation_message),
            Ok(PrintResponse {
                success: false,
                confirmation_message,
            }) => Err(Error::ResourceServerFailure(confirmation_message)),
            Err(Error::ResourceServerFailure(e)) => Err(Error::ResourceServerFailure(e)),
            Err(e) => Err(Error::ResourceServerFailure(format!(
                "{} ({})",
                e, self.address
            ))),
        }
    }
}

/// The printer itself. Stateless: it accepts any job from anyone, spends a
/// random while "printing" it, and confirms. Serialising access is entirely
/// the clients' problem.
#[derive(Clone, Debug)]
pub struct PrinterServer {
    config: PrinterConfig,
}

impl PrinterServer {
    pub fn new(config: PrinterConfig) -> Self {
        PrinterServer { config }
    }

    /// Binds the configured address and serves forever.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!("printer server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, address) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle(stream, address).await {
                    error!("printer connection from {} failed: {}", address, e);
                }
            });
        }
    }

    // Pick this job's latency and fate before sleeping: the rng isn't Send.
    fn roll(&self) -> (Duration, bool) {
        let mut rng = rand::rng();
        let ms = rng.random_range(self.config.min_latency_ms..=self.config.max_latency_ms);
        let fail = rng.random_bool(self.config.failure_rate);
        (Duration::from_millis(ms), fail)
    }

    pub async fn process(&self, request: &PrintRequest) -> PrintResponse {
        info!(
            "received job from client {} (clock {})",
            request.client_id, request.timestamp
        );
        info!("printing: {:?}", request.message);
        let (latency, fail) = self.roll();
        tokio::time::sleep(latency).await;
        if fail {
            let msg = format!("Printer jammed on job from client {}.", request.client_id);
            warn!("{}", msg);
            return PrintResponse {
                success: false,
                confirmation_message: msg,
            };
        }
        let msg = format!(
            "Job from client {} finished in {:.2} seconds.",
            request.client_id,
            latency.as_secs_f64()
        );
        info!("{}", msg);
        PrintResponse {
            success: true,
            confirmation_message: msg,
        }
    }

    async fn handle(&self, stream: TcpStream, address: SocketAddr) -> Result<()> {
        let mut lines = framed(stream);
        while let Some(line) = next_line(&mut lines, address).await? {
            let response = match PrintRequest::from_json_string(&line) {
                Ok(request) => self.process(&request).await,
                Err(e) => {
                    warn!("rejecting job: {}", e);
                    PrintResponse {
                        success: false,
                        confirmation_message: "The request had incorrect formatting.".to_string(),
                    }
                }
            };
            lines.send(response.to_json_string()?).await?;
        }
        Ok(())
    }
}
