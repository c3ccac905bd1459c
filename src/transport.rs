// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Moving `Message`s between nodes. The protocol only needs reliable,
//! ordered, one-way delivery between each pair of nodes; a failed send is
//! reported as `PeerUnreachable` and never papered over.

use crate::{Error, Message, PeerId, Responder, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: PeerId, msg: Message) -> Result<()>;
}

type Lines = Framed<TcpStream, LinesCodec>;

/// Longest line accepted from a peer or printer client. Longer lines are
/// discarded up to the next newline.
pub const MAX_LINE: usize = 64 * 1024;

pub(crate) fn framed<T>(io: T) -> Framed<T, LinesCodec> {
    Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE))
}

/// The next complete line from `lines`, or `None` at end of stream. Lines
/// that are too long or not UTF-8 are logged and skipped; only I/O failures
/// end the stream with an error.
pub(crate) async fn next_line<T>(
    lines: &mut Framed<T, LinesCodec>,
    from: impl fmt::Display,
) -> Result<Option<String>>
where
    T: AsyncRead + Unpin,
{
    // After a decode error the framed stream yields one `None` and then
    // resumes reading; that `None` is not end of stream.
    let mut resuming = false;
    loop {
        match lines.next().await {
            Some(Ok(line)) => return Ok(Some(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                error!("dropping over-long line from {}", from);
                resuming = true;
            }
            Some(Err(LinesCodecError::Io(e))) if e.kind() == io::ErrorKind::InvalidData => {
                error!("dropping non-UTF-8 line from {}", from);
                resuming = true;
            }
            Some(Err(e)) => return Err(e.into()),
            None if resuming => resuming = false,
            None => return Ok(None),
        }
    }
}

struct Link {
    address: String,
    // Connected on first use, dropped on failure and reconnected on the
    // next send. The lock keeps sends to one peer in order.
    conn: Mutex<Option<Lines>>,
}

/// One outbound line-delimited JSON connection per peer.
pub struct TcpTransport {
    links: HashMap<PeerId, Link>,
}

impl TcpTransport {
    pub fn new<I>(peers: I) -> Self
    where
        I: IntoIterator<Item = (PeerId, String)>,
    {
        let links = peers
            .into_iter()
            .map(|(id, address)| {
                (
                    id,
                    Link {
                        address,
                        conn: Mutex::new(None),
                    },
                )
            })
            .collect();
        TcpTransport { links }
    }

    async fn connect(to: PeerId, link: &Link) -> Result<Lines> {
        let stream = TcpStream::connect(&link.address)
            .await
            .map_err(|e| unreachable(to, e))?;
        debug!("connected to peer {} at {}", to, link.address);
        Ok(framed(stream))
    }
}

fn unreachable<E: std::fmt::Display>(peer: PeerId, e: E) -> Error {
    Error::PeerUnreachable {
        peer,
        reason: e.to_string(),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, to: PeerId, msg: Message) -> Result<()> {
        let link = self.links.get(&to).ok_or_else(|| Error::PeerUnreachable {
            peer: to,
            reason: "no address configured".to_string(),
        })?;
        let line = msg.to_json_string()?;
        let mut conn = link.conn.lock().await;

        // A cached connection may have died since we last used it; give it
        // one fresh attempt before reporting the peer unreachable.
        let mut attempts = if conn.is_some() { 2 } else { 1 };
        loop {
            if conn.is_none() {
                *conn = Some(Self::connect(to, link).await?);
            }
            let sent = match conn.as_mut() {
                Some(lines) => lines.send(line.as_str()).await,
                None => continue,
            };
            match sent {
                Ok(()) => return Ok(()),
                Err(e) => {
                    *conn = None;
                    attempts -= 1;
                    if attempts == 0 {
                        return Err(unreachable(to, e));
                    }
                    debug!("resending to peer {} on a new connection: {}", to, e);
                }
            }
        }
    }
}

/// Accepts peer connections forever, handing every decoded message to the
/// responder. Each connection is read on its own task, in order.
pub async fn serve_peers(listener: TcpListener, responder: Responder) -> Result<()> {
    info!(
        "node {} listening for peers on {}",
        responder.id(),
        listener.local_addr()?
    );
    loop {
        let (stream, address) = listener.accept().await?;
        let responder = responder.clone();
        tokio::spawn(async move {
            if let Err(e) = read_peer(stream, address, responder).await {
                warn!("peer connection from {} closed: {}", address, e);
            }
        });
    }
}

async fn read_peer(stream: TcpStream, address: SocketAddr, responder: Responder) -> Result<()> {
    let mut lines = framed(stream);
    while let Some(line) = next_line(&mut lines, address).await? {
        match Message::from_json_string(&line) {
            Ok(msg) => responder.handle(msg).await,
            Err(e) => error!("dropping frame from {}: {}", address, e),
        }
    }
    Ok(())
}

/// In-process delivery over channels, one inbox per node. Used for running
/// whole groups inside one runtime.
#[derive(Clone, Default)]
pub struct LocalTransport {
    routes: HashMap<PeerId, mpsc::UnboundedSender<Message>>,
}

pub type Inbox = mpsc::UnboundedReceiver<Message>;

impl LocalTransport {
    /// A transport that can reach every id in `ids`, and the inbox for each.
    pub fn network<I>(ids: I) -> (Self, HashMap<PeerId, Inbox>)
    where
        I: IntoIterator<Item = PeerId>,
    {
        let mut routes = HashMap::new();
        let mut inboxes = HashMap::new();
        for id in ids {
            let (tx, rx) = mpsc::unbounded_channel();
            routes.insert(id, tx);
            inboxes.insert(id, rx);
        }
        (LocalTransport { routes }, inboxes)
    }

    /// Delivers everything arriving in `inbox` to `responder` until every
    /// sender is gone.
    pub async fn pump(mut inbox: Inbox, responder: Responder) {
        while let Some(msg) = inbox.recv().await {
            responder.handle(msg).await;
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, to: PeerId, msg: Message) -> Result<()> {
        match self.routes.get(&to) {
            Some(tx) => tx.send(msg).map_err(|e| unreachable(to, e)),
            None => Err(unreachable(to, "no route")),
        }
    }
}
