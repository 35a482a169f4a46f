//! TCP process group (star topology).
//!
//! The master listens; every worker dials in, introduces itself with a
//! `Hello`, and is handed its rank in accept order. Afterwards each socket
//! is split into a reader task feeding the inbox and a writer task draining
//! an unbounded queue.
//!
//! Frame layout: `u32 tag | u64 length | payload`.

use super::communicator::{Communicator, Link, Outgoing};
use super::mailbox::Inbox;
use super::types::*;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Largest payload a peer may announce. A longer header is treated as a
/// corrupt stream and closes the link before anything is allocated.
pub(crate) const MAX_FRAME_BYTES: u64 = crate::value::MAX_ENCODED_BYTES;

#[derive(Debug, Serialize, Deserialize)]
enum Handshake {
    Hello { name: String },
    Welcome { rank: Rank, size: usize },
}

/// Listening side of the group, owned by the master process.
pub struct TcpMaster {
    listener: TcpListener,
}

impl TcpMaster {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Could not bind master listener on {}", addr))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits for `expected` workers and returns the master's communicator
    /// together with the name each worker announced.
    pub async fn accept_workers(
        self,
        expected: usize,
        timeout: Duration,
    ) -> Result<(Arc<Communicator>, BTreeMap<Rank, String>)> {
        let inbox = Inbox::new();
        let size = expected + 1;
        let mut links = HashMap::new();
        let mut names = BTreeMap::new();

        for rank in 1..=expected {
            let (stream, peer_addr) = tokio::time::timeout(timeout, self.listener.accept())
                .await
                .with_context(|| {
                    format!("Timed out waiting for worker {} of {}", rank, expected)
                })??;
            stream.set_nodelay(true)?;
            let (mut reader, mut writer) = stream.into_split();

            let (tag, payload) = read_frame(&mut reader)
                .await?
                .context("Worker closed the connection before saying hello")?;
            anyhow::ensure!(tag == TAG_HELLO, "Expected hello frame, got tag {}", tag);
            let Handshake::Hello { name } = bincode::deserialize::<Handshake>(&payload)? else {
                anyhow::bail!("Expected hello from {}", peer_addr);
            };

            let welcome = bincode::serialize(&Handshake::Welcome { rank, size })?;
            write_frame(&mut writer, TAG_HELLO, &welcome).await?;

            tracing::info!("Worker {} ({}) joined from {}", rank, name, peer_addr);
            links.insert(rank, spawn_link(rank, reader, writer, inbox.clone()));
            names.insert(rank, name);
        }

        let communicator = Communicator::new(MASTER_RANK, size, inbox, links);
        Ok((Arc::new(communicator), names))
    }
}

/// Dials the master, retrying with backoff until `attempts` are exhausted.
pub async fn connect_to_master(
    addr: SocketAddr,
    name: &str,
    attempts: usize,
) -> Result<Arc<Communicator>> {
    let stream = connect_with_retry(addr, attempts).await?;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let hello = bincode::serialize(&Handshake::Hello {
        name: name.to_string(),
    })?;
    write_frame(&mut writer, TAG_HELLO, &hello).await?;

    let (tag, payload) = read_frame(&mut reader)
        .await?
        .context("Master closed the connection during the handshake")?;
    anyhow::ensure!(tag == TAG_HELLO, "Expected welcome frame, got tag {}", tag);
    let Handshake::Welcome { rank, size } = bincode::deserialize::<Handshake>(&payload)? else {
        anyhow::bail!("Expected welcome from master at {}", addr);
    };

    tracing::info!("Joined group as rank {} of {} via {}", rank, size, addr);

    let inbox = Inbox::new();
    let mut links = HashMap::new();
    links.insert(MASTER_RANK, spawn_link(MASTER_RANK, reader, writer, inbox.clone()));

    Ok(Arc::new(Communicator::new(rank, size, inbox, links)))
}

async fn connect_with_retry(addr: SocketAddr, attempts: usize) -> Result<TcpStream> {
    let mut delay_ms = 150u64;

    for attempt in 0..attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if attempt + 1 == attempts {
                    let context = format!("Could not reach master at {}", addr);
                    return Err(anyhow::Error::new(e).context(context));
                }
                tracing::debug!("Master at {} not reachable yet: {}", addr, e);
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(1200);
            }
        }
    }

    Err(anyhow::anyhow!("Retry attempts exhausted"))
}

fn spawn_link(
    peer: Rank,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    inbox: Arc<Inbox>,
) -> Link {
    tokio::spawn(read_loop(peer, reader, inbox));

    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(peer, writer, receiver));

    Link::Remote(sender)
}

async fn read_loop(peer: Rank, mut reader: OwnedReadHalf, inbox: Arc<Inbox>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some((tag, payload))) => {
                tracing::trace!("Frame from {} (tag {}, {} bytes)", peer, tag, payload.len());
                if !inbox.deliver(peer, tag, payload) {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("Peer {} closed its connection", peer);
                break;
            }
            Err(e) => {
                tracing::warn!("Read from peer {} failed: {}", peer, e);
                break;
            }
        }
    }

    inbox.close_peer(peer);
}

async fn write_loop(
    peer: Rank,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(outgoing) = queue.recv().await {
        match write_frame(&mut writer, outgoing.tag, &outgoing.payload).await {
            Ok(()) => {
                let _ = outgoing.written.send(Ok(()));
            }
            Err(e) => {
                tracing::warn!("Write to peer {} failed: {}", peer, e);
                let _ = outgoing.written.send(Err(TransportError::PeerUnreachable(peer)));

                queue.close();
                while let Some(stranded) = queue.recv().await {
                    let _ = stranded.written.send(Err(TransportError::PeerUnreachable(peer)));
                }
                return;
            }
        }
    }

    let _ = writer.shutdown().await;
}

pub(crate) async fn write_frame<W>(writer: &mut W, tag: Tag, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(tag).await?;
    writer.write_u64(payload.len() as u64).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one frame; `Ok(None)` on a clean end of stream.
pub(crate) async fn read_frame<R>(reader: &mut R) -> io::Result<Option<(Tag, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let tag = match reader.read_u32().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    let length = reader.read_u64().await?;
    if length > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the limit", length),
        ));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some((tag, payload)))
}
