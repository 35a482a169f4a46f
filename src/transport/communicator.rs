//! Point-to-point messaging between ranks.
//!
//! A `Communicator` owns this process's inbox and one outgoing link per peer.
//! Local links drop frames straight into the peer's inbox; remote links hand
//! them to a writer task that owns the socket.

use super::mailbox::Inbox;
use super::types::*;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A frame queued for a remote writer task.
pub(crate) struct Outgoing {
    pub tag: Tag,
    pub payload: Vec<u8>,
    pub written: oneshot::Sender<Result<(), TransportError>>,
}

pub(crate) enum Link {
    Local(Arc<Inbox>),
    Remote(mpsc::UnboundedSender<Outgoing>),
}

pub struct Communicator {
    rank: Rank,
    size: usize,
    inbox: Arc<Inbox>,
    links: HashMap<Rank, Link>,
}

impl Communicator {
    pub(crate) fn new(
        rank: Rank,
        size: usize,
        inbox: Arc<Inbox>,
        links: HashMap<Rank, Link>,
    ) -> Self {
        Self {
            rank,
            size,
            inbox,
            links,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of processes in the group, master included.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_master(&self) -> bool {
        self.rank == MASTER_RANK
    }

    /// Every rank except the master, ascending.
    pub fn worker_ranks(&self) -> Vec<Rank> {
        (1..self.size).collect()
    }

    /// Starts sending `payload` to `dest` without waiting for it to leave.
    ///
    /// The returned request completes once the frame has been handed to the
    /// peer's inbox (local) or written to the socket (remote).
    pub fn send_async(&self, dest: Rank, tag: Tag, payload: Vec<u8>) -> Request<()> {
        match self.links.get(&dest) {
            None => Request::ready(Err(TransportError::PeerUnreachable(dest)), dest),
            Some(Link::Local(inbox)) => {
                let result = if inbox.deliver(self.rank, tag, payload) {
                    Ok(())
                } else {
                    Err(TransportError::PeerUnreachable(dest))
                };
                Request::ready(result, dest)
            }
            Some(Link::Remote(sender)) => {
                let (written, rx) = oneshot::channel();
                let outgoing = Outgoing {
                    tag,
                    payload,
                    written,
                };
                if sender.send(outgoing).is_err() {
                    return Request::ready(Err(TransportError::PeerUnreachable(dest)), dest);
                }
                Request::pending(rx, dest)
            }
        }
    }

    pub async fn send(&self, dest: Rank, tag: Tag, payload: Vec<u8>) -> Result<(), TransportError> {
        self.send_async(dest, tag, payload).wait().await
    }

    /// Registers a receive for the next frame from `(src, tag)`.
    pub fn recv_async(&self, src: Rank, tag: Tag) -> Request<Vec<u8>> {
        if src == self.rank || src >= self.size {
            return Request::ready(Err(TransportError::PeerUnreachable(src)), src);
        }
        Request::pending(self.inbox.receive(src, tag), src)
    }

    pub async fn recv(&self, src: Rank, tag: Tag) -> Result<Vec<u8>, TransportError> {
        self.recv_async(src, tag).wait().await
    }

    pub async fn send_string(&self, dest: Rank, message: &str) -> Result<(), TransportError> {
        tracing::trace!("Sending string: {} (receiver node: {})", message, dest);
        self.send(dest, TAG_STRING, message.as_bytes().to_vec()).await
    }

    pub async fn recv_string(&self, src: Rank) -> Result<String, TransportError> {
        let bytes = self.recv(src, TAG_STRING).await?;
        let message = String::from_utf8(bytes).map_err(|e| TransportError::Codec {
            rank: src,
            reason: e.to_string(),
        })?;
        tracing::trace!("Received string: {} (sending node: {})", message, src);
        Ok(message)
    }

    pub async fn send_int(&self, dest: Rank, tag: Tag, value: u64) -> Result<(), TransportError> {
        self.send(dest, tag, value.to_le_bytes().to_vec()).await
    }

    pub async fn recv_int(&self, src: Rank, tag: Tag) -> Result<u64, TransportError> {
        let bytes = self.recv(src, tag).await?;
        decode_int(src, &bytes)
    }

    pub async fn send_indices(
        &self,
        dest: Rank,
        tag: Tag,
        indices: &[usize],
    ) -> Result<(), TransportError> {
        let bytes =
            bincode::serialize(indices).map_err(|e| TransportError::Local(e.to_string()))?;
        self.send(dest, tag, bytes).await
    }

    pub async fn recv_indices(&self, src: Rank, tag: Tag) -> Result<Vec<usize>, TransportError> {
        let bytes = self.recv(src, tag).await?;
        bincode::deserialize(&bytes).map_err(|e| TransportError::Codec {
            rank: src,
            reason: e.to_string(),
        })
    }

    /// True when the link to `peer` is known to be closed.
    pub fn is_peer_closed(&self, peer: Rank) -> bool {
        match self.links.get(&peer) {
            None => true,
            Some(Link::Local(inbox)) => !inbox.is_open() || self.inbox.is_peer_closed(peer),
            Some(Link::Remote(sender)) => sender.is_closed() || self.inbox.is_peer_closed(peer),
        }
    }
}

/// Decodes the 8-byte little-endian integers used for control messages.
pub fn decode_int(src: Rank, bytes: &[u8]) -> Result<u64, TransportError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| TransportError::Codec {
        rank: src,
        reason: format!("expected 8 bytes for an integer, got {}", bytes.len()),
    })?;
    Ok(u64::from_le_bytes(array))
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.inbox.shut();
        for link in self.links.values() {
            if let Link::Local(peer_inbox) = link {
                peer_inbox.close_peer(self.rank);
            }
        }
    }
}
