use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Identity of a process in the group. The master is always rank 0.
pub type Rank = usize;

/// Message channel selector between a pair of ranks. Messages with the same
/// `(source, tag)` are delivered in the order they were sent.
pub type Tag = u32;

pub const MASTER_RANK: Rank = 0;

pub const TAG_CONTROL: Tag = 0;
pub const TAG_STRING: Tag = 1;
pub const TAG_COMPLETION: Tag = 1025;
pub const TAG_COMPLETION_ACK: Tag = 1026;
pub const TAG_HELLO: Tag = 1100;
/// Variable payloads travel on `TAG_VARIABLE_BASE + position`.
pub const TAG_VARIABLE_BASE: Tag = 4096;

/// Failure of a transport primitive.
///
/// Only `PeerUnreachable` means the other process is gone. The other variants
/// describe a failed attempt on a link that may still be alive.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    PeerUnreachable(Rank),
    #[error("local transport failure: {0}")]
    Local(String),
    #[error("malformed message from peer {rank}: {reason}")]
    Codec { rank: Rank, reason: String },
}

impl TransportError {
    pub fn is_peer_dead(&self) -> bool {
        matches!(self, TransportError::PeerUnreachable(_))
    }
}

/// Handle to an outstanding send or receive.
///
/// `poll` never blocks; `wait` suspends until the operation completes.
#[derive(Debug)]
pub struct Request<T> {
    rx: oneshot::Receiver<Result<T, TransportError>>,
    peer: Rank,
}

impl<T> Request<T> {
    pub(crate) fn pending(rx: oneshot::Receiver<Result<T, TransportError>>, peer: Rank) -> Self {
        Self { rx, peer }
    }

    /// A request that has already completed with `result`.
    pub(crate) fn ready(result: Result<T, TransportError>, peer: Rank) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx, peer }
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    /// Returns `None` while the operation is still in flight. Once a result
    /// has been returned the request is spent.
    pub fn poll(&mut self) -> Option<Result<T, TransportError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(TransportError::Local(format!(
                "request for peer {} was abandoned",
                self.peer
            )))),
        }
    }

    pub async fn wait(self) -> Result<T, TransportError> {
        let peer = self.peer;
        self.rx.await.map_err(|_| {
            TransportError::Local(format!("request for peer {} was abandoned", peer))
        })?
    }
}
