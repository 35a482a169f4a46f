//! Tag-matched inbox shared by every link of one process.

use super::types::{Rank, Tag, TransportError};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

type Waiter = oneshot::Sender<Result<Vec<u8>, TransportError>>;

#[derive(Default)]
struct Mailbox {
    frames: VecDeque<Vec<u8>>,
    waiters: VecDeque<Waiter>,
}

struct InboxState {
    mailboxes: HashMap<(Rank, Tag), Mailbox>,
    closed_peers: HashSet<Rank>,
    open: bool,
}

/// Messages received by this process, keyed by `(source, tag)`.
///
/// Frames that arrive before anyone asks for them are queued; receivers that
/// ask before the frame arrives are parked as waiters. A closed peer fails
/// its waiters only after its already-queued frames have been consumed.
pub struct Inbox {
    state: Mutex<InboxState>,
}

impl Inbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(InboxState {
                mailboxes: HashMap::new(),
                closed_peers: HashSet::new(),
                open: true,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands a frame to the oldest live waiter or queues it.
    /// Returns false when this inbox has been shut.
    pub fn deliver(&self, src: Rank, tag: Tag, payload: Vec<u8>) -> bool {
        let mut state = self.lock();
        if !state.open {
            return false;
        }

        let mailbox = state.mailboxes.entry((src, tag)).or_default();
        let mut payload = payload;
        while let Some(waiter) = mailbox.waiters.pop_front() {
            match waiter.send(Ok(payload)) {
                Ok(()) => return true,
                // Receiver dropped its request; try the next one.
                Err(Ok(returned)) => payload = returned,
                Err(Err(_)) => return true,
            }
        }
        mailbox.frames.push_back(payload);
        true
    }

    /// Registers interest in the next frame from `(src, tag)`.
    pub fn receive(
        &self,
        src: Rank,
        tag: Tag,
    ) -> oneshot::Receiver<Result<Vec<u8>, TransportError>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();

        let queued = state
            .mailboxes
            .get_mut(&(src, tag))
            .and_then(|mailbox| mailbox.frames.pop_front());

        if let Some(frame) = queued {
            let _ = tx.send(Ok(frame));
        } else if !state.open {
            let _ = tx.send(Err(TransportError::Local("endpoint is closed".to_string())));
        } else if state.closed_peers.contains(&src) {
            let _ = tx.send(Err(TransportError::PeerUnreachable(src)));
        } else {
            state
                .mailboxes
                .entry((src, tag))
                .or_default()
                .waiters
                .push_back(tx);
        }

        rx
    }

    /// Marks `src` as gone and fails everything waiting on it.
    pub fn close_peer(&self, src: Rank) {
        let mut state = self.lock();
        if !state.closed_peers.insert(src) {
            return;
        }
        tracing::debug!("Link to peer {} closed", src);

        for ((peer, _), mailbox) in state.mailboxes.iter_mut() {
            if *peer != src {
                continue;
            }
            for waiter in mailbox.waiters.drain(..) {
                let _ = waiter.send(Err(TransportError::PeerUnreachable(src)));
            }
        }
    }

    /// Closes this endpoint: further deliveries are refused and waiters fail.
    pub fn shut(&self) {
        let mut state = self.lock();
        state.open = false;
        for mailbox in state.mailboxes.values_mut() {
            mailbox.frames.clear();
            for waiter in mailbox.waiters.drain(..) {
                let _ = waiter.send(Err(TransportError::Local("endpoint is closed".to_string())));
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn is_peer_closed(&self, src: Rank) -> bool {
        self.lock().closed_peers.contains(&src)
    }
}
