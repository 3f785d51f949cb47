//! Transaction ledgers.
//!
//! A ledger is a bounded FIFO of in-flight transactions keyed by id. The
//! device keeps three of them: RX (frames received but not yet handled), TX
//! (frames written but not yet acked by the server) and CR (frames the
//! orchestrator created and still waits on).
//!
//! Entries live in a fixed-capacity ring behind a blocking mutex; the lock is
//! only ever held for the duration of a closure, never across an await.
//! [`Ledger::add`] waits on a [`WaitQueue`] for a free slot when the ring is
//! full, and every removal wakes it.

use std::collections::VecDeque;
use std::time::Duration;

use maitake_sync::WaitQueue;
use mutex::{BlockingMutex, raw_impls::cs::CriticalSectionRawMutex};
use tokio::time::Instant;

use crate::logging::{debug, trace};

/// Which ledger this is. Only used for logging and the id policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    Rx,
    Tx,
    Cr,
}

impl LedgerKind {
    /// RX entries are popped oldest-first and never looked up by id, so the
    /// server may reuse ids freely there.
    fn unique_ids(self) -> bool {
        !matches!(self, LedgerKind::Rx)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: u16,
    /// Length of the original frame, whether or not it was stored.
    pub len: usize,
    pub payload: Option<Vec<u8>>,
    pub retries: u8,
    /// The local writer has put the frame on the socket.
    pub internally_acked: bool,
    pub enqueued_at: Instant,
}

impl Transaction {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerError {
    EmptyPayload,
    /// No entry at all.
    Empty,
    NotFound,
    /// The entry exists but was added without its bytes.
    NotStored,
    DuplicateId,
    Full,
    Closed,
}

/// What a [`Ledger::walk`] visitor wants done with the entry it saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    Keep,
    Remove,
    Stop,
    RemoveAndStop,
}

pub struct Ledger {
    kind: LedgerKind,
    capacity: usize,
    inner: BlockingMutex<CriticalSectionRawMutex, VecDeque<Transaction>>,
    space: WaitQueue,
}

// ---- impls ----

impl Ledger {
    pub fn new(kind: LedgerKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            inner: BlockingMutex::new(VecDeque::with_capacity(capacity)),
            space: WaitQueue::new(),
        }
    }

    pub fn kind(&self) -> LedgerKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.with_lock(|q| q.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids currently held, oldest first.
    pub fn ids(&self) -> Vec<u16> {
        self.inner.with_lock(|q| q.iter().map(|t| t.id).collect())
    }

    /// Appends a transaction, waiting for a free slot if the ledger is full.
    ///
    /// With `store` unset only the id and length are kept.
    pub async fn add(&self, frame: &[u8], id: u16, store: bool) -> Result<u16, LedgerError> {
        if frame.is_empty() {
            return Err(LedgerError::EmptyPayload);
        }
        let mut entry = Some(self.entry(frame, id, store));
        let res = self
            .space
            .wait_for_value(|| match self.push(&mut entry) {
                Err(LedgerError::Full) => None,
                other => Some(other),
            })
            .await;
        match res {
            Ok(r) => r,
            Err(_closed) => Err(LedgerError::Closed),
        }
    }

    /// Like [`Ledger::add`], but fails with `Full` instead of waiting.
    pub fn try_add(&self, frame: &[u8], id: u16, store: bool) -> Result<u16, LedgerError> {
        if frame.is_empty() {
            return Err(LedgerError::EmptyPayload);
        }
        self.push(&mut Some(self.entry(frame, id, store)))
    }

    /// Removes and returns the oldest entry.
    pub fn pop_head(&self) -> Result<Transaction, LedgerError> {
        let t = self
            .inner
            .with_lock(|q| q.pop_front())
            .ok_or(LedgerError::Empty)?;
        self.space.wake_all();
        trace!("{:?} ledger pop {}", self.kind, t.id);
        Ok(t)
    }

    /// Removes the entry with `id`. A second delete of the same id is
    /// `NotFound`.
    pub fn delete(&self, id: u16) -> Result<Transaction, LedgerError> {
        let t = self
            .inner
            .with_lock(|q| {
                let pos = q.iter().position(|t| t.id == id)?;
                q.remove(pos)
            })
            .ok_or(LedgerError::NotFound)?;
        self.space.wake_all();
        trace!("{:?} ledger delete {}", self.kind, id);
        Ok(t)
    }

    /// Copies out the stored frame of `id`.
    pub fn peek(&self, id: u16) -> Result<Vec<u8>, LedgerError> {
        self.inner.with_lock(|q| {
            let t = q.iter().find(|t| t.id == id).ok_or(LedgerError::NotFound)?;
            t.payload.clone().ok_or(LedgerError::NotStored)
        })
    }

    pub fn contains(&self, id: u16) -> bool {
        self.inner.with_lock(|q| q.iter().any(|t| t.id == id))
    }

    pub fn mark_internally_acked(&self, id: u16) -> Result<(), LedgerError> {
        self.inner.with_lock(|q| {
            let t = q
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(LedgerError::NotFound)?;
            t.internally_acked = true;
            Ok(())
        })
    }

    /// Visits entries oldest first under the lock.
    ///
    /// The visitor must not block; it may edit the entry in place.
    pub fn walk<F>(&self, mut visit: F) -> usize
    where
        F: FnMut(&mut Transaction) -> WalkAction,
    {
        let removed = self.inner.with_lock(|q| {
            let mut removed = 0;
            let mut i = 0;
            while i < q.len() {
                let action = visit(&mut q[i]);
                if matches!(action, WalkAction::Remove | WalkAction::RemoveAndStop) {
                    q.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
                if matches!(action, WalkAction::Stop | WalkAction::RemoveAndStop) {
                    break;
                }
            }
            removed
        });
        if removed > 0 {
            self.space.wake_all();
        }
        removed
    }

    /// Empties the ledger, returning what was in it.
    pub fn drain(&self) -> Vec<Transaction> {
        let all: Vec<_> = self.inner.with_lock(|q| q.drain(..).collect());
        if !all.is_empty() {
            debug!("{:?} ledger drained {} entries", self.kind, all.len());
            self.space.wake_all();
        }
        all
    }

    fn entry(&self, frame: &[u8], id: u16, store: bool) -> Transaction {
        Transaction {
            id,
            len: frame.len(),
            payload: store.then(|| frame.to_vec()),
            retries: 0,
            internally_acked: false,
            enqueued_at: Instant::now(),
        }
    }

    fn push(&self, entry: &mut Option<Transaction>) -> Result<u16, LedgerError> {
        self.inner.with_lock(|q| {
            if q.len() >= self.capacity {
                return Err(LedgerError::Full);
            }
            let Some(mut t) = entry.take() else {
                return Err(LedgerError::Closed);
            };
            if self.kind.unique_ids() && q.iter().any(|held| held.id == t.id) {
                return Err(LedgerError::DuplicateId);
            }
            t.enqueued_at = Instant::now();
            let id = t.id;
            q.push_back(t);
            trace!("{:?} ledger add {} ({} held)", self.kind, id, q.len());
            Ok(id)
        })
    }
}
