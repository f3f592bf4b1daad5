//! Commit lock with a FIFO wait queue
//!
//! Holding the commit lock is the precondition for moving a transaction from
//! IDLE to BEGIN. Waiters are served strictly in arrival order. A waiter can
//! be cancelled (its connection went away) without disturbing the others.
//! There are no timeouts: the only way to take the lock from a live holder is
//! the administrative `force_release`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::{StoreError, StoreResult};

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique ticket identifying one lock owner.
pub fn new_ticket() -> u64 {
    NEXT_TICKET.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<u64>,
    queue: VecDeque<u64>,
    cancelled: HashSet<u64>,
}

/// FIFO commit lock.
#[derive(Debug)]
pub struct CommitLock {
    state: Mutex<LockState>,
    cond: Condvar,
    warn_depth: usize,
    critical_depth: usize,
}

impl CommitLock {
    pub fn new(warn_depth: usize, critical_depth: usize) -> Self {
        Self { state: Mutex::new(LockState::default()), cond: Condvar::new(), warn_depth, critical_depth }
    }

    /// Block until `ticket` holds the lock.
    ///
    /// Fails with `Disconnected` if the wait is cancelled, and with
    /// `StorageTransaction` if `ticket` already holds or awaits the lock.
    pub fn acquire(&self, ticket: u64) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.holder == Some(ticket) || state.queue.contains(&ticket) {
            return Err(StoreError::transaction("commit lock already requested by this transaction"));
        }
        state.queue.push_back(ticket);
        self.report_depth(state.queue.len(), state.holder.is_some());

        loop {
            if state.cancelled.remove(&ticket) {
                state.queue.retain(|t| *t != ticket);
                self.cond.notify_all();
                debug!(ticket, "commit lock wait cancelled");
                return Err(StoreError::Disconnected { reason: "commit lock wait cancelled".into() });
            }
            if state.holder.is_none() && state.queue.front() == Some(&ticket) {
                state.queue.pop_front();
                state.holder = Some(ticket);
                self.cond.notify_all();
                return Ok(());
            }
            self.cond.wait(&mut state);
        }
    }

    /// Release the lock if `ticket` holds it. Returns whether it did.
    pub fn release(&self, ticket: u64) -> bool {
        let mut state = self.state.lock();
        if state.holder != Some(ticket) {
            return false;
        }
        state.holder = None;
        self.cond.notify_all();
        true
    }

    /// Remove a waiting ticket from the queue; its `acquire` fails with
    /// `Disconnected`. Returns false if the ticket was not waiting.
    pub fn cancel(&self, ticket: u64) -> bool {
        let mut state = self.state.lock();
        if !state.queue.contains(&ticket) {
            return false;
        }
        state.cancelled.insert(ticket);
        self.cond.notify_all();
        true
    }

    /// Take the lock away from its holder. Only for holders known to be dead.
    pub fn force_release(&self) -> Option<u64> {
        let mut state = self.state.lock();
        let holder = state.holder.take();
        if let Some(ticket) = holder {
            warn!(ticket, "commit lock forcibly released");
            self.cond.notify_all();
        }
        holder
    }

    /// Number of waiters, not counting the holder.
    pub fn queue_depth(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn holder(&self) -> Option<u64> {
        self.state.lock().holder
    }

    fn report_depth(&self, depth: usize, held: bool) {
        if !held {
            return;
        }
        if depth >= self.critical_depth {
            error!(depth, "commit lock queue critical");
        } else if depth >= self.warn_depth {
            warn!(depth, "commit lock queue growing");
        } else {
            debug!(depth, "waiting for commit lock");
        }
    }
}
