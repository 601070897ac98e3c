//! Bounded transaction pool and the in-flight transaction record.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::CtResult;
use crate::fnode::FileNode;
use crate::transport::Header;

/// Maximum number of fixed-size data buffers a transaction carries.
pub const MAX_BUFFERS: usize = 3;

/// State machine tag identifying which driver owns a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Archive,
    Extract,
    List,
    Delete,
    Cull,
}

/// Protocol state of a single transaction, advanced by [`crate::dispatch`]
/// on each inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolState {
    #[default]
    Pending,
    Opened,
    Closed,
    CullReplied,
    Done,
}

/// Completion callback invoked once a transaction's reply has been
/// dispatched. Returns whether the owning operation should be woken.
pub type CompleteFn = fn(&mut Transaction) -> CtResult<()>;

/// Cleanup callback invoked exactly once when a transaction's work
/// (including fnode refcounts) is finalized, win or lose.
pub type CleanupFn = fn(&mut Transaction);

/// Unit of in-flight work against the remote server.
///
/// Owned entirely by the [`TransactionPool`]; "in use" vs "free" is the only
/// lifecycle distinction the pool itself tracks. Everything else (protocol
/// state, buffers, callbacks) is reset on acquisition and left in place until
/// the next `release`.
pub struct Transaction {
    id: u64,
    owner: Owner,
    pub protocol_state: ProtocolState,
    buffers: [Vec<u8>; MAX_BUFFERS],
    buffer_lens: [usize; MAX_BUFFERS],
    active_buffer: usize,
    pub fnode: Option<Arc<FileNode>>,
    pub chunk_no: u64,
    pub iv: Option<[u8; 16]>,
    pub eof: bool,
    pub remote_name: Option<String>,
    pub complete: Option<CompleteFn>,
    pub cleanup: Option<CleanupFn>,
    pub header: Header,
    pub error_code: Option<u32>,
}

impl Transaction {
    fn new(id: u64, owner: Owner) -> Self {
        Self {
            id,
            owner,
            protocol_state: ProtocolState::default(),
            buffers: [Vec::new(), Vec::new(), Vec::new()],
            buffer_lens: [0; MAX_BUFFERS],
            active_buffer: 0,
            fnode: None,
            chunk_no: 0,
            iv: None,
            eof: false,
            remote_name: None,
            complete: None,
            cleanup: None,
            header: Header::default(),
            error_code: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn owner(&self) -> Owner {
        self.owner
    }

    /// Active data buffer, sized to its recorded length.
    #[must_use]
    pub fn active_data(&self) -> &[u8] {
        &self.buffers[self.active_buffer][..self.buffer_lens[self.active_buffer]]
    }

    /// Writes into the active buffer and records its length, growing the
    /// backing allocation only if this transaction has never carried a
    /// payload this large before.
    pub fn set_active_data(&mut self, data: &[u8]) {
        let buf = &mut self.buffers[self.active_buffer];
        buf.clear();
        buf.extend_from_slice(data);
        self.buffer_lens[self.active_buffer] = data.len();
    }

    pub fn select_buffer(&mut self, index: usize) {
        assert!(index < MAX_BUFFERS, "buffer index out of range");
        self.active_buffer = index;
    }

    fn reset(&mut self) {
        self.protocol_state = ProtocolState::default();
        for (buf, len) in self.buffers.iter_mut().zip(self.buffer_lens.iter_mut()) {
            buf.clear();
            *len = 0;
        }
        self.active_buffer = 0;
        self.fnode = None;
        self.chunk_no = 0;
        self.iv = None;
        self.eof = false;
        self.remote_name = None;
        self.complete = None;
        self.cleanup = None;
        self.header = Header::default();
        self.error_code = None;
    }
}

/// Fixed-cardinality arena of [`Transaction`] slots.
///
/// `acquire` never allocates past `capacity`; once exhausted it returns
/// `None` and the caller (a driver) must park in
/// [`crate::state::FileState::WaitingTrans`] until a `release` call signals
/// a slot is free again.
///
/// `park`/`take_parked` let a driver hand a transaction to an asynchronous
/// `Transport::send` without giving up pool accounting for it: the
/// transaction still counts against `in_use` while parked, and is only
/// returned to the free list via `release` once its reply has been
/// reconciled (`drivers::extract` is the only current user).
pub struct TransactionPool {
    capacity: usize,
    next_id: u64,
    free: Vec<Transaction>,
    in_use: usize,
    parked: FxHashMap<u64, Transaction>,
}

impl TransactionPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: 0,
            free: Vec::with_capacity(capacity),
            in_use: 0,
            parked: FxHashMap::default(),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn in_use(&self) -> usize {
        self.in_use
    }

    /// Returns a zeroed transaction owned by `owner`, or `None` if the pool
    /// is at capacity.
    pub fn acquire(&mut self, owner: Owner) -> Option<Transaction> {
        if self.in_use >= self.capacity {
            return None;
        }
        self.in_use += 1;
        let id = self.next_id;
        self.next_id += 1;

        if let Some(mut reused) = self.free.pop() {
            reused.reset();
            reused.id = id;
            reused.owner = owner;
            Some(reused)
        } else {
            Some(Transaction::new(id, owner))
        }
    }

    /// Returns `transaction` to the free list, running its cleanup callback
    /// exactly once. Must be called on every exit path: normal completion or
    /// driver-initiated abort.
    pub fn release(&mut self, mut transaction: Transaction) {
        if let Some(cleanup) = transaction.cleanup.take() {
            cleanup(&mut transaction);
        }
        self.in_use -= 1;
        self.free.push(transaction);
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.in_use >= self.capacity
    }

    /// Parks `transaction` keyed by its own id/tag, awaiting an
    /// asynchronous reply. Still counts against `in_use` until `release`.
    pub fn park(&mut self, transaction: Transaction) {
        self.parked.insert(transaction.id(), transaction);
    }

    /// Reclaims a transaction parked under `tag`, if one is waiting.
    #[must_use]
    pub fn take_parked(&mut self, tag: u64) -> Option<Transaction> {
        self.parked.remove(&tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_none_past_capacity() {
        let mut pool = TransactionPool::new(2);
        let a = pool.acquire(Owner::Archive).expect("first slot");
        let b = pool.acquire(Owner::Archive).expect("second slot");
        assert!(pool.acquire(Owner::Archive).is_none());

        pool.release(a);
        assert!(pool.acquire(Owner::Archive).is_some());
        pool.release(b);
    }

    #[test]
    fn released_transaction_is_zeroed_on_reacquire() {
        let mut pool = TransactionPool::new(1);
        let mut t = pool.acquire(Owner::Extract).unwrap();
        t.chunk_no = 7;
        t.eof = true;
        t.set_active_data(b"payload");
        pool.release(t);

        let reused = pool.acquire(Owner::Extract).unwrap();
        assert_eq!(reused.chunk_no, 0);
        assert!(!reused.eof);
        assert!(reused.active_data().is_empty());
    }

    #[test]
    fn cleanup_runs_exactly_once_on_release() {
        fn mark_cleaned(t: &mut Transaction) {
            t.error_code = Some(0xC1EA);
        }

        let mut pool = TransactionPool::new(1);
        let mut t = pool.acquire(Owner::List).unwrap();
        t.cleanup = Some(mark_cleaned);
        pool.release(t);

        // The cleaned transaction is still in the free list with error_code
        // set; reset() on the next acquire clears it again, proving cleanup
        // ran before reset, not after.
        let reused = pool.acquire(Owner::List).unwrap();
        assert!(reused.error_code.is_none());
    }

    #[test]
    fn parked_transaction_stays_in_use_until_reclaimed() {
        let mut pool = TransactionPool::new(1);
        let t = pool.acquire(Owner::Extract).unwrap();
        let tag = t.id();
        pool.park(t);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.acquire(Owner::Extract).is_none(), "parked transaction still counts as in use");

        let reclaimed = pool.take_parked(tag).expect("parked transaction is reclaimable by tag");
        assert_eq!(reclaimed.id(), tag);
        pool.release(reclaimed);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn pool_never_leaks_across_many_cycles() {
        let mut pool = TransactionPool::new(4);
        for _ in 0..100 {
            let mut held = Vec::new();
            while let Some(t) = pool.acquire(Owner::Cull) {
                held.push(t);
            }
            assert_eq!(pool.in_use(), 4);
            for t in held {
                pool.release(t);
            }
            assert_eq!(pool.in_use(), 0);
        }
    }
}
