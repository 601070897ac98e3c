//! Cooperative single-threaded event loop driving the operation queue.

use tracing::{debug, warn};

use crate::collaborators::Collaborators;
use crate::error::CtResult;
use crate::operation::{EngineCx, Operation, OperationQueue};
use crate::transaction::TransactionPool;
use crate::transport::Transport;

/// Reason the scheduler stopped accepting new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DyingReason {
    Cancelled,
    Fatal,
}

/// Drives one [`crate::operation::Operation`] at a time through
/// [`crate::state::FileState`], backed by a bounded [`TransactionPool`].
///
/// Honors a process-wide "dying" flag: once set, every resume point is
/// expected to release its held resources and return without queueing
/// further work. In-flight transactions are still allowed to drain.
pub struct Engine {
    pool: TransactionPool,
    queue: OperationQueue,
    collaborators: Box<dyn Collaborators>,
    dying: Option<DyingReason>,
}

impl Engine {
    #[must_use]
    pub fn new(pool_capacity: usize, collaborators: Box<dyn Collaborators>) -> Self {
        Self {
            pool: TransactionPool::new(pool_capacity),
            queue: OperationQueue::new(),
            collaborators,
            dying: None,
        }
    }

    #[must_use]
    pub const fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    #[must_use]
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    #[must_use]
    pub const fn dying(&self) -> Option<DyingReason> {
        self.dying
    }

    /// Sets the process-wide cancellation flag. Already-running operations
    /// observe it on their next resume.
    pub fn begin_dying(&mut self, reason: DyingReason) {
        warn!(?reason, "engine cancellation requested");
        self.dying = Some(reason);
    }

    /// Enqueues `op` at the tail of the operation queue.
    pub fn enqueue(&mut self, op: Operation) {
        self.queue.push_back(op);
    }

    /// Splices `op` to run immediately after the current operation.
    pub fn enqueue_after_current(&mut self, op: Operation) {
        self.queue.push_after_current(op);
    }

    /// One scheduler tick: if dying, refuses to promote new work; otherwise
    /// promotes the next pending operation to current if none is running,
    /// resumes it once, and retires it if it finished.
    ///
    /// Returns `true` if an operation was resumed this tick (the caller
    /// should keep pumping), `false` if the queue is drained and idle.
    pub fn tick(&mut self, transport: &mut dyn Transport) -> CtResult<bool> {
        if self.dying.is_some() && self.queue.current().is_none() && self.queue.pending_len() == 0 {
            return Ok(false);
        }

        if !self.queue.ensure_current() {
            return Ok(false);
        }

        let mut splice_after_current = Vec::new();
        let mut enqueue_tail = Vec::new();
        {
            let mut cx = EngineCx {
                pool: &mut self.pool,
                transport,
                collaborators: self.collaborators.as_mut(),
                splice_after_current: &mut splice_after_current,
                enqueue_tail: &mut enqueue_tail,
            };
            let op = self.queue.current_mut().expect("just ensured current");
            debug!(kind = ?op.kind, state = %op.state, "resuming operation");
            op.resume(&mut cx)?;
        }

        // Splices run immediately after the current operation, ahead of
        // anything already queued; pushing in reverse preserves the
        // driver's intended order against `push_after_current`'s LIFO
        // semantics.
        for op in splice_after_current.into_iter().rev() {
            self.queue.push_after_current(op);
        }
        for op in enqueue_tail {
            self.queue.push_back(op);
        }

        self.queue.retire_finished_current();
        Ok(true)
    }

    /// Runs [`Engine::tick`] until the queue drains or the engine is dying
    /// with nothing left in flight.
    pub fn run_to_idle(&mut self, transport: &mut dyn Transport) -> CtResult<()> {
        while self.tick(transport)? {}
        Ok(())
    }
}
