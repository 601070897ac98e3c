//! Operation queue: the FIFO of driver instances serviced by the
//! cooperative scheduler.
//!
//! Each driver's resume state is modeled as an explicit tagged variant
//! (`Starting | AwaitingOpen | Streaming { .. } | Closing | Done`) rather
//! than an implicit set of boolean flags plus an untyped scratch pointer:
//! resume points are exhaustive and checkable by the compiler instead of by
//! convention.

use std::collections::VecDeque;
use std::fs::File;
use std::path::PathBuf;

use crate::collaborators::Collaborators;
use crate::error::CtResult;
use crate::fnode::FileNode;
use crate::naming::ALL_CTFILES_PATTERN;
use crate::sha::ShaSet;
use crate::state::FileState;
use crate::transaction::TransactionPool;
use crate::transport::Transport;
use std::sync::Arc;

/// Resources an operation's start/completion function needs beyond its own
/// argument pouch.
///
/// `splice_after_current` and `enqueue_tail` are how a driver schedules
/// follow-up operations
/// without borrowing the [`OperationQueue`] directly — the queue already
/// lends out the currently-resuming [`Operation`] mutably, so the scheduler
/// collects these vectors after `resume` returns and drains them into the
/// queue itself.
pub struct EngineCx<'a> {
    pub pool: &'a mut TransactionPool,
    pub transport: &'a mut dyn Transport,
    pub collaborators: &'a mut dyn Collaborators,
    pub splice_after_current: &'a mut Vec<Operation>,
    pub enqueue_tail: &'a mut Vec<Operation>,
}

/// An operation's start function: inspects its own resume state inside
/// `args` and advances as far as resources permit, updating `state`.
pub type StartFn = fn(args: &mut OperationArgs, state: &mut FileState, cx: &mut EngineCx) -> CtResult<()>;

/// Invoked once, after the operation reaches [`FileState::Finished`].
pub type OnCompleteFn = fn(args: &mut OperationArgs, cx: &mut EngineCx) -> CtResult<()>;

/// Archive driver's resumable state.
#[derive(Debug, Clone, Copy)]
pub enum ArchiveState {
    Starting,
    AwaitingOpen,
    Streaming { chunk_no: u64, offset: u64 },
    Closing,
    Done,
}

/// Extract driver's resumable state.
///
/// Pipelining bookkeeping (`next_chunk_no`, in-flight tags, the close
/// transaction's tag) lives on `OperationArgs::Extract` instead of inside
/// `Streaming`/`Closing` themselves, so this stays a plain `Copy` tag.
#[derive(Debug, Clone, Copy)]
pub enum ExtractState {
    Starting,
    AwaitingOpen,
    Streaming,
    Closing,
    Done,
}

/// Cull orchestration's resumable state.
#[derive(Debug, Clone, Copy)]
pub enum CullState {
    Starting,
    Listing,
    Collecting,
    WalkingDependencies,
    AwaitingSetup,
    StreamingShas,
    AwaitingComplete,
    Done,
}

/// Delete orchestration's resumable state.
#[derive(Debug, Clone, Copy)]
pub enum DeleteOrchestrationState {
    Starting,
    Listing,
    FetchingMissing,
    CheckingDependencies,
    SchedulingDeletes,
    Done,
}

/// Per-driver argument pouch plus explicit resume state, attached to one
/// [`Operation`].
///
/// Not `Clone`: archive/extract hold an open [`File`] once streaming starts,
/// and cull holds the live-SHA set being accumulated. Both are exactly the
/// kind of per-resume scratch state this module's resumable-state design
/// makes explicit instead of carrying behind an untyped pointer.
#[derive(Debug)]
pub enum OperationArgs {
    Archive {
        local_path: PathBuf,
        remote_name: Option<String>,
        cleartext: bool,
        is_ctfile: bool,
        max_block_size: usize,
        fnode: Option<Arc<FileNode>>,
        local_file: Option<File>,
        file_len: u64,
        state: ArchiveState,
    },
    Extract {
        remote_name: String,
        local_path: PathBuf,
        fnode: Option<Arc<FileNode>>,
        local_file: Option<File>,
        next_chunk_no: u64,
        /// Tags of read-chunk requests sent but not yet reconciled, oldest
        /// first.
        in_flight: VecDeque<u64>,
        /// Tag of the transaction repurposed as the xml-close carrier, once
        /// EOF has been detected.
        close_tag: Option<u64>,
        state: ExtractState,
    },
    List {
        entries: Vec<String>,
    },
    Delete {
        file: String,
    },
    DeleteOrchestration {
        pattern: String,
        all_files: Vec<String>,
        delete_files: Vec<String>,
        state: DeleteOrchestrationState,
    },
    Cull {
        keep_days: u32,
        sha_per_packet: usize,
        cull_uuid: u64,
        all_files: Vec<String>,
        deleted_files: Vec<String>,
        live_shas: ShaSet,
        state: CullState,
    },
}

impl OperationArgs {
    #[must_use]
    pub fn new_archive(
        local_path: PathBuf,
        remote_name: Option<String>,
        cleartext: bool,
        is_ctfile: bool,
        max_block_size: usize,
    ) -> Self {
        Self::Archive {
            local_path,
            remote_name,
            cleartext,
            is_ctfile,
            max_block_size,
            fnode: None,
            local_file: None,
            file_len: 0,
            state: ArchiveState::Starting,
        }
    }

    #[must_use]
    pub fn new_extract(remote_name: String, local_path: PathBuf) -> Self {
        Self::Extract {
            remote_name,
            local_path,
            fnode: None,
            local_file: None,
            next_chunk_no: 0,
            in_flight: VecDeque::new(),
            close_tag: None,
            state: ExtractState::Starting,
        }
    }

    #[must_use]
    pub fn new_list() -> Self {
        Self::List { entries: Vec::new() }
    }

    #[must_use]
    pub fn new_delete(file: String) -> Self {
        Self::Delete { file }
    }

    #[must_use]
    pub fn new_delete_orchestration(pattern: String) -> Self {
        Self::DeleteOrchestration {
            pattern,
            all_files: Vec::new(),
            delete_files: Vec::new(),
            state: DeleteOrchestrationState::Starting,
        }
    }

    #[must_use]
    pub fn new_cull(keep_days: u32, sha_per_packet: usize) -> Self {
        Self::Cull {
            keep_days,
            sha_per_packet,
            cull_uuid: 0,
            all_files: Vec::new(),
            deleted_files: Vec::new(),
            live_shas: ShaSet::new(),
            state: CullState::Starting,
        }
    }
}

/// Driver kind, mirroring [`crate::transaction::Owner`] at the operation
/// granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Archive,
    Extract,
    List,
    Delete,
    DeleteOrchestration,
    Cull,
}

/// A driver instance: a start function, an optional completion function,
/// and the argument pouch carrying both caller inputs and resume state.
pub struct Operation {
    pub kind: OperationKind,
    pub state: FileState,
    pub args: OperationArgs,
    pub start: StartFn,
    pub on_complete: Option<OnCompleteFn>,
}

impl Operation {
    #[must_use]
    pub const fn new(kind: OperationKind, args: OperationArgs, start: StartFn) -> Self {
        Self {
            kind,
            state: FileState::Starting,
            args,
            start,
            on_complete: None,
        }
    }

    #[must_use]
    pub fn with_on_complete(mut self, on_complete: OnCompleteFn) -> Self {
        self.on_complete = Some(on_complete);
        self
    }

    /// Invokes the driver's start function, then its completion callback if
    /// this resume reached [`FileState::Finished`] for the first time.
    pub fn resume(&mut self, cx: &mut EngineCx) -> CtResult<()> {
        (self.start)(&mut self.args, &mut self.state, cx)?;
        if self.state.is_finished() {
            if let Some(on_complete) = self.on_complete.take() {
                on_complete(&mut self.args, cx)?;
            }
        }
        Ok(())
    }
}

/// FIFO of operations; exactly one is "current" at a time. Completion
/// callbacks may enqueue follow-ups either at the tail
/// ([`OperationQueue::push_back`]) or immediately after the current
/// operation ([`OperationQueue::push_after_current`]), used to splice
/// prerequisite work in front of a consumer.
#[derive(Default)]
pub struct OperationQueue {
    current: Option<Operation>,
    pending: VecDeque<Operation>,
}

impl OperationQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, op: Operation) {
        self.pending.push_back(op);
    }

    /// Splices `op` so it runs immediately after the current operation
    /// finishes, ahead of everything already queued.
    pub fn push_after_current(&mut self, op: Operation) {
        self.pending.push_front(op);
    }

    #[must_use]
    pub fn current(&self) -> Option<&Operation> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn current_mut(&mut self) -> Option<&mut Operation> {
        self.current.as_mut()
    }

    /// If there is no current operation and the queue is non-empty, makes
    /// the head of the queue current. Returns whether an operation is now
    /// current.
    pub fn ensure_current(&mut self) -> bool {
        if self.current.is_none() {
            self.current = self.pending.pop_front();
        }
        self.current.is_some()
    }

    /// Drops the current operation if it has reached
    /// [`FileState::Finished`], making room for the next `ensure_current`
    /// call to promote the next pending operation.
    pub fn retire_finished_current(&mut self) {
        if matches!(&self.current, Some(op) if op.state.is_finished()) {
            self.current = None;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Matches the canonical `YYYYMMDD-HHMMSS-*` ctfile name form; re-exported
/// here for drivers that only need the predicate, not the compiled pattern.
#[must_use]
pub fn is_ctfile_name(name: &str) -> bool {
    ALL_CTFILES_PATTERN.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_support::FakeCollaborators;
    use crate::transaction::TransactionPool;

    struct NullTransport;
    impl Transport for NullTransport {
        fn send(&mut self, _header: crate::transport::Header, _body: &[u8]) -> CtResult<()> {
            Ok(())
        }
        fn send_polled(
            &mut self,
            header: crate::transport::Header,
            _body: &[u8],
            _timeout: std::time::Duration,
        ) -> CtResult<(crate::transport::Header, Vec<u8>)> {
            Ok((header, Vec::new()))
        }
    }

    fn immediately_finished(
        _args: &mut OperationArgs,
        state: &mut FileState,
        _cx: &mut EngineCx,
    ) -> CtResult<()> {
        *state = FileState::Finished;
        Ok(())
    }

    #[test]
    fn queue_processes_one_current_operation_at_a_time() {
        let mut queue = OperationQueue::new();
        assert!(!queue.ensure_current());

        queue.push_back(Operation::new(
            OperationKind::List,
            OperationArgs::new_list(),
            immediately_finished,
        ));
        queue.push_back(Operation::new(
            OperationKind::List,
            OperationArgs::new_list(),
            immediately_finished,
        ));

        assert!(queue.ensure_current());
        assert_eq!(queue.pending_len(), 1);

        let mut pool = TransactionPool::new(1);
        let mut transport = NullTransport;
        let mut collaborators = FakeCollaborators::default();
        let mut splice_after_current = Vec::new();
        let mut enqueue_tail = Vec::new();
        let mut cx = EngineCx {
            pool: &mut pool,
            transport: &mut transport,
            collaborators: &mut collaborators,
            splice_after_current: &mut splice_after_current,
            enqueue_tail: &mut enqueue_tail,
        };
        queue.current_mut().unwrap().resume(&mut cx).unwrap();
        assert!(queue.current().unwrap().state.is_finished());

        queue.retire_finished_current();
        assert!(queue.ensure_current());
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn push_after_current_runs_before_tail_queued_work() {
        let mut queue = OperationQueue::new();
        queue.push_back(Operation::new(
            OperationKind::List,
            OperationArgs::new_list(),
            immediately_finished,
        ));
        queue.ensure_current();

        let mut pool = TransactionPool::new(1);
        let mut transport = NullTransport;
        let mut collaborators = FakeCollaborators::default();
        let mut splice_after_current = Vec::new();
        let mut enqueue_tail = Vec::new();
        let mut cx = EngineCx {
            pool: &mut pool,
            transport: &mut transport,
            collaborators: &mut collaborators,
            splice_after_current: &mut splice_after_current,
            enqueue_tail: &mut enqueue_tail,
        };
        queue.current_mut().unwrap().resume(&mut cx).unwrap();

        queue.push_back(Operation::new(
            OperationKind::Delete,
            OperationArgs::new_delete("tail".to_owned()),
            immediately_finished,
        ));
        queue.push_after_current(Operation::new(
            OperationKind::Extract,
            OperationArgs::new_extract("spliced".to_owned(), PathBuf::from("/tmp/spliced")),
            immediately_finished,
        ));

        queue.retire_finished_current();
        queue.ensure_current();
        assert_eq!(queue.current().unwrap().kind, OperationKind::Extract);
    }
}
