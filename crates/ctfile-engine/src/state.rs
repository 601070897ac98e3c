//! Per-operation file-state signal driving the cooperative scheduler.

use std::fmt;

/// Resume point of the currently running [`crate::operation::Operation`].
///
/// The scheduler inspects this value after every wakeup and re-invokes the
/// operation's start function only when the state says progress is possible.
/// `RUNNING` and `WAITING_TRANS`/`WAITING_SERVER` may alternate any number of
/// times before the driver reaches `FINISHED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileState {
    /// First entry: allocate private state, open local resources, validate
    /// arguments.
    #[default]
    Starting,
    /// Steady state; the driver may acquire and queue transactions.
    Running,
    /// Transaction pool exhausted; scheduler resumes this operation the next
    /// time a transaction is released.
    WaitingTrans,
    /// An outstanding control message (xml-open, cull-setup, ...) has been
    /// issued; scheduler resumes this operation when its reply arrives.
    WaitingServer,
    /// Terminal: the driver has queued its last transaction.
    Finished,
}

impl FileState {
    /// True once the operation has reached its terminal state.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Finished)
    }

    /// True when the operation is parked waiting on a pool slot or a server
    /// reply, i.e. it should not be polled again until explicitly woken.
    #[must_use]
    pub const fn is_waiting(self) -> bool {
        matches!(self, Self::WaitingTrans | Self::WaitingServer)
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::WaitingTrans => "WAITING_TRANS",
            Self::WaitingServer => "WAITING_SERVER",
            Self::Finished => "FINISHED",
        };
        f.write_str(label)
    }
}
