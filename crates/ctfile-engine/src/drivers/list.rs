//! Ctfile listing driver: a single `list` round trip,
//! plus the ctfile-name filter shared with delete and cull's "all known
//! ctfiles" sweep.

use crate::dispatch::{PendingRequest, ReplyPayload};
use crate::drivers::round_trip;
use crate::error::{CtEngineError, CtResult};
use crate::operation::{is_ctfile_name, EngineCx, OperationArgs};
use crate::state::FileState;
use crate::transaction::Owner;
use crate::xml::ListRequest;

/// Drives one resume of the list operation. Unlike archive/extract/cull,
/// listing has no resumable sub-state of its own: one round trip either
/// completes (synchronously, since every round trip in this engine blocks —
/// see [`crate::drivers`]) or parks on [`FileState::WaitingTrans`] waiting
/// for a pool slot.
///
/// # Errors
///
/// Propagates a protocol error if the server's reply isn't a `list-reply`.
pub fn start(args: &mut OperationArgs, state: &mut FileState, cx: &mut EngineCx) -> CtResult<()> {
    let OperationArgs::List { entries } = args else {
        return Err(CtEngineError::Protocol("list::start called with mismatched operation args".into()));
    };

    if state.is_finished() {
        return Ok(());
    }

    *state = FileState::WaitingServer;
    let Some(mut txn) = cx.pool.acquire(Owner::List) else {
        *state = FileState::WaitingTrans;
        return Ok(());
    };

    let payload = round_trip(cx.transport, txn.id(), PendingRequest::List, &ListRequest, &mut txn);
    cx.pool.release(txn);
    let ReplyPayload::List(reply) = payload? else {
        return Err(CtEngineError::Protocol("expected list-reply for list operation".into()));
    };

    *entries = reply.names;
    *state = FileState::Finished;
    Ok(())
}

/// Filters `entries` down to syntactically well-formed ctfile names,
/// discarding anything the server lists that doesn't match the
/// `YYYYMMDD-HHMMSS-<user>` grammar.
#[must_use]
pub fn all_ctfiles(entries: Vec<String>) -> Vec<String> {
    entries.into_iter().filter(|name| is_ctfile_name(name)).collect()
}
