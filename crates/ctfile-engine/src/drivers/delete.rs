//! Single-file delete driver and the delete orchestration that resolves a
//! match pattern to a safe set of files to remove.

use std::path::PathBuf;

use regex::Regex;
use tracing::{debug, info};

use crate::dispatch::{PendingRequest, ReplyPayload};
use crate::drivers::{extract, list, round_trip};
use crate::error::{CtEngineError, CtResult};
use crate::operation::{DeleteOrchestrationState, EngineCx, Operation, OperationArgs, OperationKind};
use crate::state::FileState;
use crate::transaction::Owner;
use crate::xml::{self, DeleteRequest, ListRequest};

/// Drives one resume of a single-file delete. No resumable sub-state: one
/// round trip either completes or parks on [`FileState::WaitingTrans`].
///
/// # Errors
///
/// Propagates a protocol error if the server's reply isn't a `delete-reply`.
pub fn start(args: &mut OperationArgs, state: &mut FileState, cx: &mut EngineCx) -> CtResult<()> {
    let OperationArgs::Delete { file } = args else {
        return Err(CtEngineError::Protocol("delete::start called with mismatched operation args".into()));
    };

    if state.is_finished() {
        return Ok(());
    }

    *state = FileState::WaitingServer;
    let Some(mut txn) = cx.pool.acquire(Owner::Delete) else {
        *state = FileState::WaitingTrans;
        return Ok(());
    };

    let request = DeleteRequest { file: file.clone() };
    let payload = round_trip(cx.transport, txn.id(), PendingRequest::Delete, &request, &mut txn);
    cx.pool.release(txn);
    let ReplyPayload::Delete(reply) = payload? else {
        return Err(CtEngineError::Protocol("expected delete-reply for delete operation".into()));
    };

    info!(file = %reply.file, "ctfile deleted");
    *state = FileState::Finished;
    Ok(())
}

/// Builds a matcher from a caller-supplied delete pattern: `*` stands for
/// "any run of characters", every other character (including regex
/// metacharacters) is literal.
fn pattern_matcher(pattern: &str) -> CtResult<Regex> {
    let mut escaped = String::with_capacity(pattern.len() + 2);
    escaped.push('^');
    for part in pattern.split('*') {
        if !escaped.ends_with('^') {
            escaped.push_str(".*");
        }
        escaped.push_str(&regex::escape(part));
    }
    escaped.push('$');
    Regex::new(&escaped).map_err(|err| CtEngineError::Protocol(format!("invalid delete pattern {pattern:?}: {err}")))
}

/// Drives one resume of the delete orchestration. See
/// [`DeleteOrchestrationState`] for the resume points.
///
/// # Errors
///
/// Returns [`CtEngineError::NothingToDelete`] if `pattern` selects no
/// ctfiles, or [`CtEngineError::CanNotDelete`] if a retained ctfile's
/// predecessor would be deleted.
pub fn start_orchestration(args: &mut OperationArgs, state: &mut FileState, cx: &mut EngineCx) -> CtResult<()> {
    let OperationArgs::DeleteOrchestration {
        pattern,
        all_files,
        delete_files,
        state: driver_state,
    } = args
    else {
        return Err(CtEngineError::Protocol("delete::start_orchestration called with mismatched operation args".into()));
    };

    loop {
        match *driver_state {
            DeleteOrchestrationState::Starting => {
                *driver_state = DeleteOrchestrationState::Listing;
            }

            DeleteOrchestrationState::Listing => {
                *state = FileState::WaitingServer;
                let Some(mut txn) = cx.pool.acquire(Owner::List) else {
                    *state = FileState::WaitingTrans;
                    return Ok(());
                };
                let payload = round_trip(cx.transport, txn.id(), PendingRequest::List, &ListRequest, &mut txn);
                cx.pool.release(txn);
                let ReplyPayload::List(reply) = payload? else {
                    return Err(CtEngineError::Protocol("expected list-reply during delete orchestration".into()));
                };
                *all_files = list::all_ctfiles(reply.names);

                let matcher = pattern_matcher(pattern)?;
                *delete_files = all_files.iter().filter(|name| matcher.is_match(name)).cloned().collect();
                if delete_files.is_empty() {
                    return Err(CtEngineError::NothingToDelete);
                }

                *driver_state = DeleteOrchestrationState::FetchingMissing;
            }

            DeleteOrchestrationState::FetchingMissing => {
                let retained: Vec<String> = all_files.iter().filter(|name| !delete_files.contains(name)).cloned().collect();
                for name in &retained {
                    if cx.collaborators.cache_dir().contains(name) {
                        continue;
                    }
                    let dest = cx.collaborators.cache_dir().path_for(name)?;
                    debug!(file = %name, "fetching retained ctfile into cache for dependency check");
                    extract::fetch_blocking(name, &dest, cx)?;
                }
                *driver_state = DeleteOrchestrationState::CheckingDependencies;
            }

            DeleteOrchestrationState::CheckingDependencies => {
                let retained: Vec<String> = all_files.iter().filter(|name| !delete_files.contains(name)).cloned().collect();
                for name in &retained {
                    let path = cx.collaborators.cache_dir().path_for(name)?;
                    if let Some(predecessor) = cx.collaborators.ctfile_parser().predecessor(&path)? {
                        if delete_files.contains(&predecessor) {
                            return Err(CtEngineError::CanNotDelete(predecessor));
                        }
                    }
                }
                *driver_state = DeleteOrchestrationState::SchedulingDeletes;
            }

            DeleteOrchestrationState::SchedulingDeletes => {
                for file in delete_files.iter().cloned() {
                    cx.splice_after_current.push(Operation::new(
                        OperationKind::Delete,
                        OperationArgs::new_delete(file),
                        start,
                    ));
                }
                *driver_state = DeleteOrchestrationState::Done;
                *state = FileState::Finished;
                return Ok(());
            }

            DeleteOrchestrationState::Done => {
                *state = FileState::Finished;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_support::FakeCollaborators;
    use crate::transaction::TransactionPool;
    use crate::transport::{Header, Status, Transport};
    use crate::xml::{CloseReply, DeleteReply, ListReply, OpenReply};

    struct ScriptedTransport {
        names: Vec<String>,
    }

    impl Transport for ScriptedTransport {
        fn send(&mut self, _header: Header, _body: &[u8]) -> CtResult<()> {
            Ok(())
        }

        fn send_polled(
            &mut self,
            header: Header,
            body: &[u8],
            _timeout: std::time::Duration,
        ) -> CtResult<(Header, Vec<u8>)> {
            if header.opcode == crate::transport::Opcode::ReadChunk as u8 {
                // Every retained ctfile fetched during dependency checking is
                // treated as already empty on the wire, so the synchronous
                // fetch loop terminates after its first request.
                return Ok((Header { status: Status::Ok as u8, ..header }, Vec::new()));
            }
            let body_str = std::str::from_utf8(body).unwrap_or_default();
            let reply = if body_str.starts_with("<list") {
                xml::marshal(&ListReply { names: self.names.clone() }).unwrap()
            } else if body_str.starts_with("<open") {
                xml::marshal(&OpenReply { file: "cached".to_owned() }).unwrap()
            } else if body_str.starts_with("<delete") {
                xml::marshal(&DeleteReply { file: "deleted".to_owned() }).unwrap()
            } else {
                xml::marshal(&CloseReply).unwrap()
            };
            Ok((
                Header {
                    status: Status::Ok as u8,
                    body_size: reply.len() as u32,
                    ..header
                },
                reply.into_bytes(),
            ))
        }
    }

    fn run_orchestration(pattern: &str, names: Vec<String>) -> (FileState, Vec<Operation>, CtResult<()>) {
        let mut args = OperationArgs::new_delete_orchestration(pattern.to_owned());
        let mut state = FileState::Starting;
        let mut pool = TransactionPool::new(4);
        let mut transport = ScriptedTransport { names };
        let mut collaborators = FakeCollaborators::default();
        let mut splice_after_current = Vec::new();
        let mut enqueue_tail = Vec::new();
        let result = {
            let mut cx = EngineCx {
                pool: &mut pool,
                transport: &mut transport,
                collaborators: &mut collaborators,
                splice_after_current: &mut splice_after_current,
                enqueue_tail: &mut enqueue_tail,
            };
            start_orchestration(&mut args, &mut state, &mut cx)
        };
        (state, splice_after_current, result)
    }

    #[test]
    fn exact_pattern_splices_one_delete() {
        let (state, spliced, result) = run_orchestration(
            "20240101-000000-a",
            vec!["20240101-000000-a".to_owned(), "20240102-000000-b".to_owned()],
        );
        result.unwrap();
        assert!(state.is_finished());
        assert_eq!(spliced.len(), 1);
        let OperationArgs::Delete { file } = &spliced[0].args else { unreachable!() };
        assert_eq!(file, "20240101-000000-a");
    }

    #[test]
    fn wildcard_pattern_matches_prefix() {
        let (_, spliced, result) = run_orchestration(
            "20240101-*",
            vec!["20240101-000000-a".to_owned(), "20240101-010000-b".to_owned(), "20240102-000000-c".to_owned()],
        );
        result.unwrap();
        assert_eq!(spliced.len(), 2);
    }

    #[test]
    fn empty_match_is_nothing_to_delete() {
        let (_, _, result) = run_orchestration("no-such-file", vec!["20240101-000000-a".to_owned()]);
        assert!(matches!(result.unwrap_err(), CtEngineError::NothingToDelete));
    }

    #[test]
    fn retained_predecessor_of_deleted_file_is_rejected() {
        let all = vec!["20240101-000000-base".to_owned(), "20240102-000000-incr".to_owned()];
        let mut args = OperationArgs::new_delete_orchestration("20240101-000000-base".to_owned());
        let mut state = FileState::Starting;
        let mut pool = TransactionPool::new(4);
        let mut transport = ScriptedTransport { names: all };
        let mut collaborators = FakeCollaborators::default();
        collaborators
            .ctfile_parser
            .predecessors
            .insert(PathBuf::from("/tmp/ctfile-cache/20240102-000000-incr"), "20240101-000000-base".to_owned());
        let mut splice_after_current = Vec::new();
        let mut enqueue_tail = Vec::new();
        let mut cx = EngineCx {
            pool: &mut pool,
            transport: &mut transport,
            collaborators: &mut collaborators,
            splice_after_current: &mut splice_after_current,
            enqueue_tail: &mut enqueue_tail,
        };
        let err = start_orchestration(&mut args, &mut state, &mut cx).unwrap_err();
        assert!(matches!(err, CtEngineError::CanNotDelete(_)));
    }
}
