//! Cull orchestration: resolves which ctfiles are still reachable from
//! retention, splices deletes for the rest, then streams the surviving
//! SHA set to the server so it can garbage-collect unreferenced chunks.

use tracing::{debug, info, warn};

use crate::collaborators::CtfileRecord;
use crate::dispatch::{PendingRequest, ReplyPayload};
use crate::drivers::{extract, list, round_trip};
use crate::error::{CtEngineError, CtResult};
use crate::naming;
use crate::operation::{CullState, EngineCx, Operation, OperationArgs, OperationKind};
use crate::sha::ShaDigest;
use crate::state::FileState;
use crate::transaction::Owner;
use crate::xml::{CullCompleteMode, CullCompleteRequest, CullSetupMode, CullSetupRequest, CullShasRequest, ListRequest};

/// Maximum number of predecessor hops walked before declaring a cycle.
fn max_hops(file_count: usize) -> usize {
    file_count.saturating_add(1)
}

/// Drives one resume of the cull operation. See [`CullState`] for the
/// resume points.
///
/// # Errors
///
/// Returns [`CtEngineError::CullEverything`] if the retention cutoff would
/// retain nothing, [`CtEngineError::DependencyCycle`] if a predecessor walk
/// loops without reaching a root, and propagates protocol/I/O errors from
/// the listing, fetch, and cull-setup/shas/complete round trips.
pub fn start(args: &mut OperationArgs, state: &mut FileState, cx: &mut EngineCx) -> CtResult<()> {
    let OperationArgs::Cull {
        keep_days,
        sha_per_packet,
        cull_uuid,
        all_files,
        deleted_files,
        live_shas,
        state: driver_state,
    } = args
    else {
        return Err(CtEngineError::Protocol("cull::start called with mismatched operation args".into()));
    };

    loop {
        match *driver_state {
            CullState::Starting => {
                *cull_uuid = rand::random();
                cx.collaborators.chunk_db().cull_start()?;
                *driver_state = CullState::Listing;
            }

            CullState::Listing => {
                *state = FileState::WaitingServer;
                let Some(mut txn) = cx.pool.acquire(Owner::Cull) else {
                    *state = FileState::WaitingTrans;
                    return Ok(());
                };
                let payload = round_trip(cx.transport, txn.id(), PendingRequest::List, &ListRequest, &mut txn);
                cx.pool.release(txn);
                let ReplyPayload::List(reply) = payload? else {
                    return Err(CtEngineError::Protocol("expected list-reply during cull".into()));
                };
                *all_files = list::all_ctfiles(reply.names);
                *state = FileState::Running;
                *driver_state = CullState::Collecting;
            }

            CullState::Collecting => {
                for name in all_files.iter() {
                    if cx.collaborators.cache_dir().contains(name) {
                        continue;
                    }
                    let dest = cx.collaborators.cache_dir().path_for(name)?;
                    debug!(file = %name, "fetching ctfile into cache for cull");
                    extract::fetch_blocking(name, &dest, cx)?;
                }
                *driver_state = CullState::WalkingDependencies;
            }

            CullState::WalkingDependencies => {
                let cutoff = naming::cutoff_prefix(*keep_days);
                let mut keep: Vec<String> = all_files
                    .iter()
                    .filter(|name| naming::split_prefix(name).is_some_and(|(prefix, _)| prefix >= cutoff.as_str()))
                    .cloned()
                    .collect();

                let limit = max_hops(all_files.len());
                let mut frontier = keep.clone();
                let mut hops = 0usize;
                while !frontier.is_empty() {
                    hops += 1;
                    if hops > limit {
                        return Err(CtEngineError::DependencyCycle(limit));
                    }
                    let mut next_frontier = Vec::new();
                    for name in &frontier {
                        let path = cx.collaborators.cache_dir().path_for(name)?;
                        if let Some(predecessor) = cx.collaborators.ctfile_parser().predecessor(&path)? {
                            if !keep.contains(&predecessor) && all_files.contains(&predecessor) {
                                warn!(ctfile = predecessor.as_str(), dependent = name.as_str(), "ctfile older than cutoff still referenced, forced to keep");
                                keep.push(predecessor.clone());
                                next_frontier.push(predecessor);
                            }
                        }
                    }
                    frontier = next_frontier;
                }

                *deleted_files = all_files.iter().filter(|name| !keep.contains(name)).cloned().collect();
                if !all_files.is_empty() && keep.is_empty() {
                    return Err(CtEngineError::CullEverything);
                }

                for file in deleted_files.iter().cloned() {
                    cx.splice_after_current.push(Operation::new(
                        OperationKind::Delete,
                        OperationArgs::new_delete(file),
                        crate::drivers::delete::start,
                    ));
                }

                info!(kept = keep.len(), deleted = deleted_files.len(), "cull retention resolved");
                *driver_state = CullState::AwaitingSetup;
            }

            CullState::AwaitingSetup => {
                *state = FileState::WaitingServer;
                let Some(mut txn) = cx.pool.acquire(Owner::Cull) else {
                    *state = FileState::WaitingTrans;
                    return Ok(());
                };
                let request = CullSetupRequest {
                    uuid: *cull_uuid,
                    mode: CullSetupMode::Precious,
                };
                let payload = round_trip(cx.transport, txn.id(), PendingRequest::CullSetup, &request, &mut txn);
                cx.pool.release(txn);
                let ReplyPayload::CullSetup(reply) = payload? else {
                    return Err(CtEngineError::Protocol("expected cull-setup-reply during cull".into()));
                };
                *cull_uuid = reply.uuid;
                *state = FileState::Running;
                *driver_state = CullState::StreamingShas;
            }

            CullState::StreamingShas => {
                let keep: Vec<String> = all_files.iter().filter(|name| !deleted_files.contains(name)).cloned().collect();
                for name in &keep {
                    let path = cx.collaborators.cache_dir().path_for(name)?;
                    let mut digests = Vec::new();
                    cx.collaborators.ctfile_parser().for_each_record(&path, &mut |record| {
                        if let CtfileRecord::Sha(sha) = record {
                            digests.push(sha.digest);
                        }
                        Ok(())
                    })?;
                    for digest in digests {
                        live_shas.insert(digest);
                        cx.collaborators.chunk_db().cull_mark(digest)?;
                    }
                }

                let uuid = *cull_uuid;
                let packet_size = (*sha_per_packet).max(1);
                let transport = &mut *cx.transport;
                let pool = &mut *cx.pool;
                live_shas.drain_in_batches(packet_size, |batch, is_last| -> CtResult<()> {
                    send_sha_batch(pool, transport, uuid, batch, is_last)
                })?;

                *state = FileState::Running;
                *driver_state = CullState::AwaitingComplete;
            }

            CullState::AwaitingComplete => {
                *state = FileState::WaitingServer;
                let Some(mut txn) = cx.pool.acquire(Owner::Cull) else {
                    *state = FileState::WaitingTrans;
                    return Ok(());
                };
                let request = CullCompleteRequest {
                    uuid: *cull_uuid,
                    mode: CullCompleteMode::Process,
                };
                let payload = round_trip(cx.transport, txn.id(), PendingRequest::CullComplete, &request, &mut txn);
                cx.pool.release(txn);
                let ReplyPayload::CullComplete(reply) = payload? else {
                    return Err(CtEngineError::Protocol("expected cull-complete-reply during cull".into()));
                };
                cx.collaborators.chunk_db().cull_end(reply.generation)?;
                info!(generation = reply.generation, shas = live_shas.len(), "cull generation committed");

                *driver_state = CullState::Done;
                *state = FileState::Finished;
                return Ok(());
            }

            CullState::Done => {
                *state = FileState::Finished;
                return Ok(());
            }
        }
    }
}

fn send_sha_batch(
    pool: &mut crate::transaction::TransactionPool,
    transport: &mut dyn crate::transport::Transport,
    uuid: u64,
    batch: &[ShaDigest],
    is_last: bool,
) -> CtResult<()> {
    let Some(mut txn) = pool.acquire(Owner::Cull) else {
        return Err(CtEngineError::Protocol("transaction pool exhausted streaming cull shas".into()));
    };
    txn.eof = is_last;
    let request = CullShasRequest::from_digests(uuid, batch, is_last);
    let result = round_trip(transport, txn.id(), PendingRequest::CullShas, &request, &mut txn);
    pool.release(txn);
    let ReplyPayload::CullShas(_) = result? else {
        return Err(CtEngineError::Protocol("expected cull-shas-reply during cull".into()));
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::collaborators::test_support::FakeCollaborators;
    use crate::collaborators::{CtfileRecord, CtfileShaRecord};
    use crate::transaction::TransactionPool;
    use crate::transport::{Header, Status, Transport};
    use crate::xml::{self, CullCompleteReply, CullSetupReply};

    struct ScriptedTransport {
        names: Vec<String>,
        pub cull_shas_batches: Vec<usize>,
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
                return Ok((Header { status: Status::Ok as u8, ..header }, Vec::new()));
            }
            let body_str = std::str::from_utf8(body).unwrap_or_default();
            let reply = if body_str.starts_with("<list") {
                xml::marshal(&xml::ListReply { names: self.names.clone() }).unwrap()
            } else if body_str.starts_with("<open") {
                xml::marshal(&xml::OpenReply { file: "cached".to_owned() }).unwrap()
            } else if body_str.starts_with("<close") {
                xml::marshal(&xml::CloseReply).unwrap()
            } else if body_str.starts_with("<cull-setup") {
                xml::marshal(&CullSetupReply { uuid: 99 }).unwrap()
            } else if body_str.starts_with("<cull-shas") {
                let req: CullShasRequest = xml::unmarshal(body_str).unwrap();
                self.cull_shas_batches.push(req.shas.len());
                xml::marshal(&xml::CullShasReply { uuid: req.uuid }).unwrap()
            } else {
                xml::marshal(&CullCompleteReply { uuid: 99, generation: 7 }).unwrap()
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

    fn run_cull(keep_days: u32, sha_per_packet: usize, names: Vec<String>) -> (OperationArgs, FileState, Vec<Operation>, CtResult<()>, ScriptedTransport) {
        let mut args = OperationArgs::new_cull(keep_days, sha_per_packet);
        let mut state = FileState::Starting;
        let mut pool = TransactionPool::new(4);
        let mut transport = ScriptedTransport { names, cull_shas_batches: Vec::new() };
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
            start(&mut args, &mut state, &mut cx)
        };
        (args, state, splice_after_current, result, transport)
    }

    #[test]
    fn recent_file_within_retention_is_kept() {
        let prefix = naming::current_date_time_prefix();
        let (args, state, spliced, result, _transport) = run_cull(30, 1024, vec![format!("{prefix}-a")]);
        result.unwrap();
        assert!(state.is_finished());
        assert!(spliced.is_empty());
        let OperationArgs::Cull { deleted_files, .. } = args else { unreachable!() };
        assert!(deleted_files.is_empty());
    }

    #[test]
    fn cull_everything_is_rejected() {
        let (_args, _state, _spliced, result, _transport) = run_cull(0, 1024, vec!["19990101-000000-ancient".to_owned()]);
        assert!(matches!(result.unwrap_err(), CtEngineError::CullEverything));
    }

    #[test]
    fn stale_file_with_no_dependents_is_spliced_for_delete() {
        let (args, state, spliced, result, _transport) = run_cull(
            1,
            1024,
            vec!["19990101-000000-ancient".to_owned(), naming::current_date_time_prefix() + "-recent"],
        );
        result.unwrap();
        assert!(state.is_finished());
        assert_eq!(spliced.len(), 1);
        let OperationArgs::Delete { file } = &spliced[0].args else { unreachable!() };
        assert_eq!(file, "19990101-000000-ancient");
        let OperationArgs::Cull { deleted_files, .. } = args else { unreachable!() };
        assert_eq!(deleted_files, vec!["19990101-000000-ancient".to_owned()]);
    }

    #[test]
    fn stale_predecessor_of_kept_file_is_retained() {
        let recent = naming::current_date_time_prefix() + "-recent";
        let ancient = "19990101-000000-ancient".to_owned();
        let mut args = OperationArgs::new_cull(1, 1024);
        let mut state = FileState::Starting;
        let mut pool = TransactionPool::new(4);
        let mut transport = ScriptedTransport {
            names: vec![ancient.clone(), recent.clone()],
            cull_shas_batches: Vec::new(),
        };
        let mut collaborators = FakeCollaborators::default();
        collaborators
            .ctfile_parser
            .predecessors
            .insert(PathBuf::from(format!("/tmp/ctfile-cache/{recent}")), ancient.clone());
        let mut splice_after_current = Vec::new();
        let mut enqueue_tail = Vec::new();
        let mut cx = EngineCx {
            pool: &mut pool,
            transport: &mut transport,
            collaborators: &mut collaborators,
            splice_after_current: &mut splice_after_current,
            enqueue_tail: &mut enqueue_tail,
        };
        start(&mut args, &mut state, &mut cx).unwrap();

        assert!(splice_after_current.is_empty(), "ancient predecessor must not be scheduled for deletion");
        let OperationArgs::Cull { deleted_files, .. } = args else { unreachable!() };
        assert!(deleted_files.is_empty());
    }

    #[test]
    fn sha_records_are_streamed_and_generation_committed() {
        let prefix = naming::current_date_time_prefix();
        let name = format!("{prefix}-a");
        let mut args = OperationArgs::new_cull(30, 2);
        let mut state = FileState::Starting;
        let mut pool = TransactionPool::new(4);
        let mut transport = ScriptedTransport { names: vec![name.clone()], cull_shas_batches: Vec::new() };
        let mut collaborators = FakeCollaborators::default();
        collaborators.ctfile_parser.records.insert(
            PathBuf::from(format!("/tmp/ctfile-cache/{name}")),
            vec![
                CtfileRecord::Sha(CtfileShaRecord { digest: ShaDigest::from_bytes([1; 32]), is_crypto: false }),
                CtfileRecord::Sha(CtfileShaRecord { digest: ShaDigest::from_bytes([2; 32]), is_crypto: false }),
                CtfileRecord::Sha(CtfileShaRecord { digest: ShaDigest::from_bytes([3; 32]), is_crypto: false }),
            ],
        );
        let mut splice_after_current = Vec::new();
        let mut enqueue_tail = Vec::new();
        let mut cx = EngineCx {
            pool: &mut pool,
            transport: &mut transport,
            collaborators: &mut collaborators,
            splice_after_current: &mut splice_after_current,
            enqueue_tail: &mut enqueue_tail,
        };
        start(&mut args, &mut state, &mut cx).unwrap();

        assert!(state.is_finished());
        let OperationArgs::Cull { live_shas, .. } = &args else { unreachable!() };
        assert_eq!(live_shas.len(), 3);
        assert_eq!(collaborators.chunk_db.marked.len(), 3);
        assert!(collaborators.chunk_db.ended);
        assert_eq!(collaborators.chunk_db.generation, 7);
        assert_eq!(transport.cull_shas_batches, vec![2, 1]);
    }
}
