//! Ctfile archive driver: streams a local ctfile to the server under a
//! remote name.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::dispatch::{PendingRequest, ReplyPayload};
use crate::drivers::round_trip;
use crate::error::{CtEngineError, CtResult};
use crate::fnode::{FileKind, FileNode};
use crate::naming;
use crate::operation::{ArchiveState, EngineCx, OperationArgs};
use crate::state::FileState;
use crate::transaction::Owner;
use crate::transport::{flags, Header, Opcode, POLLED_OPEN_TIMEOUT};
use crate::xml::{CloseRequest, OpenMode, OpenRequest};

/// Drives one resume of the archive operation. See [`ArchiveState`] for the
/// resume points.
///
/// # Errors
///
/// Returns [`CtEngineError::InvalidCtfileName`] if the remote name (supplied
/// or derived) fails [`naming::verify`], propagates any I/O failure opening
/// or reading the local file, and propagates pre-validation failures when
/// the source is itself a ctfile.
pub fn start(args: &mut OperationArgs, state: &mut FileState, cx: &mut EngineCx) -> CtResult<()> {
    let OperationArgs::Archive {
        local_path,
        remote_name,
        cleartext,
        is_ctfile,
        max_block_size,
        fnode,
        local_file,
        file_len,
        state: driver_state,
    } = args
    else {
        return Err(CtEngineError::Protocol("archive::start called with mismatched operation args".into()));
    };

    loop {
        match *driver_state {
            ArchiveState::Starting => {
                if *is_ctfile {
                    cx.collaborators
                        .ctfile_parser()
                        .for_each_record(local_path, &mut |_record| Ok(()))
                        .map_err(|err| {
                            CtEngineError::Protocol(format!(
                                "pre-validation of {} failed: {err}",
                                local_path.display()
                            ))
                        })?;
                }

                let file = File::open(&local_path)?;
                let len = file.metadata()?.len();
                *local_file = Some(file);
                *file_len = len;

                let resolved = match remote_name.take() {
                    Some(name) => {
                        naming::verify(&name)?;
                        name
                    }
                    None => {
                        let local_name = local_path.to_string_lossy().into_owned();
                        naming::derive_remote_name(&local_name, &naming::current_date_time_prefix())?
                    }
                };
                *remote_name = Some(resolved.clone());
                *fnode = Some(FileNode::new(
                    resolved,
                    local_path.to_string_lossy().into_owned(),
                    0o644,
                    0,
                    0,
                    SystemTime::now(),
                    FileKind::Regular,
                ));

                *driver_state = ArchiveState::AwaitingOpen;
            }

            ArchiveState::AwaitingOpen => {
                *state = FileState::WaitingServer;
                let Some(mut txn) = cx.pool.acquire(Owner::Archive) else {
                    *state = FileState::WaitingTrans;
                    return Ok(());
                };

                let open_req = OpenRequest {
                    file: remote_name.clone().expect("resolved during Starting"),
                    mode: OpenMode::Write,
                    chunkno: 0,
                };
                let payload = round_trip(cx.transport, txn.id(), PendingRequest::Open, &open_req, &mut txn);
                cx.pool.release(txn);
                let ReplyPayload::Open(reply) = payload? else {
                    return Err(CtEngineError::Protocol("expected open-reply for archive open".into()));
                };
                *remote_name = Some(reply.file);
                *state = FileState::Running;
                *driver_state = ArchiveState::Streaming { chunk_no: 0, offset: 0 };
            }

            ArchiveState::Streaming { chunk_no, offset } => {
                *state = FileState::Running;
                if offset >= *file_len {
                    *driver_state = ArchiveState::Closing;
                    continue;
                }

                let Some(mut txn) = cx.pool.acquire(Owner::Archive) else {
                    *state = FileState::WaitingTrans;
                    return Ok(());
                };

                let file = local_file.as_mut().expect("opened during Starting");
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; *max_block_size];
                let read = file.read(&mut buf)?;
                buf.truncate(read);

                if read == 0 {
                    // The source shrank mid-stream relative to the length we
                    // observed in Starting. Log and terminate cleanly rather
                    // than fail the operation; the server ends up with a
                    // short manifest, which is the caller's responsibility
                    // to notice.
                    warn!(path = %local_path.display(), "archive source file shrank mid-stream, closing early");
                    cx.pool.release(txn);
                    *driver_state = ArchiveState::Closing;
                    continue;
                }

                let new_offset = offset + read as u64;
                let is_eof = new_offset >= *file_len;

                let mut header_flags = flags::METADATA;
                if !*cleartext {
                    header_flags |= flags::ENCRYPTED;
                }
                txn.chunk_no = chunk_no;
                txn.eof = is_eof;
                txn.set_active_data(&buf);
                txn.fnode = fnode.as_ref().map(FileNode::acquire);
                txn.cleanup = Some(crate::drivers::release_fnode_ref);

                let header = Header {
                    opcode: Opcode::WriteChunk as u8,
                    flags: header_flags,
                    tag: txn.id(),
                    body_size: buf.len() as u32,
                    ..Header::default()
                };
                let result = cx.transport.send_polled(header, &buf, POLLED_OPEN_TIMEOUT);
                cx.pool.release(txn);
                let (reply_header, _) = result?;
                if reply_header.is_error() {
                    return Err(CtEngineError::CantOpenRemote(
                        remote_name.clone().unwrap_or_default(),
                    ));
                }

                debug!(chunk_no, read, is_eof, "archive chunk sent");

                if is_eof {
                    // Release the driver's own fnode reference, distinct
                    // from the one each chunk's transaction just released
                    // via its cleanup callback above.
                    if let Some(node) = fnode.take() {
                        node.release();
                    }
                    *driver_state = ArchiveState::Closing;
                } else {
                    *driver_state = ArchiveState::Streaming {
                        chunk_no: chunk_no + 1,
                        offset: new_offset,
                    };
                }
            }

            ArchiveState::Closing => {
                let Some(mut txn) = cx.pool.acquire(Owner::Archive) else {
                    *state = FileState::WaitingTrans;
                    return Ok(());
                };
                txn.eof = true;
                let payload = round_trip(cx.transport, txn.id(), PendingRequest::Close, &CloseRequest, &mut txn);
                cx.pool.release(txn);
                let ReplyPayload::Close(_) = payload? else {
                    return Err(CtEngineError::Protocol("expected close-reply for archive close".into()));
                };

                *driver_state = ArchiveState::Done;
                *state = FileState::Finished;
                return Ok(());
            }

            ArchiveState::Done => {
                *state = FileState::Finished;
                return Ok(());
            }
        }
    }
}
