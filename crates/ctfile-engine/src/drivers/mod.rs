//! Driver implementations: the resumable state machines that sit on top of
//! [`crate::operation`], [`crate::transaction`], and [`crate::xml`] to
//! implement the ctfile archive/extract protocol, listing, deletion, and
//! cull.
//!
//! Most control messages (open, list, delete, cull-setup/shas/complete) are
//! single request/reply pairs with nothing else in flight, so those drivers
//! issue them through [`round_trip`], a blocking helper built on
//! [`crate::transport::Transport::send_polled`]. The extract driver's reads
//! are different: spec.md §4.4 defines EOF as an error status on an
//! outstanding read, which only makes sense if more than one read can be
//! outstanding at once — otherwise a straggler reply arriving after EOF has
//! no way to be told apart from a second, fatal failure. `drivers::extract`
//! pipelines its reads and the close they trigger through
//! [`crate::transport::Transport::send`]/`poll_reply` instead, genuinely
//! suspending across scheduler ticks so out-of-order reply reconciliation
//! is possible to implement and test (see the S3 straggler-reconciliation
//! test in `drivers::extract`'s own test module).

pub mod archive;
pub mod cull;
pub mod delete;
pub mod extract;
pub mod list;

use crate::dispatch::{self, PendingRequest, ReplyPayload};
use crate::error::{CtEngineError, CtResult};
use crate::transaction::Transaction;
use crate::transport::{Header, Opcode, Transport, POLLED_OPEN_TIMEOUT};
use crate::xml;

/// Marshals `request`, sends it as an XML control message, and dispatches
/// the reply against `transaction`, advancing its protocol state.
///
/// Shared by every driver that issues one of the five control messages:
/// open, close, list, delete, cull-setup/shas/complete.
pub(crate) fn round_trip<T: serde::Serialize>(
    transport: &mut dyn Transport,
    tag: u64,
    pending: PendingRequest,
    request: &T,
    transaction: &mut Transaction,
) -> CtResult<ReplyPayload> {
    let body = xml::marshal(request)?;
    let header = Header {
        opcode: Opcode::XmlOpen as u8,
        tag,
        body_size: body.len() as u32,
        ..Header::default()
    };
    let (reply_header, reply_body) = transport.send_polled(header, body.as_bytes(), POLLED_OPEN_TIMEOUT)?;
    if reply_header.is_error() {
        transaction.error_code = Some(u32::from(reply_header.status));
    }
    let reply_str = std::str::from_utf8(&reply_body)
        .map_err(|err| CtEngineError::Protocol(format!("reply body not valid utf-8: {err}")))?;
    dispatch::dispatch(pending, reply_str, transaction)
}

/// Transaction cleanup callback that releases a carried fnode reference
/// exactly once.
pub(crate) fn release_fnode_ref(transaction: &mut Transaction) {
    if let Some(node) = transaction.fnode.take() {
        node.release();
    }
}
