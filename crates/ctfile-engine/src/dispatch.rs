//! XML reply demultiplexer.
//!
//! On each inbound reply, the transport hands the originating transaction's
//! recorded [`PendingRequest`] and the raw XML body to [`dispatch`], which
//! picks the matching parser, advances the transaction's protocol state to
//! a terminal value, and returns the parsed reply.

use crate::error::{CtEngineError, CtResult};
use crate::transaction::{ProtocolState, Transaction};
use crate::xml::{self, CloseReply, CullCompleteReply, CullSetupReply, CullShasReply, DeleteReply, ListReply, OpenReply};

/// Which control message a transaction is awaiting a reply for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRequest {
    Open,
    Close,
    List,
    Delete,
    CullSetup,
    CullShas,
    CullComplete,
}

/// A parsed reply, tagged by which request it answers.
#[derive(Debug, Clone)]
pub enum ReplyPayload {
    Open(OpenReply),
    Close(CloseReply),
    List(ListReply),
    Delete(DeleteReply),
    CullSetup(CullSetupReply),
    CullShas(CullShasReply),
    CullComplete(CullCompleteReply),
}

/// Parses `body` per `pending`, updates `transaction.protocol_state` to the
/// matching terminal state, and returns the parsed reply.
///
/// # Errors
///
/// Returns [`CtEngineError::Protocol`] if `body` fails to parse as the
/// expected shape.
pub fn dispatch(pending: PendingRequest, body: &str, transaction: &mut Transaction) -> CtResult<ReplyPayload> {
    if transaction.error_code.is_some() {
        return Err(CtEngineError::Protocol(format!(
            "server returned error code {:?} for transaction {}",
            transaction.error_code,
            transaction.id()
        )));
    }

    let payload = match pending {
        PendingRequest::Open => {
            let reply: OpenReply = xml::unmarshal(body)?;
            transaction.remote_name = Some(reply.file.clone());
            transaction.protocol_state = ProtocolState::Opened;
            ReplyPayload::Open(reply)
        }
        PendingRequest::Close => {
            let reply: CloseReply = xml::unmarshal(body)?;
            transaction.protocol_state = ProtocolState::Closed;
            ReplyPayload::Close(reply)
        }
        PendingRequest::List => {
            let reply: ListReply = xml::unmarshal(body)?;
            transaction.protocol_state = ProtocolState::Done;
            ReplyPayload::List(reply)
        }
        PendingRequest::Delete => {
            let reply: DeleteReply = xml::unmarshal(body)?;
            transaction.remote_name = Some(reply.file.clone());
            transaction.protocol_state = ProtocolState::Done;
            ReplyPayload::Delete(reply)
        }
        PendingRequest::CullSetup => {
            let reply: CullSetupReply = xml::unmarshal(body)?;
            transaction.protocol_state = ProtocolState::Done;
            ReplyPayload::CullSetup(reply)
        }
        PendingRequest::CullShas => {
            let reply: CullShasReply = xml::unmarshal(body)?;
            // Non-final batches report CullReplied so the driver keeps
            // streaming; only the batch that carried EOF transitions to
            // Done.
            transaction.protocol_state = if transaction.eof {
                ProtocolState::Done
            } else {
                ProtocolState::CullReplied
            };
            ReplyPayload::CullShas(reply)
        }
        PendingRequest::CullComplete => {
            let reply: CullCompleteReply = xml::unmarshal(body)?;
            transaction.protocol_state = ProtocolState::Done;
            ReplyPayload::CullComplete(reply)
        }
    };

    Ok(payload)
}
