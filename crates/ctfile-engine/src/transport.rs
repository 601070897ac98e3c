//! Wire framing: fixed-size header, opcodes, and the transport boundary
//! trait.
//!
//! The authenticated session itself (TLS/SSH handshake, reconnect policy) is
//! an external collaborator (see [`crate::collaborators`]); this module owns
//! only the bit-exact header shape and the blocking "polled open" used
//! during session establishment.

use std::time::Duration;

use crate::error::{CtEngineError, CtResult};

/// Operation codes carried in [`Header::opcode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    XmlOpen = 0,
    XmlReply = 1,
    WriteChunk = 2,
    ReadChunk = 3,
}

/// Status codes carried in [`Header::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Error = 1,
}

/// Bit flags carried in [`Header::flags`].
pub mod flags {
    pub const METADATA: u8 = 0b0000_0001;
    pub const ENCRYPTED: u8 = 0b0000_0010;
}

/// Extended status value used throughout this engine's metadata protocol.
pub const EX_STATUS_METADATA: u8 = 2;

/// Fixed-size header preceding every transport message body.
///
/// All multi-byte fields are big-endian ("network byte order") on the wire;
/// [`Header::encode`]/[`Header::decode`] perform that conversion explicitly —
/// there is no `#[repr(C)]` transmutation, keeping this module free of
/// `unsafe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub opcode: u8,
    pub status: u8,
    pub flags: u8,
    pub ex_status: u8,
    pub tag: u64,
    pub body_size: u32,
}

/// Byte length of an encoded [`Header`].
pub const HEADER_LEN: usize = 1 + 1 + 1 + 1 + 1 + 8 + 4;

impl Default for Header {
    fn default() -> Self {
        Self {
            version: 1,
            opcode: Opcode::XmlOpen as u8,
            status: Status::Ok as u8,
            flags: 0,
            ex_status: EX_STATUS_METADATA,
            tag: 0,
            body_size: 0,
        }
    }
}

impl Header {
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1] = self.opcode;
        out[2] = self.status;
        out[3] = self.flags;
        out[4] = self.ex_status;
        out[5..13].copy_from_slice(&self.tag.to_be_bytes());
        out[13..17].copy_from_slice(&self.body_size.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> CtResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(CtEngineError::Protocol(format!(
                "short header: got {} bytes, need {HEADER_LEN}",
                bytes.len()
            )));
        }
        Ok(Self {
            version: bytes[0],
            opcode: bytes[1],
            status: bytes[2],
            flags: bytes[3],
            ex_status: bytes[4],
            tag: u64::from_be_bytes(bytes[5..13].try_into().unwrap()),
            body_size: u32::from_be_bytes(bytes[13..17].try_into().unwrap()),
        })
    }

    #[must_use]
    pub const fn is_metadata(&self) -> bool {
        self.flags & flags::METADATA != 0
    }

    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.flags & flags::ENCRYPTED != 0
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.status == Status::Error as u8
    }
}

/// Authenticated framed transport the engine sends requests over and
/// receives replies from.
///
/// An external collaborator: production implementations wrap a TLS/SSH
/// session. The engine depends only on this trait so it can be driven by a
/// fake in tests.
pub trait Transport {
    /// Queues `header` + `body` for asynchronous send; the reply (if any)
    /// arrives later via [`Transport::poll_reply`], matched by `header.tag`.
    fn send(&mut self, header: Header, body: &[u8]) -> CtResult<()>;

    /// Synchronous, timeout-bounded request used only during session
    /// establishment (the "polled open").
    fn send_polled(
        &mut self,
        header: Header,
        body: &[u8],
        timeout: Duration,
    ) -> CtResult<(Header, Vec<u8>)>;

    /// Returns the next reply that has completed, if one is ready, in the
    /// order the server actually returns them. `None` means nothing has
    /// completed yet; the caller stays parked in `FileState::WaitingServer`.
    ///
    /// Only transports backing a driver that pipelines requests via `send`
    /// (currently `drivers::extract`) need to override this; the default
    /// suits transports where nothing is ever queued through `send`.
    fn poll_reply(&mut self) -> Option<(Header, Vec<u8>)> {
        None
    }
}

/// Default timeout for [`Transport::send_polled`], matching the polled
/// open's fixed 20-second I/O timeout during session establishment.
pub const POLLED_OPEN_TIMEOUT: Duration = Duration::from_secs(20);

/// Computes the tag reused by the polled open so that it interleaves with
/// the state-machine's own monotonic tag numbering: `packet_id - 1`.
#[must_use]
pub const fn polled_open_tag(packet_id: u64) -> u64 {
    packet_id.wrapping_sub(1)
}
