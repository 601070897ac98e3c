//! The five XML control message shapes and their
//! marshal/unmarshal helpers.
//!
//! The wire codec itself (how a marshaled document becomes transport bytes)
//! is this engine's concern; the document shapes are modeled with
//! `serde`/`quick-xml` the same way this workspace reaches for `serde` for
//! every other wire format it owns.

use serde::{Deserialize, Serialize};

use crate::error::{CtEngineError, CtResult};
use crate::sha::ShaDigest;

/// Direction requested by an `open` control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenMode {
    Read,
    Write,
}

/// `cull-setup` mode. Only `Precious` is defined on the wire; modeled as an
/// enum so a future mode addition is a compile error at every match site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CullSetupMode {
    #[serde(rename = "PRECIOUS")]
    Precious,
}

/// `cull-complete` mode. Only `Process` is defined on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CullCompleteMode {
    #[serde(rename = "PROCESS")]
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "open")]
pub struct OpenRequest {
    pub file: String,
    pub mode: OpenMode,
    pub chunkno: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "open-reply")]
pub struct OpenReply {
    /// Server-canonicalized form of the requested name.
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "close")]
pub struct CloseRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "close-reply")]
pub struct CloseReply;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "list")]
pub struct ListRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "list-reply")]
pub struct ListReply {
    #[serde(rename = "name", default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "delete")]
pub struct DeleteRequest {
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "delete-reply")]
pub struct DeleteReply {
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "cull-setup")]
pub struct CullSetupRequest {
    pub uuid: u64,
    pub mode: CullSetupMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "cull-setup-reply")]
pub struct CullSetupReply {
    pub uuid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "cull-shas")]
pub struct CullShasRequest {
    pub uuid: u64,
    #[serde(rename = "sha", default)]
    pub shas: Vec<String>,
    pub eof: bool,
}

impl CullShasRequest {
    #[must_use]
    pub fn from_digests(uuid: u64, digests: &[ShaDigest], eof: bool) -> Self {
        Self {
            uuid,
            shas: digests.iter().map(ToString::to_string).collect(),
            eof,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "cull-shas-reply")]
pub struct CullShasReply {
    pub uuid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "cull-complete")]
pub struct CullCompleteRequest {
    pub uuid: u64,
    pub mode: CullCompleteMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "cull-complete-reply")]
pub struct CullCompleteReply {
    pub uuid: u64,
    pub generation: u64,
}

/// Marshals `value` into an XML document body.
pub fn marshal<T: Serialize>(value: &T) -> CtResult<String> {
    quick_xml::se::to_string(value)
        .map_err(|err| CtEngineError::Protocol(format!("xml marshal failed: {err}")))
}

/// Unmarshals an XML document body into `T`.
pub fn unmarshal<T: serde::de::DeserializeOwned>(body: &str) -> CtResult<T> {
    quick_xml::de::from_str(body)
        .map_err(|err| CtEngineError::Protocol(format!("xml parse failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_request_round_trips() {
        let req = OpenRequest {
            file: "20240115-093000-host".to_owned(),
            mode: OpenMode::Write,
            chunkno: 0,
        };
        let xml = marshal(&req).unwrap();
        let parsed: OpenRequest = unmarshal(&xml).unwrap();
        assert_eq!(req, parsed);
    }

    #[test]
    fn list_reply_round_trips_with_multiple_names() {
        let reply = ListReply {
            names: vec!["a".to_owned(), "b".to_owned()],
        };
        let xml = marshal(&reply).unwrap();
        let parsed: ListReply = unmarshal(&xml).unwrap();
        assert_eq!(reply, parsed);
    }

    #[test]
    fn cull_shas_request_carries_hex_digests() {
        let digest = ShaDigest::from_bytes([0xab; 32]);
        let req = CullShasRequest::from_digests(42, &[digest], true);
        assert_eq!(req.shas[0].len(), 64);
        let xml = marshal(&req).unwrap();
        let parsed: CullShasRequest = unmarshal(&xml).unwrap();
        assert_eq!(req, parsed);
        assert!(parsed.eof);
    }

    #[test]
    fn cull_complete_reply_carries_new_generation() {
        let reply = CullCompleteReply {
            uuid: 7,
            generation: 99,
        };
        let xml = marshal(&reply).unwrap();
        let parsed: CullCompleteReply = unmarshal(&xml).unwrap();
        assert_eq!(parsed.generation, 99);
    }

    #[test]
    fn malformed_document_is_a_protocol_error() {
        let err = unmarshal::<OpenReply>("<not-valid").unwrap_err();
        assert!(matches!(err, CtEngineError::Protocol(_)));
    }
}
