#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `ctfile-engine` implements the remote transport and server-side garbage
//! collection ("cull") protocol for *ctfiles* — the client-side manifests of
//! a deduplicating backup system. A ctfile is a header chain linking it to
//! prior incremental ctfiles plus an ordered sequence of content-addressed
//! chunk references that together reconstruct a backed-up file tree.
//!
//! Four subsystems make up the engine:
//!
//! - A cooperative [`scheduler`] that drives one [`operation::Operation`] at
//!   a time through a small resumable state machine ([`state::FileState`]),
//!   backed by a bounded [`transaction::TransactionPool`].
//! - The ctfile archive/extract protocol ([`drivers::archive`],
//!   [`drivers::extract`]): a stream-oriented, chunked transfer bracketed by
//!   XML-framed open/close control messages ([`xml`], [`dispatch`]).
//! - The cull protocol ([`drivers::cull`]): list, fetch-missing, compute the
//!   live-SHA set, stream it to the server in bounded batches, commit a new
//!   generation, then delete superseded ctfiles.
//! - Dependency-safe deletion ([`drivers::delete`]): no retained ctfile may
//!   name a to-be-deleted predecessor.
//!
//! # Out of scope
//!
//! Chunk-level deduplication and encryption, the ctfile binary format, cache
//! directory layout, and a CLI front end are not implemented here. This
//! crate models its boundary with those systems as narrow traits in
//! [`collaborators`]: [`collaborators::CtfileParser`] (streams a local
//! manifest), [`collaborators::ChunkDb`] (marks SHAs live for a generation),
//! [`collaborators::CacheDir`] (local ctfile cache), and
//! [`collaborators::NameCodec`] (cook/uncook of remote names).
//!
//! # Errors
//!
//! All fallible operations return [`error::CtResult`].

pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod drivers;
pub mod error;
pub mod fnode;
pub mod naming;
pub mod operation;
pub mod scheduler;
pub mod sha;
pub mod state;
pub mod transaction;
pub mod transport;
pub mod xml;

pub use config::CtEngineConfig;
pub use error::{CtEngineError, CtResult};
pub use scheduler::Engine;
pub use state::FileState;
