//! External collaborator boundaries.
//!
//! These traits are the engine's entire dependency on systems this crate
//! does not implement: chunk-level deduplication/crypto, the ctfile binary
//! format, the local chunk database, and filesystem cache layout. Production
//! wiring supplies real implementations; tests supply fakes.

use std::path::Path;

use crate::error::CtResult;
use crate::sha::ShaDigest;

/// Per-chunk SHA/IV computation and chunk storage, owned by the
/// deduplication/crypto engine.
pub trait ChunkStore {
    /// Computes the content-addressed digest (and, for encrypted chunks, the
    /// IV) for one chunk payload.
    fn digest(&self, chunk_no: u64, payload: &[u8]) -> CtResult<ShaDigest>;

    /// Writes a chunk's payload under its digest.
    fn write_chunk(&mut self, digest: ShaDigest, payload: &[u8]) -> CtResult<()>;

    /// Reads a chunk's payload by digest.
    fn read_chunk(&self, digest: ShaDigest) -> CtResult<Vec<u8>>;

    /// Derives the IV for the chunk at `chunk_no`. The extract driver
    /// attaches this to each read-chunk transaction; the
    /// archive side computes its own IV when writing and does not need to
    /// read it back through this trait.
    fn iv(&self, chunk_no: u64) -> CtResult<[u8; 16]>;
}

/// One SHA record parsed from a local ctfile manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtfileShaRecord {
    pub digest: ShaDigest,
    /// True if this manifest was written under the crypto ctfile format,
    /// in which case `digest` is the crypto-SHA rather than the plain SHA.
    pub is_crypto: bool,
}

/// Per-file metadata parsed from a local ctfile manifest.
#[derive(Debug, Clone)]
pub struct CtfileFileRecord {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// One parsed record from a ctfile's body.
#[derive(Debug, Clone)]
pub enum CtfileRecord {
    File(CtfileFileRecord),
    Sha(CtfileShaRecord),
}

/// Streams a local ctfile manifest's header, per-file metadata, and SHA
/// records without this crate owning the binary format.
pub trait CtfileParser {
    /// Returns the manifest's immediate predecessor name, if any, as
    /// recorded in its header.
    fn predecessor(&mut self, path: &Path) -> CtResult<Option<String>>;

    /// Streams every record in `path` to `visit`, in file order. Used both
    /// by archive's pre-validation pass (seeking past each SHA's payload)
    /// and cull's live-set collection pass.
    fn for_each_record(
        &mut self,
        path: &Path,
        visit: &mut dyn FnMut(CtfileRecord) -> CtResult<()>,
    ) -> CtResult<()>;
}

/// Marks SHAs live for a cull generation and later garbage-collects the
/// rest.
pub trait ChunkDb {
    /// Begins a new cull generation.
    fn cull_start(&mut self) -> CtResult<()>;

    /// Marks `digest` live for the generation under construction.
    fn cull_mark(&mut self, digest: ShaDigest) -> CtResult<()>;

    /// Commits generation `new_generation`, garbage-collecting every SHA not
    /// marked live since the matching `cull_start`.
    fn cull_end(&mut self, new_generation: u64) -> CtResult<()>;
}

/// Local cache directory holding copies of fetched remote ctfiles.
pub trait CacheDir {
    /// True if `name` is already present in the local cache.
    fn contains(&self, name: &str) -> bool;

    /// Local path a cached (or about-to-be-cached) ctfile named `name`
    /// would live at.
    fn path_for(&self, name: &str) -> CtResult<std::path::PathBuf>;

    /// Evicts `name` from the cache, if present.
    fn evict(&mut self, name: &str) -> CtResult<()>;
}

/// Cook/uncook mapping between a user-facing ctfile name and its canonical
/// server form.
pub trait NameCodec {
    /// Derives a remote (server-canonical) name from a local file name.
    fn cook(&self, local_name: &str) -> CtResult<String>;

    /// Recovers the local-facing form of a server-canonicalized name.
    fn uncook(&self, remote_name: &str) -> CtResult<String>;
}

/// Bundles every external collaborator a driver may need behind one
/// borrow, so [`crate::operation::EngineCx`] carries a single field instead
/// of one per trait.
pub trait Collaborators {
    fn chunk_store(&mut self) -> &mut dyn ChunkStore;
    fn ctfile_parser(&mut self) -> &mut dyn CtfileParser;
    fn chunk_db(&mut self) -> &mut dyn ChunkDb;
    fn cache_dir(&mut self) -> &mut dyn CacheDir;
    fn name_codec(&mut self) -> &mut dyn NameCodec;
}

/// In-memory fakes for the collaborator traits, shared by this crate's unit
/// and scenario tests. Left ungated (not `#[cfg(test)]`) so the integration
/// tests under `tests/` can use it too: those compile against the built
/// library, which never sees the crate's own `#[cfg(test)]` items.
#[doc(hidden)]
pub mod test_support {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    use super::{CacheDir, ChunkDb, ChunkStore, Collaborators, CtfileParser, CtfileRecord, NameCodec};
    use crate::error::CtResult;
    use crate::sha::ShaDigest;

    #[derive(Default)]
    pub struct FakeChunkStore {
        pub written: Vec<(ShaDigest, Vec<u8>)>,
    }

    impl ChunkStore for FakeChunkStore {
        fn digest(&self, chunk_no: u64, payload: &[u8]) -> CtResult<ShaDigest> {
            let mut bytes = [0u8; 32];
            bytes[0..8].copy_from_slice(&chunk_no.to_be_bytes());
            bytes[8] = payload.len() as u8;
            Ok(ShaDigest::from_bytes(bytes))
        }

        fn write_chunk(&mut self, digest: ShaDigest, payload: &[u8]) -> CtResult<()> {
            self.written.push((digest, payload.to_vec()));
            Ok(())
        }

        fn read_chunk(&self, digest: ShaDigest) -> CtResult<Vec<u8>> {
            Ok(self
                .written
                .iter()
                .find(|(d, _)| *d == digest)
                .map(|(_, payload)| payload.clone())
                .unwrap_or_default())
        }

        fn iv(&self, chunk_no: u64) -> CtResult<[u8; 16]> {
            let mut iv = [0u8; 16];
            iv[0..8].copy_from_slice(&chunk_no.to_be_bytes());
            Ok(iv)
        }
    }

    #[derive(Default)]
    pub struct FakeCtfileParser {
        pub predecessors: HashMap<PathBuf, String>,
        pub records: HashMap<PathBuf, Vec<CtfileRecord>>,
    }

    impl CtfileParser for FakeCtfileParser {
        fn predecessor(&mut self, path: &Path) -> CtResult<Option<String>> {
            Ok(self.predecessors.get(path).cloned())
        }

        fn for_each_record(
            &mut self,
            path: &Path,
            visit: &mut dyn FnMut(CtfileRecord) -> CtResult<()>,
        ) -> CtResult<()> {
            if let Some(records) = self.records.get(path) {
                for record in records.clone() {
                    visit(record)?;
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeChunkDb {
        pub marked: Vec<ShaDigest>,
        pub generation: u64,
        pub started: bool,
        pub ended: bool,
    }

    impl ChunkDb for FakeChunkDb {
        fn cull_start(&mut self) -> CtResult<()> {
            self.started = true;
            Ok(())
        }

        fn cull_mark(&mut self, digest: ShaDigest) -> CtResult<()> {
            self.marked.push(digest);
            Ok(())
        }

        fn cull_end(&mut self, new_generation: u64) -> CtResult<()> {
            self.generation = new_generation;
            self.ended = true;
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeCacheDir {
        pub cached: HashMap<String, PathBuf>,
    }

    impl CacheDir for FakeCacheDir {
        fn contains(&self, name: &str) -> bool {
            self.cached.contains_key(name)
        }

        fn path_for(&self, name: &str) -> CtResult<PathBuf> {
            Ok(self
                .cached
                .get(name)
                .cloned()
                .unwrap_or_else(|| PathBuf::from(format!("/tmp/ctfile-cache/{name}"))))
        }

        fn evict(&mut self, name: &str) -> CtResult<()> {
            self.cached.remove(name);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeNameCodec;

    impl NameCodec for FakeNameCodec {
        fn cook(&self, local_name: &str) -> CtResult<String> {
            Ok(local_name.to_owned())
        }

        fn uncook(&self, remote_name: &str) -> CtResult<String> {
            Ok(remote_name.to_owned())
        }
    }

    #[derive(Default)]
    pub struct FakeCollaborators {
        pub chunk_store: FakeChunkStore,
        pub ctfile_parser: FakeCtfileParser,
        pub chunk_db: FakeChunkDb,
        pub cache_dir: FakeCacheDir,
        pub name_codec: FakeNameCodec,
    }

    impl Collaborators for FakeCollaborators {
        fn chunk_store(&mut self) -> &mut dyn ChunkStore {
            &mut self.chunk_store
        }

        fn ctfile_parser(&mut self) -> &mut dyn CtfileParser {
            &mut self.ctfile_parser
        }

        fn chunk_db(&mut self) -> &mut dyn ChunkDb {
            &mut self.chunk_db
        }

        fn cache_dir(&mut self) -> &mut dyn CacheDir {
            &mut self.cache_dir
        }

        fn name_codec(&mut self) -> &mut dyn NameCodec {
            &mut self.name_codec
        }
    }
}
