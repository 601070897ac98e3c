//! Fixed-width digest type and the ordered live-SHA set used by cull.

use std::collections::BTreeSet;

/// Fixed-width content digest. This engine treats digests as opaque keys; it
/// neither computes nor verifies them (that is [`crate::collaborators::ChunkStore`]'s
/// job).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShaDigest([u8; 32]);

impl ShaDigest {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ShaDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Ordered, de-duplicating set of digests live at the current cull session,
/// with a running insertion counter.
#[derive(Debug, Default)]
pub struct ShaSet {
    members: BTreeSet<ShaDigest>,
    inserted: u64,
}

impl ShaSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `digest`. Idempotent: inserting the same digest twice leaves
    /// the set cardinality unchanged but still only increments `inserted`
    /// the first time.
    pub fn insert(&mut self, digest: ShaDigest) {
        if self.members.insert(digest) {
            self.inserted += 1;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of successful (non-duplicate) inserts since creation.
    #[must_use]
    pub const fn inserted_count(&self) -> u64 {
        self.inserted
    }

    /// Drains the set into batches of at most `batch_size` digests, calling
    /// `send` once per batch with `(digests, is_last)`. Batch count is
    /// `⌈len / batch_size⌉`; only the last batch reports `is_last = true`.
    pub fn drain_in_batches<E>(
        &mut self,
        batch_size: usize,
        mut send: impl FnMut(&[ShaDigest], bool) -> Result<(), E>,
    ) -> Result<(), E> {
        assert!(batch_size > 0, "batch_size must be positive");
        let all: Vec<ShaDigest> = std::mem::take(&mut self.members).into_iter().collect();
        if all.is_empty() {
            send(&[], true)?;
            return Ok(());
        }
        let mut offset = 0;
        while offset < all.len() {
            let end = (offset + batch_size).min(all.len());
            let is_last = end == all.len();
            send(&all[offset..end], is_last)?;
            offset = end;
        }
        Ok(())
    }
}
