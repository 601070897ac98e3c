//! Reference-counted file node shared across in-flight transactions for the
//! same file.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// File kind carried by a [`FileNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

/// Descriptor of a file being transferred, shared by every transaction that
/// carries a chunk of its content.
///
/// `FileNode` is always held behind an [`Arc`]; the refcount *this module*
/// tracks (`refs`) is distinct from the `Arc`'s own strong count and exists
/// to enforce a one-acquire-one-release invariant independent of how many
/// `Arc` clones are outstanding at once.
#[derive(Debug)]
pub struct FileNode {
    name: String,
    path: String,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: SystemTime,
    kind: FileKind,
    refs: AtomicU32,
}

impl FileNode {
    /// Creates a new file node with one outstanding reference already
    /// accounted for (the caller's).
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: SystemTime,
        kind: FileKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            path: path.into(),
            mode,
            uid,
            gid,
            mtime,
            kind,
            refs: AtomicU32::new(1),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub const fn mode(&self) -> u32 {
        self.mode
    }

    #[must_use]
    pub const fn owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }

    #[must_use]
    pub const fn mtime(&self) -> SystemTime {
        self.mtime
    }

    #[must_use]
    pub const fn kind(&self) -> FileKind {
        self.kind
    }

    /// Takes an additional reference, e.g. when a second transaction begins
    /// carrying a chunk of the same file.
    pub fn acquire(self: &Arc<Self>) -> Arc<Self> {
        self.refs.fetch_add(1, Ordering::AcqRel);
        Arc::clone(self)
    }

    /// Releases a reference previously returned by [`FileNode::new`] or
    /// [`FileNode::acquire`]. Returns `true` if this was the last reference.
    ///
    /// Panics in debug builds if called more times than references were
    /// acquired, surfacing a double-release as a bug rather than silently
    /// wrapping the counter.
    pub fn release(&self) -> bool {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "fnode released more times than acquired");
        previous == 1
    }

    /// Current outstanding reference count, for diagnostics and tests.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Arc<FileNode> {
        FileNode::new(
            "20240101-000000-host",
            "/var/backups/ctfile",
            0o644,
            1000,
            1000,
            SystemTime::UNIX_EPOCH,
            FileKind::Regular,
        )
    }

    #[test]
    fn new_node_has_one_ref() {
        let node = sample();
        assert_eq!(node.ref_count(), 1);
    }

    #[test]
    fn acquire_increments_and_release_decrements() {
        let node = sample();
        let second = node.acquire();
        assert_eq!(node.ref_count(), 2);

        assert!(!node.release());
        assert_eq!(node.ref_count(), 1);
        assert!(second.release());
        assert_eq!(node.ref_count(), 0);
    }

    #[test]
    fn dual_release_at_extract_eof_models_driver_and_transaction_owners() {
        let driver_owned = sample();
        let transaction_owned = driver_owned.acquire();
        assert_eq!(driver_owned.ref_count(), 2);

        assert!(!transaction_owned.release());
        assert!(driver_owned.release());
    }
}
