//! Shared buffer handles.
//!
//! A [`BufferHandle`] is the per-buffer identity passed between producers,
//! consumers and the registry. Handles act alike to smart pointers and can be
//! freely cloned and passed around; two handles are equal exactly when they
//! refer to the same underlying buffer record, never by deep comparison of
//! their contents.
//!
//! The handle owns the dma-buf file descriptors of its buffer and caches the
//! address-space base of every mapped descriptor, so that consumers outside
//! the registry can reach the mapped memory without going through it. The
//! registry mirrors these cached values into its own table and cross-checks
//! them on every operation (see [`BufferRegistry::validate`]).
//!
//! [`BufferRegistry::validate`]: crate::registry::BufferRegistry::validate

use std::hash::{Hash, Hasher};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Maximum amount of client descriptor slots a handle may carry.
///
/// This bounds the `bases`/`alloc_sizes` mirrors kept by the registry. One
/// additional slot, not counted here, is reserved for the shared-metadata
/// descriptor.
pub const MAX_BUFFER_FDS: usize = 4;

/// Total descriptor slots, including the reserved metadata slot.
pub(crate) const MAX_FDS: usize = MAX_BUFFER_FDS + 1;

/// Magic stamped into every handle built by [`HandleBuilder`].
///
/// A handle arriving from another process with the wrong magic never passed
/// through a trusted allocator and is rejected before any table access.
pub(crate) const HANDLE_MAGIC: u32 = u32::from_be_bytes(*b"dbuf");

#[derive(Debug)]
pub(crate) struct HandleInner {
    pub(crate) magic: u32,
    /// Descriptor slots, contiguous from slot 0. `None` marks an unused slot.
    /// Slot `fd_count` holds the shared-metadata descriptor.
    pub(crate) fds: [Option<OwnedFd>; MAX_FDS],
    /// Declared count of valid client descriptors, metadata excluded.
    pub(crate) fd_count: usize,
    /// Declared allocation size per client descriptor slot.
    pub(crate) alloc_sizes: [u64; MAX_BUFFER_FDS],
    /// Declared size of the shared-metadata region.
    pub(crate) attr_size: u64,
    /// Cached mapping base per client slot, 0 while unmapped. Written by the
    /// external mapping primitive, mirrored and validated by the registry.
    pub(crate) bases: [AtomicUsize; MAX_BUFFER_FDS],
    /// Cached base of the mapped metadata region, 0 while unmapped.
    pub(crate) attr_base: AtomicUsize,
}

/// Identity of one shared graphics buffer.
///
/// Cheap to clone; all clones refer to the same buffer record. The owned file
/// descriptors are closed when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct BufferHandle(pub(crate) Arc<HandleInner>);

impl PartialEq for BufferHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for BufferHandle {}

impl Hash for BufferHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}

/// Builder for [`BufferHandle`]s, normally driven by the allocator that
/// created the buffer.
#[derive(Debug)]
pub struct HandleBuilder {
    fds: Vec<(OwnedFd, u64)>,
    metadata: Option<(OwnedFd, u64)>,
}

impl HandleBuilder {
    /// Add a client descriptor with its declared allocation size.
    ///
    /// Returns `false` if all [`MAX_BUFFER_FDS`] slots are taken.
    pub fn add_fd(&mut self, fd: OwnedFd, alloc_size: u64) -> bool {
        if self.fds.len() == MAX_BUFFER_FDS {
            return false;
        }
        self.fds.push((fd, alloc_size));
        true
    }

    /// Set the shared-metadata descriptor and its declared region size.
    pub fn metadata_fd(&mut self, fd: OwnedFd, attr_size: u64) {
        self.metadata = Some((fd, attr_size));
    }

    /// Build the handle.
    ///
    /// Returns `None` unless at least one client descriptor and the metadata
    /// descriptor were provided.
    pub fn build(self) -> Option<BufferHandle> {
        if self.fds.is_empty() {
            return None;
        }
        let (meta_fd, attr_size) = self.metadata?;

        let fd_count = self.fds.len();
        let mut fds: [Option<OwnedFd>; MAX_FDS] = Default::default();
        let mut alloc_sizes = [0u64; MAX_BUFFER_FDS];
        for (idx, (fd, size)) in self.fds.into_iter().enumerate() {
            fds[idx] = Some(fd);
            alloc_sizes[idx] = size;
        }
        fds[fd_count] = Some(meta_fd);

        Some(BufferHandle(Arc::new(HandleInner {
            magic: HANDLE_MAGIC,
            fds,
            fd_count,
            alloc_sizes,
            attr_size,
            bases: Default::default(),
            attr_base: AtomicUsize::new(0),
        })))
    }
}

impl BufferHandle {
    /// Create a new handle builder.
    pub fn builder() -> HandleBuilder {
        HandleBuilder {
            fds: Vec::with_capacity(MAX_FDS),
            metadata: None,
        }
    }

    /// Authenticity check for a handle of unknown provenance.
    ///
    /// Pure and lock-free; verifies the magic and the structural bounds of
    /// the descriptor table. All registry operations run this before
    /// trusting any other field of the handle.
    pub fn validate(&self) -> bool {
        self.0.magic == HANDLE_MAGIC
            && (1..=MAX_BUFFER_FDS).contains(&self.0.fd_count)
            && self.0.fds[self.0.fd_count].is_some()
    }

    /// Declared count of valid client descriptors.
    pub fn fd_count(&self) -> usize {
        self.0.fd_count
    }

    /// Borrow the client descriptor in `slot`, if present.
    pub fn fd(&self, slot: usize) -> Option<BorrowedFd<'_>> {
        self.0.fds.get(slot)?.as_ref().map(|fd| fd.as_fd())
    }

    /// Borrow the shared-metadata descriptor.
    pub fn metadata_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd(self.0.fd_count)
    }

    /// Declared allocation size of the client descriptor in `slot`.
    pub fn alloc_size(&self, slot: usize) -> u64 {
        self.0.alloc_sizes[slot]
    }

    /// Declared size of the shared-metadata region.
    pub fn attr_size(&self) -> u64 {
        self.0.attr_size
    }

    /// Cached mapping base of `slot`, 0 while unmapped.
    pub fn cached_base(&self, slot: usize) -> usize {
        self.0.bases[slot].load(Ordering::Acquire)
    }

    /// Publish the mapping base of `slot`.
    ///
    /// Called by the external mapping primitive once a descriptor is mapped,
    /// and again with 0 when it is unmapped. The registry cross-checks these
    /// values against its own mirror; writing anything else here makes the
    /// handle fail validation.
    pub fn set_cached_base(&self, slot: usize, base: usize) {
        self.0.bases[slot].store(base, Ordering::Release);
    }

    /// Cached base of the mapped metadata region, 0 while unmapped.
    pub fn attr_base(&self) -> usize {
        self.0.attr_base.load(Ordering::Acquire)
    }

    /// Publish the base of the mapped metadata region.
    pub fn set_attr_base(&self, base: usize) {
        self.0.attr_base.store(base, Ordering::Release);
    }

    /// Clear the metadata base, returning the previous value.
    pub(crate) fn take_attr_base(&self) -> usize {
        self.0.attr_base.swap(0, Ordering::AcqRel)
    }

    /// Reset every cached client base to the unmapped sentinel.
    ///
    /// A handle imported from another process may arrive with that process's
    /// stale addresses cached.
    pub(crate) fn clear_cached_bases(&self) {
        for base in &self.0.bases {
            base.store(0, Ordering::Release);
        }
    }

    /// Count of contiguous populated descriptor slots, metadata included.
    pub(crate) fn populated_fd_slots(&self) -> usize {
        self.0.fds.iter().position(Option::is_none).unwrap_or(MAX_FDS)
    }
}
