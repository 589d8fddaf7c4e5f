//! Mapping primitives consumed by the registry.
//!
//! Establishing and undoing an address-space mapping is the allocator's
//! business (ion, gbm, a test double, ...); the registry only decides *when*
//! those primitives run. Implementations are handed to
//! [`BufferRegistry::new`](crate::registry::BufferRegistry::new) once per
//! process.

use std::fmt;
use std::io;

use crate::handle::BufferHandle;

/// Maps buffers into and out of the process address space.
///
/// Implementations are expected to be bounded syscalls; the registry invokes
/// them while holding its table lock.
pub trait BufferMapper: Send + Sync + fmt::Debug {
    /// Map every client descriptor of `handle` into the address space.
    ///
    /// On success the implementation must have published the mapping base of
    /// every client slot through [`BufferHandle::set_cached_base`]. Errors
    /// are propagated to the caller of
    /// [`BufferRegistry::map`](crate::registry::BufferRegistry::map)
    /// unchanged.
    fn map(&self, handle: &BufferHandle) -> io::Result<()>;

    /// Undo the mapping established by [`map`](Self::map), best-effort.
    ///
    /// The implementation must clear the cached bases it published. Runs at
    /// most once per buffer lifetime, when the last reference is released.
    fn unmap(&self, handle: &BufferHandle);
}
