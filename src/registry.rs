//! Process-wide buffer registry.
//!
//! The [`BufferRegistry`] tracks every buffer imported into this process: how
//! many call sites currently hold a reference to it, and where its memory is
//! mapped. Buffers are mapped lazily on first use and unmapped exactly once,
//! when the last reference is released.
//!
//! One registry is constructed per process, at driver initialization, and
//! shared by reference with every call site. All operations are safe to call
//! concurrently from any thread; a single mutex serializes every access to
//! the tracked state. These are control-path operations (import, first map,
//! teardown), not per-frame work, so a global lock is preferred over
//! per-buffer locking.

use std::collections::hash_map::{Entry, HashMap};
use std::ffi::c_void;
use std::io;
use std::os::unix::io::BorrowedFd;
use std::sync::{Arc, Mutex};

use rustix::fs::{seek, SeekFrom};
use rustix::io::Errno;
use tracing::{error, trace, warn};

use crate::handle::{BufferHandle, MAX_BUFFER_FDS};
use crate::mapper::BufferMapper;

/// Errors returned by the registry operations.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The handle failed the authenticity, consistency or dmabuf sanity
    /// checks, or is not imported by this process where an import is
    /// required.
    #[error("invalid buffer handle")]
    InvalidHandle,
    /// The external mapping primitive failed. The underlying error is
    /// carried unchanged.
    #[error("failed to map buffer into the address space")]
    Map(#[source] io::Error),
}

impl BufferError {
    /// Negative-errno representation for the C-style driver entry layer.
    pub fn errno(&self) -> i32 {
        match self {
            BufferError::InvalidHandle => -Errno::INVAL.raw_os_error(),
            BufferError::Map(err) => -err.raw_os_error().unwrap_or_else(|| Errno::IO.raw_os_error()),
        }
    }
}

/// Mirror of one mapped buffer, recorded when the mapping is established and
/// compared against the handle's cached fields on every later operation.
#[derive(Debug, Default)]
struct MappedState {
    bases: [usize; MAX_BUFFER_FDS],
    alloc_sizes: [u64; MAX_BUFFER_FDS],
}

/// Per-buffer state owned exclusively by the registry.
///
/// Dropping the tracked state releases the kernel-side mappings, so erasing
/// the table entry at the last release is the single place where address
/// space is given back.
#[derive(Debug)]
struct TrackedBuffer {
    handle: BufferHandle,
    mapper: Arc<dyn BufferMapper>,
    mapping: Option<MappedState>,
    ref_count: u64,
}

impl TrackedBuffer {
    fn new(handle: BufferHandle, mapper: Arc<dyn BufferMapper>) -> Self {
        TrackedBuffer {
            handle,
            mapper,
            mapping: None,
            ref_count: 0,
        }
    }
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        if self.mapping.is_some() {
            self.mapper.unmap(&self.handle);
        }

        // The metadata region is mapped outside the mapper's control, so it
        // is undone here directly.
        let attr_base = self.handle.take_attr_base();
        if attr_base != 0 {
            trace!(handle = ?self.handle, "unmapping shared metadata region");
            // SAFETY: attr_base/attr_size describe the metadata mapping
            // published on the handle by the allocator; the base was swapped
            // to 0 above, so no second unmap of this region can follow.
            if let Err(err) = unsafe { rustix::mm::munmap(attr_base as *mut c_void, self.handle.attr_size() as usize) } {
                warn!(?err, "failed to unmap shared metadata region");
            }
        }
    }
}

/// Reference counting and mapping manager for shared graphics buffers.
#[derive(Debug)]
pub struct BufferRegistry {
    mapper: Arc<dyn BufferMapper>,
    buffers: Mutex<HashMap<BufferHandle, TrackedBuffer>>,
}

impl BufferRegistry {
    /// Create the registry for this process, delegating address-space
    /// operations to `mapper`.
    pub fn new(mapper: impl BufferMapper + 'static) -> Self {
        BufferRegistry {
            mapper: Arc::new(mapper),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new reference to `handle`, importing it on first use.
    ///
    /// A handle imported for the first time gets a fresh zero-count entry and
    /// its cached mapping bases are reset, as it may carry stale addresses
    /// from the exporting process. No mapping is established here.
    #[profiling::function]
    pub fn retain(&self, handle: &BufferHandle) -> Result<(), BufferError> {
        if !handle.validate() {
            error!(?handle, "retaining invalid buffer handle");
            return Err(BufferError::InvalidHandle);
        }

        let mut buffers = self.buffers.lock().unwrap();
        let tracked = match buffers.entry(handle.clone()) {
            Entry::Vacant(entry) => {
                handle.clear_cached_bases();
                entry.insert(TrackedBuffer::new(handle.clone(), self.mapper.clone()))
            }
            Entry::Occupied(entry) => {
                let tracked = entry.into_mut();
                if tracked.ref_count == 0 {
                    error!(?handle, "imported buffer is tracked with a zero reference count");
                }
                tracked
            }
        };
        tracked.ref_count += 1;

        Ok(())
    }

    /// Map `handle`'s memory into this process, if it is not mapped already.
    ///
    /// Runs the dmabuf sanity check before trusting the handle's descriptors
    /// enough to map them. On success the registry mirrors the mapping bases
    /// and sizes reported on the handle for later consistency checks.
    #[profiling::function]
    pub fn map(&self, handle: &BufferHandle) -> Result<(), BufferError> {
        let mut buffers = self.buffers.lock().unwrap();
        Self::validate_locked(&buffers, handle)?;

        let tracked = buffers.get_mut(handle).ok_or(BufferError::InvalidHandle)?;
        if tracked.ref_count == 0 {
            error!(?handle, "mapping a buffer whose reference count is 0");
        }

        if tracked.mapping.is_some() {
            return Ok(());
        }

        if !dmabuf_sanity_check(handle) {
            return Err(BufferError::InvalidHandle);
        }

        self.mapper.map(handle).map_err(BufferError::Map)?;

        let mut state = MappedState::default();
        for slot in 0..MAX_BUFFER_FDS {
            state.bases[slot] = handle.cached_base(slot);
            state.alloc_sizes[slot] = handle.alloc_size(slot);
        }
        tracked.mapping = Some(state);

        Ok(())
    }

    /// Drop one reference to `handle`.
    ///
    /// When the last reference is dropped the buffer's mappings are released
    /// and the tracked state erased. Releasing a handle that was never
    /// retained is a contract violation and reported as
    /// [`BufferError::InvalidHandle`].
    #[profiling::function]
    pub fn release(&self, handle: &BufferHandle) -> Result<(), BufferError> {
        let mut buffers = self.buffers.lock().unwrap();

        // Revalidate under the lock rather than trusting an earlier validate
        // call from the caller; anything else leaves a window between the
        // external check and this lock acquisition.
        Self::validate_locked(&buffers, handle)?;

        let tracked = buffers.get_mut(handle).ok_or(BufferError::InvalidHandle)?;
        if tracked.ref_count == 0 {
            error!(?handle, "releasing a buffer whose reference count is already 0");
            return Err(BufferError::InvalidHandle);
        }

        tracked.ref_count -= 1;
        if tracked.ref_count == 0 {
            // Dropping the entry unmaps the buffer and its metadata region.
            buffers.remove(handle);
        }

        Ok(())
    }

    /// Check that `handle` is authentic, imported, and consistent with the
    /// tracked state, without mutating anything.
    #[profiling::function]
    pub fn validate(&self, handle: &BufferHandle) -> Result<(), BufferError> {
        let buffers = self.buffers.lock().unwrap();
        Self::validate_locked(&buffers, handle)
    }

    fn validate_locked(
        buffers: &HashMap<BufferHandle, TrackedBuffer>,
        handle: &BufferHandle,
    ) -> Result<(), BufferError> {
        if !handle.validate() {
            error!(?handle, "referencing invalid buffer handle");
            return Err(BufferError::InvalidHandle);
        }

        let Some(tracked) = buffers.get(handle) else {
            error!(?handle, "referencing buffer not imported by this process");
            return Err(BufferError::InvalidHandle);
        };

        match &tracked.mapping {
            Some(state) => {
                // Every slot must match the mirror bit for bit; a divergence
                // means tampering or a stale handle reused across processes.
                for slot in 0..MAX_BUFFER_FDS {
                    if state.bases[slot] != handle.cached_base(slot)
                        || state.alloc_sizes[slot] != handle.alloc_size(slot)
                    {
                        error!(?handle, slot, "buffer attributes inconsistent with the registry");
                        return Err(BufferError::InvalidHandle);
                    }
                }
            }
            None => {
                for slot in 0..MAX_BUFFER_FDS {
                    if handle.cached_base(slot) != 0 {
                        error!(?handle, slot, "unmapped buffer carries a cached mapping base");
                        return Err(BufferError::InvalidHandle);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Verify the handle's descriptors before trusting them enough to map.
///
/// Defends against forged descriptor sizes and against kernel objects that
/// were resized or swapped after import.
fn dmabuf_sanity_check(handle: &BufferHandle) -> bool {
    // One slot is reserved for the metadata descriptor, which the declared
    // count does not include.
    let populated = handle.populated_fd_slots();
    if handle.fd_count() + 1 != populated {
        error!(
            fd_count = handle.fd_count(),
            populated, "count of valid buffer fds does not match the declared fd count"
        );
        return false;
    }

    let page_size = rustix::param::page_size() as u64;
    let size_within_page = |fd: BorrowedFd<'_>, declared: u64| -> bool {
        match probe_size(fd) {
            // A failed probe is inconclusive, not a violation.
            None => true,
            Some(size) => size >= declared && size - declared <= page_size,
        }
    };

    for slot in 0..handle.fd_count() {
        match handle.fd(slot) {
            Some(fd) if size_within_page(fd, handle.alloc_size(slot)) => {}
            _ => {
                error!(slot, "descriptor size is not within a page of its declared allocation size");
                return false;
            }
        }
    }

    match handle.metadata_fd() {
        Some(fd) if size_within_page(fd, handle.attr_size()) => true,
        _ => {
            error!("metadata descriptor size is not within a page of its declared size");
            false
        }
    }
}

/// Non-destructive size probe of a descriptor's underlying kernel object.
///
/// Seeks to the end to learn the size, then restores the previous offset.
/// Returns `None` if the size cannot be determined.
fn probe_size(fd: BorrowedFd<'_>) -> Option<u64> {
    let current = seek(fd, SeekFrom::Current(0)).ok()?;
    let size = seek(fd, SeekFrom::End(0)).ok()?;
    let _ = seek(fd, SeekFrom::Start(current));
    Some(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::io::OwnedFd;
    use std::ptr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    use crate::handle::{HandleInner, HANDLE_MAGIC, MAX_FDS};

    #[derive(Debug, Default)]
    struct TestMapper {
        map_calls: AtomicUsize,
        unmap_calls: AtomicUsize,
        fail_next_map: AtomicBool,
    }

    impl BufferMapper for Arc<TestMapper> {
        fn map(&self, handle: &BufferHandle) -> io::Result<()> {
            self.map_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next_map.swap(false, Ordering::SeqCst) {
                return Err(io::Error::from_raw_os_error(Errno::NOMEM.raw_os_error()));
            }
            for slot in 0..handle.fd_count() {
                handle.set_cached_base(slot, 0x1000 * (slot + 1));
            }
            Ok(())
        }

        fn unmap(&self, handle: &BufferHandle) {
            self.unmap_calls.fetch_add(1, Ordering::SeqCst);
            handle.clear_cached_bases();
        }
    }

    fn registry() -> (BufferRegistry, Arc<TestMapper>) {
        let mapper = Arc::new(TestMapper::default());
        (BufferRegistry::new(mapper.clone()), mapper)
    }

    fn sized_fd(len: u64) -> OwnedFd {
        let file = tempfile::tempfile().unwrap();
        file.set_len(len).unwrap();
        OwnedFd::from(file)
    }

    /// Handle whose descriptors' real sizes match their declared sizes.
    fn test_handle(sizes: &[u64], attr_size: u64) -> BufferHandle {
        let mut builder = BufferHandle::builder();
        for &size in sizes {
            assert!(builder.add_fd(sized_fd(size), size));
        }
        builder.metadata_fd(sized_fd(attr_size), attr_size);
        builder.build().unwrap()
    }

    #[test]
    fn retain_map_release_lifecycle() {
        let (registry, mapper) = registry();
        let handle = test_handle(&[4096, 8192], 4096);

        for _ in 0..3 {
            registry.retain(&handle).unwrap();
        }
        registry.map(&handle).unwrap();

        for _ in 0..3 {
            registry.release(&handle).unwrap();
        }

        assert_eq!(mapper.map_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mapper.unmap_calls.load(Ordering::SeqCst), 1);

        // The entry is gone; further operations reject the handle.
        assert!(matches!(registry.validate(&handle), Err(BufferError::InvalidHandle)));
        assert!(matches!(registry.release(&handle), Err(BufferError::InvalidHandle)));
        assert_eq!(mapper.unmap_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn map_is_idempotent() {
        let (registry, mapper) = registry();
        let handle = test_handle(&[4096], 4096);

        registry.retain(&handle).unwrap();
        registry.map(&handle).unwrap();
        registry.map(&handle).unwrap();

        assert_eq!(mapper.map_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn map_requires_import() {
        let (registry, mapper) = registry();
        let handle = test_handle(&[4096], 4096);

        assert!(matches!(registry.map(&handle), Err(BufferError::InvalidHandle)));
        assert_eq!(mapper.map_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retain_rejects_forged_handle() {
        let (registry, _) = registry();
        let handle = test_handle(&[4096], 4096);
        let inner = Arc::into_inner(handle.0).unwrap();
        let forged = BufferHandle(Arc::new(HandleInner {
            magic: HANDLE_MAGIC ^ 0xff,
            ..inner
        }));

        assert!(matches!(registry.retain(&forged), Err(BufferError::InvalidHandle)));
        assert!(matches!(registry.validate(&forged), Err(BufferError::InvalidHandle)));
    }

    #[test]
    fn validate_after_retain_succeeds() {
        let (registry, _) = registry();
        let handle = test_handle(&[4096], 4096);

        registry.retain(&handle).unwrap();
        registry.validate(&handle).unwrap();
        for slot in 0..MAX_BUFFER_FDS {
            assert_eq!(handle.cached_base(slot), 0);
        }
    }

    #[test]
    fn validate_rejects_unimported_handle() {
        let (registry, _) = registry();
        let handle = test_handle(&[4096], 4096);

        assert!(matches!(registry.validate(&handle), Err(BufferError::InvalidHandle)));
    }

    #[test]
    fn validate_rejects_stale_base_on_unmapped_buffer() {
        let (registry, _) = registry();
        let handle = test_handle(&[4096], 4096);

        registry.retain(&handle).unwrap();
        handle.set_cached_base(0, 0xdead_0000);

        assert!(matches!(registry.validate(&handle), Err(BufferError::InvalidHandle)));
    }

    #[test]
    fn validate_rejects_diverged_mapping() {
        let (registry, _) = registry();
        let handle = test_handle(&[4096], 4096);

        registry.retain(&handle).unwrap();
        registry.map(&handle).unwrap();
        registry.validate(&handle).unwrap();

        handle.set_cached_base(0, 0xbad_000);
        assert!(matches!(registry.validate(&handle), Err(BufferError::InvalidHandle)));
    }

    #[test]
    fn release_of_unimported_handle_performs_no_unmap() {
        let (registry, mapper) = registry();
        let handle = test_handle(&[4096], 4096);

        assert!(matches!(registry.release(&handle), Err(BufferError::InvalidHandle)));
        assert_eq!(mapper.unmap_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_retains_then_releases() {
        const THREADS: usize = 8;

        let (registry, mapper) = registry();
        let registry = Arc::new(registry);
        let handle = test_handle(&[4096], 4096);

        let retains: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = registry.clone();
                let handle = handle.clone();
                thread::spawn(move || registry.retain(&handle).unwrap())
            })
            .collect();
        for t in retains {
            t.join().unwrap();
        }

        registry.map(&handle).unwrap();

        // While any reference is outstanding the entry must stay visible.
        for _ in 0..THREADS - 1 {
            registry.release(&handle).unwrap();
            registry.validate(&handle).unwrap();
        }
        registry.release(&handle).unwrap();

        assert!(matches!(registry.validate(&handle), Err(BufferError::InvalidHandle)));
        assert_eq!(mapper.map_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mapper.unmap_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_releases_erase_entry_once() {
        const THREADS: usize = 8;

        let (registry, mapper) = registry();
        let registry = Arc::new(registry);
        let handle = test_handle(&[4096], 4096);

        for _ in 0..THREADS {
            registry.retain(&handle).unwrap();
        }
        registry.map(&handle).unwrap();

        let releases: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = registry.clone();
                let handle = handle.clone();
                thread::spawn(move || registry.release(&handle).unwrap())
            })
            .collect();
        for t in releases {
            t.join().unwrap();
        }

        assert!(matches!(registry.validate(&handle), Err(BufferError::InvalidHandle)));
        assert_eq!(mapper.unmap_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sanity_check_rejects_inflated_descriptor() {
        let (registry, mapper) = registry();
        let page_size = rustix::param::page_size() as u64;

        let mut builder = BufferHandle::builder();
        assert!(builder.add_fd(sized_fd(4096), 4096));
        // Declared 8192, but the kernel object is two pages larger.
        assert!(builder.add_fd(sized_fd(8192 + 2 * page_size), 8192));
        builder.metadata_fd(sized_fd(4096), 4096);
        let handle = builder.build().unwrap();

        registry.retain(&handle).unwrap();
        assert!(matches!(registry.map(&handle), Err(BufferError::InvalidHandle)));
        assert_eq!(mapper.map_calls.load(Ordering::SeqCst), 0);

        // An exact match maps fine.
        let exact = test_handle(&[4096, 8192], 4096);
        registry.retain(&exact).unwrap();
        registry.map(&exact).unwrap();
        assert_eq!(mapper.map_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sanity_check_rejects_shrunk_descriptor() {
        let (registry, mapper) = registry();

        let mut builder = BufferHandle::builder();
        assert!(builder.add_fd(sized_fd(4096), 8192));
        builder.metadata_fd(sized_fd(4096), 4096);
        let handle = builder.build().unwrap();

        registry.retain(&handle).unwrap();
        assert!(matches!(registry.map(&handle), Err(BufferError::InvalidHandle)));
        assert_eq!(mapper.map_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sanity_check_rejects_fd_count_mismatch() {
        let (registry, mapper) = registry();

        // Declared one client descriptor, but three slots are populated:
        // the sentinel scan finds an extra descriptor past the metadata one.
        let mut fds: [Option<OwnedFd>; MAX_FDS] = Default::default();
        fds[0] = Some(sized_fd(4096));
        fds[1] = Some(sized_fd(4096));
        fds[2] = Some(sized_fd(4096));
        let handle = BufferHandle(Arc::new(HandleInner {
            magic: HANDLE_MAGIC,
            fds,
            fd_count: 1,
            alloc_sizes: [4096, 0, 0, 0],
            attr_size: 4096,
            bases: Default::default(),
            attr_base: AtomicUsize::new(0),
        }));

        registry.retain(&handle).unwrap();
        assert!(matches!(registry.map(&handle), Err(BufferError::InvalidHandle)));
        assert_eq!(mapper.map_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn map_error_is_propagated_and_leaves_state_unmapped() {
        let (registry, mapper) = registry();
        let handle = test_handle(&[4096], 4096);

        registry.retain(&handle).unwrap();
        mapper.fail_next_map.store(true, Ordering::SeqCst);

        let err = registry.map(&handle).unwrap_err();
        assert!(matches!(err, BufferError::Map(_)));
        assert_eq!(err.errno(), -Errno::NOMEM.raw_os_error());

        // The failed attempt did not mutate the tracked state; a retry maps.
        registry.validate(&handle).unwrap();
        registry.map(&handle).unwrap();
        assert_eq!(mapper.map_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalid_handle_errno_is_einval() {
        assert_eq!(BufferError::InvalidHandle.errno(), -Errno::INVAL.raw_os_error());
    }

    #[test]
    fn release_unmaps_metadata_region() {
        let (registry, _) = registry();
        let page_size = rustix::param::page_size();
        let handle = test_handle(&[4096], page_size as u64);

        registry.retain(&handle).unwrap();

        // SAFETY: fresh anonymous mapping of exactly one page.
        let base = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                page_size,
                rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                rustix::mm::MapFlags::PRIVATE,
            )
            .unwrap()
        };
        handle.set_attr_base(base as usize);

        registry.release(&handle).unwrap();
        assert_eq!(handle.attr_base(), 0);
    }
}
