#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # dmabuf-registry
//!
//! Reference counting and address-space mapping management for graphics
//! buffers shared through kernel dma-buf file descriptors.
//!
//! Producers, consumers and compositors all import the same buffer by its
//! [`BufferHandle`]. The process-wide [`BufferRegistry`] counts those
//! importers, maps the buffer's memory lazily on first use, and releases the
//! kernel-side mappings exactly once, when the last importer drops its
//! reference. All of this is safe under concurrent access from arbitrary
//! threads.
//!
//! The registry does not allocate buffers and does not establish mappings
//! itself; those are the allocator's primitives, plugged in through the
//! [`BufferMapper`] trait.
//!
//! ## How to use
//!
//! Construct one registry per process at driver initialization and share it
//! by reference with every call site:
//!
//! ```no_run
//! use std::io;
//!
//! use dmabuf_registry::{BufferHandle, BufferMapper, BufferRegistry};
//!
//! #[derive(Debug)]
//! struct IonMapper;
//!
//! impl BufferMapper for IonMapper {
//!     fn map(&self, handle: &BufferHandle) -> io::Result<()> {
//!         // mmap every client descriptor, then publish the bases:
//!         // handle.set_cached_base(slot, base);
//!         # let _ = handle;
//!         Ok(())
//!     }
//!
//!     fn unmap(&self, handle: &BufferHandle) {
//!         // munmap what `map` established and clear the cached bases.
//!         # let _ = handle;
//!     }
//! }
//!
//! # fn import(handle: &BufferHandle) -> Result<(), dmabuf_registry::BufferError> {
//! let registry = BufferRegistry::new(IonMapper);
//!
//! registry.retain(handle)?;
//! registry.map(handle)?;
//! // ... use the buffer ...
//! registry.release(handle)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! This crate makes use of [`tracing`] for its internal logging; contract
//! violations by callers and consistency failures of handles are reported at
//! `error` level.

pub mod handle;
pub mod mapper;
pub mod registry;

pub use handle::{BufferHandle, HandleBuilder, MAX_BUFFER_FDS};
pub use mapper::BufferMapper;
pub use registry::{BufferError, BufferRegistry};
