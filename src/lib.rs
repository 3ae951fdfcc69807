//! objbuf - Buffered I/O for storage-object files
//!
//! A buffering layer that sits between a storage-object file interface
//! (open/read/write/close over a remote object store) and the raw
//! synchronous or asynchronous transport that moves the bytes. Small and
//! sequential reads and writes are absorbed by a per-file staging buffer,
//! scattered reads are grouped into batched transport reads, and every open
//! file keeps byte and latency statistics that are logged when it closes.
//!
//! # Architecture
//!
//! ```text
//! application
//!     │
//!     ▼
//! BufferedFile ──pass-through──▶ DirectFile ──readv──▶ ExtentCoalescer
//!     │                              │
//!     ▼                              │
//! BufferAlgorithm                    │
//!     │                              │
//!     ├──▶ BufferData                │
//!     ▼                              ▼
//! IoAdapter (sync | async) ───────▶ ObjectStore (MemoryStore | PosixStore)
//! ```
//!
//! # Modules
//!
//! - [`aio`] - Asynchronous request types and in-flight accounting
//! - [`buffer`] - Staging buffer, I/O adapters and the buffering algorithm
//! - [`config`] - Buffering configuration
//! - [`error`] - Error types
//! - [`oss`] - Storage-object file interface, direct and buffered files
//! - [`readv`] - Extent coalescing for vectored reads
//! - [`store`] - Transport trait and the memory and local-filesystem stores

pub mod aio;
pub mod buffer;
pub mod config;
pub mod error;
pub mod oss;
pub mod readv;
pub mod store;

// Re-export commonly used types
pub use aio::{AioRead, AioWrite};
pub use buffer::{BufferAlgorithm, BufferData, CacheState};
pub use config::{AdapterKind, BufferConfig, CoalescePolicy};
pub use error::{Error, Result};
pub use oss::{BufferedFile, DirectFile, FileSummary, IoVec, Oss, OssFile};
pub use readv::{Extent, ExtentCoalescer, ExtentHolder};
pub use store::{Fd, MemoryStore, ObjectStore, OpenFlags, PosixStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
