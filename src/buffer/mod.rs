//! Buffering core
//!
//! - [`BufferData`]: the staging region and its metadata
//! - [`IoAdapter`]: moves one buffer's bytes to or from the store,
//!   synchronously ([`SyncIoAdapter`]) or asynchronously ([`AsyncIoAdapter`])
//! - [`BufferAlgorithm`]: decides when to fill, serve and flush

pub mod adapter;
pub mod aio_adapter;
pub mod algorithm;
pub mod data;

pub use adapter::{
    AdapterStats, AdapterStatsSnapshot, DirectionSnapshot, DirectionStats, IoAdapter, IoDone,
    SyncIoAdapter,
};
pub use aio_adapter::AsyncIoAdapter;
pub use algorithm::{BufferAlgorithm, CacheState, CacheStats, CacheStatsSnapshot};
pub use data::{BufferData, SharedBuffer};

use std::sync::Arc;

use crate::config::{AdapterKind, BufferConfig};
use crate::error::Result;
use crate::store::{Fd, ObjectStore};

/// Allocate a buffer and adapter for `fd` as `config` describes, and wire
/// them into an algorithm.
pub fn build_algorithm(
    config: &BufferConfig,
    store: Arc<dyn ObjectStore>,
    fd: Fd,
) -> Result<BufferAlgorithm> {
    let buffer = BufferData::new(config.buffer_size)?.into_shared();
    let adapter: Box<dyn IoAdapter> = match config.adapter {
        AdapterKind::Sync => Box::new(SyncIoAdapter::new(Arc::clone(&buffer), store, fd)),
        AdapterKind::Async => Box::new(AsyncIoAdapter::new(
            Arc::clone(&buffer),
            store,
            fd,
            config.aio_wait_warn(),
        )),
    };
    Ok(BufferAlgorithm::new(buffer, adapter))
}
