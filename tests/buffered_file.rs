//! Buffered file integration tests
//!
//! Drives `BufferedFile` end to end against the in-memory store:
//! - Caching and flush behaviour
//! - Close semantics (flush-on-close, failures, outstanding AIO)
//! - Asynchronous entry points
//! - Concurrency across independent files

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use crossbeam::channel;

use objbuf::oss::{BufferedFile, DirectFile, IoVec, OssFile};
use objbuf::store::{AioMode, MemoryStore, ObjectStore, OpenFlags};
use objbuf::{AdapterKind, AioRead, AioWrite, BufferConfig, CacheState, Error};

fn config(capacity: usize, adapter: AdapterKind) -> BufferConfig {
    BufferConfig {
        buffer_size: capacity,
        adapter,
        ..Default::default()
    }
}

fn buffered(store: &MemoryStore, config: BufferConfig) -> BufferedFile {
    let store: Arc<dyn ObjectStore> = Arc::new(store.clone());
    let direct = DirectFile::new(Arc::clone(&store), config.readv);
    BufferedFile::new(Box::new(direct), store, config)
}

fn read_write_create() -> OpenFlags {
    OpenFlags {
        read: true,
        write: true,
        create: true,
        truncate: true,
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

// =============================================================================
// Caching & Flush
// =============================================================================

mod caching {
    use super::*;

    fn write_then_read_from_cache(adapter: AdapterKind) {
        let store = MemoryStore::new();
        let mut file = buffered(&store, config(4096, adapter));
        file.open("/scenario", read_write_create()).unwrap();

        let data = pattern(1000, 7);
        assert_eq!(file.write(&data, 0).unwrap(), 1000);

        let mut out = vec![0u8; 1000];
        assert_eq!(file.read(&mut out, 0).unwrap(), 1000);
        assert_eq!(out, data);
        assert_eq!(store.counts().total_reads(), 0);
        assert_eq!(store.counts().total_writes(), 0);

        file.close().unwrap();

        let log = store.write_log();
        assert_eq!(log.len(), 1);
        assert_eq!((log[0].offset, log[0].len), (0, 1000));
        assert_eq!(store.object("/scenario").unwrap(), data);

        let summary = file.summary().unwrap();
        assert_eq!(summary.write_bytes, 1000);
        assert_eq!(summary.read_bytes, 1000);
        assert_eq!(summary.io.write.bytes, 1000);
        assert_eq!(summary.io.write.requests, 1);
        assert_eq!(summary.io.read.requests, 0);
    }

    #[test]
    fn test_write_then_read_served_from_cache_sync() {
        write_then_read_from_cache(AdapterKind::Sync);
    }

    #[test]
    fn test_write_then_read_served_from_cache_async() {
        write_then_read_from_cache(AdapterKind::Async);
    }

    #[test]
    fn test_flush_with_nothing_staged() {
        let store = MemoryStore::new();
        let mut file = buffered(&store, config(4096, AdapterKind::Sync));
        file.open("/empty", read_write_create()).unwrap();

        assert_eq!(file.flush().unwrap(), 0);
        assert_eq!(store.counts().total_writes(), 0);
        file.close().unwrap();
        assert_eq!(store.counts().total_writes(), 0);
    }

    #[test]
    fn test_flush_failure_keeps_bytes_for_retry() {
        let store = MemoryStore::new();
        let mut file = buffered(&store, config(4096, AdapterKind::Sync));
        file.open("/retry", read_write_create()).unwrap();
        file.write(b"hello", 100).unwrap();

        store.fail_next_writes(1, libc::EIO);
        assert_eq!(file.flush().unwrap_err().errno(), -libc::EIO);
        assert_eq!(file.cache_state(), Some(CacheState::WritePending));

        assert_eq!(file.flush().unwrap(), 5);
        let log = store.write_log();
        assert_eq!(log.len(), 1);
        assert_eq!((log[0].offset, log[0].len), (100, 5));
        assert_eq!(&store.object("/retry").unwrap()[100..], b"hello");
        file.close().unwrap();
    }

    #[test]
    fn test_sequential_writes_coalesce_into_buffer_sized_flushes() {
        let store = MemoryStore::new();
        let mut file = buffered(&store, config(1024, AdapterKind::Sync));
        file.open("/seq", read_write_create()).unwrap();

        let data = pattern(10 * 1024 + 100, 3);
        for (i, chunk) in data.chunks(100).enumerate() {
            file.write(chunk, (i * 100) as u64).unwrap();
        }
        file.close().unwrap();

        assert_eq!(store.object("/seq").unwrap(), data);
        let log = store.write_log();
        assert!(log.iter().all(|w| w.len <= 1024));
        // 100-byte writes into a 1024-byte buffer flush every 1000 bytes
        assert_eq!(log.len(), data.len().div_ceil(1000));
    }

    #[test]
    fn test_read_through_large_object() {
        let store = MemoryStore::new();
        let data = pattern(50_000, 11);
        store.insert("/big", data.clone());

        let mut file = buffered(&store, config(8192, AdapterKind::Sync));
        file.open("/big", OpenFlags::read_only()).unwrap();

        let mut out = vec![0u8; 60_000];
        assert_eq!(file.read(&mut out, 0).unwrap(), 50_000);
        assert_eq!(&out[..50_000], &data[..]);
        // ceil(50_000 / 8192) fills; the last is short
        assert_eq!(store.counts().preads, 7);
        file.close().unwrap();
    }
}

// =============================================================================
// Close Semantics
// =============================================================================

mod close {
    use super::*;

    #[test]
    fn test_flush_failure_still_closes_descriptor() {
        let store = MemoryStore::new();
        let mut file = buffered(&store, config(4096, AdapterKind::Sync));
        file.open("/fail", read_write_create()).unwrap();
        file.write(b"doomed", 0).unwrap();

        store.fail_next_writes(1, libc::ENOSPC);
        let err = file.close().unwrap_err();
        assert_matches!(&err, Error::FlushOnClose { .. });
        assert_eq!(err.errno(), -libc::ENOSPC);

        assert_eq!(store.open_fds(), 0);
        assert_eq!(store.counts().closes, 1);
        assert!(file.fd().is_none());
    }

    #[test]
    fn test_flush_error_wins_over_close_error() {
        let store = MemoryStore::new();
        let mut file = buffered(&store, config(4096, AdapterKind::Sync));
        file.open("/fail", read_write_create()).unwrap();
        file.write(b"doomed", 0).unwrap();

        store.fail_next_writes(1, libc::EIO);
        store.fail_next_closes(1, libc::EBADF);
        let err = file.close().unwrap_err();
        assert_matches!(err, Error::FlushOnClose { source, .. } if source.errno() == -libc::EIO);
    }

    #[test]
    fn test_close_not_open() {
        let store = MemoryStore::new();
        let mut file = buffered(&store, config(4096, AdapterKind::Sync));
        assert_matches!(file.close(), Err(Error::NotOpen));
    }

    #[test]
    fn test_read_only_file_rejects_writes() {
        let store = MemoryStore::new();
        store.insert("/r", vec![0u8; 16]);
        let mut file = buffered(&store, config(64, AdapterKind::Sync));
        file.open("/r", OpenFlags::read_only()).unwrap();

        assert_eq!(file.write(b"lost", 0).unwrap_err().errno(), -libc::EBADF);
        let aio = file.write_aio(AioWrite::new(0, b"lost".to_vec(), |_| {
            panic!("completion must not run")
        }));
        assert_eq!(aio.unwrap_err().errno(), -libc::EBADF);
        assert_eq!(file.cache_state(), Some(CacheState::Idle));

        file.close().unwrap();
        assert_eq!(store.object("/r").unwrap(), vec![0u8; 16]);
        assert_eq!(file.summary().unwrap().write_bytes, 0);
        assert_eq!(store.counts().total_writes(), 0);
    }

    #[test]
    fn test_open_failure_propagates() {
        let store = MemoryStore::new();
        store.fail_next_opens(1, libc::EACCES);
        let mut file = buffered(&store, config(4096, AdapterKind::Async));

        let err = file.open("/denied", read_write_create()).unwrap_err();
        assert_eq!(err.errno(), -libc::EACCES);
        assert!(file.fd().is_none());
        assert!(file.summary().is_none());
    }

    #[test]
    fn test_close_refuses_while_aio_outstanding() {
        let store = MemoryStore::with_aio_mode(AioMode::Deferred);
        store.insert("/slow", pattern(64, 1));
        let cfg = BufferConfig {
            close_wait_ms: 20,
            ..config(4096, AdapterKind::Async)
        };
        let mut file = buffered(&store, cfg);
        file.open("/slow", OpenFlags::read_only()).unwrap();

        let (tx, rx) = channel::bounded(1);
        file.read_aio(AioRead::new(0, 16, move |r| tx.send(r).unwrap()))
            .unwrap();
        assert_eq!(file.outstanding_aio(), 1);

        assert_matches!(file.close(), Err(Error::AioInFlight { outstanding: 1, .. }));
        assert!(file.fd().is_some());

        store.run_pending_completions();
        assert_eq!(rx.recv().unwrap().unwrap(), Bytes::from(pattern(16, 1)));
        file.close().unwrap();
        assert_eq!(store.open_fds(), 0);
    }

    #[test]
    fn test_close_waits_for_completion() {
        let store = MemoryStore::with_aio_mode(AioMode::Deferred);
        let mut file = buffered(&store, config(4096, AdapterKind::Async));
        file.open("/w", read_write_create()).unwrap();

        file.write_aio(AioWrite::new(0, b"late".to_vec(), |r| {
            assert_eq!(r.unwrap(), 4);
        }))
        .unwrap();

        let pump = {
            let store = store.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                store.run_pending_completions()
            })
        };

        file.close().unwrap();
        assert_eq!(pump.join().unwrap(), 1);
        assert_eq!(store.object("/w").unwrap(), b"late".to_vec());
        assert_eq!(file.summary().unwrap().write_aio_bytes, 4);
    }
}

// =============================================================================
// Asynchronous I/O
// =============================================================================

mod aio {
    use super::*;

    #[test]
    fn test_write_aio_then_read_aio_hits_cache() {
        let store = MemoryStore::new();
        let mut file = buffered(&store, config(4096, AdapterKind::Async));
        file.open("/aio", read_write_create()).unwrap();

        let (tx, rx) = channel::bounded(1);
        file.write_aio(AioWrite::new(0, pattern(512, 9), move |r| tx.send(r).unwrap()))
            .unwrap();
        assert_eq!(rx.recv().unwrap().unwrap(), 512);

        let (tx, rx) = channel::bounded(1);
        file.read_aio(AioRead::new(100, 50, move |r| tx.send(r).unwrap()))
            .unwrap();
        // Cache hit completes before read_aio returns
        let bytes = rx.try_recv().unwrap().unwrap();
        assert_eq!(&bytes[..], &pattern(512, 9)[100..150]);
        assert_eq!(store.counts().total_reads(), 0);

        file.close().unwrap();
        let summary = file.summary().unwrap();
        assert_eq!(summary.write_aio_bytes, 512);
        assert_eq!(summary.read_aio_bytes, 50);
    }

    #[test]
    fn test_second_aio_rejected() {
        let store = MemoryStore::with_aio_mode(AioMode::Deferred);
        store.insert("/busy", pattern(128, 2));
        let mut file = buffered(&store, config(4096, AdapterKind::Async));
        file.open("/busy", OpenFlags::read_only()).unwrap();

        file.read_aio(AioRead::new(0, 8, |_| {})).unwrap();
        assert_eq!(file.cache_state(), Some(CacheState::AioInFlight));

        let err = file
            .read_aio(AioRead::new(8, 8, |_| panic!("rejected request completed")))
            .unwrap_err();
        assert_eq!(err.errno(), -libc::EBUSY);

        store.run_pending_completions();
        assert_eq!(file.cache_state(), Some(CacheState::CachedValid));
        file.close().unwrap();
    }

    #[test]
    fn test_aio_read_error_reaches_completion() {
        let store = MemoryStore::new();
        store.insert("/bad", pattern(128, 2));
        let mut file = buffered(&store, config(4096, AdapterKind::Async));
        file.open("/bad", OpenFlags::read_only()).unwrap();

        store.fail_next_reads(1, libc::EIO);
        let (tx, rx) = channel::bounded(1);
        file.read_aio(AioRead::new(0, 8, move |r| tx.send(r).unwrap()))
            .unwrap();
        let err = rx.recv().unwrap().unwrap_err();
        assert_eq!(err.errno(), -libc::EIO);

        file.close().unwrap();
        assert_eq!(file.summary().unwrap().read_aio_bytes, 0);
    }

    #[test]
    fn test_sync_adapter_aio_completes_inline() {
        let store = MemoryStore::new();
        store.insert("/inline", pattern(64, 4));
        let mut file = buffered(&store, config(4096, AdapterKind::Sync));
        file.open("/inline", OpenFlags::read_only()).unwrap();

        let (tx, rx) = channel::bounded(1);
        file.read_aio(AioRead::new(0, 64, move |r| tx.send(r).unwrap()))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), Bytes::from(pattern(64, 4)));
        file.close().unwrap();
    }
}

// =============================================================================
// Pass-through Operations
// =============================================================================

mod pass_through {
    use super::*;

    #[test]
    fn test_readv_counts_bytes() {
        let store = MemoryStore::new();
        let data = pattern(1000, 5);
        store.insert("/v", data.clone());
        let mut file = buffered(&store, config(4096, AdapterKind::Sync));
        file.open("/v", OpenFlags::read_only()).unwrap();

        let mut a = [0u8; 10];
        let mut b = [0u8; 20];
        let mut iov = [IoVec::new(0, &mut a), IoVec::new(500, &mut b)];
        assert_eq!(file.readv(&mut iov).unwrap(), 30);
        assert_eq!(&a[..], &data[..10]);
        assert_eq!(&b[..], &data[500..520]);

        file.close().unwrap();
        let summary = file.summary().unwrap();
        assert_eq!(summary.readv_bytes, 30);
        assert_eq!(summary.read_bytes, 0);
    }

    #[test]
    fn test_fstat_ftruncate_fsync() {
        let store = MemoryStore::new();
        store.insert("/p", vec![1u8; 100]);
        let mut file = buffered(&store, config(4096, AdapterKind::Sync));
        file.open("/p", OpenFlags::read_write()).unwrap();

        assert_eq!(file.fstat().unwrap().size, 100);
        file.ftruncate(10).unwrap();
        assert_eq!(file.fstat().unwrap().size, 10);
        file.fsync().unwrap();
        assert_eq!(store.counts().fsyncs, 1);
        file.close().unwrap();
    }

    #[test]
    fn test_read_raw_bypasses_cache() {
        let store = MemoryStore::new();
        store.insert("/raw", pattern(64, 8));
        let mut file = buffered(&store, config(4096, AdapterKind::Sync));
        file.open("/raw", OpenFlags::read_only()).unwrap();

        let mut buf = [0u8; 8];
        file.read(&mut buf, 0).unwrap();
        file.read_raw(&mut buf, 0).unwrap();
        assert_eq!(store.counts().preads, 2);
        file.close().unwrap();
    }
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency {
    use super::*;

    #[test]
    fn test_disjoint_files_keep_independent_counters() {
        let store = MemoryStore::new();
        let threads: Vec<_> = (0..8u8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let adapter = if t % 2 == 0 {
                        AdapterKind::Sync
                    } else {
                        AdapterKind::Async
                    };
                    let mut file = buffered(&store, config(1000, adapter));
                    let path = format!("/thread-{t}");
                    file.open(&path, read_write_create()).unwrap();

                    let chunk = pattern(300, t);
                    let rounds = 20 + t as usize;
                    for i in 0..rounds {
                        file.write(&chunk, (i * 300) as u64).unwrap();
                    }
                    file.close().unwrap();
                    (path, rounds, file.summary().unwrap())
                })
            })
            .collect();

        for handle in threads {
            let (path, rounds, summary) = handle.join().unwrap();
            let expected = (rounds * 300) as u64;
            assert_eq!(summary.write_bytes, expected);
            assert_eq!(summary.io.write.bytes, expected);
            assert_eq!(store.object(&path).unwrap().len() as u64, expected);
        }
        assert_eq!(store.open_fds(), 0);
    }
}
