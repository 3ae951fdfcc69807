//! objbuf
//!
//! Copies a local file into a storage object through the buffered I/O layer,
//! optionally reads it back to verify it, and reports the per-file summary.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐
//! │ source file  │───▶│ BufferedFile │───▶│   PosixStore     │
//! │ (local disk) │    │  (staging)   │    │ (--root, tokio   │
//! └──────────────┘    └──────────────┘    │  blocking pool)  │
//!                                         └──────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use crossbeam::channel;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use objbuf::{
    AdapterKind, AioRead, AioWrite, BufferConfig, FileSummary, ObjectStore, OpenFlags, Oss,
    OssFile, PosixStore,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// objbuf - copy a file through the buffered storage-object layer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local file to copy
    source: PathBuf,

    /// Destination object path, relative to the store root
    dest: String,

    /// Directory the object store lives in
    #[arg(long, env = "OBJBUF_ROOT", default_value = ".")]
    root: PathBuf,

    /// YAML buffering configuration; flags below override it
    #[arg(long, env = "OBJBUF_CONFIG")]
    config: Option<PathBuf>,

    /// Staging buffer size in bytes
    #[arg(long, env = "OBJBUF_BUFFER_SIZE")]
    buffer_size: Option<usize>,

    /// I/O adapter (sync, async)
    #[arg(long, env = "OBJBUF_ADAPTER")]
    adapter: Option<AdapterKind>,

    /// Bypass the buffering layer
    #[arg(long)]
    no_buffer: bool,

    /// Size of each application read/write in bytes
    #[arg(long, default_value = "65536")]
    chunk_size: usize,

    /// Issue asynchronous reads and writes instead of blocking ones
    #[arg(long)]
    aio: bool,

    /// Read the object back and compare it with the source
    #[arg(long)]
    verify: bool,

    /// Print file summaries as JSON
    #[arg(long)]
    summary_json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    if args.chunk_size == 0 {
        bail!("--chunk-size must be > 0");
    }

    let config = load_config(&args)?;
    info!("Starting objbuf {}", objbuf::VERSION);
    info!("  Store root: {}", args.root.display());
    info!("  Buffered: {}", config.enabled);
    info!("  Buffer size: {} bytes", config.buffer_size);
    info!("  Adapter: {}", config.adapter);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("objbuf-aio")
        .build()
        .context("failed to build tokio runtime")?;
    let store: Arc<dyn ObjectStore> =
        Arc::new(PosixStore::new(&args.root, runtime.handle().clone()));
    let oss = Oss::new(store, config)?;

    let data = std::fs::read(&args.source)
        .with_context(|| format!("failed to read {}", args.source.display()))?;

    let mut summaries = Vec::new();
    summaries.extend(copy_in(&oss, &args, &data)?);
    if args.verify {
        summaries.extend(verify(&oss, &args, &data)?);
    }

    report(&args, &summaries)?;
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<BufferConfig> {
    let mut config = match &args.config {
        Some(path) => BufferConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => BufferConfig::default(),
    };
    if let Some(size) = args.buffer_size {
        config.buffer_size = size;
    }
    if let Some(adapter) = args.adapter {
        config.adapter = adapter;
    }
    if args.no_buffer {
        config.enabled = false;
    }
    config.validate().context("invalid buffering configuration")?;
    Ok(config)
}

// =============================================================================
// Copy & Verify
// =============================================================================

fn copy_in(oss: &Oss, args: &Args, data: &[u8]) -> anyhow::Result<Option<FileSummary>> {
    let mut file = oss.new_file();
    file.open(&args.dest, OpenFlags::create_truncate())
        .with_context(|| format!("failed to open {}", args.dest))?;

    let mut offset = 0u64;
    for chunk in data.chunks(args.chunk_size) {
        let n = if args.aio {
            write_aio(file.as_ref(), chunk, offset)?
        } else {
            file.write(chunk, offset)?
        };
        if n != chunk.len() {
            bail!("short write at offset {offset}: {n} of {} bytes", chunk.len());
        }
        offset += n as u64;
    }

    file.close()
        .with_context(|| format!("failed to close {}", args.dest))?;
    info!(bytes = offset, dest = %args.dest, "copy complete");
    Ok(file.summary())
}

fn verify(oss: &Oss, args: &Args, expected: &[u8]) -> anyhow::Result<Option<FileSummary>> {
    let stat = oss.stat(&args.dest)?;
    if stat.size != expected.len() as u64 {
        bail!(
            "size mismatch: object has {} bytes, source has {}",
            stat.size,
            expected.len()
        );
    }

    let mut file = oss.new_file();
    file.open(&args.dest, OpenFlags::read_only())
        .with_context(|| format!("failed to open {}", args.dest))?;

    let mut offset = 0usize;
    let mut buf = vec![0u8; args.chunk_size];
    loop {
        let n = if args.aio {
            read_aio(file.as_ref(), &mut buf, offset as u64)?
        } else {
            file.read(&mut buf, offset as u64)?
        };
        if n == 0 {
            break;
        }
        let end = offset + n;
        if end > expected.len() || buf[..n] != expected[offset..end] {
            bail!("content mismatch in [{offset}, {end})");
        }
        offset = end;
    }
    if offset != expected.len() {
        bail!("object ended after {offset} of {} bytes", expected.len());
    }

    file.close()?;
    info!(bytes = offset, dest = %args.dest, "verify complete");
    Ok(file.summary())
}

fn write_aio(file: &dyn OssFile, chunk: &[u8], offset: u64) -> anyhow::Result<usize> {
    let (tx, rx) = channel::bounded(1);
    file.write_aio(AioWrite::new(offset, chunk.to_vec(), move |result| {
        let _ = tx.send(result);
    }))?;
    Ok(rx.recv().context("aio write completion dropped")??)
}

fn read_aio(file: &dyn OssFile, buf: &mut [u8], offset: u64) -> anyhow::Result<usize> {
    let (tx, rx) = channel::bounded(1);
    file.read_aio(AioRead::new(offset, buf.len(), move |result| {
        let _ = tx.send(result);
    }))?;
    let bytes = rx.recv().context("aio read completion dropped")??;
    buf[..bytes.len()].copy_from_slice(&bytes);
    Ok(bytes.len())
}

fn report(args: &Args, summaries: &[FileSummary]) -> anyhow::Result<()> {
    if args.summary_json {
        println!("{}", serde_json::to_string_pretty(summaries)?);
        return Ok(());
    }

    for s in summaries {
        println!(
            "{} fd={} adapter={} elapsed={}ms read={} readv={} read_aio={} write={} write_aio={} \
             hits={} misses={} flushes={}",
            s.path,
            s.fd,
            s.adapter,
            s.elapsed_ms,
            s.read_bytes,
            s.readv_bytes,
            s.read_aio_bytes,
            s.write_bytes,
            s.write_aio_bytes,
            s.cache.hits,
            s.cache.misses,
            s.cache.flushes,
        );
    }
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
