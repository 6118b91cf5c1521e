use std::io::Write;
use std::path::{Path, PathBuf};

use spak_core::config::CacheConfig;
use spak_core::crypto::hex::parse_hex_array;
use spak_core::error::{Result, SpakError};
use spak_core::{ChunkLayout, OpenParams, SignedArchive, SignedArchiveReader};

use crate::presentation::cli::{CacheArgs, KeyArgs};
use tracing::debug;

/// `--config` file first, then individual flags on top.
pub fn cache_config(args: &CacheArgs) -> Result<CacheConfig> {
    let mut cfg = match &args.config {
        Some(path) => load_config(path)?,
        None => CacheConfig::default(),
    };
    if let Some(v) = args.chunk_size {
        cfg.chunk_data_size = v;
    }
    if let Some(v) = args.pool_size {
        cfg.pool_size = v;
    }
    if let Some(v) = args.precache {
        cfg.precache_chunks = v;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn load_config(path: &Path) -> Result<CacheConfig> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| SpakError::Config(format!("{}: {e}", path.display())))
}

fn archive_from_args(archive: PathBuf, keys: KeyArgs, cache: CacheArgs) -> Result<SignedArchive> {
    let public_key = parse_hex_array::<32>(&keys.pubkey_hex)?;
    let cipher_key = keys
        .key_hex
        .map(|h| parse_hex_array::<32>(&h))
        .transpose()?;
    let key_salt = keys
        .key_salt_hex
        .map(|h| parse_hex_array::<32>(&h))
        .transpose()?
        .unwrap_or([0u8; 32]);

    let params = OpenParams {
        archive_path: archive,
        public_key,
        cipher_key,
        key_salt,
        cache: cache_config(&cache)?,
    };
    debug!(config = ?params.cache, "cache config");
    SignedArchive::open(&params)
}

/// Resolve `--start`/`--len` against the archive; a missing length runs to
/// the end.
fn range_len(total: u64, start: u64, len: Option<u64>) -> Result<u64> {
    match len {
        Some(l) => Ok(l),
        None => total.checked_sub(start).ok_or(SpakError::OutOfBounds {
            pos: start,
            len: 0,
            size: total,
        }),
    }
}

fn copy_range(
    reader: &mut SignedArchiveReader,
    start: u64,
    len: u64,
    out: &mut dyn Write,
) -> Result<u64> {
    reader.seek_to(start);
    let block = reader.layout().chunk_data_size().max(4096) as usize;
    let mut buf = vec![0u8; block.min(len as usize)];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        reader.read_into(&mut buf[..n])?;
        out.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(len)
}

pub fn handle_info(archive: PathBuf, signature_len: u64, cache: CacheArgs) -> Result<()> {
    let cfg = cache_config(&cache)?;
    let raw_size = std::fs::metadata(&archive)?.len();
    let layout = ChunkLayout::new(raw_size, cfg.chunk_data_size, signature_len)?;
    println!("archive:      {}", archive.display());
    println!("raw size:     {}", layout.raw_size());
    println!("chunk size:   {}", layout.chunk_data_size());
    println!("signature:    {}", layout.signature_size());
    println!("chunks:       {}", layout.chunk_count());
    println!("logical size: {}", layout.logical_size());
    Ok(())
}

pub fn handle_verify(archive: PathBuf, keys: KeyArgs, cache: CacheArgs) -> Result<()> {
    let spak = archive_from_args(archive, keys, cache)?;
    let report = spak.verify_all()?;
    let stats = spak.stats();
    eprintln!(
        "verify: OK ({} chunks, {} bytes; verified={} evictions={} stalls={})",
        report.chunks, report.bytes, stats.verified, stats.evictions, stats.stalls
    );
    Ok(())
}

pub fn handle_cat(
    archive: PathBuf,
    start: u64,
    len: Option<u64>,
    keys: KeyArgs,
    cache: CacheArgs,
) -> Result<()> {
    let spak = archive_from_args(archive, keys, cache)?;
    let len = range_len(spak.total_size(), start, len)?;
    let mut reader = spak.reader();
    let mut out = std::io::stdout().lock();
    copy_range(&mut reader, start, len, &mut out)?;
    out.flush()?;
    Ok(())
}

pub fn handle_get(
    archive: PathBuf,
    out: PathBuf,
    start: u64,
    len: Option<u64>,
    keys: KeyArgs,
    cache: CacheArgs,
) -> Result<()> {
    let spak = archive_from_args(archive, keys, cache)?;
    let len = range_len(spak.total_size(), start, len)?;
    let mut reader = spak.reader();
    // Staged: a failed read leaves `out` untouched.
    let mut tmp = tempfile::NamedTempFile::new_in(
        out.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new(".")),
    )?;
    let n = copy_range(&mut reader, start, len, tmp.as_file_mut())?;
    tmp.persist(&out).map_err(|e| SpakError::Io(e.error))?;
    eprintln!("get: wrote {n} bytes to {}", out.display());
    Ok(())
}
