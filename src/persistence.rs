//! Versioned binary symbol-statistics cache file (spec §4.6, §6).
//!
//! Layout: magic `0x1090BB46AAA74C9A`, `u32` version, `u32` record count,
//! then that many records of `{u32 id, u16 name_len, name bytes, u64
//! frequency, f64 avg_time_us, u64 last_seen_us}`, all little-endian.
//! The framing discipline — typed errors at every I/O boundary, tolerant
//! reads on a missing/short/unknown-version file rather than failing
//! startup — follows this crate's general error-handling style (see
//! `DESIGN.md` for provenance).

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::CoreError;
use crate::symbol::registry::Symbol;

/// Magic number identifying a symbol-statistics cache file.
pub const MAGIC: u64 = 0x1090_BB46_AAA7_4C9A;

/// The only version this crate writes or understands. A file carrying
/// any other version is treated as absent (spec §4.6: "unknown versions
/// cause the file to be ignored and rewritten").
pub const CURRENT_VERSION: u32 = 1;

/// One symbol's persisted statistics, as read from a cache file.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsRecord {
    pub id: u32,
    pub name: String,
    pub frequency: u64,
    pub avg_time_us: f64,
    pub last_seen_us: u64,
}

fn io_err(err: io::Error) -> CoreError {
    CoreError::PersistenceIoError(err.to_string())
}

/// Serialize every symbol's statistics and atomically replace `path`
/// (write to a sibling temp file, `fsync`, then rename).
///
/// # Errors
/// Returns [`CoreError::PersistenceIoError`] if any symbol's name exceeds
/// 65535 bytes, or if the underlying file operations fail.
pub fn write_cache_file(path: impl AsRef<Path>, symbols: &[Symbol]) -> Result<(), CoreError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
    buf.extend_from_slice(&u32::try_from(symbols.len()).unwrap_or(u32::MAX).to_le_bytes());

    for symbol in symbols {
        let name_bytes = symbol.name.as_bytes();
        let name_len = u16::try_from(name_bytes.len())
            .map_err(|_| CoreError::PersistenceIoError(format!("symbol name '{}' exceeds 65535 bytes", symbol.name)))?;

        buf.extend_from_slice(&u32::try_from(symbol.id).unwrap_or(u32::MAX).to_le_bytes());
        buf.extend_from_slice(&name_len.to_le_bytes());
        buf.extend_from_slice(name_bytes);
        buf.extend_from_slice(&symbol.stats.frequency().to_le_bytes());
        buf.extend_from_slice(&symbol.stats.avg_time_us().to_le_bytes());
        buf.extend_from_slice(&symbol.stats.last_seen_us().to_le_bytes());
    }

    let tmp_path = tmp_sibling(path.as_ref());
    {
        let mut file = File::create(&tmp_path).map_err(io_err)?;
        file.write_all(&buf).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    std::fs::rename(&tmp_path, path.as_ref()).map_err(io_err)?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read every record from `path`.
///
/// A missing file, a file too short to hold a header, or a file whose
/// magic/version does not match is tolerated: this returns an empty
/// vector rather than an error (spec §4.6/§6).
///
/// # Errors
/// Returns [`CoreError::PersistenceIoError`] only for I/O errors other
/// than "not found" (e.g. permission denied).
pub fn read_cache_file(path: impl AsRef<Path>) -> Result<Vec<StatsRecord>, CoreError> {
    let mut file = match File::open(path.as_ref()) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(e)),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(io_err)?;

    Ok(parse(&buf).unwrap_or_else(|reason| {
        tracing::warn!(reason, "ignoring unreadable symbol cache file, will rewrite on next save");
        Vec::new()
    }))
}

/// Apply loaded records onto a post-loaded symbol table, matched by
/// name — symbol ids are only stable within one process's registration
/// order, not across restarts, so persistence keys on the name instead.
pub fn restore_into(symbols: &[Symbol], records: &[StatsRecord]) {
    let by_name: HashMap<&str, &Symbol> = symbols.iter().map(|s| (s.name.as_str(), s)).collect();
    for record in records {
        if let Some(symbol) = by_name.get(record.name.as_str()) {
            symbol.stats.restore(record.frequency, record.avg_time_us, record.last_seen_us);
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], &'static str> {
        let end = self.pos.checked_add(len).ok_or("length overflow")?;
        let slice = self.buf.get(self.pos..end).ok_or("unexpected end of file")?;
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, &'static str> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, &'static str> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, &'static str> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, &'static str> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn parse(buf: &[u8]) -> Result<Vec<StatsRecord>, &'static str> {
    let mut cursor = Cursor { buf, pos: 0 };

    let magic = cursor.u64()?;
    if magic != MAGIC {
        return Err("magic mismatch");
    }

    let version = cursor.u32()?;
    if version != CURRENT_VERSION {
        return Err("unknown version");
    }

    let count = cursor.u32()?;
    let mut records = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let id = cursor.u32()?;
        let name_len = usize::from(cursor.u16()?);
        let name_bytes = cursor.take(name_len)?;
        let name = std::str::from_utf8(name_bytes).map_err(|_| "invalid utf8 in symbol name")?.to_string();
        let frequency = cursor.u64()?;
        let avg_time_us = cursor.f64()?;
        let last_seen_us = cursor.u64()?;
        records.push(StatsRecord {
            id,
            name,
            frequency,
            avg_time_us,
            last_seen_us,
        });
    }

    Ok(records)
}
