//! On-disk checkpoint and usage files.
//!
//! Checkpoint layout (big-endian):
//! - `u16` version
//! - `u64` unix timestamp (seconds)
//! - `u32` length + JSON association list
//! - `u32` length + JSON user list
//! - `u32` length + JSON QOS list (absent in version 1)
//!
//! Usage layout (big-endian):
//! - `u16` version
//! - `u64` unix timestamp (seconds)
//! - `u32` count, then `count` × (`u32` id, `u64` used_shares × `USAGE_SCALE`)
//!
//! Both files are replaced with the same write discipline: write
//! `<path>.new`, rename the current file to `<path>.old`, rename the new
//! file into place.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use fairgrid_state::{AssocId, Association, Qos, User};

use crate::error::{AssocError, AssocResult};

pub const CHECKPOINT_VERSION: u16 = 2;
pub const MIN_CHECKPOINT_VERSION: u16 = 1;
pub const USAGE_VERSION: u16 = 1;
/// Fixed-point scale for stored usage.
pub const USAGE_SCALE: f64 = 1_000_000.0;

/// Everything a checkpoint carries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub version: u16,
    pub timestamp: u64,
    pub associations: Vec<Association>,
    pub users: Vec<User>,
    pub qos: Vec<Qos>,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn put_blob(buf: &mut Vec<u8>, blob: &[u8]) -> AssocResult<()> {
    let len = u32::try_from(blob.len())
        .map_err(|_| AssocError::InvalidArgument("checkpoint section exceeds 4 GiB".into()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(blob);
    Ok(())
}

pub fn encode_snapshot(
    associations: &[Association],
    users: &[User],
    qos: &[Qos],
    timestamp: u64,
) -> AssocResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&CHECKPOINT_VERSION.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    put_blob(&mut buf, &serde_json::to_vec(associations)?)?;
    put_blob(&mut buf, &serde_json::to_vec(users)?)?;
    put_blob(&mut buf, &serde_json::to_vec(qos)?)?;
    Ok(buf)
}

pub fn decode_snapshot(bytes: &[u8]) -> AssocResult<Snapshot> {
    let mut reader = Reader::new(bytes);
    let version = reader.u16()?;
    if !(MIN_CHECKPOINT_VERSION..=CHECKPOINT_VERSION).contains(&version) {
        return Err(AssocError::IncompatibleCheckpoint {
            found: version,
            min: MIN_CHECKPOINT_VERSION,
            max: CHECKPOINT_VERSION,
        });
    }
    let timestamp = reader.u64()?;
    let associations = serde_json::from_slice(reader.blob()?)?;
    let users = serde_json::from_slice(reader.blob()?)?;
    let qos = if version >= 2 {
        serde_json::from_slice(reader.blob()?)?
    } else {
        Vec::new()
    };
    Ok(Snapshot {
        version,
        timestamp,
        associations,
        users,
        qos,
    })
}

pub fn encode_usage(entries: &[(AssocId, f64)], timestamp: u64) -> AssocResult<Vec<u8>> {
    let count = u32::try_from(entries.len())
        .map_err(|_| AssocError::InvalidArgument("too many usage entries".into()))?;
    let mut buf = Vec::with_capacity(14 + entries.len() * 12);
    buf.extend_from_slice(&USAGE_VERSION.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(&count.to_be_bytes());
    for &(id, used) in entries {
        let fixed = (used.max(0.0) * USAGE_SCALE).round() as u64;
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&fixed.to_be_bytes());
    }
    Ok(buf)
}

/// Returns the timestamp and the `(id, used_shares)` pairs.
pub fn decode_usage(bytes: &[u8]) -> AssocResult<(u64, Vec<(AssocId, f64)>)> {
    let mut reader = Reader::new(bytes);
    let version = reader.u16()?;
    if version != USAGE_VERSION {
        return Err(AssocError::IncompatibleCheckpoint {
            found: version,
            min: USAGE_VERSION,
            max: USAGE_VERSION,
        });
    }
    let timestamp = reader.u64()?;
    let count = reader.u32()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let id = reader.u32()?;
        let fixed = reader.u64()?;
        entries.push((id, fixed as f64 / USAGE_SCALE));
    }
    Ok((timestamp, entries))
}

/// Bounds-checked big-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> AssocResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                AssocError::Corrupt(format!(
                    "truncated at byte {} (wanted {n} more of {})",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> AssocResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> AssocResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> AssocResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> AssocResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn blob(&mut self) -> AssocResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Replace `path` with `bytes`, keeping the previous file as `<path>.old`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> AssocResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let new_path = with_suffix(path, ".new");
    let old_path = with_suffix(path, ".old");
    tokio::fs::write(&new_path, bytes).await?;
    match tokio::fs::rename(path, &old_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::rename(&new_path, path).await?;
    debug!(path = %path.display(), bytes = bytes.len(), "state file written");
    Ok(())
}
