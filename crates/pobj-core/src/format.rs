//! Binary format definitions for pool files
//!
//! A pool file is split into four regions:
//!
//! ```text
//! [0, 4096)            pool header (written once, after the root exists)
//! [4096, bitmap)       undo log: LogHeader (64 bytes) + framed snapshot entries
//! [bitmap, heap)       allocation bitmap, one bit per heap block
//! [heap, pool_size)    object heap, BLOCK_SIZE blocks
//! ```
//!
//! Every object starts with an ObjectHeader (16 bytes) followed by its payload.
//! All integers are little-endian.

use std::path::{Path, PathBuf};

use crate::error::{PoolError, PoolResult};

/// Magic bytes at offset 0 of every pool file
pub const POOL_MAGIC: [u8; 8] = *b"POBJPOOL";

/// Current on-disk format version
pub const POOL_VERSION: u32 = 1;

/// Region alignment and msync granularity
pub const PAGE_SIZE: u64 = 4096;

/// Bytes reserved for the pool header
pub const POOL_HEADER_SIZE: usize = 4096;

/// Encoded length of the pool header fields (the rest of the page is zero)
pub const HEADER_ENCODED_LEN: usize = 144;

/// Bytes covered by the header checksum
const HEADER_CHECKSUM_AT: usize = 140;

/// Longest layout tag, leaving room for a terminating zero
pub const MAX_LAYOUT_LEN: usize = 63;

/// Allocation granularity of the object heap
pub const BLOCK_SIZE: u64 = 64;

/// Magic bytes at the start of every live object
pub const OBJECT_MAGIC: [u8; 4] = *b"PObj";

/// Size of the per-object header
pub const OBJECT_HEADER_SIZE: usize = 16;

/// Size of the undo log header; entries start right after it
pub const LOG_HEADER_SIZE: usize = 64;

/// Magic bytes identifying undo log entries
pub const LOG_MAGIC: [u8; 4] = *b"UNDO";

/// Size of the framing header in front of every undo log entry
pub const LOG_ENTRY_HEADER_SIZE: usize = 16;

pub fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

pub fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Pool header, stored at offset 0
///
/// Layout:
///   [0..8]     magic:         [u8;8] - "POBJPOOL"
///   [8..12]    version:       u32
///   [12..16]   root_type:     u32
///   [16..80]   layout:        [u8;64] - zero padded
///   [80..88]   pool_size:     u64
///   [88..96]   log_offset:    u64
///   [96..104]  log_capacity:  u64
///   [104..112] bitmap_offset: u64
///   [112..120] heap_offset:   u64
///   [120..128] heap_blocks:   u64
///   [128..136] root_offset:   u64
///   [136..140] root_size:     u32
///   [140..144] checksum:      u32 - CRC32C of bytes [0..140]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHeader {
    pub version: u32,
    pub layout: String,
    pub pool_size: u64,
    pub log_offset: u64,
    pub log_capacity: u64,
    pub bitmap_offset: u64,
    pub heap_offset: u64,
    pub heap_blocks: u64,
    pub root_offset: u64,
    pub root_type: u32,
    pub root_size: u32,
}

impl PoolHeader {
    /// Compute the region layout for a new pool. Root fields start out empty.
    pub fn plan(layout: &str, pool_size: u64, log_capacity: u64) -> PoolResult<Self> {
        if layout.len() > MAX_LAYOUT_LEN {
            return Err(PoolError::LayoutTooLong { len: layout.len(), max: MAX_LAYOUT_LEN });
        }
        if layout.as_bytes().contains(&0) {
            return Err(PoolError::InvalidConfig {
                reason: "layout tag must not contain NUL bytes".into(),
            });
        }

        let log_offset = POOL_HEADER_SIZE as u64;
        let bitmap_offset = log_offset + log_capacity;
        let minimum = bitmap_offset + 2 * PAGE_SIZE;
        if pool_size < minimum {
            return Err(PoolError::PoolTooSmall { requested_bytes: pool_size, minimum_bytes: minimum });
        }

        // Every block costs BLOCK_SIZE bytes of heap plus one bitmap bit.
        let available = pool_size - bitmap_offset;
        let max_blocks = (available * 8) / (BLOCK_SIZE * 8 + 1);
        let bitmap_bytes = max_blocks.div_ceil(8).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let heap_offset = bitmap_offset + bitmap_bytes;
        let heap_blocks = (pool_size - heap_offset) / BLOCK_SIZE;

        Ok(Self {
            version: POOL_VERSION,
            layout: layout.to_string(),
            pool_size,
            log_offset,
            log_capacity,
            bitmap_offset,
            heap_offset,
            heap_blocks,
            root_offset: 0,
            root_type: 0,
            root_size: 0,
        })
    }

    /// Serialize header to bytes for writing
    pub fn to_bytes(&self) -> [u8; HEADER_ENCODED_LEN] {
        let mut buf = [0u8; HEADER_ENCODED_LEN];
        buf[0..8].copy_from_slice(&POOL_MAGIC);
        put_u32(&mut buf, 8, self.version);
        put_u32(&mut buf, 12, self.root_type);
        let layout = self.layout.as_bytes();
        buf[16..16 + layout.len()].copy_from_slice(layout);
        put_u64(&mut buf, 80, self.pool_size);
        put_u64(&mut buf, 88, self.log_offset);
        put_u64(&mut buf, 96, self.log_capacity);
        put_u64(&mut buf, 104, self.bitmap_offset);
        put_u64(&mut buf, 112, self.heap_offset);
        put_u64(&mut buf, 120, self.heap_blocks);
        put_u64(&mut buf, 128, self.root_offset);
        put_u32(&mut buf, 136, self.root_size);
        let checksum = crc32c::crc32c(&buf[..HEADER_CHECKSUM_AT]);
        put_u32(&mut buf, HEADER_CHECKSUM_AT, checksum);
        buf
    }

    /// Parse and verify a header read from `path`.
    pub fn from_bytes(path: &Path, buf: &[u8]) -> PoolResult<Self> {
        if buf.len() < HEADER_ENCODED_LEN {
            return Err(PoolError::PoolCorrupted {
                path: path.to_path_buf(),
                reason: format!("header needs {} bytes, file has {}", HEADER_ENCODED_LEN, buf.len()),
            });
        }

        if buf[0..8] != POOL_MAGIC {
            let mut found_bytes = [0u8; 8];
            found_bytes.copy_from_slice(&buf[0..8]);
            return Err(PoolError::NotAPool { path: path.to_path_buf(), found_bytes });
        }

        let expected = get_u32(buf, HEADER_CHECKSUM_AT);
        let actual = crc32c::crc32c(&buf[..HEADER_CHECKSUM_AT]);
        if expected != actual {
            return Err(PoolError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
                offset: 0,
            });
        }

        let version = get_u32(buf, 8);
        if version != POOL_VERSION {
            return Err(PoolError::UnsupportedVersion { path: path.to_path_buf(), version });
        }

        let raw_layout = &buf[16..80];
        let end = raw_layout.iter().position(|&b| b == 0).unwrap_or(raw_layout.len());
        let layout = String::from_utf8(raw_layout[..end].to_vec()).map_err(|_| PoolError::PoolCorrupted {
            path: path.to_path_buf(),
            reason: "layout tag is not valid UTF-8".into(),
        })?;

        Ok(Self {
            version,
            layout,
            pool_size: get_u64(buf, 80),
            log_offset: get_u64(buf, 88),
            log_capacity: get_u64(buf, 96),
            bitmap_offset: get_u64(buf, 104),
            heap_offset: get_u64(buf, 112),
            heap_blocks: get_u64(buf, 120),
            root_offset: get_u64(buf, 128),
            root_type: get_u32(buf, 12),
            root_size: get_u32(buf, 136),
        })
    }

    /// Check that the regions are ordered and fit in `file_len`.
    pub fn check_regions(&self, path: &Path, file_len: u64) -> PoolResult<()> {
        let corrupted = |reason: String| PoolError::PoolCorrupted { path: path.to_path_buf(), reason };

        if self.pool_size != file_len {
            return Err(corrupted(format!("header says {} bytes, file has {}", self.pool_size, file_len)));
        }
        if self.log_offset < POOL_HEADER_SIZE as u64
            || self.log_capacity <= LOG_HEADER_SIZE as u64
            || self.log_offset + self.log_capacity > self.bitmap_offset
            || self.bitmap_offset + self.heap_blocks.div_ceil(8) > self.heap_offset
        {
            return Err(corrupted("region offsets overlap".into()));
        }
        match self.heap_blocks.checked_mul(BLOCK_SIZE).and_then(|n| n.checked_add(self.heap_offset)) {
            Some(end) if end <= self.pool_size => Ok(()),
            _ => Err(corrupted("heap extends past end of file".into())),
        }
    }
}

/// Per-object header at the start of every allocation
///
/// Layout:
///   [0..4]   magic:       [u8;4] - "PObj"
///   [4..8]   type_id:     u32
///   [8..12]  payload_len: u32
///   [12..16] blocks:      u32 - blocks spanned, header included
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub type_id: u32,
    pub payload_len: u32,
    pub blocks: u32,
}

impl ObjectHeader {
    pub fn new(type_id: u32, payload_len: u32) -> Self {
        Self {
            type_id,
            payload_len,
            blocks: Self::blocks_for(payload_len as u64) as u32,
        }
    }

    /// Number of heap blocks an object with this payload occupies.
    pub fn blocks_for(payload_len: u64) -> u64 {
        (OBJECT_HEADER_SIZE as u64 + payload_len).div_ceil(BLOCK_SIZE)
    }

    pub fn to_bytes(&self) -> [u8; OBJECT_HEADER_SIZE] {
        let mut buf = [0u8; OBJECT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&OBJECT_MAGIC);
        put_u32(&mut buf, 4, self.type_id);
        put_u32(&mut buf, 8, self.payload_len);
        put_u32(&mut buf, 12, self.blocks);
        buf
    }

    /// Parse a header; `None` when the magic is missing.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < OBJECT_HEADER_SIZE || buf[0..4] != OBJECT_MAGIC {
            return None;
        }
        Some(Self {
            type_id: get_u32(buf, 4),
            payload_len: get_u32(buf, 8),
            blocks: get_u32(buf, 12),
        })
    }
}

/// Undo log entry kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogEntryKind {
    /// Old contents of a byte range, restored on rollback
    Snapshot = 1,
}

/// A decoded undo log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: LogEntryKind,
    /// Pool offset the bytes were copied from
    pub target: u64,
    pub data: Vec<u8>,
}

impl LogEntry {
    /// Encoded size of an entry carrying `data_len` bytes.
    pub fn encoded_len(data_len: usize) -> usize {
        LOG_ENTRY_HEADER_SIZE + 8 + data_len
    }
}

/// Serialize a snapshot of `data` taken from pool offset `target`
///
/// Format: magic(4) + payload_len(u32 LE) + CRC32C(u32 LE) + kind(u8) + reserved(3)
///         + target(u64 LE) + data
pub fn serialize_snapshot(target: u64, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + data.len());
    payload.extend_from_slice(&target.to_le_bytes());
    payload.extend_from_slice(data);

    let checksum = crc32c::crc32c(&payload);

    let mut buffer = Vec::with_capacity(LOG_ENTRY_HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&LOG_MAGIC);
    buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&checksum.to_le_bytes());
    buffer.push(LogEntryKind::Snapshot as u8);
    buffer.extend_from_slice(&[0u8; 3]);
    buffer.extend_from_slice(&payload);
    buffer
}

/// Deserialize one undo log entry from the front of `data`.
///
/// Returns the entry and the number of bytes it occupied. Offsets in errors
/// are relative to the start of `data`.
pub fn deserialize_entry(data: &[u8]) -> PoolResult<(LogEntry, usize)> {
    let corrupted = |offset: usize, reason: String| PoolError::LogCorrupted {
        path: PathBuf::from("<buffer>"),
        offset: offset as u64,
        reason,
    };

    if data.len() < LOG_ENTRY_HEADER_SIZE {
        return Err(corrupted(0, format!(
            "Entry too short: {} bytes, need at least {}", data.len(), LOG_ENTRY_HEADER_SIZE
        )));
    }
    if data[0..4] != LOG_MAGIC {
        return Err(corrupted(0, format!("Bad entry magic {:02x?}", &data[0..4])));
    }

    let length = get_u32(data, 4) as usize;
    let total = LOG_ENTRY_HEADER_SIZE + length;
    if length < 8 || data.len() < total {
        return Err(corrupted(4, format!(
            "Torn entry: payload of {} bytes, {} available",
            length,
            data.len() - LOG_ENTRY_HEADER_SIZE
        )));
    }

    let payload = &data[LOG_ENTRY_HEADER_SIZE..total];
    let expected = get_u32(data, 8);
    let actual = crc32c::crc32c(payload);
    if expected != actual {
        return Err(PoolError::ChecksumMismatch {
            path: PathBuf::from("<buffer>"),
            expected,
            actual,
            offset: LOG_ENTRY_HEADER_SIZE as u64,
        });
    }

    let kind = match data[12] {
        1 => LogEntryKind::Snapshot,
        other => return Err(corrupted(12, format!("Invalid entry kind: {}", other))),
    };

    let entry = LogEntry {
        kind,
        target: get_u64(payload, 0),
        data: payload[8..].to_vec(),
    };
    Ok((entry, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_path() -> PathBuf {
        PathBuf::from("/tmp/format-test.pool")
    }

    #[test]
    fn test_plan_standard_pool() {
        let header = PoolHeader::plan("layout", 10 * 1024 * 1024, 256 * 1024).unwrap();
        assert_eq!(header.log_offset, POOL_HEADER_SIZE as u64);
        assert_eq!(header.bitmap_offset, header.log_offset + 256 * 1024);
        assert_eq!(header.heap_offset % PAGE_SIZE, 0);
        assert!(header.heap_blocks.div_ceil(8) <= header.heap_offset - header.bitmap_offset);
        assert!(header.heap_offset + header.heap_blocks * BLOCK_SIZE <= header.pool_size);
        header.check_regions(&test_path(), header.pool_size).unwrap();
    }

    #[test]
    fn test_plan_rejects_small_pool() {
        let result = PoolHeader::plan("layout", 64 * 1024, 64 * 1024);
        assert!(matches!(result, Err(PoolError::PoolTooSmall { .. })));
    }

    #[test]
    fn test_plan_rejects_long_layout() {
        let layout = "x".repeat(MAX_LAYOUT_LEN + 1);
        let result = PoolHeader::plan(&layout, 10 * 1024 * 1024, 256 * 1024);
        assert!(matches!(result, Err(PoolError::LayoutTooLong { len, .. }) if len == MAX_LAYOUT_LEN + 1));
    }

    #[test]
    fn test_header_bytes_roundtrip() {
        let mut header = PoolHeader::plan("hello layout", 2 * 1024 * 1024, 64 * 1024).unwrap();
        header.root_offset = header.heap_offset;
        header.root_type = 0xABCD;
        header.root_size = 24;

        let bytes = header.to_bytes();
        let parsed = PoolHeader::from_bytes(&test_path(), &bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_checksum_detects_flip() {
        let header = PoolHeader::plan("hello", 2 * 1024 * 1024, 64 * 1024).unwrap();
        let mut bytes = header.to_bytes();
        bytes[90] ^= 0x01;
        assert!(matches!(
            PoolHeader::from_bytes(&test_path(), &bytes),
            Err(PoolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_zeroed_file_is_not_a_pool() {
        let bytes = [0u8; HEADER_ENCODED_LEN];
        assert!(matches!(
            PoolHeader::from_bytes(&test_path(), &bytes),
            Err(PoolError::NotAPool { .. })
        ));
    }

    #[test]
    fn test_object_header_blocks() {
        assert_eq!(ObjectHeader::blocks_for(0), 1);
        assert_eq!(ObjectHeader::blocks_for(48), 1);
        assert_eq!(ObjectHeader::blocks_for(49), 2);

        let header = ObjectHeader::new(7, 100);
        assert_eq!(header.blocks, 2);
        assert_eq!(ObjectHeader::from_bytes(&header.to_bytes()), Some(header));
        assert_eq!(ObjectHeader::from_bytes(&[0u8; OBJECT_HEADER_SIZE]), None);
    }

    #[test]
    fn test_snapshot_entry_decodes() {
        let bytes = serialize_snapshot(0x1234, b"old bytes");
        assert_eq!(bytes.len(), LogEntry::encoded_len(9));

        let (entry, used) = deserialize_entry(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(entry.kind, LogEntryKind::Snapshot);
        assert_eq!(entry.target, 0x1234);
        assert_eq!(entry.data, b"old bytes");
    }

    #[test]
    fn test_corrupted_entry_detected() {
        let mut bytes = serialize_snapshot(64, b"payload");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(deserialize_entry(&bytes), Err(PoolError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_torn_entry_detected() {
        let bytes = serialize_snapshot(64, b"payload");
        let torn = &bytes[..bytes.len() - 3];
        assert!(matches!(deserialize_entry(torn), Err(PoolError::LogCorrupted { .. })));
    }
}
