//! Undo log for pool transactions
//!
//! The log lives in its own region of the pool file:
//!
//! ```text
//! [0..8]    used: u64 LE - bytes of valid entries after the header
//! [8..64]   reserved
//! [64..]    framed snapshot entries (see format::serialize_snapshot)
//! ```
//!
//! Write ordering for every snapshot:
//! 1. write the framed entry past `used`
//! 2. flush the entry
//! 3. advance `used` and flush it
//! 4. only then may the caller modify the snapshotted range
//!
//! A crash between 1 and 3 leaves an entry past `used`, which is ignored
//! because the range was never modified. Commit resets `used` to zero; that
//! single 8-byte write is the commit point. Rollback (explicit abort or
//! recovery on open) restores entries newest-first, so the oldest copy of a
//! range wins, then resets `used`. Replaying twice gives the same bytes.

use crate::error::{PoolError, PoolResult};
use crate::format::{deserialize_entry, get_u64, serialize_snapshot, LogEntry, LOG_HEADER_SIZE};
use crate::heap::Heap;

pub struct UndoLog {
    /// Pool offset of the log header
    region: u64,
    /// Region size including the header
    capacity: u64,
    /// Mirror of the persistent `used` field
    used: u64,
}

impl UndoLog {
    /// Attach to the log region described by the pool header.
    pub fn attach(heap: &Heap) -> PoolResult<Self> {
        let header = heap.header();
        let used = get_u64(heap.bytes(header.log_offset, 8)?, 0);
        let log = Self { region: header.log_offset, capacity: header.log_capacity, used };

        if used > log.entry_capacity() {
            return Err(PoolError::LogCorrupted {
                path: heap.path().to_path_buf(),
                offset: header.log_offset,
                reason: format!("used length {} exceeds log capacity {}", used, log.entry_capacity()),
            });
        }
        Ok(log)
    }

    fn entry_capacity(&self) -> u64 {
        self.capacity - LOG_HEADER_SIZE as u64
    }

    fn entries_offset(&self) -> u64 {
        self.region + LOG_HEADER_SIZE as u64
    }

    /// Bytes of committed-to-log entries.
    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Record the current contents of `[target, target + len)`.
    pub fn append_snapshot(&mut self, heap: &mut Heap, target: u64, len: usize) -> PoolResult<()> {
        let needed = LogEntry::encoded_len(len) as u64;
        let available = self.entry_capacity() - self.used;
        if needed > available {
            return Err(PoolError::LogFull { requested_bytes: needed, available_bytes: available });
        }

        let entry = serialize_snapshot(target, heap.bytes(target, len)?);

        let at = self.entries_offset() + self.used;
        heap.write_at(at, &entry)?;
        heap.flush_range(at, entry.len())?;

        self.set_used(heap, self.used + entry.len() as u64)
    }

    fn set_used(&mut self, heap: &mut Heap, used: u64) -> PoolResult<()> {
        heap.write_at(self.region, &used.to_le_bytes())?;
        heap.flush_range(self.region, 8)?;
        self.used = used;
        Ok(())
    }

    /// Drop all entries. Used as the commit point.
    pub fn truncate(&mut self, heap: &mut Heap) -> PoolResult<()> {
        self.set_used(heap, 0)
    }

    /// Decode every entry inside the used range, oldest first.
    pub fn entries(&self, heap: &Heap) -> PoolResult<Vec<LogEntry>> {
        let base = self.entries_offset();
        let region = heap.bytes(base, self.used as usize)?;
        let first_target = heap.header().bitmap_offset;

        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos < region.len() {
            let at = base + pos as u64;
            let (entry, consumed) = deserialize_entry(&region[pos..]).map_err(|e| PoolError::LogCorrupted {
                path: heap.path().to_path_buf(),
                offset: at,
                reason: e.to_string(),
            })?;

            // Only the bitmap and the object heap are ever snapshotted.
            if entry.target < first_target {
                return Err(PoolError::LogCorrupted {
                    path: heap.path().to_path_buf(),
                    offset: at,
                    reason: format!("entry targets reserved offset 0x{:x}", entry.target),
                });
            }

            entries.push(entry);
            pos += consumed;
        }
        Ok(entries)
    }

    /// Restore every snapshot newest-first, make the restored bytes durable,
    /// then empty the log. Returns the number of entries undone.
    pub fn rollback(&mut self, heap: &mut Heap) -> PoolResult<usize> {
        if self.used == 0 {
            return Ok(0);
        }

        let entries = self.entries(heap)?;
        for entry in entries.iter().rev() {
            heap.write_at(entry.target, &entry.data)?;
        }
        for entry in &entries {
            heap.flush_range(entry.target, entry.data.len())?;
        }

        self.truncate(heap)?;
        Ok(entries.len())
    }
}
