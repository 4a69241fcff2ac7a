//! Transactions: all-or-nothing groups of pool mutations
//!
//! Every range is snapshotted into the undo log before its first
//! modification, so a crash at any point leaves enough information to put
//! the pool back the way it was when the transaction began.
//!
//! COMMIT ORDERING:
//! 1. reclaim objects freed by this transaction (itself undo-logged)
//! 2. flush every range written by the transaction
//! 3. truncate the undo log: the transaction is now durable
//!
//! Ranges inside objects allocated by the same transaction are never
//! snapshotted; rolling back the bitmap makes them unreachable again.

use std::ops::Range;

use hashbrown::HashMap;

use crate::error::{PoolError, PoolResult};
use crate::format::{ObjectHeader, BLOCK_SIZE, OBJECT_HEADER_SIZE};
use crate::heap::Heap;
use crate::persist::{PPtr, Persist, ReadAccess};
use crate::undo_log::UndoLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

/// An open transaction on a pool.
///
/// Obtained from `Pool::begin` or passed to the body of `Pool::run`.
/// Dropping an uncommitted transaction rolls it back, including when a
/// panic unwinds through it.
pub struct Transaction<'a> {
    heap: &'a mut Heap,
    log: UndoLog,
    /// Ranges whose pre-transaction bytes are already in the log
    logged: Vec<Range<u64>>,
    /// Ranges written by this transaction, flushed at commit
    dirty: Vec<Range<u64>>,
    /// Objects allocated by this transaction: start -> end offset
    fresh: HashMap<u64, u64>,
    /// Objects freed by this transaction, reclaimed at commit
    pending_free: Vec<u64>,
    state: TxState,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(heap: &'a mut Heap) -> PoolResult<Self> {
        let log = UndoLog::attach(heap)?;
        if !log.is_empty() {
            return Err(PoolError::LogCorrupted {
                path: heap.path().to_path_buf(),
                offset: heap.header().log_offset,
                reason: "undo log of an earlier transaction was never rolled back".into(),
            });
        }

        Ok(Self {
            heap,
            log,
            logged: Vec::new(),
            dirty: Vec::new(),
            fresh: HashMap::new(),
            pending_free: Vec::new(),
            state: TxState::Active,
        })
    }

    /// Bytes this transaction has written to the undo log so far.
    pub fn logged_bytes(&self) -> u64 {
        self.log.used()
    }

    /// Copy an object out of the pool, seeing this transaction's writes.
    pub fn read<T: Persist>(&self, ptr: PPtr<T>) -> PoolResult<T> {
        self.heap.read_object(ptr)
    }

    /// Overwrite an object.
    pub fn write<T: Persist>(&mut self, ptr: PPtr<T>, value: &T) -> PoolResult<()> {
        let mut buf = vec![0u8; T::SIZE];
        value.encode(&mut buf);
        self.write_payload(ptr.offset(), T::TYPE_ID, 0, &buf)
    }

    /// Read-modify-write an object.
    pub fn update<T, F>(&mut self, ptr: PPtr<T>, f: F) -> PoolResult<()>
    where
        T: Persist,
        F: FnOnce(&mut T),
    {
        let mut value = self.read(ptr)?;
        f(&mut value);
        self.write(ptr, &value)
    }

    /// Allocate a new object initialised to `value`.
    pub fn alloc<T: Persist>(&mut self, value: &T) -> PoolResult<PPtr<T>> {
        let ptr = PPtr::from_offset(self.alloc_raw(T::TYPE_ID, T::SIZE)?);
        self.write(ptr, value)?;
        Ok(ptr)
    }

    /// Free an object, running its `release` hook first.
    ///
    /// The object stays readable until commit; its blocks are reclaimed then,
    /// so nothing allocated later in this transaction can reuse them.
    pub fn free<T: Persist>(&mut self, ptr: PPtr<T>) -> PoolResult<()> {
        if self.pending_free.contains(&ptr.offset()) {
            return Err(PoolError::DoubleFree { offset: ptr.offset() });
        }
        let value = self.read(ptr)?;
        value.release(self)?;
        self.pending_free.push(ptr.offset());
        Ok(())
    }

    /// Allocate a zeroed object of `payload_len` bytes tagged `type_id`.
    pub(crate) fn alloc_raw(&mut self, type_id: u32, payload_len: usize) -> PoolResult<u64> {
        let payload_len = u32::try_from(payload_len).map_err(|_| PoolError::OutOfSpace {
            requested_bytes: payload_len as u64,
            free_blocks: self.heap.free_blocks(),
        })?;
        let header = ObjectHeader::new(type_id, payload_len);
        let blocks = header.blocks as u64;

        let first = self.heap.find_free_run(blocks)?;
        let (span_at, span_len) = self.heap.bitmap_span(first, blocks);
        self.snapshot(span_at, span_len)?;
        self.heap.set_blocks(first, blocks, true);
        self.dirty.push(span_at..span_at + span_len as u64);

        let offset = self.heap.block_offset(first);
        self.fresh.insert(offset, offset + blocks * BLOCK_SIZE);
        self.write_bytes(offset, &header.to_bytes())?;
        self.write_bytes(offset + OBJECT_HEADER_SIZE as u64, &vec![0u8; payload_len as usize])?;

        log::trace!("[pool] Allocated {} blocks at 0x{:x} for type 0x{:08x}", blocks, offset, type_id);
        Ok(offset)
    }

    /// Free an untyped object without a release hook.
    pub(crate) fn free_raw(&mut self, offset: u64, type_id: u32) -> PoolResult<()> {
        if self.pending_free.contains(&offset) {
            return Err(PoolError::DoubleFree { offset });
        }
        let header = self.heap.object_header(offset)?;
        if header.type_id != type_id {
            return Err(PoolError::TypeMismatch { offset, expected: type_id, found: header.type_id });
        }
        self.pending_free.push(offset);
        Ok(())
    }

    /// Write `data` at byte `at` of an object's payload.
    pub(crate) fn write_payload(&mut self, object: u64, type_id: u32, at: usize, data: &[u8]) -> PoolResult<()> {
        let header = self.heap.object_header(object)?;
        if header.type_id != type_id {
            return Err(PoolError::TypeMismatch { offset: object, expected: type_id, found: header.type_id });
        }
        if at + data.len() > header.payload_len as usize {
            return Err(PoolError::InvalidPointer {
                offset: object,
                reason: format!(
                    "write of {} bytes at {} exceeds payload of {} bytes",
                    data.len(), at, header.payload_len
                ),
            });
        }
        self.write_bytes(object + OBJECT_HEADER_SIZE as u64 + at as u64, data)
    }

    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> PoolResult<()> {
        self.snapshot(offset, data.len())?;
        self.heap.write_at(offset, data)?;
        self.dirty.push(offset..offset + data.len() as u64);
        Ok(())
    }

    /// Log the current bytes of a range unless rollback already covers it.
    fn snapshot(&mut self, offset: u64, len: usize) -> PoolResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = offset + len as u64;
        let in_fresh = self.fresh.iter().any(|(&start, &stop)| start <= offset && end <= stop);
        let logged = self.logged.iter().any(|r| r.start <= offset && end <= r.end);
        if in_fresh || logged {
            return Ok(());
        }

        self.log.append_snapshot(self.heap, offset, len)?;
        self.logged.push(offset..end);
        Ok(())
    }

    fn reclaim_freed(&mut self) -> PoolResult<()> {
        for offset in std::mem::take(&mut self.pending_free) {
            let header = self.heap.object_header(offset)?;
            let first = self.heap.block_index(offset);
            let blocks = header.blocks as u64;

            let (span_at, span_len) = self.heap.bitmap_span(first, blocks);
            self.snapshot(span_at, span_len)?;
            self.heap.set_blocks(first, blocks, false);
            self.dirty.push(span_at..span_at + span_len as u64);

            self.write_bytes(offset, &[0u8; OBJECT_HEADER_SIZE])?;
            self.fresh.remove(&offset);
            log::trace!("[pool] Reclaimed {} blocks at 0x{:x}", blocks, offset);
        }
        Ok(())
    }

    /// Make every change of this transaction durable.
    pub fn commit(mut self) -> PoolResult<()> {
        self.reclaim_freed()?;
        for range in coalesce(&mut self.dirty) {
            self.heap.flush_range(range.start, (range.end - range.start) as usize)?;
        }
        self.log.truncate(self.heap)?;
        self.state = TxState::Committed;
        Ok(())
    }

    /// Undo every change of this transaction.
    pub fn abort(mut self) -> PoolResult<()> {
        self.rollback()
    }

    fn rollback(&mut self) -> PoolResult<()> {
        let undone = self.log.rollback(self.heap)?;
        self.state = TxState::RolledBack;
        log::debug!("[pool] Rolled back transaction on {} ({} snapshots)", self.heap.path().display(), undone);
        Ok(())
    }
}

impl ReadAccess for Transaction<'_> {
    fn heap(&self) -> &Heap {
        &*self.heap
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            if let Err(e) = self.rollback() {
                log::error!(
                    "[pool] Rollback of dropped transaction failed for {}: {} (recovery runs on next open)",
                    self.heap.path().display(),
                    e
                );
            }
        }
    }
}

/// Sort ranges and merge the ones that overlap or touch.
fn coalesce(ranges: &mut [Range<u64>]) -> Vec<Range<u64>> {
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
    for range in ranges.iter() {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range.clone()),
        }
    }
    merged
}
