//! Memory-mapped pool file
//!
//! `Heap` owns the file and its shared mapping and knows the region layout
//! from the pool header. It offers bounds-checked byte access, the block
//! bitmap, and object header validation. It never decides *when* bytes become
//! durable; the undo log and the transaction do that.

use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use memmap2::MmapMut;

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::format::{
    ObjectHeader, PoolHeader, BLOCK_SIZE, HEADER_ENCODED_LEN, OBJECT_HEADER_SIZE, POOL_HEADER_SIZE,
};
use crate::persist::{PPtr, Persist};
use crate::platform_durability::{durable_sync, sync_parent_dir};

/// Occupancy summary produced by walking the object heap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks in the object heap
    pub heap_blocks: u64,
    /// Blocks marked allocated in the bitmap
    pub used_blocks: u64,
    /// Live objects with a valid header
    pub objects: usize,
    /// Allocated blocks not covered by any valid object
    pub stray_blocks: u64,
    /// Live objects per type id
    pub objects_by_type: HashMap<u32, usize>,
}

impl PoolStats {
    /// Live objects of type `T`.
    pub fn objects_of<T: Persist>(&self) -> usize {
        self.objects_by_type.get(&T::TYPE_ID).copied().unwrap_or(0)
    }

    pub fn free_blocks(&self) -> u64 {
        self.heap_blocks - self.used_blocks
    }
}

pub struct Heap {
    path: PathBuf,
    file: File,
    map: MmapMut,
    header: PoolHeader,
    /// Block index where the next allocation search starts (volatile)
    next_fit: u64,
    closed: bool,
}

impl Heap {
    /// Create and map a new pool file. The header is not written yet; see
    /// `publish_header`.
    pub fn create(path: &Path, layout: &str, config: &PoolConfig) -> PoolResult<Self> {
        let header = PoolHeader::plan(layout, config.pool_size, config.log_capacity)?;

        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(config.mode);
        }

        let file = options
            .open(path)
            .map_err(|e| PoolError::io(path, &e, "Failed to create pool file"))?;
        let sized = file
            .set_len(config.pool_size)
            .map_err(|e| PoolError::io(path, &e, "Failed to size pool file"))
            .and_then(|()| Self::map(path, &file));
        let map = match sized {
            Ok(map) => map,
            Err(e) => {
                drop(file);
                remove_unpublished(path);
                return Err(e);
            }
        };
        Ok(Self { path: path.to_path_buf(), file, map, header, next_fit: 0, closed: false })
    }

    /// Map an existing pool file and validate its header.
    pub fn open(path: &Path) -> PoolResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| PoolError::io(path, &e, "Failed to open pool file"))?;

        let file_len = file
            .metadata()
            .map_err(|e| PoolError::io(path, &e, "Failed to stat pool file"))?
            .len();
        if file_len < POOL_HEADER_SIZE as u64 {
            return Err(PoolError::PoolCorrupted {
                path: path.to_path_buf(),
                reason: format!("file is only {} bytes", file_len),
            });
        }

        let map = Self::map(path, &file)?;
        let header = PoolHeader::from_bytes(path, &map[..HEADER_ENCODED_LEN])?;
        header.check_regions(path, file_len)?;

        Ok(Self { path: path.to_path_buf(), file, map, header, next_fit: 0, closed: false })
    }

    fn map(path: &Path, file: &File) -> PoolResult<MmapMut> {
        // SAFETY: the pool file is used by this process alone, so nothing
        // truncates or rewrites it behind the mapping while it is alive.
        unsafe { MmapMut::map_mut(file) }
            .map_err(|e| PoolError::io(path, &e, "Failed to map pool file"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &PoolHeader {
        &self.header
    }

    fn range(&self, offset: u64, len: usize) -> PoolResult<Range<usize>> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.header.pool_size => Ok(offset as usize..end as usize),
            _ => Err(PoolError::InvalidPointer {
                offset,
                reason: format!("range of {} bytes runs past the end of the pool", len),
            }),
        }
    }

    pub fn bytes(&self, offset: u64, len: usize) -> PoolResult<&[u8]> {
        let range = self.range(offset, len)?;
        Ok(&self.map[range])
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> PoolResult<()> {
        let range = self.range(offset, data.len())?;
        self.map[range].copy_from_slice(data);
        Ok(())
    }

    /// msync a byte range of the mapping.
    pub fn flush_range(&self, offset: u64, len: usize) -> PoolResult<()> {
        if len == 0 {
            return Ok(());
        }
        let range = self.range(offset, len)?;
        self.map
            .flush_range(range.start, range.len())
            .map_err(|e| PoolError::io(&self.path, &e, "Failed to flush pool mapping"))
    }

    /// Flush the whole mapping and the file's data to stable storage.
    pub fn sync(&self) -> PoolResult<()> {
        self.map
            .flush()
            .map_err(|e| PoolError::io(&self.path, &e, "Failed to flush pool mapping"))?;
        durable_sync(&self.file)
            .map_err(|e| PoolError::io(&self.path, &e, "Pool durable_sync failed"))
    }

    /// Write the header that turns the file into an openable pool.
    ///
    /// Called once at creation, after the root object is committed. The rest
    /// of the file is made durable first so the header never points at
    /// unwritten data.
    pub fn publish_header(&mut self, root_offset: u64, root_type: u32, root_size: u32) -> PoolResult<()> {
        self.header.root_offset = root_offset;
        self.header.root_type = root_type;
        self.header.root_size = root_size;

        self.sync()?;
        let bytes = self.header.to_bytes();
        self.write_at(0, &bytes)?;
        self.flush_range(0, POOL_HEADER_SIZE)?;
        durable_sync(&self.file)
            .map_err(|e| PoolError::io(&self.path, &e, "Pool header durable_sync failed"))?;
        sync_parent_dir(&self.path)
            .map_err(|e| PoolError::io(&self.path, &e, "Failed to sync pool directory"))
    }

    /// Flush everything; the drop-time flush is skipped afterwards.
    pub fn close(&mut self) -> PoolResult<()> {
        self.sync()?;
        self.closed = true;
        Ok(())
    }

    pub fn block_offset(&self, block: u64) -> u64 {
        self.header.heap_offset + block * BLOCK_SIZE
    }

    /// Block index of an object start; the offset must already be validated.
    pub fn block_index(&self, offset: u64) -> u64 {
        (offset - self.header.heap_offset) / BLOCK_SIZE
    }

    fn bitmap_byte(&self, block: u64) -> usize {
        (self.header.bitmap_offset + block / 8) as usize
    }

    fn block_used(&self, block: u64) -> bool {
        self.map[self.bitmap_byte(block)] & (1 << (block % 8)) != 0
    }

    pub fn set_blocks(&mut self, first: u64, count: u64, used: bool) {
        for block in first..first + count {
            let index = self.bitmap_byte(block);
            let mask = 1u8 << (block % 8);
            if used {
                self.map[index] |= mask;
            } else {
                self.map[index] &= !mask;
            }
        }
    }

    /// Pool offset and length of the bitmap bytes covering a block run.
    pub fn bitmap_span(&self, first: u64, count: u64) -> (u64, usize) {
        let start = self.header.bitmap_offset + first / 8;
        let end = self.header.bitmap_offset + (first + count.max(1) - 1) / 8 + 1;
        (start, (end - start) as usize)
    }

    pub fn free_blocks(&self) -> u64 {
        (0..self.header.heap_blocks).filter(|&b| !self.block_used(b)).count() as u64
    }

    /// Find `blocks` consecutive free blocks, next-fit from the last allocation.
    /// Does not mark them; the caller does that under the undo log.
    pub fn find_free_run(&mut self, blocks: u64) -> PoolResult<u64> {
        let total = self.header.heap_blocks;
        let found = if blocks == 0 || blocks > total {
            None
        } else {
            self.scan_free(self.next_fit.min(total), total, blocks)
                .or_else(|| self.scan_free(0, total, blocks))
        };

        match found {
            Some(first) => {
                self.next_fit = first + blocks;
                Ok(first)
            }
            None => Err(PoolError::OutOfSpace {
                requested_bytes: blocks * BLOCK_SIZE,
                free_blocks: self.free_blocks(),
            }),
        }
    }

    fn scan_free(&self, from: u64, to: u64, blocks: u64) -> Option<u64> {
        let mut run_start = from;
        let mut run_len = 0;
        for block in from..to {
            if self.block_used(block) {
                run_start = block + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == blocks {
                    return Some(run_start);
                }
            }
        }
        None
    }

    /// Validate `offset` as the start of a live object and return its header.
    pub fn object_header(&self, offset: u64) -> PoolResult<ObjectHeader> {
        if offset == 0 {
            return Err(PoolError::NullPointer);
        }
        let invalid = |reason: &str| PoolError::InvalidPointer { offset, reason: reason.to_string() };

        if offset < self.header.heap_offset {
            return Err(invalid("points outside the object heap"));
        }
        let relative = offset - self.header.heap_offset;
        if relative % BLOCK_SIZE != 0 {
            return Err(invalid("not aligned to a heap block"));
        }
        let block = relative / BLOCK_SIZE;
        if block >= self.header.heap_blocks {
            return Err(invalid("points past the end of the heap"));
        }
        if !self.block_used(block) {
            return Err(invalid("object is not allocated"));
        }

        let header = ObjectHeader::from_bytes(self.bytes(offset, OBJECT_HEADER_SIZE)?)
            .ok_or_else(|| invalid("no object header at this offset"))?;
        if header.blocks as u64 != ObjectHeader::blocks_for(header.payload_len as u64)
            || block + header.blocks as u64 > self.header.heap_blocks
        {
            return Err(invalid("object header is damaged"));
        }
        Ok(header)
    }

    /// Payload bytes of a live object of the given type.
    pub fn payload(&self, offset: u64, type_id: u32) -> PoolResult<&[u8]> {
        let header = self.object_header(offset)?;
        if header.type_id != type_id {
            return Err(PoolError::TypeMismatch { offset, expected: type_id, found: header.type_id });
        }
        self.bytes(offset + OBJECT_HEADER_SIZE as u64, header.payload_len as usize)
    }

    pub fn read_object<T: Persist>(&self, ptr: PPtr<T>) -> PoolResult<T> {
        let payload = self.payload(ptr.offset(), T::TYPE_ID)?;
        match payload.get(..T::SIZE) {
            Some(bytes) => T::decode(bytes),
            None => Err(PoolError::Decode {
                type_id: T::TYPE_ID,
                reason: format!("payload is {} bytes, type needs {}", payload.len(), T::SIZE),
            }),
        }
    }

    /// Walk the heap block by block, following object headers.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats { heap_blocks: self.header.heap_blocks, ..PoolStats::default() };

        let mut block = 0;
        while block < self.header.heap_blocks {
            if !self.block_used(block) {
                block += 1;
                continue;
            }
            match self.object_header(self.block_offset(block)) {
                Ok(header) => {
                    stats.objects += 1;
                    *stats.objects_by_type.entry(header.type_id).or_insert(0) += 1;
                    stats.used_blocks += header.blocks as u64;
                    block += header.blocks as u64;
                }
                Err(_) => {
                    stats.used_blocks += 1;
                    stats.stray_blocks += 1;
                    block += 1;
                }
            }
        }
        stats
    }
}

/// Delete a pool file that was created but never got a header.
pub(crate) fn remove_unpublished(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("[pool] Failed to remove half-created pool {}: {}", path.display(), e);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.map.flush() {
                log::warn!("[pool] Flush on drop failed for {}: {}", self.path.display(), e);
            }
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("path", &self.path)
            .field("layout", &self.header.layout)
            .field("heap_blocks", &self.header.heap_blocks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_heap() -> (Heap, TempDir) {
        let dir = TempDir::new().unwrap();
        let heap = Heap::create(&dir.path().join("heap.pool"), "heap-test", &PoolConfig::compact()).unwrap();
        (heap, dir)
    }

    #[test]
    fn test_create_sizes_file() {
        let (heap, dir) = test_heap();
        let len = std::fs::metadata(dir.path().join("heap.pool")).unwrap().len();
        assert_eq!(len, PoolConfig::compact().pool_size);
        assert_eq!(heap.free_blocks(), heap.header().heap_blocks);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taken.pool");
        std::fs::write(&path, b"not a pool").unwrap();

        let err = Heap::create(&path, "x", &PoolConfig::compact()).unwrap_err();
        assert!(matches!(err, PoolError::Io { kind: std::io::ErrorKind::AlreadyExists, .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"not a pool");
    }

    #[cfg(unix)]
    #[test]
    fn test_create_applies_mode() {
        use std::os::unix::fs::PermissionsExt;
        let (_heap, dir) = test_heap();
        let mode = std::fs::metadata(dir.path().join("heap.pool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
        assert_eq!(mode & 0o600, 0o600);
    }

    #[test]
    fn test_failed_sizing_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("huge.pool");
        let config = PoolConfig::standard().with_pool_size(1 << 50);

        assert!(Heap::create(&path, "huge", &config).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_unpublished_pool_does_not_open() {
        let (heap, dir) = test_heap();
        drop(heap);
        let err = Heap::open(&dir.path().join("heap.pool")).unwrap_err();
        assert!(matches!(err, PoolError::NotAPool { .. }));
    }

    #[test]
    fn test_published_header_reopens() {
        let (mut heap, dir) = test_heap();
        let root = heap.block_offset(0);
        heap.publish_header(root, 9, 8).unwrap();
        heap.close().unwrap();
        drop(heap);

        let heap = Heap::open(&dir.path().join("heap.pool")).unwrap();
        assert_eq!(heap.header().layout, "heap-test");
        assert_eq!(heap.header().root_offset, root);
        assert_eq!(heap.header().root_type, 9);
    }

    #[test]
    fn test_find_free_run_skips_used_blocks() {
        let (mut heap, _dir) = test_heap();
        heap.set_blocks(0, 3, true);
        heap.set_blocks(4, 1, true);

        // Block 3 is a one-block hole; a two-block run starts after block 4.
        let first = heap.find_free_run(2).unwrap();
        assert_eq!(first, 5);

        heap.set_blocks(first, 2, true);
        assert_eq!(heap.free_blocks(), heap.header().heap_blocks - 6);
    }

    #[test]
    fn test_find_free_run_wraps_around() {
        let (mut heap, _dir) = test_heap();
        let total = heap.header().heap_blocks;
        heap.set_blocks(total - 2, 2, true);
        heap.next_fit = total - 1;

        assert_eq!(heap.find_free_run(1).unwrap(), 0);
    }

    #[test]
    fn test_out_of_space() {
        let (mut heap, _dir) = test_heap();
        let total = heap.header().heap_blocks;
        let err = heap.find_free_run(total + 1).unwrap_err();
        assert!(matches!(err, PoolError::OutOfSpace { free_blocks, .. } if free_blocks == total));
    }

    #[test]
    fn test_bitmap_span_covers_bytes() {
        let (heap, _dir) = test_heap();
        let base = heap.header().bitmap_offset;
        assert_eq!(heap.bitmap_span(0, 1), (base, 1));
        assert_eq!(heap.bitmap_span(6, 4), (base, 2));
        assert_eq!(heap.bitmap_span(16, 8), (base + 2, 1));
    }

    #[test]
    fn test_object_header_validation() {
        let (mut heap, _dir) = test_heap();
        let offset = heap.block_offset(2);

        assert!(matches!(heap.object_header(0), Err(PoolError::NullPointer)));
        assert!(matches!(heap.object_header(offset), Err(PoolError::InvalidPointer { .. })));
        assert!(matches!(heap.object_header(offset + 8), Err(PoolError::InvalidPointer { .. })));
        assert!(matches!(heap.object_header(64), Err(PoolError::InvalidPointer { .. })));

        let header = ObjectHeader::new(42, 100);
        heap.set_blocks(2, header.blocks as u64, true);
        heap.write_at(offset, &header.to_bytes()).unwrap();
        assert_eq!(heap.object_header(offset).unwrap(), header);

        assert!(matches!(
            heap.payload(offset, 41),
            Err(PoolError::TypeMismatch { expected: 41, found: 42, .. })
        ));
        assert_eq!(heap.payload(offset, 42).unwrap().len(), 100);

        let stats = heap.stats();
        assert_eq!(stats.objects, 1);
        assert_eq!(stats.used_blocks, 2);
        assert_eq!(stats.objects_by_type.get(&42), Some(&1));
    }

    #[test]
    fn test_bytes_out_of_range() {
        let (heap, _dir) = test_heap();
        let size = heap.header().pool_size;
        assert!(heap.bytes(size - 4, 4).is_ok());
        assert!(heap.bytes(size - 4, 5).is_err());
        assert!(heap.bytes(u64::MAX, 1).is_err());
    }
}
