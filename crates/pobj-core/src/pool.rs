//! Pool sessions: create, open, recover, transact, close
//!
//! A `Pool<R>` owns one mapped pool file whose root object has type `R`.
//! Opening a pool rolls back any transaction a crash interrupted, so every
//! session starts from the last committed state.

use std::path::Path;

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::heap::{remove_unpublished, Heap, PoolStats};
use crate::persist::{PPtr, Persist, ReadAccess};
use crate::tx::Transaction;
use crate::undo_log::UndoLog;

/// An open pool whose root object is an `R`.
pub struct Pool<R: Persist> {
    heap: Heap,
    root: PPtr<R>,
}

impl<R: Persist> Pool<R> {
    /// Whether something exists at `path`. Says nothing about whether it is
    /// a valid pool; `open` checks that.
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().exists()
    }

    /// Create a new pool file and its root object.
    ///
    /// `init` runs inside the creating transaction and returns the initial
    /// root value; anything it allocates is committed together with the root.
    /// Fails if `path` already exists. If anything fails after the file was
    /// created, the file is removed again.
    pub fn create<P, F>(path: P, layout: &str, config: &PoolConfig, init: F) -> PoolResult<Self>
    where
        P: AsRef<Path>,
        F: FnOnce(&mut Transaction<'_>) -> PoolResult<R>,
    {
        let path = path.as_ref();
        config.validate().map_err(|reason| PoolError::InvalidConfig { reason })?;

        let mut heap = Heap::create(path, layout, config)?;
        match Self::build_root(&mut heap, init) {
            Ok(root) => {
                log::info!(
                    "[pool] Created {} (layout {:?}, {} bytes)",
                    path.display(),
                    layout,
                    config.pool_size
                );
                Ok(Self { heap, root })
            }
            Err(e) => {
                drop(heap);
                remove_unpublished(path);
                Err(e)
            }
        }
    }

    fn build_root<F>(heap: &mut Heap, init: F) -> PoolResult<PPtr<R>>
    where
        F: FnOnce(&mut Transaction<'_>) -> PoolResult<R>,
    {
        let root = {
            let mut tx = Transaction::begin(heap)?;
            let value = init(&mut tx)?;
            let root = tx.alloc(&value)?;
            tx.commit()?;
            root
        };
        heap.publish_header(root.offset(), R::TYPE_ID, R::SIZE as u32)?;
        Ok(root)
    }

    /// Open an existing pool created with the same layout tag and root type.
    pub fn open<P: AsRef<Path>>(path: P, layout: &str) -> PoolResult<Self> {
        let path = path.as_ref();
        let mut heap = Heap::open(path)?;

        let header = heap.header().clone();
        if header.layout != layout {
            return Err(PoolError::LayoutMismatch {
                path: path.to_path_buf(),
                expected: layout.to_string(),
                found: header.layout,
            });
        }
        if header.root_type != R::TYPE_ID || header.root_size as usize != R::SIZE {
            return Err(PoolError::RootMismatch {
                path: path.to_path_buf(),
                expected_type: R::TYPE_ID,
                found_type: header.root_type,
            });
        }

        let mut log = UndoLog::attach(&heap)?;
        if !log.is_empty() {
            let undone = log.rollback(&mut heap)?;
            log::warn!(
                "[pool] Recovered {}: rolled back an interrupted transaction ({} snapshots)",
                path.display(),
                undone
            );
        }

        heap.payload(header.root_offset, R::TYPE_ID).map_err(|e| PoolError::PoolCorrupted {
            path: path.to_path_buf(),
            reason: format!("root object at 0x{:x} is unusable: {}", header.root_offset, e),
        })?;

        log::debug!("[pool] Opened {} (layout {:?})", path.display(), layout);
        Ok(Self { heap, root: PPtr::from_offset(header.root_offset) })
    }

    pub fn root(&self) -> PPtr<R> {
        self.root
    }

    /// Copy of the root object.
    pub fn root_value(&self) -> PoolResult<R> {
        self.heap.read_object(self.root)
    }

    pub fn read<T: Persist>(&self, ptr: PPtr<T>) -> PoolResult<T> {
        self.heap.read_object(ptr)
    }

    pub fn path(&self) -> &Path {
        self.heap.path()
    }

    pub fn layout(&self) -> &str {
        &self.heap.header().layout
    }

    /// Start a transaction. Commit or abort it explicitly; dropping it aborts.
    pub fn begin(&mut self) -> PoolResult<Transaction<'_>> {
        Transaction::begin(&mut self.heap)
    }

    /// Run `body` as one transaction: commit if it returns `Ok`, roll back
    /// and return the error if it returns `Err` or panics.
    pub fn run<T, F>(&mut self, body: F) -> PoolResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> PoolResult<T>,
    {
        let mut tx = self.begin()?;
        match body(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.abort() {
                    log::error!("[pool] Rollback after failed transaction also failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Allocate and initialise one object in a transaction of its own.
    pub fn alloc_atomic<T: Persist>(&mut self, value: &T) -> PoolResult<PPtr<T>> {
        self.run(|tx| tx.alloc(value))
    }

    pub fn stats(&self) -> PoolStats {
        self.heap.stats()
    }

    /// Flush the mapping and sync the file. Every committed transaction is
    /// durable once this returns.
    pub fn close(mut self) -> PoolResult<()> {
        self.heap.close()?;
        log::debug!("[pool] Closed {}", self.heap.path().display());
        Ok(())
    }
}

impl<R: Persist + Default> Pool<R> {
    /// Create a pool whose root starts as `R::default()`.
    pub fn create_default<P: AsRef<Path>>(path: P, layout: &str, config: &PoolConfig) -> PoolResult<Self> {
        Self::create(path, layout, config, |_| Ok(R::default()))
    }
}

impl<R: Persist> ReadAccess for Pool<R> {
    fn heap(&self) -> &Heap {
        &self.heap
    }
}

impl<R: Persist> std::fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("heap", &self.heap)
            .field("root", &self.root)
            .finish()
    }
}
