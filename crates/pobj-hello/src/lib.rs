//! Hello-world walkthrough of a persistent object pool
//!
//! Each run opens (or creates) a pool holding a counter, a compound record
//! and a bounded history of earlier record values, advances them by one step
//! inside a transaction, and reports what it saw and wrote.
//!
//! - **First run**: create the pool; counter 1, record `(1, 2.0)`, empty history
//! - **Later runs**: counter + 1, record `(i + 1, f + 0.1)`, previous record
//!   appended to the history; once the history reaches [`MAX_HISTORY`] the
//!   oldest entry is evicted in the same transaction

use std::fmt;
use std::path::Path;

use pobj_core::format::{get_u32, get_u64, put_u32, put_u64};
use pobj_core::persist::short_buffer;
use pobj_core::{PPtr, PVec, Persist, Pool, PoolConfig, PoolResult, ReadAccess, Transaction};

/// Layout tag stored in pools created by this program
pub const LAYOUT: &str = "pobj-hello";

/// Maximum length of the history
pub const MAX_HISTORY: usize = 10;

/// Format a float with at most six fractional digits, trailing zeros
/// trimmed but at least one digit kept: `2.0`, `2.1`, `0.333333`.
pub fn format_float(value: f64) -> String {
    let mut s = format!("{:.6}", value);
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.push('0');
        }
    }
    s
}

/// A small value object: one integer, one float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompoundRecord {
    int_value: i32,
    float_value: f64,
}

impl CompoundRecord {
    pub fn new(int_value: i32, float_value: f64) -> Self {
        Self { int_value, float_value }
    }

    pub fn int_value(&self) -> i32 {
        self.int_value
    }

    pub fn float_value(&self) -> f64 {
        self.float_value
    }

    pub fn set_int_value(&mut self, value: i32) {
        self.int_value = value;
    }

    pub fn set_float_value(&mut self, value: f64) {
        self.float_value = value;
    }

    /// The value that follows this one: `(i + 1, f + 0.1)`.
    pub fn advance(&mut self) {
        self.set_int_value(self.int_value.wrapping_add(1));
        self.set_float_value(self.float_value + 0.1);
    }
}

impl fmt::Display for CompoundRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.int_value, format_float(self.float_value))
    }
}

/// Layout: `[0..4] int_value i32 | [4..8] zero | [8..16] float_value f64`
impl Persist for CompoundRecord {
    const TYPE_ID: u32 = 0x434F_4D50; // "COMP"
    const SIZE: usize = 16;

    fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.int_value as u32);
        put_u32(buf, 4, 0);
        put_u64(buf, 8, self.float_value.to_bits());
    }

    fn decode(buf: &[u8]) -> PoolResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(short_buffer(Self::TYPE_ID, Self::SIZE, buf.len()));
        }
        Ok(Self {
            int_value: get_u32(buf, 0) as i32,
            float_value: f64::from_bits(get_u64(buf, 8)),
        })
    }
}

/// Root object of the pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Root {
    pub count: i64,
    /// Current record, owned by the root
    pub current: PPtr<CompoundRecord>,
    /// Earlier record values, oldest first; each entry owns its record
    pub history: PVec<PPtr<CompoundRecord>>,
}

/// Layout: `[0..8] count | [8..16] current | [16..24] history`
impl Persist for Root {
    const TYPE_ID: u32 = 0x524F_4F54; // "ROOT"
    const SIZE: usize = 24;

    fn encode(&self, buf: &mut [u8]) {
        self.count.encode(&mut buf[0..8]);
        self.current.encode(&mut buf[8..16]);
        self.history.encode(&mut buf[16..24]);
    }

    fn decode(buf: &[u8]) -> PoolResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(short_buffer(Self::TYPE_ID, Self::SIZE, buf.len()));
        }
        Ok(Self {
            count: i64::decode(&buf[0..8])?,
            current: PPtr::decode(&buf[8..16])?,
            history: PVec::decode(&buf[16..24])?,
        })
    }
}

/// Which path a run took, decided by whether the pool file existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Fresh,
    Existing,
}

/// What a first run wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct FreshReport {
    pub count: i64,
    pub record: CompoundRecord,
    pub history_len: usize,
}

/// What a later run read and wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    pub old_count: i64,
    pub old_record: CompoundRecord,
    pub new_count: i64,
    pub new_record: CompoundRecord,
    /// History right after the append, oldest first
    pub history: Vec<CompoundRecord>,
    /// Entries evicted to keep the history below `MAX_HISTORY`
    pub evicted: Vec<CompoundRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunReport {
    Fresh(FreshReport),
    Existing(UpdateReport),
}

impl RunReport {
    pub fn kind(&self) -> RunKind {
        match self {
            RunReport::Fresh(_) => RunKind::Fresh,
            RunReport::Existing(_) => RunKind::Existing,
        }
    }

    /// Counter value after the run.
    pub fn count(&self) -> i64 {
        match self {
            RunReport::Fresh(r) => r.count,
            RunReport::Existing(r) => r.new_count,
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunReport::Fresh(r) => {
                writeln!(f, "Create new pmem data:")?;
                writeln!(f, "count = {}", r.count)?;
                writeln!(f, "comp = {}", r.record)?;
                writeln!(f, "number of comp history = {} (max = {})", r.history_len, MAX_HISTORY)
            }
            RunReport::Existing(r) => {
                writeln!(f, "Read old pmem data:")?;
                writeln!(f, "old count = {}", r.old_count)?;
                writeln!(f, "old comp = {}", r.old_record)?;
                writeln!(f, "Update new pmem data:")?;
                writeln!(f, "new count = {}", r.new_count)?;
                writeln!(f, "new comp = {}", r.new_record)?;
                writeln!(f, "number of comp history = {} (max = {})", r.history.len(), MAX_HISTORY)?;
                writeln!(f, "last {} comp values (from oldest to latest) are :", MAX_HISTORY)?;
                for (i, record) in r.history.iter().enumerate() {
                    writeln!(f, "\t[{}] : {}", i + 1, record)?;
                }
                Ok(())
            }
        }
    }
}

/// One run against the pool at `path` with the standard 10 MiB pool.
pub fn run<P: AsRef<Path>>(path: P) -> PoolResult<RunReport> {
    run_with(path, &PoolConfig::standard())
}

/// One run; `config` only matters when the pool has to be created.
pub fn run_with<P: AsRef<Path>>(path: P, config: &PoolConfig) -> PoolResult<RunReport> {
    let path = path.as_ref();
    if Pool::<Root>::exists(path) {
        let mut pool = Pool::<Root>::open(path, LAYOUT)?;
        let report = update(&mut pool)?;
        pool.close()?;
        Ok(RunReport::Existing(report))
    } else {
        let (pool, report) = initialize(path, config)?;
        pool.close()?;
        Ok(RunReport::Fresh(report))
    }
}

/// Create the pool; the first record and the counter are set by the same
/// transaction that allocates the root.
pub fn initialize(path: &Path, config: &PoolConfig) -> PoolResult<(Pool<Root>, FreshReport)> {
    let pool = Pool::create(path, LAYOUT, config, |tx| {
        Ok(Root {
            count: 1,
            current: tx.alloc(&CompoundRecord::new(1, 2.0))?,
            history: PVec::new(tx)?,
        })
    })?;

    let root = pool.root_value()?;
    let report = FreshReport {
        count: root.count,
        record: pool.read(root.current)?,
        history_len: root.history.len(&pool)?,
    };
    Ok((pool, report))
}

/// Advance the pool by one step.
pub fn update(pool: &mut Pool<Root>) -> PoolResult<UpdateReport> {
    update_with(pool, |_| Ok(()))
}

/// `update` with a hook that runs inside the transaction just before commit.
fn update_with<F>(pool: &mut Pool<Root>, before_commit: F) -> PoolResult<UpdateReport>
where
    F: FnOnce(&mut Transaction<'_>) -> PoolResult<()>,
{
    let root_ptr = pool.root();
    let root = pool.root_value()?;
    let old_count = root.count;
    let old_record = pool.read(root.current)?;

    let snapshot = pool.alloc_atomic(&old_record)?;

    let result = pool.run(|tx| {
        tx.update(root_ptr, |r| r.count = r.count.wrapping_add(1))?;
        tx.update(root.current, CompoundRecord::advance)?;
        root.history.push(tx, &snapshot)?;

        let history = root
            .history
            .to_vec(&*tx)?
            .into_iter()
            .map(|ptr| tx.read(ptr))
            .collect::<PoolResult<Vec<_>>>()?;

        let mut evicted = Vec::new();
        while root.history.len(&*tx)? >= MAX_HISTORY {
            let oldest = root.history.remove(tx, 0)?;
            evicted.push(tx.read(oldest)?);
            tx.free(oldest)?;
        }

        before_commit(tx)?;
        Ok((history, evicted))
    });

    let (history, evicted) = match result {
        Ok(v) => v,
        Err(e) => {
            // The snapshot was committed on its own and nothing refers to it.
            if let Err(free_err) = pool.run(|tx| tx.free(snapshot)) {
                log::warn!("[hello] Failed to release orphaned snapshot {:?}: {}", snapshot, free_err);
            }
            return Err(e);
        }
    };

    for record in &evicted {
        log::debug!("[hello] Evicted oldest history entry {}", record);
    }

    Ok(UpdateReport {
        old_count,
        old_record,
        new_count: pool.load(root_ptr)?.count,
        new_record: pool.read(root.current)?,
        history,
        evicted,
    })
}
