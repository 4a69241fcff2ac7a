//! Integration tests: pool sessions across simulated crashes.
//!
//! A crash is simulated by leaking the open transaction and the pool with
//! `std::mem::forget`: no rollback, no commit, no close. The mapping is
//! shared, so everything written so far is in the file exactly as a killed
//! process would leave it.

use pobj_core::{PPtr, PVec, Persist, Pool, PoolConfig, PoolError, PoolResult, ReadAccess};
use tempfile::TempDir;

const LAYOUT: &str = "crash-test";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Root with a scalar, a pointer and a vector, like a small application graph.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Root {
    counter: u64,
    current: PPtr<u64>,
    items: PVec<u64>,
}

impl Persist for Root {
    const TYPE_ID: u32 = 0x0001_0001;
    const SIZE: usize = 24;

    fn encode(&self, buf: &mut [u8]) {
        self.counter.encode(&mut buf[0..8]);
        self.current.encode(&mut buf[8..16]);
        self.items.encode(&mut buf[16..24]);
    }

    fn decode(buf: &[u8]) -> PoolResult<Self> {
        Ok(Self {
            counter: u64::decode(&buf[0..8])?,
            current: PPtr::decode(&buf[8..16])?,
            items: PVec::decode(&buf[16..24])?,
        })
    }
}

fn create_pool(dir: &TempDir) -> Pool<Root> {
    Pool::create(dir.path().join("crash.pool"), LAYOUT, &PoolConfig::compact(), |tx| {
        Ok(Root {
            counter: 0,
            current: tx.alloc(&100u64)?,
            items: PVec::new(tx)?,
        })
    })
    .unwrap()
}

fn reopen(dir: &TempDir) -> Pool<Root> {
    Pool::open(dir.path().join("crash.pool"), LAYOUT).unwrap()
}

/// Commit one step: bump the counter, overwrite current, push onto items.
fn step(pool: &mut Pool<Root>, value: u64) {
    let root_ptr = pool.root();
    let root = pool.root_value().unwrap();
    pool.run(|tx| {
        tx.update(root_ptr, |r| r.counter += 1)?;
        tx.write(root.current, &value)?;
        root.items.push(tx, &value)
    })
    .unwrap();
}

fn snapshot(pool: &Pool<Root>) -> (u64, u64, Vec<u64>) {
    let root = pool.root_value().unwrap();
    (root.counter, pool.load(root.current).unwrap(), root.items.to_vec(pool).unwrap())
}

// ---------------------------------------------------------------------------
// Crash atomicity
// ---------------------------------------------------------------------------

#[test]
fn test_crash_mid_transaction_rolls_back() {
    let dir = TempDir::new().unwrap();
    let mut pool = create_pool(&dir);
    step(&mut pool, 1);
    let before = snapshot(&pool);
    let stats_before = pool.stats();

    let root_ptr = pool.root();
    let root = pool.root_value().unwrap();
    let mut tx = pool.begin().unwrap();
    tx.update(root_ptr, |r| r.counter = 999).unwrap();
    tx.write(root.current, &999).unwrap();
    for i in 0..20 {
        root.items.push(&mut tx, &i).unwrap();
    }
    tx.alloc(&5u64).unwrap();
    std::mem::forget(tx);
    std::mem::forget(pool);

    let pool = reopen(&dir);
    assert_eq!(snapshot(&pool), before);
    assert_eq!(pool.stats(), stats_before);
}

#[test]
fn test_crash_after_commit_keeps_changes() {
    let dir = TempDir::new().unwrap();
    let mut pool = create_pool(&dir);
    step(&mut pool, 7);
    step(&mut pool, 8);
    std::mem::forget(pool);

    let pool = reopen(&dir);
    assert_eq!(snapshot(&pool), (2, 8, vec![7, 8]));
}

#[test]
fn test_crash_with_pending_free_keeps_object() {
    let dir = TempDir::new().unwrap();
    let mut pool = create_pool(&dir);
    let current = pool.root_value().unwrap().current;

    let mut tx = pool.begin().unwrap();
    tx.free(current).unwrap();
    std::mem::forget(tx);
    std::mem::forget(pool);

    let pool = reopen(&dir);
    assert_eq!(pool.read(current).unwrap(), 100);
}

#[test]
fn test_recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut pool = create_pool(&dir);
    step(&mut pool, 3);
    let before = snapshot(&pool);

    let root_ptr = pool.root();
    let mut tx = pool.begin().unwrap();
    tx.update(root_ptr, |r| r.counter += 50).unwrap();
    std::mem::forget(tx);
    std::mem::forget(pool);

    // Recover, then crash again before doing anything else.
    let pool = reopen(&dir);
    std::mem::forget(pool);

    let pool = reopen(&dir);
    assert_eq!(snapshot(&pool), before);
    pool.close().unwrap();

    let pool = reopen(&dir);
    assert_eq!(snapshot(&pool), before);
}

#[test]
fn test_pool_usable_after_recovery() {
    let dir = TempDir::new().unwrap();
    let mut pool = create_pool(&dir);

    let root_ptr = pool.root();
    let mut tx = pool.begin().unwrap();
    tx.update(root_ptr, |r| r.counter = 42).unwrap();
    std::mem::forget(tx);
    std::mem::forget(pool);

    let mut pool = reopen(&dir);
    step(&mut pool, 11);
    pool.close().unwrap();

    let pool = reopen(&dir);
    assert_eq!(snapshot(&pool), (1, 11, vec![11]));
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[test]
fn test_reopen_without_changes_is_identity() {
    let dir = TempDir::new().unwrap();
    let mut pool = create_pool(&dir);
    for v in 1..=5 {
        step(&mut pool, v);
    }
    let before = snapshot(&pool);
    pool.close().unwrap();

    for _ in 0..3 {
        let pool = reopen(&dir);
        assert_eq!(snapshot(&pool), before);
        pool.close().unwrap();
    }
}

#[test]
fn test_aborted_run_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let mut pool = create_pool(&dir);
    step(&mut pool, 1);
    let before = snapshot(&pool);
    let stats_before = pool.stats();

    let root_ptr = pool.root();
    let root = pool.root_value().unwrap();
    let result: PoolResult<()> = pool.run(|tx| {
        tx.update(root_ptr, |r| r.counter += 1)?;
        let fresh = tx.alloc(&9u64)?;
        tx.write(root_ptr, &Root { current: fresh, ..root })?;
        Err(PoolError::aborted("injected failure"))
    });
    assert!(matches!(result, Err(PoolError::Aborted { .. })));
    assert_eq!(snapshot(&pool), before);
    assert_eq!(pool.stats(), stats_before);
    pool.close().unwrap();

    let pool = reopen(&dir);
    assert_eq!(snapshot(&pool), before);
}

#[test]
fn test_no_leaks_over_many_steps() {
    let dir = TempDir::new().unwrap();
    let mut pool = create_pool(&dir);

    for v in 0..50u64 {
        let root_ptr = pool.root();
        let root = pool.root_value().unwrap();
        pool.run(|tx| {
            let next = tx.alloc(&v)?;
            tx.free(root.current)?;
            tx.write(root_ptr, &Root { current: next, ..root })
        })
        .unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.objects_of::<u64>(), 1);
    assert_eq!(stats.stray_blocks, 0);
    assert_eq!(pool.load(pool.root_value().unwrap().current).unwrap(), 49);
}
