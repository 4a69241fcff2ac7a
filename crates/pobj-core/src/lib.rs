//! pobj Core: Transactional Persistent Object Pool
//!
//! A pool is a single memory-mapped file holding typed objects that survive
//! process restarts. Objects refer to each other through offset-based
//! [`PPtr`] handles and are changed only inside transactions, which an undo
//! log makes all-or-nothing across crashes.
//!
//! # Architecture
//!
//! - **Pool file**: header page, undo log, allocation bitmap, object heap
//! - **Transactions**: snapshot-before-write undo logging; commit truncates the log
//! - **Recovery**: opening a pool rolls back whatever a crash left in the log
//! - **Objects**: fixed-size [`Persist`] encodings, plus the growable [`PVec`]
//!
//! ```no_run
//! use pobj_core::{Pool, PoolConfig, PoolResult};
//!
//! fn bump(path: &str) -> PoolResult<u64> {
//!     let mut pool = if Pool::<u64>::exists(path) {
//!         Pool::<u64>::open(path, "counter")?
//!     } else {
//!         Pool::<u64>::create_default(path, "counter", &PoolConfig::default())?
//!     };
//!     let root = pool.root();
//!     pool.run(|tx| tx.update(root, |n| *n += 1))?;
//!     let value = pool.root_value()?;
//!     pool.close()?;
//!     Ok(value)
//! }
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod persist;
pub mod platform_durability;
pub mod pool;
pub mod pvec;
pub mod tx;

mod heap;
mod undo_log;

// Re-export key types for convenience
pub use config::PoolConfig;
pub use error::{PoolError, PoolResult};
pub use heap::PoolStats;
pub use persist::{PPtr, Persist, ReadAccess};
pub use pool::Pool;
pub use pvec::PVec;
pub use tx::Transaction;
