//! A user-space memory pool allocator.
//!
//! A [`Pool`] owns one or more backing regions of OS memory (a chain,
//! growing on demand) and serves allocations two ways:
//!
//! - **Variable-size**, through a boundary-tag free-list heap with
//!   best-fit search, in-place splitting, and coalescing on free.
//! - **Fixed-size**, through a table of pre-carved slab classes served by
//!   an O(1) free-index stack, for callers with a known, repeated
//!   allocation size.
//!
//! ```
//! use mempool::Pool;
//!
//! let pool = Pool::create(1 << 20, true)?;
//! let block = pool.alloc(256)?;
//! pool.free(block)?;
//! # Ok::<(), mempool::ErrorKind>(())
//! ```
#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(missing_docs)]

mod class;
mod config;
mod error;
mod heap;
mod pool;
mod region;
mod stats;

pub use class::MAX_SIZE_CLASSES;
pub use config::{PoolConfig, DEFAULT_ALIGNMENT, MIN_POOL_SIZE};
pub use error::{last_error, ErrorKind, RawErrorCode, Result};
pub use pool::Pool;
pub use stats::Stats;
