//! The pool head (P): the public handle that owns a backing region, its
//! variable-size heap, its fixed-size class table, and the chain of
//! further links created on growth.

use std::cell::UnsafeCell;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::class::ClassTable;
use crate::config::PoolConfig;
use crate::error::{self, ErrorKind, Result};
use crate::heap::Heap;
use crate::region::Region;
use crate::stats::{fragmentation_ratio, Counters, Stats};

struct Link {
    region: Region,
    heap: Heap,
}

impl Link {
    fn new(size: usize) -> Result<Self> {
        let region = Region::acquire(size)?;
        // SAFETY: `region` was just mapped fresh and is exclusively owned
        // by the `Link` being constructed; it outlives the `Heap` built
        // over it, which is dropped first (field declaration order).
        let heap = unsafe { Heap::init(region.base(), region.size()) };
        Ok(Link { region, heap })
    }
}

struct PoolState {
    links: Vec<Link>,
    classes: ClassTable,
    alignment: usize,
    counters: Counters,
}

// SAFETY: every raw pointer reachable from a `PoolState` (in its links or
// its class table) points into memory exclusively owned by that
// `PoolState`. Concurrent access is gated one level up, by `Backing`.
unsafe impl Send for PoolState {}

impl PoolState {
    fn new(first_region_size: usize, alignment: usize) -> Result<Self> {
        let first = Link::new(first_region_size)?;
        Ok(PoolState {
            links: vec![first],
            classes: ClassTable::new(),
            alignment,
            counters: Counters::default(),
        })
    }

    fn bytes_in_use(&self) -> usize {
        self.links.iter().map(|l| l.heap.used_bytes()).sum::<usize>() + self.classes.bytes_in_use()
    }

    fn total_bytes(&self) -> usize {
        self.links.iter().map(|l| l.heap.total_bytes()).sum()
    }

    fn grow(&mut self, requested: usize, align: usize) -> Result<()> {
        let first_size = self.links[0].region.size();
        let needed = requested + crate::heap::allocation_overhead(align);
        let target = needed.max(first_size);
        let link = Link::new(target)?;
        tracing::debug!(
            requested,
            first_size,
            new_link_size = link.region.size(),
            chain_len = self.links.len() + 1,
            "growing pool chain"
        );
        self.links.push(link);
        Ok(())
    }

    fn alloc_variable(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        for link in &mut self.links {
            // SAFETY: `link.heap` is exclusively borrowed here and was
            // built over memory `link.region` owns.
            match unsafe { link.heap.alloc(size, align) } {
                Ok(allocation) => {
                    self.counters
                        .record_alloc(usize::from(allocation.split_performed), self.bytes_in_use());
                    return Ok(allocation.ptr);
                }
                Err(ErrorKind::OutOfMemory { .. }) => continue,
                Err(other) => return Err(other),
            }
        }

        self.grow(size, align)?;
        let link = self.links.last_mut().expect("grow always pushes a link");
        // SAFETY: see above.
        let allocation = unsafe { link.heap.alloc(size, align)? };
        self.counters
            .record_alloc(usize::from(allocation.split_performed), self.bytes_in_use());
        Ok(allocation.ptr)
    }

    fn link_containing(&mut self, addr: usize) -> Option<&mut Link> {
        self.links.iter_mut().find(|l| l.region.contains(addr))
    }

    fn free_variable(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let Some(link) = self.link_containing(addr) else {
            return Err(ErrorKind::InvalidPointer { ptr: addr });
        };
        // SAFETY: `link` was found to contain `addr`; ownership of the
        // memory behind `ptr`, if valid at all, belongs to `link.heap`.
        let merges = unsafe { link.heap.free(ptr)? };
        self.counters.record_free(merges);
        Ok(())
    }

    fn realloc_variable(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>> {
        let Some(ptr) = ptr else {
            return self.alloc_variable(new_size, align).map(Some);
        };
        if new_size == 0 {
            self.free_variable(ptr)?;
            return Ok(None);
        }

        let addr = ptr.as_ptr() as usize;
        let link_index = self
            .links
            .iter()
            .position(|l| l.region.contains(addr))
            .ok_or(ErrorKind::InvalidPointer { ptr: addr })?;

        // SAFETY: `link_index` was found to contain `addr`.
        let in_place = unsafe { self.links[link_index].heap.grow_in_place(ptr, new_size)? };
        if let Some((new_ptr, splits, merges)) = in_place {
            self.counters.record_alloc(splits, self.bytes_in_use());
            self.counters.record_free(merges);
            return Ok(Some(new_ptr));
        }

        let old_avail = self.links[link_index].heap.available_from(ptr)?;
        let new_ptr = self.alloc_variable(new_size, align)?;
        let copy_len = old_avail.min(new_size);
        // SAFETY: `ptr` is valid for `old_avail` bytes (checked above) and
        // `new_ptr` is valid for `new_size >= copy_len` bytes, freshly
        // returned by `alloc_variable`; the two allocations never overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
        }
        self.free_variable(ptr)?;
        Ok(Some(new_ptr))
    }

    fn contains(&self, addr: usize) -> bool {
        self.links.iter().any(|l| l.region.contains(addr))
    }

    fn validate(&self) -> Result<()> {
        for (i, link) in self.links.iter().enumerate() {
            link.heap.validate().map_err(|e| match e {
                ErrorKind::Corruption { component, detail } => ErrorKind::Corruption {
                    component,
                    detail: format!("link {i}: {detail}"),
                },
                other => other,
            })?;
        }
        Ok(())
    }

    fn defragment(&mut self) -> usize {
        self.links.iter_mut().map(|l| l.heap.defragment()).sum()
    }

    fn reset(&mut self) -> Result<()> {
        let sizes: Vec<usize> = self.links.iter().map(|l| l.region.size()).collect();
        let mut new_links = Vec::with_capacity(sizes.len());
        for size in sizes {
            new_links.push(Link::new(size)?);
        }
        self.links = new_links;
        self.classes.reset();
        self.counters = Counters::default();
        Ok(())
    }

    fn warmup(&self) {
        for link in &self.links {
            link.region.warmup();
        }
    }

    fn get_stats(&self) -> Stats {
        let mut largest_free = 0usize;
        let mut total_free = 0usize;
        let mut free_block_count = 0usize;
        let mut allocated_block_count = 0usize;
        for link in &self.links {
            let (l, t, f, a) = link.heap.block_stats();
            largest_free = largest_free.max(l);
            total_free += t;
            free_block_count += f;
            allocated_block_count += a;
        }

        Stats {
            total_bytes: self.total_bytes(),
            bytes_in_use: self.bytes_in_use(),
            peak_bytes: self.counters.peak_bytes,
            alloc_count: self.counters.alloc_count,
            free_count: self.counters.free_count,
            allocated_block_count,
            free_block_count,
            merge_count: self.counters.merge_count,
            split_count: self.counters.split_count,
            fragmentation_ratio: fragmentation_ratio(largest_free, total_free),
        }
    }

    fn add_class(&mut self, size: usize, capacity: usize) -> Result<u32> {
        let alignment = self.alignment;
        let head = self.links.first_mut().expect("a pool always has at least one link");
        self.classes.add_class(&mut head.heap, size, capacity, alignment)
    }

    fn alloc_fixed(&mut self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.classes.alloc_fixed(size)?;
        self.counters.record_alloc(0, self.bytes_in_use());
        Ok(ptr)
    }

    fn free_fixed(&mut self, ptr: NonNull<u8>) -> Result<()> {
        self.classes.free_fixed(ptr)?;
        self.counters.record_free(0);
        Ok(())
    }

    #[cfg(feature = "debug-dump")]
    fn debug_dump(&self) -> Vec<Vec<(usize, usize, &'static str)>> {
        self.links.iter().map(|l| l.heap.debug_dump()).collect()
    }
}

/// Synchronization strategy chosen at creation time by
/// [`PoolConfig::thread_safe`].
enum Backing {
    Locked(Mutex<PoolState>),
    Unlocked(UnsafeCell<PoolState>),
}

// SAFETY: `Locked` is `Sync` because `parking_lot::Mutex` is. `Unlocked`
// is constructed only when the pool was created with `thread_safe:
// false`; by that contract the caller promises never to access it from
// more than one thread concurrently, which is exactly what the spec's
// "optional lock" describes. The `UnsafeCell` access in
// `Backing::with` never hands out more than one `&mut PoolState` at a
// time.
unsafe impl Sync for Backing {}

impl Backing {
    fn with<R>(&self, f: impl FnOnce(&mut PoolState) -> R) -> R {
        match self {
            Backing::Locked(mutex) => f(&mut mutex.lock()),
            Backing::Unlocked(cell) => {
                // SAFETY: see the `unsafe impl Sync for Backing` comment
                // above; single-threaded use is the caller's contract.
                let state = unsafe { &mut *cell.get() };
                f(state)
            }
        }
    }
}

/// The public handle to a memory pool.
///
/// Every method takes `&self`: mutation happens behind the lock (or, for
/// `thread_safe: false` pools, behind the caller's single-threaded
/// discipline). Cloning a `Pool` is not supported — wrap it in an `Arc` to
/// share it between threads.
pub struct Pool {
    backing: Backing,
}

impl Pool {
    /// Creates a pool with a single backing region of `size` bytes
    /// (rounded up to the OS page size), the default alignment (64), and
    /// no fixed-size classes.
    pub fn create(size: usize, thread_safe: bool) -> Result<Self> {
        PoolConfig::new(size).thread_safe(thread_safe).build()
    }

    pub(crate) fn from_config(cfg: PoolConfig) -> Result<Self> {
        let mut state = PoolState::new(cfg.pool_size, cfg.alignment)?;
        tracing::debug!(pool_size = cfg.pool_size, alignment = cfg.alignment, thread_safe = cfg.thread_safe, "pool created");

        if cfg.enable_size_classes {
            for (&size, &capacity) in cfg.size_class_sizes.iter().zip(cfg.size_class_capacities.iter()) {
                state.add_class(size, capacity)?;
            }
        }

        let backing = if cfg.thread_safe {
            Backing::Locked(Mutex::new(state))
        } else {
            Backing::Unlocked(UnsafeCell::new(state))
        };
        Ok(Pool { backing })
    }

    /// Allocates `size` bytes at the pool's default alignment.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        let alignment = self.backing.with(|s| s.alignment);
        self.alloc_aligned(size, alignment)
    }

    /// Allocates `size` bytes at `align`, which must be a power of two.
    /// When `align` is no stricter than the pool's configured alignment
    /// this costs nothing extra over [`Self::alloc`].
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        error::record(self.backing.with(|s| s.alloc_variable(size, align)))
    }

    /// Like `alloc`, but returns a null pointer on failure instead of an
    /// `Err`, recording the reason in [`crate::error::last_error`]. Provided
    /// for callers working with raw pointers across an FFI boundary.
    pub fn alloc_ptr(&self, size: usize) -> *mut u8 {
        self.alloc(size).map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// Allocates space for `n` elements of `size` bytes each, zeroed.
    /// Fails with `InvalidSize` if `n * size` overflows.
    pub fn calloc(&self, n: usize, size: usize) -> Result<NonNull<u8>> {
        let total = n.checked_mul(size).ok_or(ErrorKind::InvalidSize {
            reason: "calloc(n, size) overflows",
        })?;
        if total == 0 {
            return Err(ErrorKind::InvalidSize { reason: "calloc of zero bytes" });
        }
        let ptr = self.alloc(total)?;
        // SAFETY: `ptr` is valid for `total` freshly-allocated bytes.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, total);
        }
        Ok(ptr)
    }

    /// Releases a block previously returned by `alloc`, `alloc_aligned`,
    /// or `calloc` from this pool.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        error::record(self.backing.with(|s| s.free_variable(ptr)))
    }

    /// `realloc(None, n)` behaves like `alloc(n)`. `realloc(Some(p), 0)`
    /// frees `p` and returns `Ok(None)`. Otherwise grows or shrinks `p` in
    /// place when possible, or allocates fresh space, copies the
    /// overlapping prefix, and frees `p`.
    pub fn realloc(&self, ptr: Option<NonNull<u8>>, new_size: usize) -> Result<Option<NonNull<u8>>> {
        let alignment = self.backing.with(|s| s.alignment);
        error::record(self.backing.with(|s| s.realloc_variable(ptr, new_size, alignment)))
    }

    /// `true` if `ptr` falls within some backing region of this pool's
    /// chain. Does not validate the pointer's header.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.backing.with(|s| s.contains(ptr.as_ptr() as usize))
    }

    /// Checks every invariant in the data model across every link of the
    /// chain, without mutating anything.
    pub fn validate(&self) -> Result<()> {
        self.backing.with(|s| s.validate())
    }

    /// Performs a best-effort merge pass over every link, restoring the
    /// coalescing invariant after any external disturbance. Idempotent.
    /// Returns the number of merges performed.
    pub fn defragment(&self) -> usize {
        self.backing.with(|s| s.defragment())
    }

    /// Resets every link's heap and the class table to their
    /// freshly-created state, without releasing any backing region to the
    /// OS. Statistics counters are zeroed.
    pub fn reset(&self) -> Result<()> {
        self.backing.with(|s| s.reset())
    }

    /// Touches every page of every link once, forcing the OS to commit
    /// physical memory ahead of time.
    pub fn warmup(&self) {
        self.backing.with(|s| s.warmup())
    }

    /// A snapshot of usage statistics, aggregated across the whole chain.
    pub fn get_stats(&self) -> Stats {
        self.backing.with(|s| s.get_stats())
    }

    /// Adds a fixed-size class serving `size`-byte slots with `capacity`
    /// slots, carved from the head link's heap. Returns the new class id.
    pub fn add_class(&self, size: usize, capacity: usize) -> Result<u32> {
        error::record(self.backing.with(|s| s.add_class(size, capacity)))
    }

    /// Allocates one slot from the smallest class whose slot size is `>=
    /// size`. O(1); never triggers chain growth.
    pub fn alloc_fixed(&self, size: usize) -> Result<NonNull<u8>> {
        error::record(self.backing.with(|s| s.alloc_fixed(size)))
    }

    /// Releases a slot previously returned by `alloc_fixed`. O(1).
    pub fn free_fixed(&self, ptr: NonNull<u8>) -> Result<()> {
        error::record(self.backing.with(|s| s.free_fixed(ptr)))
    }

    /// Releases every backing region back to the OS. Equivalent to
    /// dropping the pool, spelled out for callers who want the release to
    /// be visible at the call site.
    pub fn destroy(self) {
        tracing::debug!("pool destroyed");
        drop(self);
    }

    /// Renders the address list of every link, as `(offset, payload_size,
    /// state)` triples, for debugging use. Not part of the stable surface;
    /// its shape may change between patch releases.
    #[cfg(feature = "debug-dump")]
    pub fn debug_dump(&self) -> Vec<Vec<(usize, usize, &'static str)>> {
        self.backing.with(|s| s.debug_dump())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    #[test]
    fn basic_scenario() {
        let pool = Pool::create(16 * 1024 * 1024, true).unwrap();
        let p1 = pool.alloc(1024).unwrap();
        let p2 = pool.alloc(2048).unwrap();
        pool.free(p1).unwrap();
        pool.free(p2).unwrap();
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn bad_alignment_reports_invalid_size() {
        let pool = Pool::create(1 << 16, true).unwrap();
        let err = pool.alloc_aligned(64, 24).unwrap_err();
        assert!(matches!(err, ErrorKind::InvalidSize { .. }));
        assert_eq!(crate::error::last_error(), err);
    }

    #[test]
    fn zero_size_alloc_is_invalid() {
        let pool = Pool::create(1 << 16, true).unwrap();
        let err = pool.alloc(0).unwrap_err();
        assert!(matches!(err, ErrorKind::InvalidSize { .. }));
    }

    #[test]
    fn foreign_free_reports_invalid_pointer() {
        let pool = Pool::create(1 << 16, true).unwrap();
        let foreign = NonNull::new(0x12345usize as *mut u8).unwrap();
        let err = pool.free(foreign).unwrap_err();
        assert!(matches!(err, ErrorKind::InvalidPointer { .. }));
    }

    #[test]
    fn defragment_then_large_alloc_succeeds() {
        let pool = Pool::create(2 * 1024 * 1024, true).unwrap();
        let mut handles = Vec::new();
        for _ in 0..200 {
            handles.push(pool.alloc(256).unwrap());
        }
        for (i, ptr) in handles.iter().enumerate() {
            if i % 2 == 0 {
                pool.free(*ptr).unwrap();
            }
        }
        pool.defragment();
        pool.alloc(256 * 50).unwrap();
    }

    #[test]
    fn chain_growth_on_exhaustion() {
        let pool = Pool::create(64 * 1024, true).unwrap();
        let p = pool.alloc(96 * 1024).unwrap();
        assert!(pool.contains(p));
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn fixed_class_scenario() {
        let pool = Pool::create(4 * 1024 * 1024, true).unwrap();
        let id = pool.add_class(64, 1000).unwrap();
        let mut live = Vec::new();
        for i in 0..300 {
            let size = [64, 256, 1024][i % 3];
            // only the 64-class exists here, sizes above it should fail;
            // exercise the one real class plus expected failures.
            if size == 64 {
                live.push(pool.alloc_fixed(size).unwrap());
            } else {
                assert!(pool.alloc_fixed(size).is_err());
            }
        }
        let _ = id;
        for ptr in live {
            pool.free_fixed(ptr).unwrap();
        }
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn realloc_preserves_bytes() {
        let pool = Pool::create(1 << 20, true).unwrap();
        let p = pool.alloc(512).unwrap();
        // SAFETY: `p` is valid for 512 freshly-allocated bytes.
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0xCC, 512) };
        let grown = pool.realloc(Some(p), 1536).unwrap().unwrap();
        assert_eq!(unsafe { *grown.as_ptr() }, 0xCC);
        assert_eq!(unsafe { *grown.as_ptr().add(511) }, 0xCC);
    }

    #[test]
    fn realloc_null_is_alloc_and_zero_is_free() {
        let pool = Pool::create(1 << 16, true).unwrap();
        let p = pool.realloc(None, 128).unwrap().unwrap();
        assert!(pool.realloc(Some(p), 0).unwrap().is_none());
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn reset_matches_fresh_pool() {
        let pool = Pool::create(1 << 16, true).unwrap();
        let p = pool.alloc(128).unwrap();
        let _ = p;
        pool.reset().unwrap();
        let stats = pool.get_stats();
        assert_eq!(stats.bytes_in_use, 0);
        assert_eq!(stats.alloc_count, 0);
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn single_threaded_pool_is_usable() {
        let pool = PoolConfig::new(1 << 16).thread_safe(false).build().unwrap();
        let p = pool.alloc(128).unwrap();
        pool.free(p).unwrap();
    }

    #[test]
    fn concurrent_alloc_free_preserves_invariants() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(Pool::create(4 * 1024 * 1024, true).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                let mut live = Vec::new();
                for i in 0..200 {
                    if i % 3 == 0 && !live.is_empty() {
                        let idx = i % live.len();
                        let ptr: NonNull<u8> = live.swap_remove(idx);
                        pool.free(ptr).unwrap();
                    } else {
                        live.push(pool.alloc(64 + (i % 5) * 32).unwrap());
                    }
                }
                for ptr in live {
                    pool.free(ptr).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.validate().is_ok());
        let stats = pool.get_stats();
        assert_eq!(stats.bytes_in_use, 0);
    }
}
