//! Slab-backed object cache with per-CPU magazines
//!
//! Objects of one fixed size are carved out of page-multiple "slabs"; each
//! slab tracks which slots have had their constructor run and which are
//! currently handed out. The slab list is kept ordered from most- to
//! least-occupied so that allocation packs objects into already-busy slabs
//! and fully-idle slabs accumulate at the tail where [Pool::spill] can
//! return them wholesale.
//!
//! The get/put fast path never takes the pool lock: each logical processor
//! owns a small fixed [Magazine] free-list, reached through a [PoolShard]
//! handle that enforces exclusive per-CPU access the same way the slab
//! allocator this is modeled on hands out per-thread shards (an atomic
//! in-use bitfield rather than a scheduler priority).
//!
//! The pool deliberately does not pick a mutual-exclusion primitive for the
//! slow path; the owning subsystem supplies one via [LockOps].

use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use tracing::Level;

use crate::lockops::LockOps;
use crate::loom_testing::*;
use crate::mask::Mask;
use crate::util::roundto;
use crate::PoolError;


/// Slots in each per-CPU magazine
pub const MAGAZINE_SLOTS: usize = 6;

/// Absolute maximum number of logical processors supported
///
/// Fixed so the magazine array and the shard in-use bitfield can live
/// inline in the pool; 64 lets a single `u64` track shard ownership.
pub const MAX_CPUS: usize = 64;
const _: () = assert!(MAX_CPUS <= 64);

/// Smallest slab size; a pool can ask for a power-of-two multiple
pub const PAGE_SZ: usize = 4096;

const SLAB_MAGIC: u32 = 0x4d41_4753;

/// Per-object constructor, run lazily the first time a slot is handed out
pub type Ctor = Box<dyn Fn(NonNull<u8>) -> Result<(), PoolError> + Send + Sync>;
/// Per-object destructor, run when the containing slab is destroyed
pub type Dtor = Box<dyn Fn(NonNull<u8>) + Send + Sync>;

/// Artificial get-failure configuration, for exercising callers' no-object
/// recovery paths
#[derive(Debug, Clone, Copy)]
pub struct FaultInjection {
    /// Number of gets to let through before failures may start
    pub defer: u32,
    /// Percentage (0..=100) of subsequent gets that fail
    pub probability: u32,
}

/// Creation-time pool parameters
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    /// Size of each object in bytes; rounded up to pointer alignment
    pub object_size: u32,
    /// Slot count the registry's monitor keeps the pool grown to
    pub reservation: u32,
    /// Hard upper bound on slot count; 0 means unbounded
    pub cap: u32,
    /// log2 of pages per slab (0 = one page per slab)
    pub slab_order: u32,
    pub fault_injection: Option<FaultInjection>,
}

impl PoolConfig {
    pub fn new(name: &str, object_size: u32) -> Self {
        Self {
            name: name.to_owned(),
            object_size,
            reservation: 0,
            cap: 0,
            slab_order: 0,
            fault_injection: None,
        }
    }
}

/// Everything needed to size a slab and locate slots within it, computed
/// once at pool creation
#[derive(Debug, Clone, Copy)]
struct SlabGeometry {
    slab_bytes: usize,
    layout: Layout,
    obj_offset: u32,
    object_size: u32,
    capacity: u32,
}

impl SlabGeometry {
    fn compute(config: &PoolConfig) -> Result<SlabGeometry, PoolError> {
        if config.object_size == 0 || config.slab_order > 8 {
            return Err(PoolError::InvalidParameter);
        }
        let object_size = roundto(config.object_size as usize, size_of::<usize>());
        let slab_bytes = PAGE_SZ << config.slab_order;
        // the slab block is aligned to its own (power-of-two) size so the
        // owning slab's base can be recovered from any object by masking
        let layout = Layout::from_size_align(slab_bytes, slab_bytes)
            .map_err(|_| PoolError::InvalidParameter)?;
        let obj_offset = roundto(size_of::<SlabHeader>(), size_of::<usize>());
        let capacity = (slab_bytes - obj_offset) / object_size;
        if capacity == 0 {
            return Err(PoolError::InvalidParameter);
        }
        Ok(SlabGeometry {
            slab_bytes,
            layout,
            obj_offset: obj_offset as u32,
            object_size: object_size as u32,
            capacity: capacity as u32,
        })
    }
}

#[repr(C)]
struct SlabHeader {
    magic: u32,
}

/// One page-multiple block of objects plus the two occupancy masks
///
/// `constructed` is always a contiguous run starting at index 0: slots are
/// constructed in ascending index order and destructed in descending order.
/// This is what lets [Slab::get_object] start its scan at
/// `constructed.count()` when no freed-but-constructed slot exists.
struct Slab {
    base: NonNull<u8>,
    object_size: u32,
    obj_offset: u32,
    capacity: u32,
    layout: Layout,
    constructed: Mask,
    allocated: Mask,
}

// safety: the block is exclusively owned by this Slab; pointers into it are
// only handed out and taken back under the pool's locking discipline
unsafe impl Send for Slab {}

impl Slab {
    fn new(geom: &SlabGeometry) -> Result<Slab, PoolError> {
        // zeroed so a lazy constructor never sees stale bytes
        let raw = unsafe { std::alloc::alloc_zeroed(geom.layout) };
        let base = NonNull::new(raw).ok_or(PoolError::NoMemory)?;
        unsafe {
            (base.as_ptr() as *mut SlabHeader).write(SlabHeader { magic: SLAB_MAGIC });
        }
        Ok(Slab {
            base,
            object_size: geom.object_size,
            obj_offset: geom.obj_offset,
            capacity: geom.capacity,
            layout: geom.layout,
            constructed: Mask::new(geom.capacity),
            allocated: Mask::new(geom.capacity),
        })
    }

    fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn full(&self) -> bool {
        self.allocated.count() == self.capacity
    }

    fn empty(&self) -> bool {
        self.allocated.count() == 0
    }

    fn check_magic(&self) {
        // safety: base points at our own block, which starts with the header
        let magic = unsafe { (self.base.as_ptr() as *const SlabHeader).read().magic };
        assert_eq!(magic, SLAB_MAGIC, "slab header corrupted");
    }

    fn object_ptr(&self, index: u32) -> NonNull<u8> {
        debug_assert!(index < self.capacity);
        // safety: offset stays inside the block by the geometry computation
        unsafe {
            NonNull::new_unchecked(
                self.base
                    .as_ptr()
                    .add(self.obj_offset as usize + index as usize * self.object_size as usize),
            )
        }
    }

    fn index_of(&self, obj: NonNull<u8>) -> u32 {
        let addr = obj.as_ptr() as usize;
        let first = self.base_addr() + self.obj_offset as usize;
        assert!(addr >= first, "object below slab arena");
        let off = addr - first;
        assert_eq!(
            off % self.object_size as usize,
            0,
            "object not on a slot boundary"
        );
        let index = (off / self.object_size as usize) as u32;
        assert!(index < self.capacity, "object beyond slab arena");
        index
    }

    /// Hand out one slot, constructing it lazily
    ///
    /// Freed-but-constructed slots are preferentially reused before a new
    /// slot is constructed: when `allocated.count < constructed.count`
    /// there must be a free slot somewhere in the constructed prefix, so
    /// the scan starts at 0; otherwise every constructed slot is taken and
    /// the scan can start right at `constructed.count`.
    fn get_object(&mut self, ctor: &Ctor) -> Result<NonNull<u8>, PoolError> {
        if self.full() {
            return Err(PoolError::NoMemory);
        }
        let start = if self.allocated.count() < self.constructed.count() {
            0
        } else {
            self.constructed.count()
        };
        let index = self
            .allocated
            .next_clear(start)
            .expect("non-full slab must have a clear allocated bit");
        let obj = self.object_ptr(index);
        if !self.constructed.test(index) {
            // constructed must stay a prefix: a new construction is always
            // at the next index up
            debug_assert_eq!(index, self.constructed.count());
            ctor(obj).map_err(|_| PoolError::NoMemory)?;
            self.constructed.set(index);
        }
        self.allocated.set(index);
        Ok(obj)
    }

    fn put_object(&mut self, index: u32) {
        self.allocated.clear(index);
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // the pool's own leak assert may already be unwinding through
        // here; a second panic would abort before it can be observed
        if !std::thread::panicking() {
            assert_eq!(self.allocated.count(), 0, "slab dropped with live objects");
            assert_eq!(
                self.constructed.count(),
                0,
                "slab dropped with constructed objects"
            );
        }
        // safety: allocated with this layout in Slab::new
        unsafe { std::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Small per-CPU free-list, the lock-free get/put fast path
struct Magazine {
    slot: [Option<NonNull<u8>>; MAGAZINE_SLOTS],
}

impl Magazine {
    const fn new() -> Self {
        Self {
            slot: [None; MAGAZINE_SLOTS],
        }
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        for slot in self.slot.iter_mut() {
            if slot.is_some() {
                return slot.take();
            }
        }
        None
    }

    fn push(&mut self, obj: NonNull<u8>) -> bool {
        for slot in self.slot.iter_mut() {
            if slot.is_none() {
                *slot = Some(obj);
                return true;
            }
        }
        false
    }
}

struct Fist {
    defer: AtomicI64,
    probability: u32,
    seed: AtomicU32,
}

impl Fist {
    fn should_fail(&self) -> bool {
        let defer = self.defer.fetch_sub(1, Ordering::Relaxed) - 1;
        if defer > 0 {
            return false;
        }
        // xorshift over a shared seed; races just perturb the stream
        let mut x = self.seed.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        if x == 0 {
            x = 1;
        }
        self.seed.store(x, Ordering::Relaxed);
        x % 100 < self.probability
    }
}

/// Slow-path state, guarded by the externally-supplied pool lock
struct PoolCore {
    /// Owns the slabs, keyed by block base address. Looking a freed
    /// object's masked base address up here is what validates it before
    /// any slab state is touched.
    slabs: FxHashMap<usize, Slab>,
    /// Base addresses ordered by descending `allocated.count()`
    order: Vec<usize>,
    /// Index of the first non-full slab in `order`, or `order.len()`
    cursor: usize,
    total_slots: u32,
    max_slabs: u32,
}

impl PoolCore {
    fn new() -> Self {
        Self {
            slabs: FxHashMap::default(),
            order: Vec::new(),
            cursor: 0,
            total_slots: 0,
            max_slabs: 0,
        }
    }

    /// Insert a slab (already present in `slabs`, absent from `order`)
    /// at its ordered position and recompute the cursor.
    ///
    /// Linear scan from the head: the slab goes in front of the first slab
    /// it strictly out-counts, so occupancy ties keep their relative
    /// position. The slab being linked always has spare room (it is either
    /// freshly created or was just freed from), so the first non-full slab
    /// is either one seen during the scan or the slab itself.
    fn link_slab(&mut self, base: usize) {
        let count = self.slabs[&base].allocated.count();
        let mut insert_at = self.order.len();
        let mut spare = None;
        for i in 0..self.order.len() {
            let other = &self.slabs[&self.order[i]];
            if spare.is_none() && !other.full() {
                spare = Some(i);
            }
            if other.allocated.count() < count {
                insert_at = i;
                break;
            }
        }
        self.order.insert(insert_at, base);
        self.cursor = spare.unwrap_or(insert_at);
    }

    /// Remove a slab from the ordered list and the side table
    fn unlink_slab(&mut self, base: usize) -> Slab {
        let pos = self
            .order
            .iter()
            .position(|&b| b == base)
            .expect("slab not linked");
        self.order.remove(pos);
        if pos < self.cursor {
            self.cursor -= 1;
        }
        // if pos == cursor, the next entry shifts into its place, which is
        // exactly "advance the cursor to the next slab"; everything after
        // the old cursor is non-full, so the invariant holds
        let slab = self.slabs.remove(&base).expect("slab not in side table");
        self.total_slots -= slab.capacity;
        slab
    }

    /// Create one slab, respecting the cap, and link it
    fn grow(&mut self, geom: &SlabGeometry, cap: u32) -> Result<(), PoolError> {
        if cap != 0 && self.total_slots + geom.capacity > cap {
            return Err(PoolError::InsufficientResources);
        }
        let slab = Slab::new(geom)?;
        let base = slab.base_addr();
        self.total_slots += slab.capacity;
        self.slabs.insert(base, slab);
        self.link_slab(base);
        if self.order.len() as u32 > self.max_slabs {
            self.max_slabs = self.order.len() as u32;
        }
        Ok(())
    }

    /// Return one object to its slab and restore the list ordering
    fn put_back(&mut self, obj: NonNull<u8>, slab_bytes: usize) {
        let base = (obj.as_ptr() as usize) & !(slab_bytes - 1);
        let slab = self
            .slabs
            .get_mut(&base)
            .expect("put of an object this pool does not own");
        slab.check_magic();
        let index = slab.index_of(obj);
        slab.put_object(index);
        let pos = self
            .order
            .iter()
            .position(|&b| b == base)
            .expect("slab not linked");
        self.order.remove(pos);
        self.link_slab(base);
    }

    /// Unlink one slab and run destructors over its constructed prefix,
    /// in strictly descending index order
    fn destroy_slab(&mut self, base: usize, dtor: &Dtor) {
        let mut slab = self.unlink_slab(base);
        assert!(slab.empty(), "destroying a slab with outstanding objects");
        for index in (0..slab.constructed.count()).rev() {
            debug_assert!(slab.constructed.test(index));
            dtor(slab.object_ptr(index));
            slab.constructed.clear(index);
        }
        // Slab::drop frees the block
    }
}

/// A typed-size object cache
///
/// Create with [Pool::create] (capped) or [Pool::create_uncapped], obtain a
/// [PoolShard] per logical processor for get/put, and size with
/// [Pool::fill] / [Pool::spill] (normally driven by the registry monitor).
pub struct Pool<L: LockOps> {
    name: String,
    geom: SlabGeometry,
    reservation: u32,
    cap: u32,
    ctor: Ctor,
    dtor: Dtor,
    lock: L,
    core: UnsafeCell<PoolCore>,
    /// Bitfield of cpu indices whose [PoolShard] is currently handed out
    cpu_inuse: AtomicU64,
    magazines: [UnsafeCell<Magazine>; MAX_CPUS],
    current_objects: AtomicU32,
    max_objects: AtomicU32,
    fist: Option<Fist>,
}

// safety: `core` is only touched with the client lock held (or via &mut
// self during teardown); each magazine is only touched through the shard
// handle for that cpu index, whose exclusivity `cpu_inuse` enforces
unsafe impl<L: LockOps> Send for Pool<L> {}
unsafe impl<L: LockOps> Sync for Pool<L> {}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatistics {
    pub total_slots: u32,
    pub reservation: u32,
    pub current_objects: u32,
    pub max_objects: u32,
    pub current_slabs: u32,
    pub max_slabs: u32,
}

struct CoreGuard<'a, L: LockOps> {
    pool: &'a Pool<L>,
}

impl<'a, L: LockOps> Drop for CoreGuard<'a, L> {
    fn drop(&mut self) {
        self.pool.lock.release();
    }
}

impl<L: LockOps> Pool<L> {
    /// Create a pool and pre-fill it to its reservation
    ///
    /// Fails with [PoolError::InvalidParameter] if the reservation exceeds
    /// a nonzero cap, the object size is zero or does not fit a slab, or
    /// the slab order is unreasonable.
    pub fn create(config: PoolConfig, ctor: Ctor, dtor: Dtor, lock: L) -> Result<Pool<L>, PoolError> {
        let span = tracing::span!(Level::DEBUG, "pool::create", pool = config.name.as_str());
        let _enter = span.enter();

        if config.cap != 0 && config.reservation > config.cap {
            return Err(PoolError::InvalidParameter);
        }
        let geom = SlabGeometry::compute(&config)?;

        let fist = config.fault_injection.map(|fi| {
            let probability = fi.probability.min(100);
            if probability != 0 {
                tracing::info!(
                    pool = config.name.as_str(),
                    defer = fi.defer,
                    probability,
                    "fault injection enabled"
                );
            }
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(0);
            Fist {
                defer: AtomicI64::new(fi.defer as i64),
                probability,
                seed: AtomicU32::new(nanos | 1),
            }
        });

        let pool = Pool {
            name: config.name,
            geom,
            reservation: config.reservation,
            cap: config.cap,
            ctor,
            dtor,
            lock,
            core: UnsafeCell::new(PoolCore::new()),
            cpu_inuse: AtomicU64::new(0),
            magazines: std::array::from_fn(|_| UnsafeCell::new(Magazine::new())),
            current_objects: AtomicU32::new(0),
            max_objects: AtomicU32::new(0),
            fist,
        };
        pool.fill(pool.reservation)?;
        Ok(pool)
    }

    /// Compatibility flavor predating the cap parameter: always unbounded
    pub fn create_uncapped(
        mut config: PoolConfig,
        ctor: Ctor,
        dtor: Dtor,
        lock: L,
    ) -> Result<Pool<L>, PoolError> {
        config.cap = 0;
        Self::create(config, ctor, dtor, lock)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reservation(&self) -> u32 {
        self.reservation
    }

    /// Objects each slab holds
    pub fn slots_per_slab(&self) -> u32 {
        self.geom.capacity
    }

    /// Claim the magazine fast path for one logical processor
    ///
    /// Panics if a shard for this cpu index is already held; per-CPU
    /// exclusivity is the caller's scheduling contract, this bitfield just
    /// makes violations loud.
    pub fn shard(&self, cpu: usize) -> PoolShard<'_, L> {
        assert!(cpu < MAX_CPUS);
        // order: acquire pairs with the release when the previous shard
        // for this cpu dropped, making its magazine contents visible
        let old = self.cpu_inuse.fetch_or(1 << cpu, Ordering::Acquire);
        assert_eq!(old & (1 << cpu), 0, "shard for cpu {} already held", cpu);
        PoolShard { pool: self, cpu }
    }

    fn lock_if<'a>(&'a self, locked: bool) -> Option<CoreGuard<'a, L>> {
        if locked {
            None
        } else {
            self.lock.acquire();
            Some(CoreGuard { pool: self })
        }
    }

    fn slow_get(&self, locked: bool) -> Option<NonNull<u8>> {
        let _guard = self.lock_if(locked);
        // safety: the pool lock is held, by us or by the caller per `locked`
        let core = unsafe { &mut *self.core.get() };
        loop {
            if core.cursor < core.order.len() {
                let base = core.order[core.cursor];
                let slab = core.slabs.get_mut(&base).expect("cursor slab missing");
                match slab.get_object(&self.ctor) {
                    Ok(obj) => {
                        if slab.full() {
                            // full slabs pack the front of the list, so the
                            // next entry is the new first-non-full
                            core.cursor += 1;
                        }
                        return Some(obj);
                    }
                    // constructor failure; the slot was left untouched
                    Err(err) => {
                        tracing::event!(Level::TRACE, err = %err, "constructor failed");
                        return None;
                    }
                }
            }
            if let Err(err) = core.grow(&self.geom, self.cap) {
                tracing::event!(Level::TRACE, err = %err, "slab creation failed");
                return None;
            }
        }
    }

    fn slow_put(&self, obj: NonNull<u8>, locked: bool) {
        let _guard = self.lock_if(locked);
        // safety: the pool lock is held, by us or by the caller per `locked`
        let core = unsafe { &mut *self.core.get() };
        core.put_back(obj, self.geom.slab_bytes);
    }

    /// Grow until at least `count` slots exist
    ///
    /// Returns the failure that stopped growth, if any. Takes the pool lock.
    pub fn fill(&self, count: u32) -> Result<(), PoolError> {
        let _guard = self.lock_if(false);
        // safety: the pool lock is held
        let core = unsafe { &mut *self.core.get() };
        while core.total_slots < count {
            core.grow(&self.geom, self.cap)?;
        }
        Ok(())
    }

    /// Destroy empty slabs from the least-occupied tail while at least
    /// `count` slots would remain
    ///
    /// Stops at the first non-empty tail slab: with the list ordered by
    /// descending occupancy, nothing in front of it can be empty either.
    pub fn spill(&self, count: u32) {
        let _guard = self.lock_if(false);
        // safety: the pool lock is held
        let core = unsafe { &mut *self.core.get() };
        while let Some(&base) = core.order.last() {
            let slab = &core.slabs[&base];
            if !slab.empty() {
                break;
            }
            if core.total_slots - slab.capacity < count {
                break;
            }
            core.destroy_slab(base, &self.dtor);
        }
    }

    pub fn statistics(&self) -> PoolStatistics {
        let _guard = self.lock_if(false);
        // safety: the pool lock is held
        let core = unsafe { &*self.core.get() };
        PoolStatistics {
            total_slots: core.total_slots,
            reservation: self.reservation,
            current_objects: self.current_objects.load(Ordering::Relaxed),
            max_objects: self.max_objects.load(Ordering::Relaxed),
            current_slabs: core.order.len() as u32,
            max_slabs: core.max_slabs,
        }
    }

    /// One diagnostic dump line for this pool
    pub fn dump_line(&self) -> String {
        let stats = self.statistics();
        format!(
            "{}: Count={}, Reservation={}, Objects={}/{}, Slabs={}/{}",
            self.name,
            stats.total_slots,
            stats.reservation,
            stats.current_objects,
            stats.max_objects,
            stats.current_slabs,
            stats.max_slabs,
        )
    }

    /// Check the ordering/cursor/accounting invariants, for model-based
    /// tests. Takes the pool lock.
    pub fn _debug_check_invariants(&self) {
        let _guard = self.lock_if(false);
        // safety: the pool lock is held
        let core = unsafe { &*self.core.get() };
        assert_eq!(core.order.len(), core.slabs.len());
        for pair in core.order.windows(2) {
            assert!(
                core.slabs[&pair[0]].allocated.count() >= core.slabs[&pair[1]].allocated.count(),
                "slab list not in descending occupancy order"
            );
        }
        let first_nonfull = core
            .order
            .iter()
            .position(|b| !core.slabs[b].full())
            .unwrap_or(core.order.len());
        assert_eq!(core.cursor, first_nonfull, "cursor out of place");
        let slots: u32 = core.order.iter().map(|b| core.slabs[b].capacity).sum();
        assert_eq!(core.total_slots, slots);
    }

    fn note_get(&self, obj: NonNull<u8>) {
        let current = self.current_objects.fetch_add(1, Ordering::Relaxed) + 1;
        // high-water mark; CAS loop because fetch_max is not available on
        // every atomic shim
        let mut max = self.max_objects.load(Ordering::Relaxed);
        while current > max {
            match self.max_objects.compare_exchange_weak(
                max,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => max = x,
            }
        }
        tracing::event!(Level::TRACE, obj = obj.as_ptr() as usize, current);
    }
}

impl<L: LockOps> Drop for Pool<L> {
    fn drop(&mut self) {
        let span = tracing::span!(Level::DEBUG, "pool::destroy", pool = self.name.as_str());
        let _enter = span.enter();

        // flush every magazine back to the slabs under one lock acquisition
        self.lock.acquire();
        {
            // safety: lock held; &mut self means no shard handles exist
            let core = unsafe { &mut *self.core.get() };
            let slab_bytes = self.geom.slab_bytes;
            for magazine in self.magazines.iter_mut() {
                let magazine = magazine.get_mut();
                while let Some(obj) = magazine.pop() {
                    // magazine objects were already counted back in when
                    // the client put them, so no counter update here
                    core.put_back(obj, slab_bytes);
                }
            }
        }
        self.lock.release();

        self.spill(0);
        assert_eq!(
            self.current_objects.load(Ordering::Relaxed),
            0,
            "pool {} destroyed with outstanding objects",
            self.name
        );
    }
}

/// Exclusive handle on one logical processor's magazine
///
/// Dereferences to the pool for the cpu-independent operations.
pub struct PoolShard<'p, L: LockOps> {
    pool: &'p Pool<L>,
    cpu: usize,
}

impl<'p, L: LockOps> PoolShard<'p, L> {
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Get one object, magazine first, slab list second, new slab third
    ///
    /// `locked` tells the slow path the caller already holds the pool lock.
    /// `None` means the pool is at its cap or the system is out of memory;
    /// that is an expected condition, not a failure of the pool.
    pub fn get(&self, locked: bool) -> Option<NonNull<u8>> {
        let span = tracing::span!(
            Level::TRACE,
            "pool::get",
            pool = self.pool.name.as_str(),
            cpu = self.cpu as u64
        );
        let _enter = span.enter();

        if let Some(fist) = &self.pool.fist {
            if fist.should_fail() {
                return None;
            }
        }

        // safety: this shard is the sole holder for this cpu index
        let magazine = unsafe { &mut *self.pool.magazines[self.cpu].get() };
        let obj = magazine.pop().or_else(|| self.pool.slow_get(locked));
        if let Some(obj) = obj {
            self.pool.note_get(obj);
        }
        obj
    }

    /// Return one object, into the magazine if it has room
    pub fn put(&self, obj: NonNull<u8>, locked: bool) {
        let span = tracing::span!(
            Level::TRACE,
            "pool::put",
            pool = self.pool.name.as_str(),
            cpu = self.cpu as u64
        );
        let _enter = span.enter();

        // safety: this shard is the sole holder for this cpu index
        let magazine = unsafe { &mut *self.pool.magazines[self.cpu].get() };
        if !magazine.push(obj) {
            self.pool.slow_put(obj, locked);
        }
        // decremented whether the magazine took it or not
        self.pool.current_objects.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<'p, L: LockOps> Deref for PoolShard<'p, L> {
    type Target = Pool<L>;

    fn deref(&self) -> &Pool<L> {
        self.pool
    }
}

impl<'p, L: LockOps> Drop for PoolShard<'p, L> {
    fn drop(&mut self) {
        // order: release pairs with the acquire in shard(), publishing our
        // magazine writes to the next holder of this cpu index
        self.pool
            .cpu_inuse
            .fetch_and(!(1 << self.cpu), Ordering::Release);
    }
}
