//! Pool registry and background sizing monitor
//!
//! Pools register here so that a single monitor thread can periodically
//! nudge each one toward its reservation: under-reserved pools are filled
//! back up, over-reserved pools shed up to half their excess slots per
//! pass. The registry also produces the one-line-per-pool diagnostic dump.
//!
//! Dropping the registry with pools still registered is a caller bug and
//! panics; deregister (or [Registry::destroy_pool]) everything first.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::Level;

use crate::lockops::LockOps;
use crate::pool::{Ctor, Dtor, Pool, PoolConfig};
use crate::PoolError;

/// How often the monitor wakes when nothing alerts it
pub const MONITOR_PERIOD: Duration = Duration::from_secs(5);

/// The slice of a pool the monitor works against, erasing the lock type
pub trait MonitoredPool: Send + Sync {
    fn name(&self) -> &str;
    fn reservation(&self) -> u32;
    fn total_slots(&self) -> u32;
    fn fill(&self, count: u32) -> Result<(), PoolError>;
    fn spill(&self, count: u32);
    fn dump_line(&self) -> String;
}

impl<L: LockOps> MonitoredPool for Pool<L> {
    fn name(&self) -> &str {
        Pool::name(self)
    }

    fn reservation(&self) -> u32 {
        Pool::reservation(self)
    }

    fn total_slots(&self) -> u32 {
        self.statistics().total_slots
    }

    fn fill(&self, count: u32) -> Result<(), PoolError> {
        Pool::fill(self, count)
    }

    fn spill(&self, count: u32) {
        Pool::spill(self, count)
    }

    fn dump_line(&self) -> String {
        Pool::dump_line(self)
    }
}

struct State {
    pools: Vec<Arc<dyn MonitoredPool>>,
    shutdown: bool,
    /// A kick posted while the monitor was between waits; checked under
    /// the lock so the wakeup cannot be lost
    kicked: bool,
}

struct Shared {
    state: Mutex<State>,
    alert: Condvar,
}

/// Owner of the monitor thread and the set of registered pools
pub struct Registry {
    shared: Arc<Shared>,
    monitor: Option<JoinHandle<()>>,
}

fn pool_addr(pool: &Arc<dyn MonitoredPool>) -> *const u8 {
    Arc::as_ptr(pool) as *const u8
}

impl Registry {
    pub fn new() -> Result<Registry, PoolError> {
        Self::with_period(MONITOR_PERIOD)
    }

    /// Monitor with a non-default period, for tests that cannot wait 5s
    ///
    /// A registry without its monitor would silently stop servicing
    /// reservations, so failure to start the thread fails the whole
    /// constructor.
    pub fn with_period(period: Duration) -> Result<Registry, PoolError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                pools: Vec::new(),
                shutdown: false,
                kicked: false,
            }),
            alert: Condvar::new(),
        });
        let monitor_shared = shared.clone();
        let monitor = std::thread::Builder::new()
            .name("pool-monitor".to_owned())
            .spawn(move || monitor_loop(monitor_shared, period))
            .map_err(|err| {
                tracing::warn!(err = %err, "monitor thread failed to start");
                PoolError::NoMemory
            })?;
        Ok(Registry {
            shared,
            monitor: Some(monitor),
        })
    }

    pub fn register(&self, pool: Arc<dyn MonitoredPool>) {
        tracing::debug!(pool = pool.name(), "registering pool");
        let mut state = self.shared.state.lock().unwrap();
        assert!(
            !state.pools.iter().any(|p| pool_addr(p) == pool_addr(&pool)),
            "pool {} registered twice",
            pool.name()
        );
        state.pools.push(pool);
    }

    pub fn deregister(&self, pool: &Arc<dyn MonitoredPool>) {
        tracing::debug!(pool = pool.name(), "deregistering pool");
        let mut state = self.shared.state.lock().unwrap();
        let pos = state
            .pools
            .iter()
            .position(|p| pool_addr(p) == pool_addr(pool))
            .expect("deregister of a pool that was never registered");
        state.pools.swap_remove(pos);
    }

    /// Create a pool and register it in one step
    pub fn create_pool<L: LockOps + 'static>(
        &self,
        config: PoolConfig,
        ctor: Ctor,
        dtor: Dtor,
        lock: L,
    ) -> Result<Arc<Pool<L>>, PoolError> {
        let pool = Arc::new(Pool::create(config, ctor, dtor, lock)?);
        self.register(pool.clone());
        Ok(pool)
    }

    /// Compatibility flavor predating the cap parameter: always unbounded
    pub fn create_pool_uncapped<L: LockOps + 'static>(
        &self,
        mut config: PoolConfig,
        ctor: Ctor,
        dtor: Dtor,
        lock: L,
    ) -> Result<Arc<Pool<L>>, PoolError> {
        config.cap = 0;
        self.create_pool(config, ctor, dtor, lock)
    }

    /// Deregister and release one reference
    ///
    /// Pool teardown runs when the last reference goes, so a caller still
    /// holding clones keeps the pool alive (and accountable for its
    /// outstanding objects) past this call.
    pub fn destroy_pool<L: LockOps + 'static>(&self, pool: Arc<Pool<L>>) {
        let erased: Arc<dyn MonitoredPool> = pool;
        self.deregister(&erased);
    }

    /// One diagnostic line per registered pool
    pub fn dump(&self) -> Vec<String> {
        // snapshot; dump_line takes each pool's own lock
        let pools = self.shared.state.lock().unwrap().pools.clone();
        let mut lines = Vec::with_capacity(pools.len());
        for pool in &pools {
            let line = pool.dump_line();
            tracing::info!("{}", line);
            lines.push(line);
        }
        lines
    }

    /// Wake the monitor now instead of waiting out its period
    pub fn kick(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.kicked = true;
        drop(state);
        self.shared.alert.notify_all();
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let outstanding = {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            state.pools.len()
        };
        self.shared.alert.notify_all();
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
        // asserted only after the guard is released and the monitor has
        // exited, so the panic cannot poison the mutex under it
        assert_eq!(
            outstanding, 0,
            "registry dropped with {} pools still registered",
            outstanding
        );
    }
}

fn monitor_loop(shared: Arc<Shared>, period: Duration) {
    let span = tracing::span!(Level::DEBUG, "pool::monitor");
    let _enter = span.enter();

    let mut state = shared.state.lock().unwrap();
    loop {
        // the predicate runs before first blocking, so a shutdown or kick
        // posted while the lock was free is seen instead of slept through
        let (next, _timeout) = shared
            .alert
            .wait_timeout_while(state, period, |s| !s.shutdown && !s.kicked)
            .unwrap();
        state = next;
        if state.shutdown {
            break;
        }
        state.kicked = false;
        // the registry lock stays held across the pass; pool locks nest
        // inside it and nothing that holds a pool lock takes this one
        for pool in &state.pools {
            let slots = pool.total_slots();
            let reservation = pool.reservation();
            if slots < reservation {
                if let Err(err) = pool.fill(reservation) {
                    tracing::warn!(pool = pool.name(), err = %err, "monitor fill failed");
                }
            } else if slots > reservation {
                // shed at most half the excess per pass, and never dip
                // below the reservation
                pool.spill(reservation.max(slots / 2));
            }
        }
    }
}

#[cfg(test)]
#[cfg(not(loom))]
mod tests {
    use super::*;
    use crate::lockops::BlockingLockOps;
    use crate::pool::FaultInjection;

    fn nop_hooks() -> (Ctor, Dtor) {
        (Box::new(|_| Ok(())), Box::new(|_| ()))
    }

    // 1000-byte objects give 4 slots per slab
    fn config(name: &str, reservation: u32) -> PoolConfig {
        let mut config = PoolConfig::new(name, 1000);
        config.reservation = reservation;
        config
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("monitor did not converge");
    }

    #[test]
    fn monitor_refills_to_reservation() {
        let registry = Registry::with_period(Duration::from_millis(20)).unwrap();
        let (ctor, dtor) = nop_hooks();
        let pool = registry
            .create_pool(config("refill", 8), ctor, dtor, BlockingLockOps::new())
            .unwrap();

        pool.spill(0);
        assert_eq!(pool.statistics().total_slots, 0);

        wait_for(|| pool.statistics().total_slots >= 8);
        registry.destroy_pool(pool);
    }

    #[test]
    fn monitor_sheds_excess_gradually() {
        let registry = Registry::with_period(Duration::from_millis(20)).unwrap();
        let (ctor, dtor) = nop_hooks();
        let pool = registry
            .create_pool(config("shed", 4), ctor, dtor, BlockingLockOps::new())
            .unwrap();

        pool.fill(32).unwrap();
        assert_eq!(pool.statistics().total_slots, 32);

        // halves per pass: 32 -> 16 -> 8 -> 4, never below the reservation
        wait_for(|| pool.statistics().total_slots == 4);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.statistics().total_slots, 4);

        registry.destroy_pool(pool);
    }

    #[test]
    fn dump_covers_registered_pools() {
        let registry = Registry::with_period(Duration::from_secs(3600)).unwrap();
        let (ctor, dtor) = nop_hooks();
        let a = registry
            .create_pool(config("dump-a", 4), ctor, dtor, BlockingLockOps::new())
            .unwrap();
        let (ctor, dtor) = nop_hooks();
        let b = registry
            .create_pool(config("dump-b", 0), ctor, dtor, BlockingLockOps::new())
            .unwrap();

        let lines = registry.dump();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().any(|l| l == "dump-a: Count=4, Reservation=4, Objects=0/0, Slabs=1/1"));
        assert!(lines.iter().any(|l| l == "dump-b: Count=0, Reservation=0, Objects=0/0, Slabs=0/0"));

        registry.destroy_pool(a);
        registry.destroy_pool(b);
        assert!(registry.dump().is_empty());
    }

    #[test]
    fn drop_does_not_wait_out_the_period() {
        let registry = Registry::with_period(Duration::from_secs(3600)).unwrap();
        let start = std::time::Instant::now();
        drop(registry);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn kick_runs_a_pass_without_waiting() {
        let registry = Registry::with_period(Duration::from_secs(3600)).unwrap();
        let (ctor, dtor) = nop_hooks();
        let pool = registry
            .create_pool(config("kicked", 8), ctor, dtor, BlockingLockOps::new())
            .unwrap();
        pool.spill(0);
        assert_eq!(pool.statistics().total_slots, 0);

        // far from any periodic wakeup; only the kick can refill this
        registry.kick();
        wait_for(|| pool.statistics().total_slots >= 8);
        registry.destroy_pool(pool);
    }

    #[test]
    fn monitor_services_pools_alongside_fault_injection() {
        let registry = Registry::with_period(Duration::from_millis(20)).unwrap();

        let (ctor, dtor) = nop_hooks();
        let mut bad = config("bad", 0);
        bad.fault_injection = Some(FaultInjection {
            defer: 0,
            probability: 100,
        });
        let bad_pool = registry
            .create_pool(bad, ctor, dtor, BlockingLockOps::new())
            .unwrap();

        let (ctor, dtor) = nop_hooks();
        let good_pool = registry
            .create_pool(config("good", 8), ctor, dtor, BlockingLockOps::new())
            .unwrap();
        good_pool.spill(0);
        wait_for(|| good_pool.statistics().total_slots >= 8);

        // fault injection fails the get before any state changes
        let shard = bad_pool.shard(0);
        assert!(shard.get(false).is_none());
        assert_eq!(shard.statistics().current_objects, 0);
        drop(shard);

        registry.destroy_pool(bad_pool);
        registry.destroy_pool(good_pool);
    }

    #[test]
    #[should_panic(expected = "still registered")]
    fn drop_with_registered_pool_panics() {
        let registry = Registry::with_period(Duration::from_secs(3600)).unwrap();
        let (ctor, dtor) = nop_hooks();
        let _pool = registry
            .create_pool(config("lingering", 0), ctor, dtor, BlockingLockOps::new())
            .unwrap();
        drop(registry);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn double_register_panics() {
        // leaked so its drop does not raise a second panic over the
        // still-registered pool while this one unwinds
        let registry = std::mem::ManuallyDrop::new(
            Registry::with_period(Duration::from_secs(3600)).unwrap(),
        );
        let (ctor, dtor) = nop_hooks();
        let pool = registry
            .create_pool(config("twice", 0), ctor, dtor, BlockingLockOps::new())
            .unwrap();
        registry.register(pool);
    }
}
