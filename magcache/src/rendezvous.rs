//! All-processor rendezvous barrier
//!
//! Captures every logical processor in a spinning worker so that one
//! initiator can walk the machine through a strict phase sequence:
//! interrupts off everywhere, an "early" callback on every processor, then
//! interrupts back on, a "late" callback on every processor, and finally
//! release. This is the building block for suspend/resume-style state
//! transitions where shared hardware state must not be touched concurrently.
//!
//! The initiator commands participants through per-processor request slots
//! and counts acknowledgements in a shared completion counter. The
//! interrupts-off phase is the one that can deadlock: a processor may be
//! unable to check in because it is waiting on a cross-processor signal
//! that a processor which already checked in (and went uninterruptible)
//! can no longer deliver. So that phase is a bounded rendezvous run the
//! same way on every processor, initiator and participant alike: go
//! uninterruptible, check in, spin a limited number of times for the full
//! count, and on a shortfall withdraw the check-in (unless the count
//! filled at the last moment), become interruptible again so the pending
//! signal can land, and retry.
//!
//! Execution environment comes in through two capabilities: a [Dispatcher]
//! that starts the participant loop on each other processor, and
//! [InterruptOps] that masks and unmasks one processor's interrupts. The
//! in-process implementations ([ThreadDispatcher], [SimulatedInterruptOps])
//! make the whole protocol testable with plain threads.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::Level;

use crate::loom_testing::*;

/// Spins each processor grants one interrupts-off attempt before backing off
#[cfg(not(loom))]
const SPIN_LIMIT: u32 = 1000;
#[cfg(loom)]
const SPIN_LIMIT: u32 = 1;

/// Commands the initiator writes into a participant's request slot
///
/// The participant clears its slot back to `None` once the command is
/// done; for the interrupts-off phase that happens only after the bounded
/// rendezvous finally succeeds, so a posted `DisableInterrupts` survives
/// any number of withdrawn attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Request {
    None = 0,
    DisableInterrupts = 1,
    RunEarly = 2,
    EnableInterrupts = 3,
    RunLate = 4,
    Exit = 5,
}

impl Request {
    fn from_raw(raw: u32) -> Request {
        match raw {
            0 => Request::None,
            1 => Request::DisableInterrupts,
            2 => Request::RunEarly,
            3 => Request::EnableInterrupts,
            4 => Request::RunLate,
            5 => Request::Exit,
            _ => panic!("invalid rendezvous request {}", raw),
        }
    }
}

/// Per-processor callback run during the early or late phase
pub type Callback = Box<dyn Fn(u32) + Send + Sync>;

/// Starts the participant loop on other processors
pub trait Dispatcher: Send + Sync {
    /// Number of logical processors, initiator included
    fn cpu_count(&self) -> u32;
    /// Run `worker` on the given processor
    fn dispatch(&self, cpu: u32, worker: Box<dyn FnOnce() + Send + 'static>);
}

/// Masks and unmasks interrupts on one processor
///
/// Calls are always made from (or on behalf of) the named processor, never
/// concurrently for the same index.
pub trait InterruptOps: Send + Sync {
    fn disable(&self, cpu: u32);
    fn enable(&self, cpu: u32);
}

/// Shared state of one capture, fresh per [Rendezvous::capture]
struct CaptureState {
    cpu_count: u32,
    requests: Vec<AtomicU32>,
    completion: AtomicU32,
    early: Option<Callback>,
    late: Option<Callback>,
}

impl CaptureState {
    fn request_for(&self, cpu: u32) -> &AtomicU32 {
        &self.requests[cpu as usize]
    }
}

/// One bounded attempt at the interrupts-off rendezvous, run identically
/// on every processor
///
/// Go uninterruptible, check in, then spin a bounded number of times for
/// the full count. On a shortfall, withdraw the check-in and become
/// interruptible again so that whatever cross-processor signal is blocking
/// a straggler can land; the caller retries. The withdraw races against
/// the count filling at the last moment, which the compare-exchange loop
/// treats as success.
fn disable_rendezvous<I: InterruptOps>(
    state: &CaptureState,
    interrupts: &I,
    cpu: u32,
) -> Result<(), ()> {
    interrupts.disable(cpu);
    fence(Ordering::SeqCst);
    state.completion.fetch_add(1, Ordering::SeqCst);

    let mut attempts = 0;
    while attempts < SPIN_LIMIT {
        if state.completion.load(Ordering::SeqCst) == state.cpu_count {
            return Ok(());
        }
        spin_hint();
        attempts += 1;
    }

    let mut current = state.completion.load(Ordering::SeqCst);
    loop {
        if current == state.cpu_count {
            return Ok(());
        }
        match state.completion.compare_exchange(
            current,
            current - 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                interrupts.enable(cpu);
                return Err(());
            }
            Err(observed) => current = observed,
        }
    }
}

/// Spinning loop run on every processor except the initiator
///
/// Completed commands clear the slot back to `None` before the completion
/// counter is bumped, so a full count also means every slot is writable
/// for the next phase.
fn participant<I: InterruptOps>(state: &CaptureState, interrupts: &I, cpu: u32) {
    let span = tracing::span!(Level::TRACE, "rendezvous::participant", cpu = cpu as u64);
    let _enter = span.enter();

    // announce arrival; capture() waits for the full count before returning
    state.completion.fetch_add(1, Ordering::SeqCst);

    let slot = state.request_for(cpu);
    loop {
        match Request::from_raw(slot.load(Ordering::SeqCst)) {
            Request::None => spin_hint(),
            Request::DisableInterrupts => {
                // on a shortfall the request stays posted and the attempt
                // simply repeats
                if disable_rendezvous(state, interrupts, cpu).is_ok() {
                    slot.store(Request::None as u32, Ordering::SeqCst);
                }
            }
            Request::RunEarly => {
                if let Some(early) = &state.early {
                    early(cpu);
                }
                slot.store(Request::None as u32, Ordering::SeqCst);
                state.completion.fetch_add(1, Ordering::SeqCst);
            }
            Request::EnableInterrupts => {
                interrupts.enable(cpu);
                slot.store(Request::None as u32, Ordering::SeqCst);
                state.completion.fetch_add(1, Ordering::SeqCst);
            }
            Request::RunLate => {
                if let Some(late) = &state.late {
                    late(cpu);
                }
                slot.store(Request::None as u32, Ordering::SeqCst);
                state.completion.fetch_add(1, Ordering::SeqCst);
            }
            Request::Exit => {
                state.completion.fetch_add(1, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// The rendezvous instance; one capture may be active at a time
pub struct Rendezvous<D: Dispatcher, I: InterruptOps> {
    dispatcher: D,
    interrupts: Arc<I>,
    /// Initiating cpu of the active capture, -1 when idle
    owner: AtomicI64,
}

impl<D: Dispatcher, I: InterruptOps + 'static> Rendezvous<D, I> {
    pub fn new(dispatcher: D, interrupts: Arc<I>) -> Rendezvous<D, I> {
        Rendezvous {
            dispatcher,
            interrupts,
            owner: AtomicI64::new(-1),
        }
    }

    /// Which cpu holds the capture, if any
    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Ordering::SeqCst) {
            -1 => None,
            cpu => Some(cpu as u32),
        }
    }

    /// Capture every other processor into its participant loop
    ///
    /// Panics if a capture is already active; the protocol does not nest.
    /// The returned guard walks the phases and releases the processors when
    /// dropped, re-enabling interrupts first if the caller bailed out
    /// mid-sequence.
    pub fn capture(
        &self,
        cpu: u32,
        early: Option<Callback>,
        late: Option<Callback>,
    ) -> CaptureGuard<'_, D, I> {
        let span = tracing::span!(Level::DEBUG, "rendezvous::capture", cpu = cpu as u64);
        let _enter = span.enter();

        let previous = self.owner.swap(cpu as i64, Ordering::SeqCst);
        assert_eq!(
            previous, -1,
            "rendezvous already captured by cpu {}",
            previous
        );

        let cpu_count = self.dispatcher.cpu_count();
        assert!(cpu < cpu_count);
        let state = Arc::new(CaptureState {
            cpu_count,
            requests: (0..cpu_count)
                .map(|_| AtomicU32::new(Request::None as u32))
                .collect(),
            completion: AtomicU32::new(0),
            early,
            late,
        });

        for other in 0..cpu_count {
            if other == cpu {
                continue;
            }
            let state = state.clone();
            let interrupts = self.interrupts.clone();
            self.dispatcher
                .dispatch(other, Box::new(move || participant(&state, &*interrupts, other)));
        }

        // arrival barrier: every processor, initiator included, checks in
        // exactly once before the capture is considered complete
        state.completion.fetch_add(1, Ordering::SeqCst);
        while state.completion.load(Ordering::SeqCst) != cpu_count {
            spin_hint();
        }

        CaptureGuard {
            rendezvous: self,
            state,
            cpu,
            phase: Phase::Captured,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Captured,
    IntsDisabled,
    EarlyDone,
    IntsEnabled,
    LateDone,
}

/// Active capture; drives the phase sequence from the initiating cpu
pub struct CaptureGuard<'r, D: Dispatcher, I: InterruptOps> {
    rendezvous: &'r Rendezvous<D, I>,
    state: Arc<CaptureState>,
    cpu: u32,
    phase: Phase,
}

impl<'r, D: Dispatcher, I: InterruptOps> CaptureGuard<'r, D, I> {
    /// Broadcast `request`, do the initiator's own share, and wait for
    /// every processor to acknowledge
    fn run_phase(&self, request: Request) {
        let state = &*self.state;
        state.completion.store(0, Ordering::SeqCst);
        for other in 0..state.cpu_count {
            if other != self.cpu {
                state
                    .request_for(other)
                    .store(request as u32, Ordering::SeqCst);
            }
        }
        match request {
            Request::RunEarly => {
                if let Some(early) = &state.early {
                    early(self.cpu);
                }
            }
            Request::EnableInterrupts => self.rendezvous.interrupts.enable(self.cpu),
            Request::RunLate => {
                if let Some(late) = &state.late {
                    late(self.cpu);
                }
            }
            Request::Exit => {}
            Request::None | Request::DisableInterrupts => unreachable!(),
        }
        state.completion.fetch_add(1, Ordering::SeqCst);
        while state.completion.load(Ordering::SeqCst) != state.cpu_count {
            spin_hint();
        }
    }

    /// Turn interrupts off on every processor
    ///
    /// Every processor, this one included, runs the bounded rendezvous and
    /// backs off on a shortfall; this loop only re-runs the initiator's
    /// attempt, since participants retry on their own.
    pub fn disable_interrupts(&mut self) {
        assert_eq!(self.phase, Phase::Captured, "interrupts already disabled");
        let state = &*self.state;
        state.completion.store(0, Ordering::SeqCst);
        for other in 0..state.cpu_count {
            if other != self.cpu {
                state
                    .request_for(other)
                    .store(Request::DisableInterrupts as u32, Ordering::SeqCst);
            }
        }
        while disable_rendezvous(state, &*self.rendezvous.interrupts, self.cpu).is_err() {
            tracing::warn!(
                cpu = self.cpu as u64,
                acked = state.completion.load(Ordering::SeqCst),
                of = state.cpu_count,
                "interrupt disable incomplete, retrying"
            );
        }
        // a participant that saw the count fill may still be inside its
        // attempt; the cleared slot marks it quiescent, and only then may
        // a later phase reset the counter
        for other in 0..state.cpu_count {
            if other != self.cpu {
                while state.request_for(other).load(Ordering::SeqCst) != Request::None as u32 {
                    spin_hint();
                }
            }
        }
        self.phase = Phase::IntsDisabled;
    }

    /// Run the early callback on every processor, interrupts still off
    pub fn run_early(&mut self) {
        assert_eq!(
            self.phase,
            Phase::IntsDisabled,
            "early phase requires interrupts off"
        );
        self.run_phase(Request::RunEarly);
        self.phase = Phase::EarlyDone;
    }

    /// Turn interrupts back on everywhere
    pub fn enable_interrupts(&mut self) {
        assert!(
            self.phase == Phase::IntsDisabled || self.phase == Phase::EarlyDone,
            "interrupts are not off"
        );
        self.run_phase(Request::EnableInterrupts);
        self.phase = Phase::IntsEnabled;
    }

    /// Run the late callback on every processor, interrupts back on
    pub fn run_late(&mut self) {
        assert_eq!(
            self.phase,
            Phase::IntsEnabled,
            "late phase requires interrupts back on"
        );
        self.run_phase(Request::RunLate);
        self.phase = Phase::LateDone;
    }

    /// Let every processor go
    pub fn release(self) {
        // Drop does the work; this just names the intent at call sites
    }
}

impl<'r, D: Dispatcher, I: InterruptOps> Drop for CaptureGuard<'r, D, I> {
    fn drop(&mut self) {
        let span = tracing::span!(Level::DEBUG, "rendezvous::release", cpu = self.cpu as u64);
        let _enter = span.enter();

        // never leave the machine with interrupts off
        if self.phase == Phase::IntsDisabled || self.phase == Phase::EarlyDone {
            self.run_phase(Request::EnableInterrupts);
        }
        self.run_phase(Request::Exit);
        // every participant is past its last touch of the shared state once
        // the exit acknowledgements are all in
        self.state.completion.store(0, Ordering::SeqCst);
        self.rendezvous.owner.store(-1, Ordering::SeqCst);
    }
}

/// Dispatcher that models processors as named threads
#[cfg(not(loom))]
pub struct ThreadDispatcher {
    cpu_count: u32,
}

#[cfg(not(loom))]
impl ThreadDispatcher {
    pub fn new(cpu_count: u32) -> ThreadDispatcher {
        assert!(cpu_count >= 1);
        ThreadDispatcher { cpu_count }
    }
}

#[cfg(not(loom))]
impl Dispatcher for ThreadDispatcher {
    fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    fn dispatch(&self, cpu: u32, worker: Box<dyn FnOnce() + Send + 'static>) {
        std::thread::Builder::new()
            .name(format!("sync-cpu{}", cpu))
            .spawn(worker)
            .expect("spawning rendezvous participant");
    }
}

/// In-process interrupt state, one flag per processor
///
/// Asserts on double disable or double enable, so protocol bugs surface as
/// panics in the offending participant.
pub struct SimulatedInterruptOps {
    masked: Vec<AtomicU32>,
}

impl SimulatedInterruptOps {
    pub fn new(cpu_count: u32) -> SimulatedInterruptOps {
        SimulatedInterruptOps {
            masked: (0..cpu_count).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn disabled(&self, cpu: u32) -> bool {
        self.masked[cpu as usize].load(Ordering::SeqCst) != 0
    }

    pub fn all_enabled(&self) -> bool {
        self.masked
            .iter()
            .all(|m| m.load(Ordering::SeqCst) == 0)
    }
}

impl InterruptOps for SimulatedInterruptOps {
    fn disable(&self, cpu: u32) {
        let previous = self.masked[cpu as usize].swap(1, Ordering::SeqCst);
        assert_eq!(previous, 0, "interrupts already off on cpu {}", cpu);
    }

    fn enable(&self, cpu: u32) {
        let previous = self.masked[cpu as usize].swap(0, Ordering::SeqCst);
        assert_eq!(previous, 1, "interrupts already on on cpu {}", cpu);
    }
}

#[cfg(test)]
#[cfg(not(loom))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use std::sync::Mutex;
    use std::time::Duration;

    const CPUS: u32 = 4;

    fn rendezvous() -> (
        Rendezvous<ThreadDispatcher, SimulatedInterruptOps>,
        Arc<SimulatedInterruptOps>,
    ) {
        let interrupts = Arc::new(SimulatedInterruptOps::new(CPUS));
        (
            Rendezvous::new(ThreadDispatcher::new(CPUS), interrupts.clone()),
            interrupts,
        )
    }

    #[test]
    fn full_cycle_without_callbacks() {
        let (rendezvous, interrupts) = rendezvous();

        let mut guard = rendezvous.capture(0, None, None);
        guard.disable_interrupts();
        assert!((0..CPUS).all(|cpu| interrupts.disabled(cpu)));

        guard.run_early();
        guard.enable_interrupts();
        assert!(interrupts.all_enabled());
        guard.run_late();
        guard.release();

        assert_eq!(rendezvous.owner(), None);
    }

    #[test]
    fn callbacks_run_once_per_cpu() {
        let (rendezvous, _interrupts) = rendezvous();

        let early_cpus = Arc::new(Mutex::new(Vec::new()));
        let late_hits = Arc::new(StdAtomicU32::new(0));
        let early_log = early_cpus.clone();
        let late_count = late_hits.clone();

        let mut guard = rendezvous.capture(
            2,
            Some(Box::new(move |cpu| {
                early_log.lock().unwrap().push(cpu);
            })),
            Some(Box::new(move |_cpu| {
                late_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
        );
        guard.disable_interrupts();
        guard.run_early();
        guard.enable_interrupts();
        guard.run_late();
        guard.release();

        let mut seen = early_cpus.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..CPUS).collect::<Vec<_>>());
        assert_eq!(late_hits.load(std::sync::atomic::Ordering::SeqCst), CPUS);
    }

    #[test]
    fn owner_tracks_active_capture() {
        let (rendezvous, _interrupts) = rendezvous();
        assert_eq!(rendezvous.owner(), None);
        let guard = rendezvous.capture(3, None, None);
        assert_eq!(rendezvous.owner(), Some(3));
        guard.release();
        assert_eq!(rendezvous.owner(), None);

        // released means capturable again, from any cpu
        let guard = rendezvous.capture(1, None, None);
        guard.release();
    }

    #[test]
    fn drop_mid_sequence_restores_interrupts() {
        let (rendezvous, interrupts) = rendezvous();
        {
            let mut guard = rendezvous.capture(0, None, None);
            guard.disable_interrupts();
            assert!((0..CPUS).all(|cpu| interrupts.disabled(cpu)));
            // guard dropped without enable_interrupts or release
        }
        assert!(interrupts.all_enabled());
        assert_eq!(rendezvous.owner(), None);
    }

    #[test]
    #[should_panic(expected = "already captured")]
    fn nested_capture_panics() {
        let (rendezvous, _interrupts) = rendezvous();
        let _guard = rendezvous.capture(0, None, None);
        let _second = rendezvous.capture(1, None, None);
    }

    #[test]
    #[should_panic(expected = "requires interrupts off")]
    fn early_phase_requires_disable_first() {
        let (rendezvous, _interrupts) = rendezvous();
        let mut guard = rendezvous.capture(0, None, None);
        guard.run_early();
    }

    /// Interrupt masking where each participant's first trip into the
    /// uninterruptible state takes a long time, so the initiator exhausts
    /// its spin budget and has to back off before the count can fill.
    struct LaggyInterruptOps {
        inner: SimulatedInterruptOps,
        initiator: u32,
        delay: Duration,
        delayed: Vec<StdAtomicU32>,
    }

    impl InterruptOps for LaggyInterruptOps {
        fn disable(&self, cpu: u32) {
            if cpu != self.initiator
                && self.delayed[cpu as usize].swap(1, std::sync::atomic::Ordering::SeqCst) == 0
            {
                std::thread::sleep(self.delay);
            }
            self.inner.disable(cpu);
        }

        fn enable(&self, cpu: u32) {
            self.inner.enable(cpu);
        }
    }

    #[test]
    fn disable_retries_until_everyone_complies() {
        let interrupts = Arc::new(LaggyInterruptOps {
            inner: SimulatedInterruptOps::new(CPUS),
            initiator: 0,
            delay: Duration::from_millis(50),
            delayed: (0..CPUS).map(|_| StdAtomicU32::new(0)).collect(),
        });
        let rendezvous = Rendezvous::new(ThreadDispatcher::new(CPUS), interrupts.clone());

        let mut guard = rendezvous.capture(0, None, None);
        // first acknowledgements land far beyond the spin budget, so this
        // only returns by way of at least one withdrawn attempt
        guard.disable_interrupts();
        assert!((0..CPUS).all(|cpu| interrupts.inner.disabled(cpu)));
        guard.enable_interrupts();
        guard.release();
        assert!(interrupts.inner.all_enabled());
    }

    /// Interrupt masking that models a pending cross-processor signal:
    /// cpu 2 cannot finish going uninterruptible until cpu 1 has become
    /// interruptible again and the signal has landed.
    struct PendingSignalOps {
        inner: SimulatedInterruptOps,
        landed: StdAtomicU32,
    }

    impl InterruptOps for PendingSignalOps {
        fn disable(&self, cpu: u32) {
            if cpu == 2 {
                while self.landed.load(std::sync::atomic::Ordering::SeqCst) == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            self.inner.disable(cpu);
        }

        fn enable(&self, cpu: u32) {
            if cpu == 1 {
                self.landed.store(1, std::sync::atomic::Ordering::SeqCst);
            }
            self.inner.enable(cpu);
        }
    }

    #[test]
    fn withdrawn_attempt_lets_pending_signal_land() {
        const SIGNAL_CPUS: u32 = 3;
        let interrupts = Arc::new(PendingSignalOps {
            inner: SimulatedInterruptOps::new(SIGNAL_CPUS),
            landed: StdAtomicU32::new(0),
        });
        let rendezvous = Rendezvous::new(ThreadDispatcher::new(SIGNAL_CPUS), interrupts.clone());

        let mut guard = rendezvous.capture(0, None, None);
        // cpu 2 can only check in after cpu 1 withdraws an attempt and
        // re-enables its interrupts; a participant that goes
        // uninterruptible once and stays there would hang here forever
        guard.disable_interrupts();
        assert_eq!(
            interrupts.landed.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert!((0..SIGNAL_CPUS).all(|cpu| interrupts.inner.disabled(cpu)));
        guard.enable_interrupts();
        guard.release();
        assert!(interrupts.inner.all_enabled());
    }
}

#[cfg(loom)]
mod loom_tests {
    use super::*;

    /// The withdraw-unless-full protocol every processor runs on the
    /// completion counter: either the phase completes at the full count,
    /// or a backing-off processor takes out its own contribution alone.
    #[test]
    fn completion_withdrawal_is_exact() {
        loom::model(|| {
            let completion = loom::sync::Arc::new(AtomicU32::new(0));
            let count = 2u32;

            let participant = completion.clone();
            let worker = loom::thread::spawn(move || {
                participant.fetch_add(1, Ordering::SeqCst);
            });

            completion.fetch_add(1, Ordering::SeqCst);
            let mut attempts = SPIN_LIMIT;
            let mut full = false;
            while attempts > 0 {
                if completion.load(Ordering::SeqCst) == count {
                    full = true;
                    break;
                }
                spin_hint();
                attempts -= 1;
            }
            if !full {
                let mut current = completion.load(Ordering::SeqCst);
                loop {
                    if current == count {
                        full = true;
                        break;
                    }
                    match completion.compare_exchange(
                        current,
                        current - 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => break,
                        Err(observed) => current = observed,
                    }
                }
            }

            worker.join().unwrap();
            let settled = completion.load(Ordering::SeqCst);
            if full {
                assert_eq!(settled, count);
            } else {
                // participant's acknowledgement stands, ours was withdrawn
                assert_eq!(settled, 1);
            }
        });
    }
}
