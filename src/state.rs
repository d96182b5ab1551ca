//! The external [`Port`] interface (§6) and the `Kernel` singleton (§3).
use core::alloc::Layout;

use crate::{
    klock::{CpuLockCell, CriticalSection, LockState},
    list::{DelayQueue, PriorityList},
    task::Task,
};

/// A point in time, measured in kernel ticks since boot. Compared with
/// [`INFINITE`] for the "wait forever" case (§3, §6).
pub type Tick = u64;

/// "No timeout" / "wait forever" sentinel, bit-exact with the original's
/// `INFINITE` (an all-ones unsigned value).
pub const INFINITE: Tick = Tick::MAX;

/// The external collaborators this core delegates to (§6): architecture-
/// specific context switching, the tick timer's board support, and the
/// dynamic allocator. None of their internals are this crate's concern —
/// only the call shape is.
///
/// Mirrors the teacher's `PortThreading` trait, collapsed to one trait since
/// this core doesn't need `r3_kernel`'s separate `PortTimer`/`PortInterrupts`
/// splits (timers and interrupt priorities beyond the scheduler are out of
/// scope per §1).
pub trait Port: Sized + 'static {
    /// Number of distinct priority levels the ready queue supports. The
    /// idle task is created at level `NUM_PRIORITY_LEVELS - 1` (lowest).
    const NUM_PRIORITY_LEVELS: usize;

    /// Unconditionally enter a critical section (mask the interrupts that
    /// touch kernel state). Only called by [`crate::klock`] on the
    /// outermost [`CriticalSection::enter`].
    ///
    /// # Safety
    /// Must only be called by the kernel's own lock discipline.
    unsafe fn enter_critical();

    /// Leave a critical section previously entered with
    /// [`Port::enter_critical`].
    ///
    /// # Safety
    /// Must only be called by the kernel's own lock discipline, and only to
    /// match a prior `enter_critical`.
    unsafe fn leave_critical();

    /// Build the initial register-save frame at the top of the task's
    /// stack (`core_ctx_init`). Called by `init`/`start`/`startFrom`.
    fn init_ctx(task: &'static Task<Self>);

    /// Arm a context switch to be taken at the next critical-section exit
    /// (`core_ctx_switch`, the "locked switch" pattern of §4.1). Does not
    /// preempt synchronously.
    fn request_switch();

    /// Force an immediate context switch (`core_ctx_switchNow`), used by
    /// `yield`.
    fn switch_now();

    /// Jump to the current task's (possibly just-replaced) entry function
    /// on its stack, cropped to `stack_top` (`core_tsk_flip`). Never
    /// returns.
    ///
    /// # Safety
    /// `stack_top` must be the top of the calling task's own stack.
    unsafe fn flip(stack_top: *mut u8) -> !;

    /// `sys_alloc`: allocate storage for the given layout, or trap.
    ///
    /// # Safety
    /// Caller must free with [`Port::free`] using the same layout.
    unsafe fn alloc(layout: Layout) -> *mut u8;

    /// `sys_free`.
    ///
    /// # Safety
    /// `ptr`/`layout` must match a prior [`Port::alloc`] call, and `ptr`
    /// must not be used again afterward.
    unsafe fn free(ptr: *mut u8, layout: Layout);
}

/// The process-wide kernel singleton (§3 "System"). Unlike the teacher
/// (which reaches this through a generated `static` per kernel
/// instantiation), this core hands it to the caller as an ordinary value —
/// typically leaked to `'static` once at boot, or held on a hosted test
/// harness's stack — per the spec's own design note (§9) to model the
/// system as an explicitly-constructed singleton rather than a hidden
/// global.
pub struct Kernel<P: Port> {
    pub(crate) lock: LockState,
    pub(crate) cur: CpuLockCell<P, Option<&'static Task<P>>>,
    pub(crate) ready: CpuLockCell<P, PriorityList<P>>,
    pub(crate) dly: CpuLockCell<P, DelayQueue<P>>,
    pub(crate) wai: CpuLockCell<P, PriorityList<P>>,
    pub(crate) idle: &'static Task<P>,
    pub(crate) now: CpuLockCell<P, Tick>,
}

impl<P: Port> Kernel<P> {
    /// Construct the singleton around a caller-provided idle task. The idle
    /// task must be created at the lowest priority level
    /// (`NUM_PRIORITY_LEVELS - 1`) and is never exposed to callers as an
    /// ordinary schedulable task — the core owns it entirely (§4.2, idle
    /// task notes).
    pub fn new(idle: &'static Task<P>) -> Self {
        Self {
            lock: LockState::new(),
            cur: CpuLockCell::new(None),
            ready: CpuLockCell::new(PriorityList::new()),
            dly: CpuLockCell::new(DelayQueue::new()),
            wai: CpuLockCell::new(PriorityList::new()),
            idle,
            now: CpuLockCell::new(0),
        }
    }

    /// Acquire the critical section (`sys_lock`).
    #[inline]
    pub(crate) fn lock(&self) -> CriticalSection<P> {
        crate::klock::lock(&self.lock)
    }

    /// The current tick count, advanced by [`Kernel::tick`] on behalf of
    /// the board's tick timer (out of scope per §1; this is its interface).
    pub fn now(&self) -> Tick {
        let cs = self.lock();
        let t = self.now.read(&cs);
        cs.leave(&self.lock);
        t
    }

    /// Advance the tick count by one and wake any task whose delay has
    /// expired. Meant to be called from the board's tick interrupt handler.
    pub fn tick(&'static self) {
        let mut cs = self.lock();
        let now = self.now.read(&cs) + 1;
        self.now.replace(&mut cs, now);
        crate::task::process_timeouts(self, &mut cs, now);
        cs.leave(&self.lock);
    }

    /// The task currently occupying the CPU, if the scheduler has already
    /// chosen one (it is `None` before the first dispatch at boot).
    pub fn current(&self) -> Option<&'static Task<P>> {
        let cs = self.lock();
        let t = self.cur.read(&cs);
        cs.leave(&self.lock);
        t
    }
}
