//! Task lifecycle (§4.2, §4.4): creation, start/stop/kill/delete, join/
//! detach, yield/flip, priority changes, the flag-event rendezvous, and
//! sleep/suspend/resume.
use core::alloc::Layout;

use crate::{
    error::Event,
    klock::{CpuLockCell, CriticalSection},
    list::PriorityList,
    state::{Kernel, Port, Tick, INFINITE},
};

/// `id` in §3/§4.4: `STOPPED`/`READY`/`BLOCKED`. `BLOCKED` covers both a
/// wait-queue block (`guard` set to `Wait`) and a delay-queue park for
/// sleep/suspend (`guard` set to `Delay`) — the invariants in §8
/// distinguish the two by `guard`, not by a fourth state, so this enum
/// stays exactly the source's three values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Ready,
    Blocked,
}

/// The function a task runs. Replaced wholesale by `startFrom`/`flip`.
pub type EntryFn<P> = fn(&'static Task<P>);

/// `obj.res` (§3, §9): a task's storage is either part of a larger
/// structure the caller owns (`Static`), a block this kernel allocated and
/// must free on death (`Owned`), or already freed (`Released`, guarding
/// use-after-free — every access becomes an exhaustive match instead of a
/// raw-pointer sentinel check).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ownership {
    Static,
    Owned,
    Released,
}

/// `join` (§3): either a wait slot a single joiner can block on, or the
/// `DETACHED` sentinel.
pub(crate) enum Join<P: Port> {
    Joinable(PriorityList<P>),
    Detached,
}

/// `guard` (§3, §8 invariant 1): which of the wait/delay regime a blocked
/// task is parked under, and (for a true wait queue) a pointer back to it
/// so `kill` and timeout processing can unlink the task without a linear
/// search. `Delay` covers both sleep and suspend — both live on
/// [`Kernel::dly`] and differ only in deadline (`INFINITE` for suspend).
pub(crate) enum Guard<P: Port> {
    None,
    Delay,
    Wait(*mut PriorityList<P>),
}

/// `tmp` (§3, §9): the scratch union a blocking primitive uses to stash
/// its own wait parameters on the task record. Only the flag-event
/// rendezvous needs one today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitTag {
    None,
    Flags(u32),
}

pub(crate) struct TaskInner<P: Port> {
    pub state: TaskState,
    pub prio: u8,
    pub basic: u8,
    pub entry: EntryFn<P>,
    pub join: Join<P>,
    /// Intrusive list of mutexes this task owns, threaded through each
    /// `Mutex`'s own link field (`mtx.list`, §3).
    pub owned_mutexes: Option<&'static crate::mutex::Mutex<P>>,
    /// The mutex this task is blocked trying to lock (`mtx.tree`, §3), if
    /// any.
    pub blocking_mutex: Option<&'static crate::mutex::Mutex<P>>,
    pub guard: Guard<P>,
    pub wake_at: Tick,
    /// The last computed wake time, used by `sleepNext` for drift-free
    /// periodic sleep.
    pub last_wake: Tick,
    /// Scratch payload for the primitive currently blocking this task
    /// (pending/consumed flag bits for the flag-event rendezvous). Distinct
    /// from `wake_reason`, which is how the wakeup delivers its event code —
    /// conflating the two would let a generic wakeup clobber a primitive's
    /// own payload.
    pub tag: WaitTag,
    /// The event code the next wakeup should deliver to this task
    /// (`SUCCESS`/`STOPPED`/`TIMEOUT`/...), read back by whichever
    /// operation blocked it.
    pub wake_reason: Event,
    /// Reused link field (see `list.rs`): the next task in whichever list
    /// currently owns this one (ready list, a wait queue, the delay queue,
    /// or the idle task's corpse chain).
    pub next: Option<&'static Task<P>>,
    pub res: Ownership,
}

/// A task control block (§3 `Task`). Always referred to by `&'static`
/// reference once created, whether it lives in caller-owned static storage
/// or in a kernel-allocated block.
pub struct Task<P: Port> {
    pub(crate) inner: CpuLockCell<P, TaskInner<P>>,
    stack: *mut u8,
    stack_layout: Layout,
}

// Safety: all mutable access goes through `inner`, which is itself `Sync`
// under the critical-section discipline; `stack`/`stack_layout` are fixed
// at construction.
unsafe impl<P: Port> Sync for Task<P> {}

// Tasks are always referred to by `&'static` reference once created (§3);
// identity, not structural equality, is the only sensible comparison.
impl<P: Port> PartialEq for Task<P> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}
impl<P: Port> Eq for Task<P> {}

impl<P: Port> Task<P> {
    /// Build a task record over caller-owned storage (`tsk_init`'s public
    /// entry point, kept distinct from the heap path per `DESIGN.md`).
    /// `stack`/`stack_size` describe memory the caller guarantees outlives
    /// the task.
    pub fn new_static(prio: u8, entry: EntryFn<P>, stack: *mut u8, stack_size: usize) -> Self {
        Self {
            inner: CpuLockCell::new(TaskInner {
                state: TaskState::Ready,
                prio,
                basic: prio,
                entry,
                join: Join::Joinable(PriorityList::new()),
                owned_mutexes: None,
                blocking_mutex: None,
                guard: Guard::None,
                wake_at: INFINITE,
                last_wake: 0,
                tag: WaitTag::None,
                wake_reason: Event::Success,
                next: None,
                res: Ownership::Static,
            }),
            stack,
            stack_layout: Layout::from_size_align(stack_size, core::mem::align_of::<usize>())
                .expect("invalid stack layout"),
        }
    }

    fn stack_top(&self) -> *mut u8 {
        // Safety: `stack`/`stack_layout` describe a single owned region;
        // offsetting to its end for a descending-stack `flip` is in-bounds.
        unsafe { self.stack.add(self.stack_layout.size()) }
    }

    pub(crate) fn effective_prio(&self, cs: &CriticalSection<P>) -> u8 {
        self.inner.get(cs).prio
    }

    pub(crate) fn next(&self, cs: &CriticalSection<P>) -> Option<&'static Task<P>> {
        self.inner.get(cs).next
    }

    pub(crate) fn set_next(&self, cs: &CriticalSection<P>, v: Option<&'static Task<P>>) {
        self.inner.get_mut(cs).next = v;
    }

    pub(crate) fn wake_at(&self, cs: &CriticalSection<P>) -> Tick {
        self.inner.get(cs).wake_at
    }

    pub(crate) fn set_wake_at(&self, cs: &CriticalSection<P>, v: Tick) {
        self.inner.get_mut(cs).wake_at = v;
    }

    pub fn state(&self, k: &Kernel<P>) -> TaskState {
        let cs = k.lock();
        let s = self.inner.get(&cs).state;
        cs.leave(&k.lock);
        s
    }

    pub fn priority(&self, k: &Kernel<P>) -> u8 {
        let cs = k.lock();
        let p = self.inner.get(&cs).basic;
        cs.leave(&k.lock);
        p
    }
}

/// Build and insert a fresh task onto the ready list (`tsk_init`, §4.2
/// "Creation"). Shared by the static-storage and heap-allocated paths.
fn init_on_ready<P: Port>(cs: &CriticalSection<P>, k: &'static Kernel<P>, task: &'static Task<P>) {
    P::init_ctx(task);
    k.ready.get_mut(cs).insert(cs, task);
}

impl<P: Port> Kernel<P> {
    /// `tsk_init`'s static-storage entry point: insert an already-built
    /// [`Task::new_static`] record onto the ready list.
    pub fn init_in_place(&'static self, task: &'static Task<P>) {
        let cs = self.lock();
        init_on_ready(&cs, self, task);
        cs.leave(&self.lock);
    }

    /// `create`/`wrk_create` (§4.2): allocate one block for the task
    /// record plus its stack, `init` it, and mark it kernel-owned.
    pub fn spawn(&'static self, prio: u8, entry: EntryFn<P>, stack_size: usize) -> &'static Task<P> {
        self.spawn_inner(prio, entry, stack_size, false)
    }

    /// `createDetached`/`wrk_detached` (§4.2): like [`Kernel::spawn`] but
    /// the task starts `DETACHED` and is never joinable.
    pub fn spawn_detached(&'static self, prio: u8, entry: EntryFn<P>, stack_size: usize) -> &'static Task<P> {
        self.spawn_inner(prio, entry, stack_size, true)
    }

    fn spawn_inner(&'static self, prio: u8, entry: EntryFn<P>, stack_size: usize, detached: bool) -> &'static Task<P> {
        let task_layout = Layout::new::<Task<P>>();
        let stack_layout =
            Layout::from_size_align(stack_size, core::mem::align_of::<usize>()).expect("invalid stack layout");
        let (combined, stack_offset) = task_layout
            .extend(stack_layout)
            .expect("task + stack layout overflow");

        // Safety: `combined` is non-zero-sized and the allocation is freed
        // with the same layout in `reclaim` below.
        let base = unsafe { P::alloc(combined) };
        assert!(!base.is_null(), "allocator exhausted");
        // Safety: `base` points to `combined.size()` freshly allocated
        // bytes; the stack region starts at `stack_offset` within it.
        let stack = unsafe { base.add(stack_offset) };

        let task_ptr = base as *mut Task<P>;
        // Safety: `task_ptr` is valid, aligned storage for a `Task<P>` for
        // the remainder of the program (the allocation is never moved).
        unsafe {
            task_ptr.write(Task::new_static(prio, entry, stack, stack_size));
        }
        let task: &'static Task<P> = unsafe { &*task_ptr };

        let cs = self.lock();
        {
            let inner = task.inner.get_mut(&cs);
            inner.res = Ownership::Owned;
            if detached {
                inner.join = Join::Detached;
            }
        }
        init_on_ready(&cs, self, task);
        cs.leave(&self.lock);
        task
    }

    /// Free a kernel-owned task's backing storage (the combined
    /// record-plus-stack allocation from [`Kernel::spawn_inner`]).
    /// Precondition: the task is `STOPPED` and not referenced by anyone
    /// anymore (join already resolved).
    fn reclaim(&self, task: &'static Task<P>) {
        let cs = self.lock();
        let res = core::mem::replace(&mut task.inner.get_mut(&cs).res, Ownership::Released);
        let stack_size = task.stack_layout.size();
        cs.leave(&self.lock);
        if !matches!(res, Ownership::Owned) {
            return;
        }
        let task_layout = Layout::new::<Task<P>>();
        let stack_layout =
            Layout::from_size_align(stack_size, core::mem::align_of::<usize>()).expect("invalid stack layout");
        let (combined, _) = task_layout
            .extend(stack_layout)
            .expect("task + stack layout overflow");
        // Safety: `task` was allocated by `spawn_inner` with this exact
        // layout and is never touched again after this call.
        unsafe { P::free(task as *const Task<P> as *mut u8, combined) };
    }

    /// Drain and free every corpse chained by self-terminated detached
    /// tasks (§4.2 "Stop", §9 "Self-destroying task"). Meant to be called
    /// from the idle task's own entry loop, at idle priority, where no
    /// corpse's stack can possibly still be in use.
    pub fn reap(&'static self) {
        let cs = self.lock();
        let mut corpse = self.idle.inner.get_mut(&cs).next.take();
        cs.leave(&self.lock);
        while let Some(task) = corpse {
            let cs = self.lock();
            corpse = task.inner.get_mut(&cs).next.take();
            cs.leave(&self.lock);
            self.reclaim(task);
        }
    }

    /// `start`/`startFrom` (§4.2): idempotent for a running task; for a
    /// `STOPPED`, non-detached task, reinitializes its context (optionally
    /// with a new entry function) and re-inserts it on the ready list.
    pub fn start(&'static self, task: &'static Task<P>, entry: Option<EntryFn<P>>) {
        let cs = self.lock();
        debug_assert!(
            !matches!(task.inner.get(&cs).res, Ownership::Released),
            "start on a released task"
        );
        {
            let inner = task.inner.get_mut(&cs);
            if inner.state != TaskState::Stopped || matches!(inner.join, Join::Detached) {
                // Already running (idempotent, §4.2), or a detached task
                // whose storage was already reclaimed by its terminator.
                cs.leave(&self.lock);
                return;
            }
            if let Some(e) = entry {
                inner.entry = e;
            }
            inner.state = TaskState::Ready;
        }
        init_on_ready(&cs, self, task);
        cs.leave(&self.lock);
    }

    /// Self-termination (`stop`, §4.2). Must be called by the task itself.
    /// Never returns.
    pub fn stop(&'static self, task: &'static Task<P>) -> ! {
        let cs = self.lock();
        debug_assert!(
            task.inner.get(&cs).owned_mutexes.is_none(),
            "task stopped while still owning mutexes"
        );

        let detached = {
            let inner = task.inner.get_mut(&cs);
            inner.state = TaskState::Stopped;
            matches!(inner.join, Join::Detached)
        };

        if !detached {
            wake_joiners(&cs, self, task, Event::Success);
        } else {
            // Chain onto the idle task's corpse list (§4.2 "Stop", §9
            // "Self-destroying task"). `Kernel::reap` drains this chain;
            // the idle entry loop is expected to call it once per pass
            // instead of this crate swapping idle's entry function
            // pointer, since replacing a function pointer mid-flight would
            // need a Port hook this core has no other use for.
            let prev = self.idle.inner.get_mut(&cs).next.take();
            task.inner.get_mut(&cs).next = prev;
            self.idle.inner.get_mut(&cs).next = Some(task);
        }

        P::request_switch();
        cs.leave(&self.lock);
        P::switch_now();
        unreachable!("stop: task resumed after termination");
    }

    /// `kill` (§4.2): force-terminate an active, non-detached task from
    /// another task's context.
    pub fn kill(&'static self, task: &'static Task<P>) -> Event {
        let cs = self.lock();
        {
            let inner = task.inner.get(&cs);
            if matches!(inner.join, Join::Detached) || inner.state == TaskState::Stopped {
                cs.leave(&self.lock);
                return Event::Failure;
            }
        }

        // Robust-mutex owner-death transfer and priority-inheritance
        // teardown (§4.2 "Kill", step (a)/(b)).
        while let Some(m) = task.inner.get(&cs).owned_mutexes {
            crate::mutex::transfer_on_owner_death(&cs, self, m, task);
        }

        let state = task.inner.get(&cs).state;
        match state {
            TaskState::Ready => {
                self.ready.get_mut(&cs).remove(&cs, task);
            }
            TaskState::Blocked => {
                unlink_blocked(&cs, self, task, Event::Stopped);
            }
            TaskState::Stopped => {}
        }
        task.inner.get_mut(&cs).state = TaskState::Stopped;
        wake_joiners(&cs, self, task, Event::Stopped);

        #[cfg(feature = "klock_trace")]
        log::trace!("task killed");
        cs.leave(&self.lock);
        Event::Success
    }

    /// `delete` (§4.2): kill then detach-and-free.
    pub fn delete(&'static self, task: &'static Task<P>) -> Event {
        let r = self.kill(task);
        if r.is_failure() {
            return r;
        }
        let cs = self.lock();
        task.inner.get_mut(&cs).join = Join::Detached;
        cs.leave(&self.lock);
        self.reclaim(task);
        Event::Success
    }

    /// `join` (§4.2): block the caller until `task` reaches `STOPPED`.
    pub fn join(&'static self, caller: &'static Task<P>, task: &'static Task<P>) -> Event {
        if core::ptr::eq(caller, task) {
            return Event::Failure;
        }
        let cs = self.lock();
        {
            let inner = task.inner.get(&cs);
            if matches!(inner.join, Join::Detached) {
                cs.leave(&self.lock);
                return Event::Failure;
            }
            if inner.state == TaskState::Stopped {
                cs.leave(&self.lock);
                self.reclaim(task);
                return Event::Success;
            }
        }

        caller.inner.get_mut(&cs).state = TaskState::Blocked;
        let list_ptr = match &mut task.inner.get_mut(&cs).join {
            Join::Joinable(q) => {
                q.insert(&cs, caller);
                q as *mut PriorityList<P>
            }
            Join::Detached => unreachable!("checked joinable above"),
        };
        caller.inner.get_mut(&cs).guard = Guard::Wait(list_ptr);
        let reason = dispatch_and_wait(cs, self);
        // Reclaim on any non-FAILURE return where the target ended up
        // STOPPED (§4.2 "Join"), not only on SUCCESS: `kill` wakes a joiner
        // with `Event::Stopped`, and that's still "the target is STOPPED"
        // from the caller's point of view. Matches `tsk_join`'s
        // `event != E_FAILURE && tsk->hdr.id == ID_STOPPED` condition.
        if reason != Event::Failure {
            let cs = self.lock();
            let target_stopped = task.inner.get(&cs).state == TaskState::Stopped;
            cs.leave(&self.lock);
            if target_stopped {
                self.reclaim(task);
            }
        }
        reason
    }

    /// `detach` (§4.2): mark a joinable task detached.
    pub fn detach(&'static self, task: &'static Task<P>) -> Event {
        let cs = self.lock();
        let already_stopped;
        {
            let inner = task.inner.get(&cs);
            if matches!(inner.join, Join::Detached) || inner.res == Ownership::Static {
                cs.leave(&self.lock);
                return Event::Failure;
            }
            already_stopped = inner.state == TaskState::Stopped;
        }
        if !already_stopped {
            wake_joiners(&cs, self, task, Event::Failure);
        }
        task.inner.get_mut(&cs).join = Join::Detached;
        cs.leave(&self.lock);
        if already_stopped {
            self.reclaim(task);
        }
        Event::Success
    }

    /// `yield` (§4.2): force an immediate context switch.
    pub fn yield_now(&'static self) {
        let cs = self.lock();
        cs.leave(&self.lock);
        P::switch_now();
    }

    /// `flip` (§4.2): replace the current task's entry and restart it on
    /// its own, cropped stack. Never returns.
    pub fn flip(&'static self, task: &'static Task<P>, entry: EntryFn<P>) -> ! {
        let cs = self.lock();
        task.inner.get_mut(&cs).entry = entry;
        P::init_ctx(task);
        let top = task.stack_top();
        cs.leave(&self.lock);
        // Safety: `top` is this task's own stack top, and `flip` is called
        // from the task's own context.
        unsafe { P::flip(top) }
    }

    /// `setPrio` (§4.2): change a task's base priority and recompute its
    /// effective priority under inheritance.
    pub fn set_priority(&'static self, task: &'static Task<P>, basic: u8) {
        let cs = self.lock();
        task.inner.get_mut(&cs).basic = basic;
        recompute_priority(&cs, self, task);
        cs.leave(&self.lock);
    }

    /// `getPrio` (§4.2).
    pub fn priority(&'static self, task: &'static Task<P>) -> u8 {
        task.priority(self)
    }

    /// `waitFor(flags, delay)` (§4.2): block on the flag-event queue.
    pub fn wait_for_flags(&'static self, caller: &'static Task<P>, flags: u32, delay: Tick) -> (Event, u32) {
        let until = if delay == INFINITE {
            INFINITE
        } else {
            let cs = self.lock();
            let now = self.now.read(&cs);
            cs.leave(&self.lock);
            now.saturating_add(delay)
        };
        self.wait_until_flags(caller, flags, until)
    }

    /// `waitUntil(flags, time)` (§4.2).
    pub fn wait_until_flags(&'static self, caller: &'static Task<P>, flags: u32, time: Tick) -> (Event, u32) {
        let cs = self.lock();
        caller.inner.get_mut(&cs).tag = WaitTag::Flags(flags);
        caller.inner.get_mut(&cs).state = TaskState::Blocked;
        let wai_ptr = self.wai.get_mut(&cs) as *mut PriorityList<P>;
        caller.inner.get_mut(&cs).guard = Guard::Wait(wai_ptr);
        self.wai.get_mut(&cs).insert(&cs, caller);
        if time != INFINITE {
            self.dly.get_mut(&cs).insert(&cs, caller, time);
        }
        let reason = dispatch_and_wait(cs, self);
        let consumed = match read_tag(self, caller) {
            WaitTag::Flags(f) => f,
            WaitTag::None => 0,
        };
        (reason, consumed)
    }

    /// `give(task, flags)` (§4.2, §9 "Open question"): the send half of
    /// the flag-event rendezvous. Returns `SUCCESS` whenever the target is
    /// parked in the flag-wait state, even if `flags` doesn't intersect its
    /// pending mask at all — the original only updates `tmp.flg.flags`
    /// inside the overlap branch and otherwise leaves it (and the target)
    /// untouched, so a non-intersecting call is a no-op that still reports
    /// success. `FAILURE` is reserved for a target that isn't a flag-waiter
    /// at all.
    pub fn give_flags(&'static self, target: &'static Task<P>, flags: u32) -> Event {
        let cs = self.lock();
        // `tag` alone isn't enough to tell "currently a flag-waiter" from "once
        // was, now parked on something else": it is only ever written by
        // `wait_until_flags` and is never reset on timeout or on any other
        // wakeup, so a stale `Flags(..)` value survives through later, unrelated
        // blocks. `guard` doesn't have that problem — it is cleared back to
        // `Guard::None` by every wakeup path (`wake_one`) — so require it to
        // still point at `Kernel::wai` (§4.2 "If the target is blocked on
        // `System.wai`") before trusting `tag` at all.
        let wai_ptr = self.wai.get_mut(&cs) as *mut PriorityList<P>;
        let on_flag_wait = target.inner.get(&cs).state == TaskState::Blocked
            && matches!(&target.inner.get(&cs).guard, Guard::Wait(ptr) if core::ptr::eq(*ptr, wai_ptr));
        let pending = match (on_flag_wait, target.inner.get(&cs).tag) {
            (true, WaitTag::Flags(f)) => f,
            _ => {
                cs.leave(&self.lock);
                return Event::Failure;
            }
        };
        if pending & flags != 0 {
            let remaining = pending & !flags;
            target.inner.get_mut(&cs).tag = WaitTag::Flags(remaining);
            if remaining == 0 {
                let consumed = pending & flags;
                unlink_blocked(&cs, self, target, Event::Success);
                target.inner.get_mut(&cs).tag = WaitTag::Flags(consumed);
            }
        }
        cs.leave(&self.lock);
        Event::Success
    }

    /// `sleepFor` (§4.2): block for `delay` ticks.
    pub fn sleep_for(&'static self, caller: &'static Task<P>, delay: Tick) -> Event {
        let cs = self.lock();
        let now = self.now.read(&cs);
        cs.leave(&self.lock);
        self.sleep_until(caller, now.saturating_add(delay))
    }

    /// `sleepNext` (§4.2): drift-free periodic sleep measured from the
    /// caller's previous wake time.
    pub fn sleep_next(&'static self, caller: &'static Task<P>, delay: Tick) -> Event {
        let cs = self.lock();
        let base = caller.inner.get(&cs).last_wake;
        cs.leave(&self.lock);
        self.sleep_until(caller, base.saturating_add(delay))
    }

    /// `sleepUntil` (§4.2): block until the absolute tick `time`.
    pub fn sleep_until(&'static self, caller: &'static Task<P>, time: Tick) -> Event {
        let cs = self.lock();
        caller.inner.get_mut(&cs).state = TaskState::Blocked;
        caller.inner.get_mut(&cs).guard = Guard::Delay;
        self.dly.get_mut(&cs).insert(&cs, caller, time);
        let reason = dispatch_and_wait(cs, self);
        let cs = self.lock();
        let now = self.now.read(&cs);
        caller.inner.get_mut(&cs).last_wake = now;
        cs.leave(&self.lock);
        reason
    }

    /// `suspend` (§4.2): valid only for a `READY` task; parks it with an
    /// infinite delay.
    pub fn suspend(&'static self, task: &'static Task<P>) -> Event {
        let cs = self.lock();
        if task.inner.get(&cs).state != TaskState::Ready {
            cs.leave(&self.lock);
            return Event::Failure;
        }
        self.ready.get_mut(&cs).remove(&cs, task);
        task.inner.get_mut(&cs).state = TaskState::Blocked;
        task.inner.get_mut(&cs).guard = Guard::Delay;
        self.dly.get_mut(&cs).insert(&cs, task, INFINITE);
        let is_cur = self.cur.read(&cs) == Some(task);
        cs.leave(&self.lock);
        if is_cur {
            P::switch_now();
        }
        Event::Success
    }

    /// `resume` (§4.2): valid only for a task parked by `suspend`
    /// (`delay == INFINITE` on the delay queue).
    pub fn resume(&'static self, task: &'static Task<P>) -> Event {
        let cs = self.lock();
        let parked = task.inner.get(&cs).state == TaskState::Blocked
            && matches!(task.inner.get(&cs).guard, Guard::Delay)
            && task.inner.get(&cs).wake_at == INFINITE;
        if !parked {
            cs.leave(&self.lock);
            return Event::Failure;
        }
        self.dly.get_mut(&cs).remove(&cs, task);
        wake_one(&cs, self, task, Event::Success);
        cs.leave(&self.lock);
        Event::Success
    }
}

fn read_tag<P: Port>(k: &'static Kernel<P>, task: &'static Task<P>) -> WaitTag {
    let cs = k.lock();
    let t = task.inner.get(&cs).tag;
    cs.leave(&k.lock);
    t
}

/// Wake every joiner blocked on `task`'s join slot with `reason`, and
/// forget the slot (a `STOPPED`/self-terminated task's join queue is
/// drained exactly once).
fn wake_joiners<P: Port>(cs: &CriticalSection<P>, k: &'static Kernel<P>, task: &'static Task<P>, reason: Event) {
    let mut joiners = match &mut task.inner.get_mut(cs).join {
        Join::Joinable(q) => core::mem::replace(q, PriorityList::new()),
        Join::Detached => return,
    };
    joiners.drain(cs, |cs, joiner| {
        wake_one(cs, k, joiner, reason);
    });
}

/// Remove a blocked task from whatever queue `guard` says it is on, wake it
/// with `reason`, and clear its timeout if any (`core_tsk_unlink`, §6).
/// Returns whether the task was actually found blocked (the hand-off
/// convention, §4.3/§9).
fn unlink_blocked<P: Port>(cs: &CriticalSection<P>, k: &'static Kernel<P>, task: &'static Task<P>, reason: Event) -> bool {
    let guard = core::mem::replace(&mut task.inner.get_mut(cs).guard, Guard::None);
    match guard {
        Guard::None => false,
        Guard::Delay => {
            k.dly.get_mut(cs).remove(cs, task);
            wake_one(cs, k, task, reason);
            true
        }
        Guard::Wait(ptr) => {
            // Safety: `ptr` was produced from a live `&mut PriorityList<P>`
            // borrowed out of a `CpuLockCell` this kernel (or a semaphore
            // it manages) owns, and no other reference to that list is
            // alive while `cs` is held.
            let list = unsafe { &mut *ptr };
            list.remove(cs, task);
            let has_timeout = task.inner.get(cs).wake_at != INFINITE;
            if has_timeout {
                k.dly.get_mut(cs).remove(cs, task);
            }
            wake_one(cs, k, task, reason);
            true
        }
    }
}

/// Wake a specific task unconditionally: clear its block bookkeeping, mark
/// it `READY`, and insert it on the ready list (`core_tsk_wakeup`, §6).
pub(crate) fn wake_one<P: Port>(cs: &CriticalSection<P>, k: &'static Kernel<P>, task: &'static Task<P>, reason: Event) {
    {
        let inner = task.inner.get_mut(cs);
        inner.guard = Guard::None;
        inner.wake_at = INFINITE;
        inner.wake_reason = reason;
        inner.state = TaskState::Ready;
    }
    k.ready.get_mut(cs).insert(cs, task);
    maybe_preempt(cs, k, task);
}

/// Recompute a task's effective priority as `max(basic, max priority of
/// tasks blocked on mutexes it owns)` (§4.2 `setPrio`) and re-sort whatever
/// list it currently sits on.
pub(crate) fn recompute_priority<P: Port>(cs: &CriticalSection<P>, k: &'static Kernel<P>, task: &'static Task<P>) {
    let basic = task.inner.get(cs).basic;
    let mut boosted = basic;
    let mut m = task.inner.get(cs).owned_mutexes;
    while let Some(mtx) = m {
        if let Some(p) = crate::mutex::highest_waiter_prio(cs, mtx) {
            if p < boosted {
                boosted = p;
            }
        }
        m = crate::mutex::next_owned(cs, mtx);
    }
    task.inner.get_mut(cs).prio = boosted;

    match task.inner.get(cs).state {
        TaskState::Ready => {
            k.ready.get_mut(cs).reinsert(cs, task);
        }
        TaskState::Blocked => {
            if let Guard::Wait(ptr) = task.inner.get(cs).guard {
                // Safety: see `unlink_blocked`.
                let list = unsafe { &mut *ptr };
                list.reinsert(cs, task);
            }
        }
        TaskState::Stopped => {}
    }
    maybe_preempt(cs, k, task);
}

/// Arrange a context switch if `candidate` now outranks the running task.
fn maybe_preempt<P: Port>(cs: &CriticalSection<P>, k: &'static Kernel<P>, candidate: &'static Task<P>) {
    match k.cur.read(cs) {
        Some(cur) if candidate.inner.get(cs).prio < cur.inner.get(cs).prio => P::request_switch(),
        None => P::request_switch(),
        _ => {}
    }
}

/// Leave the critical section and hand control to the port's dispatcher,
/// returning once this task is woken, with the delivered wake reason.
pub(crate) fn dispatch_and_wait<P: Port>(cs: CriticalSection<P>, k: &'static Kernel<P>) -> Event {
    cs.leave(&k.lock);
    P::switch_now();
    let cs = k.lock();
    let cur = k.cur.read(&cs).expect("dispatch_and_wait outside task context");
    let reason = cur.inner.get(&cs).wake_reason;
    cs.leave(&k.lock);
    reason
}

/// Drain the delay queue of every task whose deadline has passed, waking
/// each with `TIMEOUT` (blocked tasks) — suspended (`INFINITE`-deadline)
/// tasks are never swept up here. Called from [`Kernel::tick`].
pub(crate) fn process_timeouts<P: Port>(k: &'static Kernel<P>, cs: &CriticalSection<P>, now: Tick) {
    let mut expired = PriorityList::new();
    k.dly.get_mut(cs).drain_expired(cs, now, |cs, task| {
        if let Guard::Wait(ptr) = task.inner.get(cs).guard {
            // Safety: see `unlink_blocked`.
            let list = unsafe { &mut *ptr };
            list.remove(cs, task);
        }
        task.inner.get_mut(cs).guard = Guard::None;
        expired.insert(cs, task);
    });
    expired.drain(cs, |cs, task| wake_one(cs, k, task, Event::Timeout));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    struct TestPort;

    impl Port for TestPort {
        const NUM_PRIORITY_LEVELS: usize = 16;

        unsafe fn enter_critical() {}
        unsafe fn leave_critical() {}
        fn init_ctx(_task: &'static Task<Self>) {}
        fn request_switch() {}
        fn switch_now() {}
        unsafe fn flip(_stack_top: *mut u8) -> ! {
            unreachable!("test port never flips")
        }
        unsafe fn alloc(layout: Layout) -> *mut u8 {
            std::alloc::alloc_zeroed(layout)
        }
        unsafe fn free(ptr: *mut u8, layout: Layout) {
            std::alloc::dealloc(ptr, layout)
        }
    }

    fn leaked_task(prio: u8) -> &'static Task<TestPort> {
        let stack: &'static mut [u8] = Box::leak(vec![0u8; 128].into_boxed_slice());
        Box::leak(Box::new(Task::new_static(prio, |_| {}, stack.as_mut_ptr(), stack.len())))
    }

    fn fresh_kernel() -> &'static Kernel<TestPort> {
        let idle = leaked_task(TestPort::NUM_PRIORITY_LEVELS as u8 - 1);
        Box::leak(Box::new(Kernel::new(idle)))
    }

    #[test]
    fn static_task_starts_ready() {
        let k = fresh_kernel();
        let task = leaked_task(3);
        k.init_in_place(task);
        assert_eq!(task.state(k), TaskState::Ready);
    }

    #[test]
    fn self_join_fails_without_blocking() {
        let k = fresh_kernel();
        let task = leaked_task(3);
        k.init_in_place(task);
        assert_eq!(k.join(task, task), Event::Failure);
    }

    #[test]
    fn detach_of_static_task_fails() {
        let k = fresh_kernel();
        let task = leaked_task(3);
        k.init_in_place(task);
        assert_eq!(k.detach(task), Event::Failure);
    }

    #[test]
    fn resume_without_suspend_fails() {
        let k = fresh_kernel();
        let task = leaked_task(3);
        k.init_in_place(task);
        assert_eq!(k.resume(task), Event::Failure);
    }

    #[test]
    fn suspend_then_resume_round_trips() {
        let k = fresh_kernel();
        let task = leaked_task(3);
        k.init_in_place(task);
        assert_eq!(k.suspend(task), Event::Success);
        assert_eq!(k.resume(task), Event::Success);
        assert_eq!(task.state(k), TaskState::Ready);
        assert_eq!(k.resume(task), Event::Failure);
    }

    #[test]
    fn give_flags_no_op_on_non_intersecting_mask() {
        let k = fresh_kernel();
        let task = leaked_task(3);
        k.init_in_place(task);
        {
            let cs = k.lock();
            let wai_ptr = k.wai.get_mut(&cs) as *mut PriorityList<TestPort>;
            k.wai.get_mut(&cs).insert(&cs, task);
            task.inner.get_mut(&cs).state = TaskState::Blocked;
            task.inner.get_mut(&cs).guard = Guard::Wait(wai_ptr);
            task.inner.get_mut(&cs).tag = WaitTag::Flags(0b1100);
            cs.leave(&k.lock);
        }
        // Non-intersecting bits still report SUCCESS (the target was a
        // flag-waiter) but leave its pending mask untouched (§9 open
        // question).
        assert_eq!(k.give_flags(task, 0b0011), Event::Success);
        let cs = k.lock();
        assert_eq!(task.inner.get(&cs).tag, WaitTag::Flags(0b1100));
        assert_eq!(task.inner.get(&cs).state, TaskState::Blocked);
        cs.leave(&k.lock);
    }

    #[test]
    fn give_flags_on_non_waiter_fails() {
        let k = fresh_kernel();
        let task = leaked_task(3);
        k.init_in_place(task);
        assert_eq!(k.give_flags(task, 0b0001), Event::Failure);
    }

    #[test]
    fn give_flags_partial_then_full_satisfaction() {
        let k = fresh_kernel();
        let task = leaked_task(3);
        k.init_in_place(task);
        {
            let cs = k.lock();
            let wai_ptr = k.wai.get_mut(&cs) as *mut PriorityList<TestPort>;
            k.wai.get_mut(&cs).insert(&cs, task);
            task.inner.get_mut(&cs).state = TaskState::Blocked;
            task.inner.get_mut(&cs).guard = Guard::Wait(wai_ptr);
            task.inner.get_mut(&cs).tag = WaitTag::Flags(0b1100);
            cs.leave(&k.lock);
        }
        assert_eq!(k.give_flags(task, 0b0100), Event::Success);
        {
            let cs = k.lock();
            assert_eq!(task.inner.get(&cs).tag, WaitTag::Flags(0b1000));
            assert_eq!(task.inner.get(&cs).state, TaskState::Blocked);
            cs.leave(&k.lock);
        }
        assert_eq!(k.give_flags(task, 0b1010), Event::Success);
        let cs = k.lock();
        assert_eq!(task.inner.get(&cs).state, TaskState::Ready);
        assert_eq!(task.inner.get(&cs).tag, WaitTag::Flags(0b1000));
        cs.leave(&k.lock);
    }

    /// §8 end-to-end scenarios that don't involve a semaphore (those live in
    /// `semaphore.rs`): this hosted test harness has no port capable of a
    /// real context switch, so scenarios that need two tasks genuinely
    /// interleaved (a blocked joiner woken by the task it's waiting on) are
    /// driven the same way the rest of this file's tests drive wait-queue
    /// state directly, rather than through the blocking entry points
    /// (`join`/`stop`) that would otherwise hang waiting for a dispatcher
    /// that doesn't exist here.
    mod scenarios {
        use super::*;

        /// Scenario 3 (§8), the immediate-return half: a `join` on a target
        /// that is already `STOPPED` succeeds without blocking.
        #[test]
        fn join_on_already_stopped_target_succeeds_immediately() {
            let k = fresh_kernel();
            let target = leaked_task(5);
            let caller = leaked_task(1);
            k.init_in_place(target);
            k.init_in_place(caller);
            let cs = k.lock();
            target.inner.get_mut(&cs).state = TaskState::Stopped;
            cs.leave(&k.lock);
            assert_eq!(k.join(caller, target), Event::Success);
        }

        /// Scenario 3 (§8), the wake half: a joiner already parked on a
        /// task's join queue is woken with `SUCCESS` once that task reaches
        /// `STOPPED` (the mechanism `stop`/`kill` both drive through
        /// `wake_joiners`).
        #[test]
        fn kill_of_active_task_wakes_its_parked_joiner() {
            let k = fresh_kernel();
            let target = leaked_task(5);
            let joiner = leaked_task(1);
            k.init_in_place(target);
            k.init_in_place(joiner);

            let cs = k.lock();
            match &mut target.inner.get_mut(&cs).join {
                Join::Joinable(q) => q.insert(&cs, joiner),
                Join::Detached => unreachable!(),
            }
            joiner.inner.get_mut(&cs).state = TaskState::Blocked;
            cs.leave(&k.lock);

            assert_eq!(k.kill(target), Event::Success);
            assert_eq!(target.state(k), TaskState::Stopped);
            assert_eq!(joiner.state(k), TaskState::Ready);
            let cs = k.lock();
            assert_eq!(joiner.inner.get(&cs).wake_reason, Event::Stopped);
            cs.leave(&k.lock);
        }

        /// Scenario 5 (§8): detaching a heap-allocated task while it is
        /// still active defers its storage's reclamation to the terminator;
        /// no joiner is ever woken (there wasn't one), and the corpse list
        /// drains the next time the idle task's `reap` runs.
        #[test]
        fn detach_before_termination_defers_to_terminator() {
            let k = fresh_kernel();
            let t = k.spawn(5, |_| {}, 128);
            assert_eq!(k.detach(t), Event::Success);

            let cs = k.lock();
            assert!(matches!(t.inner.get(&cs).join, Join::Detached));
            assert_eq!(t.inner.get(&cs).res, Ownership::Owned, "not reclaimed while still active");
            // Simulate `stop`'s self-termination branch for a detached task
            // (chaining onto the idle task's corpse list) without routing
            // through the diverging `Kernel::stop`, which this harness has
            // no dispatcher to resume from.
            t.inner.get_mut(&cs).state = TaskState::Stopped;
            let prev = k.idle.inner.get_mut(&cs).next.take();
            t.inner.get_mut(&cs).next = prev;
            k.idle.inner.get_mut(&cs).next = Some(t);
            cs.leave(&k.lock);

            k.reap();

            let cs = k.lock();
            assert!(k.idle.inner.get(&cs).next.is_none(), "corpse list drained by the terminator");
            cs.leave(&k.lock);
        }

        // Regression test for a `join` storage-leak bug: the target being
        // `kill`ed while a caller is blocked on it wakes that caller with
        // `Event::Stopped`, not `Event::Success`, but §4.2 "Join" still
        // requires the caller to free the target's storage. A `Port` whose
        // `switch_now` hook performs the kill lets this be driven through
        // the real `Kernel::join` entry point instead of hand-rolling its
        // internals, since `switch_now` is exactly the point where this
        // hosted test harness would otherwise need a real dispatcher to hand
        // control to a third task.
        mod join_reclaim_on_stopped {
            use super::*;
            use std::cell::{Cell, RefCell};

            struct KillOnSwitchPort;

            thread_local! {
                static KILL_ON_SWITCH: RefCell<Option<(&'static Kernel<KillOnSwitchPort>, &'static Task<KillOnSwitchPort>)>> =
                    RefCell::new(None);
                static FREED: Cell<bool> = Cell::new(false);
            }

            impl Port for KillOnSwitchPort {
                const NUM_PRIORITY_LEVELS: usize = 16;
                unsafe fn enter_critical() {}
                unsafe fn leave_critical() {}
                fn init_ctx(_task: &'static Task<Self>) {}
                fn request_switch() {}
                fn switch_now() {
                    if let Some((k, target)) = KILL_ON_SWITCH.with(|c| c.borrow_mut().take()) {
                        k.kill(target);
                    }
                }
                unsafe fn flip(_stack_top: *mut u8) -> ! {
                    unreachable!("test port never flips")
                }
                unsafe fn alloc(layout: Layout) -> *mut u8 {
                    std::alloc::alloc_zeroed(layout)
                }
                unsafe fn free(ptr: *mut u8, layout: Layout) {
                    FREED.with(|f| f.set(true));
                    std::alloc::dealloc(ptr, layout)
                }
            }

            fn leaked_task(prio: u8) -> &'static Task<KillOnSwitchPort> {
                let stack: &'static mut [u8] = Box::leak(vec![0u8; 128].into_boxed_slice());
                Box::leak(Box::new(Task::new_static(prio, |_| {}, stack.as_mut_ptr(), stack.len())))
            }

            #[test]
            fn join_reclaims_storage_when_target_is_killed_while_blocked() {
                let idle = leaked_task(KillOnSwitchPort::NUM_PRIORITY_LEVELS as u8 - 1);
                let k: &'static Kernel<KillOnSwitchPort> = Box::leak(Box::new(Kernel::new(idle)));
                let target = k.spawn(5, |_| {}, 128);
                let caller = leaked_task(1);
                k.init_in_place(caller);

                // Arrange for the dispatcher hook `join` yields to while
                // blocked to kill `target` out from under the caller,
                // mimicking a third task racing in during the switch.
                KILL_ON_SWITCH.with(|c| *c.borrow_mut() = Some((k, target)));

                let cs = k.lock();
                *k.cur.get_mut(&cs) = Some(caller);
                cs.leave(&k.lock);

                assert_eq!(k.join(caller, target), Event::Stopped);
                // `target`'s storage must be reclaimed even though `join`
                // returned `Event::Stopped` rather than `Event::Success` —
                // checked via the `free` hook rather than by reading
                // `target` itself, which is dangling once reclaimed.
                assert!(FREED.with(|f| f.get()), "target's storage was never freed");
            }
        }
    }
}
