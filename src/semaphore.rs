//! The counting semaphore (§4.3): bounded blocking `take`/`give` built on
//! top of a wait queue, shared symmetrically between takers and givers.
//!
//! Grounded in `original_source/StateOS/kernel/src/ossemaphore.c`
//! (`sem_take`/`sem_give`/`sem_waitFor`/`sem_sendFor`/`sem_kill`): a single
//! wait queue serves both a task blocked in `waitFor` (waiting for `count`
//! to rise above zero) and one blocked in `sendFor` (waiting for `count` to
//! drop below `limit`) — the invariants in §3/§8 guarantee the queue never
//! actually holds both kinds at once, since `count > 0` rules out blocked
//! takers and `count < limit` rules out blocked givers.
use core::alloc::Layout;

use crate::{
    error::Event,
    klock::{CpuLockCell, CriticalSection},
    list::PriorityList,
    state::{Kernel, Port, Tick, INFINITE},
    task::{dispatch_and_wait, wake_one, Guard, Ownership, Task, TaskState},
};

struct SemaphoreInner<P: Port> {
    count: u32,
    limit: u32,
    waiters: PriorityList<P>,
    res: Ownership,
}

/// A counting semaphore (§3 `Semaphore`): `count` bounded by `limit`, with
/// an embedded priority-then-FIFO wait queue shared by blocked takers and
/// blocked givers.
pub struct Semaphore<P: Port> {
    inner: CpuLockCell<P, SemaphoreInner<P>>,
}

// Safety: all access goes through `inner`, gated by the kernel's single
// critical section, exactly like `Task`.
unsafe impl<P: Port> Sync for Semaphore<P> {}

impl<P: Port> Semaphore<P> {
    /// `sem_init` (§4.3): build a semaphore over caller-owned static
    /// storage. `limit == 0` is invalid and trips an assertion (§3).
    pub fn new_static(init: u32, limit: u32) -> Self {
        assert!(limit > 0, "semaphore limit must be nonzero (§3)");
        debug_assert!(init <= limit, "initial count must not exceed limit (§3)");
        Self {
            inner: CpuLockCell::new(SemaphoreInner {
                count: init,
                limit,
                waiters: PriorityList::new(),
                res: Ownership::Static,
            }),
        }
    }

    /// `getValue` (§4.3): the current count.
    pub fn value(&self, k: &Kernel<P>) -> u32 {
        let cs = k.lock();
        let v = self.inner.get(&cs).count;
        cs.leave(&k.lock);
        v
    }

    /// The semaphore's fixed upper bound, set at construction.
    pub fn limit(&self, k: &Kernel<P>) -> u32 {
        let cs = k.lock();
        let v = self.inner.get(&cs).limit;
        cs.leave(&k.lock);
        v
    }
}

/// Wake a waiter popped off a wait queue, clearing any timeout it had
/// pending on [`Kernel::dly`] first — `PriorityList::pop_front` only
/// unlinks the semaphore-queue membership, not a parallel delay-queue
/// entry from a bounded `waitFor`/`sendFor`, so this mirrors the cleanup
/// `task::unlink_blocked` does for `kill`/`give_flags`.
fn wake_popped_waiter<P: Port>(cs: &CriticalSection<P>, k: &'static Kernel<P>, task: &'static Task<P>, reason: Event) {
    if task.wake_at(cs) != INFINITE {
        k.dly.get_mut(cs).remove(cs, task);
    }
    wake_one(cs, k, task, reason);
}

/// Attempt a `take`: decrement `count` if positive, or hand the permit
/// straight to a blocked giver if one is waiting (§4.3 "Direct hand-off
/// optimization"; `priv_sem_take` in the original). Returns `TIMEOUT` (the
/// immediate-try sentinel, not an error, §7) if `count == 0`.
fn try_take<P: Port>(cs: &CriticalSection<P>, k: &'static Kernel<P>, sem: &'static Semaphore<P>) -> Event {
    let count = sem.inner.get(cs).count;
    if count == 0 {
        return Event::Timeout;
    }
    match sem.inner.get_mut(cs).waiters.pop_front(cs) {
        Some(giver) => wake_popped_waiter(cs, k, giver, Event::Success),
        None => sem.inner.get_mut(cs).count = count - 1,
    }
    Event::Success
}

/// Attempt a `give`: increment `count` if below `limit`, or hand the slot
/// straight to a blocked taker (`priv_sem_give`). Returns `TIMEOUT` if
/// `count == limit`.
fn try_give<P: Port>(cs: &CriticalSection<P>, k: &'static Kernel<P>, sem: &'static Semaphore<P>) -> Event {
    let inner = sem.inner.get(cs);
    if inner.count >= inner.limit {
        return Event::Timeout;
    }
    let count = inner.count;
    match sem.inner.get_mut(cs).waiters.pop_front(cs) {
        Some(taker) => wake_popped_waiter(cs, k, taker, Event::Success),
        None => sem.inner.get_mut(cs).count = count + 1,
    }
    Event::Success
}

/// Park `caller` on `sem`'s wait queue until woken or `time` passes
/// (shared by the `waitFor`/`waitUntil`/`sendFor`/`sendUntil` blocking
/// paths — which side is blocked is implicit in which of `try_take`/
/// `try_give` the caller already tried).
fn block_on<P: Port>(
    cs: CriticalSection<P>,
    k: &'static Kernel<P>,
    sem: &'static Semaphore<P>,
    caller: &'static Task<P>,
    time: Tick,
) -> Event {
    let list_ptr = &mut sem.inner.get_mut(&cs).waiters as *mut PriorityList<P>;
    sem.inner.get_mut(&cs).waiters.insert(&cs, caller);
    caller.inner.get_mut(&cs).state = TaskState::Blocked;
    caller.inner.get_mut(&cs).guard = Guard::Wait(list_ptr);
    if time != INFINITE {
        k.dly.get_mut(&cs).insert(&cs, caller, time);
    }
    dispatch_and_wait(cs, k)
}

impl<P: Port> Kernel<P> {
    /// `sem_create` (§4.3): allocate a kernel-owned semaphore.
    pub fn sem_create(&'static self, init: u32, limit: u32) -> &'static Semaphore<P> {
        let layout = Layout::new::<Semaphore<P>>();
        // Safety: freed with the same layout in `sem_delete`.
        let base = unsafe { P::alloc(layout) } as *mut Semaphore<P>;
        assert!(!base.is_null(), "allocator exhausted");
        // Safety: `base` points to freshly allocated, correctly aligned
        // storage for a `Semaphore<P>` for the remainder of the program.
        unsafe { base.write(Semaphore::new_static(init, limit)) };
        let sem: &'static Semaphore<P> = unsafe { &*base };
        let cs = self.lock();
        sem.inner.get_mut(&cs).res = Ownership::Owned;
        cs.leave(&self.lock);
        sem
    }

    /// `sem_take`/`take` (§4.3): non-blocking try.
    pub fn sem_take(&'static self, sem: &'static Semaphore<P>) -> Event {
        let cs = self.lock();
        let r = try_take(&cs, self, sem);
        cs.leave(&self.lock);
        r
    }

    /// `sem_give`/`give` (§4.3): non-blocking try.
    pub fn sem_give(&'static self, sem: &'static Semaphore<P>) -> Event {
        let cs = self.lock();
        let r = try_give(&cs, self, sem);
        cs.leave(&self.lock);
        r
    }

    /// `sem_waitFor`/`waitFor` (§4.3): try `take`; block for up to `delay`
    /// ticks if it would time out.
    pub fn sem_wait_for(&'static self, sem: &'static Semaphore<P>, caller: &'static Task<P>, delay: Tick) -> Event {
        let until = self.deadline_from_delay(delay);
        self.sem_wait_until(sem, caller, until)
    }

    /// `sem_waitUntil`/`waitUntil` (§4.3): try `take`; block until absolute
    /// tick `time` if it would time out.
    pub fn sem_wait_until(&'static self, sem: &'static Semaphore<P>, caller: &'static Task<P>, time: Tick) -> Event {
        let cs = self.lock();
        match try_take(&cs, self, sem) {
            Event::Timeout => block_on(cs, self, sem, caller, time),
            other => {
                cs.leave(&self.lock);
                other
            }
        }
    }

    /// `sem_sendFor`/`sendFor` (§4.3): try `give`; block for up to `delay`
    /// ticks if it would time out (on the same wait queue as `waitFor` —
    /// §4.3 "yes, the same queue").
    pub fn sem_send_for(&'static self, sem: &'static Semaphore<P>, caller: &'static Task<P>, delay: Tick) -> Event {
        let until = self.deadline_from_delay(delay);
        self.sem_send_until(sem, caller, until)
    }

    /// `sem_sendUntil`/`sendUntil` (§4.3).
    pub fn sem_send_until(&'static self, sem: &'static Semaphore<P>, caller: &'static Task<P>, time: Tick) -> Event {
        let cs = self.lock();
        match try_give(&cs, self, sem) {
            Event::Timeout => block_on(cs, self, sem, caller, time),
            other => {
                cs.leave(&self.lock);
                other
            }
        }
    }

    /// `sem_kill` (§4.3): zero `count` and wake every waiter — takers and
    /// givers alike — with `STOPPED`.
    pub fn sem_kill(&'static self, sem: &'static Semaphore<P>) {
        let cs = self.lock();
        sem.inner.get_mut(&cs).count = 0;
        let mut woken = PriorityList::new();
        core::mem::swap(&mut woken, &mut sem.inner.get_mut(&cs).waiters);
        woken.drain(&cs, |cs, task| {
            wake_popped_waiter(cs, self, task, Event::Stopped);
        });
        cs.leave(&self.lock);
    }

    /// `sem_delete` (§4.3): kill, then free kernel-owned storage.
    pub fn sem_delete(&'static self, sem: &'static Semaphore<P>) {
        self.sem_kill(sem);
        let cs = self.lock();
        let res = core::mem::replace(&mut sem.inner.get_mut(&cs).res, Ownership::Released);
        cs.leave(&self.lock);
        if matches!(res, Ownership::Owned) {
            // Safety: `sem` was allocated by `sem_create` with this exact
            // layout and is never touched again after this call.
            unsafe { P::free(sem as *const Semaphore<P> as *mut u8, Layout::new::<Semaphore<P>>()) };
        }
    }

    fn deadline_from_delay(&'static self, delay: Tick) -> Tick {
        if delay == INFINITE {
            INFINITE
        } else {
            let cs = self.lock();
            let now = self.now.read(&cs);
            cs.leave(&self.lock);
            now.saturating_add(delay)
        }
    }
}
