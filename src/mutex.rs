//! Mutex ownership hooks (§3, §4.2 "Kill", §6 "Mutex hooks", §9 "Robust
//! mutex").
//!
//! A full mutex primitive — `lock`/`unlock`, the ceiling/priority-
//! inheritance protocol surface a caller sees — is a higher-level
//! collaborator out of scope for this core (§1: "the higher-level
//! primitives... beyond the handful of hooks the task core requires"). What
//! the task core *does* own, because `setPrio` and `kill` depend on it
//! directly, is the intrusive ownership bookkeeping every mutex must carry:
//! the owner's `mtx.list` chain (walked by priority-inheritance
//! recomputation, `task::recompute_priority`) and the robust-mutex
//! owner-death transfer `kill` performs (`core_mtx_transferLock`, §6).
//!
//! A concrete mutex implementation is expected to embed one [`Mutex`] per
//! lock, call [`Mutex::attach_owner`] when its own acquire logic grants the
//! lock, and [`Mutex::release`] when its own release logic gives it up;
//! this crate never call those itself outside of `kill`'s owner-death path.
use crate::{
    error::Event,
    klock::{CpuLockCell, CriticalSection},
    list::PriorityList,
    state::{Kernel, Port},
    task::Task,
};

struct MutexInner<P: Port> {
    owner: Option<&'static Task<P>>,
    waiters: PriorityList<P>,
    /// Next mutex in the owner's `mtx.list` intrusive chain (§3).
    next_owned: Option<&'static Mutex<P>>,
    /// `mtx.mode & mtxRobust` (§9 "Robust mutex"): on owner death, transfer
    /// to the highest-priority waiter and mark `INCONSISTENT` rather than
    /// leaving the lock owned by a dead task.
    robust: bool,
    inconsistent: bool,
}

/// A mutex's ownership/priority-inheritance bookkeeping (`mtx.list`,
/// `mtx.tree`, `mtx.mode`, §3).
pub struct Mutex<P: Port> {
    inner: CpuLockCell<P, MutexInner<P>>,
}

// Safety: all access goes through `inner`, gated by the kernel's single
// critical section, exactly like `Task`.
unsafe impl<P: Port> Sync for Mutex<P> {}

impl<P: Port> Mutex<P> {
    pub const fn new(robust: bool) -> Self {
        Self {
            inner: CpuLockCell::new(MutexInner {
                owner: None,
                waiters: PriorityList::new(),
                next_owned: None,
                robust,
                inconsistent: false,
            }),
        }
    }

    pub fn owner(&self, k: &Kernel<P>) -> Option<&'static Task<P>> {
        let cs = k.lock();
        let o = self.inner.get(&cs).owner;
        cs.leave(&k.lock);
        o
    }

    pub fn is_inconsistent(&self, k: &Kernel<P>) -> bool {
        let cs = k.lock();
        let v = self.inner.get(&cs).inconsistent;
        cs.leave(&k.lock);
        v
    }

    /// Record `task` as a waiter for this mutex (`mtx.tree`, §3) without
    /// blocking it itself — a higher-level lock operation drives the actual
    /// wait-queue suspension the same way `sem::waitFor` does, and reports
    /// back here only so priority-inheritance recomputation has something
    /// to walk.
    pub(crate) fn enqueue_waiter(&'static self, cs: &CriticalSection<P>, task: &'static Task<P>) {
        self.inner.get_mut(cs).waiters.insert(cs, task);
        task.inner.get_mut(cs).blocking_mutex = Some(self);
    }

    pub(crate) fn remove_waiter(&'static self, cs: &CriticalSection<P>, task: &'static Task<P>) {
        self.inner.get_mut(cs).waiters.remove(cs, task);
        task.inner.get_mut(cs).blocking_mutex = None;
    }

    /// Grant ownership to `owner`, threading this mutex onto the head of
    /// its `mtx.list` owned-mutex chain.
    pub(crate) fn attach_owner(&'static self, cs: &CriticalSection<P>, owner: &'static Task<P>) {
        let prev = owner.inner.get(cs).owned_mutexes;
        owner.inner.get_mut(cs).owned_mutexes = Some(self);
        let inner = self.inner.get_mut(cs);
        inner.owner = Some(owner);
        inner.next_owned = prev;
    }

    /// Release ownership, unthreading this mutex from its (former) owner's
    /// `mtx.list` chain. Precondition: `owner` is this mutex's current
    /// owner.
    pub(crate) fn release(&'static self, cs: &CriticalSection<P>, owner: &'static Task<P>) {
        let next = self.inner.get(cs).next_owned;
        unlink_owned(cs, owner, self, next);
        let inner = self.inner.get_mut(cs);
        inner.owner = None;
        inner.next_owned = None;
    }
}

/// Remove `target` from `owner`'s singly linked `mtx.list` chain, splicing
/// in `target`'s own `next_owned` in its place.
fn unlink_owned<P: Port>(
    cs: &CriticalSection<P>,
    owner: &'static Task<P>,
    target: &'static Mutex<P>,
    target_next: Option<&'static Mutex<P>>,
) {
    let head = owner.inner.get(cs).owned_mutexes;
    match head {
        Some(h) if core::ptr::eq(h, target) => {
            owner.inner.get_mut(cs).owned_mutexes = target_next;
        }
        Some(mut m) => loop {
            let next = m.inner.get(cs).next_owned;
            match next {
                Some(n) if core::ptr::eq(n, target) => {
                    m.inner.get_mut(cs).next_owned = target_next;
                    break;
                }
                Some(n) => m = n,
                None => break,
            }
        },
        None => {}
    }
}

/// The highest priority among tasks currently blocked on `mtx` (for
/// priority-inheritance recomputation, `task::recompute_priority`, §4.2
/// `setPrio`). `None` if nobody is waiting.
pub(crate) fn highest_waiter_prio<P: Port>(cs: &CriticalSection<P>, mtx: &'static Mutex<P>) -> Option<u8> {
    mtx.inner.get(cs).waiters.peek().map(|t| t.effective_prio(cs))
}

/// The next mutex in an owner's `mtx.list` chain, starting from any link in
/// it — used by `task::recompute_priority` to walk every mutex a task owns.
pub(crate) fn next_owned<P: Port>(cs: &CriticalSection<P>, mtx: &'static Mutex<P>) -> Option<&'static Mutex<P>> {
    mtx.inner.get(cs).next_owned
}

/// `core_mtx_transferLock` (§6) driven from `kill`'s owner-death path (§4.2
/// step (a)): pop `mtx` off `task`'s owned-mutex chain; if it is a robust
/// mutex and a waiter is available, hand ownership straight to the
/// highest-priority one (woken with `OWNERDEAD`) and mark the mutex
/// `INCONSISTENT` (§9 "Robust mutex"). A non-robust mutex, or a robust one
/// with no waiter, is simply released.
pub(crate) fn transfer_on_owner_death<P: Port>(
    cs: &CriticalSection<P>,
    k: &'static Kernel<P>,
    mtx: &'static Mutex<P>,
    task: &'static Task<P>,
) {
    let next = mtx.inner.get(cs).next_owned;
    task.inner.get_mut(cs).owned_mutexes = next;

    let robust = mtx.inner.get(cs).robust;
    let successor = if robust {
        mtx.inner.get_mut(cs).waiters.pop_front(cs)
    } else {
        None
    };

    match successor {
        Some(heir) => {
            mtx.inner.get_mut(cs).owner = Some(heir);
            mtx.inner.get_mut(cs).next_owned = heir.inner.get(cs).owned_mutexes;
            heir.inner.get_mut(cs).owned_mutexes = Some(mtx);
            heir.inner.get_mut(cs).blocking_mutex = None;
            mtx.inner.get_mut(cs).inconsistent = true;
            #[cfg(feature = "klock_trace")]
            log::trace!("robust mutex transferred to waiter after owner death, now inconsistent");
            crate::task::wake_one(cs, k, heir, Event::OwnerDead);
        }
        None => {
            mtx.inner.get_mut(cs).owner = None;
            mtx.inner.get_mut(cs).next_owned = None;
            if robust {
                mtx.inner.get_mut(cs).inconsistent = true;
                #[cfg(feature = "klock_trace")]
                log::trace!("robust mutex released with no waiter after owner death, now inconsistent");
            }
        }
    }
}
