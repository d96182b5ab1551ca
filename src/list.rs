//! Intrusive task lists (§3, §9 "Intrusive queues"): the priority-then-FIFO
//! ordered list used for the ready list, every wait queue and the flag-wait
//! queue, and the deadline-ordered delay list used for sleep/suspend.
//!
//! Both reuse the same `next` link field on [`crate::task::Task`] — the
//! original's `obj.queue` is reused the same way across wait-queue
//! membership and the terminator's corpse chain. Membership in at most one
//! list at a time is a procedural invariant (enforced by the task-lifecycle
//! operations in `task.rs`), not a type: this crate simplifies the design
//! note's suggested tagged `TaskLink` variant down to one reused `Option<
//! &'static Task<P>>` field threaded by previous-pointer during traversal,
//! recorded as a deliberate simplification in `DESIGN.md`.
use crate::{
    klock::CriticalSection,
    state::{Port, Tick, INFINITE},
    task::Task,
};

/// A priority-ordered, FIFO-within-priority singly linked list of tasks
/// (§4.3 "Wait-queue ordering is by task priority... ties broken by FIFO
/// insertion order"). Used for the ready list and every wait queue
/// (semaphore, flag-event, join).
pub(crate) struct PriorityList<P: Port> {
    head: Option<&'static Task<P>>,
}

impl<P: Port> PriorityList<P> {
    pub(crate) const fn new() -> Self {
        Self { head: None }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Insert `task` after every task of strictly higher-or-equal effective
    /// priority (lower numeric value sorts first, matching the teacher's
    /// `TaskPriority: Ord` convention), preserving FIFO order among equals.
    pub(crate) fn insert(&mut self, cs: &CriticalSection<P>, task: &'static Task<P>) {
        let prio = task.effective_prio(cs);
        let mut prev: Option<&'static Task<P>> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if c.effective_prio(cs) > prio {
                break;
            }
            prev = Some(c);
            cur = c.next(cs);
        }
        task.set_next(cs, cur);
        match prev {
            Some(p) => p.set_next(cs, Some(task)),
            None => self.head = Some(task),
        }
    }

    /// Remove and return the head of the list (the highest-priority,
    /// earliest-inserted task), if any.
    pub(crate) fn pop_front(&mut self, cs: &CriticalSection<P>) -> Option<&'static Task<P>> {
        let task = self.head.take()?;
        self.head = task.next(cs);
        task.set_next(cs, None);
        Some(task)
    }

    /// Peek the head without removing it.
    pub(crate) fn peek(&self) -> Option<&'static Task<P>> {
        self.head
    }

    /// Remove a specific task from the list, wherever it sits. Returns
    /// whether it was found (a task not on the list is a no-op, matching
    /// `core_tsk_unlink`'s tolerance of an already-woken task).
    pub(crate) fn remove(&mut self, cs: &CriticalSection<P>, task: &'static Task<P>) -> bool {
        let mut prev: Option<&'static Task<P>> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if core::ptr::eq(c, task) {
                let nxt = c.next(cs);
                match prev {
                    Some(p) => p.set_next(cs, nxt),
                    None => self.head = nxt,
                }
                task.set_next(cs, None);
                return true;
            }
            prev = Some(c);
            cur = c.next(cs);
        }
        false
    }

    /// Re-insert a task already present in the list after a priority
    /// change (`setPrio` triggering re-sort, §4.2).
    pub(crate) fn reinsert(&mut self, cs: &CriticalSection<P>, task: &'static Task<P>) {
        if self.remove(cs, task) {
            self.insert(cs, task);
        }
    }

    /// Drain every task off the list, invoking `f` on each in order.
    pub(crate) fn drain(&mut self, cs: &CriticalSection<P>, mut f: impl FnMut(&CriticalSection<P>, &'static Task<P>)) {
        while let Some(task) = self.pop_front(cs) {
            f(cs, task);
        }
    }
}

/// The deadline-ordered delay list backing sleep and suspend (§4.2
/// `sleepFor`/`sleepNext`/`sleepUntil`/`suspend`). Ordered by absolute wake
/// tick, earliest first; `INFINITE` entries (parked suspends) sort last and
/// are only ever removed by `resume` or `kill`, never by tick expiry.
pub(crate) struct DelayQueue<P: Port> {
    head: Option<&'static Task<P>>,
}

impl<P: Port> DelayQueue<P> {
    pub(crate) const fn new() -> Self {
        Self { head: None }
    }

    pub(crate) fn insert(&mut self, cs: &CriticalSection<P>, task: &'static Task<P>, wake_at: Tick) {
        task.set_wake_at(cs, wake_at);
        let mut prev: Option<&'static Task<P>> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if c.wake_at(cs) > wake_at {
                break;
            }
            prev = Some(c);
            cur = c.next(cs);
        }
        task.set_next(cs, cur);
        match prev {
            Some(p) => p.set_next(cs, Some(task)),
            None => self.head = Some(task),
        }
    }

    pub(crate) fn remove(&mut self, cs: &CriticalSection<P>, task: &'static Task<P>) -> bool {
        let mut prev: Option<&'static Task<P>> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if core::ptr::eq(c, task) {
                let nxt = c.next(cs);
                match prev {
                    Some(p) => p.set_next(cs, nxt),
                    None => self.head = nxt,
                }
                task.set_next(cs, None);
                return true;
            }
            prev = Some(c);
            cur = c.next(cs);
        }
        false
    }

    /// Pop every task whose deadline has passed (`wake_at <= now`),
    /// invoking `f` on each. `INFINITE`-deadline (suspended) tasks are
    /// never popped this way.
    pub(crate) fn drain_expired(
        &mut self,
        cs: &CriticalSection<P>,
        now: Tick,
        mut f: impl FnMut(&CriticalSection<P>, &'static Task<P>),
    ) {
        while let Some(task) = self.head {
            if task.wake_at(cs) == INFINITE || task.wake_at(cs) > now {
                break;
            }
            self.head = task.next(cs);
            task.set_next(cs, None);
            f(cs, task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{state::Kernel, task::Task};
    use core::alloc::Layout;
    use std::boxed::Box;
    use quickcheck_macros::quickcheck;

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
    fn pop_front_returns_highest_priority_first() {
        let k = fresh_kernel();
        let cs = k.lock();
        let mut list = PriorityList::<TestPort>::new();
        list.insert(&cs, leaked_task(5));
        list.insert(&cs, leaked_task(1));
        list.insert(&cs, leaked_task(9));
        assert_eq!(list.pop_front(&cs).unwrap().effective_prio(&cs), 1);
        assert_eq!(list.pop_front(&cs).unwrap().effective_prio(&cs), 5);
        assert_eq!(list.pop_front(&cs).unwrap().effective_prio(&cs), 9);
        assert!(list.is_empty());
        cs.leave(&k.lock);
    }

    #[test]
    fn equal_priority_ties_break_fifo() {
        let k = fresh_kernel();
        let cs = k.lock();
        let mut list = PriorityList::<TestPort>::new();
        let first = leaked_task(4);
        let second = leaked_task(4);
        let third = leaked_task(4);
        list.insert(&cs, first);
        list.insert(&cs, second);
        list.insert(&cs, third);
        assert!(core::ptr::eq(list.pop_front(&cs).unwrap(), first));
        assert!(core::ptr::eq(list.pop_front(&cs).unwrap(), second));
        assert!(core::ptr::eq(list.pop_front(&cs).unwrap(), third));
        cs.leave(&k.lock);
    }

    #[test]
    fn remove_of_absent_task_is_a_no_op() {
        let k = fresh_kernel();
        let cs = k.lock();
        let mut list = PriorityList::<TestPort>::new();
        let a = leaked_task(2);
        let b = leaked_task(2);
        list.insert(&cs, a);
        assert!(!list.remove(&cs, b));
        assert!(list.remove(&cs, a));
        assert!(list.is_empty());
        cs.leave(&k.lock);
    }

    /// Property: whatever order a batch of priorities is inserted in,
    /// draining the list always yields them sorted by priority (ties
    /// broken by insertion order) — the wait-queue ordering law §4.3
    /// promises callers.
    #[quickcheck]
    fn drain_order_matches_sorted_priority_with_fifo_ties(prios: Vec<u8>) -> bool {
        let _ = env_logger::builder().is_test(true).try_init();
        let prios: Vec<u8> = prios.into_iter().take(16).collect();
        let k = fresh_kernel();
        let cs = k.lock();
        let mut list = PriorityList::<TestPort>::new();
        let tasks: Vec<_> = prios.iter().map(|&p| leaked_task(p)).collect();
        for &task in &tasks {
            list.insert(&cs, task);
        }

        let mut expected: Vec<usize> = (0..tasks.len()).collect();
        expected.sort_by_key(|&i| prios[i]);

        let mut drained = Vec::new();
        list.drain(&cs, |cs, task| drained.push(task.effective_prio(cs)));
        cs.leave(&k.lock);

        let expected_prios: Vec<u8> = expected.iter().map(|&i| prios[i]).collect();
        drained == expected_prios
    }
}
