//! Event codes (§6, §7).
//!
//! The core reports outcomes as event codes, not typed exceptions: every
//! blocking operation returns one, and there is no hidden propagation.
//! Preconditions that are violated by a misbehaving caller (null pointer,
//! wrong state, owning mutexes at `stop`, `limit == 0`, use of a released
//! object) are assertions, not `Event`s — exactly the taxonomy the teacher
//! draws between its `ResultCode`-derived errors (recoverable) and
//! `assert!`/`debug_assert!` (caller bugs), only collapsed here into a
//! single closed enum instead of the teacher's per-operation `define_suberror!`
//! family, since this core's whole public surface returns the same six
//! codes rather than the many narrow `r3_core::kernel` error types a full
//! object-safety-checked API would need.
use core::fmt;

/// An outcome code, bit-exact with §6 of the specification.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The operation completed.
    Success = 0,
    /// Preconditions were not met (wrong state, self-join, double-detach).
    Failure = 1,
    /// The operation was cancelled because the object/task was killed.
    Stopped = 2,
    /// A bounded wait expired, or a non-blocking try found nothing ready.
    Timeout = 3,
    /// The object was deleted while the caller was waiting on it.
    Deleted = 4,
    /// A robust mutex's owner died while holding it.
    OwnerDead = 5,
}

impl Event {
    /// `true` for every code other than [`Event::Success`].
    #[inline]
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Success)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Stopped => "stopped",
            Self::Timeout => "timeout",
            Self::Deleted => "deleted",
            Self::OwnerDead => "owner died",
        })
    }
}

/// The wake-up reason delivered to a task blocked on a wait queue:
/// cancellation (by `kill`, object `kill`, or timeout) or a genuine event
/// value from whoever woke it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    /// Delivered by a giver/waker; carries the event or bitmask payload.
    Event(Event),
    /// The wait timed out (§5 "Cancellation").
    Timeout,
}

impl From<WakeReason> for Event {
    fn from(r: WakeReason) -> Self {
        match r {
            WakeReason::Event(e) => e,
            WakeReason::Timeout => Event::Timeout,
        }
    }
}
