//! Synchronization and task-lifecycle core of a preemptive, priority-based
//! real-time kernel for single-core microcontrollers.
//!
//! This crate provides the pieces every other kernel primitive is built on
//! top of: the critical-section lock discipline ([`klock`]), the
//! ready/wait/delay queues ([`list`]), the task lifecycle and flag-event
//! rendezvous ([`task`]), the counting semaphore ([`semaphore`]), and the
//! ownership/priority-inheritance bookkeeping a mutex implementation needs
//! ([`mutex`]). Architecture-specific context switching, the tick timer's
//! board support, the dynamic allocator, and the higher-level primitives
//! built on top of this core (a full mutex, condition variable, event
//! queue, mailbox, memory pool, ...) are deliberately out of scope — they
//! are external collaborators reached only through the [`state::Port`]
//! trait this crate asks its host to implement.
#![cfg_attr(not(test), no_std)]

pub mod error;
pub mod klock;
pub mod list;
pub mod mutex;
pub mod semaphore;
pub mod state;
pub mod task;

pub use error::Event;
pub use state::{Kernel, Port, Tick, INFINITE};
pub use task::{Task, TaskState};
