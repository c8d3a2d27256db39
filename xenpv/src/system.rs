//! Host services the substrate borrows from its embedder
//!
//! The substrate never owns threads, interrupt plumbing or scheduling
//! priority; the embedding kernel or driver framework supplies them through
//! [`System`]. Implementations must tolerate calls from interrupt context for
//! everything except [`System::queue_work`] consumers, which always run at
//! passive priority.

use alloc::boxed::Box;

/// Deferred unit of work handed to the embedder for out-of-line execution
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling priority levels the substrate distinguishes
///
/// `Passive` is ordinary thread execution, `Dispatch` is the level event
/// callbacks run at, and `High` blocks all other activity on the CPU; only
/// the rendezvous barrier uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Ordinary preemptible execution
    Passive,
    /// Deferred-callback priority; interrupts still delivered
    Dispatch,
    /// Nothing else runs on this CPU
    High,
}

/// Scheduling, work-queue and interrupt services of the host
pub trait System: Send + Sync {
    /// Number of CPUs that participate in rendezvous barriers
    fn cpu_count(&self) -> usize;

    /// Index of the CPU the caller is currently running on
    fn current_cpu(&self) -> usize;

    /// Run `item` pinned to `cpu`, concurrently with the caller
    fn run_on_cpu(&self, cpu: usize, item: WorkItem);

    /// Queue `item` for execution at passive priority
    fn queue_work(&self, item: WorkItem);

    /// Raise the calling CPU to `to`, returning the previous priority
    fn raise_priority(&self, to: Priority) -> Priority;

    /// Return the calling CPU to `previous`
    fn restore_priority(&self, previous: Priority);

    /// Disable interrupt delivery on the calling CPU
    ///
    /// Returns whether interrupts were enabled beforehand, for
    /// [`System::restore_interrupts`].
    fn disable_interrupts(&self) -> bool;

    /// Restore interrupt delivery to its state before `disable_interrupts`
    fn restore_interrupts(&self, were_enabled: bool);

    /// Polite busy-wait hint; called inside bounded spin loops
    fn relax(&self);
}
