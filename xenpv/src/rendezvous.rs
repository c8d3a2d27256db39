//! Stop-the-world CPU rendezvous
//!
//! Parks every CPU in a busy-wait at high priority with interrupts disabled
//! so one designated leader can act with provably no concurrent activity:
//! no CPU is mid-interrupt, mid-lock or touching a device while the leader
//! runs. Blocking primitives cannot express that guarantee, which is why the
//! barrier is built from atomic counters and spins only.

use {
    crate::system::{Priority, System},
    alloc::{boxed::Box, sync::Arc},
    core::sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Function run by the leader or the followers while the world is stopped
pub type RendezvousFn = fn(*mut ());

/// Shared control block carried by every CPU's work item
struct Barrier {
    cpus: usize,
    arrived: AtomicUsize,
    spinning: AtomicUsize,
    /// Cleared by the leader to release the parked followers
    hold: AtomicBool,
    complete: AtomicBool,
}

/// Cross-CPU barrier utility
pub struct Rendezvous {
    system: Arc<dyn System>,
}

impl Rendezvous {
    /// Creates a barrier utility over the embedder's CPU services
    pub fn new(system: Arc<dyn System>) -> Self {
        Self { system }
    }

    /// Run `leader` on CPU 0 with every other CPU parked
    ///
    /// Queues one pinned work item per CPU. Followers arrive, disable
    /// interrupts, raise to the barrier priority and spin; once all of them
    /// are provably parked the leader runs, releases them, and each follower
    /// runs `follower` on its way out. Returns after every CPU has left the
    /// barrier.
    ///
    /// `context` is forwarded to both functions; the caller keeps it alive
    /// until `run` returns.
    pub fn run(&self, leader: RendezvousFn, follower: RendezvousFn, context: *mut ()) {
        let cpus = self.system.cpu_count();
        let barrier = Arc::new(Barrier {
            cpus,
            arrived: AtomicUsize::new(0),
            spinning: AtomicUsize::new(0),
            hold: AtomicBool::new(true),
            complete: AtomicBool::new(false),
        });
        let context = context as usize;

        let previous = self.system.raise_priority(Priority::High);
        for cpu in 0..cpus {
            let barrier = barrier.clone();
            let system = self.system.clone();
            let work: Box<dyn FnOnce() + Send> = if cpu == 0 {
                Box::new(move || lead(&system, &barrier, leader, context))
            } else {
                Box::new(move || follow(&system, &barrier, follower, context))
            };
            self.system.run_on_cpu(cpu, work);
        }
        self.system.restore_priority(previous);

        while !barrier.complete.load(Ordering::Acquire) {
            self.system.relax();
        }
    }
}

fn lead(system: &Arc<dyn System>, barrier: &Barrier, leader: RendezvousFn, context: usize) {
    barrier.arrived.fetch_add(1, Ordering::AcqRel);
    while barrier.arrived.load(Ordering::Acquire) < barrier.cpus {
        system.relax();
    }
    // wait until every follower is pinned at the spin point
    while barrier.spinning.load(Ordering::Acquire) < barrier.cpus - 1 {
        system.relax();
    }

    let enabled = system.disable_interrupts();
    let previous = system.raise_priority(Priority::High);
    leader(context as *mut ());
    system.restore_priority(previous);
    system.restore_interrupts(enabled);

    barrier.hold.store(false, Ordering::Release);
    while barrier.spinning.load(Ordering::Acquire) > 0 {
        system.relax();
    }
    barrier.complete.store(true, Ordering::Release);
}

fn follow(system: &Arc<dyn System>, barrier: &Barrier, follower: RendezvousFn, context: usize) {
    barrier.arrived.fetch_add(1, Ordering::AcqRel);
    while barrier.arrived.load(Ordering::Acquire) < barrier.cpus {
        system.relax();
    }

    let enabled = system.disable_interrupts();
    let previous = system.raise_priority(Priority::High);
    barrier.spinning.fetch_add(1, Ordering::AcqRel);
    while barrier.hold.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }

    follower(context as *mut ());
    system.restore_priority(previous);
    system.restore_interrupts(enabled);
    barrier.spinning.fetch_sub(1, Ordering::AcqRel);
}
