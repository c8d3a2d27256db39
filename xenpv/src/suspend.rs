//! System-wide suspend/resume orchestration
//!
//! Sequences the store client, event channels and grant table through a
//! consistent freeze, parks every CPU with the rendezvous barrier, issues the
//! suspend hypercall from the leader, and restores the components in
//! dependency order when the hypervisor hands the guest back. Dom0 requests a
//! suspend either through the `control/shutdown` store key or by kicking the
//! event channel published at `device/suspend/event-channel`.

use {
    crate::{
        events::{self, BindFlags, EventChannel},
        grant_table::{self, GrantTable},
        hypervisor::{self, Hypervisor, SuspendOutcome},
        rendezvous::Rendezvous,
        system::System,
        xenbus::{self, XenStoreClient},
    },
    alloc::{
        boxed::Box,
        sync::{Arc, Weak},
        vec::Vec,
    },
    core::{
        ptr,
        sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering},
    },
    displaydoc::Display,
    spin::Mutex,
    xenpv_sys::XBT_NIL,
};

/// Store key dom0 writes to request shutdown-class transitions
pub const SHUTDOWN_PATH: &str = "control/shutdown";

/// Store key the suspend request channel is published under
pub const SUSPEND_CHANNEL_PATH: &str = "device/suspend/event-channel";

const PORT_UNSET: usize = usize::MAX;

/// Where the orchestrator currently is in the suspend cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SuspendState {
    /// No cycle in progress
    None = 0,
    /// A cycle has been accepted and device quiesce is under way
    Scheduled = 1,
    /// Everything is frozen; the hypercall is imminent or in progress
    Frozen = 2,
    /// The hypervisor handed the guest back; components are restoring
    Resuming = 3,
}

impl SuspendState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SuspendState::Scheduled,
            2 => SuspendState::Frozen,
            3 => SuspendState::Resuming,
            _ => SuspendState::None,
        }
    }
}

/// A device front-end that must pause around a suspend
///
/// `quiesce` is called before the world freezes and must leave the device
/// with no outstanding grants or channel traffic; `reconnect` is called once
/// the substrate is back up.
pub trait DeviceFrontend: Send + Sync {
    /// Stop issuing work and release transient shared state
    fn quiesce(&self);
    /// Re-establish rings and channels after a resume
    fn reconnect(&self);
}

/// Suspend orchestration errors
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum Error {
    /// a suspend cycle is already in progress
    AlreadyInProgress,
    /// store client failed to quiesce: {0}
    Store(xenbus::Error),
    /// event subsystem failed: {0}
    Events(events::Error),
    /// grant table failed: {0}
    Grants(grant_table::Error),
    /// guest state is undefined after the suspend hypercall
    Unrecoverable,
}

/// Outcome slot shared with the rendezvous leader
struct LeaderControl {
    orchestrator: *const SuspendOrchestrator,
    outcome: Mutex<Option<Result<SuspendOutcome, hypervisor::Error>>>,
}

fn suspend_leader(context: *mut ()) {
    // The control block lives on the initiator's stack and outlives the
    // rendezvous; every other CPU is parked while this runs.
    let control = unsafe { &*(context as *const LeaderControl) };
    let orchestrator = unsafe { &*control.orchestrator };
    orchestrator.grants.suspend();
    let outcome = orchestrator.hypervisor.suspend();
    *control.outcome.lock() = Some(outcome);
}

fn suspend_follower(_context: *mut ()) {
    log::debug!("parked for suspend");
}

fn suspend_event_handler(_port: usize, context: *mut ()) {
    let orchestrator = unsafe { &*(context as *const SuspendOrchestrator) };
    log::debug!("suspend requested via event channel");
    orchestrator.schedule();
}

fn shutdown_watch_handler(_path: &str, context: *mut ()) {
    let orchestrator = unsafe { &*(context as *const SuspendOrchestrator) };
    let value = match orchestrator.store.read(XBT_NIL, SHUTDOWN_PATH) {
        Ok(value) => value,
        Err(e) => {
            log::error!("error reading shutdown path: {}", e);
            return;
        }
    };
    log::debug!("shutdown value = {}", value);
    if value == "suspend" {
        orchestrator.schedule();
    }
}

/// Coordinator for the whole-guest suspend/resume cycle
pub struct SuspendOrchestrator {
    hypervisor: Arc<dyn Hypervisor>,
    system: Arc<dyn System>,
    events: Arc<EventChannel>,
    store: Arc<XenStoreClient>,
    grants: Arc<GrantTable>,
    rendezvous: Rendezvous,
    weak: Weak<SuspendOrchestrator>,
    state: AtomicU8,
    frontends: Mutex<Vec<Arc<dyn DeviceFrontend>>>,
    suspend_channel: AtomicUsize,
    suspend_context: AtomicPtr<()>,
}

impl SuspendOrchestrator {
    /// Builds the orchestrator over already-initialised components
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        system: Arc<dyn System>,
        events: Arc<EventChannel>,
        store: Arc<XenStoreClient>,
        grants: Arc<GrantTable>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            hypervisor,
            system: system.clone(),
            events,
            store,
            grants,
            rendezvous: Rendezvous::new(system),
            weak: weak.clone(),
            state: AtomicU8::new(SuspendState::None as u8),
            frontends: Mutex::new(Vec::new()),
            suspend_channel: AtomicUsize::new(PORT_UNSET),
            suspend_context: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Current position in the suspend cycle
    pub fn state(&self) -> SuspendState {
        SuspendState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attach a device front-end to the quiesce/reconnect walk
    pub fn register_frontend(&self, frontend: Arc<dyn DeviceFrontend>) {
        self.frontends.lock().push(frontend);
    }

    /// Publish a suspend request channel for dom0
    ///
    /// Allocates an unbound port, advertises it at
    /// [`SUSPEND_CHANNEL_PATH`] and arms it so a kick schedules the suspend
    /// sequence. Re-run automatically at the end of every cycle.
    pub fn connect(self: &Arc<Self>) -> Result<(), Error> {
        let previous = self.suspend_channel.swap(PORT_UNSET, Ordering::AcqRel);
        if previous != PORT_UNSET {
            let _ = self.events.unbind(previous);
        }
        let stale = self.suspend_context.swap(ptr::null_mut(), Ordering::AcqRel);
        if !stale.is_null() {
            unsafe { Arc::from_raw(stale as *const SuspendOrchestrator) };
        }

        let port = self.events.alloc_unbound(0).map_err(Error::Events)?;
        log::debug!("suspend event channel = {}", port);
        self.store
            .printf(XBT_NIL, SUSPEND_CHANNEL_PATH, format_args!("{}", port))
            .map_err(Error::Store)?;

        let context = Arc::into_raw(self.clone()) as *mut ();
        if let Err(e) = self.events.bind_deferred(
            port,
            suspend_event_handler,
            context,
            BindFlags::NO_SUSPEND,
        ) {
            unsafe { Arc::from_raw(context as *const SuspendOrchestrator) };
            return Err(Error::Events(e));
        }
        self.suspend_context.store(context, Ordering::Release);
        self.suspend_channel.store(port, Ordering::Release);
        Ok(())
    }

    /// Watch `control/shutdown` and schedule a suspend when dom0 asks for one
    pub fn watch_shutdown(self: &Arc<Self>) -> Result<(), Error> {
        let context = Arc::into_raw(self.clone()) as *mut ();
        self.store
            .add_watch(SHUTDOWN_PATH, shutdown_watch_handler, context)
            .map_err(|e| {
                unsafe { Arc::from_raw(context as *const SuspendOrchestrator) };
                Error::Store(e)
            })
    }

    /// Queue the suspend sequence as a work item
    ///
    /// The sequence tears down the machinery the caller may be running on
    /// (a watch callback, the store channel's dispatch), so it never runs
    /// inline.
    pub fn schedule(&self) {
        let weak = self.weak.clone();
        self.system.queue_work(Box::new(move || {
            if let Some(orchestrator) = weak.upgrade() {
                if let Err(e) = orchestrator.suspend_resume() {
                    log::error!("suspend failed: {}", e);
                }
            }
        }));
    }

    /// Run the full freeze / hypercall / restore cycle
    ///
    /// Refuses re-entry while a cycle is in progress. Failures before the
    /// hypercall unwind cleanly to [`SuspendState::None`]; failures after it
    /// are unrecoverable because the guest's view of hypervisor resources is
    /// gone.
    pub fn suspend_resume(&self) -> Result<(), Error> {
        if self
            .state
            .compare_exchange(
                SuspendState::None as u8,
                SuspendState::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::AlreadyInProgress);
        }
        log::debug!("suspending");
        let had_channel = self.suspend_channel.load(Ordering::Acquire) != PORT_UNSET;

        let frontends = self.frontends.lock().clone();
        for frontend in &frontends {
            frontend.quiesce();
        }

        if let Err(e) = self.store.suspend() {
            self.set_state(SuspendState::None);
            return Err(Error::Store(e));
        }
        if let Err(e) = self.events.suspend() {
            self.set_state(SuspendState::None);
            return Err(Error::Events(e));
        }
        self.set_state(SuspendState::Frozen);

        let control = LeaderControl {
            orchestrator: self,
            outcome: Mutex::new(None),
        };
        self.rendezvous.run(
            suspend_leader,
            suspend_follower,
            &control as *const _ as *mut (),
        );

        match control.outcome.into_inner() {
            Some(Ok(SuspendOutcome::Resumed)) => {}
            Some(Ok(SuspendOutcome::Cancelled)) => {
                log::debug!("suspend cancelled, restoring anyway")
            }
            Some(Err(e)) => {
                log::error!("suspend hypercall failed: {}", e);
                return Err(Error::Unrecoverable);
            }
            None => return Err(Error::Unrecoverable),
        }
        self.set_state(SuspendState::Resuming);

        self.grants.resume().map_err(|e| {
            log::error!("grant table restore failed: {}", e);
            Error::Unrecoverable
        })?;
        self.events.resume().map_err(|e| {
            log::error!("event channel restore failed: {}", e);
            Error::Unrecoverable
        })?;
        self.store.resume().map_err(|e| {
            log::error!("store reconnect failed: {}", e);
            Error::Unrecoverable
        })?;

        if had_channel {
            let this = self.weak.upgrade().ok_or(Error::Unrecoverable)?;
            this.connect().map_err(|e| {
                log::error!("suspend channel reconnect failed: {}", e);
                Error::Unrecoverable
            })?;
        }

        for frontend in &frontends {
            frontend.reconnect();
        }

        self.set_state(SuspendState::None);
        log::debug!("resume complete");
        Ok(())
    }

    fn set_state(&self, state: SuspendState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testing::{wait_until, Harness},
        core::sync::atomic::{AtomicU32, Ordering},
        std::{sync::Arc as StdArc, vec::Vec},
    };

    struct Rig {
        harness: Harness,
        store: StdArc<XenStoreClient>,
        grants: StdArc<GrantTable>,
        orchestrator: StdArc<SuspendOrchestrator>,
    }

    fn rig(cpus: usize) -> Rig {
        let harness = Harness::new(cpus);
        let store = harness.store_client();
        let grants = StdArc::new(GrantTable::init(harness.xen.clone(), 0).unwrap());
        let orchestrator = SuspendOrchestrator::new(
            harness.xen.clone(),
            harness.system.clone(),
            harness.events.clone(),
            store.clone(),
            grants.clone(),
        );
        Rig {
            harness,
            store,
            grants,
            orchestrator,
        }
    }

    #[derive(Default)]
    struct FrontendProbe {
        quiesced: AtomicU32,
        reconnected: AtomicU32,
        nested_result: Mutex<Option<Error>>,
        orchestrator: Mutex<Option<std::sync::Weak<SuspendOrchestrator>>>,
    }

    impl DeviceFrontend for FrontendProbe {
        fn quiesce(&self) {
            self.quiesced.fetch_add(1, Ordering::SeqCst);
            // re-entry during a cycle must be refused, not deadlock
            if let Some(weak) = self.orchestrator.lock().clone() {
                if let Some(orchestrator) = weak.upgrade() {
                    *self.nested_result.lock() = orchestrator.suspend_resume().err();
                }
            }
        }
        fn reconnect(&self) {
            self.reconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn full_cycle_freezes_and_restores_everything() {
        let rig = rig(2);
        let probe = StdArc::new(FrontendProbe::default());
        *probe.orchestrator.lock() = Some(StdArc::downgrade(&rig.orchestrator));
        rig.orchestrator.register_frontend(probe.clone());

        // state the cycle must carry across the hypercall
        let granted = rig
            .grants
            .grant_access(
                1,
                crate::memory::MachineFrameNumber(0x777),
                false,
                crate::grant_table::INVALID_GRANT_REF,
                crate::grant_table::grant_tag(*b"susp"),
            )
            .unwrap();
        rig.store.write(XBT_NIL, "device/vbd/0/state", "4").unwrap();
        let probe_watch: fn(&str, *mut ()) = |_, _| {};
        rig.store
            .add_watch("device/vbd/0", probe_watch, core::ptr::null_mut())
            .unwrap();
        assert_eq!(rig.harness.xen.daemon_watches(), 1);

        rig.orchestrator.suspend_resume().unwrap();

        assert_eq!(rig.orchestrator.state(), SuspendState::None);
        assert_eq!(rig.harness.xen.suspend_calls(), 1);
        assert_eq!(probe.quiesced.load(Ordering::SeqCst), 1);
        assert_eq!(probe.reconnected.load(Ordering::SeqCst), 1);
        assert_eq!(
            *probe.nested_result.lock(),
            Some(Error::AlreadyInProgress)
        );

        // watches were re-registered, store and grants are usable again
        assert_eq!(rig.harness.xen.daemon_watches(), 1);
        assert_eq!(rig.store.read(XBT_NIL, "device/vbd/0/state").unwrap(), "4");
        assert!(rig.grants.end_access(granted, false, crate::grant_table::grant_tag(*b"susp")));

        // and the whole cycle can run again
        rig.orchestrator.suspend_resume().unwrap();
        assert_eq!(rig.harness.xen.suspend_calls(), 2);
    }

    #[test]
    fn connect_publishes_the_channel_and_a_kick_schedules_suspend() {
        let rig = rig(2);
        rig.orchestrator.connect().unwrap();

        let advertised = rig
            .harness
            .xen
            .daemon_get(SUSPEND_CHANNEL_PATH)
            .expect("channel advertised");
        let port: usize = advertised.parse().unwrap();

        // dom0 kicks the channel; the deferred handler queues the sequence
        rig.harness.xen.raise(port);
        rig.harness.deliver();

        wait_until(|| rig.harness.xen.suspend_calls() == 1);
        wait_until(|| rig.orchestrator.state() == SuspendState::None);

        // the channel was re-advertised for the next cycle
        let readvertised = rig.harness.xen.daemon_get(SUSPEND_CHANNEL_PATH).unwrap();
        assert_ne!(readvertised, advertised);
    }

    #[test]
    fn shutdown_watch_triggers_only_on_suspend_value() {
        let rig = rig(2);
        rig.orchestrator.watch_shutdown().unwrap();

        rig.store.write(XBT_NIL, SHUTDOWN_PATH, "poweroff").unwrap();
        std::thread::sleep(core::time::Duration::from_millis(30));
        assert_eq!(rig.harness.xen.suspend_calls(), 0);

        rig.store.write(XBT_NIL, SHUTDOWN_PATH, "suspend").unwrap();
        wait_until(|| rig.harness.xen.suspend_calls() == 1);
        wait_until(|| rig.orchestrator.state() == SuspendState::None);

        // the watch itself survived the cycle
        assert!(rig.harness.xen.daemon_watches() >= 1);
    }

    #[test]
    fn grant_contents_survive_the_cycle_byte_for_byte() {
        let rig = rig(2);
        let tag = crate::grant_table::grant_tag(*b"gtst");
        let mut granted = Vec::new();
        for i in 0..4u32 {
            granted.push(
                rig.grants
                    .grant_access(
                        2,
                        crate::memory::MachineFrameNumber(0x9000 + i as usize),
                        i % 2 == 0,
                        crate::grant_table::INVALID_GRANT_REF,
                        tag,
                    )
                    .unwrap(),
            );
        }
        let snapshot: Vec<_> = granted
            .iter()
            .map(|&r| rig.harness.xen.grant_entry(r))
            .collect();

        rig.orchestrator.suspend_resume().unwrap();

        for (&reference, before) in granted.iter().zip(&snapshot) {
            assert_eq!(&rig.harness.xen.grant_entry(reference), before);
        }
        for reference in granted {
            assert!(rig.grants.end_access(reference, false, tag));
        }
    }
}
