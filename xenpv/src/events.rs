//! Interface to Xen event channels
//!
//! An event channel is a virtual interrupt line identified by a small port
//! number. The hypervisor marks pending ports in a two-level bitmap on the
//! shared info page; [`EventChannel::dispatch`] demultiplexes that bitmap
//! into per-port actions registered with the `bind` family. Actions are held
//! in a fixed table and invoked through bare function pointers, so the
//! dispatch path never allocates.

use {
    crate::{
        hypervisor::{self, EventChannelOp, Hypervisor},
        system::System,
    },
    alloc::sync::Arc,
    bitflags::bitflags,
    core::{
        cell::UnsafeCell,
        ptr,
        sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    },
    displaydoc::Display,
    xenpv_sys::{domid_t, evtchn_port_t, MAX_VIRT_CPUS},
};

/// Number of event channel ports
pub const NR_EVENTS: usize = 1024;

/// Interrupt vector the hypervisor injects when events are pending
///
/// The embedder routes this vector to [`EventChannel::dispatch`].
pub const UPCALL_VECTOR: u8 = 0xf3;

const WORDS: usize = NR_EVENTS / 64;

const PORT_UNSET: usize = usize::MAX;

bitflags! {
    /// Modifiers applied when binding a port
    pub struct BindFlags: u8 {
        /// Skip this action during the suspend broadcast walk
        const NO_SUSPEND = 1;
    }
}

/// Callback invoked when a bound port fires
pub type EventHandler = fn(usize, *mut ());

/// How a bound port's callback is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ActionKind {
    /// No binding
    Empty = 0,
    /// Bind in progress; fields are being populated
    Binding = 1,
    /// Callback runs inline at dispatch priority
    Normal = 2,
    /// Callback runs out of line via [`EventChannel::run_deferred`]
    Deferred = 3,
    /// Sets a bit in the per-CPU vector word instead of calling anything
    Irq = 4,
    /// Reserved broadcast port driving the suspend walk
    Suspend = 5,
}

impl ActionKind {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ActionKind::Binding,
            2 => ActionKind::Normal,
            3 => ActionKind::Deferred,
            4 => ActionKind::Irq,
            5 => ActionKind::Suspend,
            _ => ActionKind::Empty,
        }
    }
}

/// Default event handler
fn default_handler(port: usize, _data: *mut ()) {
    log::debug!("received event on port {}", port);
}

/// Action associated with an event port
///
/// `handler` and `context` are written only by the thread that owns the
/// `Empty -> Binding` transition and read only after observing a bound kind,
/// so the cells need no further synchronisation.
struct Action {
    kind: AtomicU8,
    flags: AtomicU8,
    vector: AtomicU8,
    count: AtomicU32,
    executing: AtomicU32,
    handler: UnsafeCell<EventHandler>,
    context: UnsafeCell<*mut ()>,
}

impl Action {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: Action = Action {
        kind: AtomicU8::new(ActionKind::Empty as u8),
        flags: AtomicU8::new(0),
        vector: AtomicU8::new(0),
        count: AtomicU32::new(0),
        executing: AtomicU32::new(0),
        handler: UnsafeCell::new(default_handler),
        context: UnsafeCell::new(ptr::null_mut()),
    };

    unsafe fn snapshot(&self) -> (EventHandler, *mut ()) {
        (*self.handler.get(), *self.context.get())
    }
}

/// Whether a dispatch pass completed all work inline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// All pending actions ran inline
    InlineComplete,
    /// Deferred or irq-style work was queued; the embedder must follow up
    /// with [`EventChannel::run_deferred`] at a lower priority
    WorkDeferred,
}

/// Event channel errors
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// port {0} is outside the event table
    PortOutOfRange(usize),
    /// port {0} is already bound
    AlreadyBound(usize),
    /// port {0} is not bound
    NotBound(usize),
    /// hypervisor refused the operation: {0}
    Hypervisor(hypervisor::Error),
}

impl From<hypervisor::Error> for Error {
    fn from(e: hypervisor::Error) -> Self {
        Error::Hypervisor(e)
    }
}

/// Per-port dispatch table over the shared pending/mask bitmaps
pub struct EventChannel {
    hypervisor: Arc<dyn Hypervisor>,
    system: Arc<dyn System>,
    actions: [Action; NR_EVENTS],
    /// Ports queued for out-of-line execution, one bit per port
    deferred: [AtomicU64; WORDS],
    /// Per-CPU pending words for irq-style actions, one bit per vector
    irq_pending: [AtomicU64; MAX_VIRT_CPUS],
    suspend_port: AtomicUsize,
}

// The action table is synchronised by the per-slot kind state machine and
// the shared-page words are only touched through atomic views.
unsafe impl Send for EventChannel {}
unsafe impl Sync for EventChannel {}

impl EventChannel {
    /// Creates the dispatch table; no hypervisor state is touched until
    /// [`EventChannel::init`]
    pub fn new(hypervisor: Arc<dyn Hypervisor>, system: Arc<dyn System>) -> Self {
        const DEFERRED_ZERO: AtomicU64 = AtomicU64::new(0);
        const IRQ_ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            hypervisor,
            system,
            actions: [Action::EMPTY; NR_EVENTS],
            deferred: [DEFERRED_ZERO; WORDS],
            irq_pending: [IRQ_ZERO; MAX_VIRT_CPUS],
            suspend_port: AtomicUsize::new(PORT_UNSET),
        }
    }

    /// Masks every port, clears pending state, registers the upcall vector
    /// and binds the inter-processor broadcast port
    pub fn init(&self) -> Result<(), Error> {
        // A previous life's broadcast port may still occupy its slot; the
        // hypervisor can hand the same number out again after a migration.
        let prior = self.suspend_port.swap(PORT_UNSET, Ordering::Relaxed);
        if prior != PORT_UNSET {
            let _ = self.unbind(prior);
        }

        for word in 0..64 {
            self.mask_word(word).store(!0, Ordering::SeqCst);
        }
        for word in 0..64 {
            self.pending_word(word).store(0, Ordering::SeqCst);
        }
        for vcpu in 0..MAX_VIRT_CPUS {
            self.pending_sel(vcpu).store(0, Ordering::SeqCst);
            unsafe {
                let vi = self.vcpu_info(vcpu);
                ptr::write_volatile(ptr::addr_of_mut!((*vi).evtchn_upcall_pending), 0);
                ptr::write_volatile(ptr::addr_of_mut!((*vi).evtchn_upcall_mask), 0);
            }
        }
        for word in &self.deferred {
            word.store(0, Ordering::SeqCst);
        }
        for word in &self.irq_pending {
            word.store(0, Ordering::SeqCst);
        }

        self.hypervisor.set_event_upcall(Some(UPCALL_VECTOR))?;

        let port = self
            .hypervisor
            .event_channel_op(EventChannelOp::BindIpi { vcpu: 0 })? as usize;
        self.bind_action(
            port,
            ActionKind::Suspend,
            default_handler,
            ptr::null_mut(),
            BindFlags::NO_SUSPEND,
            0,
        )?;
        self.suspend_port.store(port, Ordering::Release);
        log::debug!("event channels initialised, broadcast port {}", port);

        Ok(())
    }

    /// Bind an inline handler to an event channel port
    ///
    /// The callback runs at dispatch priority and must not block.
    pub fn bind(
        &self,
        port: usize,
        handler: EventHandler,
        context: *mut (),
        flags: BindFlags,
    ) -> Result<(), Error> {
        self.bind_action(port, ActionKind::Normal, handler, context, flags, 0)
    }

    /// Bind a handler that runs out of line via [`EventChannel::run_deferred`]
    pub fn bind_deferred(
        &self,
        port: usize,
        handler: EventHandler,
        context: *mut (),
        flags: BindFlags,
    ) -> Result<(), Error> {
        self.bind_action(port, ActionKind::Deferred, handler, context, flags, 0)
    }

    /// Bind a port that latches `vector` in the per-CPU pending word
    ///
    /// Consumers drain the word with [`EventChannel::take_irq_pending`].
    pub fn bind_irq(&self, port: usize, vector: u8, flags: BindFlags) -> Result<(), Error> {
        self.bind_action(port, ActionKind::Irq, default_handler, ptr::null_mut(), flags, vector)
    }

    /// Replace the broadcast port's notification callback
    ///
    /// The suspend orchestrator installs its wake-up here; the walk itself is
    /// built into dispatch.
    pub fn bind_suspend(&self, handler: EventHandler, context: *mut ()) -> Result<(), Error> {
        let port = self.suspend_port.load(Ordering::Acquire);
        if port == PORT_UNSET {
            return Err(Error::NotBound(PORT_UNSET));
        }
        self.unbind(port)?;
        self.bind_action(
            port,
            ActionKind::Suspend,
            handler,
            context,
            BindFlags::NO_SUSPEND,
            0,
        )
    }

    fn bind_action(
        &self,
        port: usize,
        kind: ActionKind,
        handler: EventHandler,
        context: *mut (),
        flags: BindFlags,
        vector: u8,
    ) -> Result<(), Error> {
        let action = self.action(port)?;

        action
            .kind
            .compare_exchange(
                ActionKind::Empty as u8,
                ActionKind::Binding as u8,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .map_err(|_| Error::AlreadyBound(port))?;

        unsafe {
            *action.handler.get() = handler;
            *action.context.get() = context;
        }
        action.vector.store(vector, Ordering::Relaxed);
        action.flags.store(flags.bits(), Ordering::Relaxed);
        action.count.store(0, Ordering::Relaxed);

        action.kind.store(kind as u8, Ordering::Release);
        self.unmask(port);

        Ok(())
    }

    /// Remove a port's binding
    ///
    /// Masks the port and flushes any queued or in-flight callback before
    /// returning, so the caller may free the context immediately afterwards.
    pub fn unbind(&self, port: usize) -> Result<(), Error> {
        let action = self.action(port)?;
        let kind = ActionKind::from_u8(action.kind.load(Ordering::Acquire));
        if kind == ActionKind::Empty || kind == ActionKind::Binding {
            return Err(Error::NotBound(port));
        }

        self.mask(port);
        action.kind.store(ActionKind::Empty as u8, Ordering::SeqCst);

        if kind == ActionKind::Deferred {
            self.deferred[port / 64].fetch_and(!(1u64 << (port % 64)), Ordering::SeqCst);
        }
        while action.executing.load(Ordering::SeqCst) != 0 {
            self.system.relax();
        }

        Ok(())
    }

    /// Set a port's bit in the shared mask bitmap, suppressing delivery
    pub fn mask(&self, port: usize) {
        if port < NR_EVENTS {
            self.mask_word(port / 64)
                .fetch_or(1u64 << (port % 64), Ordering::SeqCst);
        }
    }

    /// Clear a port's bit in the shared mask bitmap
    pub fn unmask(&self, port: usize) {
        if port < NR_EVENTS {
            self.mask_word(port / 64)
                .fetch_and(!(1u64 << (port % 64)), Ordering::SeqCst);
        }
    }

    /// Signal the remote end of a port
    pub fn notify(&self, port: usize) -> Result<(), Error> {
        self.hypervisor.event_channel_op(EventChannelOp::Send {
            port: port as evtchn_port_t,
        })?;
        Ok(())
    }

    /// Allocate a fresh port that `remote` may bind the other end of
    pub fn alloc_unbound(&self, remote: domid_t) -> Result<usize, Error> {
        let port = self
            .hypervisor
            .event_channel_op(EventChannelOp::AllocUnbound { remote })?;
        Ok(port as usize)
    }

    /// Release a port's hypervisor state
    pub fn close(&self, port: usize) -> Result<(), Error> {
        self.hypervisor.event_channel_op(EventChannelOp::Close {
            port: port as evtchn_port_t,
        })?;
        Ok(())
    }

    /// Number of times `port` has fired since it was bound
    pub fn event_count(&self, port: usize) -> u32 {
        match self.action(port) {
            Ok(action) => action.count.load(Ordering::Relaxed),
            Err(_) => 0,
        }
    }

    /// The inter-processor broadcast port bound at init, if any
    pub fn suspend_port(&self) -> Option<usize> {
        match self.suspend_port.load(Ordering::Acquire) {
            PORT_UNSET => None,
            port => Some(port),
        }
    }

    /// Demultiplex pending events for `vcpu`
    ///
    /// Runs at interrupt priority. Each pending bit is cleared before its
    /// action executes, so an event re-raised while its handler runs is
    /// delivered again rather than lost.
    pub fn dispatch(&self, vcpu: usize) -> DispatchOutcome {
        unsafe {
            let vi = self.vcpu_info(vcpu);
            ptr::write_volatile(ptr::addr_of_mut!((*vi).evtchn_upcall_pending), 0);
        }

        let mut deferred = false;
        loop {
            let mut sel = self.pending_sel(vcpu).swap(0, Ordering::AcqRel);
            if sel == 0 {
                break;
            }
            while sel != 0 {
                let word = sel.trailing_zeros() as usize;
                sel &= sel - 1;
                loop {
                    let pending = self.pending_word(word).load(Ordering::Acquire)
                        & !self.mask_word(word).load(Ordering::Acquire);
                    if pending == 0 {
                        break;
                    }
                    let bit = pending.trailing_zeros() as usize;
                    self.pending_word(word)
                        .fetch_and(!(1u64 << bit), Ordering::AcqRel);
                    let port = word * 64 + bit;
                    if port >= NR_EVENTS {
                        log::warn!("event on port {} beyond the action table", port);
                        continue;
                    }
                    deferred |= self.deliver(port, vcpu);
                }
            }
        }

        if deferred {
            DispatchOutcome::WorkDeferred
        } else {
            DispatchOutcome::InlineComplete
        }
    }

    fn deliver(&self, port: usize, vcpu: usize) -> bool {
        let action = &self.actions[port];
        action.count.fetch_add(1, Ordering::Relaxed);
        match ActionKind::from_u8(action.kind.load(Ordering::Acquire)) {
            ActionKind::Normal => {
                self.invoke_if(port, ActionKind::Normal);
                false
            }
            ActionKind::Deferred => {
                self.deferred[port / 64].fetch_or(1u64 << (port % 64), Ordering::SeqCst);
                true
            }
            ActionKind::Irq => {
                let vector = action.vector.load(Ordering::Relaxed);
                self.irq_pending[vcpu].fetch_or(1u64 << vector, Ordering::AcqRel);
                true
            }
            ActionKind::Suspend => self.suspend_broadcast(port, vcpu),
            ActionKind::Empty | ActionKind::Binding => {
                log::warn!("event on unbound port {}, dropped", port);
                false
            }
        }
    }

    /// Walk every bound port on behalf of the broadcast port: inline actions
    /// re-fire immediately, everything else is deferred, and the broadcast
    /// port's own callback runs last.
    fn suspend_broadcast(&self, sentinel: usize, vcpu: usize) -> bool {
        log::debug!("suspend broadcast on port {}", sentinel);
        let mut deferred = false;
        for port in 0..NR_EVENTS {
            if port == sentinel {
                continue;
            }
            let action = &self.actions[port];
            if action.flags.load(Ordering::Relaxed) & BindFlags::NO_SUSPEND.bits() != 0 {
                continue;
            }
            match ActionKind::from_u8(action.kind.load(Ordering::Acquire)) {
                ActionKind::Normal => {
                    action.count.fetch_add(1, Ordering::Relaxed);
                    self.invoke_if(port, ActionKind::Normal);
                }
                ActionKind::Deferred => {
                    action.count.fetch_add(1, Ordering::Relaxed);
                    self.deferred[port / 64].fetch_or(1u64 << (port % 64), Ordering::SeqCst);
                    deferred = true;
                }
                ActionKind::Irq => {
                    let vector = action.vector.load(Ordering::Relaxed);
                    self.irq_pending[vcpu].fetch_or(1u64 << vector, Ordering::AcqRel);
                    deferred = true;
                }
                _ => {}
            }
        }
        self.invoke_if(sentinel, ActionKind::Suspend);
        deferred
    }

    /// Run queued deferred callbacks; called by the embedder at a priority
    /// below dispatch whenever [`DispatchOutcome::WorkDeferred`] is returned
    pub fn run_deferred(&self) {
        for word in 0..WORDS {
            let mut bits = self.deferred[word].swap(0, Ordering::AcqRel);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                self.invoke_if(word * 64 + bit, ActionKind::Deferred);
            }
        }
    }

    /// Drain the irq-style pending word for `cpu`
    pub fn take_irq_pending(&self, cpu: usize) -> u64 {
        self.irq_pending[cpu].swap(0, Ordering::AcqRel)
    }

    /// Mask all delivery and tear down the upcall registration
    pub fn suspend(&self) -> Result<(), Error> {
        for word in 0..64 {
            self.mask_word(word).store(!0, Ordering::SeqCst);
        }
        for word in &self.deferred {
            word.store(0, Ordering::SeqCst);
        }
        for word in &self.irq_pending {
            word.store(0, Ordering::SeqCst);
        }
        self.hypervisor.set_event_upcall(None)?;
        Ok(())
    }

    /// Reinitialise after the hypervisor restored the guest
    pub fn resume(&self) -> Result<(), Error> {
        self.init()
    }

    fn invoke_if(&self, port: usize, expected: ActionKind) {
        let action = &self.actions[port];
        action.executing.fetch_add(1, Ordering::SeqCst);
        if ActionKind::from_u8(action.kind.load(Ordering::SeqCst)) == expected {
            let (handler, context) = unsafe { action.snapshot() };
            handler(port, context);
        }
        action.executing.fetch_sub(1, Ordering::Release);
    }

    fn action(&self, port: usize) -> Result<&Action, Error> {
        self.actions.get(port).ok_or(Error::PortOutOfRange(port))
    }

    unsafe fn vcpu_info(&self, vcpu: usize) -> *mut xenpv_sys::vcpu_info {
        ptr::addr_of_mut!((*self.hypervisor.shared_info().as_ptr()).vcpu_info[vcpu])
    }

    fn pending_sel(&self, vcpu: usize) -> &AtomicU64 {
        unsafe {
            let p = self.vcpu_info(vcpu);
            &*(ptr::addr_of!((*p).evtchn_pending_sel) as *const AtomicU64)
        }
    }

    fn pending_word(&self, word: usize) -> &AtomicU64 {
        unsafe {
            let si = self.hypervisor.shared_info().as_ptr();
            &*(ptr::addr_of!((*si).evtchn_pending[word]) as *const AtomicU64)
        }
    }

    fn mask_word(&self, word: usize) -> &AtomicU64 {
        unsafe {
            let si = self.hypervisor.shared_info().as_ptr();
            &*(ptr::addr_of!((*si).evtchn_mask[word]) as *const AtomicU64)
        }
    }
}
