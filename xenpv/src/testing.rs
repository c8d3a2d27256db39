//! Test support: an in-process hypervisor fake and std-thread host services
//!
//! `FakeXen` owns real copies of the hypervisor-shared pages (shared info,
//! store ring, grant region) and runs a miniature store daemon on its own
//! thread, so the substrate's ring codec, event demultiplexing and
//! suspend/resume paths are exercised against genuine shared memory rather
//! than mocks of themselves.

use {
    crate::{
        events::{DispatchOutcome, EventChannel},
        hypervisor::{Error, EventChannelOp, Hypervisor, SuspendOutcome},
        system::{Priority, System, WorkItem},
        xenbus::XenStoreClient,
    },
    core::{
        cell::{Cell, UnsafeCell},
        convert::TryInto,
        mem::MaybeUninit,
        ptr::{self, NonNull},
        sync::atomic::{fence, AtomicU32, AtomicU64, Ordering},
    },
    std::{
        boxed::Box,
        collections::BTreeMap,
        format,
        string::{String, ToString},
        sync::{Arc, Condvar, Mutex, Weak},
        thread,
        time::{Duration, Instant},
        vec::Vec,
    },
    xenpv_sys::{
        grant_entry_v1, shared_info, xenstore_domain_interface, xsd_sockmsg_type_XS_DIRECTORY,
        xsd_sockmsg_type_XS_ERROR, xsd_sockmsg_type_XS_MKDIR, xsd_sockmsg_type_XS_READ,
        xsd_sockmsg_type_XS_RM, xsd_sockmsg_type_XS_TRANSACTION_END,
        xsd_sockmsg_type_XS_TRANSACTION_START, xsd_sockmsg_type_XS_UNWATCH,
        xsd_sockmsg_type_XS_WATCH, xsd_sockmsg_type_XS_WATCH_EVENT, xsd_sockmsg_type_XS_WRITE,
        XENSTORE_RING_SIZE,
    },
};

/// Port the fake store daemon listens on
pub const STORE_PORT: u32 = 2;

/// First port handed out by the allocating event channel operations
const FIRST_DYNAMIC_PORT: u32 = 16;

/// Frames the fake hypervisor is willing to back the grant table with
const MAX_GRANT_FRAMES: u32 = 32;

const GRANT_REGION_ENTRIES: usize =
    MAX_GRANT_FRAMES as usize * crate::memory::PAGE_SIZE / core::mem::size_of::<grant_entry_v1>();

const HEADER_SIZE: usize = 16;

/// Spin on `cond` with a hard deadline, for tests waiting on async work
pub fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::yield_now();
    }
}

struct DaemonState {
    contents: BTreeMap<String, String>,
    /// Registered watches as `(path, token)` pairs
    watches: Vec<(String, String)>,
    next_port: u32,
    next_transaction: u32,
    force_eagain: bool,
    force_error: Option<String>,
    sends: Vec<u32>,
    closed: Vec<u32>,
    map_order: Vec<u32>,
    upcall_vector: Option<u8>,
    suspends: u32,
}

/// In-process hypervisor: shared pages plus a store daemon thread
pub struct FakeXen {
    shared: Box<UnsafeCell<shared_info>>,
    ring: Box<UnsafeCell<xenstore_domain_interface>>,
    grants: Box<[UnsafeCell<grant_entry_v1>]>,
    state: Mutex<DaemonState>,
    /// Counter of store notifications, woken through `signal_cv`
    signal: Mutex<u64>,
    signal_cv: Condvar,
    /// Serializes daemon ring access against the suspend-time ring reset
    ring_lock: Mutex<()>,
    /// Invoked after the daemon publishes data, emulating the upcall
    upcall: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    daemon_id: Mutex<Option<thread::ThreadId>>,
}

unsafe impl Send for FakeXen {}
unsafe impl Sync for FakeXen {}

fn zeroed<T>() -> T {
    // shared-page structs are plain bitmaps and cursors; all-zero is valid
    unsafe { MaybeUninit::zeroed().assume_init() }
}

impl FakeXen {
    /// Creates the fake and starts its store daemon
    pub fn new() -> Arc<Self> {
        let grants = (0..GRANT_REGION_ENTRIES)
            .map(|_| {
                UnsafeCell::new(grant_entry_v1 {
                    flags: 0,
                    domid: 0,
                    frame: 0,
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let fake = Arc::new(Self {
            shared: Box::new(UnsafeCell::new(zeroed())),
            ring: Box::new(UnsafeCell::new(zeroed())),
            grants,
            state: Mutex::new(DaemonState {
                contents: BTreeMap::new(),
                watches: Vec::new(),
                next_port: FIRST_DYNAMIC_PORT,
                next_transaction: 1,
                force_eagain: false,
                force_error: None,
                sends: Vec::new(),
                closed: Vec::new(),
                map_order: Vec::new(),
                upcall_vector: None,
                suspends: 0,
            }),
            signal: Mutex::new(0),
            signal_cv: Condvar::new(),
            ring_lock: Mutex::new(()),
            upcall: Mutex::new(None),
            daemon_id: Mutex::new(None),
        });

        let weak = Arc::downgrade(&fake);
        thread::spawn(move || daemon(weak));
        fake
    }

    /// Install the interrupt emulation run after the daemon publishes data
    pub fn set_upcall(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.upcall.lock().unwrap() = Some(Box::new(hook));
    }

    /// Mark `port` pending in the shared bitmaps, as the hypervisor would
    pub fn raise(&self, port: usize) {
        let si = self.shared.get();
        unsafe {
            word_at(ptr::addr_of!((*si).evtchn_pending[port / 64]))
                .fetch_or(1u64 << (port % 64), Ordering::SeqCst);
            word_at(ptr::addr_of!((*si).vcpu_info[0].evtchn_pending_sel))
                .fetch_or(1u64 << (port / 64), Ordering::SeqCst);
            ptr::write_volatile(
                ptr::addr_of_mut!((*si).vcpu_info[0].evtchn_upcall_pending),
                1,
            );
        }
    }

    /// Whether `port` is currently marked pending
    pub fn pending(&self, port: usize) -> bool {
        let si = self.shared.get();
        let word =
            unsafe { word_at(ptr::addr_of!((*si).evtchn_pending[port / 64])) }.load(Ordering::SeqCst);
        word & (1u64 << (port % 64)) != 0
    }

    /// Ports notified via `EVTCHNOP_send`, in order
    pub fn sends(&self) -> Vec<u32> {
        self.state.lock().unwrap().sends.clone()
    }

    /// Grant frame indices in the order they were mapped
    pub fn grant_map_order(&self) -> Vec<u32> {
        self.state.lock().unwrap().map_order.clone()
    }

    /// Raw copy of a live grant entry
    pub fn grant_entry(&self, reference: u32) -> grant_entry_v1 {
        unsafe { ptr::read_volatile(self.grants[reference as usize].get()) }
    }

    /// Overwrite the live grant region, as a domain reload would
    pub fn scramble_grants(&self) {
        for cell in self.grants.iter() {
            unsafe {
                ptr::write_volatile(
                    cell.get(),
                    grant_entry_v1 {
                        flags: 0xdead,
                        domid: 0xaa,
                        frame: 0x5555_5555,
                    },
                )
            };
        }
    }

    /// Upcall vector currently registered, if any
    pub fn upcall_vector(&self) -> Option<u8> {
        self.state.lock().unwrap().upcall_vector
    }

    /// Times the suspend hypercall has been issued
    pub fn suspend_calls(&self) -> u32 {
        self.state.lock().unwrap().suspends
    }

    /// Seed a store key directly, bypassing the wire
    pub fn daemon_put(&self, path: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .contents
            .insert(path.to_string(), value.to_string());
    }

    /// Read a store key directly, bypassing the wire
    pub fn daemon_get(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().contents.get(path).cloned()
    }

    /// Number of watches currently registered with the daemon
    pub fn daemon_watches(&self) -> usize {
        self.state.lock().unwrap().watches.len()
    }

    /// Thread the daemon consumes and produces ring data on
    pub fn daemon_thread(&self) -> Option<thread::ThreadId> {
        *self.daemon_id.lock().unwrap()
    }

    /// Make the next transaction end fail with `EAGAIN`
    pub fn force_transaction_conflict(&self) {
        self.state.lock().unwrap().force_eagain = true;
    }

    /// Make the next transaction end fail with an arbitrary error string
    pub fn force_transaction_error(&self, error: &str) {
        self.state.lock().unwrap().force_error = Some(error.to_string());
    }

    fn ring_ptr(&self) -> *mut xenstore_domain_interface {
        self.ring.get()
    }

    fn kick_daemon(&self) {
        let mut pending = self.signal.lock().unwrap();
        *pending += 1;
        self.signal_cv.notify_one();
    }

    /// Publish pending store data to the guest: mark the port and run the
    /// registered upcall, exactly as the injected interrupt would
    fn deliver_store_event(&self) {
        self.raise(STORE_PORT as usize);
        let upcall = self.upcall.lock().unwrap();
        if let Some(hook) = upcall.as_ref() {
            hook();
        }
    }

    /// Drain and handle every complete request on the ring
    fn process_requests(&self) {
        loop {
            let intf = self.ring_ptr();
            let req_prod = unsafe { index_at(ptr::addr_of!((*intf).req_prod)) };
            let req_cons = unsafe { index_at(ptr::addr_of!((*intf).req_cons)) };

            let prod = req_prod.load(Ordering::Acquire);
            let cons = req_cons.load(Ordering::Relaxed);
            let avail = prod.wrapping_sub(cons) as usize;
            if avail < HEADER_SIZE {
                return;
            }
            fence(Ordering::Acquire);

            let mut header = [0u8; HEADER_SIZE];
            self.copy_from_req(&mut header, cons);
            let kind = u32::from_ne_bytes(header[0..4].try_into().unwrap());
            let req_id = u32::from_ne_bytes(header[4..8].try_into().unwrap());
            let tx_id = u32::from_ne_bytes(header[8..12].try_into().unwrap());
            let len = u32::from_ne_bytes(header[12..16].try_into().unwrap()) as usize;

            // the client may still be writing the payload; wait for all of it
            if avail < HEADER_SIZE + len {
                return;
            }
            let mut payload = std::vec![0u8; len];
            self.copy_from_req(&mut payload, cons.wrapping_add(HEADER_SIZE as u32));
            req_cons.store(
                cons.wrapping_add((HEADER_SIZE + len) as u32),
                Ordering::Release,
            );

            for (reply_kind, reply_tx, body) in self.handle(kind, tx_id, &payload) {
                self.send_reply(reply_kind, req_id, reply_tx, &body);
            }
        }
    }

    /// One request in, one reply out, plus any watch events it triggered
    fn handle(&self, kind: u32, tx_id: u32, payload: &[u8]) -> Vec<(u32, u32, Vec<u8>)> {
        let mut state = self.state.lock().unwrap();
        let mut replies = Vec::new();
        #[allow(non_upper_case_globals)]
        match kind {
            xsd_sockmsg_type_XS_READ => {
                let path = cstr(payload, 0);
                let value = state.contents.get(&path).cloned().unwrap_or_default();
                replies.push((kind, tx_id, value.into_bytes()));
            }
            xsd_sockmsg_type_XS_WRITE => {
                let path = cstr(payload, 0);
                let value = String::from_utf8_lossy(&payload[path.len() + 1..]).into_owned();
                state.contents.insert(path.clone(), value);
                replies.push((kind, tx_id, b"OK\0".to_vec()));
                for (watched, token) in &state.watches {
                    if path == *watched || path.starts_with(&format!("{}/", watched)) {
                        let mut body = path.clone().into_bytes();
                        body.push(0);
                        body.extend_from_slice(token.as_bytes());
                        body.push(0);
                        replies.push((xsd_sockmsg_type_XS_WATCH_EVENT, 0, body));
                    }
                }
            }
            xsd_sockmsg_type_XS_DIRECTORY => {
                let path = cstr(payload, 0);
                let prefix = format!("{}/", path);
                let mut body = Vec::new();
                let mut last = String::new();
                for key in state.contents.keys() {
                    if let Some(rest) = key.strip_prefix(&prefix) {
                        let child = rest.split('/').next().unwrap_or(rest);
                        if child != last {
                            last = child.to_string();
                            body.extend_from_slice(child.as_bytes());
                            body.push(0);
                        }
                    }
                }
                replies.push((kind, tx_id, body));
            }
            xsd_sockmsg_type_XS_MKDIR => {
                let path = cstr(payload, 0);
                state.contents.entry(path).or_default();
                replies.push((kind, tx_id, b"OK\0".to_vec()));
            }
            xsd_sockmsg_type_XS_RM => {
                let path = cstr(payload, 0);
                let prefix = format!("{}/", path);
                let existed = state
                    .contents
                    .keys()
                    .any(|k| *k == path || k.starts_with(&prefix));
                if existed {
                    state
                        .contents
                        .retain(|k, _| *k != path && !k.starts_with(&prefix));
                    replies.push((kind, tx_id, b"OK\0".to_vec()));
                } else {
                    replies.push((xsd_sockmsg_type_XS_ERROR, tx_id, b"ENOENT\0".to_vec()));
                }
            }
            xsd_sockmsg_type_XS_WATCH => {
                let path = cstr(payload, 0);
                let token = cstr(payload, path.len() + 1);
                state.watches.push((path, token));
                replies.push((kind, tx_id, b"OK\0".to_vec()));
            }
            xsd_sockmsg_type_XS_UNWATCH => {
                let path = cstr(payload, 0);
                let token = cstr(payload, path.len() + 1);
                state.watches.retain(|(p, t)| !(*p == path && *t == token));
                replies.push((kind, tx_id, b"OK\0".to_vec()));
            }
            xsd_sockmsg_type_XS_TRANSACTION_START => {
                let id = state.next_transaction;
                state.next_transaction += 1;
                replies.push((kind, tx_id, format!("{}\0", id).into_bytes()));
            }
            xsd_sockmsg_type_XS_TRANSACTION_END => {
                if let Some(error) = state.force_error.take() {
                    replies.push((
                        xsd_sockmsg_type_XS_ERROR,
                        tx_id,
                        format!("{}\0", error).into_bytes(),
                    ));
                } else if state.force_eagain {
                    state.force_eagain = false;
                    replies.push((xsd_sockmsg_type_XS_ERROR, tx_id, b"EAGAIN\0".to_vec()));
                } else {
                    replies.push((kind, tx_id, b"OK\0".to_vec()));
                }
            }
            _ => {
                replies.push((xsd_sockmsg_type_XS_ERROR, tx_id, b"EINVAL\0".to_vec()));
            }
        }
        replies
    }

    /// Stream one message onto the response ring, delivering the upcall as
    /// space runs out so the guest drains it
    fn send_reply(&self, kind: u32, req_id: u32, tx_id: u32, body: &[u8]) {
        let mut message = Vec::with_capacity(HEADER_SIZE + body.len());
        message.extend_from_slice(&kind.to_ne_bytes());
        message.extend_from_slice(&req_id.to_ne_bytes());
        message.extend_from_slice(&tx_id.to_ne_bytes());
        message.extend_from_slice(&(body.len() as u32).to_ne_bytes());
        message.extend_from_slice(body);

        let intf = self.ring_ptr();
        let rsp_prod = unsafe { index_at(ptr::addr_of!((*intf).rsp_prod)) };
        let rsp_cons = unsafe { index_at(ptr::addr_of!((*intf).rsp_cons)) };

        let mut prod = rsp_prod.load(Ordering::Relaxed);
        let mut remaining = &message[..];
        while !remaining.is_empty() {
            let cons = rsp_cons.load(Ordering::Acquire);
            let free = XENSTORE_RING_SIZE - prod.wrapping_sub(cons);
            if free == 0 {
                self.deliver_store_event();
                thread::yield_now();
                continue;
            }
            let offset = (prod & (XENSTORE_RING_SIZE - 1)) as usize;
            let run = remaining.len().min(free as usize).min(
                XENSTORE_RING_SIZE as usize - offset,
            );
            unsafe {
                ptr::copy_nonoverlapping(
                    remaining.as_ptr(),
                    (ptr::addr_of_mut!((*intf).rsp) as *mut u8).add(offset),
                    run,
                );
            }
            prod = prod.wrapping_add(run as u32);
            remaining = &remaining[run..];
            fence(Ordering::SeqCst);
            rsp_prod.store(prod, Ordering::Release);
        }
        self.deliver_store_event();
    }

    fn copy_from_req(&self, dst: &mut [u8], cons: u32) {
        let intf = self.ring_ptr();
        let offset = (cons & (XENSTORE_RING_SIZE - 1)) as usize;
        let first = dst.len().min(XENSTORE_RING_SIZE as usize - offset);
        let ring = unsafe { ptr::addr_of!((*intf).req) as *const u8 };
        unsafe {
            ptr::copy_nonoverlapping(ring.add(offset), dst.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(ring, dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }
}

fn daemon(weak: Weak<FakeXen>) {
    loop {
        let fake = match weak.upgrade() {
            Some(fake) => fake,
            None => return,
        };
        fake.daemon_id
            .lock()
            .unwrap()
            .get_or_insert_with(|| thread::current().id());
        {
            let mut pending = fake.signal.lock().unwrap();
            if *pending == 0 {
                let (woken, _) = fake
                    .signal_cv
                    .wait_timeout(pending, Duration::from_millis(10))
                    .unwrap();
                pending = woken;
            }
            *pending = 0;
        }
        let _ring = fake.ring_lock.lock().unwrap();
        fake.process_requests();
    }
}

/// Extract the NUL-terminated string starting at `offset`
fn cstr(payload: &[u8], offset: usize) -> String {
    let rest = &payload[offset.min(payload.len())..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    String::from_utf8_lossy(&rest[..end]).into_owned()
}

fn word_at(field: *const u64) -> &'static AtomicU64 {
    unsafe { &*(field as *const AtomicU64) }
}

unsafe fn index_at(field: *const u32) -> &'static AtomicU32 {
    &*(field as *const AtomicU32)
}

impl Hypervisor for FakeXen {
    fn event_channel_op(&self, op: EventChannelOp) -> Result<u32, Error> {
        let mut state = self.state.lock().unwrap();
        match op {
            EventChannelOp::Send { port } => {
                state.sends.push(port);
                drop(state);
                if port == STORE_PORT {
                    self.kick_daemon();
                }
                Ok(0)
            }
            EventChannelOp::AllocUnbound { .. } | EventChannelOp::BindIpi { .. } => {
                let port = state.next_port;
                state.next_port += 1;
                Ok(port)
            }
            EventChannelOp::Close { port } => {
                state.closed.push(port);
                Ok(0)
            }
        }
    }

    fn grant_query_size(&self) -> Result<(u32, u32), Error> {
        Ok((4, MAX_GRANT_FRAMES))
    }

    fn map_grant_frame(&self, index: u32) -> Result<(), Error> {
        if index >= MAX_GRANT_FRAMES {
            return Err(Error::Status(-1));
        }
        self.state.lock().unwrap().map_order.push(index);
        Ok(())
    }

    fn grant_table(&self) -> NonNull<grant_entry_v1> {
        NonNull::new(self.grants.as_ptr() as *mut grant_entry_v1).expect("grant region")
    }

    fn shared_info(&self) -> NonNull<shared_info> {
        NonNull::new(self.shared.get()).expect("shared info page")
    }

    fn store_interface(&self) -> NonNull<xenstore_domain_interface> {
        NonNull::new(self.ring.get()).expect("store ring page")
    }

    fn store_port(&self) -> u32 {
        STORE_PORT
    }

    fn set_event_upcall(&self, vector: Option<u8>) -> Result<(), Error> {
        self.state.lock().unwrap().upcall_vector = vector;
        Ok(())
    }

    fn yield_cpu(&self) {
        thread::yield_now();
    }

    /// The guest "comes back" immediately: daemon state is reset the way a
    /// migration target would present it (fresh ring, no watches, garbage in
    /// the previously mapped grant region)
    fn suspend(&self) -> Result<SuspendOutcome, Error> {
        {
            let mut state = self.state.lock().unwrap();
            state.suspends += 1;
            state.watches.clear();
        }
        self.scramble_grants();
        let _ring = self.ring_lock.lock().unwrap();
        unsafe {
            let intf = self.ring_ptr();
            ptr::write_volatile(ptr::addr_of_mut!((*intf).req_cons), 0);
            ptr::write_volatile(ptr::addr_of_mut!((*intf).req_prod), 0);
            ptr::write_volatile(ptr::addr_of_mut!((*intf).rsp_cons), 0);
            ptr::write_volatile(ptr::addr_of_mut!((*intf).rsp_prod), 0);
        }
        Ok(SuspendOutcome::Resumed)
    }
}

std::thread_local! {
    static PRIORITY: Cell<Priority> = Cell::new(Priority::Passive);
    static INTERRUPTS: Cell<bool> = Cell::new(true);
    static CPU: Cell<usize> = Cell::new(0);
}

/// [`System`] over std threads: work items and per-CPU pins become threads,
/// priority and interrupt state are thread-local records
pub struct ThreadSystem {
    cpus: usize,
}

impl ThreadSystem {
    /// Creates the system with a fixed CPU count
    pub fn new(cpus: usize) -> Self {
        Self { cpus }
    }
}

impl System for ThreadSystem {
    fn cpu_count(&self) -> usize {
        self.cpus
    }

    fn current_cpu(&self) -> usize {
        CPU.with(|cpu| cpu.get())
    }

    fn run_on_cpu(&self, cpu: usize, item: WorkItem) {
        thread::spawn(move || {
            CPU.with(|current| current.set(cpu));
            item();
        });
    }

    fn queue_work(&self, item: WorkItem) {
        thread::spawn(item);
    }

    fn raise_priority(&self, to: Priority) -> Priority {
        PRIORITY.with(|priority| priority.replace(to))
    }

    fn restore_priority(&self, previous: Priority) {
        PRIORITY.with(|priority| priority.set(previous));
    }

    fn disable_interrupts(&self) -> bool {
        INTERRUPTS.with(|interrupts| interrupts.replace(false))
    }

    fn restore_interrupts(&self, were_enabled: bool) {
        INTERRUPTS.with(|interrupts| interrupts.set(were_enabled));
    }

    fn relax(&self) {
        thread::yield_now();
    }
}

/// Fully wired test fixture: fake hypervisor, thread system, live event
/// channels with the upcall hook installed
pub struct Harness {
    pub xen: Arc<FakeXen>,
    pub system: Arc<ThreadSystem>,
    pub events: Arc<EventChannel>,
}

impl Harness {
    /// Builds the fixture and initialises event dispatch
    pub fn new(cpus: usize) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let xen = FakeXen::new();
        let system = Arc::new(ThreadSystem::new(cpus));
        let events = Arc::new(EventChannel::new(xen.clone(), system.clone()));
        events.init().expect("event init");

        let hooked = Arc::downgrade(&events);
        xen.set_upcall(move || {
            if let Some(events) = hooked.upgrade() {
                if events.dispatch(0) == DispatchOutcome::WorkDeferred {
                    events.run_deferred();
                }
            }
        });
        Harness {
            xen,
            system,
            events,
        }
    }

    /// Connect a store client over the fixture
    pub fn store_client(&self) -> Arc<XenStoreClient> {
        XenStoreClient::init(self.xen.clone(), self.system.clone(), self.events.clone())
            .expect("store client init")
    }

    /// Run one dispatch pass as the injected interrupt would
    pub fn deliver(&self) {
        if self.events.dispatch(0) == DispatchOutcome::WorkDeferred {
            self.events.run_deferred();
        }
    }
}
