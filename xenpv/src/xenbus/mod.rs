//! XenStore client
//!
//! "The XenStore is a storage system shared between Xen guests. It is a
//! simple hierarchical storage system, maintained by Domain 0 and accessed
//! via a shared memory page and an event channel." - The Definitive Guide
//! to the Xen Hypervisor, Chapter 8
//!
//! Requests are serialized onto the shared ring under a mutex; exactly one
//! may be outstanding, so the single buffered reply is matched by protocol
//! order rather than request ID. Inbound traffic is consumed on the store
//! channel's deferred callback: replies wake the blocked requester, watch
//! events are re-dispatched through a work item because a watch callback may
//! itself issue requests and would deadlock on the ring-reading context.

use {
    crate::{
        events::{BindFlags, EventChannel},
        hypervisor::Hypervisor,
        system::System,
    },
    alloc::{
        boxed::Box,
        string::{String, ToString},
        sync::{Arc, Weak},
        vec::Vec,
    },
    arrayvec::ArrayString,
    core::{
        cmp, fmt,
        fmt::Write as _,
        ptr,
        sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering},
    },
    displaydoc::Display,
    spin::Mutex,
    xenpv_sys::{xenbus_transaction_t, xenstore_domain_interface, XBT_NIL, XENSTORE_RING_SIZE},
};

use wire::{Kind, MessageHeader, HEADER_SIZE};

mod wire;

pub use xenpv_sys::XBT_NIL as NIL_TRANSACTION;

/// Maximum number of concurrently registered watches
pub const MAX_WATCH_ENTRIES: usize = 128;

/// Longest accepted store path, matching the wire format's practical limit
pub const MAX_PATH: usize = 128;

/// Buffer bound for [`XenStoreClient::printf`] formatted values
pub const PRINTF_BUFFER: usize = 512;

/// Callback invoked when a watched path changes
///
/// Receives the fired path (possibly a sub-path of the registration) and the
/// context supplied to [`XenStoreClient::add_watch`]. Runs on a work item at
/// passive priority and may issue further store requests, but must not add
/// or remove watches: the watch table lock is held across the call.
pub type WatchHandler = fn(&str, *mut ());

/// XenStore client errors
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum Error {
    /// store replied with error `{0}`
    Store(String),
    /// message of {0} bytes exceeds the ring capacity
    MessageTooLarge(usize),
    /// path longer than the {0} byte limit
    PathTooLong(usize),
    /// formatted value exceeds the buffer
    ValueTooLong,
    /// all watch slots are in use
    WatchSlotsFull,
    /// an identical watch is already registered
    DuplicateWatch,
    /// no matching watch is registered
    UnknownWatch,
    /// store payload is not valid UTF-8
    Utf8,
    /// malformed reply: {0}
    Malformed(&'static str),
    /// the store channel is not connected
    NotConnected,
    /// event channel failure: {0}
    Events(crate::events::Error),
}

impl From<crate::events::Error> for Error {
    fn from(e: crate::events::Error) -> Self {
        Error::Events(e)
    }
}

#[derive(Clone, Copy)]
struct WatchEntry {
    path: ArrayString<MAX_PATH>,
    handler: WatchHandler,
    context: *mut (),
    count: u32,
    active: bool,
}

impl WatchEntry {
    fn empty() -> Self {
        Self {
            path: ArrayString::new(),
            handler: |_, _| {},
            context: ptr::null_mut(),
            count: 0,
            active: false,
        }
    }

    fn matches(&self, path: &str, handler: WatchHandler, context: *mut ()) -> bool {
        self.active
            && self.path.as_str() == path
            && self.handler as usize == handler as usize
            && self.context == context
    }
}

/// Reassembly state for a possibly fragmented inbound message
struct RxState {
    header: Option<MessageHeader>,
    body: Vec<u8>,
}

/// Client for the store daemon's request/reply and watch protocol
pub struct XenStoreClient {
    hypervisor: Arc<dyn Hypervisor>,
    system: Arc<dyn System>,
    events: Arc<EventChannel>,
    weak: Weak<XenStoreClient>,
    ring: AtomicPtr<xenstore_domain_interface>,
    port: AtomicUsize,
    connected: AtomicBool,
    /// Serializes requesters; at most one message is in flight
    request_lock: Mutex<()>,
    /// The single buffered non-watch reply
    reply: Mutex<Option<(MessageHeader, Vec<u8>)>>,
    reply_ready: AtomicBool,
    /// Ring-consumer state, taken at dispatch priority
    rx: Mutex<RxState>,
    watches: Mutex<Vec<WatchEntry>>,
    /// Context pointer handed to the event binding, reclaimed on disconnect
    bound_context: AtomicPtr<()>,
}

// Watch context pointers are owned by their registrants; everything else is
// interior-mutable behind locks and atomics.
unsafe impl Send for XenStoreClient {}
unsafe impl Sync for XenStoreClient {}

fn store_event_handler(_port: usize, context: *mut ()) {
    // The Arc reference backing `context` is held until unbind completes, so
    // the client outlives every invocation.
    let client = unsafe { &*(context as *const XenStoreClient) };
    client.service();
}

impl XenStoreClient {
    /// Creates the client and connects it to the store ring and channel
    pub fn init(
        hypervisor: Arc<dyn Hypervisor>,
        system: Arc<dyn System>,
        events: Arc<EventChannel>,
    ) -> Result<Arc<Self>, Error> {
        let client = Arc::new_cyclic(|weak| Self {
            hypervisor,
            system,
            events,
            weak: weak.clone(),
            ring: AtomicPtr::new(ptr::null_mut()),
            port: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            request_lock: Mutex::new(()),
            reply: Mutex::new(None),
            reply_ready: AtomicBool::new(false),
            rx: Mutex::new(RxState {
                header: None,
                body: Vec::new(),
            }),
            watches: Mutex::new(alloc::vec![WatchEntry::empty(); MAX_WATCH_ENTRIES]),
            bound_context: AtomicPtr::new(ptr::null_mut()),
        });
        client.connect()?;
        log::debug!("xenstore client connected");
        Ok(client)
    }

    /// Read a key's value
    ///
    /// An empty value comes back as an empty string; only a daemon error
    /// reply becomes an [`Error`].
    pub fn read(&self, transaction: xenbus_transaction_t, path: &str) -> Result<String, Error> {
        check_path(path)?;
        let (_, mut body) =
            self.request(Kind::Read, transaction, &[path.as_bytes(), b"\0"])?;
        if body.last() == Some(&0) {
            body.truncate(body.len() - 1);
        }
        String::from_utf8(body).map_err(|_| Error::Utf8)
    }

    /// Associate a value with a path
    pub fn write(
        &self,
        transaction: xenbus_transaction_t,
        path: &str,
        value: &str,
    ) -> Result<(), Error> {
        check_path(path)?;
        self.request(
            Kind::Write,
            transaction,
            &[path.as_bytes(), b"\0", value.as_bytes()],
        )?;
        Ok(())
    }

    /// Write a formatted value, bounded by [`PRINTF_BUFFER`]
    pub fn printf(
        &self,
        transaction: xenbus_transaction_t,
        path: &str,
        args: fmt::Arguments<'_>,
    ) -> Result<(), Error> {
        let mut value = ArrayString::<PRINTF_BUFFER>::new();
        value.write_fmt(args).map_err(|_| Error::ValueTooLong)?;
        self.write(transaction, path, value.as_str())
    }

    /// List the children of a directory node
    pub fn list(
        &self,
        transaction: xenbus_transaction_t,
        path: &str,
    ) -> Result<Vec<String>, Error> {
        check_path(path)?;
        let (_, body) =
            self.request(Kind::Directory, transaction, &[path.as_bytes(), b"\0"])?;
        body.split(|&byte| byte == 0)
            .filter(|name| !name.is_empty())
            .map(|name| {
                core::str::from_utf8(name)
                    .map(|s| s.to_string())
                    .map_err(|_| Error::Utf8)
            })
            .collect()
    }

    /// Remove a path and everything below it
    pub fn remove(&self, transaction: xenbus_transaction_t, path: &str) -> Result<(), Error> {
        check_path(path)?;
        self.request(Kind::Remove, transaction, &[path.as_bytes(), b"\0"])?;
        Ok(())
    }

    /// Create an empty directory node
    pub fn make_directory(
        &self,
        transaction: xenbus_transaction_t,
        path: &str,
    ) -> Result<(), Error> {
        check_path(path)?;
        self.request(Kind::MakeDirectory, transaction, &[path.as_bytes(), b"\0"])?;
        Ok(())
    }

    /// Open a transaction, returning its ID
    pub fn start_transaction(&self) -> Result<xenbus_transaction_t, Error> {
        // xenstored rejects zero-length messages; send a lone terminator
        let (_, mut body) = self.request(Kind::TransactionStart, XBT_NIL, &[b"\0"])?;
        if body.last() == Some(&0) {
            body.truncate(body.len() - 1);
        }
        core::str::from_utf8(&body)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or(Error::Malformed("transaction id"))
    }

    /// Close a transaction, committing unless `abort` is set
    ///
    /// Returns `Ok(true)` when the daemon reported a conflict and the whole
    /// transaction should be retried; any other error reply is a failure.
    pub fn end_transaction(
        &self,
        transaction: xenbus_transaction_t,
        abort: bool,
    ) -> Result<bool, Error> {
        let verdict: &[u8] = if abort { b"F\0" } else { b"T\0" };
        match self.request(Kind::TransactionEnd, transaction, &[verdict]) {
            Ok(_) => Ok(false),
            Err(Error::Store(ref text)) if text == "EAGAIN" => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Subscribe to changes at `path`
    ///
    /// The watch survives suspend/resume; `remove_watch` with the identical
    /// triple cancels it.
    pub fn add_watch(
        &self,
        path: &str,
        handler: WatchHandler,
        context: *mut (),
    ) -> Result<(), Error> {
        check_path(path)?;
        let slot = {
            let mut watches = self.watches.lock();
            if watches.iter().any(|e| e.matches(path, handler, context)) {
                return Err(Error::DuplicateWatch);
            }
            let slot = watches
                .iter()
                .position(|e| !e.active)
                .ok_or(Error::WatchSlotsFull)?;
            let entry = &mut watches[slot];
            entry.path = ArrayString::from(path).map_err(|_| Error::PathTooLong(MAX_PATH))?;
            entry.handler = handler;
            entry.context = context;
            entry.count = 0;
            entry.active = true;
            slot
        };

        if let Err(e) = self.send_watch_request(Kind::Watch, path, slot) {
            self.watches.lock()[slot].active = false;
            return Err(e);
        }
        Ok(())
    }

    /// Cancel the watch registered with the identical path/handler/context
    pub fn remove_watch(
        &self,
        path: &str,
        handler: WatchHandler,
        context: *mut (),
    ) -> Result<(), Error> {
        let slot = {
            let mut watches = self.watches.lock();
            let slot = watches
                .iter()
                .position(|e| e.matches(path, handler, context))
                .ok_or(Error::UnknownWatch)?;
            watches[slot].active = false;
            watches[slot].path.clear();
            slot
        };
        self.send_watch_request(Kind::Unwatch, path, slot)
    }

    /// Deregister every active watch on the wire and tear down the channel
    ///
    /// Watches must go first: one firing after the channel is gone would
    /// reference a binding that no longer exists. Entries stay marked active
    /// so `resume` can re-register them.
    pub fn suspend(&self) -> Result<(), Error> {
        for (slot, path) in self.active_watches() {
            self.send_watch_request(Kind::Unwatch, path.as_str(), slot)?;
        }
        self.disconnect()
    }

    /// Rebind the (possibly renumbered) store channel and re-register every
    /// still-active watch
    pub fn resume(&self) -> Result<(), Error> {
        self.connect()?;
        for (slot, path) in self.active_watches() {
            log::debug!("re-adding watch for path {}", path.as_str());
            self.send_watch_request(Kind::Watch, path.as_str(), slot)?;
        }
        Ok(())
    }

    /// Number of times the active watch on `path` has fired; test support
    #[cfg(test)]
    pub(crate) fn watch_count(&self, path: &str) -> u32 {
        self.watches
            .lock()
            .iter()
            .find(|e| e.active && e.path.as_str() == path)
            .map(|e| e.count)
            .unwrap_or(0)
    }

    fn active_watches(&self) -> Vec<(usize, ArrayString<MAX_PATH>)> {
        self.watches
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.active)
            .map(|(slot, e)| (slot, e.path))
            .collect()
    }

    fn send_watch_request(&self, kind: Kind, path: &str, slot: usize) -> Result<(), Error> {
        let mut token = ArrayString::<20>::new();
        write!(token, "{}", slot).map_err(|_| Error::ValueTooLong)?;
        self.request(
            kind,
            XBT_NIL,
            &[path.as_bytes(), b"\0", token.as_bytes(), b"\0"],
        )?;
        Ok(())
    }

    fn connect(&self) -> Result<(), Error> {
        let this = self.weak.upgrade().ok_or(Error::NotConnected)?;
        self.ring.store(
            self.hypervisor.store_interface().as_ptr(),
            Ordering::Release,
        );
        let port = self.hypervisor.store_port() as usize;
        self.port.store(port, Ordering::Release);

        let context = Arc::into_raw(this) as *mut ();
        if let Err(e) =
            self.events
                .bind_deferred(port, store_event_handler, context, BindFlags::NO_SUSPEND)
        {
            unsafe { Arc::from_raw(context as *const XenStoreClient) };
            return Err(e.into());
        }
        self.bound_context.store(context, Ordering::Release);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), Error> {
        self.connected.store(false, Ordering::Release);
        let port = self.port.load(Ordering::Acquire);
        self.events.unbind(port)?;
        // unbind flushed in-flight callbacks; the binding's reference drops
        let context = self
            .bound_context
            .swap(ptr::null_mut(), Ordering::AcqRel);
        if !context.is_null() {
            unsafe { Arc::from_raw(context as *const XenStoreClient) };
        }
        Ok(())
    }

    /// Write one message and block until its reply arrives
    fn request(
        &self,
        kind: Kind,
        transaction: xenbus_transaction_t,
        segments: &[&[u8]],
    ) -> Result<(MessageHeader, Vec<u8>), Error> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        let len: usize = segments.iter().map(|s| s.len()).sum();
        if HEADER_SIZE + len > XENSTORE_RING_SIZE as usize {
            return Err(Error::MessageTooLarge(HEADER_SIZE + len));
        }

        let guard = self.request_lock.lock();

        let header = MessageHeader {
            kind,
            request_id: 0,
            transaction_id: transaction,
            len: len as u32,
        };
        self.ring_write(&header.encode())?;
        for segment in segments {
            self.ring_write(segment)?;
        }

        // The single blocking point of the client: wait for the dispatcher
        // to buffer the one outstanding reply.
        while !self.reply_ready.load(Ordering::Acquire) {
            self.hypervisor.yield_cpu();
        }
        self.reply_ready.store(false, Ordering::Relaxed);
        let (header, body) = self
            .reply
            .lock()
            .take()
            .expect("reply signalled without a buffered message");
        drop(guard);

        if header.kind == Kind::Error {
            let mut body = body;
            if body.last() == Some(&0) {
                body.truncate(body.len() - 1);
            }
            let text = String::from_utf8(body).map_err(|_| Error::Utf8)?;
            return Err(Error::Store(text));
        }
        Ok((header, body))
    }

    /// Copy `data` onto the request ring in wrap-around chunks, spinning for
    /// space against the consumer cursor, then publish and notify
    fn ring_write(&self, data: &[u8]) -> Result<(), Error> {
        let intf = self.ring.load(Ordering::Acquire);
        let req_prod = ring_index(unsafe { ptr::addr_of!((*intf).req_prod) });
        let req_cons = ring_index(unsafe { ptr::addr_of!((*intf).req_cons) });

        let mut prod = req_prod.load(Ordering::Relaxed);
        let mut remaining = data;
        while !remaining.is_empty() {
            let cons = req_cons.load(Ordering::Acquire);
            let free = XENSTORE_RING_SIZE - prod.wrapping_sub(cons);
            if free == 0 {
                self.hypervisor.yield_cpu();
                continue;
            }
            let offset = mask_xenstore_idx(prod);
            let run = cmp::min(
                remaining.len(),
                cmp::min(free as usize, XENSTORE_RING_SIZE as usize - offset),
            );
            unsafe {
                ptr::copy_nonoverlapping(
                    remaining.as_ptr(),
                    (ptr::addr_of_mut!((*intf).req) as *mut u8).add(offset),
                    run,
                );
            }
            prod = prod.wrapping_add(run as u32);
            remaining = &remaining[run..];
        }

        // Remote must see the bytes before the index moves
        fence(Ordering::SeqCst);
        req_prod.store(prod, Ordering::Release);
        self.events.notify(self.port.load(Ordering::Acquire))?;
        Ok(())
    }

    /// Consume the response ring; runs on the store channel's deferred
    /// callback at dispatch priority
    fn service(&self) {
        let intf = self.ring.load(Ordering::Acquire);
        if intf.is_null() {
            return;
        }
        let rsp_prod = ring_index(unsafe { ptr::addr_of!((*intf).rsp_prod) });
        let rsp_cons = ring_index(unsafe { ptr::addr_of!((*intf).rsp_cons) });

        let mut rx = self.rx.lock();
        loop {
            let prod = rsp_prod.load(Ordering::Acquire);
            let cons = rsp_cons.load(Ordering::Relaxed);
            if prod == cons {
                break;
            }
            fence(Ordering::Acquire);

            let header = match rx.header {
                Some(header) => header,
                None => {
                    if prod.wrapping_sub(cons) < HEADER_SIZE as u32 {
                        break;
                    }
                    let mut raw = [0u8; HEADER_SIZE];
                    copy_from_ring(intf, &mut raw, cons);
                    rsp_cons.store(cons.wrapping_add(HEADER_SIZE as u32), Ordering::Release);
                    let header = MessageHeader::decode(&raw);
                    rx.body = Vec::with_capacity(header.len as usize);
                    rx.header = Some(header);
                    // room freed, let the daemon continue a fragmented write
                    self.notify_store();
                    continue;
                }
            };

            let avail = prod.wrapping_sub(cons) as usize;
            let remaining = header.len as usize - rx.body.len();
            let run = cmp::min(avail, remaining);
            if run > 0 {
                let start = rx.body.len();
                rx.body.resize(start + run, 0);
                copy_from_ring(intf, &mut rx.body[start..], cons);
                rsp_cons.store(cons.wrapping_add(run as u32), Ordering::Release);
                self.notify_store();
            }
            if rx.body.len() < header.len as usize {
                break;
            }

            let body = core::mem::take(&mut rx.body);
            rx.header = None;
            if header.kind == Kind::WatchEvent {
                self.dispatch_watch(body);
            } else {
                *self.reply.lock() = Some((header, body));
                self.reply_ready.store(true, Ordering::Release);
            }
        }
    }

    fn notify_store(&self) {
        if let Err(e) = self.events.notify(self.port.load(Ordering::Acquire)) {
            log::error!("store notify failed: {}", e);
        }
    }

    /// Hand a watch event to its callback via a work item, never inline
    fn dispatch_watch(&self, body: Vec<u8>) {
        let mut parts = body.split(|&byte| byte == 0);
        let path = match parts.next().and_then(|p| core::str::from_utf8(p).ok()) {
            Some(path) => path.to_string(),
            None => {
                log::error!("watch event with unreadable path");
                return;
            }
        };
        let slot: usize = match parts
            .next()
            .and_then(|t| core::str::from_utf8(t).ok())
            .and_then(|t| t.parse().ok())
        {
            Some(slot) if slot < MAX_WATCH_ENTRIES => slot,
            _ => {
                log::error!("watch event with bad token for path {}", path);
                return;
            }
        };

        let weak = self.weak.clone();
        self.system.queue_work(Box::new(move || {
            if let Some(client) = weak.upgrade() {
                client.deliver_watch(slot, &path);
            }
        }));
    }

    fn deliver_watch(&self, slot: usize, path: &str) {
        let mut watches = self.watches.lock();
        let entry = &mut watches[slot];
        if !entry.active {
            log::debug!("no watch for token {}", slot);
            return;
        }
        entry.count += 1;
        let handler = entry.handler;
        let context = entry.context;
        handler(path, context);
    }
}

impl Drop for XenStoreClient {
    fn drop(&mut self) {
        debug_assert!(
            self.bound_context.load(Ordering::Relaxed).is_null(),
            "client dropped while still bound"
        );
    }
}

fn check_path(path: &str) -> Result<(), Error> {
    if path.len() > MAX_PATH {
        return Err(Error::PathTooLong(MAX_PATH));
    }
    Ok(())
}

fn mask_xenstore_idx(idx: u32) -> usize {
    (idx & (XENSTORE_RING_SIZE - 1)) as usize
}

fn ring_index(field: *const u32) -> &'static AtomicU32 {
    unsafe { &*(field as *const AtomicU32) }
}

/// Copy `dst.len()` bytes out of the response ring starting at cursor `cons`,
/// wrapping at the ring boundary
fn copy_from_ring(intf: *mut xenstore_domain_interface, dst: &mut [u8], cons: u32) {
    let offset = mask_xenstore_idx(cons);
    let first = cmp::min(dst.len(), XENSTORE_RING_SIZE as usize - offset);
    let ring = unsafe { ptr::addr_of!((*intf).rsp) as *const u8 };
    unsafe {
        ptr::copy_nonoverlapping(ring.add(offset), dst.as_mut_ptr(), first);
        ptr::copy_nonoverlapping(ring, dst.as_mut_ptr().add(first), dst.len() - first);
    }
}
