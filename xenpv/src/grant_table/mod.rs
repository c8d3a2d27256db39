//! Interface for Xen Grant Tables
//!
//! "The grant table mechanism [..] allows memory pages to be transferred or
//! shared between virtual machines"
//!
//! The table itself is hypervisor-shared memory at a fixed base; entries are
//! indexed by small integer references handed out from a free pool. The pool
//! is a lock-free LIFO stack so references can be taken and returned from
//! interrupt context; exhaustion is reported with [`INVALID_GRANT_REF`],
//! never by blocking.

use {
    crate::{
        hypervisor::Hypervisor,
        memory::{MachineFrameNumber, PAGE_SIZE},
    },
    alloc::{boxed::Box, sync::Arc, vec::Vec},
    core::{
        cmp,
        mem::size_of,
        ptr,
        sync::atomic::{fence, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    spin::Mutex,
    xenpv_sys::{domid_t, grant_entry_v1, grant_ref_t, GTF_permit_access, GTF_readonly,
        GTF_reading, GTF_writing},
};

pub use error::Error;

mod error;

/// Number of grant frames the table may occupy
pub const NR_GRANT_FRAMES: usize = 16;

/// Low references never handed out, kept for privileged internal use
pub const NR_RESERVED_ENTRIES: usize = 8;

/// Upper bound on usable entries, before the hypervisor's own limit applies
pub const NR_GRANT_ENTRIES: usize = (NR_GRANT_FRAMES * PAGE_SIZE) / size_of::<grant_entry_v1>();

/// References drawn out of the pool across a suspend for hibernation bookkeeping
const HIBERNATION_RESERVE: usize = 64;

/// Sentinel returned when the free pool is empty
pub const INVALID_GRANT_REF: grant_ref_t = !0;

/// Allocation tag identifying a grant reference's owner, for leak tracking
pub type GrantTag = u32;

/// Builds a tag from a four-character code
pub const fn grant_tag(code: [u8; 4]) -> GrantTag {
    u32::from_le_bytes(code)
}

const NO_ENTRY: u32 = !0;

/// Lock-free LIFO stack of free references threaded through a slot arena
///
/// The head packs a generation counter next to the top index so a concurrent
/// pop/push/pop of the same reference cannot be mistaken for no change.
struct FreeStack {
    head: AtomicU64,
    next: Box<[AtomicU32]>,
    available: AtomicUsize,
}

fn pack(generation: u32, top: u32) -> u64 {
    ((generation as u64) << 32) | top as u64
}

fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

impl FreeStack {
    fn new(capacity: usize) -> Self {
        let next = (0..capacity).map(|_| AtomicU32::new(NO_ENTRY)).collect();
        Self {
            head: AtomicU64::new(pack(0, NO_ENTRY)),
            next,
            available: AtomicUsize::new(0),
        }
    }

    fn push(&self, reference: u32) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (generation, top) = unpack(head);
            self.next[reference as usize].store(top, Ordering::Relaxed);
            let new = pack(generation.wrapping_add(1), reference);
            if self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.available.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    fn pop(&self) -> Option<u32> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (generation, top) = unpack(head);
            if top == NO_ENTRY {
                return None;
            }
            let next = self.next[top as usize].load(Ordering::Relaxed);
            let new = pack(generation.wrapping_add(1), next);
            if self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.available.fetch_sub(1, Ordering::Relaxed);
                return Some(top);
            }
        }
    }
}

#[cfg(debug_assertions)]
struct TagLedger {
    tags: Vec<GrantTag>,
    shadow: Vec<GrantTag>,
}

/// Owner of the shared grant entry table and its free reference pool
pub struct GrantTable {
    hypervisor: Arc<dyn Hypervisor>,
    entries: ptr::NonNull<grant_entry_v1>,
    count: usize,
    frames: usize,
    free: FreeStack,
    held: Mutex<Vec<grant_ref_t>>,
    shadow: Mutex<Option<Vec<grant_entry_v1>>>,
    #[cfg(debug_assertions)]
    ledger: Mutex<TagLedger>,
}

// The entry pointer refers to the statically mapped table; entry words are
// only touched through volatile and atomic operations.
unsafe impl Send for GrantTable {}
unsafe impl Sync for GrantTable {}

impl GrantTable {
    /// Queries the hypervisor limit, maps the table frames and fills the pool
    ///
    /// `capacity_hint` bounds the usable entry count below the built-in table
    /// capacity; zero means no extra bound. Mapping failures are fatal.
    pub fn init(hypervisor: Arc<dyn Hypervisor>, capacity_hint: usize) -> Result<Self, Error> {
        let (_, max_frames) = hypervisor.grant_query_size()?;
        let by_hypervisor = max_frames as usize * PAGE_SIZE / size_of::<grant_entry_v1>();
        let mut count = cmp::min(NR_GRANT_ENTRIES, by_hypervisor);
        if capacity_hint != 0 {
            count = cmp::min(count, capacity_hint);
        }
        let frames = (count * size_of::<grant_entry_v1>() + PAGE_SIZE - 1) / PAGE_SIZE;

        // Highest frame first: the hypervisor grows the table to the largest
        // index it has seen, so this grows it exactly once.
        for index in (0..frames).rev() {
            hypervisor.map_grant_frame(index as u32)?;
        }
        let entries = hypervisor.grant_table();

        let table = Self {
            hypervisor,
            entries,
            count,
            frames,
            free: FreeStack::new(count),
            held: Mutex::new(Vec::new()),
            shadow: Mutex::new(None),
            #[cfg(debug_assertions)]
            ledger: Mutex::new(TagLedger {
                tags: alloc::vec![0; count],
                shadow: Vec::new(),
            }),
        };

        for reference in 0..count {
            unsafe { ptr::write_volatile(table.entry_ptr(reference as u32), ZERO_ENTRY) };
        }
        for reference in NR_RESERVED_ENTRIES..count {
            table.free.push(reference as u32);
        }

        log::trace!("grant table mapped, {} usable entries", count);

        Ok(table)
    }

    /// Usable entry count established at init
    pub fn capacity(&self) -> usize {
        self.count
    }

    /// Number of references currently in the free pool
    pub fn available(&self) -> usize {
        self.free.available.load(Ordering::Relaxed)
    }

    /// Pops one reference from the free pool
    ///
    /// Returns [`INVALID_GRANT_REF`] when the pool is empty; never blocks.
    /// Callers handle exhaustion by shrinking their batch or backing off.
    pub fn get_ref(&self, tag: GrantTag) -> grant_ref_t {
        match self.free.pop() {
            Some(reference) => {
                self.note_get(reference, tag);
                reference
            }
            None => {
                log::trace!("grant reference pool exhausted (tag {:#x})", tag);
                INVALID_GRANT_REF
            }
        }
    }

    /// Returns a reference to the free pool
    ///
    /// The entry's flags must already be clear (access ended).
    pub fn put_ref(&self, reference: grant_ref_t, tag: GrantTag) {
        if reference as usize >= self.count {
            log::error!("put_ref of out-of-range reference {}", reference);
            return;
        }
        debug_assert_eq!(
            self.flags(reference).load(Ordering::Acquire),
            0,
            "reference {} returned with flags still set",
            reference
        );
        self.note_put(reference, tag);
        self.free.push(reference);
    }

    /// Grants `domain` access to `frame`
    ///
    /// Allocates a reference when `reference` is [`INVALID_GRANT_REF`]. The
    /// frame and domain are written before the access bit is published, so
    /// the remote side never observes a half-built entry.
    pub fn grant_access(
        &self,
        domain: domid_t,
        frame: MachineFrameNumber,
        readonly: bool,
        reference: grant_ref_t,
        tag: GrantTag,
    ) -> Result<grant_ref_t, Error> {
        let reference = if reference == INVALID_GRANT_REF {
            match self.free.pop() {
                Some(r) => {
                    self.note_get(r, tag);
                    r
                }
                None => return Err(Error::Exhausted),
            }
        } else {
            if reference as usize >= self.count {
                return Err(Error::BadReference(reference));
            }
            reference
        };

        let entry = self.entry_ptr(reference);
        unsafe {
            ptr::write_volatile(ptr::addr_of_mut!((*entry).domid), domain);
            ptr::write_volatile(
                ptr::addr_of_mut!((*entry).frame),
                frame.0 as u32,
            );
        }

        fence(Ordering::SeqCst);

        let flags = GTF_permit_access | if readonly { GTF_readonly } else { 0 };
        self.flags(reference).store(flags, Ordering::Release);

        log::trace!(
            "granting access {} {} {} {}",
            domain,
            frame.0,
            flags,
            reference
        );

        Ok(reference)
    }

    /// Revokes a grant, returning whether revocation succeeded
    ///
    /// Fails while the remote side holds the entry (`reading`/`writing`
    /// set); the caller retries later. On success the reference goes back to
    /// the pool unless `keep_ref` asks to retain it for reuse.
    pub fn end_access(&self, reference: grant_ref_t, keep_ref: bool, tag: GrantTag) -> bool {
        if reference as usize >= self.count {
            log::error!("end_access of out-of-range reference {}", reference);
            return false;
        }
        let flags = self.flags(reference);
        loop {
            let current = flags.load(Ordering::Acquire);
            if current & (GTF_reading | GTF_writing) != 0 {
                log::trace!("grant {} still in use ({:#x})", reference, current);
                return false;
            }
            if flags
                .compare_exchange_weak(current, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        if !keep_ref {
            self.note_put(reference, tag);
            self.free.push(reference);
        }
        true
    }

    /// Snapshots the entry table and parks the hibernation reserve
    ///
    /// Called with the rest of the system quiesced, immediately before the
    /// suspend hypercall.
    pub fn suspend(&self) {
        let mut shadow = Vec::with_capacity(self.count);
        for reference in 0..self.count {
            shadow.push(unsafe { ptr::read_volatile(self.entry_ptr(reference as u32)) });
        }
        *self.shadow.lock() = Some(shadow);

        #[cfg(debug_assertions)]
        {
            let mut ledger = self.ledger.lock();
            ledger.shadow = ledger.tags.clone();
        }

        let mut held = self.held.lock();
        for _ in 0..HIBERNATION_RESERVE {
            match self.free.pop() {
                Some(reference) => held.push(reference),
                None => break,
            }
        }
        log::debug!("grant table suspended, {} references held", held.len());
    }

    /// Remaps the table and restores the snapshot taken by `suspend`
    pub fn resume(&self) -> Result<(), Error> {
        let (_, max_frames) = self.hypervisor.grant_query_size()?;
        let by_hypervisor = max_frames as usize * PAGE_SIZE / size_of::<grant_entry_v1>();
        let usable = cmp::min(NR_GRANT_ENTRIES, by_hypervisor);
        if usable < self.count {
            return Err(Error::TableShrunk(usable, self.count));
        }

        for index in (0..self.frames).rev() {
            self.hypervisor.map_grant_frame(index as u32)?;
        }

        let shadow = self.shadow.lock().take().ok_or(Error::NoSnapshot)?;
        for (reference, entry) in shadow.iter().enumerate() {
            unsafe { ptr::write_volatile(self.entry_ptr(reference as u32), *entry) };
        }

        #[cfg(debug_assertions)]
        {
            let mut ledger = self.ledger.lock();
            if !ledger.shadow.is_empty() {
                let shadow = core::mem::take(&mut ledger.shadow);
                ledger.tags = shadow;
            }
        }

        let mut held = self.held.lock();
        while let Some(reference) = held.pop() {
            self.free.push(reference);
        }

        log::debug!("grant table resumed, {} usable entries", self.count);
        Ok(())
    }

    fn entry_ptr(&self, reference: grant_ref_t) -> *mut grant_entry_v1 {
        unsafe { self.entries.as_ptr().add(reference as usize) }
    }

    fn flags(&self, reference: grant_ref_t) -> &AtomicU16 {
        unsafe {
            let entry = self.entry_ptr(reference);
            &*(ptr::addr_of!((*entry).flags) as *const AtomicU16)
        }
    }

    #[cfg(debug_assertions)]
    fn note_get(&self, reference: grant_ref_t, tag: GrantTag) {
        self.ledger.lock().tags[reference as usize] = tag;
    }

    #[cfg(not(debug_assertions))]
    fn note_get(&self, _reference: grant_ref_t, _tag: GrantTag) {}

    #[cfg(debug_assertions)]
    fn note_put(&self, reference: grant_ref_t, tag: GrantTag) {
        let mut ledger = self.ledger.lock();
        debug_assert_eq!(
            ledger.tags[reference as usize], tag,
            "reference {} returned with mismatched tag",
            reference
        );
        ledger.tags[reference as usize] = 0;
    }

    #[cfg(not(debug_assertions))]
    fn note_put(&self, _reference: grant_ref_t, _tag: GrantTag) {}

    /// Ordered snapshot of the free pool, top first; test-only
    #[cfg(test)]
    pub(crate) fn free_snapshot(&self) -> Vec<u32> {
        let mut refs = Vec::new();
        let (_, mut top) = unpack(self.free.head.load(Ordering::Acquire));
        while top != NO_ENTRY {
            refs.push(top);
            top = self.free.next[top as usize].load(Ordering::Relaxed);
        }
        refs
    }
}

const ZERO_ENTRY: grant_entry_v1 = grant_entry_v1 {
    flags: 0,
    domid: 0,
    frame: 0,
};
