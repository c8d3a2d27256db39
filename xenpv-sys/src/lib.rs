//! Hand-maintained Xen ABI definitions
//!
//! Layouts and constants transcribed from the Xen public interface headers
//! (`xen.h`, `event_channel.h`, `grant_table.h`, `memory.h`, `sched.h`,
//! `hvm/params.h` and `io/xs_wire.h`), interface version 0x00030203. Names
//! follow the C originals so call sites read like the reference sources.

#![no_std]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use cty::{c_char, c_long, c_ulong};

/// Unsigned long as the hypervisor ABI defines it
pub type xen_ulong_t = c_ulong;
/// Signed long as the hypervisor ABI defines it
pub type xen_long_t = c_long;
/// Guest physical frame number
pub type xen_pfn_t = u64;
/// Domain identifier
pub type domid_t = u16;
/// Event channel port number
pub type evtchn_port_t = u32;
/// Grant table reference
pub type grant_ref_t = u32;
/// XenStore transaction identifier
pub type xenbus_transaction_t = u32;

/// Self-reference domain ID usable in place of the caller's own ID
pub const DOMID_SELF: domid_t = 0x7FF0;

/// Legacy bound on vCPUs described by the shared info page
pub const MAX_VIRT_CPUS: usize = 32;

// Hypercall table offsets
pub const __HYPERVISOR_memory_op: u32 = 12;
pub const __HYPERVISOR_grant_table_op: u32 = 20;
pub const __HYPERVISOR_sched_op: u32 = 29;
pub const __HYPERVISOR_event_channel_op: u32 = 32;
pub const __HYPERVISOR_hvm_op: u32 = 34;

// event_channel.h operation codes
pub const EVTCHNOP_bind_interdomain: u32 = 0;
pub const EVTCHNOP_bind_virq: u32 = 1;
pub const EVTCHNOP_bind_pirq: u32 = 2;
pub const EVTCHNOP_close: u32 = 3;
pub const EVTCHNOP_send: u32 = 4;
pub const EVTCHNOP_status: u32 = 5;
pub const EVTCHNOP_alloc_unbound: u32 = 6;
pub const EVTCHNOP_bind_ipi: u32 = 7;
pub const EVTCHNOP_bind_vcpu: u32 = 8;
pub const EVTCHNOP_unmask: u32 = 9;

/// `EVTCHNOP_alloc_unbound` argument
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct evtchn_alloc_unbound {
    pub dom: domid_t,
    pub remote_dom: domid_t,
    /// OUT: allocated port
    pub port: evtchn_port_t,
}
pub type evtchn_alloc_unbound_t = evtchn_alloc_unbound;

/// `EVTCHNOP_bind_ipi` argument
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct evtchn_bind_ipi {
    pub vcpu: u32,
    /// OUT: allocated port
    pub port: evtchn_port_t,
}
pub type evtchn_bind_ipi_t = evtchn_bind_ipi;

/// `EVTCHNOP_close` argument
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct evtchn_close {
    pub port: evtchn_port_t,
}
pub type evtchn_close_t = evtchn_close;

/// `EVTCHNOP_send` argument
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct evtchn_send {
    pub port: evtchn_port_t,
}
pub type evtchn_send_t = evtchn_send;

/// `EVTCHNOP_unmask` argument
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct evtchn_unmask {
    pub port: evtchn_port_t,
}
pub type evtchn_unmask_t = evtchn_unmask;

// grant_table.h operation codes
pub const GNTTABOP_map_grant_ref: u32 = 0;
pub const GNTTABOP_unmap_grant_ref: u32 = 1;
pub const GNTTABOP_setup_table: u32 = 2;
pub const GNTTABOP_dump_table: u32 = 3;
pub const GNTTABOP_transfer: u32 = 4;
pub const GNTTABOP_copy: u32 = 5;
pub const GNTTABOP_query_size: u32 = 6;

// Grant entry flag bits (GTF_*)
pub const GTF_invalid: u16 = 0;
pub const GTF_permit_access: u16 = 1;
pub const GTF_accept_transfer: u16 = 2;
pub const GTF_type_mask: u16 = 3;
pub const GTF_readonly: u16 = 1 << 2;
pub const GTF_reading: u16 = 1 << 3;
pub const GTF_writing: u16 = 1 << 4;

/// Version 1 grant table entry
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct grant_entry_v1 {
    /// `GTF_*` bits; `GTF_permit_access` publishes the entry
    pub flags: u16,
    /// Domain granted access
    pub domid: domid_t,
    /// Machine frame shared with `domid`
    pub frame: u32,
}
pub type grant_entry_t = grant_entry_v1;

/// `GNTTABOP_query_size` argument
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct gnttab_query_size {
    pub dom: domid_t,
    /// OUT: current number of frames
    pub nr_frames: u32,
    /// OUT: maximum number of frames
    pub max_nr_frames: u32,
    /// OUT: GNTST_* status
    pub status: i16,
}
pub type gnttab_query_size_t = gnttab_query_size;

// memory.h
pub const XENMEM_increase_reservation: u32 = 0;
pub const XENMEM_decrease_reservation: u32 = 1;
pub const XENMEM_add_to_physmap: u32 = 7;

/// `xen_add_to_physmap` mapping space selectors
pub const XENMAPSPACE_shared_info: u32 = 0;
pub const XENMAPSPACE_grant_table: u32 = 1;

/// `XENMEM_add_to_physmap` argument
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct xen_add_to_physmap {
    pub domid: domid_t,
    /// Which predefined mapping space `idx` indexes
    pub space: u32,
    /// Index into the selected space
    pub idx: xen_ulong_t,
    /// Guest frame the mapping appears at
    pub gpfn: xen_pfn_t,
}
pub type xen_add_to_physmap_t = xen_add_to_physmap;

// sched.h operation codes
pub const SCHEDOP_yield: u32 = 0;
pub const SCHEDOP_block: u32 = 1;
pub const SCHEDOP_shutdown: u32 = 2;
pub const SCHEDOP_poll: u32 = 3;
pub const SCHEDOP_remote_shutdown: u32 = 4;
pub const SCHEDOP_shutdown_code: u32 = 5;
pub const SCHEDOP_watchdog: u32 = 6;

pub const SHUTDOWN_poweroff: u32 = 0;
pub const SHUTDOWN_reboot: u32 = 1;
pub const SHUTDOWN_suspend: u32 = 2;
pub const SHUTDOWN_crash: u32 = 3;
pub const SHUTDOWN_watchdog: u32 = 4;

/// `SCHEDOP_shutdown` argument
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct sched_shutdown {
    pub reason: u32,
}
pub type sched_shutdown_t = sched_shutdown;

// hvm/hvm_op.h and hvm/params.h
pub const HVMOP_set_param: u32 = 0;
pub const HVMOP_get_param: u32 = 1;

pub const HVM_PARAM_CALLBACK_IRQ: u32 = 0;
pub const HVM_PARAM_STORE_PFN: u32 = 1;
pub const HVM_PARAM_STORE_EVTCHN: u32 = 2;

/// `HVMOP_{set,get}_param` argument
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct xen_hvm_param {
    pub domid: domid_t,
    pub index: u32,
    pub value: u64,
}
pub type xen_hvm_param_t = xen_hvm_param;

/// Time sampling block within `vcpu_info`
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct vcpu_time_info {
    pub version: u32,
    pub pad0: u32,
    pub tsc_timestamp: u64,
    pub system_time: u64,
    pub tsc_to_system_mul: u32,
    pub tsc_shift: i8,
    pub pad1: [i8; 3],
}
pub type vcpu_time_info_t = vcpu_time_info;

/// x86 portion of `vcpu_info`
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct arch_vcpu_info {
    pub cr2: xen_ulong_t,
    pub pad: xen_ulong_t,
}
pub type arch_vcpu_info_t = arch_vcpu_info;

/// Per-vCPU slot of the shared info page
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct vcpu_info {
    /// Nonzero while an upcall is pending for this vCPU
    pub evtchn_upcall_pending: u8,
    /// Nonzero masks upcall delivery to this vCPU
    pub evtchn_upcall_mask: u8,
    pub pad0: [u8; 6],
    /// Second-level selector: bit N set means `evtchn_pending[N]` has bits set
    pub evtchn_pending_sel: xen_ulong_t,
    pub arch: arch_vcpu_info,
    pub time: vcpu_time_info,
}
pub type vcpu_info_t = vcpu_info;

/// x86 portion of `shared_info`
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct arch_shared_info {
    pub max_pfn: xen_ulong_t,
    pub pfn_to_mfn_frame_list_list: xen_ulong_t,
    pub nmi_reason: xen_ulong_t,
}
pub type arch_shared_info_t = arch_shared_info;

/// Hypervisor-shared global state page
#[repr(C)]
#[derive(Copy, Clone)]
pub struct shared_info {
    pub vcpu_info: [vcpu_info; MAX_VIRT_CPUS],
    /// First-level pending-event bitmap, one bit per port
    pub evtchn_pending: [xen_ulong_t; 64],
    /// Event mask bitmap, one bit per port; set bit suppresses delivery
    pub evtchn_mask: [xen_ulong_t; 64],
    pub wc_version: u32,
    pub wc_sec: u32,
    pub wc_nsec: u32,
    pub arch: arch_shared_info,
}
pub type shared_info_t = shared_info;

// io/xs_wire.h
pub const xsd_sockmsg_type_XS_CONTROL: u32 = 0;
pub const xsd_sockmsg_type_XS_DEBUG: u32 = 0;
pub const xsd_sockmsg_type_XS_DIRECTORY: u32 = 1;
pub const xsd_sockmsg_type_XS_READ: u32 = 2;
pub const xsd_sockmsg_type_XS_GET_PERMS: u32 = 3;
pub const xsd_sockmsg_type_XS_WATCH: u32 = 4;
pub const xsd_sockmsg_type_XS_UNWATCH: u32 = 5;
pub const xsd_sockmsg_type_XS_TRANSACTION_START: u32 = 6;
pub const xsd_sockmsg_type_XS_TRANSACTION_END: u32 = 7;
pub const xsd_sockmsg_type_XS_INTRODUCE: u32 = 8;
pub const xsd_sockmsg_type_XS_RELEASE: u32 = 9;
pub const xsd_sockmsg_type_XS_GET_DOMAIN_PATH: u32 = 10;
pub const xsd_sockmsg_type_XS_WRITE: u32 = 11;
pub const xsd_sockmsg_type_XS_MKDIR: u32 = 12;
pub const xsd_sockmsg_type_XS_RM: u32 = 13;
pub const xsd_sockmsg_type_XS_SET_PERMS: u32 = 14;
pub const xsd_sockmsg_type_XS_WATCH_EVENT: u32 = 15;
pub const xsd_sockmsg_type_XS_ERROR: u32 = 16;
pub const xsd_sockmsg_type_XS_IS_DOMAIN_INTRODUCED: u32 = 17;
pub const xsd_sockmsg_type_XS_RESUME: u32 = 18;
pub const xsd_sockmsg_type_XS_SET_TARGET: u32 = 19;
pub const xsd_sockmsg_type_XS_RESET_WATCHES: u32 = 21;
pub const xsd_sockmsg_type_XS_DIRECTORY_PART: u32 = 22;
pub const xsd_sockmsg_type_XS_TYPE_COUNT: u32 = 23;

/// Transaction ID meaning "no transaction"
pub const XBT_NIL: xenbus_transaction_t = 0;

/// XenStore message header, followed on the wire by `len` payload bytes
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct xsd_sockmsg {
    pub type_: u32,
    pub req_id: u32,
    pub tx_id: u32,
    pub len: u32,
}
pub type xsd_sockmsg_t = xsd_sockmsg;

/// Bytes in each direction of the store ring; must be a power of two
pub const XENSTORE_RING_SIZE: u32 = 1024;

/// Ring cursor type for the store rings
pub type XENSTORE_RING_IDX = u32;

/// The single shared page carrying both store rings and their cursors
#[repr(C)]
#[derive(Copy, Clone)]
pub struct xenstore_domain_interface {
    /// Requests to the store daemon
    pub req: [c_char; XENSTORE_RING_SIZE as usize],
    /// Replies and watch events from the store daemon
    pub rsp: [c_char; XENSTORE_RING_SIZE as usize],
    pub req_cons: XENSTORE_RING_IDX,
    pub req_prod: XENSTORE_RING_IDX,
    pub rsp_cons: XENSTORE_RING_IDX,
    pub rsp_prod: XENSTORE_RING_IDX,
}
pub type xenstore_domain_interface_t = xenstore_domain_interface;
