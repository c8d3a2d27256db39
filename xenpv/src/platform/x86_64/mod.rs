//! x86_64 hypervisor backend

use {
    crate::hypervisor::{Error, EventChannelOp, Hypervisor, SuspendOutcome},
    core::ptr::NonNull,
    xenpv_sys::{
        evtchn_alloc_unbound_t, evtchn_bind_ipi_t, evtchn_close_t, evtchn_port_t, evtchn_send_t,
        gnttab_query_size_t, grant_entry_v1, sched_shutdown_t, shared_info, xen_add_to_physmap_t,
        xen_hvm_param_t, xenstore_domain_interface, DOMID_SELF, EVTCHNOP_alloc_unbound,
        EVTCHNOP_bind_ipi, EVTCHNOP_close, EVTCHNOP_send, GNTTABOP_query_size, HVMOP_get_param,
        HVMOP_set_param, HVM_PARAM_CALLBACK_IRQ, SCHEDOP_shutdown, SCHEDOP_yield,
        SHUTDOWN_suspend, XENMAPSPACE_grant_table, XENMEM_add_to_physmap,
        __HYPERVISOR_event_channel_op, __HYPERVISOR_grant_table_op, __HYPERVISOR_hvm_op,
        __HYPERVISOR_memory_op, __HYPERVISOR_sched_op,
    },
};

pub mod hypercall;
pub mod util;

/// [`Hypervisor`] implementation issuing real hypercalls
///
/// The embedder maps the shared pages (shared info, store ring, grant table
/// region) before construction; their addresses must remain valid and fixed
/// for the lifetime of the value.
pub struct PvHypervisor {
    shared_info: NonNull<shared_info>,
    store: NonNull<xenstore_domain_interface>,
    store_port: evtchn_port_t,
    grant_base: NonNull<grant_entry_v1>,
    grant_base_gpfn: u64,
}

// The wrapped pointers refer to statically mapped pages, valid from any CPU.
unsafe impl Send for PvHypervisor {}
unsafe impl Sync for PvHypervisor {}

impl PvHypervisor {
    /// Wraps pre-mapped shared pages
    ///
    /// # Safety
    ///
    /// All pointers must be page-aligned mappings of the corresponding
    /// hypervisor-shared structures, and `grant_base` must have room for the
    /// maximum grant table size at guest frame `grant_base_gpfn` onwards.
    pub unsafe fn from_raw(
        shared_info: NonNull<shared_info>,
        store: NonNull<xenstore_domain_interface>,
        store_port: evtchn_port_t,
        grant_base: NonNull<grant_entry_v1>,
        grant_base_gpfn: u64,
    ) -> Self {
        Self {
            shared_info,
            store,
            store_port,
            grant_base,
            grant_base_gpfn,
        }
    }

    /// Reads an HVM parameter
    pub fn get_param(&self, index: u32) -> Result<u64, Error> {
        let mut arg = xen_hvm_param_t {
            domid: DOMID_SELF,
            index,
            value: 0,
        };
        check(unsafe {
            crate::hypercall!(
                __HYPERVISOR_hvm_op,
                HVMOP_get_param,
                &mut arg as *mut _ as u64
            )
        })?;
        Ok(arg.value)
    }

    fn set_param(&self, index: u32, value: u64) -> Result<(), Error> {
        let mut arg = xen_hvm_param_t {
            domid: DOMID_SELF,
            index,
            value,
        };
        check(unsafe {
            crate::hypercall!(
                __HYPERVISOR_hvm_op,
                HVMOP_set_param,
                &mut arg as *mut _ as u64
            )
        })?;
        Ok(())
    }
}

fn check(rc: i64) -> Result<i64, Error> {
    if rc < 0 {
        Err(Error::Hypercall(rc))
    } else {
        Ok(rc)
    }
}

unsafe fn evtchn_op(cmd: u32, arg: u64) -> Result<i64, Error> {
    check(crate::hypercall!(__HYPERVISOR_event_channel_op, cmd, arg))
}

impl Hypervisor for PvHypervisor {
    fn event_channel_op(&self, op: EventChannelOp) -> Result<evtchn_port_t, Error> {
        unsafe {
            match op {
                EventChannelOp::Send { port } => {
                    let arg = evtchn_send_t { port };
                    evtchn_op(EVTCHNOP_send, &arg as *const _ as u64)?;
                    Ok(0)
                }
                EventChannelOp::AllocUnbound { remote } => {
                    let mut arg = evtchn_alloc_unbound_t {
                        dom: DOMID_SELF,
                        remote_dom: remote,
                        port: 0,
                    };
                    evtchn_op(EVTCHNOP_alloc_unbound, &mut arg as *mut _ as u64)?;
                    Ok(arg.port)
                }
                EventChannelOp::BindIpi { vcpu } => {
                    let mut arg = evtchn_bind_ipi_t { vcpu, port: 0 };
                    evtchn_op(EVTCHNOP_bind_ipi, &mut arg as *mut _ as u64)?;
                    Ok(arg.port)
                }
                EventChannelOp::Close { port } => {
                    let arg = evtchn_close_t { port };
                    evtchn_op(EVTCHNOP_close, &arg as *const _ as u64)?;
                    Ok(0)
                }
            }
        }
    }

    fn grant_query_size(&self) -> Result<(u32, u32), Error> {
        let mut arg = gnttab_query_size_t {
            dom: DOMID_SELF,
            nr_frames: 0,
            max_nr_frames: 0,
            status: 0,
        };
        check(unsafe {
            crate::hypercall!(
                __HYPERVISOR_grant_table_op,
                GNTTABOP_query_size,
                &mut arg as *mut _ as u64,
                1u64
            )
        })?;
        if arg.status != 0 {
            return Err(Error::Status(arg.status as i64));
        }
        Ok((arg.nr_frames, arg.max_nr_frames))
    }

    fn map_grant_frame(&self, index: u32) -> Result<(), Error> {
        let mut arg = xen_add_to_physmap_t {
            domid: DOMID_SELF,
            space: XENMAPSPACE_grant_table,
            idx: index as u64,
            gpfn: self.grant_base_gpfn + index as u64,
        };
        check(unsafe {
            crate::hypercall!(
                __HYPERVISOR_memory_op,
                XENMEM_add_to_physmap,
                &mut arg as *mut _ as u64
            )
        })?;
        Ok(())
    }

    fn grant_table(&self) -> NonNull<grant_entry_v1> {
        self.grant_base
    }

    fn shared_info(&self) -> NonNull<shared_info> {
        self.shared_info
    }

    fn store_interface(&self) -> NonNull<xenstore_domain_interface> {
        self.store
    }

    fn store_port(&self) -> evtchn_port_t {
        self.store_port
    }

    fn set_event_upcall(&self, vector: Option<u8>) -> Result<(), Error> {
        // Delivery-type 2 in bits 57:56 selects direct vector injection.
        let via = match vector {
            Some(v) => (2u64 << 56) | v as u64,
            None => 0,
        };
        self.set_param(HVM_PARAM_CALLBACK_IRQ, via)
    }

    fn yield_cpu(&self) {
        let _ = unsafe { crate::hypercall!(__HYPERVISOR_sched_op, SCHEDOP_yield, 0u64) };
    }

    fn suspend(&self) -> Result<SuspendOutcome, Error> {
        let arg = sched_shutdown_t {
            reason: SHUTDOWN_suspend,
        };
        let rc = check(unsafe {
            crate::hypercall!(
                __HYPERVISOR_sched_op,
                SCHEDOP_shutdown,
                &arg as *const _ as u64
            )
        })?;
        Ok(if rc == 1 {
            SuspendOutcome::Cancelled
        } else {
            SuspendOutcome::Resumed
        })
    }
}
