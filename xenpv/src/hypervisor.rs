//! The hypercall boundary as a capability trait
//!
//! Every privileged operation the substrate needs is expressed as a typed
//! command handed to a [`Hypervisor`] implementation. On a real guest the
//! implementation issues hypercalls through the `hypercall!` thunks (see
//! [`crate::platform`]); the argument structs it builds are the plain
//! by-address structs the ABI defines. Tests substitute an in-process fake
//! that owns real copies of the shared pages.

use {
    core::ptr::NonNull,
    displaydoc::Display,
    xenpv_sys::{
        domid_t, evtchn_port_t, grant_entry_v1, shared_info, xen_long_t,
        xenstore_domain_interface,
    },
};

/// Event channel operation requests
///
/// Mirrors the `EVTCHNOP_*` command set; each variant carries the fields of
/// the corresponding argument struct that the guest supplies.
#[derive(Debug, Clone, Copy)]
pub enum EventChannelOp {
    /// Deliver an event to the remote end of `port`
    Send {
        /// Port to signal
        port: evtchn_port_t,
    },
    /// Allocate a new port for `remote` to bind to later
    AllocUnbound {
        /// Domain permitted to bind the other end
        remote: domid_t,
    },
    /// Allocate a port for inter-processor signalling on `vcpu`
    BindIpi {
        /// Virtual CPU receiving the events
        vcpu: u32,
    },
    /// Close `port` and release its hypervisor state
    Close {
        /// Port to close
        port: evtchn_port_t,
    },
}

/// What the suspend hypercall reported when the guest came back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    /// The guest was suspended and is now resuming, possibly elsewhere
    Resumed,
    /// The suspend was cancelled (or the domain merely checkpointed)
    Cancelled,
}

/// A privileged operation failed
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// hypercall returned error code {0}
    Hypercall(xen_long_t),
    /// operation completed with failure status {0}
    Status(xen_long_t),
}

/// Privileged operations and shared-page access the substrate relies on
///
/// The shared-page accessors return the fixed addresses at which the
/// hypervisor-visible structures live; those addresses are part of the wire
/// contract and must not move for the lifetime of the implementation.
pub trait Hypervisor: Send + Sync {
    /// Perform an event channel operation, returning the allocated port for
    /// the allocating variants (zero otherwise)
    fn event_channel_op(&self, op: EventChannelOp) -> Result<evtchn_port_t, Error>;

    /// Query the grant table's current and maximum frame counts
    fn grant_query_size(&self) -> Result<(u32, u32), Error>;

    /// Map grant table frame `index` into the guest physical address space
    ///
    /// Callers map the highest frame first: the hypervisor grows the table to
    /// cover the largest index it has seen, so a descending walk grows it
    /// exactly once.
    fn map_grant_frame(&self, index: u32) -> Result<(), Error>;

    /// Base address of the mapped grant table
    fn grant_table(&self) -> NonNull<grant_entry_v1>;

    /// Address of the shared info page
    fn shared_info(&self) -> NonNull<shared_info>;

    /// Address of the XenStore ring page
    fn store_interface(&self) -> NonNull<xenstore_domain_interface>;

    /// Event channel port connected to the store daemon
    ///
    /// May change across a suspend/resume cycle; callers re-query it when
    /// reconnecting.
    fn store_port(&self) -> evtchn_port_t;

    /// Route the event upcall to interrupt `vector`, or disable delivery
    fn set_event_upcall(&self, vector: Option<u8>) -> Result<(), Error>;

    /// Give up the remainder of the current scheduling quantum
    fn yield_cpu(&self);

    /// Issue the suspend shutdown hypercall
    ///
    /// Does not return until the hypervisor resumes the guest (or refuses the
    /// suspend). Must only be called with every other CPU parked; see
    /// [`crate::rendezvous`].
    fn suspend(&self) -> Result<SuspendOutcome, Error>;
}
