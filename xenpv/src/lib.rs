//! Guest-side communication substrate for Xen paravirtualized devices
//!
//! Front-end drivers talk to their back ends through four primitives: shared
//! memory published via the grant table, virtual interrupt lines multiplexed
//! over event channels, the XenStore configuration protocol carried on a
//! dedicated ring, and a stop-the-world rendezvous used to freeze the guest
//! around the suspend hypercall. Each primitive is a component with an
//! explicit `init`/`suspend`/`resume` lifecycle, owned by the embedding
//! kernel or driver framework and handed its hypervisor and host services
//! through the [`hypervisor::Hypervisor`] and [`system::System`] traits.

#![no_std]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub use xenpv_sys;

pub use xenpv_sys::DOMID_SELF;

pub mod events;
pub mod grant_table;
pub mod hypercall;
pub mod hypervisor;
pub mod memory;
pub mod platform;
pub mod rendezvous;
pub mod suspend;
pub mod system;
pub mod xenbus;

#[cfg(test)]
pub(crate) mod testing;
