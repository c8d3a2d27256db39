use displaydoc::Display;

use crate::hypervisor;

/// Grant table errors
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// free grant reference pool exhausted
    Exhausted,
    /// reference {0} is outside the table
    BadReference(u32),
    /// hypervisor reports {0} usable entries, fewer than the {1} in use
    TableShrunk(usize, usize),
    /// resume without a prior suspend snapshot
    NoSnapshot,
    /// hypervisor operation failed: {0}
    Hypervisor(hypervisor::Error),
}

impl From<hypervisor::Error> for Error {
    fn from(e: hypervisor::Error) -> Self {
        Error::Hypervisor(e)
    }
}
