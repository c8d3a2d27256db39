//! XenStore wire message definitions
//!
//! A message is a fixed 16-byte header followed by `len` payload bytes of
//! ASCII paths and values. Headers travel in native byte order; both ends of
//! the ring live in the same machine.

use {
    core::{convert::TryInto, mem::size_of},
    xenpv_sys::{
        xsd_sockmsg, xsd_sockmsg_type_XS_CONTROL, xsd_sockmsg_type_XS_DIRECTORY,
        xsd_sockmsg_type_XS_DIRECTORY_PART, xsd_sockmsg_type_XS_ERROR,
        xsd_sockmsg_type_XS_GET_DOMAIN_PATH, xsd_sockmsg_type_XS_GET_PERMS,
        xsd_sockmsg_type_XS_INTRODUCE, xsd_sockmsg_type_XS_IS_DOMAIN_INTRODUCED,
        xsd_sockmsg_type_XS_MKDIR, xsd_sockmsg_type_XS_READ, xsd_sockmsg_type_XS_RELEASE,
        xsd_sockmsg_type_XS_RESET_WATCHES, xsd_sockmsg_type_XS_RESUME, xsd_sockmsg_type_XS_RM,
        xsd_sockmsg_type_XS_SET_PERMS, xsd_sockmsg_type_XS_SET_TARGET,
        xsd_sockmsg_type_XS_TRANSACTION_END, xsd_sockmsg_type_XS_TRANSACTION_START,
        xsd_sockmsg_type_XS_TYPE_COUNT, xsd_sockmsg_type_XS_UNWATCH, xsd_sockmsg_type_XS_WATCH,
        xsd_sockmsg_type_XS_WATCH_EVENT, xsd_sockmsg_type_XS_WRITE,
    },
};

/// Bytes occupied by a message header on the ring
pub const HEADER_SIZE: usize = size_of::<xsd_sockmsg>();

/// XenStore message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Control,
    Debug,
    Directory,
    DirectoryPart,
    Read,
    GetPerms,
    Watch,
    Unwatch,
    TransactionStart,
    TransactionEnd,
    Introduce,
    Release,
    GetDomainPath,
    Write,
    MakeDirectory,
    Remove,
    SetPerms,
    WatchEvent,
    Error,
    IsDomainIntroduced,
    Resume,
    SetTarget,
    ResetWatches,
    /// Number of valid types
    TypeCount,
    /// Guaranteed to remain an invalid type
    Invalid,
}

impl From<u32> for Kind {
    fn from(value: u32) -> Self {
        #[allow(non_upper_case_globals)]
        match value {
            xsd_sockmsg_type_XS_CONTROL => Kind::Control,
            xsd_sockmsg_type_XS_DIRECTORY => Kind::Directory,
            xsd_sockmsg_type_XS_READ => Kind::Read,
            xsd_sockmsg_type_XS_GET_PERMS => Kind::GetPerms,
            xsd_sockmsg_type_XS_WATCH => Kind::Watch,
            xsd_sockmsg_type_XS_UNWATCH => Kind::Unwatch,
            xsd_sockmsg_type_XS_TRANSACTION_START => Kind::TransactionStart,
            xsd_sockmsg_type_XS_TRANSACTION_END => Kind::TransactionEnd,
            xsd_sockmsg_type_XS_INTRODUCE => Kind::Introduce,
            xsd_sockmsg_type_XS_RELEASE => Kind::Release,
            xsd_sockmsg_type_XS_GET_DOMAIN_PATH => Kind::GetDomainPath,
            xsd_sockmsg_type_XS_WRITE => Kind::Write,
            xsd_sockmsg_type_XS_MKDIR => Kind::MakeDirectory,
            xsd_sockmsg_type_XS_RM => Kind::Remove,
            xsd_sockmsg_type_XS_SET_PERMS => Kind::SetPerms,
            xsd_sockmsg_type_XS_WATCH_EVENT => Kind::WatchEvent,
            xsd_sockmsg_type_XS_ERROR => Kind::Error,
            xsd_sockmsg_type_XS_IS_DOMAIN_INTRODUCED => Kind::IsDomainIntroduced,
            xsd_sockmsg_type_XS_RESUME => Kind::Resume,
            xsd_sockmsg_type_XS_SET_TARGET => Kind::SetTarget,
            xsd_sockmsg_type_XS_RESET_WATCHES => Kind::ResetWatches,
            xsd_sockmsg_type_XS_DIRECTORY_PART => Kind::DirectoryPart,
            xsd_sockmsg_type_XS_TYPE_COUNT => Kind::TypeCount,
            _ => Kind::Invalid,
        }
    }
}

impl From<Kind> for u32 {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Control => xsd_sockmsg_type_XS_CONTROL,
            Kind::Debug => xsd_sockmsg_type_XS_CONTROL,
            Kind::Directory => xsd_sockmsg_type_XS_DIRECTORY,
            Kind::Read => xsd_sockmsg_type_XS_READ,
            Kind::GetPerms => xsd_sockmsg_type_XS_GET_PERMS,
            Kind::Watch => xsd_sockmsg_type_XS_WATCH,
            Kind::Unwatch => xsd_sockmsg_type_XS_UNWATCH,
            Kind::TransactionStart => xsd_sockmsg_type_XS_TRANSACTION_START,
            Kind::TransactionEnd => xsd_sockmsg_type_XS_TRANSACTION_END,
            Kind::Introduce => xsd_sockmsg_type_XS_INTRODUCE,
            Kind::Release => xsd_sockmsg_type_XS_RELEASE,
            Kind::GetDomainPath => xsd_sockmsg_type_XS_GET_DOMAIN_PATH,
            Kind::Write => xsd_sockmsg_type_XS_WRITE,
            Kind::MakeDirectory => xsd_sockmsg_type_XS_MKDIR,
            Kind::Remove => xsd_sockmsg_type_XS_RM,
            Kind::SetPerms => xsd_sockmsg_type_XS_SET_PERMS,
            Kind::WatchEvent => xsd_sockmsg_type_XS_WATCH_EVENT,
            Kind::Error => xsd_sockmsg_type_XS_ERROR,
            Kind::IsDomainIntroduced => xsd_sockmsg_type_XS_IS_DOMAIN_INTRODUCED,
            Kind::Resume => xsd_sockmsg_type_XS_RESUME,
            Kind::SetTarget => xsd_sockmsg_type_XS_SET_TARGET,
            Kind::ResetWatches => xsd_sockmsg_type_XS_RESET_WATCHES,
            Kind::DirectoryPart => xsd_sockmsg_type_XS_DIRECTORY_PART,
            Kind::TypeCount => xsd_sockmsg_type_XS_TYPE_COUNT,
            Kind::Invalid => 0xFFFF,
        }
    }
}

/// Parsed message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type
    pub kind: Kind,
    /// Request ID, echoed by the daemon; unused for matching (replies are
    /// strictly ordered)
    pub request_id: u32,
    /// Transaction ID, zero outside a transaction
    pub transaction_id: u32,
    /// Payload length in bytes
    pub len: u32,
}

impl MessageHeader {
    /// Serializes the header for the ring
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&u32::from(self.kind).to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.request_id.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.transaction_id.to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.len.to_ne_bytes());
        bytes
    }

    /// Reconstructs a header from ring bytes
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let field = |range: core::ops::Range<usize>| {
            u32::from_ne_bytes(bytes[range].try_into().expect("header field is 4 bytes"))
        };
        Self {
            kind: Kind::from(field(0..4)),
            request_id: field(4..8),
            transaction_id: field(8..12),
            len: field(12..16),
        }
    }
}
