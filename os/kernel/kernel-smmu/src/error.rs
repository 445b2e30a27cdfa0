use crate::controller::IrqError;
use crate::pgtable::PageTableError;
use crate::power::PowerError;
use crate::secure::OwnershipError;

/// A bounded hardware handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Handshake {
    GlobalTlbSync,
    ContextTlbSync,
    Halt,
    Atos,
}

/// Why a context fault could not be recovered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// Address-size fault on a controller configured to treat it as fatal.
    AddressSize,
    /// No client handled the fault and the domain does not allow
    /// non-fatal faults.
    Unhandled,
}

/// Details of a context fault escalated to the interrupt dispatcher.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FatalFault {
    pub cbndx: u8,
    pub iova: u64,
    pub fsr: u32,
    pub reason: FatalReason,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SmmuError {
    #[error("no free context bank or stream match register")]
    OutOfSpace,
    #[error("resource busy")]
    Busy,
    #[error("atomic power vote before the clocks were prepared")]
    NotReady,
    #[error("hardware handshake timed out: {0:?}")]
    Timeout(Handshake),
    #[error("unrecoverable context fault on bank {}: {:?}", .0.cbndx, .0.reason)]
    Fatal(FatalFault),
    #[error("no such device")]
    NoDevice,
    #[error("domain is not attached")]
    NotAttached,
    #[error("device is already attached")]
    AlreadyAttached,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error(transparent)]
    Power(PowerError),
    #[error(transparent)]
    PageTable(#[from] PageTableError),
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    #[error(transparent)]
    Irq(#[from] IrqError),
}

impl From<PowerError> for SmmuError {
    fn from(e: PowerError) -> Self {
        match e {
            PowerError::NotReady => Self::NotReady,
            other => Self::Power(other),
        }
    }
}

impl SmmuError {
    /// Whether this error must bring the system down.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
