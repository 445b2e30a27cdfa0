//! # SMMU translation contexts
//!
//! Management of the translation contexts of an ARM SMMU (v1/v2): which
//! device streams go through which context bank, what address space each
//! bank translates, and what happens when a translation faults.
//!
//! ```text
//!   IommuOps ──► TranslationDomain ──► SmmuDevice ──► SmmuMmio
//!                   │      │              │
//!                   │      │              ├─ ResourceAllocator (CB / SMR bitmaps)
//!                   │      │              ├─ PowerGate (clocks, regulator, bus vote)
//!                   │      │              └─ StreamRouter (SMR + S2CR)
//!                   │      └─ PageTableCodec (external)
//!                   └─ SecureOwnershipTracker ──► OwnershipTransfer (external)
//! ```
//!
//! Every collaborator outside the SMMU itself (register window, clocks,
//! regulator, interrupt lines, page-table codec, page allocator and the
//! secure monitor) is a trait object handed in by the platform, so the
//! whole engine runs against fakes in tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::missing_errors_doc)]

extern crate alloc;

pub mod attr;
pub mod config;
pub mod controller;
pub mod domain;
mod error;
pub mod fault;
pub mod iommu;
pub mod pgtable;
pub mod power;
pub mod registry;
pub mod resources;
pub mod secure;
pub mod stream;
pub mod time;

pub use attr::{AttributeKind, AttributeValue, DomainAttribute};
pub use config::{SmmuConfig, SmmuFeatures, SmmuHwInfo, SmmuOptions, SmmuVersion};
pub use controller::{SmmuDevice, SmmuPlatform};
pub use domain::{DomainServices, DomainState, Stage, TranslationDomain};
pub use error::{FatalFault, FatalReason, Handshake, SmmuError};
pub use fault::{FaultClient, FaultRecord, FaultResponse, IrqReturn};
pub use iommu::{DomainHandle, IommuOps, SmmuIommu};
pub use registry::SmmuRegistry;

/// A client device behind an SMMU.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u32);

/// One SMMU instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SmmuId(pub u32);
