//! Implementation-defined space 1: Qualcomm micro-MMU control.

use crate::{Reg, Space};
use bitfield_struct::bitfield;

pub const MICRO_MMU_CTRL_OFFSET: u32 = 0x0;

pub const MICRO_MMU_CTRL: Reg = Reg::new(Space::ImplDef1, MICRO_MMU_CTRL_OFFSET);

/// Halt handshake with the SMMU micro-controller.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct MicroMmuCtrl {
    #[bits(2)]
    __: u8,
    /// Bit 2 — LOCAL_HALT_REQ.
    pub local_halt_req: bool,
    /// Bit 3 — IDLE: acknowledges the halt request.
    pub idle: bool,
    #[bits(28)]
    __: u32,
}

crate::register32!(MicroMmuCtrl);
