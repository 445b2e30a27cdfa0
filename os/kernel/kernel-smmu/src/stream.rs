//! Routing of stream IDs to context banks through the SMR and S2CR tables.

use crate::SmmuError;
use crate::config::MAX_MASTER_STREAMIDS;
use crate::resources::ResourceAllocator;
use alloc::vec::Vec;
use kernel_smmu_regs::gr0::{self, S2cr, Smr};
use kernel_smmu_regs::{LoadStore, SmmuMmio};
use log::{debug, error};

/// The stream configuration of one registered device.
///
/// Devices in the same hardware group share one `MasterCfg`; the first of
/// them to bind programs the SMRs and the first to unbind tears them down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterCfg {
    stream_ids: Vec<u16>,
    smrs: Option<Vec<u8>>,
}

impl MasterCfg {
    pub fn new(stream_ids: &[u16]) -> Result<Self, SmmuError> {
        if stream_ids.is_empty() {
            return Err(SmmuError::InvalidArgument("device without stream IDs"));
        }
        if stream_ids.len() > MAX_MASTER_STREAMIDS {
            error!(
                "reached maximum number ({MAX_MASTER_STREAMIDS}) of stream IDs, got {}",
                stream_ids.len()
            );
            return Err(SmmuError::OutOfSpace);
        }
        if stream_ids.iter().any(|&sid| sid > Smr::ID_MAX) {
            return Err(SmmuError::InvalidArgument("stream ID wider than the SMR ID field"));
        }
        Ok(Self {
            stream_ids: stream_ids.to_vec(),
            smrs: None,
        })
    }

    #[must_use]
    pub fn stream_ids(&self) -> &[u16] {
        &self.stream_ids
    }

    /// SMR index per stream ID while bound on a stream-matching controller.
    #[must_use]
    pub fn smr_indices(&self) -> Option<&[u8]> {
        self.smrs.as_deref()
    }
}

/// Result of [`StreamRouter::bind`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// A sibling in the same group already programmed the streams.
    AlreadyBound,
}

/// Programs stream mappings. Every method expects the clocks to be on.
pub struct StreamRouter<'a> {
    pub(crate) mmio: &'a dyn SmmuMmio,
    pub(crate) resources: &'a ResourceAllocator,
    pub(crate) stream_match: bool,
    pub(crate) num_mapping_groups: u8,
}

impl StreamRouter<'_> {
    /// Routes every stream of `master` to context bank `cbndx`.
    pub fn bind(&self, master: &mut MasterCfg, cbndx: u8) -> Result<BindOutcome, SmmuError> {
        if self.configure_smrs(master)? == BindOutcome::AlreadyBound {
            debug!("streams {:x?} already configured by group", master.stream_ids);
            return Ok(BindOutcome::AlreadyBound);
        }
        for idx in self.s2cr_indices(master)? {
            self.mmio.store(gr0::s2cr(idx), S2cr::translate(cbndx));
        }
        Ok(BindOutcome::Bound)
    }

    /// Returns every stream of `master` to bypass and releases its SMRs.
    ///
    /// The S2CRs are switched before any SMR is invalidated: a freed SMR
    /// may be handed out again at once.
    pub fn unbind(&self, master: &mut MasterCfg) -> Result<(), SmmuError> {
        if self.stream_match && master.smrs.is_none() {
            return Ok(());
        }
        for idx in self.s2cr_indices(master)? {
            self.mmio.store(gr0::s2cr(idx), S2cr::bypass());
        }
        if let Some(smrs) = master.smrs.take() {
            for idx in smrs {
                self.mmio.store(gr0::smr(idx), Smr::new());
                self.resources.free_smr(idx);
            }
        }
        Ok(())
    }

    fn configure_smrs(&self, master: &mut MasterCfg) -> Result<BindOutcome, SmmuError> {
        if !self.stream_match {
            return Ok(BindOutcome::Bound);
        }
        if master.smrs.is_some() {
            return Ok(BindOutcome::AlreadyBound);
        }

        let mut smrs = Vec::with_capacity(master.stream_ids.len());
        for &sid in &master.stream_ids {
            match self.resources.alloc_smr(sid, self.num_mapping_groups) {
                Ok(idx) => smrs.push(idx),
                Err(e) => {
                    error!("failed to allocate free SMR for stream {sid:#x}");
                    for &idx in smrs.iter().rev() {
                        self.resources.free_smr(idx);
                    }
                    return Err(e);
                }
            }
        }

        for (&idx, &sid) in smrs.iter().zip(&master.stream_ids) {
            self.mmio.store(gr0::smr(idx), Smr::exact(sid));
        }
        master.smrs = Some(smrs);
        Ok(BindOutcome::Bound)
    }

    fn s2cr_indices(&self, master: &MasterCfg) -> Result<Vec<u8>, SmmuError> {
        match &master.smrs {
            Some(smrs) => Ok(smrs.clone()),
            None => master
                .stream_ids
                .iter()
                .map(|&sid| {
                    u8::try_from(sid)
                        .ok()
                        .filter(|&idx| idx < self.num_mapping_groups)
                        .ok_or(SmmuError::InvalidArgument("stream ID beyond the S2CR table"))
                })
                .collect(),
        }
    }
}
