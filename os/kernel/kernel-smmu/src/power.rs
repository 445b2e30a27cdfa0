//! Reference-counted gating of the clocks, regulator and bus vote that
//! guard register access.
//!
//! There are two independent counts. The blocking count owns the
//! regulator, the bus bandwidth vote and clock *preparation*; it may only
//! be changed from thread context. The atomic count owns clock *enable*
//! and may be changed with interrupts disabled, but only after the
//! blocking path prepared the clocks.
//!
//! Most callers want both and use [`PowerGate::enable`], which returns a
//! [`PowerVote`] that drops both counts again.

use crate::time::Clocksource;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_sync::{SleepMutex, SpinLock};
use log::{debug, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PowerError {
    #[error("regulator enable failed")]
    Regulator,
    #[error("bus bandwidth vote failed")]
    BusVote,
    #[error("clock {index} failed")]
    Clock { index: usize },
    #[error("clocks are not prepared")]
    NotReady,
    #[error("power vote released more often than taken")]
    Unbalanced,
}

/// One gate clock. `prepare` may sleep, `enable` must not.
pub trait Clock: Send + Sync {
    fn prepare(&self) -> Result<(), PowerError>;
    fn unprepare(&self);
    fn enable(&self) -> Result<(), PowerError>;
    fn disable(&self);
}

pub trait Regulator: Send + Sync {
    fn enable(&self) -> Result<(), PowerError>;
    fn disable(&self);
}

pub trait BusBandwidth: Send + Sync {
    fn vote(&self) -> Result<(), PowerError>;
    fn unvote(&self);
}

/// The power collaborators of one controller.
#[derive(Clone, Default)]
pub struct PowerResources {
    pub regulator: Option<Arc<dyn Regulator>>,
    pub bus: Option<Arc<dyn BusBandwidth>>,
    pub clocks: Vec<Arc<dyn Clock>>,
}

#[derive(Debug, Default)]
struct BlockingState {
    count: u32,
    regulator_on: bool,
    /// Pending deferred regulator disable.
    off_at_us: Option<u64>,
}

pub struct PowerGate {
    resources: PowerResources,
    clock: Arc<dyn Clocksource>,
    defer_us: u64,
    blocking: SleepMutex<BlockingState>,
    atomic: SpinLock<u32>,
    prepared: AtomicBool,
}

impl PowerGate {
    pub fn new(resources: PowerResources, clock: Arc<dyn Clocksource>, regulator_defer_ms: u32) -> Self {
        Self {
            resources,
            clock,
            defer_us: u64::from(regulator_defer_ms) * 1000,
            blocking: SleepMutex::new(BlockingState::default()),
            atomic: SpinLock::new(0),
            prepared: AtomicBool::new(false),
        }
    }

    pub fn acquire_blocking(&self) -> Result<(), PowerError> {
        let mut st = self.blocking.lock();
        if st.count == 0 {
            self.power_up(&mut st)?;
        }
        st.count += 1;
        Ok(())
    }

    pub fn release_blocking(&self) -> Result<(), PowerError> {
        let mut st = self.blocking.lock();
        if st.count == 0 {
            warn!("blocking power vote released while not held");
            return Err(PowerError::Unbalanced);
        }
        st.count -= 1;
        if st.count == 0 {
            self.power_down(&mut st);
        }
        Ok(())
    }

    fn power_up(&self, st: &mut BlockingState) -> Result<(), PowerError> {
        let regulator = self.resources.regulator.as_deref();
        if st.off_at_us.take().is_none() && !st.regulator_on {
            if let Some(r) = regulator {
                r.enable().map_err(|_| PowerError::Regulator)?;
            }
            st.regulator_on = true;
        }

        let drop_regulator = |st: &mut BlockingState| {
            if let Some(r) = regulator {
                r.disable();
            }
            st.regulator_on = false;
        };

        if let Some(bus) = &self.resources.bus
            && bus.vote().is_err()
        {
            drop_regulator(st);
            return Err(PowerError::BusVote);
        }

        for (index, clk) in self.resources.clocks.iter().enumerate() {
            if clk.prepare().is_err() {
                for prepared in self.resources.clocks[..index].iter().rev() {
                    prepared.unprepare();
                }
                if let Some(bus) = &self.resources.bus {
                    bus.unvote();
                }
                drop_regulator(st);
                return Err(PowerError::Clock { index });
            }
        }
        self.prepared.store(true, Ordering::Release);
        Ok(())
    }

    fn power_down(&self, st: &mut BlockingState) {
        self.prepared.store(false, Ordering::Release);
        for clk in self.resources.clocks.iter().rev() {
            clk.unprepare();
        }
        if let Some(bus) = &self.resources.bus {
            bus.unvote();
        }
        if self.defer_us == 0 {
            self.regulator_off(st);
        } else {
            st.off_at_us = Some(self.clock.now_us().saturating_add(self.defer_us));
            debug!("regulator disable deferred by {} us", self.defer_us);
        }
    }

    fn regulator_off(&self, st: &mut BlockingState) {
        if let Some(r) = &self.resources.regulator {
            r.disable();
        }
        st.regulator_on = false;
        st.off_at_us = None;
    }

    /// Runs a deferred regulator disable whose delay has expired. Returns
    /// whether the regulator was switched off.
    pub fn service_deferred(&self) -> bool {
        let mut st = self.blocking.lock();
        match st.off_at_us {
            Some(at) if st.count == 0 && self.clock.now_us() >= at => {
                self.regulator_off(&mut st);
                true
            }
            _ => false,
        }
    }

    /// Enables the prepared clocks. Safe with interrupts disabled.
    pub fn acquire_atomic(&self) -> Result<(), PowerError> {
        let mut count = self.atomic.lock_irqsave();
        if *count == 0 {
            if !self.prepared.load(Ordering::Acquire) {
                return Err(PowerError::NotReady);
            }
            for (index, clk) in self.resources.clocks.iter().enumerate() {
                if clk.enable().is_err() {
                    for enabled in self.resources.clocks[..index].iter().rev() {
                        enabled.disable();
                    }
                    return Err(PowerError::Clock { index });
                }
            }
        }
        *count += 1;
        Ok(())
    }

    pub fn release_atomic(&self) -> Result<(), PowerError> {
        let mut count = self.atomic.lock_irqsave();
        if *count == 0 {
            warn!("atomic power vote released while not held");
            return Err(PowerError::Unbalanced);
        }
        *count -= 1;
        if *count == 0 {
            for clk in self.resources.clocks.iter().rev() {
                clk.disable();
            }
        }
        Ok(())
    }

    /// Full register access: blocking then atomic vote.
    pub fn enable(&self) -> Result<PowerVote<'_>, PowerError> {
        self.acquire_blocking()?;
        if let Err(e) = self.acquire_atomic() {
            let _ = self.release_blocking();
            return Err(e);
        }
        Ok(PowerVote { gate: self })
    }

    /// Register access from atomic context; the clocks must already be
    /// prepared by an outstanding blocking vote.
    pub fn enable_atomic(&self) -> Result<AtomicPowerVote<'_>, PowerError> {
        self.acquire_atomic()?;
        Ok(AtomicPowerVote { gate: self })
    }

    #[must_use]
    pub fn blocking_count(&self) -> u32 {
        self.blocking.lock().count
    }

    #[must_use]
    pub fn atomic_count(&self) -> u32 {
        *self.atomic.lock_irqsave()
    }

    #[must_use]
    pub fn regulator_on(&self) -> bool {
        self.blocking.lock().regulator_on
    }

    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }
}

/// Blocking and atomic vote, dropped together.
#[must_use = "register access ends when the vote is dropped"]
pub struct PowerVote<'a> {
    gate: &'a PowerGate,
}

impl Drop for PowerVote<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.gate.release_atomic() {
            warn!("dropping power vote: {e}");
        }
        if let Err(e) = self.gate.release_blocking() {
            warn!("dropping power vote: {e}");
        }
    }
}

#[must_use = "register access ends when the vote is dropped"]
pub struct AtomicPowerVote<'a> {
    gate: &'a PowerGate,
}

impl Drop for AtomicPowerVote<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.gate.release_atomic() {
            warn!("dropping atomic power vote: {e}");
        }
    }
}
