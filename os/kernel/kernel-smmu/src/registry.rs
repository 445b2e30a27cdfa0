//! The set of probed controllers.

use crate::controller::SmmuDevice;
use crate::{DeviceId, SmmuError, SmmuId};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::SpinLock;
use log::info;

/// Controllers known to the system, looked up by id or by one of their
/// registered devices.
#[derive(Default)]
pub struct SmmuRegistry {
    controllers: SpinLock<Vec<Arc<SmmuDevice>>>,
}

impl SmmuRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            controllers: SpinLock::new(Vec::new()),
        }
    }

    pub fn register(&self, smmu: Arc<SmmuDevice>) -> Result<(), SmmuError> {
        let mut controllers = self.controllers.lock();
        if controllers.iter().any(|s| s.id() == smmu.id()) {
            return Err(SmmuError::Busy);
        }
        info!("registered SMMU {:?}", smmu.id());
        controllers.push(smmu);
        Ok(())
    }

    /// Removes a controller with nothing attached.
    pub fn unregister(&self, id: SmmuId) -> Result<Arc<SmmuDevice>, SmmuError> {
        let mut controllers = self.controllers.lock();
        let pos = controllers
            .iter()
            .position(|s| s.id() == id)
            .ok_or(SmmuError::NoDevice)?;
        if controllers[pos].attach_count() > 0 {
            return Err(SmmuError::Busy);
        }
        Ok(controllers.remove(pos))
    }

    #[must_use]
    pub fn find(&self, id: SmmuId) -> Option<Arc<SmmuDevice>> {
        self.controllers.lock().iter().find(|s| s.id() == id).cloned()
    }

    /// The controller `device` was registered with.
    #[must_use]
    pub fn find_for_device(&self, device: DeviceId) -> Option<Arc<SmmuDevice>> {
        self.controllers
            .lock()
            .iter()
            .find(|s| s.has_device(device))
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.controllers.lock().is_empty()
    }
}
