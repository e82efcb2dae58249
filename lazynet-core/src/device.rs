use std::fmt;
use std::sync::Arc;

use crate::{backend::Backend, cpu::CpuBackend, handle::DeviceId};

/// A concrete device: a backend plus the identity used to key per-device
/// caches.
#[derive(Clone)]
pub struct Device {
    id: DeviceId,
    backend: Arc<dyn Backend>,
}

impl Device {
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<dyn Backend>) -> Self {
        Self {
            id: DeviceId::next(),
            backend,
        }
    }

    /// A fresh reference CPU device.
    pub fn cpu() -> Self {
        Self::new(CpuBackend::new())
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({}#{})", self.name(), self.id)
    }
}
