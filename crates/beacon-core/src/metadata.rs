// ABOUTME: Device metadata capability queried when a record is enqueued without a device.
// ABOUTME: Provides the MetadataSource trait and a StaticMetadata implementation.

use thiserror::Error;

use crate::log::Device;

#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    #[error("device information unavailable: {0}")]
    Unavailable(String),
}

/// Supplies the device snapshot stamped onto records.
pub trait MetadataSource: Send + Sync {
    fn snapshot(&self) -> Result<Device, MetadataError>;
}

/// A metadata source that always returns the same device description.
#[derive(Debug, Clone)]
pub struct StaticMetadata {
    device: Device,
}

impl StaticMetadata {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl Default for StaticMetadata {
    fn default() -> Self {
        Self::new(Device::current(None))
    }
}

impl MetadataSource for StaticMetadata {
    fn snapshot(&self) -> Result<Device, MetadataError> {
        Ok(self.device.clone())
    }
}
