pub mod device;
pub mod host;
pub mod image;
pub mod manager;
pub mod pool;
pub mod volume;

#[cfg(feature = "cuda")]
mod cuda;

pub use device::{
    device_to_host, host_to_device, DeviceLane, DeviceMemory, DeviceSet, DeviceStream,
};
pub use host::{HostMemory, PinnedMemory};
pub use image::Image;
pub use manager::{DomainBuffer, MemoryManager, Sample};
pub use pool::{MemoryPool, RegistrationId};
pub use volume::Volume;
