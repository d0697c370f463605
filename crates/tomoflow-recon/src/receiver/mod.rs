//! Online sinogram source: one UDP listener per detector module, a shared
//! completion notification, and assembly of full sinograms out of the
//! module ring buffers.

mod module;
mod notification;

pub use module::ReceiverModule;
pub use notification::ScanNotification;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use tomoflow_core::{ConfigReader, Result};
use tomoflow_gpu::{Image, MemoryPool, PinnedMemory, RegistrationId};
use tomoflow_pipeline::FrameSource;

use crate::geometry::ScanGeometry;

/// Default listening port for module 0; module `i` listens on base + `i`.
const DEFAULT_BASE_PORT: u16 = 4000;

/// Buffers reserved for assembled sinograms.
const RECEIVER_POOL_CAPACITY: usize = 100;

/// The pipeline's online source.
///
/// Owns the module listener threads and their ring buffers. `load`
/// assembles the most recent complete scan into a pooled pinned-host image
/// carrying the scan index, the plane parity and the arrival timestamp.
pub struct Receiver {
    buffers: Vec<Arc<Mutex<Vec<u16>>>>,
    notification: Arc<ScanNotification>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pool: MemoryPool<PinnedMemory<u16>>,
    registration: RegistrationId,
    geometry: ScanGeometry,
}

impl Receiver {
    pub fn new(
        address: &str,
        cfg: &ConfigReader,
        pool: MemoryPool<PinnedMemory<u16>>,
    ) -> Result<Self> {
        let geometry = Self::read_config(cfg)?;
        let projections_per_packet: usize =
            cfg.lookup_or("projectionsPerPacket", geometry.projections)?;
        let timeout = Duration::from_secs(cfg.lookup_or("timeout", 10u64)?);
        let base_port: u16 = cfg.lookup_or("basePort", DEFAULT_BASE_PORT)?;

        let slice_len = geometry.projections * geometry.detectors_per_module();
        let notification = Arc::new(ScanNotification::new(geometry.modules));
        let running = Arc::new(AtomicBool::new(true));

        let mut buffers = Vec::with_capacity(geometry.modules);
        let mut threads = Vec::with_capacity(geometry.modules);
        for module_id in 0..geometry.modules {
            tracing::debug!(module = module_id, "creating receiver module");
            let buffer = Arc::new(Mutex::new(vec![0u16; geometry.buffer_size * slice_len]));
            let module = ReceiverModule::bind(
                address,
                base_port + module_id as u16,
                module_id,
                geometry,
                projections_per_packet,
                timeout,
                Arc::clone(&buffer),
                Arc::clone(&notification),
                Arc::clone(&running),
            )?;
            buffers.push(buffer);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("recv-mod{module_id}"))
                    .spawn(move || module.run())
                    .map_err(|e| {
                        tomoflow_core::ReconError::Pipeline(format!(
                            "failed to spawn receiver module {module_id}: {e}"
                        ))
                    })?,
            );
        }

        let registration =
            pool.register_stage(RECEIVER_POOL_CAPACITY, geometry.sinogram_len())?;

        Ok(Self {
            buffers,
            notification,
            running,
            threads: Mutex::new(threads),
            pool,
            registration,
            geometry,
        })
    }

    fn read_config(cfg: &ConfigReader) -> Result<ScanGeometry> {
        ScanGeometry::from_config(cfg)
    }

    pub fn geometry(&self) -> &ScanGeometry {
        &self.geometry
    }

    /// Stop the module listeners and wake any blocked `load` call.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.notification.close();
    }
}

impl FrameSource for Receiver {
    type Output = Image<PinnedMemory<u16>>;

    fn load(&self) -> Image<PinnedMemory<u16>> {
        let Some(index) = self.notification.fetch() else {
            return Image::empty();
        };

        let mut sino = self.pool.request_memory(self.registration);
        if !sino.is_valid() {
            return Image::empty();
        }

        let slice_len = self.geometry.projections * self.geometry.detectors_per_module();
        let slot = (index as usize % self.geometry.buffer_size) * slice_len;
        {
            let dest = sino.as_mut_slice().expect("pinned sinogram is host-visible");
            for (module_id, buffer) in self.buffers.iter().enumerate() {
                let buffer = buffer.lock();
                dest[module_id * slice_len..(module_id + 1) * slice_len]
                    .copy_from_slice(&buffer[slot..slot + slice_len]);
            }
        }

        sino.set_index(index);
        sino.set_plane((index % 2) as u32);
        sino.mark_start();
        sino
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.stop();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        self.pool.free_registration(self.registration);
    }
}
