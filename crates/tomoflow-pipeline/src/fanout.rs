use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use tomoflow_core::Result;
use tomoflow_gpu::{DeviceLane, DeviceSet, Image, MemoryManager, MemoryPool, RegistrationId};

use crate::queue::Queue;
use crate::stage::StageWorker;

/// The stage-specific computation a [`DeviceFanout`] schedules.
///
/// `launch` submits work for one frame on the lane's stream; the harness
/// synchronises the stream afterwards and carries the frame metadata over.
/// Kernel internals are collaborators of the runtime, not part of it.
pub trait DeviceKernel: Send + Sync + 'static {
    type In: MemoryManager;
    type Out: MemoryManager;

    /// Element count of the output buffers this stage produces, used to
    /// size its pool lanes.
    fn output_len(&self) -> usize;

    fn launch(
        &self,
        lane: &DeviceLane,
        input: &Image<Self::In>,
        output: &mut Image<Self::Out>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct FanoutOptions {
    /// Buffers reserved per device lane (the `memPoolSize` config value).
    pub pool_capacity: usize,
    /// Depth of the per-device input queues and the shared results queue.
    pub queue_limit: usize,
}

impl Default for FanoutOptions {
    fn default() -> Self {
        Self {
            pool_capacity: 16,
            queue_limit: 10,
        }
    }
}

/// The multi-device engine behind every compute stage.
///
/// At construction it creates, per device: an input queue, a stream, a pool
/// registration sized for this stage's outputs, and a worker thread pinned
/// to that device. `process` shards incoming frames round-robin by
/// `index % D`, which keeps utilisation even and guarantees each frame is
/// handled by exactly one device. Within one device outputs preserve input
/// order; across devices order is restored downstream via the frame index.
pub struct DeviceFanout<K: DeviceKernel> {
    lanes: Vec<Arc<Queue<Image<K::In>>>>,
    results: Arc<Queue<Image<K::Out>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pool: MemoryPool<K::Out>,
    registrations: Vec<RegistrationId>,
    served: AtomicU64,
}

impl<K: DeviceKernel> DeviceFanout<K> {
    pub fn new(
        name: &str,
        kernel: K,
        devices: &DeviceSet,
        pool: MemoryPool<K::Out>,
        opts: FanoutOptions,
    ) -> Result<Self> {
        let kernel = Arc::new(kernel);
        let device_count = devices.count();
        let active = Arc::new(AtomicUsize::new(device_count));
        let results = Arc::new(Queue::bounded(opts.queue_limit));

        let mut lanes = Vec::with_capacity(device_count);
        let mut registrations = Vec::with_capacity(device_count);
        let mut threads = Vec::with_capacity(device_count);

        for ordinal in 0..device_count {
            let queue = Arc::new(Queue::bounded(opts.queue_limit));
            let registration = pool.register_stage(opts.pool_capacity, kernel.output_len())?;
            let lane = devices.lane(ordinal)?;

            let handle = std::thread::Builder::new()
                .name(format!("{name}-dev{ordinal}"))
                .spawn({
                    let queue = Arc::clone(&queue);
                    let results = Arc::clone(&results);
                    let pool = pool.clone();
                    let kernel = Arc::clone(&kernel);
                    let active = Arc::clone(&active);
                    move || {
                        Self::processor(lane, queue, results, pool, registration, kernel, active)
                    }
                })
                .map_err(|e| tomoflow_core::ReconError::Pipeline(format!(
                    "failed to spawn worker for device {ordinal}: {e}"
                )))?;

            lanes.push(queue);
            registrations.push(registration);
            threads.push(handle);
        }

        tracing::info!(stage = name, devices = device_count, "fan-out stage ready");
        Ok(Self {
            lanes,
            results,
            threads: Mutex::new(threads),
            pool,
            registrations,
            served: AtomicU64::new(0),
        })
    }

    /// Frames routed through this stage so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub fn device_count(&self) -> usize {
        self.lanes.len()
    }

    /// Pool lanes this stage registered, one per device.
    pub fn registrations(&self) -> &[RegistrationId] {
        &self.registrations
    }

    fn processor(
        lane: DeviceLane,
        input: Arc<Queue<Image<K::In>>>,
        results: Arc<Queue<Image<K::Out>>>,
        pool: MemoryPool<K::Out>,
        registration: RegistrationId,
        kernel: Arc<K>,
        active: Arc<AtomicUsize>,
    ) {
        lane.bind();

        while let Some(img) = input.pop() {
            let mut out = pool.request_memory(registration);
            if !out.is_valid() {
                tracing::debug!(device = lane.ordinal(), "pool torn down, worker exiting");
                break;
            }

            if let Err(e) = kernel
                .launch(&lane, &img, &mut out)
                .and_then(|()| lane.synchronize())
            {
                // Transient failure: drop the frame, keep the stage alive.
                tracing::warn!(
                    device = lane.ordinal(),
                    index = img.index(),
                    error = %e,
                    "kernel launch failed, dropping frame"
                );
                continue;
            }

            out.set_index(img.index());
            out.set_plane(img.plane());
            if let Some(start) = img.start() {
                out.set_start(start);
            }
            results.push(out);
        }

        // The last worker out closes the results queue.
        if active.fetch_sub(1, Ordering::AcqRel) == 1 {
            results.close();
        }
    }
}

impl<K: DeviceKernel> StageWorker for DeviceFanout<K> {
    type Input = Image<K::In>;
    type Output = Image<K::Out>;

    fn process(&self, item: Image<K::In>) {
        let device = (item.index() % self.lanes.len() as u64) as usize;
        self.served.fetch_add(1, Ordering::Relaxed);
        self.lanes[device].push(item);
    }

    fn finish(&self) {
        for lane in &self.lanes {
            lane.close();
        }
    }

    fn wait(&self) -> Option<Image<K::Out>> {
        self.results.pop()
    }
}

impl<K: DeviceKernel> Drop for DeviceFanout<K> {
    fn drop(&mut self) {
        for lane in &self.lanes {
            lane.close();
        }
        self.results.close();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        for registration in &self.registrations {
            self.pool.free_registration(*registration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tomoflow_core::ReconError;
    use tomoflow_gpu::HostMemory;

    type In = HostMemory<u16>;

    struct RecordingKernel {
        log: Arc<Mutex<Vec<(usize, u64)>>>,
        len: usize,
    }

    impl DeviceKernel for RecordingKernel {
        type In = In;
        type Out = In;

        fn output_len(&self) -> usize {
            self.len
        }

        fn launch(
            &self,
            lane: &DeviceLane,
            input: &Image<In>,
            output: &mut Image<In>,
        ) -> Result<()> {
            self.log.lock().push((lane.ordinal(), input.index()));
            let src = input.as_slice().expect("host input");
            output.as_mut_slice().expect("host output")[..src.len()].copy_from_slice(src);
            Ok(())
        }
    }

    fn frame(index: u64) -> Image<In> {
        let mut img = Image::<In>::new(16).unwrap();
        img.set_index(index);
        img
    }

    #[test]
    fn round_robin_sharding_across_three_devices() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pool = MemoryPool::<In>::new();
        let devices = DeviceSet::with_count(3);
        let fanout = DeviceFanout::new(
            "test",
            RecordingKernel {
                log: Arc::clone(&log),
                len: 16,
            },
            &devices,
            pool,
            FanoutOptions::default(),
        )
        .unwrap();

        for i in 0..12 {
            fanout.process(frame(i));
        }
        fanout.finish();

        let mut out_indices = Vec::new();
        while let Some(img) = fanout.wait() {
            out_indices.push(img.index());
        }
        out_indices.sort_unstable();
        assert_eq!(out_indices, (0..12).collect::<Vec<_>>());
        assert_eq!(fanout.served(), 12);

        let mut per_device: Vec<Vec<u64>> = vec![Vec::new(); 3];
        for &(device, index) in log.lock().iter() {
            per_device[device].push(index);
        }
        for lane in per_device.iter_mut() {
            lane.sort_unstable();
        }
        assert_eq!(per_device[0], vec![0, 3, 6, 9]);
        assert_eq!(per_device[1], vec![1, 4, 7, 10]);
        assert_eq!(per_device[2], vec![2, 5, 8, 11]);
    }

    #[test]
    fn per_device_order_is_preserved() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pool = MemoryPool::<In>::new();
        let devices = DeviceSet::with_count(1);
        // Queues deep enough to hold the whole batch: this test feeds
        // everything before draining, so it must not rely on backpressure.
        let fanout = DeviceFanout::new(
            "test",
            RecordingKernel {
                log: Arc::clone(&log),
                len: 16,
            },
            &devices,
            pool,
            FanoutOptions {
                pool_capacity: 8,
                queue_limit: 64,
            },
        )
        .unwrap();

        for i in 0..50 {
            fanout.process(frame(i));
        }
        fanout.finish();

        let mut out = Vec::new();
        while let Some(img) = fanout.wait() {
            out.push(img.index());
        }
        assert_eq!(out, (0..50).collect::<Vec<_>>());
    }

    struct FailingKernel;

    impl DeviceKernel for FailingKernel {
        type In = In;
        type Out = In;

        fn output_len(&self) -> usize {
            4
        }

        fn launch(&self, _: &DeviceLane, input: &Image<In>, _: &mut Image<In>) -> Result<()> {
            if input.index() % 2 == 1 {
                return Err(ReconError::Device("spurious launch failure".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn failed_launches_drop_the_frame_and_continue() {
        let pool = MemoryPool::<In>::new();
        let devices = DeviceSet::with_count(1);
        let fanout =
            DeviceFanout::new("test", FailingKernel, &devices, pool.clone(), FanoutOptions::default())
                .unwrap();
        let registration = fanout.registrations[0];

        for i in 0..6 {
            let mut img = Image::<In>::new(4).unwrap();
            img.set_index(i);
            fanout.process(img);
        }
        fanout.finish();

        let mut out = Vec::new();
        while let Some(img) = fanout.wait() {
            out.push(img.index());
        }
        assert_eq!(out, vec![0, 2, 4]);
        // Every output buffer is back on the free list, including those of
        // the dropped frames.
        assert_eq!(pool.free_count(registration), 16);
        drop(fanout);
        assert_eq!(pool.free_count(registration), 0);
    }
}
