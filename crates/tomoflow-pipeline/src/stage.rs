use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tomoflow_gpu::{Image, MemoryManager};

use crate::port::{InputSide, OutputSide, Port};
use crate::queue::Queue;

/// Anything that can flow through a pipeline edge. The end marker is the
/// poison pill a source emits once and every stage passes on before
/// terminating.
pub trait PipelineItem: Send + 'static {
    fn end_marker() -> Self;
    fn is_end(&self) -> bool;
}

/// An invalid image is the pill; validity is what downstream code tests.
impl<M: MemoryManager> PipelineItem for Image<M> {
    fn end_marker() -> Self {
        Image::empty()
    }

    fn is_end(&self) -> bool {
        !self.is_valid()
    }
}

/// Per-stage worker plugged into the [`Stage`] harness.
///
/// `process` is called re-entrantly from the upstream thread and must only
/// hand the item off (typically into a per-device queue); the heavy lifting
/// happens on the worker's own threads. `wait` is the downstream pull;
/// `None` signals that all workers have finished.
pub trait StageWorker: Send + Sync + 'static {
    type Input: PipelineItem;
    type Output: PipelineItem;

    fn process(&self, item: Self::Input);

    /// No more input will arrive.
    fn finish(&self);

    fn wait(&self) -> Option<Self::Output>;
}

/// Harness composing a worker with an input queue and an output port.
///
/// `run` drives two loops on their own threads: the push loop feeds popped
/// items to the worker until the pill (or a closed queue) arrives, the take
/// loop forwards worker results downstream and finally passes the pill on.
pub struct Stage<W: StageWorker> {
    name: String,
    worker: W,
    input: Arc<Queue<W::Input>>,
    output: OutputSide<W::Output>,
}

impl<W: StageWorker> Stage<W> {
    pub fn new(name: impl Into<String>, worker: W) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            worker,
            input: Arc::new(Queue::default()),
            output: OutputSide::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn input_endpoint(&self) -> Arc<dyn InputSide<W::Input>> {
        self.input.clone()
    }

    pub fn attach(&self, port: Port<W::Output>) {
        self.output.attach(port);
    }

    pub fn run(&self) {
        std::thread::scope(|s| {
            s.spawn(|| self.push_loop());
            s.spawn(|| self.take_loop());
        });
    }

    fn push_loop(&self) {
        loop {
            match self.input.pop() {
                Some(item) if !item.is_end() => self.worker.process(item),
                _ => {
                    tracing::debug!(stage = %self.name, "input drained, finishing");
                    self.worker.finish();
                    break;
                }
            }
        }
    }

    fn take_loop(&self) {
        loop {
            match self.worker.wait() {
                Some(out) => {
                    self.output.output(out);
                }
                None => {
                    self.output.output(W::Output::end_marker());
                    tracing::debug!(stage = %self.name, "forwarded end-of-stream");
                    break;
                }
            }
        }
    }
}

/// Produces the frames a source stage pushes into the pipeline.
pub trait FrameSource: Send + Sync + 'static {
    type Output: PipelineItem;

    /// The next frame; an end marker once the source is exhausted.
    fn load(&self) -> Self::Output;
}

/// Head of the pipeline: pulls frames out of a [`FrameSource`] until it
/// runs dry, then emits the pill exactly once.
pub struct SourceStage<L: FrameSource> {
    name: String,
    loader: L,
    output: OutputSide<L::Output>,
    produced: AtomicU64,
}

impl<L: FrameSource> SourceStage<L> {
    pub fn new(name: impl Into<String>, loader: L) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            loader,
            output: OutputSide::new(),
            produced: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Frames pushed so far.
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn attach(&self, port: Port<L::Output>) {
        self.output.attach(port);
    }

    pub fn run(&self) {
        loop {
            let item = self.loader.load();
            if item.is_end() {
                tracing::info!(
                    stage = %self.name,
                    produced = self.produced.load(Ordering::Relaxed),
                    "source exhausted, sending end-of-stream"
                );
                self.output.output(item);
                break;
            }
            self.produced.fetch_add(1, Ordering::Relaxed);
            self.output.output(item);
        }
    }
}

/// Consumes the frames arriving at a sink stage.
pub trait FrameSink: Send + Sync + 'static {
    type Input: PipelineItem;

    fn consume(&self, item: Self::Input);
}

/// Tail of the pipeline: drains its input queue into a [`FrameSink`] until
/// the pill arrives.
pub struct SinkStage<S: FrameSink> {
    name: String,
    sink: S,
    input: Arc<Queue<S::Input>>,
    received: AtomicU64,
}

impl<S: FrameSink> SinkStage<S> {
    pub fn new(name: impl Into<String>, sink: S) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            sink,
            input: Arc::new(Queue::default()),
            received: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn input_endpoint(&self) -> Arc<dyn InputSide<S::Input>> {
        self.input.clone()
    }

    pub fn run(&self) {
        loop {
            match self.input.pop() {
                Some(item) if !item.is_end() => {
                    self.sink.consume(item);
                    self.received.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    tracing::info!(
                        stage = %self.name,
                        received = self.received.load(Ordering::Relaxed),
                        "end-of-stream arrived, terminating"
                    );
                    break;
                }
            }
        }
    }
}
