use std::sync::Arc;
use std::thread::JoinHandle;

use crate::port::{InputSide, Port};
use crate::stage::{
    FrameSink, FrameSource, PipelineItem, SinkStage, SourceStage, Stage, StageWorker,
};

/// A stage with an exposed input endpoint.
pub trait HasInput<T: PipelineItem> {
    fn input_endpoint(&self) -> Arc<dyn InputSide<T>>;
}

/// A stage with an attachable output port.
pub trait HasOutput<T: PipelineItem> {
    fn attach_port(&self, port: Port<T>);
}

impl<W: StageWorker> HasInput<W::Input> for Stage<W> {
    fn input_endpoint(&self) -> Arc<dyn InputSide<W::Input>> {
        Stage::input_endpoint(self)
    }
}

impl<W: StageWorker> HasOutput<W::Output> for Stage<W> {
    fn attach_port(&self, port: Port<W::Output>) {
        self.attach(port);
    }
}

impl<L: FrameSource> HasOutput<L::Output> for SourceStage<L> {
    fn attach_port(&self, port: Port<L::Output>) {
        self.attach(port);
    }
}

impl<S: FrameSink> HasInput<S::Input> for SinkStage<S> {
    fn input_endpoint(&self) -> Arc<dyn InputSide<S::Input>> {
        SinkStage::input_endpoint(self)
    }
}

/// A stage the pipeline can drive on its own thread.
pub trait RunStage: Send + Sync + 'static {
    fn run(&self);
    fn name(&self) -> &str;
}

impl<W: StageWorker> RunStage for Stage<W> {
    fn run(&self) {
        Stage::run(self);
    }

    fn name(&self) -> &str {
        Stage::name(self)
    }
}

impl<L: FrameSource> RunStage for SourceStage<L> {
    fn run(&self) {
        SourceStage::run(self);
    }

    fn name(&self) -> &str {
        SourceStage::name(self)
    }
}

impl<S: FrameSink> RunStage for SinkStage<S> {
    fn run(&self) {
        SinkStage::run(self);
    }

    fn name(&self) -> &str {
        SinkStage::name(self)
    }
}

/// Owns the stage threads of one reconstruction graph.
///
/// Wiring (`connect`) happens before any stage runs; `wait` joins every
/// stage after the end-of-stream pill has flushed through.
#[derive(Default)]
pub struct Pipeline {
    threads: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire `from`'s output to `to`'s input queue.
    pub fn connect<T, A, B>(&self, from: &Arc<A>, to: &Arc<B>)
    where
        T: PipelineItem,
        A: HasOutput<T>,
        B: HasInput<T>,
    {
        from.attach_port(Port::new(to.input_endpoint()));
    }

    /// Start `stage` on its own named thread.
    pub fn run<S: RunStage>(&mut self, stage: Arc<S>) {
        let name = stage.name().to_string();
        let handle = std::thread::Builder::new()
            .name(format!("stage-{name}"))
            .spawn(move || {
                tracing::debug!(stage = %name, "stage thread started");
                stage.run();
                tracing::debug!(stage = %name, "stage thread finished");
            })
            .expect("failed to spawn stage thread");
        self.threads.push(handle);
    }

    /// Join every stage thread.
    pub fn wait(&mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}
