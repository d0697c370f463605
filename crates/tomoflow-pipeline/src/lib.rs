//! Staged dataflow runtime.
//!
//! A pipeline is a directed graph of stages wired through bounded queues.
//! Each stage owns its worker threads; frames are [`Image`]s drawn from
//! per-stage pool lanes, moved (never copied) from queue to queue. A slow
//! stage fills its input queue, which blocks the upstream `output` call;
//! backpressure is carried by the queues, not by dropping frames.
//!
//! [`Image`]: tomoflow_gpu::Image

pub mod fanout;
pub mod pipeline;
pub mod port;
pub mod queue;
pub mod stage;

pub use fanout::{DeviceFanout, DeviceKernel, FanoutOptions};
pub use pipeline::{HasInput, HasOutput, Pipeline, RunStage};
pub use port::{InputSide, OutputSide, Port};
pub use queue::Queue;
pub use stage::{
    FrameSink, FrameSource, PipelineItem, SinkStage, SourceStage, Stage, StageWorker,
};
