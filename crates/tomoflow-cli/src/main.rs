use std::path::Path;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tomoflow_core::ConfigReader;
use tomoflow_gpu::{DeviceMemory, DeviceSet, MemoryPool, PinnedMemory};
use tomoflow_pipeline::{FrameSource, Pipeline, SinkStage, SourceStage};
use tomoflow_recon::attenuation::attenuation_stage;
use tomoflow_recon::backprojection::backprojection_stage;
use tomoflow_recon::copy::{d2h_stage, h2d_stage};
use tomoflow_recon::interpolation::interpolation_stage;
use tomoflow_recon::masking::masking_stage;
use tomoflow_recon::reordering::reordering_stage;
use tomoflow_recon::{OfflineLoader, OfflineSaver, Receiver};

mod cli;

use cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("tomoflow v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Run {
            config,
            address,
            output,
            prefix,
        } => {
            let cfg = ConfigReader::from_file(&config)?;
            let pinned_u16 = MemoryPool::<PinnedMemory<u16>>::new();
            let receiver = Receiver::new(&address, &cfg, pinned_u16.clone())?;
            reconstruct(&cfg, receiver, "receiver", &output, &prefix)?;
            pinned_u16.shutdown();
        }
        Command::Offline {
            config,
            input,
            output,
            prefix,
        } => {
            let cfg = ConfigReader::from_file(&config)?;
            let loader = OfflineLoader::new(&input)?;
            reconstruct(&cfg, loader, "offline-loader", &output, &prefix)?;
        }
    }

    Ok(())
}

/// Assemble and drive the reconstruction graph:
/// source → H2D → reordering → interpolation → attenuation →
/// back-projection → masking → D2H → saver.
fn reconstruct<L>(
    cfg: &ConfigReader,
    loader: L,
    source_name: &str,
    output: &Path,
    prefix: &str,
) -> anyhow::Result<()>
where
    L: FrameSource<Output = tomoflow_gpu::Image<PinnedMemory<u16>>>,
{
    let devices = DeviceSet::detect()?;

    let dev_u16 = MemoryPool::<DeviceMemory<u16>>::new();
    let dev_f32 = MemoryPool::<DeviceMemory<f32>>::new();
    let pinned_f32 = MemoryPool::<PinnedMemory<f32>>::new();

    let source = SourceStage::new(source_name, loader);
    let h2d = h2d_stage(cfg, &devices, dev_u16.clone())?;
    let reordering = reordering_stage(cfg, &devices, dev_u16.clone())?;
    let interpolation = interpolation_stage(cfg, &devices, dev_u16.clone())?;
    let attenuation = attenuation_stage(cfg, &devices, dev_f32.clone())?;
    let backprojection = backprojection_stage(cfg, &devices, dev_f32.clone())?;
    let masking = masking_stage(cfg, &devices, dev_f32.clone())?;
    let d2h = d2h_stage(cfg, &devices, pinned_f32.clone())?;
    let sink = SinkStage::new("saver", OfflineSaver::new(output, prefix)?);

    let mut pipeline = Pipeline::new();
    pipeline.connect(&source, &h2d);
    pipeline.connect(&h2d, &reordering);
    pipeline.connect(&reordering, &interpolation);
    pipeline.connect(&interpolation, &attenuation);
    pipeline.connect(&attenuation, &backprojection);
    pipeline.connect(&backprojection, &masking);
    pipeline.connect(&masking, &d2h);
    pipeline.connect(&d2h, &sink);

    pipeline.run(source);
    pipeline.run(h2d);
    pipeline.run(reordering);
    pipeline.run(interpolation);
    pipeline.run(attenuation);
    pipeline.run(backprojection);
    pipeline.run(masking);
    pipeline.run(d2h);
    pipeline.run(sink.clone());

    tracing::info!("initialization finished");
    pipeline.wait();

    tracing::info!(slices = sink.received(), "reconstruction finished");

    dev_u16.shutdown();
    dev_f32.shutdown();
    pinned_f32.shutdown();
    Ok(())
}
