//! grabd - frame acquisition daemon
//!
//! Opens the configured capture source and runs the pipeline until the frame
//! budget is spent, Ctrl-C is pressed, or the device fails:
//! 1. Grabs frames with the configured strategy (freshest frame by default)
//! 2. Converts and analyzes each frame into a colour mask
//! 3. Saves numbered images, records an MJPEG AVI, and feeds the live display
//!
//! Exit code 1 means the device failed; everything else exits 0.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use grab_pipeline::{GrabStrategy, GrabberConfig, PipelineController, RunSummary};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "grabd", about = "Acquire frames and fan them out to file, video and display sinks")]
struct Args {
    /// Capture source: stub://<name>[?fps=..&fail=..&fault=..] or a V4L2 device path
    #[arg(long, value_name = "URI")]
    source: Option<String>,

    /// Number of frames to retrieve before stopping
    #[arg(long, value_name = "N")]
    frames: Option<u64>,

    /// Buffer pool capacity
    #[arg(long, value_name = "N")]
    pool: Option<usize>,

    /// Grab strategy (latest_only|all_frames)
    #[arg(long, value_name = "STRATEGY")]
    strategy: Option<String>,

    /// Output directory for images and video
    #[arg(long, value_name = "DIR")]
    out: Option<PathBuf>,

    /// Do not save still images
    #[arg(long)]
    no_save: bool,

    /// Do not record video
    #[arg(long)]
    no_record: bool,

    /// Enable the live display; with a path, keep a PNG preview there
    #[arg(long, value_name = "PREVIEW_PNG", num_args = 0..=1)]
    display: Option<Option<PathBuf>>,

    /// Write the run summary as JSON to this path
    #[arg(long, value_name = "PATH", env = "GRABBER_SUMMARY")]
    summary: Option<PathBuf>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(summary) => std::process::exit(summary.exit_code()),
        Err(err) => {
            log::error!("grabd: {:#}", err);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<RunSummary> {
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, false);

    let mut cfg = GrabberConfig::load().context("load configuration")?;
    apply_args(&mut cfg, &args)?;
    cfg.validate()?;
    let pipeline_config = cfg.pipeline_config();

    if pipeline_config.images.is_some() || pipeline_config.video.is_some() {
        std::fs::create_dir_all(&pipeline_config.output_dir).with_context(|| {
            format!(
                "create output directory {}",
                pipeline_config.output_dir.display()
            )
        })?;
    }

    let controller = PipelineController::new(pipeline_config.clone())
        .map_err(|e| anyhow!("[{}] {}", e.code(), e))
        .context("open pipeline")?;

    let stop = controller.stop_handle();
    ctrlc::set_handler(move || {
        log::warn!("grabd: interrupt received, stopping");
        stop.stop();
    })
    .context("install Ctrl-C handler")?;

    log::info!(
        "grabd: {} frames from {} ({:?}, pool {})",
        pipeline_config.frame_budget,
        pipeline_config.source,
        pipeline_config.strategy,
        pipeline_config.pool_capacity
    );

    let summary = {
        let mut progress = ui.progress("Grab", pipeline_config.frame_budget);
        controller.run_with(|summary| {
            let message = format!(
                "{} processed, {} failed, {} timeouts",
                summary.processed, summary.frame_failures, summary.timeouts
            );
            let retrieved = summary.processed
                + summary.frame_failures
                + summary.conversion_errors
                + summary.analysis_errors;
            progress.update(retrieved, &message);
        })
    };

    print_summary(&summary);
    if let Some(path) = &args.summary {
        let json = serde_json::to_vec_pretty(&summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("write summary {}", path.display()))?;
        log::info!("grabd: summary written to {}", path.display());
    }
    Ok(summary)
}

fn apply_args(cfg: &mut GrabberConfig, args: &Args) -> Result<()> {
    if let Some(source) = &args.source {
        cfg.source = source.clone();
    }
    if let Some(frames) = args.frames {
        cfg.frame_budget = frames;
    }
    if let Some(pool) = args.pool {
        cfg.pool_capacity = pool;
    }
    if let Some(strategy) = &args.strategy {
        cfg.strategy = GrabStrategy::parse(strategy)
            .ok_or_else(|| anyhow!("--strategy must be latest_only or all_frames"))?;
    }
    if let Some(out) = &args.out {
        cfg.output_dir = out.clone();
    }
    if args.no_save {
        cfg.save_images = false;
    }
    if args.no_record {
        cfg.record_video = false;
    }
    if let Some(preview) = &args.display {
        cfg.display = true;
        if let Some(path) = preview {
            cfg.display_settings.preview_path = Some(path.clone());
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("grabd: {:?}", summary.exit);
    println!("  processed:        {}", summary.processed);
    println!("  failed grabs:     {}", summary.frame_failures);
    println!("  timeouts:         {}", summary.timeouts);
    println!(
        "  conversion/analysis errors: {}/{}",
        summary.conversion_errors, summary.analysis_errors
    );
    println!("  stale drops:      {}", summary.acquisition.dropped_stale);
    for (sink, counters) in &summary.sinks {
        println!(
            "  sink {:<8}      {} delivered, {} replaced, {} failed",
            sink, counters.delivered, counters.replaced, counters.failed
        );
    }
    for err in &summary.close_errors {
        println!("  close error:      {}", err);
    }
    if let Some(err) = &summary.fatal_error {
        println!("  fatal:            {}", err);
    }
}
