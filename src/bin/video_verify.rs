//! video_verify - Check that a recorded MJPEG AVI was finalized.
//!
//! This tool proves:
//! - The RIFF size matches the file length
//! - The idx1 index is present and covers every frame chunk
//! - The header frame count matches the chunks actually written
//!
//! With `--decode` every frame is also decoded and its size checked against the
//! stream header.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use grab_pipeline::sink::avi;

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "video_verify", about = "Verify that a recorded AVI container was finalized")]
struct Args {
    /// Path to the AVI file
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Decode every frame
    #[arg(long)]
    decode: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    println!("video_verify: checking {}", args.file.display());
    let info = avi::inspect(&args.file)?;
    println!(
        "  {}x{} @ {} fps, {} frames in header, {} chunks, index: {}",
        info.width,
        info.height,
        info.fps,
        info.total_frames,
        info.chunks,
        info.index_entries
            .map(|n| format!("{} entries", n))
            .unwrap_or_else(|| "missing".to_string())
    );
    if !info.is_finalized() {
        return Err(anyhow!("NOT FINALIZED: container is truncated or missing its index"));
    }

    if args.decode {
        let frames = avi::read_frames(&args.file)?;
        let mut progress = ui.progress("Decode frames", frames.len() as u64);
        for (n, jpeg) in frames.iter().enumerate() {
            let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
                .map_err(|e| anyhow!("frame {}: {}", n, e))?;
            if decoded.width() != info.width || decoded.height() != info.height {
                return Err(anyhow!(
                    "frame {} is {}x{}, stream header says {}x{}",
                    n,
                    decoded.width(),
                    decoded.height(),
                    info.width,
                    info.height
                ));
            }
            progress.update(n as u64 + 1, "");
        }
    }

    println!("OK: video container finalized.");
    Ok(())
}
