//! Surround View Demo
//!
//! Runs the full surround-view pipeline on one set of camera frames and
//! saves the composed result. Frames are read from a directory holding
//! `front.png`, `left.png`, `right.png` and `back.png`; when no directory
//! is given (or a frame cannot be read) synthetic test patterns are used
//! instead, so the demo always produces an output.
//!
//! Usage:
//! ```bash
//! cargo run --example surround_demo -- \
//!   --frames-dir assets/scene0 \
//!   --output surround_view.png
//! ```

use clap::Parser;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use surround_view::{
    util, CalibrationPaths, CalibrationStore, Camera, Frame, FrameSet, PipelineConfig,
    SurroundViewPipeline,
};

/// Surround-view composition demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory containing front.png, left.png, right.png, back.png
    #[arg(short = 'd', long)]
    frames_dir: Option<PathBuf>,

    /// Output image path
    #[arg(short = 'o', long, default_value = "surround_view.png")]
    output: PathBuf,

    /// Compose the grid layout instead of the panorama
    #[arg(long)]
    grid: bool,

    /// Run the per-camera stage sequentially
    #[arg(long)]
    serial: bool,
}

fn load_frame(dir: &Path, camera: Camera) -> Option<Frame> {
    let path = dir.join(format!("{camera}.png"));
    match image::open(&path) {
        Ok(img) => {
            let frame = Frame::from_rgb_image(img.to_rgb8());
            info!(
                "loaded {} ({}x{})",
                path.display(),
                frame.width(),
                frame.height()
            );
            Some(frame.fit_within(1920, 1080))
        }
        Err(e) => {
            warn!("could not load {}: {e}", path.display());
            None
        }
    }
}

fn load_frames(cli: &Cli) -> FrameSet {
    if let Some(dir) = &cli.frames_dir {
        let loaded: Vec<Option<Frame>> = Camera::ALL
            .iter()
            .map(|&camera| load_frame(dir, camera))
            .collect();
        if loaded.iter().all(|f| f.is_some()) {
            let mut frames = loaded.into_iter().map(|f| f.unwrap());
            return FrameSet {
                front: frames.next().unwrap(),
                left: frames.next().unwrap(),
                right: frames.next().unwrap(),
                back: frames.next().unwrap(),
            };
        }
        warn!("not all camera frames could be loaded, using test patterns");
    } else {
        info!("no frames directory given, using test patterns");
    }

    // Distinctly tinted grids make each camera's sector recognizable in
    // the composed output.
    let tint = |frame: Frame, rgb: [u8; 3]| {
        let mut tinted = util::flat_color(frame.width(), frame.height(), rgb);
        for y in 0..frame.height() {
            for x in 0..frame.width() {
                let px = frame.get(x, y);
                if px != [0, 0, 0] {
                    tinted.put(x, y, px);
                }
            }
        }
        tinted
    };
    FrameSet {
        front: tint(util::test_grid(800, 600), [120, 40, 40]),
        left: tint(util::test_grid(800, 600), [40, 120, 40]),
        right: tint(util::test_grid(800, 600), [40, 40, 120]),
        back: tint(util::test_grid(800, 600), [120, 120, 40]),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let store = Arc::new(CalibrationStore::load(&CalibrationPaths::default()));
    let config = PipelineConfig::default();
    let pipeline = if cli.serial {
        info!("using serial per-camera processing");
        SurroundViewPipeline::serial(store, config)
    } else {
        SurroundViewPipeline::new(store, config)
    };

    let frames = load_frames(&cli);
    let view = if cli.grid {
        pipeline.produce_grid_view(&frames)?
    } else {
        pipeline.produce_surround_view(&frames)?
    };

    view.to_rgb_image().save(&cli.output)?;
    info!(
        "wrote {} ({}x{})",
        cli.output.display(),
        view.width(),
        view.height()
    );
    Ok(())
}
