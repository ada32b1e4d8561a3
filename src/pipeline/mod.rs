//! Pipeline orchestration across concurrent per-camera tasks.
//!
//! The undistort+rotate stage is independent per camera, so the pipeline
//! dispatches it as four tasks on a worker pool, each delivering its
//! result through a one-shot channel. The orchestrator blocks only at the
//! join barrier; once all four results are in, the cylindrical projection
//! and panorama composition run single-threaded. When no worker pool is
//! available the pipeline degrades to sequential execution with identical
//! stage logic.

use log::{info, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;

use crate::calibration::{CalibrationStore, Camera};
use crate::frame::Frame;
use crate::panorama::{self, ComposeError, PanoramaConfig};
use crate::projection::project_to_cylindrical;
use crate::undistort::undistort;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("input frame for camera {0} is empty")]
    InputEmpty(Camera),
    #[error("camera {0} task failed: {1}")]
    CameraTask(Camera, String),
    #[error("cylindrical projection produced an empty frame for camera {0}")]
    Projection(Camera),
    #[error("panorama composition failed: {0}")]
    Composition(#[from] ComposeError),
}

/// The four raw camera frames of one capture instant.
#[derive(Debug, Clone)]
pub struct FrameSet {
    pub front: Frame,
    pub left: Frame,
    pub right: Frame,
    pub back: Frame,
}

impl FrameSet {
    pub fn get(&self, camera: Camera) -> &Frame {
        match camera {
            Camera::Front => &self.front,
            Camera::Left => &self.left,
            Camera::Right => &self.right,
            Camera::Back => &self.back,
        }
    }

    fn set(&mut self, camera: Camera, frame: Frame) {
        match camera {
            Camera::Front => self.front = frame,
            Camera::Left => self.left = frame,
            Camera::Right => self.right = frame,
            Camera::Back => self.back = frame,
        }
    }

    pub fn empty() -> Self {
        FrameSet {
            front: Frame::empty(),
            left: Frame::empty(),
            right: Frame::empty(),
            back: Frame::empty(),
        }
    }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub panorama: PanoramaConfig,
    /// Cylindrical focal length as a fraction of each frame's width.
    pub cylinder_focal_ratio: f64,
    /// Worker pool size; `None` sizes the pool to the available hardware
    /// concurrency.
    pub worker_threads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            panorama: PanoramaConfig::default(),
            cylinder_focal_ratio: 0.5,
            worker_threads: None,
        }
    }
}

/// Orchestrates undistortion, rotation, projection and composition for
/// one capture instant.
///
/// The calibration store is shared read-only across the per-camera tasks;
/// tasks are created and joined per invocation with no persistent
/// per-camera affinity.
pub struct SurroundViewPipeline {
    store: Arc<CalibrationStore>,
    config: PipelineConfig,
    pool: Option<rayon::ThreadPool>,
}

impl SurroundViewPipeline {
    /// Creates a pipeline with a worker pool. If the pool cannot be
    /// built, the pipeline silently degrades to sequential execution.
    pub fn new(store: Arc<CalibrationStore>, config: PipelineConfig) -> Self {
        let threads = config.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        });
        let pool = match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
            Ok(pool) => {
                info!("initialized worker pool with {threads} threads");
                Some(pool)
            }
            Err(e) => {
                warn!("could not build worker pool ({e}), using serial processing");
                None
            }
        };
        SurroundViewPipeline {
            store,
            config,
            pool,
        }
    }

    /// Creates a pipeline that always runs the per-camera stage
    /// sequentially.
    pub fn serial(store: Arc<CalibrationStore>, config: PipelineConfig) -> Self {
        SurroundViewPipeline {
            store,
            config,
            pool: None,
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    /// Produces the panoramic surround view for one set of frames.
    ///
    /// Any empty input frame and any per-camera task failure is fatal for
    /// this invocation; the caller is expected to keep displaying its
    /// previous good frame. No partial panorama is ever produced.
    pub fn produce_surround_view(&self, frames: &FrameSet) -> Result<Frame, PipelineError> {
        self.validate(frames)?;
        let processed = self.process_all(frames)?;

        let mut projected = FrameSet::empty();
        for camera in Camera::ALL {
            let frame = processed.get(camera);
            let focal = self.config.cylinder_focal_ratio * frame.width() as f64;
            let cylindrical = project_to_cylindrical(frame, focal);
            if cylindrical.is_empty() {
                return Err(PipelineError::Projection(camera));
            }
            projected.set(camera, cylindrical);
        }

        let panorama = panorama::compose_panorama(
            &projected.front,
            &projected.left,
            &projected.right,
            &projected.back,
            &self.config.panorama,
        )?;
        Ok(panorama)
    }

    /// Produces the grid-layout surround view, sharing the per-camera
    /// stage with the panoramic mode.
    pub fn produce_grid_view(&self, frames: &FrameSet) -> Result<Frame, PipelineError> {
        self.validate(frames)?;
        let processed = self.process_all(frames)?;
        let view = panorama::compose_grid(
            &processed.front,
            &processed.left,
            &processed.right,
            &processed.back,
        )?;
        Ok(view)
    }

    fn validate(&self, frames: &FrameSet) -> Result<(), PipelineError> {
        for camera in Camera::ALL {
            if frames.get(camera).is_empty() {
                warn!("camera {camera} frame is empty, skipping this invocation");
                return Err(PipelineError::InputEmpty(camera));
            }
        }
        Ok(())
    }

    fn process_all(&self, frames: &FrameSet) -> Result<FrameSet, PipelineError> {
        match &self.pool {
            Some(pool) => self.process_parallel(pool, frames),
            None => {
                let mut processed = FrameSet::empty();
                for camera in Camera::ALL {
                    processed.set(
                        camera,
                        process_camera(&self.store, camera, frames.get(camera)),
                    );
                }
                Ok(processed)
            }
        }
    }

    /// Fans the per-camera stage out on the worker pool and joins all
    /// four one-shot result channels.
    ///
    /// A panicking task drops its sender, which the join observes as a
    /// receive error; the whole invocation then fails rather than
    /// composing a partial panorama.
    fn process_parallel(
        &self,
        pool: &rayon::ThreadPool,
        frames: &FrameSet,
    ) -> Result<FrameSet, PipelineError> {
        let mut receivers = Vec::with_capacity(Camera::ALL.len());
        for camera in Camera::ALL {
            let (sender, receiver) = mpsc::channel::<Frame>();
            let store = Arc::clone(&self.store);
            let frame = frames.get(camera).clone();
            pool.spawn(move || {
                let result =
                    catch_unwind(AssertUnwindSafe(|| process_camera(&store, camera, &frame)));
                if let Ok(processed) = result {
                    // A send on a dropped receiver only happens when the
                    // join already gave up on this invocation.
                    let _ = sender.send(processed);
                }
            });
            receivers.push((camera, receiver));
        }

        let mut processed = FrameSet::empty();
        for (camera, receiver) in receivers {
            match receiver.recv() {
                Ok(frame) => processed.set(camera, frame),
                Err(_) => {
                    return Err(PipelineError::CameraTask(
                        camera,
                        "task terminated before delivering a result".to_string(),
                    ));
                }
            }
        }
        Ok(processed)
    }
}

/// The per-camera stage: undistort with the camera's intrinsics, then
/// apply the camera's canonical rotation. Cameras without calibration
/// pass through uncorrected.
fn process_camera(store: &CalibrationStore, camera: Camera, frame: &Frame) -> Frame {
    let corrected = match store.intrinsics(camera) {
        Some(params) => undistort(frame, camera, params),
        None => {
            warn!("no intrinsics for camera {camera}, passing frame through");
            frame.clone()
        }
    };
    corrected.rotate(camera.rotation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CameraIntrinsics;
    use crate::util::flat_color;
    use nalgebra::{Matrix3, Vector2, Vector4};
    use std::collections::BTreeMap;

    fn synthetic_store(width: f64, height: f64) -> Arc<CalibrationStore> {
        let mut intrinsics = BTreeMap::new();
        for camera in Camera::ALL {
            intrinsics.insert(
                camera,
                CameraIntrinsics {
                    k: Matrix3::new(
                        width, 0.0, width / 2.0,
                        0.0, height, height / 2.0,
                        0.0, 0.0, 1.0,
                    ),
                    d: Vector4::zeros(),
                    xi: 0.0,
                    scale: Vector2::new(1.0, 1.0),
                    shift: Vector2::zeros(),
                },
            );
        }
        Arc::new(CalibrationStore::from_parts(intrinsics, BTreeMap::new()))
    }

    fn synthetic_frames() -> FrameSet {
        FrameSet {
            front: flat_color(800, 600, [200, 0, 0]),
            left: flat_color(800, 600, [0, 200, 0]),
            right: flat_color(800, 600, [0, 0, 200]),
            back: flat_color(800, 600, [200, 200, 0]),
        }
    }

    /// Which camera's flat color dominates a pixel, if any.
    fn dominant(rgb: [u8; 3]) -> Option<Camera> {
        let [r, g, b] = rgb;
        if r > 100 && g > 100 && b < 50 {
            Some(Camera::Back)
        } else if r > 100 && g < 50 && b < 50 {
            Some(Camera::Front)
        } else if g > 100 && r < 50 && b < 50 {
            Some(Camera::Left)
        } else if b > 100 && r < 50 && g < 50 {
            Some(Camera::Right)
        } else {
            None
        }
    }

    #[test]
    fn test_empty_input_is_fatal_without_panic() {
        let pipeline =
            SurroundViewPipeline::serial(synthetic_store(800.0, 600.0), PipelineConfig::default());
        let mut frames = synthetic_frames();
        frames.right = Frame::empty();
        let err = pipeline.produce_surround_view(&frames).unwrap_err();
        assert!(matches!(err, PipelineError::InputEmpty(Camera::Right)));
    }

    #[test]
    fn test_end_to_end_panorama_sectors() {
        let pipeline =
            SurroundViewPipeline::serial(synthetic_store(800.0, 600.0), PipelineConfig::default());
        let panorama = pipeline
            .produce_surround_view(&synthetic_frames())
            .unwrap();
        assert_eq!((panorama.width(), panorama.height()), (2400, 1200));

        let config = PanoramaConfig::default();
        let cx = 1200.0;
        let cy = 600.0;
        let r = (config.inner_radius + config.outer_radius) / 2.0;

        // Sector centers carry their camera's color; sweep a few angles
        // around each center to check the wedge is contiguous.
        for (camera, center_deg) in [
            (Camera::Front, 270.0),
            (Camera::Left, 0.0),
            (Camera::Back, 90.0),
            (Camera::Right, 180.0),
        ] {
            for offset in [-25.0f64, -10.0, 0.0, 10.0, 25.0] {
                let a = (center_deg + offset).to_radians();
                let x = (cx + r * a.cos()) as u32;
                let y = (cy + r * a.sin()) as u32;
                assert_eq!(
                    dominant(panorama.get(x, y)),
                    Some(camera),
                    "angle {center_deg}+{offset} expected {camera}"
                );
            }
        }

        // The canvas center shows the vehicle placeholder, not any
        // camera color.
        assert_eq!(panorama.get(1200, 600), panorama::VEHICLE_FILL);
    }

    #[test]
    fn test_serial_and_parallel_agree_on_dimensions() {
        let store = synthetic_store(800.0, 600.0);
        let frames = synthetic_frames();

        let serial = SurroundViewPipeline::serial(Arc::clone(&store), PipelineConfig::default());
        let parallel = SurroundViewPipeline::new(
            store,
            PipelineConfig {
                worker_threads: Some(4),
                ..PipelineConfig::default()
            },
        );
        assert!(parallel.is_parallel());

        let from_serial = serial.produce_surround_view(&frames).unwrap();
        let from_parallel = parallel.produce_surround_view(&frames).unwrap();
        assert!(!from_serial.is_empty());
        assert!(!from_parallel.is_empty());
        assert_eq!(from_serial.width(), from_parallel.width());
        assert_eq!(from_serial.height(), from_parallel.height());
    }

    #[test]
    fn test_uncalibrated_store_passes_frames_through() {
        let store = Arc::new(CalibrationStore::default());
        let pipeline = SurroundViewPipeline::serial(store, PipelineConfig::default());
        let panorama = pipeline
            .produce_surround_view(&synthetic_frames())
            .unwrap();
        assert_eq!((panorama.width(), panorama.height()), (2400, 1200));
    }

    #[test]
    fn test_grid_view_end_to_end() {
        let pipeline =
            SurroundViewPipeline::serial(synthetic_store(800.0, 600.0), PipelineConfig::default());
        let view = pipeline.produce_grid_view(&synthetic_frames()).unwrap();
        assert_eq!((view.width(), view.height()), (2280, 2240));
    }
}
