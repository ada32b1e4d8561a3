//! Surround View Library
//!
//! A Rust library for fusing four wide-angle vehicle camera feeds (front,
//! left, right, back) into a single seamless panoramic surround-view
//! raster. The pipeline performs:
//! - Lens undistortion (xi-partitioned between a fisheye and a standard
//!   model) and per-camera vehicle-body cropping
//! - Cylindrical coordinate projection
//! - Angular-sector blending onto a shared panorama canvas
//!
//! The per-camera stages run as independent concurrent tasks sharing the
//! read-only [`calibration::CalibrationStore`]; a serial fallback with
//! identical stage logic is used when no worker pool is available.

pub mod calibration;
pub mod frame;
pub mod homography;
pub mod panorama;
pub mod pipeline;
pub mod projection;
pub mod undistort;
pub mod util;

// Re-export commonly used types
pub use calibration::{
    CalibrationError, CalibrationPaths, CalibrationStore, Camera, CameraExtrinsics,
    CameraIntrinsics,
};
pub use frame::{Frame, FrameError, Rotation};
pub use panorama::{ComposeError, PanoramaCanvas, PanoramaConfig, SectorSpec};
pub use pipeline::{FrameSet, PipelineConfig, PipelineError, SurroundViewPipeline};
pub use projection::{cartesian_to_cylindrical, cylindrical_to_cartesian, project_to_cylindrical};
pub use undistort::{undistort, CropSpec};
