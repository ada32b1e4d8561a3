//! Lens undistortion and vehicle-body cropping.
//!
//! This stage corrects a raw camera frame using the camera's intrinsic
//! parameters, then crops out the parts of the field of view occupied by
//! the vehicle body. The omnidirectional parameter `xi` partitions the
//! algorithm: strongly fisheye cameras (`xi > 0.5`) go through an
//! equidistant inverse mapping with an aggressively reduced focal length,
//! everything else through a Brown-Conrady mapping with a milder
//! reduction. Undistortion failures are always recovered locally by
//! returning the best prior-stage image; this stage is never fatal for
//! the pipeline.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::calibration::{Camera, CameraIntrinsics};
use crate::frame::Frame;

/// Focal-length fraction applied on the fisheye path. Shrinking the target
/// matrix widens the field captured after correction.
pub const FISHEYE_FOCAL_SCALE: f64 = 0.45;
/// Focal-length fraction applied on the standard path.
pub const STANDARD_FOCAL_SCALE: f64 = 0.6;
/// Mean-luminance floor below which an undistorted result is treated as
/// failed (effectively a black image).
pub const NEAR_BLACK_MEAN: f64 = 5.0;

#[derive(thiserror::Error, Debug)]
pub enum UndistortError {
    #[error("degenerate camera matrix (fx={fx}, fy={fy})")]
    DegenerateCameraMatrix { fx: f64, fy: f64 },
    #[error("fisheye mapping diverged for the corner ray")]
    DivergentMapping,
}

/// Fractional crop margins for one camera, measured inward from each edge.
///
/// The margins are empirically fixed per camera position: front and back
/// remove a deep bottom band (hood and trunk), while the side cameras are
/// cropped asymmetrically toward the forward-looking side to keep the
/// vehicle frame out of view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CropSpec {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
}

impl CropSpec {
    /// The fixed crop geometry for each camera position.
    pub fn for_camera(camera: Camera) -> CropSpec {
        match camera {
            Camera::Front => CropSpec {
                top: 0.15,
                bottom: 0.40,
                left: 0.15,
                right: 0.15,
            },
            Camera::Back => CropSpec {
                top: 0.15,
                bottom: 0.35,
                left: 0.15,
                right: 0.15,
            },
            Camera::Left => CropSpec {
                top: 0.15,
                bottom: 0.35,
                left: 0.25,
                right: 0.35,
            },
            Camera::Right => CropSpec {
                top: 0.15,
                bottom: 0.35,
                left: 0.35,
                right: 0.25,
            },
        }
    }

    /// Applies the crop to a frame. An invalid resulting rectangle returns
    /// the input unchanged rather than an empty image.
    pub fn apply(&self, frame: &Frame) -> Frame {
        if frame.is_empty() {
            return Frame::empty();
        }
        let width = frame.width() as f64;
        let height = frame.height() as f64;
        let x = (width * self.left) as u32;
        let y = (height * self.top) as u32;
        let w = width - width * self.left - width * self.right;
        let h = height - height * self.top - height * self.bottom;
        if w < 1.0 || h < 1.0 {
            warn!("invalid crop rectangle, keeping uncropped frame");
            return frame.clone();
        }
        frame.crop(x, y, w as u32, h as u32)
    }
}

/// Undistorts a raw frame and removes vehicle-body occlusion.
///
/// Implements the full correction sequence: xi-partitioned inverse
/// mapping (with standard-path fallback when the fisheye mapping cannot
/// be evaluated), camera-specific cropping, optional scale/shift
/// correction, and a near-black validation that returns the original
/// frame when the correction produced an unusable result.
pub fn undistort(frame: &Frame, camera: Camera, params: &CameraIntrinsics) -> Frame {
    if frame.is_empty() {
        return Frame::empty();
    }

    let undistorted = if params.is_fisheye() {
        debug!(
            "camera {camera}: xi={} selects the fisheye path",
            params.xi
        );
        match remap_fisheye(frame, params, FISHEYE_FOCAL_SCALE) {
            Ok(result) => result,
            Err(e) => {
                warn!("camera {camera}: fisheye undistortion failed ({e}), trying standard");
                remap_standard(frame, params, FISHEYE_FOCAL_SCALE)
            }
        }
    } else {
        remap_standard(frame, params, STANDARD_FOCAL_SCALE)
    };

    let cropped = CropSpec::for_camera(camera).apply(&undistorted);

    let corrected = if params.has_scale_shift() {
        debug!(
            "camera {camera}: applying scale ({}, {}) and shift ({}, {})",
            params.scale.x, params.scale.y, params.shift.x, params.shift.y
        );
        cropped.scale_shift(
            (params.scale.x, params.scale.y),
            (params.shift.x, params.shift.y),
        )
    } else {
        cropped
    };

    let mean = corrected.mean_luminance();
    if mean < NEAR_BLACK_MEAN {
        warn!(
            "camera {camera}: undistorted image is mostly black (mean={mean:.2}), keeping original"
        );
        return frame.clone();
    }

    corrected
}

/// Equidistant (fisheye) undistortion by inverse mapping.
///
/// For every output pixel the ideal ray through the reduced-focal target
/// matrix is distorted forward with the equidistant polynomial
/// `theta_d = theta * (1 + k1 th^2 + k2 th^4 + k3 th^6 + k4 th^8)` and the
/// distorted ray is projected through the original `K` to find the source
/// pixel. Fails when the camera matrix is degenerate or the polynomial
/// diverges for the widest ray the output can request.
pub fn remap_fisheye(
    frame: &Frame,
    params: &CameraIntrinsics,
    focal_scale: f64,
) -> Result<Frame, UndistortError> {
    let fx = params.fx();
    let fy = params.fy();
    if fx <= 0.0 || fy <= 0.0 || !fx.is_finite() || !fy.is_finite() {
        return Err(UndistortError::DegenerateCameraMatrix { fx, fy });
    }

    let new_fx = fx * focal_scale;
    let new_fy = fy * focal_scale;
    let cx = params.cx();
    let cy = params.cy();

    // Probe the widest ray the output will request. A diverging distortion
    // polynomial shows up here as a non-finite scale.
    let corner_x = (frame.width() as f64 - cx).abs().max(cx) / new_fx;
    let corner_y = (frame.height() as f64 - cy).abs().max(cy) / new_fy;
    let corner_r = (corner_x * corner_x + corner_y * corner_y).sqrt();
    if !fisheye_scale(corner_r, &params.d.into()).is_finite() {
        return Err(UndistortError::DivergentMapping);
    }

    let d: [f64; 4] = params.d.into();
    Ok(frame.remap(frame.width(), frame.height(), move |u, v| {
        let x = (u - cx) / new_fx;
        let y = (v - cy) / new_fy;
        let r = (x * x + y * y).sqrt();
        let scale = fisheye_scale(r, &d);
        (fx * x * scale + cx, fy * y * scale + cy)
    }))
}

#[inline]
fn fisheye_scale(r: f64, d: &[f64; 4]) -> f64 {
    if r < 1e-12 {
        return 1.0;
    }
    let theta = r.atan();
    let t2 = theta * theta;
    let theta_d = theta * (1.0 + t2 * (d[0] + t2 * (d[1] + t2 * (d[2] + t2 * d[3]))));
    theta_d / r
}

/// Brown-Conrady undistortion by inverse mapping.
///
/// `D` is interpreted as `[k1, k2, p1, p2]`: two radial and two tangential
/// coefficients applied forward to the ideal ray.
pub fn remap_standard(frame: &Frame, params: &CameraIntrinsics, focal_scale: f64) -> Frame {
    let fx = params.fx();
    let fy = params.fy();
    let cx = params.cx();
    let cy = params.cy();
    let new_fx = fx * focal_scale;
    let new_fy = fy * focal_scale;
    let (k1, k2, p1, p2) = (params.d[0], params.d[1], params.d[2], params.d[3]);

    frame.remap(frame.width(), frame.height(), move |u, v| {
        let x = (u - cx) / new_fx;
        let y = (v - cy) / new_fy;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (fx * xd + cx, fy * yd + cy)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector2, Vector4};

    fn identity_params(width: f64, height: f64, xi: f64) -> CameraIntrinsics {
        CameraIntrinsics {
            k: Matrix3::new(
                width, 0.0, width / 2.0,
                0.0, height, height / 2.0,
                0.0, 0.0, 1.0,
            ),
            d: Vector4::zeros(),
            xi,
            scale: Vector2::new(1.0, 1.0),
            shift: Vector2::zeros(),
        }
    }

    fn bright_gradient(width: u32, height: u32) -> Frame {
        let mut frame = Frame::new(width, height);
        for y in 0..height {
            for x in 0..width {
                frame.put(x, y, [120, (60 + x % 100) as u8, (60 + y % 100) as u8]);
            }
        }
        frame
    }

    #[test]
    fn test_zero_distortion_unit_focal_scale_is_identity() {
        let frame = bright_gradient(64, 48);
        let params = identity_params(64.0, 48.0, 0.0);
        let out = remap_standard(&frame, &params, 1.0);
        // With zero coefficients and no focal reduction, every interior
        // pixel maps onto itself.
        for y in 1..47 {
            for x in 1..63 {
                assert_eq!(out.get(x, y), frame.get(x, y), "pixel ({x},{y})");
            }
        }
    }

    #[test]
    fn test_focal_reduction_zooms_out() {
        let frame = bright_gradient(64, 48);
        let params = identity_params(64.0, 48.0, 0.0);
        let out = remap_standard(&frame, &params, 0.5);
        // The center pixel is preserved, the far corners now map outside
        // the source and stay black.
        assert_eq!(out.get(32, 24), frame.get(32, 24));
        assert_eq!(out.get(0, 0), [0, 0, 0]);
    }

    #[test]
    fn test_crop_specs_are_asymmetric_for_side_cameras() {
        let left = CropSpec::for_camera(Camera::Left);
        let right = CropSpec::for_camera(Camera::Right);
        assert_eq!(left.left, right.right);
        assert_eq!(left.right, right.left);
        assert!(left.left < left.right);

        let frame = bright_gradient(100, 100);
        let cropped = CropSpec::for_camera(Camera::Front).apply(&frame);
        assert_eq!((cropped.width(), cropped.height()), (70, 45));
    }

    #[test]
    fn test_near_black_result_keeps_original() {
        // A frame dark enough that any undistorted result fails the mean
        // check, so the original comes back untouched.
        let mut frame = Frame::new(32, 32);
        for y in 0..32 {
            for x in 0..32 {
                frame.put(x, y, [2, 2, 2]);
            }
        }
        let params = identity_params(32.0, 32.0, 0.0);
        let out = undistort(&frame, Camera::Front, &params);
        assert_eq!(out, frame);
    }

    #[test]
    fn test_fisheye_path_produces_cropped_frame() {
        let frame = bright_gradient(80, 60);
        let mut params = identity_params(80.0, 60.0, 1.1);
        params.d = Vector4::new(-0.02, 0.001, 0.0, 0.0);
        let out = undistort(&frame, Camera::Back, &params);
        assert!(!out.is_empty());
        // Back camera crop: 70% of width, 50% of height.
        assert_eq!((out.width(), out.height()), (56, 30));
    }

    #[test]
    fn test_divergent_fisheye_polynomial_is_rejected() {
        let frame = bright_gradient(32, 32);
        let mut params = identity_params(32.0, 32.0, 1.0);
        params.d = Vector4::new(f64::NAN, 0.0, 0.0, 0.0);
        assert!(matches!(
            remap_fisheye(&frame, &params, FISHEYE_FOCAL_SCALE),
            Err(UndistortError::DivergentMapping)
        ));
    }

    #[test]
    fn test_empty_input_passes_through() {
        let params = identity_params(1.0, 1.0, 0.0);
        assert!(undistort(&Frame::empty(), Camera::Left, &params).is_empty());
    }
}
