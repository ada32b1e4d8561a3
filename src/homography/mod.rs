//! Planar perspective transforms.
//!
//! Supporting projections around the main pipeline: a bird's-eye ground
//! view, the front-camera perspective correction, and the side-camera
//! straightening that reduces the U-shaped warp left over after fisheye
//! undistortion.

use log::warn;

use crate::calibration::Camera;
use crate::frame::Frame;

/// A 3x3 planar homography with its inverse, estimated from four point
/// correspondences.
#[derive(Debug, Clone)]
pub struct PerspectiveTransform {
    matrix: [f64; 9],
    inverse: [f64; 9],
}

impl PerspectiveTransform {
    /// Estimates the transform mapping each `src[i]` onto `dst[i]` with
    /// the direct linear transform. Degenerate correspondences fall back
    /// to the identity transform.
    pub fn from_correspondences(src: [(f64, f64); 4], dst: [(f64, f64); 4]) -> Self {
        PerspectiveTransform {
            matrix: homography_from_points(src, dst),
            inverse: homography_from_points(dst, src),
        }
    }

    pub fn transform_point(&self, x: f64, y: f64) -> (f64, f64) {
        apply_homography(&self.matrix, x, y)
    }

    pub fn inverse_transform_point(&self, x: f64, y: f64) -> (f64, f64) {
        apply_homography(&self.inverse, x, y)
    }

    /// Warps a frame through the transform by inverse mapping; the output
    /// has the input's dimensions and out-of-bounds sources stay black.
    pub fn warp(&self, frame: &Frame) -> Frame {
        let inverse = self.inverse;
        frame.remap(frame.width(), frame.height(), move |x, y| {
            apply_homography(&inverse, x, y)
        })
    }
}

/// Warps a frame into an approximate bird's-eye ground view using the
/// fixed road-plane quadrilaterals.
pub fn bird_eye_view(frame: &Frame) -> Frame {
    if frame.is_empty() {
        return Frame::empty();
    }
    let w = frame.width() as f64;
    let h = frame.height() as f64;
    let src = [
        (0.0, h),
        (w, h),
        (w * 0.15, h * 0.3),
        (w * 0.85, h * 0.3),
    ];
    let dst = [
        (w * 0.25, h),
        (w * 0.75, h),
        (w * 0.75, h * 0.2),
        (w * 0.25, h * 0.2),
    ];
    PerspectiveTransform::from_correspondences(src, dst).warp(frame)
}

/// The front camera's perspective-flattening homography.
pub fn front_camera_correction(frame: &Frame) -> Frame {
    if frame.is_empty() {
        return Frame::empty();
    }
    let w = frame.width() as f64;
    let h = frame.height() as f64;
    let src = [
        (w * 0.05, h * 0.75),
        (w * 0.95, h * 0.75),
        (w * 0.35, h * 0.45),
        (w * 0.65, h * 0.45),
    ];
    let dst = [
        (w * 0.3, h * 0.85),
        (w * 0.7, h * 0.85),
        (w * 0.3, h * 0.4),
        (w * 0.7, h * 0.4),
    ];
    PerspectiveTransform::from_correspondences(src, dst).warp(frame)
}

/// Straightens the residual curve of the vehicle frame in the side
/// cameras. Front and back need no correction and pass through.
pub fn correct_perspective(frame: &Frame, camera: Camera) -> Frame {
    if frame.is_empty() {
        return Frame::empty();
    }
    let w = frame.width() as f64;
    let h = frame.height() as f64;
    let (src, dst) = match camera {
        Camera::Left => (
            [
                (w * 0.1, h * 0.2),
                (w * 0.9, h * 0.1),
                (w * 0.1, h * 0.8),
                (w * 0.9, h * 0.9),
            ],
            [
                (w * 0.1, h * 0.2),
                (w * 0.8, h * 0.1),
                (w * 0.1, h * 0.8),
                (w * 0.8, h * 0.9),
            ],
        ),
        Camera::Right => (
            [
                (w * 0.1, h * 0.1),
                (w * 0.9, h * 0.2),
                (w * 0.1, h * 0.9),
                (w * 0.9, h * 0.8),
            ],
            [
                (w * 0.2, h * 0.1),
                (w * 0.9, h * 0.2),
                (w * 0.2, h * 0.9),
                (w * 0.9, h * 0.8),
            ],
        ),
        Camera::Front | Camera::Back => return frame.clone(),
    };
    PerspectiveTransform::from_correspondences(src, dst).warp(frame)
}

/// DLT estimate of the homography mapping `src` points onto `dst`
/// points.
fn homography_from_points(src: [(f64, f64); 4], dst: [(f64, f64); 4]) -> [f64; 9] {
    // Two equations per correspondence, eight unknowns with h9 fixed
    // to 1.
    let mut a = [[0.0f64; 8]; 8];
    let mut b = [0.0f64; 8];

    for i in 0..4 {
        let (x, y) = src[i];
        let (xp, yp) = dst[i];

        a[i * 2] = [x, y, 1.0, 0.0, 0.0, 0.0, -xp * x, -xp * y];
        b[i * 2] = xp;
        a[i * 2 + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -yp * x, -yp * y];
        b[i * 2 + 1] = yp;
    }

    match solve_linear_system(&mut a, &mut b) {
        Some(h) => [h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0],
        None => {
            warn!("degenerate correspondences, falling back to identity homography");
            [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
        }
    }
}

/// Gaussian elimination with partial pivoting on an 8x8 system. Returns
/// `None` when the system is singular.
fn solve_linear_system(a: &mut [[f64; 8]; 8], b: &mut [f64; 8]) -> Option<[f64; 8]> {
    let n = 8;

    for col in 0..n {
        let mut max_row = col;
        let mut max_val = a[col][col].abs();
        for row in (col + 1)..n {
            if a[row][col].abs() > max_val {
                max_val = a[row][col].abs();
                max_row = row;
            }
        }
        if max_row != col {
            a.swap(col, max_row);
            b.swap(col, max_row);
        }

        let pivot = a[col][col];
        if pivot.abs() < 1e-10 {
            return None;
        }
        for row in (col + 1)..n {
            let factor = a[row][col] / pivot;
            for j in col..n {
                a[row][j] -= factor * a[col][j];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0f64; 8];
    for i in (0..n).rev() {
        let mut sum = b[i];
        for j in (i + 1)..n {
            sum -= a[i][j] * x[j];
        }
        x[i] = sum / a[i][i];
    }
    Some(x)
}

#[inline]
fn apply_homography(h: &[f64; 9], x: f64, y: f64) -> (f64, f64) {
    let w = h[6] * x + h[7] * y + h[8];
    if w.abs() < 1e-10 {
        return (x, y);
    }
    (
        (h[0] * x + h[1] * y + h[2]) / w,
        (h[3] * x + h[4] * y + h[5]) / w,
    )
}
