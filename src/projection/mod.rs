//! Cylindrical coordinate projection.
//!
//! Remaps an undistorted, rotated frame into cylindrical image
//! coordinates, where horizontal pixel distance corresponds to an
//! approximately uniform angular increment. The panorama compositor
//! requires this property before different cameras' angular sectors can
//! be blended onto a shared polar canvas.

use log::warn;

use crate::frame::Frame;

/// Maps a cartesian image point into cylindrical coordinates about
/// `center` at focal length `focal`.
pub fn cartesian_to_cylindrical(point: (f64, f64), center: (f64, f64), focal: f64) -> (f64, f64) {
    let dx = point.0 - center.0;
    let theta = dx.atan2(focal);
    let h = (point.1 - center.1) * focal / (dx * dx + focal * focal).sqrt();
    (center.0 + focal * theta, center.1 + h)
}

/// Inverse of [`cartesian_to_cylindrical`]. Not used by the forward
/// construction pipeline; defined for completeness and testing.
pub fn cylindrical_to_cartesian(point: (f64, f64), center: (f64, f64), focal: f64) -> (f64, f64) {
    let theta = (point.0 - center.0) / focal;
    let dx = focal * theta.tan();
    let y = center.1 + (point.1 - center.1) * (dx * dx + focal * focal).sqrt() / focal;
    (center.0 + dx, y)
}

/// Projects a frame onto a cylinder of the given focal length.
///
/// Inverse mapping per output pixel: the destination coordinate is read
/// through [`cartesian_to_cylindrical`] to find the source pixel; sources
/// outside the image leave the destination at background zero. The output
/// has the same raster dimensions as the input.
pub fn project_to_cylindrical(frame: &Frame, focal: f64) -> Frame {
    if frame.is_empty() {
        return Frame::empty();
    }
    if focal <= 0.0 || !focal.is_finite() {
        warn!("invalid cylindrical focal length {focal}");
        return Frame::empty();
    }
    let center = (frame.width() as f64 / 2.0, frame.height() as f64 / 2.0);
    frame.remap(frame.width(), frame.height(), move |x, y| {
        cartesian_to_cylindrical((x, y), center, focal)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cylindrical_round_trip() {
        let center = (400.0, 300.0);
        let focal = 400.0;
        // Points strictly inside the projected region, away from the
        // clamped boundaries.
        for &point in &[
            (400.0, 300.0),
            (250.5, 180.25),
            (520.0, 410.0),
            (100.0, 50.0),
        ] {
            let cyl = cartesian_to_cylindrical(point, center, focal);
            let back = cylindrical_to_cartesian(cyl, center, focal);
            assert_relative_eq!(back.0, point.0, epsilon = 1e-9);
            assert_relative_eq!(back.1, point.1, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_center_is_fixed_point() {
        let center = (320.0, 240.0);
        let cyl = cartesian_to_cylindrical(center, center, 320.0);
        assert_relative_eq!(cyl.0, center.0);
        assert_relative_eq!(cyl.1, center.1);
    }

    #[test]
    fn test_projection_preserves_dimensions() {
        let mut frame = Frame::new(80, 60);
        for y in 0..60 {
            for x in 0..80 {
                frame.put(x, y, [200, 100, 50]);
            }
        }
        let projected = project_to_cylindrical(&frame, 40.0);
        assert_eq!(projected.width(), 80);
        assert_eq!(projected.height(), 60);
        // The center column is untouched by the angular remap.
        assert_eq!(projected.get(40, 30), [200, 100, 50]);
    }

    #[test]
    fn test_empty_or_degenerate_input_yields_empty() {
        assert!(project_to_cylindrical(&Frame::empty(), 100.0).is_empty());
        let frame = Frame::new(10, 10);
        assert!(project_to_cylindrical(&frame, 0.0).is_empty());
        assert!(project_to_cylindrical(&frame, f64::NAN).is_empty());
    }
}
