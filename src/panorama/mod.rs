//! Panoramic composition of the four projected camera frames.
//!
//! Every camera owns a fixed angular sector of the output canvas. For
//! each canvas pixel inside the panorama annulus the compositor finds the
//! sector(s) covering the pixel's polar angle, samples the corresponding
//! projected frame, and accumulates the samples under continuous blend
//! weights so that neighboring cameras mix smoothly instead of switching
//! abruptly at sector boundaries. The accumulated canvas is normalized by
//! total weight, small gaps are filled from their neighborhood, and a
//! vehicle placeholder is drawn at the center.

use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::calibration::Camera;
use crate::frame::Frame;

/// Total weight below which a canvas pixel counts as unfilled.
pub const WEIGHT_EPSILON: f32 = 1e-3;

/// Background/vehicle-area fill, a dark gray.
pub const DARK_FILL: [u8; 3] = [40, 40, 40];
/// Vehicle placeholder body color.
pub const VEHICLE_FILL: [u8; 3] = [200, 200, 200];

#[derive(thiserror::Error, Debug)]
pub enum ComposeError {
    #[error("projected frame for camera {0} is empty")]
    EmptyInput(Camera),
    #[error("invalid panorama configuration: {0}")]
    InvalidConfig(String),
}

/// Angular sector assigned to one camera on the panorama canvas.
///
/// Angles are degrees in `[0, 360)` measured with `atan2(dy, dx)` in
/// raster coordinates (y down), so 270 degrees points to the top of the
/// canvas. A sector may wrap past 360 (the left camera's does).
/// `horizontal_gain` converts the normalized angular offset into a
/// horizontal source coordinate; the side cameras use a wider gain to
/// compensate for their narrower effective field after rotation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SectorSpec {
    pub start_deg: f64,
    pub end_deg: f64,
    pub horizontal_gain: f64,
}

impl SectorSpec {
    /// The fixed sector table: front 225-315, left 315-45, back 45-135,
    /// right 135-225 degrees.
    pub fn for_camera(camera: Camera) -> SectorSpec {
        match camera {
            Camera::Front => SectorSpec {
                start_deg: 225.0,
                end_deg: 315.0,
                horizontal_gain: 0.5,
            },
            Camera::Left => SectorSpec {
                start_deg: 315.0,
                end_deg: 45.0,
                horizontal_gain: 0.7,
            },
            Camera::Back => SectorSpec {
                start_deg: 45.0,
                end_deg: 135.0,
                horizontal_gain: 0.5,
            },
            Camera::Right => SectorSpec {
                start_deg: 135.0,
                end_deg: 225.0,
                horizontal_gain: 0.7,
            },
        }
    }

    /// Sector center, accounting for wrap-around.
    pub fn center_deg(&self) -> f64 {
        let end = if self.end_deg < self.start_deg {
            self.end_deg + 360.0
        } else {
            self.end_deg
        };
        ((self.start_deg + end) / 2.0).rem_euclid(360.0)
    }

    /// Half the angular width of the sector.
    pub fn half_width_deg(&self) -> f64 {
        let end = if self.end_deg < self.start_deg {
            self.end_deg + 360.0
        } else {
            self.end_deg
        };
        (end - self.start_deg) / 2.0
    }

    /// Signed angular distance from the sector center, in `[-180, 180)`.
    pub fn signed_offset_deg(&self, angle_deg: f64) -> f64 {
        (angle_deg - self.center_deg() + 180.0).rem_euclid(360.0) - 180.0
    }
}

/// Geometry of the panorama canvas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanoramaConfig {
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Inner annulus bound; the region inside is reserved for the vehicle
    /// silhouette.
    pub inner_radius: f64,
    /// Outer annulus bound; the region outside is background.
    pub outer_radius: f64,
    /// Width of the angular blend zone straddling each sector boundary.
    pub blend_deg: f64,
    /// Fraction of the annulus depth over which the radial weight tapers
    /// at the inner and outer bounds.
    pub radial_blend: f64,
    /// Bounded neighborhood searched when filling unfilled annulus
    /// pixels.
    pub gap_search_radius: u32,
}

impl Default for PanoramaConfig {
    fn default() -> Self {
        PanoramaConfig {
            canvas_width: 2400,
            canvas_height: 1200,
            inner_radius: 150.0,
            outer_radius: 580.0,
            blend_deg: 15.0,
            radial_blend: 0.1,
            gap_search_radius: 8,
        }
    }
}

impl PanoramaConfig {
    fn validate(&self) -> Result<(), ComposeError> {
        if self.canvas_width == 0 || self.canvas_height == 0 {
            return Err(ComposeError::InvalidConfig("zero canvas size".to_string()));
        }
        if !(self.inner_radius >= 0.0 && self.outer_radius > self.inner_radius) {
            return Err(ComposeError::InvalidConfig(format!(
                "radii out of order: inner={}, outer={}",
                self.inner_radius, self.outer_radius
            )));
        }
        if self.blend_deg <= 0.0 || self.blend_deg >= 90.0 {
            return Err(ComposeError::InvalidConfig(format!(
                "blend zone must be in (0, 90) degrees, got {}",
                self.blend_deg
            )));
        }
        Ok(())
    }
}

/// Accumulator raster plus its parallel weight raster.
#[derive(Debug)]
pub struct PanoramaCanvas {
    accum: Vec<f32>,
    weight: Vec<f32>,
    width: u32,
    height: u32,
}

impl PanoramaCanvas {
    fn new(width: u32, height: u32) -> Self {
        let pixels = width as usize * height as usize;
        PanoramaCanvas {
            accum: vec![0.0; pixels * 3],
            weight: vec![0.0; pixels],
            width,
            height,
        }
    }

    #[inline]
    fn accumulate(&mut self, x: u32, y: u32, rgb: [u8; 3], weight: f32) {
        let p = y as usize * self.width as usize + x as usize;
        for c in 0..3 {
            self.accum[p * 3 + c] += rgb[c] as f32 * weight;
        }
        self.weight[p] += weight;
    }

    pub fn weight_at(&self, x: u32, y: u32) -> f32 {
        self.weight[y as usize * self.width as usize + x as usize]
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Smoothstep ramp: 0 at `t <= 0`, 1 at `t >= 1`, C1-continuous between.
#[inline]
fn smoothstep(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Angular blend weight of `sector` at `angle_deg`.
///
/// Full weight in the sector interior, tapering to zero across a blend
/// zone of `blend_deg` centered on each sector boundary, so adjacent
/// sectors overlap by half a blend zone on either side.
pub fn angular_weight(sector: &SectorSpec, angle_deg: f64, blend_deg: f64) -> f64 {
    let offset = sector.signed_offset_deg(angle_deg).abs();
    let support = sector.half_width_deg() + blend_deg / 2.0;
    smoothstep((support - offset) / blend_deg)
}

/// Radial blend weight at distance `r` from the canvas center.
pub fn radial_weight(r: f64, config: &PanoramaConfig) -> f64 {
    if r < config.inner_radius || r > config.outer_radius {
        return 0.0;
    }
    let margin = (config.outer_radius - config.inner_radius) * config.radial_blend;
    if margin <= 0.0 {
        return 1.0;
    }
    smoothstep((r - config.inner_radius) / margin)
        * smoothstep((config.outer_radius - r) / margin)
}

/// Blends the four projected frames into a panorama canvas.
///
/// Any empty input frame fails the whole composition; no partial
/// panorama is attempted. The returned canvas still needs
/// [`finalize`] to become a displayable frame.
pub fn compose(
    front: &Frame,
    left: &Frame,
    right: &Frame,
    back: &Frame,
    config: &PanoramaConfig,
) -> Result<PanoramaCanvas, ComposeError> {
    config.validate()?;
    let inputs = [
        (Camera::Front, front),
        (Camera::Left, left),
        (Camera::Right, right),
        (Camera::Back, back),
    ];
    for (camera, frame) in &inputs {
        if frame.is_empty() {
            error!("cannot compose panorama: {camera} frame is empty");
            return Err(ComposeError::EmptyInput(*camera));
        }
    }

    let mut canvas = PanoramaCanvas::new(config.canvas_width, config.canvas_height);
    let cx = config.canvas_width as f64 / 2.0;
    let cy = config.canvas_height as f64 / 2.0;
    let depth = config.outer_radius - config.inner_radius;

    for (camera, frame) in inputs {
        let sector = SectorSpec::for_camera(camera);
        let half = sector.half_width_deg();
        let support = half + config.blend_deg / 2.0;
        let fw = frame.width() as f64;
        let fh = frame.height() as f64;

        for y in 0..config.canvas_height {
            let dy = y as f64 - cy;
            for x in 0..config.canvas_width {
                let dx = x as f64 - cx;
                let r = (dx * dx + dy * dy).sqrt();
                if r < config.inner_radius || r > config.outer_radius {
                    continue;
                }
                let angle = dy.atan2(dx).to_degrees().rem_euclid(360.0);
                let offset = sector.signed_offset_deg(angle);
                if offset.abs() >= support {
                    continue;
                }

                let weight = angular_weight(&sector, angle, config.blend_deg)
                    * radial_weight(r, config);
                if weight <= 0.0 {
                    continue;
                }

                // Normalized angular offset to horizontal source
                // coordinate, radial position to vertical; the near field
                // (inner radius) reads the bottom image rows. The wider
                // side-camera gain overshoots the source width at sector
                // edges; those samples repeat the edge column.
                let norm = offset / half;
                let src_x = ((0.5 + norm * sector.horizontal_gain) * (fw - 1.0))
                    .clamp(0.0, fw - 1.0);
                let r_norm = (r - config.inner_radius) / depth;
                let src_y = (1.0 - r_norm) * (fh - 1.0);

                if let Some(rgb) = frame.sample_checked(src_x, src_y) {
                    canvas.accumulate(x, y, rgb, weight as f32);
                }
            }
        }
    }

    Ok(canvas)
}

/// Normalizes the accumulated canvas into a displayable frame.
///
/// Filled pixels are divided by their total weight. Unfilled pixels
/// inside the annulus copy the nearest filled pixel within a bounded
/// search radius, falling back to the dark fill. Everything outside the
/// annulus is dark fill, and the vehicle placeholder is drawn over the
/// center.
pub fn finalize(canvas: &PanoramaCanvas, config: &PanoramaConfig) -> Frame {
    let width = canvas.width;
    let height = canvas.height;
    let mut frame = Frame::new(width, height);
    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;

    let mut gaps = 0usize;
    for y in 0..height {
        for x in 0..width {
            let p = y as usize * width as usize + x as usize;
            let w = canvas.weight[p];
            if w > WEIGHT_EPSILON {
                let rgb = [
                    (canvas.accum[p * 3] / w).round().clamp(0.0, 255.0) as u8,
                    (canvas.accum[p * 3 + 1] / w).round().clamp(0.0, 255.0) as u8,
                    (canvas.accum[p * 3 + 2] / w).round().clamp(0.0, 255.0) as u8,
                ];
                frame.put(x, y, rgb);
                continue;
            }

            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let r = (dx * dx + dy * dy).sqrt();
            if r < config.inner_radius || r > config.outer_radius {
                frame.put(x, y, DARK_FILL);
            } else {
                gaps += 1;
                let rgb = nearest_filled(canvas, x, y, config.gap_search_radius)
                    .unwrap_or(DARK_FILL);
                frame.put(x, y, rgb);
            }
        }
    }
    if gaps > 0 {
        debug!("filled {gaps} gap pixels in the panorama annulus");
    }

    draw_vehicle_placeholder(&mut frame, config);
    frame
}

/// Nearest filled pixel within `radius`, searched in expanding rings.
fn nearest_filled(canvas: &PanoramaCanvas, x: u32, y: u32, radius: u32) -> Option<[u8; 3]> {
    let width = canvas.width as i64;
    let height = canvas.height as i64;
    for ring in 1..=radius as i64 {
        for oy in -ring..=ring {
            for ox in -ring..=ring {
                if ox.abs() != ring && oy.abs() != ring {
                    continue;
                }
                let nx = x as i64 + ox;
                let ny = y as i64 + oy;
                if nx < 0 || ny < 0 || nx >= width || ny >= height {
                    continue;
                }
                let p = ny as usize * canvas.width as usize + nx as usize;
                let w = canvas.weight[p];
                if w > WEIGHT_EPSILON {
                    return Some([
                        (canvas.accum[p * 3] / w).round().clamp(0.0, 255.0) as u8,
                        (canvas.accum[p * 3 + 1] / w).round().clamp(0.0, 255.0) as u8,
                        (canvas.accum[p * 3 + 2] / w).round().clamp(0.0, 255.0) as u8,
                    ]);
                }
            }
        }
    }
    None
}

/// Draws the vehicle body placeholder and its forward marker over the
/// reserved center region.
fn draw_vehicle_placeholder(frame: &mut Frame, config: &PanoramaConfig) {
    let cx = frame.width() as i64 / 2;
    let cy = frame.height() as i64 / 2;
    let body_w = (config.inner_radius * 0.55) as i64;
    let body_h = (config.inner_radius * 1.2) as i64;
    frame.fill_rect(
        cx - body_w / 2,
        cy - body_h / 2,
        body_w as u32,
        body_h as u32,
        VEHICLE_FILL,
    );

    // Forward marker: the front sector is centered on 270 degrees, the
    // top of the canvas.
    let tip = cy - (config.inner_radius * 0.85) as i64;
    frame.draw_line((cx, cy - body_h / 4), (cx, tip), 3, [255, 255, 255]);
    frame.draw_line((cx - 8, tip + 12), (cx, tip), 3, [255, 255, 255]);
    frame.draw_line((cx + 8, tip + 12), (cx, tip), 3, [255, 255, 255]);
}

/// Composes and finalizes in one call.
pub fn compose_panorama(
    front: &Frame,
    left: &Frame,
    right: &Frame,
    back: &Frame,
    config: &PanoramaConfig,
) -> Result<Frame, ComposeError> {
    let canvas = compose(front, left, right, back, config)?;
    Ok(finalize(&canvas, config))
}

/// Grid-layout composition mode: the four processed frames are placed
/// around a center car cell in a 3x3 arrangement instead of being blended
/// onto the polar canvas. Shares the undistort/rotate stages with the
/// panoramic mode.
pub fn compose_grid(
    front: &Frame,
    left: &Frame,
    right: &Frame,
    back: &Frame,
) -> Result<Frame, ComposeError> {
    let inputs = [
        (Camera::Front, front),
        (Camera::Left, left),
        (Camera::Right, right),
        (Camera::Back, back),
    ];
    for (camera, frame) in &inputs {
        if frame.is_empty() {
            error!("cannot compose grid view: {camera} frame is empty");
            return Err(ComposeError::EmptyInput(*camera));
        }
    }

    // Front/back cells are landscape, the rotated side cells portrait.
    let fb_w = 840;
    let fb_h = 720;
    let lr_w = 720;
    let lr_h = 800;

    let front = front.resize(fb_w, fb_h);
    let back = back.resize(fb_w, fb_h);
    let left = left.resize(lr_w, lr_h);
    let right = right.resize(lr_w, lr_h);

    let width = fb_w + 2 * lr_w;
    let height = 2 * fb_h + lr_h;
    let mut view = Frame::new(width, height);

    let blit = |view: &mut Frame, frame: &Frame, ox: u32, oy: u32| {
        for y in 0..frame.height() {
            for x in 0..frame.width() {
                view.put(ox + x, oy + y, frame.get(x, y));
            }
        }
    };

    blit(&mut view, &front, lr_w, 0);
    blit(&mut view, &left, 0, fb_h);
    blit(&mut view, &right, lr_w + fb_w, fb_h);
    blit(&mut view, &back, lr_w, fb_h + lr_h);

    // Car cell with indicator and forward arrow.
    view.fill_rect(lr_w as i64, fb_h as i64, fb_w, lr_h, DARK_FILL);
    let car_cx = (lr_w + fb_w / 2) as i64;
    let car_cy = (fb_h + lr_h / 2) as i64;
    let car_w = (fb_w / 4) as i64;
    let car_h = (lr_h / 6) as i64;
    view.fill_rect(
        car_cx - car_w / 2,
        car_cy - car_h / 2,
        car_w as u32,
        car_h as u32,
        VEHICLE_FILL,
    );
    view.draw_line(
        (car_cx, car_cy - car_h / 4),
        (car_cx, car_cy - car_h / 2 - 20),
        3,
        [255, 255, 255],
    );

    // Borders between the cells.
    let border = [100, 100, 100];
    for x in [lr_w, lr_w + fb_w] {
        view.draw_line((x as i64, 0), (x as i64, height as i64 - 1), 2, border);
    }
    for y in [fb_h, fb_h + lr_h] {
        view.draw_line((0, y as i64), (width as i64 - 1, y as i64), 2, border);
    }

    debug!("grid surround view created ({width}x{height})");
    Ok(view)
}
