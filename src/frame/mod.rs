//! Owned RGB raster buffers passed between pipeline stages.
//!
//! A [`Frame`] is a plain interleaved-RGB buffer tagged with its
//! dimensions. Frames are exclusively owned by the stage that produced
//! them and are moved (never aliased) into the next stage, which is what
//! makes the four per-camera tasks safe to run concurrently.

use image::RgbImage;
use rayon::prelude::*;

/// In-plane rotation applied to a frame after undistortion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    /// 90 degrees clockwise.
    Cw90,
    /// 90 degrees counter-clockwise.
    Ccw90,
    /// 180 degrees.
    Half,
}

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(usize),
    #[error("buffer length {len} does not match {width}x{height}x{channels}")]
    SizeMismatch {
        len: usize,
        width: u32,
        height: u32,
        channels: usize,
    },
}

/// An owned, interleaved 8-bit RGB raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    /// The zero-sized frame used to signal "no image".
    pub fn empty() -> Self {
        Frame {
            data: Vec::new(),
            width: 0,
            height: 0,
        }
    }

    /// A black frame of the given dimensions.
    pub fn new(width: u32, height: u32) -> Self {
        Frame {
            data: vec![0; width as usize * height as usize * 3],
            width,
            height,
        }
    }

    /// Ingests a raw raster buffer, normalizing the channel count.
    ///
    /// 3-channel input is taken as-is. 1-channel (gray) input is replicated
    /// across RGB, 4-channel (RGBA) input drops alpha. Anything else is
    /// rejected.
    pub fn from_raw(
        data: &[u8],
        width: u32,
        height: u32,
        channels: usize,
    ) -> Result<Self, FrameError> {
        let pixels = width as usize * height as usize;
        if data.len() != pixels * channels {
            return Err(FrameError::SizeMismatch {
                len: data.len(),
                width,
                height,
                channels,
            });
        }
        let rgb = match channels {
            3 => data.to_vec(),
            1 => {
                let mut out = Vec::with_capacity(pixels * 3);
                for &g in data {
                    out.extend_from_slice(&[g, g, g]);
                }
                out
            }
            4 => {
                let mut out = Vec::with_capacity(pixels * 3);
                for px in data.chunks_exact(4) {
                    out.extend_from_slice(&px[..3]);
                }
                out
            }
            other => return Err(FrameError::UnsupportedChannels(other)),
        };
        Ok(Frame {
            data: rgb,
            width,
            height,
        })
    }

    pub fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Frame {
            data: image.into_raw(),
            width,
            height,
        }
    }

    /// Hands the frame off at the renderer boundary.
    pub fn to_rgb_image(&self) -> RgbImage {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .expect("frame buffer matches its dimensions")
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    #[inline]
    pub fn put(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        self.data[i..i + 3].copy_from_slice(&rgb);
    }

    /// Mean of all channel values, on the 0..255 scale. Empty frames read
    /// as 0.
    pub fn mean_luminance(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|&v| v as u64).sum();
        sum as f64 / self.data.len() as f64
    }

    /// Bilinearly samples the frame at a fractional coordinate, clamped to
    /// the image bounds.
    pub fn sample_bilinear(&self, x: f64, y: f64) -> [u8; 3] {
        let x = x.max(0.0).min(self.width as f64 - 1.0);
        let y = y.max(0.0).min(self.height as f64 - 1.0);

        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);

        let fx = x - x0 as f64;
        let fy = y - y0 as f64;

        let p00 = self.get(x0, y0);
        let p10 = self.get(x1, y0);
        let p01 = self.get(x0, y1);
        let p11 = self.get(x1, y1);

        let mut out = [0u8; 3];
        for c in 0..3 {
            let value = p00[c] as f64 * (1.0 - fx) * (1.0 - fy)
                + p10[c] as f64 * fx * (1.0 - fy)
                + p01[c] as f64 * (1.0 - fx) * fy
                + p11[c] as f64 * fx * fy;
            out[c] = value.round().clamp(0.0, 255.0) as u8;
        }
        out
    }

    /// Bilinear sample that refuses coordinates outside the image instead
    /// of clamping.
    pub fn sample_checked(&self, x: f64, y: f64) -> Option<[u8; 3]> {
        if x < 0.0 || y < 0.0 || x > self.width as f64 - 1.0 || y > self.height as f64 - 1.0 {
            return None;
        }
        Some(self.sample_bilinear(x, y))
    }

    pub fn rotate(&self, rotation: Rotation) -> Frame {
        match rotation {
            Rotation::None => self.clone(),
            Rotation::Cw90 => self.rotate90_cw(),
            Rotation::Ccw90 => self.rotate90_ccw(),
            Rotation::Half => self.rotate180(),
        }
    }

    pub fn rotate90_cw(&self) -> Frame {
        if self.is_empty() {
            return Frame::empty();
        }
        let mut out = Frame::new(self.height, self.width);
        for y in 0..self.height {
            for x in 0..self.width {
                out.put(self.height - 1 - y, x, self.get(x, y));
            }
        }
        out
    }

    pub fn rotate90_ccw(&self) -> Frame {
        if self.is_empty() {
            return Frame::empty();
        }
        let mut out = Frame::new(self.height, self.width);
        for y in 0..self.height {
            for x in 0..self.width {
                out.put(y, self.width - 1 - x, self.get(x, y));
            }
        }
        out
    }

    pub fn rotate180(&self) -> Frame {
        if self.is_empty() {
            return Frame::empty();
        }
        let mut out = Frame::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                out.put(self.width - 1 - x, self.height - 1 - y, self.get(x, y));
            }
        }
        out
    }

    /// Bilinear resize to the given dimensions.
    pub fn resize(&self, width: u32, height: u32) -> Frame {
        if self.is_empty() || width == 0 || height == 0 {
            return Frame::empty();
        }
        let mut out = Frame::new(width, height);
        let sx = self.width as f64 / width as f64;
        let sy = self.height as f64 / height as f64;
        let row_stride = width as usize * 3;
        out.data
            .par_chunks_mut(row_stride)
            .enumerate()
            .for_each(|(y, row)| {
                let src_y = (y as f64 + 0.5) * sy - 0.5;
                for x in 0..width as usize {
                    let src_x = (x as f64 + 0.5) * sx - 0.5;
                    let rgb = self.sample_bilinear(src_x, src_y);
                    row[x * 3..x * 3 + 3].copy_from_slice(&rgb);
                }
            });
        out
    }

    /// Downscales the frame to fit within `max_width` x `max_height`,
    /// preserving aspect ratio. Frames already within bounds are returned
    /// unchanged.
    pub fn fit_within(&self, max_width: u32, max_height: u32) -> Frame {
        if self.width <= max_width && self.height <= max_height {
            return self.clone();
        }
        let scale = (max_width as f64 / self.width as f64)
            .min(max_height as f64 / self.height as f64);
        self.resize(
            (self.width as f64 * scale).round() as u32,
            (self.height as f64 * scale).round() as u32,
        )
    }

    /// Crops a rectangle out of the frame. The rectangle is clamped to the
    /// image; an empty intersection yields the empty frame.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Frame {
        if self.is_empty() || x >= self.width || y >= self.height {
            return Frame::empty();
        }
        let w = width.min(self.width - x);
        let h = height.min(self.height - y);
        if w == 0 || h == 0 {
            return Frame::empty();
        }
        let mut out = Frame::new(w, h);
        for row in 0..h {
            let src_start = ((y + row) as usize * self.width as usize + x as usize) * 3;
            let dst_start = row as usize * w as usize * 3;
            out.data[dst_start..dst_start + w as usize * 3]
                .copy_from_slice(&self.data[src_start..src_start + w as usize * 3]);
        }
        out
    }

    /// Row-parallel inverse-mapping resample into a new frame.
    ///
    /// `map` takes a destination pixel coordinate and returns the source
    /// coordinate to sample; destinations whose source falls outside the
    /// image stay at background black.
    pub fn remap<F>(&self, width: u32, height: u32, map: F) -> Frame
    where
        F: Fn(f64, f64) -> (f64, f64) + Sync,
    {
        if self.is_empty() || width == 0 || height == 0 {
            return Frame::empty();
        }
        let mut out = Frame::new(width, height);
        let row_stride = width as usize * 3;
        out.data
            .par_chunks_mut(row_stride)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width as usize {
                    let (src_x, src_y) = map(x as f64, y as f64);
                    if let Some(rgb) = self.sample_checked(src_x, src_y) {
                        row[x * 3..x * 3 + 3].copy_from_slice(&rgb);
                    }
                }
            });
        out
    }

    /// Resamples the frame through a scale followed by a translation, the
    /// post-crop correction step of the undistorter. Output dimensions are
    /// the scaled dimensions; pixels mapping outside the source stay black.
    pub fn scale_shift(&self, scale: (f64, f64), shift: (f64, f64)) -> Frame {
        if self.is_empty() || scale.0 <= 0.0 || scale.1 <= 0.0 {
            return Frame::empty();
        }
        let width = (self.width as f64 * scale.0).round() as u32;
        let height = (self.height as f64 * scale.1).round() as u32;
        self.remap(width, height, |x, y| {
            ((x - shift.0) / scale.0, (y - shift.1) / scale.1)
        })
    }

    /// Fills an axis-aligned rectangle, clamped to the image.
    pub fn fill_rect(&mut self, x: i64, y: i64, width: u32, height: u32, rgb: [u8; 3]) {
        if self.is_empty() {
            return;
        }
        let x0 = x.max(0) as u32;
        let y0 = y.max(0) as u32;
        let x1 = ((x + width as i64).max(0) as u64).min(self.width as u64) as u32;
        let y1 = ((y + height as i64).max(0) as u64).min(self.height as u64) as u32;
        for py in y0..y1 {
            for px in x0..x1 {
                self.put(px, py, rgb);
            }
        }
    }

    /// Draws a straight line with a square brush of the given thickness.
    pub fn draw_line(
        &mut self,
        from: (i64, i64),
        to: (i64, i64),
        thickness: u32,
        rgb: [u8; 3],
    ) {
        if self.is_empty() {
            return;
        }
        let dx = to.0 - from.0;
        let dy = to.1 - from.1;
        let steps = dx.abs().max(dy.abs()).max(1);
        let half = thickness as i64 / 2;
        for i in 0..=steps {
            let x = from.0 + dx * i / steps;
            let y = from.1 + dy * i / steps;
            self.fill_rect(x - half, y - half, thickness.max(1), thickness.max(1), rgb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(width: u32, height: u32) -> Frame {
        let mut frame = Frame::new(width, height);
        for y in 0..height {
            for x in 0..width {
                frame.put(x, y, [(x % 256) as u8, (y % 256) as u8, 7]);
            }
        }
        frame
    }

    #[test]
    fn test_channel_normalization() {
        let gray = Frame::from_raw(&[10, 20, 30, 40], 2, 2, 1).unwrap();
        assert_eq!(gray.get(1, 0), [20, 20, 20]);

        let rgba = Frame::from_raw(&[1, 2, 3, 255, 4, 5, 6, 255], 2, 1, 4).unwrap();
        assert_eq!(rgba.get(0, 0), [1, 2, 3]);
        assert_eq!(rgba.get(1, 0), [4, 5, 6]);

        assert!(matches!(
            Frame::from_raw(&[0, 0], 1, 1, 2),
            Err(FrameError::UnsupportedChannels(2))
        ));
        assert!(matches!(
            Frame::from_raw(&[0, 0, 0], 2, 2, 3),
            Err(FrameError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_rotations_preserve_pixels() {
        let frame = gradient_frame(4, 3);

        let cw = frame.rotate90_cw();
        assert_eq!((cw.width(), cw.height()), (3, 4));
        assert_eq!(cw.get(2, 0), frame.get(0, 0));
        assert_eq!(cw.get(0, 3), frame.get(3, 2));

        let ccw = frame.rotate90_ccw();
        assert_eq!((ccw.width(), ccw.height()), (3, 4));
        assert_eq!(ccw.get(0, 3), frame.get(0, 0));

        let half = frame.rotate180();
        assert_eq!((half.width(), half.height()), (4, 3));
        assert_eq!(half.get(0, 0), frame.get(3, 2));

        // Two quarter turns equal a half turn.
        assert_eq!(frame.rotate90_cw().rotate90_cw(), half);
    }

    #[test]
    fn test_bilinear_sample_midpoint() {
        let mut frame = Frame::new(2, 1);
        frame.put(0, 0, [0, 0, 0]);
        frame.put(1, 0, [100, 200, 50]);
        assert_eq!(frame.sample_bilinear(0.5, 0.0), [50, 100, 25]);
        // Clamped outside the image.
        assert_eq!(frame.sample_bilinear(5.0, 5.0), frame.get(1, 0));
        assert!(frame.sample_checked(5.0, 0.0).is_none());
    }

    #[test]
    fn test_crop_clamps_to_bounds() {
        let frame = gradient_frame(10, 8);
        let cropped = frame.crop(4, 2, 100, 100);
        assert_eq!((cropped.width(), cropped.height()), (6, 6));
        assert_eq!(cropped.get(0, 0), frame.get(4, 2));
        assert!(frame.crop(20, 0, 1, 1).is_empty());
    }

    #[test]
    fn test_mean_luminance() {
        let mut frame = Frame::new(2, 1);
        frame.put(0, 0, [0, 0, 0]);
        frame.put(1, 0, [60, 60, 60]);
        assert!((frame.mean_luminance() - 30.0).abs() < 1e-9);
        assert_eq!(Frame::empty().mean_luminance(), 0.0);
    }

    #[test]
    fn test_scale_shift_identity() {
        let frame = gradient_frame(6, 5);
        let same = frame.scale_shift((1.0, 1.0), (0.0, 0.0));
        assert_eq!(same, frame);

        let shifted = frame.scale_shift((1.0, 1.0), (2.0, 0.0));
        assert_eq!(shifted.get(2, 0), frame.get(0, 0));
        // Vacated columns stay black.
        assert_eq!(shifted.get(0, 0), [0, 0, 0]);
    }

    #[test]
    fn test_fit_within_downscales_only() {
        let frame = gradient_frame(40, 20);
        assert_eq!(frame.fit_within(100, 100), frame);
        let small = frame.fit_within(20, 20);
        assert_eq!((small.width(), small.height()), (20, 10));
    }
}
