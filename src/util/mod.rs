//! Synthetic test patterns for development and testing.

use crate::frame::Frame;

/// A frame filled with a single color.
pub fn flat_color(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
    let mut frame = Frame::new(width, height);
    frame.fill_rect(0, 0, width, height, rgb);
    frame
}

/// Generate a reference grid pattern with a highlighted major grid, a
/// center cross and four colored corner squares.
pub fn test_grid(width: u32, height: u32) -> Frame {
    let mut grid = Frame::new(width, height);

    let grid_size = 50;
    let line_color = [100, 100, 100];
    let highlight_color = [255, 255, 255];

    // Vertical lines
    for x in (0..width).step_by(grid_size) {
        let color = if x % (grid_size as u32 * 4) == 0 {
            highlight_color
        } else {
            line_color
        };
        grid.draw_line((x as i64, 0), (x as i64, height as i64 - 1), 1, color);
    }

    // Horizontal lines
    for y in (0..height).step_by(grid_size) {
        let color = if y % (grid_size as u32 * 4) == 0 {
            highlight_color
        } else {
            line_color
        };
        grid.draw_line((0, y as i64), (width as i64 - 1, y as i64), 1, color);
    }

    // Center cross
    let cx = width as i64 / 2;
    let cy = height as i64 / 2;
    grid.draw_line((cx - 20, cy), (cx + 20, cy), 3, [0, 255, 0]);
    grid.draw_line((cx, cy - 20), (cx, cy + 20), 3, [0, 255, 0]);

    // Colored squares for reference
    let w4 = width as i64 / 4;
    let h4 = height as i64 / 4;
    grid.fill_rect(w4 - 25, h4 - 25, 50, 50, [255, 0, 0]);
    grid.fill_rect(3 * w4 - 25, h4 - 25, 50, 50, [0, 0, 255]);
    grid.fill_rect(w4 - 25, 3 * h4 - 25, 50, 50, [255, 255, 0]);
    grid.fill_rect(3 * w4 - 25, 3 * h4 - 25, 50, 50, [255, 0, 255]);

    grid
}

/// Generate a black-and-white checkerboard.
pub fn checkerboard(width: u32, height: u32, square_size: u32) -> Frame {
    let mut board = Frame::new(width, height);
    let square = square_size.max(1);
    for y in (0..height).step_by(square as usize) {
        for x in (0..width).step_by(square as usize) {
            if ((x / square) + (y / square)) % 2 == 0 {
                board.fill_rect(x as i64, y as i64, square, square, [255, 255, 255]);
            }
        }
    }
    board
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_color_fills_every_pixel() {
        let frame = flat_color(16, 8, [1, 2, 3]);
        for y in 0..8 {
            for x in 0..16 {
                assert_eq!(frame.get(x, y), [1, 2, 3]);
            }
        }
    }

    #[test]
    fn test_checkerboard_alternates() {
        let board = checkerboard(100, 100, 50);
        assert_eq!(board.get(10, 10), [255, 255, 255]);
        assert_eq!(board.get(60, 10), [0, 0, 0]);
        assert_eq!(board.get(60, 60), [255, 255, 255]);
    }

    #[test]
    fn test_grid_has_major_lines_and_markers() {
        let grid = test_grid(800, 600);
        // Major line at x=200, minor at x=50.
        assert_eq!(grid.get(200, 25), [255, 255, 255]);
        assert_eq!(grid.get(50, 25), [100, 100, 100]);
        // Center cross.
        assert_eq!(grid.get(400, 300), [0, 255, 0]);
        // Red reference square.
        assert_eq!(grid.get(200, 150), [255, 0, 0]);
    }
}
