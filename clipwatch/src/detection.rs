//! Motion candidate detection

use crate::config::DetectionTuning;
use crate::frame::Frame;

/// Single moving region found in a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Detection {
    /// Area of the region, in pixels.
    pub area: usize,
    /// Bounding box as `(x, y, width, height)`.
    pub bounds: (usize, usize, usize, usize),
    /// Centre of the bounding box.
    pub centroid: (usize, usize),
}

impl Detection {
    /// Build a detection from its bounding box, with the centroid in the box centre.
    pub fn from_bounds(area: usize, (x, y, w, h): (usize, usize, usize, usize)) -> Self {
        Self {
            area,
            bounds: (x, y, w, h),
            centroid: (x + w / 2, y + h / 2),
        }
    }
}

/// Block subdivision based background difference detector.
///
/// A running average of each pixel's luminance is kept as the background. Each frame is split up
/// into `block_size` squares, and every block whose mean absolute difference from the background
/// exceeds the threshold is marked as foreground. Connected foreground blocks form a region, and
/// regions of at least `min_contour_area` pixels are reported.
pub struct BlockDiffDetector {
    block_size: usize,
    learning_rate: f32,
    background: Vec<f32>,
    dim: (usize, usize),
}

impl Default for BlockDiffDetector {
    fn default() -> Self {
        Self::new(8, 0.05)
    }
}

impl BlockDiffDetector {
    /// Create a new detector.
    ///
    /// # Arguments
    ///
    /// * `block_size` - side of the square blocks, in pixels.
    /// * `learning_rate` - how quickly the background adapts to the scene, between 0 and 1.
    pub fn new(block_size: usize, learning_rate: f32) -> Self {
        Self {
            block_size: std::cmp::max(block_size, 1),
            learning_rate: learning_rate.clamp(0.0, 1.0),
            background: vec![],
            dim: (0, 0),
        }
    }

    /// Forget the learnt background.
    pub fn reset(&mut self) {
        self.background.clear();
        self.dim = (0, 0);
    }

    /// Detect moving regions in the next frame.
    ///
    /// The first frame, and any frame with new dimensions, only initialises the background.
    pub fn detect(&mut self, frame: &Frame, tuning: &DetectionTuning, out: &mut Vec<Detection>) {
        if frame.dim() != self.dim || self.background.is_empty() {
            self.dim = frame.dim();
            self.background.clear();
            self.background
                .extend(frame.pixels().iter().map(|p| p.luma() as f32));
            return;
        }

        let (width, height) = self.dim;
        let bs = self.block_size;
        let (bw, bh) = ((width + bs - 1) / bs, (height + bs - 1) / bs);

        let mut map = vec![vec![false; bw]; bh];

        // Compute which blocks differ from the background
        for (by, row) in map.iter_mut().enumerate() {
            for (bx, cell) in row.iter_mut().enumerate() {
                let (x0, y0) = (bx * bs, by * bs);
                let (x1, y1) = (
                    std::cmp::min(x0 + bs, width),
                    std::cmp::min(y0 + bs, height),
                );

                let mut diff = 0f32;

                for y in y0..y1 {
                    for x in x0..x1 {
                        let i = y * width + x;
                        diff += (frame.pixels()[i].luma() as f32 - self.background[i]).abs();
                    }
                }

                *cell = diff / ((x1 - x0) * (y1 - y0)) as f32 > tuning.threshold as f32;
            }
        }

        for (bg, px) in self.background.iter_mut().zip(frame.pixels()) {
            *bg += (px.luma() as f32 - *bg) * self.learning_rate;
        }

        // Flood fill every marked region.
        for y in 0..bh {
            for x in 0..bw {
                if !map[y][x] {
                    continue;
                }

                let mut area = 0;
                let (mut min_x, mut min_y, mut max_x, mut max_y) = (x, y, x, y);

                map[y][x] = false;
                let mut to_fill = vec![(x, y); 1];

                while let Some((x, y)) = to_fill.pop() {
                    let x_end = std::cmp::min((x + 1) * bs, width);
                    let y_end = std::cmp::min((y + 1) * bs, height);
                    area += (x_end - x * bs) * (y_end - y * bs);

                    min_x = std::cmp::min(min_x, x);
                    min_y = std::cmp::min(min_y, y);
                    max_x = std::cmp::max(max_x, x);
                    max_y = std::cmp::max(max_y, y);

                    let neighbor_offs = (-1..=1).flat_map(|x| (-1..=1).map(move |y| (x, y)));

                    // Go through each neighbor and add any unvisited marked blocks.
                    for (x, y) in neighbor_offs
                        .map(|(ox, oy)| (x as isize + ox, y as isize + oy))
                        .filter(|&(ox, oy)| {
                            (0..bw as isize).contains(&ox) && (0..bh as isize).contains(&oy)
                        })
                        .map(|(x, y)| (x as usize, y as usize))
                    {
                        if map[y][x] {
                            to_fill.push((x, y));
                            map[y][x] = false;
                        }
                    }
                }

                if area >= tuning.min_contour_area {
                    let (px, py) = (min_x * bs, min_y * bs);
                    let w = std::cmp::min((max_x + 1) * bs, width) - px;
                    let h = std::cmp::min((max_y + 1) * bs, height) - py;
                    out.push(Detection::from_bounds(area, (px, py, w, h)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RGBA;

    fn tuning(min_contour_area: usize) -> DetectionTuning {
        DetectionTuning {
            threshold: 5,
            min_contour_area,
        }
    }

    fn scene() -> Frame {
        Frame::filled(128, 96, RGBA::opaque(40, 40, 40))
    }

    #[test]
    fn static_scene_has_no_motion() {
        let mut detector = BlockDiffDetector::default();
        let mut out = vec![];

        for _ in 0..10 {
            detector.detect(&scene(), &tuning(1), &mut out);
        }

        assert!(out.is_empty());
    }

    #[test]
    fn finds_bright_square() {
        let mut detector = BlockDiffDetector::default();
        let mut out = vec![];

        for _ in 0..3 {
            detector.detect(&scene(), &tuning(100), &mut out);
        }

        let mut frame = scene();
        frame.fill_rect(40, 24, 32, 32, RGBA::opaque(255, 255, 255));
        detector.detect(&frame, &tuning(100), &mut out);

        assert_eq!(
            out,
            vec![Detection {
                area: 1024,
                bounds: (40, 24, 32, 32),
                centroid: (56, 40),
            }]
        );
    }

    #[test]
    fn small_regions_filtered() {
        let mut detector = BlockDiffDetector::default();
        let mut out = vec![];

        detector.detect(&scene(), &tuning(1000), &mut out);

        let mut frame = scene();
        frame.fill_rect(0, 0, 16, 16, RGBA::opaque(255, 255, 255));
        frame.fill_rect(96, 64, 16, 16, RGBA::opaque(255, 255, 255));
        detector.detect(&frame, &tuning(1000), &mut out);
        assert!(out.is_empty());

        detector.reset();
        detector.detect(&scene(), &tuning(200), &mut out);
        detector.detect(&frame, &tuning(200), &mut out);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.area == 256));
    }
}
