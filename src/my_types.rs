use nalgebra as na;
use serde::{Deserialize, Serialize};

pub type Vector2d = na::Vector2<f64>;
pub type Matrix2d = na::Matrix2<f64>;
pub type Matrixd = na::DMatrix<f64>;

/// Frame number on the timeline. Frames are signed so that reference frames
/// computed as `time - step` stay representable before the first frame.
pub type Frame = i32;

/// Axis aligned rectangle in pixel coordinates, `(x1, y1)` is the top-left
/// corner.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Rect {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Bounding box of a set of points
    pub fn bounding(points: &[Vector2d]) -> Self {
        let mut rect = Rect {
            x1: f64::INFINITY,
            y1: f64::INFINITY,
            x2: f64::NEG_INFINITY,
            y2: f64::NEG_INFINITY,
        };
        for p in points {
            rect.x1 = rect.x1.min(p.x);
            rect.y1 = rect.y1.min(p.y);
            rect.x2 = rect.x2.max(p.x);
            rect.y2 = rect.y2.max(p.y);
        }
        rect
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> Vector2d {
        Vector2d::new((self.x1 + self.x2) / 2., (self.y1 + self.y2) / 2.)
    }

    pub fn is_empty(&self) -> bool {
        !(self.width() > 0. && self.height() > 0.)
    }

    pub fn contains(&self, p: Vector2d) -> bool {
        p.x >= self.x1 && p.x <= self.x2 && p.y >= self.y1 && p.y <= self.y2
    }
}

/// Dimensions of the frames of a sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Format {
    pub width: usize,
    pub height: usize,
}

impl Format {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn center(&self) -> Vector2d {
        Vector2d::new(self.width as f64 / 2., self.height as f64 / 2.)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_rect() {
        let rect = Rect::bounding(&[
            Vector2d::new(3., -1.),
            Vector2d::new(-2., 4.),
            Vector2d::new(1., 1.),
        ]);
        assert_eq!(rect, Rect::new(-2., -1., 3., 4.));
        assert_eq!(rect.center(), Vector2d::new(0.5, 1.5));
        assert!(rect.contains(Vector2d::new(0., 0.)));
        assert!(!rect.contains(Vector2d::new(4., 0.)));
        assert!(Rect::default().is_empty());
    }
}
