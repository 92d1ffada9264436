use log::trace;

use crate::backend::*;
use crate::config::Config;
use crate::error::{Result, TrackerError};
use crate::frame_accessor::ImageAccessor;
use crate::image::*;
use crate::my_types::*;
use crate::pyramid::{pyramid_compatible_size, PatchPyramid};

/// General correlation tracker: pyramidal Lucas-Kanade on the marker point,
/// checked with the normalized cross correlation of the pattern.
#[derive(Debug)]
pub struct OpticalFlow {
    lk_iters: usize,
    lk_levels: usize,
    lk_win_size: usize,
    lk_term: f64,
    lk_min_eig: f64,
    min_correlation: f64,
}

impl OpticalFlow {
    pub fn new(config: &Config) -> OpticalFlow {
        Self::with_params(config.pyramid_levels, config.max_iterations, config.lk_window)
            .with_min_correlation(config.min_correlation())
    }

    pub fn with_params(lk_levels: usize, lk_iters: usize, lk_win_size: usize) -> OpticalFlow {
        OpticalFlow {
            lk_iters: lk_iters.max(1),
            lk_levels,
            // the integration window is centered on the point
            lk_win_size: lk_win_size.max(3) | 1,
            lk_term: 0.03,
            lk_min_eig: 1e-4,
            min_correlation: 0.,
        }
    }

    pub fn with_min_correlation(mut self, min_correlation: f64) -> Self {
        self.min_correlation = min_correlation;
        self
    }

    /// Region fetched around the search window so that every pyramid level
    /// keeps a full integration window around the point
    fn patch_rect(&self, search: &Rect) -> Rect {
        let r = (self.lk_win_size - 1) / 2;
        let pad = ((r + 2) << self.lk_levels) as f64;
        let x0 = search.x1.floor() - pad;
        let y0 = search.y1.floor() - pad;
        let width = pyramid_compatible_size(
            (search.x2.ceil() - search.x1.floor()) as usize + 2 * pad as usize,
            self.lk_levels,
        );
        let height = pyramid_compatible_size(
            (search.y2.ceil() - search.y1.floor()) as usize + 2 * pad as usize,
            self.lk_levels,
        );
        Rect::new(x0, y0, x0 + width as f64, y0 + height as f64)
    }

    /// Pyramidal Lucas-Kanade, coarse to fine.
    /// ref http://robots.stanford.edu/cs223b04/algo_tracking.pdf
    fn track_point(
        &self,
        patch0: &PatchPyramid,
        patch1: &PatchPyramid,
        point0: Vector2d,
        guess: Option<Vector2d>,
    ) -> Option<Vector2d> {
        let tolerance = self.lk_term.powi(2);
        let radius = (self.lk_win_size - 1) / 2;
        let depth = self.lk_levels.min(patch0.depth());

        let mut offset = guess.map_or(Vector2d::zeros(), |g| g - point0) / (1 << depth) as f64;
        let mut refinement = Vector2d::zeros();
        for level in (0..=depth).rev() {
            let image0 = patch0.level(level);
            let image1 = patch1.level(level);
            let u = point0 / (1 << level) as f64;
            let window = Window::around(image0, u, radius, 1)?;
            let gradients = Gradients::at(image0, u, window);
            let tensor = gradients.structure_tensor();
            if tensor.symmetric_eigenvalues().min() < self.lk_min_eig {
                trace!("flat window at level {level}");
                return None;
            }
            let inverse = tensor.try_inverse()?;

            let mut nu = Vector2d::zeros();
            let mut converged = false;
            for _ in 0..self.lk_iters {
                let eta = inverse * gradients.mismatch(image1, u + offset + nu, window, radius)?;
                nu += eta;
                if eta.norm_squared() < tolerance {
                    converged = true;
                    break;
                }
            }
            if !converged {
                return None;
            }
            refinement = nu;
            if level > 0 {
                offset = 2. * (offset + refinement);
            }
        }

        Some(point0 + offset + refinement)
    }
}

impl TrackingBackend for OpticalFlow {
    fn track(
        &self,
        reference: &MarkerSnapshot,
        target_frame: Frame,
        accessor: &dyn ImageAccessor,
    ) -> Result<TrackRegionResult> {
        let (half_w, half_h) = reference.pattern_half_size();
        let mut corners = reference.pattern.to_vec();
        corners.push(Vector2d::new(reference.search_window.x1, reference.search_window.y1));
        corners.push(Vector2d::new(reference.search_window.x2, reference.search_window.y2));
        let rect = self.patch_rect(&Rect::bounding(&corners));
        let patch0 = accessor.get_patch(reference.reference_frame, rect)?;
        let patch1 = accessor.get_patch(target_frame, rect)?;
        let pyramid0 = PatchPyramid::new(patch0.image.clone(), self.lk_levels)?;
        let pyramid1 = PatchPyramid::new(patch1.image, self.lk_levels)?;

        let local0 = patch0.to_local(reference.point);
        let guess = patch0.to_local(reference.guess);
        let local1 = self
            .track_point(&pyramid0, &pyramid1, local0, Some(guess))
            .ok_or_else(|| {
                TrackerError::Backend(format!(
                    "{} lost between frames {} and {}",
                    reference.name, reference.reference_frame, target_frame
                ))
            })?;
        let point = patch0.to_frame(local1);
        if !reference.search_window.contains(point) {
            return Err(TrackerError::Backend(format!(
                "{} left its search window at frame {}",
                reference.name, target_frame
            )));
        }

        let samples0 = sample_window(&pyramid0.base, local0, half_w, half_h);
        let samples1 = sample_window(&pyramid1.base, local1, half_w, half_h);
        let (samples0, samples1) = match (samples0, samples1) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(TrackerError::PatchOutOfBounds {
                    frame: target_frame,
                    x: point.x,
                    y: point.y,
                })
            }
        };
        let correlation = normalized_cross_correlation(&samples0, &samples1);
        trace!(
            "{} {} -> {}: ({:.2}, {:.2}) corr {:.3}",
            reference.name,
            reference.reference_frame,
            target_frame,
            point.x,
            point.y,
            correlation
        );
        if correlation < self.min_correlation {
            return Err(TrackerError::Backend(format!(
                "{} correlation {:.3} below {:.3} at frame {}",
                reference.name, correlation, self.min_correlation, target_frame
            )));
        }

        Ok(TrackRegionResult {
            point,
            pattern: translate_pattern(&reference.pattern, point - reference.point),
            correlation,
        })
    }

    fn kind(&self) -> BackendKind {
        BackendKind::OpticalFlow
    }
}

/// Inclusive integer offsets around a point, per axis
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Window {
    x: [i16; 2],
    y: [i16; 2],
}

impl Window {
    /// Offsets within `radius` of `center` keeping `margin` pixels away from
    /// the border of `image`. None if `center` lies outside the image.
    fn around(image: &Image, center: Vector2d, radius: usize, margin: i16) -> Option<Window> {
        let radius = radius as i16;
        let axis = |c: f64, size: usize| -> Option<[i16; 2]> {
            if c < 0. || c > (size - 1) as f64 {
                return None;
            }
            let whole = c as i16;
            let partial = i16::from(c.fract() > 0.);
            Some([
                (margin - whole).max(-radius),
                (size as i16 - whole - margin - 1 - partial).min(radius),
            ])
        };
        Some(Window {
            x: axis(center.x, image.width)?,
            y: axis(center.y, image.height)?,
        })
    }

    fn grown(self, by: i16) -> Window {
        Window {
            x: [self.x[0] - by, self.x[1] + by],
            y: [self.y[0] - by, self.y[1] + by],
        }
    }

    fn rows(&self) -> usize {
        (self.y[1] - self.y[0] + 1) as usize
    }

    fn cols(&self) -> usize {
        (self.x[1] - self.x[0] + 1) as usize
    }

    /// Bilinear samples of `image` at `center` plus every offset
    fn sample(&self, image: &Image, center: Vector2d) -> Matrixd {
        Matrixd::from_fn(self.rows(), self.cols(), |row, col| {
            let offset = Vector2d::new(
                (self.x[0] + col as i16) as f64,
                (self.y[0] + row as i16) as f64,
            );
            bilinear(image, center + offset)
        })
    }
}

/// ref https://theailearner.com/tag/scharr-operator/
const SCHARR_X: [[f64; 3]; 3] = [[-3., 0., 3.], [-10., 0., 10.], [-3., 0., 3.]];
const SCHARR_Y: [[f64; 3]; 3] = [[-3., -10., -3.], [0., 0., 0.], [3., 10., 3.]];

/// Template samples and their Scharr derivatives over a window
struct Gradients {
    template: Matrixd,
    ix: Matrixd,
    iy: Matrixd,
}

impl Gradients {
    fn at(image: &Image, center: Vector2d, window: Window) -> Gradients {
        // one extra pixel on each side feeds the 3x3 kernel
        let template = window.grown(1).sample(image, center);
        let convolve = |kernel: &[[f64; 3]; 3]| {
            Matrixd::from_fn(window.rows(), window.cols(), |row, col| {
                let mut sum = 0.;
                for (dy, weights) in kernel.iter().enumerate() {
                    for (dx, weight) in weights.iter().enumerate() {
                        sum += weight * template[(row + dy, col + dx)];
                    }
                }
                sum / 32.
            })
        };
        Gradients {
            ix: convolve(&SCHARR_X),
            iy: convolve(&SCHARR_Y),
            template,
        }
    }

    fn structure_tensor(&self) -> Matrix2d {
        let xx = self.ix.dot(&self.ix);
        let yy = self.iy.dot(&self.iy);
        let xy = self.ix.dot(&self.iy);
        Matrix2d::new(xx, xy, xy, yy)
    }

    /// Gradient-weighted difference between the template and `image` sampled
    /// around `center`. None once the window would be clipped differently.
    fn mismatch(
        &self,
        image: &Image,
        center: Vector2d,
        window: Window,
        radius: usize,
    ) -> Option<Vector2d> {
        if Window::around(image, center, radius, 0)? != window {
            return None;
        }
        let target = window.sample(image, center);
        let inner = self.template.view((1, 1), (window.rows(), window.cols()));
        let diff = inner - target;
        Some(Vector2d::new(diff.dot(&self.ix), diff.dot(&self.iy)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 9x9 concentric rings, brightest in the middle
    fn rings() -> Image {
        let mut image = Image::filled(9, 9, 0);
        let levels = [44u8, 55, 77, 88, 99];
        for y in 0..9usize {
            for x in 0..9usize {
                let ring = x.min(y).min(8 - x).min(8 - y);
                image.data[y * 9 + x] = levels[ring];
            }
        }
        image
    }

    #[test]
    fn test_track_point() {
        let mut image0 = Image::filled(128, 128, 0);
        let mut image1 = image0.clone();
        let (dx, dy) = (-14, 7);
        image0.set_sub_image_i32(60, 60, &rings());
        image1.set_sub_image_i32(60 + dx, 60 + dy, &rings());

        let patch0 = PatchPyramid::new(image0, 3).unwrap();
        let patch1 = PatchPyramid::new(image1, 3).unwrap();
        let point0 = Vector2d::new(64., 64.);
        let flow = OpticalFlow::with_params(3, 20, 7);

        let point1 = flow.track_point(&patch0, &patch1, point0, None).unwrap();
        let err = (point1 - point0 - Vector2d::new(dx as f64, dy as f64)).norm();
        assert!(err < 1., "off by {err}");

        // a good guess converges as well
        let guessed = flow
            .track_point(&patch0, &patch1, point0, Some(Vector2d::new(51., 70.)))
            .unwrap();
        assert!((guessed - Vector2d::new(50., 71.)).norm() < 1.);
    }

    #[test]
    fn test_flat_image_is_lost() {
        let patch0 = PatchPyramid::new(Image::filled(64, 64, 50), 2).unwrap();
        let patch1 = PatchPyramid::new(Image::filled(64, 64, 50), 2).unwrap();
        let flow = OpticalFlow::with_params(2, 20, 7);
        assert_eq!(flow.track_point(&patch0, &patch1, Vector2d::new(32., 32.), None), None);
    }

    #[test]
    fn test_patch_rect_is_pyramid_compatible() {
        let flow = OpticalFlow::with_params(3, 20, 7);
        let rect = flow.patch_rect(&Rect::new(64.5, 10.5, 135.5, 81.5));
        assert_eq!(rect.width() as usize % 8, 0);
        assert_eq!(rect.height() as usize % 8, 0);
        assert!(rect.x1 < 64.5 && rect.x2 > 135.5);
        assert_eq!(rect.x1, rect.x1.floor());
    }

    #[test]
    fn test_gradients() {
        let center = Vector2d::new(2., 2.);
        let mut image = Image::filled(5, 5, 0);
        let window = Window::around(&image, center, 1, 1).unwrap();
        let flat = Gradients::at(&image, center, window);
        assert_eq!(flat.ix, Matrixd::zeros(3, 3));
        assert_eq!(flat.structure_tensor(), Matrix2d::zeros());

        // horizontal ramp of one grey level per pixel
        for (i, v) in image.data.iter_mut().enumerate() {
            *v = (i % 5) as u8;
        }
        let ramp = Gradients::at(&image, center, window);
        assert_eq!(ramp.ix, Matrixd::repeat(3, 3, 1.));
        assert_eq!(ramp.iy, Matrixd::zeros(3, 3));
        assert_eq!(ramp.structure_tensor(), Matrix2d::new(9., 0., 0., 0.));

        // vertical line in the middle column
        for (i, v) in image.data.iter_mut().enumerate() {
            *v = if i % 5 == 2 { 5 } else { 0 };
        }
        let line = Gradients::at(&image, center, window);
        let edges = Matrixd::from_row_slice(3, 3, &[2.5, 0., -2.5, 2.5, 0., -2.5, 2.5, 0., -2.5]);
        assert_eq!(line.ix, edges);
        assert_eq!(line.iy, Matrixd::zeros(3, 3));
    }

    #[test]
    fn test_window_clipping() {
        // (0, 0) is the center of the top-left pixel of this 10x10 image
        let image = Image::filled(10, 10, 0);
        let window = |x, y, margin| Window::around(&image, Vector2d::new(x, y), 3, margin);
        assert_eq!(window(4.5, 4.5, 0), Some(Window { x: [-3, 3], y: [-3, 3] }));
        assert_eq!(window(1.5, 8.0, 0), Some(Window { x: [-1, 3], y: [-3, 1] }));
        assert_eq!(window(0.9, 1.9, 1), Some(Window { x: [1, 3], y: [0, 3] }));
        assert_eq!(window(9.5, 2.0, 0), None);
        assert_eq!(window(4.5, 4.5, 0).map(|w| (w.rows(), w.cols())), Some((7, 7)));
        assert_eq!(window(4.5, 4.5, 0).map(|w| w.grown(1).x), Some([-4, 4]));
    }
}
