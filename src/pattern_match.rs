use log::trace;

use crate::backend::*;
use crate::config::Config;
use crate::error::{Result, TrackerError};
use crate::frame_accessor::ImageAccessor;
use crate::image::*;
use crate::my_types::*;

/// Pattern-matching tracker: exhaustive normalized cross correlation of the
/// reference pattern over every whole-pixel position of the search window,
/// refined to sub-pixel precision with a parabola fit.
#[derive(Debug)]
pub struct PatternMatch {
    min_correlation: f64,
}

impl PatternMatch {
    pub fn new(config: &Config) -> Self {
        Self {
            min_correlation: config.min_correlation(),
        }
    }
}

impl TrackingBackend for PatternMatch {
    fn track(
        &self,
        reference: &MarkerSnapshot,
        target_frame: Frame,
        accessor: &dyn ImageAccessor,
    ) -> Result<TrackRegionResult> {
        let (half_w, half_h) = reference.pattern_half_size();
        let margin = Vector2d::new(half_w as f64 + 2., half_h as f64 + 2.);

        let template_rect = Rect::new(
            reference.point.x - margin.x,
            reference.point.y - margin.y,
            reference.point.x + margin.x,
            reference.point.y + margin.y,
        );
        let template_patch = accessor.get_patch(reference.reference_frame, template_rect)?;
        let template = sample_window(
            &template_patch.image,
            template_patch.to_local(reference.point),
            half_w,
            half_h,
        )
        .ok_or(TrackerError::PatchOutOfBounds {
            frame: reference.reference_frame,
            x: reference.point.x,
            y: reference.point.y,
        })?;

        let search = reference.search_window;
        let search_patch = accessor.get_patch(
            target_frame,
            Rect::new(
                search.x1 - margin.x,
                search.y1 - margin.y,
                search.x2 + margin.x,
                search.y2 + margin.y,
            ),
        )?;

        let dx_range = (search.x1 - reference.point.x).ceil() as i32
            ..=(search.x2 - reference.point.x).floor() as i32;
        let dy_range = (search.y1 - reference.point.y).ceil() as i32
            ..=(search.y2 - reference.point.y).floor() as i32;
        let cols = dx_range.clone().count();
        let rows = dy_range.clone().count();
        if cols == 0 || rows == 0 {
            return Err(TrackerError::Backend(format!(
                "{} has an empty search window",
                reference.name
            )));
        }

        let mut scores = Matrixd::from_element(rows, cols, f64::NEG_INFINITY);
        let mut best = (0, 0, f64::NEG_INFINITY);
        for (row, dy) in dy_range.clone().enumerate() {
            for (col, dx) in dx_range.clone().enumerate() {
                let candidate = reference.point + Vector2d::new(dx as f64, dy as f64);
                let samples = match sample_window(
                    &search_patch.image,
                    search_patch.to_local(candidate),
                    half_w,
                    half_h,
                ) {
                    Some(samples) => samples,
                    None => continue,
                };
                let score = normalized_cross_correlation(&template, &samples);
                scores[(row, col)] = score;
                if score > best.2 {
                    best = (row, col, score);
                }
            }
        }

        let (row, col, correlation) = best;
        if correlation < self.min_correlation || !correlation.is_finite() {
            return Err(TrackerError::Backend(format!(
                "{} best correlation {:.3} below {:.3} at frame {}",
                reference.name, correlation, self.min_correlation, target_frame
            )));
        }

        let sub_x = parabola_peak(
            col.checked_sub(1).map(|c| scores[(row, c)]),
            correlation,
            (col + 1 < cols).then(|| scores[(row, col + 1)]),
        );
        let sub_y = parabola_peak(
            row.checked_sub(1).map(|r| scores[(r, col)]),
            correlation,
            (row + 1 < rows).then(|| scores[(row + 1, col)]),
        );
        let delta = Vector2d::new(
            *dx_range.start() as f64 + col as f64 + sub_x,
            *dy_range.start() as f64 + row as f64 + sub_y,
        );
        let point = reference.point + delta;
        trace!(
            "{} {} -> {}: ({:.2}, {:.2}) corr {:.3}",
            reference.name,
            reference.reference_frame,
            target_frame,
            point.x,
            point.y,
            correlation
        );

        Ok(TrackRegionResult {
            point,
            pattern: translate_pattern(&reference.pattern, delta),
            correlation,
        })
    }

    fn kind(&self) -> BackendKind {
        BackendKind::PatternMatch
    }
}

/// Offset in `[-0.5, 0.5]` of the vertex of the parabola through three
/// neighbouring scores, 0 at the border of the score grid
fn parabola_peak(left: Option<f64>, center: f64, right: Option<f64>) -> f64 {
    match (left, right) {
        (Some(l), Some(r)) if l.is_finite() && r.is_finite() => {
            let denom = l - 2. * center + r;
            if denom.abs() < 1e-12 {
                0.
            } else {
                (0.5 * (l - r) / denom).clamp(-0.5, 0.5)
            }
        }
        _ => 0.,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parabola_peak() {
        assert_eq!(parabola_peak(Some(0.5), 1., Some(0.5)), 0.);
        assert!(parabola_peak(Some(0.4), 1., Some(0.8)) > 0.);
        assert!(parabola_peak(Some(0.8), 1., Some(0.4)) < 0.);
        assert_eq!(parabola_peak(None, 1., Some(0.4)), 0.);
        assert_eq!(parabola_peak(Some(f64::NEG_INFINITY), 1., Some(0.4)), 0.);
    }
}
