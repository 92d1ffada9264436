use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::my_types::*;

/// Row-major grayscale image storage
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl Image {
    /// Create an empty image
    pub fn empty() -> Image {
        Image {
            data: vec![],
            width: 0,
            height: 0,
        }
    }

    pub fn filled(width: usize, height: usize, value: u8) -> Image {
        Image {
            data: vec![value; width * height],
            width,
            height,
        }
    }

    /// Clear the image storage
    pub fn clear(&mut self) {
        self.data.clear();
        self.width = 0;
        self.height = 0;
    }

    /// Get the size for a chosen dimension
    pub fn size(&self, dim: usize) -> usize {
        if dim == 0 {
            self.width
        } else {
            self.height
        }
    }

    #[inline(always)]
    pub fn value(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    #[inline(always)]
    pub fn value_i32(&self, x: i32, y: i32) -> u8 {
        self.data[y as usize * self.width + x as usize]
    }

    /// Pixel value with coordinates clamped to the image borders
    #[inline(always)]
    pub fn value_clamped(&self, x: i64, y: i64) -> u8 {
        let x = num_traits::clamp(x, 0, self.width as i64 - 1);
        let y = num_traits::clamp(y, 0, self.height as i64 - 1);
        self.data[y as usize * self.width + x as usize]
    }

    #[inline(always)]
    pub fn set_value(&mut self, x: usize, y: usize, value: u8) {
        self.data[y * self.width + x] = value;
    }

    /// Copy `patch` so that its top-left pixel lands on `(x, y)`. Pixels
    /// falling outside of `self` are dropped.
    pub fn set_sub_image_i32(&mut self, x: i32, y: i32, patch: &Image) {
        for py in 0..patch.height as i32 {
            for px in 0..patch.width as i32 {
                let tx = x + px;
                let ty = y + py;
                if tx < 0 || ty < 0 || tx >= self.width as i32 || ty >= self.height as i32 {
                    continue;
                }
                self.set_value(tx as usize, ty as usize, patch.value_i32(px, py));
            }
        }
    }

    /// Copy the `width` x `height` window whose top-left pixel is `(x0, y0)`.
    /// Pixels outside of the image repeat the nearest border pixel.
    pub fn crop_clamped(&self, x0: i64, y0: i64, width: usize, height: usize) -> Image {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height as i64 {
            for x in 0..width as i64 {
                data.push(self.value_clamped(x0 + x, y0 + y));
            }
        }
        Image {
            data,
            width,
            height,
        }
    }
}

/// Bilinear interpolation, `p` must lie inside the image
pub fn bilinear(image: &Image, p: Vector2d) -> f64 {
    let x0 = p.x.floor();
    let y0 = p.y.floor();
    let ax = p.x - x0;
    let ay = p.y - y0;
    let x0 = x0 as i64;
    let y0 = y0 as i64;
    let v00 = image.value_clamped(x0, y0) as f64;
    let v10 = image.value_clamped(x0 + 1, y0) as f64;
    let v01 = image.value_clamped(x0, y0 + 1) as f64;
    let v11 = image.value_clamped(x0 + 1, y0 + 1) as f64;
    (1. - ay) * ((1. - ax) * v00 + ax * v10) + ay * ((1. - ax) * v01 + ax * v11)
}

/// Samples a `(2 * half_w + 1) x (2 * half_h + 1)` grid centered on `center`.
/// Returns None if any sample falls outside of the image.
pub fn sample_window(image: &Image, center: Vector2d, half_w: i32, half_h: i32) -> Option<Vec<f64>> {
    let max_x = image.width as f64 - 1.;
    let max_y = image.height as f64 - 1.;
    if center.x - (half_w as f64) < 0.
        || center.y - (half_h as f64) < 0.
        || center.x + (half_w as f64) > max_x
        || center.y + (half_h as f64) > max_y
    {
        return None;
    }
    let mut out = Vec::with_capacity(((2 * half_w + 1) * (2 * half_h + 1)) as usize);
    for dy in -half_h..=half_h {
        for dx in -half_w..=half_w {
            out.push(bilinear(image, center + Vector2d::new(dx as f64, dy as f64)));
        }
    }
    Some(out)
}

/// Normalized cross correlation of two sample sets of the same length, in
/// `[-1, 1]`. Flat windows correlate only with flat windows.
pub fn normalized_cross_correlation(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return 0.;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.;
    let mut var_a = 0.;
    let mut var_b = 0.;
    for (x, y) in a.iter().zip(b) {
        let da = x - mean_a;
        let db = y - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a < 1e-9 || var_b < 1e-9 {
        return if var_a < 1e-9 && var_b < 1e-9 { 1. } else { 0. };
    }
    cov / (var_a * var_b).sqrt()
}

/// Which of the red, green and blue channels contribute to the luminance that
/// gets tracked
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMask {
    pub red: bool,
    pub green: bool,
    pub blue: bool,
}

impl ChannelMask {
    pub fn new(red: bool, green: bool, blue: bool) -> Self {
        Self { red, green, blue }
    }

    pub fn as_array(&self) -> [bool; 3] {
        [self.red, self.green, self.blue]
    }

    pub fn count(&self) -> usize {
        self.as_array().iter().filter(|c| **c).count()
    }
}

impl Default for ChannelMask {
    fn default() -> Self {
        Self::new(true, true, true)
    }
}

impl FromStr for ChannelMask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = ChannelMask::new(false, false, false);
        for c in s.chars() {
            match c.to_ascii_lowercase() {
                'r' => mask.red = true,
                'g' => mask.green = true,
                'b' => mask.blue = true,
                other => return Err(format!("unknown channel '{other}' in \"{s}\"")),
            }
        }
        if mask.count() == 0 {
            return Err("at least one channel must be enabled".to_string());
        }
        Ok(mask)
    }
}

impl fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (enabled, name) in self.as_array().iter().zip(['r', 'g', 'b']) {
            if *enabled {
                write!(f, "{name}")?;
            }
        }
        Ok(())
    }
}

/// Row-major interleaved RGB image, as handed over by a sequence source
#[derive(Clone, Debug)]
pub struct ColorImage {
    pub data: Vec<[u8; 3]>,
    pub width: usize,
    pub height: usize,
}

impl ColorImage {
    pub fn from_gray(image: &Image) -> Self {
        Self {
            data: image.data.iter().map(|v| [*v, *v, *v]).collect(),
            width: image.width,
            height: image.height,
        }
    }

    /// Average of the enabled channels. An empty mask falls back to all channels.
    pub fn to_gray(&self, channels: ChannelMask) -> Image {
        let mask = if channels.count() == 0 {
            ChannelMask::default()
        } else {
            channels
        };
        let enabled = mask.as_array();
        let n = mask.count() as u16;
        let data = self
            .data
            .iter()
            .map(|px| {
                let sum: u16 = px
                    .iter()
                    .zip(enabled)
                    .filter(|(_, e)| *e)
                    .map(|(v, _)| *v as u16)
                    .sum();
                (sum / n) as u8
            })
            .collect();
        Image {
            data,
            width: self.width,
            height: self.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bilinear() {
        let image = Image {
            data: vec![0, 10, 20, 30],
            width: 2,
            height: 2,
        };
        assert_eq!(bilinear(&image, Vector2d::new(0., 0.)), 0.);
        assert_eq!(bilinear(&image, Vector2d::new(1., 1.)), 30.);
        assert!((bilinear(&image, Vector2d::new(0.5, 0.5)) - 15.).abs() < 1e-12);
    }

    #[test]
    fn test_crop_clamped() {
        let image = Image {
            data: vec![1, 2, 3, 4],
            width: 2,
            height: 2,
        };
        let crop = image.crop_clamped(-1, 0, 3, 2);
        assert_eq!(crop.data, vec![1, 1, 2, 3, 3, 4]);
    }

    #[test]
    fn test_ncc() {
        let a = [1., 2., 3., 4.];
        let b = [10., 20., 30., 40.];
        let c = [4., 3., 2., 1.];
        assert!((normalized_cross_correlation(&a, &b) - 1.).abs() < 1e-12);
        assert!((normalized_cross_correlation(&a, &c) + 1.).abs() < 1e-12);
        assert_eq!(normalized_cross_correlation(&[5.; 4], &[5.; 4]), 1.);
    }

    #[test]
    fn test_channel_mask() {
        assert_eq!("rb".parse::<ChannelMask>().unwrap(), ChannelMask::new(true, false, true));
        assert!("x".parse::<ChannelMask>().is_err());
        assert!("".parse::<ChannelMask>().is_err());
        assert_eq!(ChannelMask::new(false, true, true).to_string(), "gb");

        let color = ColorImage {
            data: vec![[30, 60, 90]],
            width: 1,
            height: 1,
        };
        assert_eq!(color.to_gray(ChannelMask::new(true, false, true)).data, vec![60]);
        assert_eq!(color.to_gray(ChannelMask::new(false, true, false)).data, vec![60]);
    }
}
