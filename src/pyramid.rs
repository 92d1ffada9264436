use crate::error::{Result, TrackerError};
use crate::image::Image;

/// Downsized copies of an image, `levels[0]` is half the size of the parent
#[derive(Debug)]
pub struct Pyramid {
    pub levels: Vec<Image>,
    pub parent_size: [usize; 2],
}

impl Pyramid {
    pub fn empty() -> Self {
        Self {
            levels: vec![],
            parent_size: [0; 2],
        }
    }

    pub fn compute(&mut self, frame: &Image, level_count: usize) -> Result<()> {
        self.levels.truncate(level_count);
        while self.levels.len() < level_count {
            self.levels.push(Image::empty())
        }
        if level_count > 0 {
            downscale(frame, &mut self.levels[0])?;
            for i in 0..(level_count - 1) {
                if let Some((parent, rest)) = self.levels[i..].split_first_mut() {
                    downscale(parent, &mut rest[0])?;
                }
            }
        }
        self.parent_size = [frame.width, frame.height];
        Ok(())
    }
}

/// A patch together with its pyramid, level 0 being the patch itself
#[derive(Debug)]
pub struct PatchPyramid {
    pub base: Image,
    pub pyramid: Pyramid,
}

impl PatchPyramid {
    pub fn new(base: Image, level_count: usize) -> Result<PatchPyramid> {
        let mut pyramid = Pyramid::empty();
        pyramid.compute(&base, level_count)?;
        Ok(PatchPyramid { base, pyramid })
    }

    pub fn level(&self, level: usize) -> &Image {
        match level {
            0 => &self.base,
            _ => &self.pyramid.levels[level - 1],
        }
    }

    /// Number of halvings available below the base
    pub fn depth(&self) -> usize {
        self.pyramid.levels.len()
    }
}

/// Smallest size not below `size` that can be halved `level_count` times
pub fn pyramid_compatible_size(size: usize, level_count: usize) -> usize {
    let unit = 1usize << level_count;
    size.div_ceil(unit).max(1) * unit
}

/// Downscale the parent image with a 3x3 binomial kernel and store the result in child
fn downscale(parent: &Image, child: &mut Image) -> Result<()> {
    let w = parent.width as i32;
    let h = parent.height as i32;
    if w % 2 != 0 || h % 2 != 0 || w == 0 || h == 0 {
        return Err(TrackerError::ImageShape {
            width: parent.width,
            height: parent.height,
        });
    }

    let w_half = w / 2;
    let h_half = h / 2;
    child.data.clear();
    child.width = w_half as usize;
    child.height = h_half as usize;

    let v = |x: i32, y: i32| -> u16 {
        let x = x.clamp(0, w - 1);
        let y = y.clamp(0, h - 1);
        parent.value(x as usize, y as usize) as u16
    };

    for y in 0..h_half {
        let y2 = 2 * y;
        for x in 0..w_half {
            let x2 = 2 * x;
            let value = v(x2, y2) / 4
                + (v(x2 + 1, y2) + v(x2 - 1, y2) + v(x2, y2 + 1) + v(x2, y2 - 1)) / 8
                + (v(x2 + 1, y2 + 1) + v(x2 - 1, y2 - 1) + v(x2 - 1, y2 + 1) + v(x2 + 1, y2 - 1))
                    / 16;
            child.data.push(value as u8);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downscale_flat() {
        let image = Image::filled(16, 8, 100);
        let mut pyramid = Pyramid::empty();
        pyramid.compute(&image, 3).unwrap();
        assert_eq!(pyramid.levels.len(), 3);
        assert_eq!((pyramid.levels[2].width, pyramid.levels[2].height), (2, 1));
        // the kernel loses at most a couple of grey levels to integer division
        assert!(pyramid.levels[0].data.iter().all(|v| *v >= 97 && *v <= 100));
        assert_eq!(pyramid.parent_size, [16, 8]);
    }

    #[test]
    fn test_downscale_odd_size() {
        let image = Image::filled(6, 6, 0);
        let mut pyramid = Pyramid::empty();
        assert!(matches!(
            pyramid.compute(&image, 2),
            Err(TrackerError::ImageShape { width: 3, height: 3 })
        ));
    }

    #[test]
    fn test_patch_pyramid_levels() {
        let patch = PatchPyramid::new(Image::filled(32, 16, 7), 2).unwrap();
        assert_eq!(patch.depth(), 2);
        assert_eq!(patch.level(0).width, 32);
        assert_eq!((patch.level(2).width, patch.level(2).height), (8, 4));
    }

    #[test]
    fn test_compatible_size() {
        assert_eq!(pyramid_compatible_size(71, 3), 72);
        assert_eq!(pyramid_compatible_size(72, 3), 72);
        assert_eq!(pyramid_compatible_size(0, 2), 4);
    }
}
