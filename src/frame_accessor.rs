//! Read access to the pixels of the tracked sequence.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, trace};

use crate::error::{Result, TrackerError};
use crate::image::{ChannelMask, ColorImage, Image};
use crate::my_types::*;

/// Pixels of a frame region. `origin` is the frame coordinate of the top-left
/// pixel of `image`.
#[derive(Clone, Debug)]
pub struct Patch {
    pub origin: Vector2d,
    pub image: Image,
}

impl Patch {
    /// Convert a frame coordinate into a coordinate inside the patch
    pub fn to_local(&self, p: Vector2d) -> Vector2d {
        p - self.origin
    }

    pub fn to_frame(&self, p: Vector2d) -> Vector2d {
        p + self.origin
    }
}

/// Image access used by the backends. Called concurrently by every marker of
/// a frame.
pub trait ImageAccessor: Send + Sync {
    fn format(&self) -> Format;

    /// Grayscale pixels covering `rect`, rounded outward to whole pixels.
    /// Pixels outside of the frame repeat the border.
    fn get_patch(&self, frame: Frame, rect: Rect) -> Result<Patch>;

    /// Called once when a track run ends, cached data may be dropped
    fn end_of_run(&self) {}
}

/// A sequence of color frames, e.g. a decoded clip
pub trait SequenceSource: Send + Sync {
    fn format(&self) -> Format;

    /// First and last frame, both included
    fn frame_range(&self) -> (Frame, Frame);

    fn read_frame(&self, frame: Frame) -> Result<ColorImage>;
}

/// `ImageAccessor` over a `SequenceSource`, caching the luminance of every
/// frame it reads until the end of the run
pub struct FrameAccessor {
    source: Arc<dyn SequenceSource>,
    channels: ChannelMask,
    cache: RwLock<HashMap<Frame, Arc<Image>>>,
}

impl FrameAccessor {
    pub fn new(source: Arc<dyn SequenceSource>, channels: ChannelMask) -> Self {
        Self {
            source,
            channels,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached_frames(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn luminance(&self, frame: Frame) -> Result<Arc<Image>> {
        if let Some(image) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&frame)
        {
            return Ok(image.clone());
        }
        let (first, last) = self.source.frame_range();
        if frame < first || frame > last {
            return Err(TrackerError::FrameUnavailable(frame));
        }
        trace!("reading frame {frame}");
        let image = Arc::new(self.source.read_frame(frame)?.to_gray(self.channels));
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.entry(frame).or_insert(image).clone())
    }
}

impl ImageAccessor for FrameAccessor {
    fn format(&self) -> Format {
        self.source.format()
    }

    fn get_patch(&self, frame: Frame, rect: Rect) -> Result<Patch> {
        let image = self.luminance(frame)?;
        let x0 = rect.x1.floor();
        let y0 = rect.y1.floor();
        let width = (rect.x2.ceil() - x0).max(0.) as usize;
        let height = (rect.y2.ceil() - y0).max(0.) as usize;
        let outside = rect.x2 < 0.
            || rect.y2 < 0.
            || rect.x1 > (image.width as f64 - 1.)
            || rect.y1 > (image.height as f64 - 1.);
        if width == 0 || height == 0 || outside {
            let center = rect.center();
            return Err(TrackerError::PatchOutOfBounds {
                frame,
                x: center.x,
                y: center.y,
            });
        }
        Ok(Patch {
            origin: Vector2d::new(x0, y0),
            image: image.crop_clamped(x0 as i64, y0 as i64, width, height),
        })
    }

    fn end_of_run(&self) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        debug!("evicting {} cached frames", cache.len());
        cache.clear();
    }
}
