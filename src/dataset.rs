//! Image sequences to track: procedurally rendered textured blobs moving over
//! a noisy background, either random or described by a JSON-lines file.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use log::{debug, warn};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::curve::Curve;
use crate::error::TrackerError;
use crate::frame_accessor::SequenceSource;
use crate::image::{ColorImage, Image};
use crate::my_types::*;

const BACKGROUND_LEVEL: f64 = 40.;
const BLOB_LEVEL: f64 = 200.;

/// A textured blob following a keyframed path
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    pub radius: f64,
    #[serde(default = "white")]
    pub color: [u8; 3],
    pub path: Curve<Vector2d>,
}

fn white() -> [u8; 3] {
    [255, 255, 255]
}

impl Blob {
    /// A blob moving at constant velocity from `start` at frame `first`
    pub fn linear(start: Vector2d, velocity: Vector2d, radius: f64, first: Frame, last: Frame) -> Self {
        let mut path = Curve::new();
        path.set_key(first, start);
        path.set_key(last, start + velocity * (last - first) as f64);
        Self {
            radius,
            color: white(),
            path,
        }
    }

    pub fn position_at(&self, frame: Frame) -> Option<Vector2d> {
        self.path.value_at(frame)
    }

    /// Intensity in `[0, 1]` at offset `d` from the blob center
    fn intensity(&self, d: Vector2d) -> f64 {
        let falloff = (-d.norm_squared() / (2. * self.radius * self.radius)).exp();
        let texture = 0.7 + 0.3 * (d.x * 1.3).sin() * (d.y * 0.9).cos();
        falloff * texture
    }
}

pub struct SyntheticSequence {
    format: Format,
    first: Frame,
    last: Frame,
    blobs: Vec<Blob>,
    background: Image,
    seed: u64,
    frame_noise: u8,
}

impl SyntheticSequence {
    pub fn new(format: Format, first: Frame, last: Frame, blobs: Vec<Blob>, seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut background = Image::filled(format.width, format.height, 0);
        for v in background.data.iter_mut() {
            *v = (BACKGROUND_LEVEL + rng.gen_range(-8.0..8.0)) as u8;
        }
        Self {
            format,
            first,
            last,
            blobs,
            background,
            seed,
            frame_noise: 0,
        }
    }

    /// `count` blobs placed away from the borders, moving at up to
    /// `max_speed` pixels per frame
    pub fn random(format: Format, frame_count: usize, count: usize, max_speed: f64, seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed.wrapping_add(1));
        let first = 0;
        let last = frame_count.saturating_sub(1) as Frame;
        let radius = 6.;
        let margin = 40.;
        let (w, h) = (format.width as f64, format.height as f64);
        let blobs = (0..count)
            .map(|_| {
                let velocity = Vector2d::new(
                    rng.gen_range(-max_speed..=max_speed),
                    rng.gen_range(-max_speed..=max_speed),
                );
                // keep the whole path inside the margins
                let travel = velocity.abs() * (last - first) as f64;
                let x0 = if velocity.x < 0. { margin + travel.x } else { margin };
                let y0 = if velocity.y < 0. { margin + travel.y } else { margin };
                let span = Vector2d::new(
                    (w - 2. * margin - travel.x).max(1.),
                    (h - 2. * margin - travel.y).max(1.),
                );
                let start = Vector2d::new(
                    x0 + rng.gen_range(0.0..span.x),
                    y0 + rng.gen_range(0.0..span.y),
                );
                Blob::linear(start, velocity, radius, first, last)
            })
            .collect();
        Self::new(format, first, last, blobs, seed)
    }

    /// Add fresh noise of up to `amplitude` levels to every rendered frame
    pub fn with_frame_noise(mut self, amplitude: u8) -> Self {
        self.frame_noise = amplitude;
        self
    }

    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }

    /// Center of every blob at `frame`
    pub fn blob_positions(&self, frame: Frame) -> Vec<Vector2d> {
        self.blobs
            .iter()
            .filter_map(|blob| blob.position_at(frame))
            .collect()
    }

    pub fn render(&self, frame: Frame) -> ColorImage {
        let mut rgb = vec![[0.; 3]; self.format.width * self.format.height];
        for (px, v) in rgb.iter_mut().zip(&self.background.data) {
            *px = [*v as f64; 3];
        }

        for blob in &self.blobs {
            let Some(center) = blob.position_at(frame) else {
                continue;
            };
            let reach = 3. * blob.radius;
            let x0 = (center.x - reach).floor().max(0.) as usize;
            let y0 = (center.y - reach).floor().max(0.) as usize;
            let x1 = ((center.x + reach).ceil().max(0.) as usize).min(self.format.width);
            let y1 = ((center.y + reach).ceil().max(0.) as usize).min(self.format.height);
            for y in y0..y1 {
                for x in x0..x1 {
                    let d = Vector2d::new(x as f64, y as f64) - center;
                    let value = BLOB_LEVEL * blob.intensity(d);
                    let px = &mut rgb[y * self.format.width + x];
                    for c in 0..3 {
                        px[c] += value * blob.color[c] as f64 / 255.;
                    }
                }
            }
        }

        if self.frame_noise > 0 {
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.seed ^ (frame as u64).rotate_left(32));
            let amplitude = self.frame_noise as f64;
            for px in rgb.iter_mut() {
                let n = rng.gen_range(-amplitude..=amplitude);
                for v in px.iter_mut() {
                    *v += n;
                }
            }
        }

        ColorImage {
            data: rgb
                .into_iter()
                .map(|px| px.map(|v| v.round().clamp(0., 255.) as u8))
                .collect(),
            width: self.format.width,
            height: self.format.height,
        }
    }
}

impl SequenceSource for SyntheticSequence {
    fn format(&self) -> Format {
        self.format
    }

    fn frame_range(&self) -> (Frame, Frame) {
        (self.first, self.last)
    }

    fn read_frame(&self, frame: Frame) -> crate::error::Result<ColorImage> {
        if frame < self.first || frame > self.last {
            return Err(TrackerError::FrameUnavailable(frame));
        }
        Ok(self.render(frame))
    }
}

/// Read a blob sequence from a JSON-lines file. Recognized lines:
///
/// - `{"format": {"width": 320, "height": 240}, "first": 0, "last": 59, "seed": 1}`
/// - `{"blob": {"radius": 6, "color": [255, 0, 0]}}`
/// - `{"key": {"blob": 0, "frame": 10, "position": [12.5, 40]}}`
///
/// Keys refer to blobs by their order in the file.
pub fn load_blob_sequence(path: &Path) -> Result<SyntheticSequence> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut header = None;
    let mut blobs: Vec<Blob> = vec![];
    for (number, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", number + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(&line)
            .context(format!("JSON deserialization failed for line: {}", line))?;
        let value = value
            .as_object()
            .ok_or(anyhow!("JSON line is not a map"))?;

        if let Some(format) = value.get("format") {
            let format: Format = serde_json::from_value(format.clone())
                .context("invalid format")?;
            let first = value.get("first").and_then(|v| v.as_i64()).unwrap_or(0) as Frame;
            let last = value
                .get("last")
                .and_then(|v| v.as_i64())
                .ok_or(anyhow!("format line without last frame"))? as Frame;
            let seed = value.get("seed").and_then(|v| v.as_u64()).unwrap_or(0);
            header = Some((format, first, last, seed));
        } else if let Some(blob) = value.get("blob") {
            let radius = blob["radius"]
                .as_f64()
                .ok_or(anyhow!("blob radius is not a number"))?;
            let color = match blob.get("color") {
                Some(color) => serde_json::from_value(color.clone()).context("invalid blob color")?,
                None => white(),
            };
            blobs.push(Blob {
                radius,
                color,
                path: Curve::new(),
            });
        } else if let Some(key) = value.get("key") {
            let index = key["blob"]
                .as_u64()
                .ok_or(anyhow!("key without blob index"))? as usize;
            let frame = key["frame"]
                .as_i64()
                .ok_or(anyhow!("key frame is not a number"))? as Frame;
            let position: [f64; 2] = serde_json::from_value(key["position"].clone())
                .context("invalid key position")?;
            let Some(blob) = blobs.get_mut(index) else {
                bail!("key refers to unknown blob {}", index);
            };
            blob.path.set_key(frame, Vector2d::new(position[0], position[1]));
        } else {
            warn!("Unrecognised data format {}", line);
        }
    }

    let (format, first, last, seed) = header.ok_or(anyhow!("missing format line"))?;
    if last < first {
        bail!("last frame {} is before first frame {}", last, first);
    }
    for (i, blob) in blobs.iter().enumerate() {
        if blob.path.is_empty() {
            warn!("blob {} has no keys and is never drawn", i);
        }
    }
    debug!("loaded {} blobs over frames {}..={}", blobs.len(), first, last);
    Ok(SyntheticSequence::new(format, first, last, blobs, seed))
}
