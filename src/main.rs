use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use clap::Parser;
use log::{info, warn};

use indicatif::ProgressStyle;
use tracing::info_span;
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::filter::LevelFilter;

use marker_tracker::config::*;
use marker_tracker::context::TrackerContext;
use marker_tracker::dataset::*;
use marker_tracker::events::*;
use marker_tracker::frame_accessor::SequenceSource;
use marker_tracker::marker::TrackMarker;
use marker_tracker::my_types::*;
use marker_tracker::track_args::TransformSolver;

#[derive(Parser)]
pub struct Args {
    /// JSON-lines blob sequence, a random one is generated when missing
    #[clap(short, long)]
    pub input: Option<String>,
    #[clap(long, default_value = "60")]
    pub frames: usize,
    #[clap(long, default_value = "4")]
    pub markers: usize,
    #[clap(long, default_value = "320")]
    pub width: usize,
    #[clap(long, default_value = "240")]
    pub height: usize,
    /// Largest blob displacement between two frames of a random sequence
    #[clap(long, default_value = "1.5")]
    pub max_speed: f64,
    /// Write the tracked markers to this JSON file
    #[clap(long)]
    pub save: Option<String>,
    #[clap(short, long)]
    pub verbose: bool,
    #[clap(flatten)]
    pub config: Config,
}

/// Average displacement of the enabled markers relative to the reference frame
#[derive(Default)]
struct MeanTranslation {
    translations: Mutex<BTreeMap<Frame, Vector2d>>,
}

impl TransformSolver for MeanTranslation {
    fn solve(&self, markers: &[Arc<TrackMarker>], reference_frame: Frame) {
        let mut sums: BTreeMap<Frame, (Vector2d, usize)> = BTreeMap::new();
        for marker in markers {
            let reference = marker.point_at(reference_frame);
            for frame in marker.center_keyframes() {
                if !marker.is_enabled(frame) {
                    continue;
                }
                let entry = sums.entry(frame).or_insert((Vector2d::zeros(), 0));
                entry.0 += marker.point_at(frame) - reference;
                entry.1 += 1;
            }
        }
        let mut translations = self
            .translations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *translations = sums
            .into_iter()
            .map(|(frame, (sum, n))| (frame, sum / n as f64))
            .collect();
    }
}

fn main() -> Result<()> {
    // parse the config
    let args = Args::parse();
    let config = args.config.clone();
    let _ = CONFIG.set(args.config);

    // setup logging
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stdout_writer()))
        .with(indicatif_layer)
        .with(level)
        .init();

    // load or generate the sequence
    let sequence = match &args.input {
        Some(path) => load_blob_sequence(Path::new(path))?,
        None => SyntheticSequence::random(
            Format::new(args.width, args.height),
            args.frames,
            args.markers,
            args.max_speed,
            config.seed,
        ),
    };
    let sequence = Arc::new(sequence);
    let (first, last) = sequence.frame_range();

    let (context, events) = TrackerContext::new(config)?;
    context.set_sequence(sequence.clone());
    let solver = Arc::new(MeanTranslation::default());
    context.set_solver(solver.clone());
    context.set_transform_reference_frame(first);
    context.set_current_frame(first);

    // one marker per blob
    for position in sequence.blob_positions(first).into_iter().take(args.markers) {
        let marker = context.create_marker()?;
        marker.set_center(first, position);
    }
    context.select_all(SelectionReason::Viewer);
    info!(
        "tracking {} markers over frames {}..={}",
        context.selected_markers().len(),
        first,
        last
    );

    let header_span = info_span!("header");
    header_span.pb_set_style(&ProgressStyle::default_bar());
    header_span.pb_set_length(100);
    let header_span_enter = header_span.enter();

    context.track_selected_markers(first, last + 1, 1)?;

    let mut shown = 0;
    let summary = loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Some(TrackerEvent::TrackingProgress(progress)) => {
                let position = (progress * 100.) as u64;
                if position > shown {
                    header_span.pb_inc(position - shown);
                    shown = position;
                }
            }
            Some(TrackerEvent::TrackingFinished(summary)) => break summary,
            Some(_) => {}
            None if !context.is_currently_tracking() => {
                break context.scheduler().last_summary().unwrap_or_default();
            }
            None => {}
        }
    };

    std::mem::drop(header_span_enter);
    std::mem::drop(header_span);

    info!(
        "{} frames processed, last valid frame {:?}",
        summary.frames_processed, summary.last_valid_frame
    );
    for (marker, frame) in &summary.disabled_markers {
        warn!("{} lost at frame {}", marker, frame);
    }
    for marker in context.all_markers() {
        report(&marker, &sequence, first, last);
    }
    let translations = solver
        .translations
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some((frame, translation)) = translations.iter().next_back() {
        info!(
            "mean translation at frame {}: ({:.2}, {:.2})",
            frame, translation.x, translation.y
        );
    }

    if let Some(path) = &args.save {
        std::fs::write(path, context.to_json()?)
            .with_context(|| format!("cannot write {}", path))?;
        info!("saved markers to {}", path);
    }

    Ok(())
}

/// Tracked span and distance to the closest blob of one marker
fn report(marker: &TrackMarker, sequence: &SyntheticSequence, first: Frame, last: Frame) {
    let mut tracked = 0;
    let mut total_distance = 0.;
    let mut lost_at = None;
    for frame in first..=last {
        if !marker.is_enabled(frame) {
            lost_at.get_or_insert(frame);
            continue;
        }
        let point = marker.point_at(frame);
        let distance = sequence
            .blob_positions(frame)
            .iter()
            .map(|p| (p - point).norm())
            .fold(f64::INFINITY, f64::min);
        total_distance += distance;
        tracked += 1;
    }
    let mean = if tracked > 0 {
        total_distance / tracked as f64
    } else {
        f64::NAN
    };
    match lost_at {
        Some(frame) => info!(
            "{}: tracked {} frames, lost at {}, mean distance to blob {:.2} px",
            marker.label(),
            tracked,
            frame,
            mean
        ),
        None => info!(
            "{}: tracked {} frames, mean distance to blob {:.2} px",
            marker.label(),
            tracked,
            mean
        ),
    }
}
