use std::panic::{self, AssertUnwindSafe};

use log::{debug, trace, warn};

use crate::events::ValueChangedReason;
use crate::lease::EnabledLease;
use crate::my_types::*;
use crate::track_args::TrackArgs;

/// Track the marker `index` of `args` at `frame`. Returns whether the marker
/// holds a position at `frame` afterwards. Only touches that marker, so it can
/// run concurrently for distinct markers.
pub fn track_step(index: usize, args: &TrackArgs, frame: Frame, lease: &EnabledLease) -> bool {
    let Some(track) = args.tracks().get(index) else {
        return false;
    };
    if !track.is_enabled(frame) {
        return false;
    }

    // the start frame and user keyframes are anchors, there is nothing to track
    if frame == args.start() || track.is_user_keyframe(frame) {
        track.write_error(frame, 0., ValueChangedReason::Tracking);
        return true;
    }

    let reference_frame = track.get_reference_frame(frame, args.step());
    let snapshot = track.snapshot(reference_frame, frame, args.step(), args.channels());
    let backend = track.backend();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        backend.track(&snapshot, frame, args.accessor())
    }));

    match outcome {
        Ok(Ok(result)) => {
            trace!(
                "{} tracked at frame {} from {}",
                snapshot.name,
                frame,
                reference_frame
            );
            track.apply_track_result(frame, &result);
            true
        }
        Ok(Err(err)) => {
            debug!("{} failed at frame {}: {}", snapshot.name, frame, err);
            on_failure(args, frame, lease, index);
            false
        }
        Err(_) => {
            warn!("{} backend panicked at frame {}", snapshot.name, frame);
            on_failure(args, frame, lease, index);
            false
        }
    }
}

fn on_failure(args: &TrackArgs, frame: Frame, lease: &EnabledLease, index: usize) {
    if !args.auto_disable() {
        return;
    }
    let track = &args.tracks()[index];
    if let Err(err) = lease.write_enabled(track, frame, false) {
        warn!("cannot disable {}: {}", track.script_name(), err);
    }
}
