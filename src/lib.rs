pub mod backend;
pub mod config;
pub mod context;
pub mod curve;
pub mod dataset;
pub mod error;
pub mod events;
pub mod frame_accessor;
pub mod image;
pub mod knob;
pub mod lease;
pub mod marker;
pub mod my_types;
pub mod optical_flow;
pub mod pattern_match;
pub mod pyramid;
pub mod scheduler;
pub mod serialization;
pub mod track_args;
pub mod track_step;
