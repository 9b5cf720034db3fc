//! Slide pipeline controller.
//!
//! [`SlideController`] owns the run's [`PipelineConfig`] and moves each
//! [`SlideJob`](crate::slide::SlideJob) through tiling, inference and
//! reassembly, isolating failures per slide.

mod controller;

pub use controller::{
    expand_inputs, BatchReport, PipelineConfig, SlideController, SlideOutcome, SlideReport,
    SlideState, CACHED_PREDICTIONS,
};
