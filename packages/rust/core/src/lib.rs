//! Core pipeline orchestration for Loresmith.
//!
//! This crate ties the scheduler, provider, repair parser, merge engine, and
//! duplicate resolver together into end-to-end workflows over one worldbook.

pub mod pipeline;
pub mod prompts;

pub use pipeline::{
    ExtractionPipeline, ExtractionReport, PipelineConfig, ProgressReporter, SilentProgress,
};
