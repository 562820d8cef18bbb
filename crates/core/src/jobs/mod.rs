//! Job engine boundary: job submission and lifecycle signals.

mod http;
mod types;

pub use http::HttpJobEngine;
pub use types::{
    JobEngine, JobEngineError, JobHandle, JobProgress, JobSignal, JobSignalStream, JobSpec,
};
