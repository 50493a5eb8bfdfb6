//! Symmetric template construction and longitudinal registration for
//! multi-session MRI datasets in a BIDS derivatives layout.
//!
//! The heavy lifting (registration, resampling, averaging) is done by
//! external neuroimaging tools behind [`engine::ImageEngine`]; this crate
//! owns the iteration, transform bookkeeping, caching and reporting.

pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod io;
pub mod processing;
pub mod transform;

mod utils;

#[cfg(feature = "python")]
mod binding;

pub use config::PipelineConfig;
pub use entry::{run_longitudinal, run_symmetrization};
pub use error::{PipelineError, PipelineResult};
