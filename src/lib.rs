//! Star extraction and native plate solving for astronomical images.
//!
//! The caller hands the engine a raw pixel buffer plus a [`Statistic`]
//! descriptor; the engine detects stars (tiled across worker threads),
//! filters them, and identifies the field by matching star-quad geometric
//! hashes against pre-built index files, producing a SIP-augmented
//! tangent-projection WCS.

pub mod domain;
pub mod engine;
pub mod error;
pub mod model;
pub mod utils;

pub use crate::domain::solver::SolveStage;
pub use crate::domain::wcs::{SipTerms, SipWcs};
pub use crate::engine::Engine;
pub use crate::error::{Error, Result};
pub use crate::model::{
    ApertureShape, Background, Parameters, Parity, PositionHint, SampleType, ScaleHint,
    ScaleUnits, Solution, Star, Statistic, SubFrame,
};
pub use crate::utils::cancel::CancelToken;
