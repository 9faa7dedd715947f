use thiserror::Error;

/// Failure taxonomy surfaced by `extract` and `solve`.
///
/// Tile-level extraction problems are not represented here: a failing tile
/// degrades to an empty star list and is logged by the partition scheduler.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no index files found in the configured paths")]
    NoIndexes,

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("no solution found after exhausting all depths and scales")]
    NoSolution,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("solver time limit elapsed")]
    TimedOut,

    #[error("internal error ({0})")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
