pub mod params;
pub mod solution;
pub mod star;
pub mod statistic;

pub use params::{ApertureShape, Parameters, Parity, PositionHint, ScaleHint, ScaleUnits};
pub use solution::Solution;
pub use star::{Background, Star};
pub use statistic::{SampleType, Statistic, SubFrame};
