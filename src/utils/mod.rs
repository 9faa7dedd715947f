pub mod cancel;
pub mod kdtree;
pub mod stats;
