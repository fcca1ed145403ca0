//! Planar geometry: points and similarity transforms.

pub mod point;
pub mod similarity;

pub use point::{IndexedPoint, Locate, Point};
pub use similarity::{FitError, SimilarityTransform};
