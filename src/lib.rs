//! Unordered 2D point-set registration.
//!
//! Trimatch finds the similarity transform (translation, rotation and
//! uniform scale) taking one point list onto another, with no known
//! correspondences between them. Triangles built along each list's
//! minimum spanning tree are hashed by shape; shape-similar pairs propose
//! transforms, and each proposal is scored by how many points it carries
//! onto a point of the other list.

pub mod geom;
pub mod graph;
pub mod grid;
pub mod linsolve;
pub mod matcher;
pub mod triangles;
pub mod verify;

pub use geom::{Point, SimilarityTransform};
pub use matcher::{ConfigError, MatchConfig, MatchResult, MessageSink, PointSetMatcher, SolveStats};
