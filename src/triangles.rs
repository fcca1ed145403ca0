//! Triangle shape hashing.
//!
//! Every triangle has a 2D shape coordinate built from its sorted edge
//! lengths `r_min <= r_mid <= r_max`:
//!
//! ```text
//! (r_mid / r_min, r_max / r_mid)
//! ```
//!
//! The coordinate is unchanged by translation, rotation and uniform scale,
//! so similar triangles from two exposures land near each other in this
//! space whatever the relative pose. It does not see reflections or vertex
//! order; the transform fit downstream does.
//!
//! Candidate triangles are not every `C(n, 3)` triple: each node is joined
//! only with nodes a few hops away along the minimum spanning tree.

use thiserror::Error;

use crate::geom::point::{Locate, Point};
use crate::graph::Graph;
use crate::grid::{BoundsPolicy, GridError, Remap, SpatialGrid};

/// An ordered triple of points. Vertex order is the correspondence assumed
/// when two triangles are fitted against each other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub vertices: [Point; 3],
}

impl Triangle {
    pub fn new(a: Point, b: Point, c: Point) -> Self {
        Self {
            vertices: [a, b, c],
        }
    }

    /// The three edge lengths sorted ascending.
    pub fn edge_lengths(&self) -> [f64; 3] {
        let [a, b, c] = self.vertices;
        let mut edges = [a.distance(&b), b.distance(&c), c.distance(&a)];
        edges.sort_by(f64::total_cmp);
        edges
    }

    /// Shape coordinate `(r_mid / r_min, r_max / r_mid)`; `None` when two
    /// vertices coincide.
    pub fn invariant(&self) -> Option<Point> {
        let [r_min, r_mid, r_max] = self.edge_lengths();
        if !(r_min > 0.0) {
            return None;
        }
        let coord = Point::new(r_mid / r_min, r_max / r_mid);
        coord.is_finite().then_some(coord)
    }
}

/// A triangle drawn from a point list, with the list indices of its
/// vertices and its precomputed shape coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateTriangle {
    pub ids: [usize; 3],
    pub triangle: Triangle,
    pub invariant: Point,
}

impl Locate for CandidateTriangle {
    fn position(&self) -> Point {
        self.invariant
    }
}

/// Enumerate triangles anchored at each node `i`: for every pair `j < k`
/// reachable from `i` within `steps` hops with `i < j`, emit `(i, j, k)`.
///
/// Triangles with coincident vertices are skipped.
pub fn candidate_triangles(
    points: &[Point],
    graph: &Graph,
    steps: usize,
) -> Vec<CandidateTriangle> {
    assert_eq!(
        graph.node_count(),
        points.len(),
        "graph must have one node per point"
    );

    let mut out = Vec::new();
    for i in 0..points.len() {
        let reach = graph.reachable_within_steps(i, Some(steps));
        let higher: Vec<usize> = reach.into_iter().filter(|&j| j > i).collect();
        for (a, &j) in higher.iter().enumerate() {
            for &k in &higher[a + 1..] {
                let triangle = Triangle::new(points[i], points[j], points[k]);
                if let Some(invariant) = triangle.invariant() {
                    out.push(CandidateTriangle {
                        ids: [i, j, k],
                        triangle,
                        invariant,
                    });
                }
            }
        }
    }
    out
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ShapeIndexError {
    #[error("unit ratio must be greater than 1.0, got {0}")]
    UnitRatio(f64),
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Shape-coordinate index over one list's candidate triangles.
///
/// Coordinates are binned at `log(value) / log(unit_ratio)`: ratios crowd
/// near 1.0 for near-equilateral triangles and grow multiplicatively for
/// thin ones, and the log spreads both ends evenly over the cells.
/// Extreme shapes clamp into edge cells.
#[derive(Debug)]
pub struct ShapeIndex {
    grid: SpatialGrid<CandidateTriangle>,
}

impl ShapeIndex {
    pub fn build(
        triangles: Vec<CandidateTriangle>,
        division_count: usize,
        unit_ratio: f64,
    ) -> Result<Self, ShapeIndexError> {
        if !(unit_ratio > 1.0) {
            return Err(ShapeIndexError::UnitRatio(unit_ratio));
        }
        let mut grid =
            SpatialGrid::from_items_remapped(triangles, BoundsPolicy::Clamp, log_remap(unit_ratio));
        grid.divide(division_count, division_count)?;
        Ok(Self { grid })
    }

    pub fn len(&self) -> usize {
        self.grid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateTriangle> {
        self.grid.iter()
    }

    /// Triangles whose shape cell is within one cell of `invariant`'s.
    pub fn candidates(&self, invariant: &Point) -> Vec<&CandidateTriangle> {
        // Clamp mode never reports a bounds failure.
        self.grid.window(invariant, 1, 1).unwrap_or_default()
    }
}

fn log_remap(unit_ratio: f64) -> Remap {
    let log_unit = unit_ratio.ln();
    Box::new(move |p: Point| Point::new(p.x.ln() / log_unit, p.y.ln() / log_unit))
}
