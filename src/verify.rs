//! Voting score of a candidate transform.
//!
//! Every checklist-1 point is pushed through the transform and counts as a
//! hit when some checklist-2 point lies within `check_accuracy` of where it
//! lands. The score is the fraction of hits.

use crate::geom::point::{IndexedPoint, Point};
use crate::geom::similarity::SimilarityTransform;
use crate::grid::{BoundsPolicy, GridError, SpatialGrid};

/// Checklist-2 points indexed for radius lookups.
#[derive(Debug)]
pub struct CheckIndex {
    grid: SpatialGrid<IndexedPoint>,
}

impl CheckIndex {
    /// Index `points` in a `divisions x divisions` grid over their bounding
    /// box. Lookups outside the box clamp to the edge cells, so points landing
    /// just past the extreme stars are still tested against them.
    pub fn build(points: &[Point], divisions: usize) -> Result<Self, GridError> {
        let items = points
            .iter()
            .enumerate()
            .map(|(index, &point)| IndexedPoint { index, point });
        let mut grid = SpatialGrid::from_items(items, BoundsPolicy::Clamp);
        grid.divide(divisions, divisions)?;
        Ok(Self { grid })
    }

    pub fn len(&self) -> usize {
        self.grid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    /// Closest indexed point within `radius` of `p`.
    pub fn nearest(&self, p: &Point, radius: f64) -> Option<IndexedPoint> {
        if !p.is_finite() {
            return None;
        }
        self.grid.nearest(p, radius).ok().flatten().copied()
    }
}

/// Outcome of scoring one transform.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyResult {
    /// `n_matched / n_checked`, or 0.0 for an empty checklist.
    pub score: f64,
    pub n_matched: usize,
    pub n_checked: usize,
    /// `(checklist-1 index, checklist-2 index)` of every hit, pairing each
    /// mapped point with its nearest checklist-2 point.
    pub matched_pairs: Vec<(usize, usize)>,
}

impl VerifyResult {
    pub fn empty() -> Self {
        Self {
            score: 0.0,
            n_matched: 0,
            n_checked: 0,
            matched_pairs: Vec::new(),
        }
    }
}

pub fn score_transform(
    transform: &SimilarityTransform,
    checklist1: &[Point],
    checklist2: &CheckIndex,
    check_accuracy: f64,
) -> VerifyResult {
    if checklist1.is_empty() {
        return VerifyResult::empty();
    }

    let mut matched_pairs = Vec::new();
    for (i, p) in checklist1.iter().enumerate() {
        let mapped = transform.map(p);
        if let Some(hit) = checklist2.nearest(&mapped, check_accuracy) {
            matched_pairs.push((i, hit.index));
        }
    }

    let n_matched = matched_pairs.len();
    VerifyResult {
        score: n_matched as f64 / checklist1.len() as f64,
        n_matched,
        n_checked: checklist1.len(),
        matched_pairs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_points() -> Vec<Point> {
        (0..25)
            .map(|i| Point::new((i % 5) as f64 * 10.0, (i / 5) as f64 * 10.0))
            .collect()
    }

    #[test]
    fn perfect_transform_scores_one() {
        let src = grid_points();
        let t = SimilarityTransform::new(Point::new(40.0, -3.0), 1.5, 30.0);
        let dst = t.map_all(&src);
        let index = CheckIndex::build(&dst, 100).unwrap();

        let result = score_transform(&t, &src, &index, 1.0);
        assert_eq!(result.n_matched, 25);
        assert_eq!(result.score, 1.0);
        for (i, j) in &result.matched_pairs {
            assert_eq!(i, j);
        }
    }

    #[test]
    fn wrong_transform_scores_low() {
        let src = grid_points();
        let index = CheckIndex::build(&src, 10).unwrap();
        let t = SimilarityTransform::translation(Point::new(5.0, 5.0));
        let result = score_transform(&t, &src, &index, 1.0);
        assert_eq!(result.n_matched, 0);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn partial_overlap() {
        let src = grid_points();
        let index = CheckIndex::build(&src, 10).unwrap();
        // Shift one column to the right: four of five columns still land on points.
        let t = SimilarityTransform::translation(Point::new(10.0, 0.0));
        let result = score_transform(&t, &src, &index, 1.0);
        assert_eq!(result.n_matched, 20);
        assert_eq!(result.score, 0.8);
    }

    #[test]
    fn accuracy_radius_is_inclusive_of_near_misses() {
        let index =
            CheckIndex::build(&[Point::new(0.0, 0.0), Point::new(100.0, 100.0)], 50).unwrap();
        let t = SimilarityTransform::translation(Point::new(0.6, 0.0));
        let hit = score_transform(&t, &[Point::ORIGIN], &index, 1.0);
        assert_eq!(hit.n_matched, 1);
        let miss = score_transform(&t, &[Point::ORIGIN], &index, 0.5);
        assert_eq!(miss.n_matched, 0);
    }

    #[test]
    fn empty_checklists() {
        let index = CheckIndex::build(&[], 100).unwrap();
        assert!(index.is_empty());
        let t = SimilarityTransform::identity();
        assert_eq!(score_transform(&t, &[], &index, 1.0), VerifyResult::empty());
        assert_eq!(score_transform(&t, &[Point::ORIGIN], &index, 1.0).score, 0.0);
    }

    #[test]
    fn non_finite_mapping_is_a_miss() {
        let index = CheckIndex::build(&grid_points(), 10).unwrap();
        let t = SimilarityTransform::new(Point::ORIGIN, f64::NAN, 0.0);
        assert_eq!(score_transform(&t, &grid_points(), &index, 1.0).n_matched, 0);
    }
}
