//! Rotation + uniform scale + translation between two point sets.
//!
//! A transform maps `p` to `ratio * R(angle) * p + base_position`, where
//! `R(angle)` rotates counter-clockwise by `angle` degrees. Fits exist for
//! one, two, three (triangle) and N correspondences.

use std::fmt;

use ndarray::Array2;
use thiserror::Error;

use super::point::{Point, circular_distance, circular_mean, normalize_degrees};
use crate::linsolve::{self, LinSolveError, NormalEquations};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FitError {
    #[error("need at least {needed} correspondences, got {got}")]
    TooFewCorrespondences { needed: usize, got: usize },
    #[error("source and target lists differ in length ({src} vs {dst})")]
    LengthMismatch { src: usize, dst: usize },
    #[error("degenerate correspondences cannot fix scale and rotation")]
    Degenerate,
    #[error(
        "triangles are not similar (x axis: ratio {ratio1:.4} angle {angle1:.2}, \
         y axis: ratio {ratio2:.4} angle {angle2:.2})"
    )]
    NotSimilar {
        ratio1: f64,
        angle1: f64,
        ratio2: f64,
        angle2: f64,
    },
    #[error(transparent)]
    Solve(#[from] LinSolveError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub base_position: Point,
    /// Uniform scale factor, always positive.
    pub ratio: f64,
    /// Counter-clockwise rotation in degrees, in `[0, 360)`.
    pub angle: f64,
}

impl Default for SimilarityTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl SimilarityTransform {
    pub fn new(base_position: Point, ratio: f64, angle: f64) -> Self {
        Self {
            base_position,
            ratio,
            angle: normalize_degrees(angle),
        }
    }

    pub fn identity() -> Self {
        Self::translation(Point::ORIGIN)
    }

    pub fn translation(offset: Point) -> Self {
        Self::new(offset, 1.0, 0.0)
    }

    pub fn map(&self, p: &Point) -> Point {
        rotate_scale(p, self.ratio, self.angle) + self.base_position
    }

    pub fn map_all(&self, points: &[Point]) -> Vec<Point> {
        points.iter().map(|p| self.map(p)).collect()
    }

    /// The transform undoing this one. `ratio` must be positive.
    pub fn inverse(&self) -> Self {
        let ratio = 1.0 / self.ratio;
        let angle = normalize_degrees(360.0 - self.angle);
        let base = rotate_scale(&self.base_position, ratio, angle) * -1.0;
        Self::new(base, ratio, angle)
    }

    /// `self` followed by `next`.
    pub fn compose(&self, next: &SimilarityTransform) -> Self {
        Self::new(
            next.map(&self.base_position),
            self.ratio * next.ratio,
            self.angle + next.angle,
        )
    }

    /// Pure translation taking `src` onto `dst`.
    pub fn from_one(src: &Point, dst: &Point) -> Self {
        Self::translation(*dst - *src)
    }

    /// Exact transform taking `a` to `a2` and `b` to `b2`.
    pub fn from_two(a: &Point, b: &Point, a2: &Point, b2: &Point) -> Result<Self, FitError> {
        let d_src = a.distance(b);
        let d_dst = a2.distance(b2);
        if !(d_src > 0.0 && d_dst > 0.0) {
            return Err(FitError::Degenerate);
        }
        let ratio = d_dst / d_src;
        let angle = a2.bearing_to(b2) - a.bearing_to(b);
        let rs = rotate_scale(a, ratio, angle);
        Ok(Self::new(*a2 - rs, ratio, angle))
    }

    /// Transform taking triangle `src` onto `dst`, vertex `i` to vertex `i`.
    ///
    /// Each output axis is solved as an independent 3-unknown system
    /// (`x' = a*x + b*y + c`, `y' = d*x + e*y + f`). The scale and rotation
    /// implied by each axis must agree: their ratio must lie within
    /// `[1/acceptable_ratio, acceptable_ratio]` and their angles within
    /// `acceptable_ratio` degrees. The same tolerance value is used for both.
    /// Agreeing axes are merged by geometric-mean scale and circular-mean
    /// angle; disagreeing ones yield [`FitError::NotSimilar`].
    pub fn from_triangles(
        src: &[Point; 3],
        dst: &[Point; 3],
        acceptable_ratio: f64,
    ) -> Result<Self, FitError> {
        let mut ax = Array2::<f64>::zeros((3, 4));
        let mut ay = Array2::<f64>::zeros((3, 4));
        for i in 0..3 {
            for (m, target) in [(&mut ax, dst[i].x), (&mut ay, dst[i].y)] {
                m[[i, 0]] = src[i].x;
                m[[i, 1]] = src[i].y;
                m[[i, 2]] = 1.0;
                m[[i, 3]] = target;
            }
        }
        let sx = linsolve::solve(ax.view())?;
        let sy = linsolve::solve(ay.view())?;
        if !(sx.is_determined() && sy.is_determined()) {
            return Err(FitError::Degenerate);
        }

        let axes = AxisEstimate::from_coefficients(
            [sx.values[0], sx.values[1]],
            [sy.values[0], sy.values[1]],
        );
        if !axes.is_finite() || axes.ratio1 <= 0.0 || axes.ratio2 <= 0.0 {
            return Err(FitError::Degenerate);
        }

        let scale_agreement = axes.ratio1 / axes.ratio2;
        let scale_ok =
            scale_agreement >= 1.0 / acceptable_ratio && scale_agreement <= acceptable_ratio;
        let angle_ok = circular_distance(axes.angle1, axes.angle2) <= acceptable_ratio;
        if !(scale_ok && angle_ok) {
            return Err(FitError::NotSimilar {
                ratio1: axes.ratio1,
                angle1: axes.angle1,
                ratio2: axes.ratio2,
                angle2: axes.angle2,
            });
        }

        let ratio = (axes.ratio1 * axes.ratio2).sqrt();
        let angle = circular_mean(axes.angle1, axes.angle2);
        Ok(Self::anchored(src, dst, ratio, angle))
    }

    /// Fit from any number of correspondences.
    ///
    /// One pair gives a translation and two pairs are solved exactly. With
    /// three or more, each output axis is fitted by least squares and the
    /// axis estimates are merged by arithmetic-mean scale and circular-mean
    /// angle.
    pub fn fit(src: &[Point], dst: &[Point]) -> Result<Self, FitError> {
        if src.len() != dst.len() {
            return Err(FitError::LengthMismatch {
                src: src.len(),
                dst: dst.len(),
            });
        }
        match src.len() {
            0 => Err(FitError::TooFewCorrespondences { needed: 1, got: 0 }),
            1 => Ok(Self::from_one(&src[0], &dst[0])),
            2 => Self::from_two(&src[0], &src[1], &dst[0], &dst[1]),
            _ => Self::fit_least_squares(src, dst),
        }
    }

    fn fit_least_squares(src: &[Point], dst: &[Point]) -> Result<Self, FitError> {
        let mut nx = NormalEquations::new(3);
        let mut ny = NormalEquations::new(3);
        for (s, d) in src.iter().zip(dst) {
            let basis = [s.x, s.y, 1.0];
            nx.add(&basis, d.x);
            ny.add(&basis, d.y);
        }
        let sx = nx.solve()?;
        let sy = ny.solve()?;
        if !(sx.is_determined() && sy.is_determined()) {
            return Err(FitError::Degenerate);
        }

        let axes = AxisEstimate::from_coefficients(
            [sx.values[0], sx.values[1]],
            [sy.values[0], sy.values[1]],
        );
        let ratio = (axes.ratio1 + axes.ratio2) / 2.0;
        if !(axes.is_finite() && ratio > 0.0) {
            return Err(FitError::Degenerate);
        }
        let angle = circular_mean(axes.angle1, axes.angle2);
        Ok(Self::anchored(src, dst, ratio, angle))
    }

    /// Given scale and rotation, place the translation so the source
    /// centroid lands on the target centroid.
    fn anchored(src: &[Point], dst: &[Point], ratio: f64, angle: f64) -> Self {
        let n = src.len() as f64;
        let c_src = src.iter().fold(Point::ORIGIN, |acc, p| acc + *p) * (1.0 / n);
        let c_dst = dst.iter().fold(Point::ORIGIN, |acc, p| acc + *p) * (1.0 / n);
        let base = c_dst - rotate_scale(&c_src, ratio, angle);
        Self::new(base, ratio, angle)
    }
}

impl fmt::Display for SimilarityTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ratio {:.5}, angle {:.3} deg, base {}",
            self.ratio, self.angle, self.base_position
        )
    }
}

/// Scale and rotation read off each row of a fitted 2x2 linear part.
struct AxisEstimate {
    ratio1: f64,
    angle1: f64,
    ratio2: f64,
    angle2: f64,
}

impl AxisEstimate {
    /// `x_row = [a, b]` from `x' = a*x + b*y + c`, `y_row = [d, e]` from
    /// `y' = d*x + e*y + f`. For a pure similarity `a = e = r cos`,
    /// `d = -b = r sin`.
    fn from_coefficients(x_row: [f64; 2], y_row: [f64; 2]) -> Self {
        let [a, b] = x_row;
        let [d, e] = y_row;
        Self {
            ratio1: a.hypot(b),
            angle1: normalize_degrees((-b).atan2(a).to_degrees()),
            ratio2: d.hypot(e),
            angle2: normalize_degrees(d.atan2(e).to_degrees()),
        }
    }

    fn is_finite(&self) -> bool {
        self.ratio1.is_finite()
            && self.ratio2.is_finite()
            && self.angle1.is_finite()
            && self.angle2.is_finite()
    }
}

fn rotate_scale(p: &Point, ratio: f64, angle_deg: f64) -> Point {
    let (s, c) = angle_deg.to_radians().sin_cos();
    Point::new(ratio * (c * p.x - s * p.y), ratio * (s * p.x + c * p.y))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!(
            (a - b).abs() < tol,
            "expected {a} ~= {b} (diff = {})",
            (a - b).abs()
        );
    }

    fn assert_point_close(a: &Point, b: &Point, tol: f64) {
        assert!(a.distance(b) < tol, "expected {a} ~= {b}");
    }

    fn assert_angle_close(a: f64, b: f64, tol: f64) {
        assert!(
            circular_distance(a, b) < tol,
            "expected angle {a} ~= {b}"
        );
    }

    fn sample_points() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(13.0, 2.0),
            Point::new(-4.0, 9.5),
            Point::new(7.25, -3.0),
            Point::new(100.0, 40.0),
        ]
    }

    #[test]
    fn solver_errors_convert_and_clone() {
        let err: FitError = LinSolveError::DimensionMismatch { rows: 3, cols: 3 }.into();
        assert_eq!(err.clone(), err);
        assert!(err.to_string().contains("3 x 3"));
    }

    #[test]
    fn identity_maps_to_self() {
        let t = SimilarityTransform::identity();
        for p in sample_points() {
            assert_eq!(t.map(&p), p);
        }
    }

    #[test]
    fn quarter_turn_and_scale() {
        let t = SimilarityTransform::new(Point::new(100.0, 50.0), 2.0, 90.0);
        assert_point_close(&t.map(&Point::new(0.0, 0.0)), &Point::new(100.0, 50.0), 1e-9);
        assert_point_close(&t.map(&Point::new(10.0, 0.0)), &Point::new(100.0, 70.0), 1e-9);
        assert_point_close(&t.map(&Point::new(0.0, 10.0)), &Point::new(80.0, 50.0), 1e-9);
    }

    #[test]
    fn angle_is_normalized() {
        assert_close(SimilarityTransform::new(Point::ORIGIN, 1.0, -90.0).angle, 270.0, 1e-12);
        assert_close(SimilarityTransform::new(Point::ORIGIN, 1.0, 450.0).angle, 90.0, 1e-12);
    }

    #[test]
    fn inverse_round_trip() {
        let transforms = [
            SimilarityTransform::new(Point::new(3.0, -7.0), 0.37, 12.5),
            SimilarityTransform::new(Point::new(-250.0, 80.0), 4.2, 271.0),
            SimilarityTransform::new(Point::ORIGIN, 1.0, 0.0),
            SimilarityTransform::new(Point::new(1e3, 1e3), 1e-2, 359.9),
        ];
        for t in &transforms {
            let inv = t.inverse();
            for p in sample_points() {
                assert_point_close(&inv.map(&t.map(&p)), &p, 1e-7);
                assert_point_close(&t.map(&inv.map(&p)), &p, 1e-7);
            }
        }
    }

    #[test]
    fn compose_matches_sequential_map() {
        let a = SimilarityTransform::new(Point::new(5.0, 1.0), 1.5, 30.0);
        let b = SimilarityTransform::new(Point::new(-2.0, 8.0), 0.5, 300.0);
        let ab = a.compose(&b);
        for p in sample_points() {
            assert_point_close(&ab.map(&p), &b.map(&a.map(&p)), 1e-9);
        }
        let id = a.compose(&a.inverse());
        assert_close(id.ratio, 1.0, 1e-12);
        assert_angle_close(id.angle, 0.0, 1e-9);
        assert_point_close(&id.base_position, &Point::ORIGIN, 1e-9);
    }

    #[test]
    fn one_point_is_translation() {
        let t = SimilarityTransform::from_one(&Point::new(1.0, 2.0), &Point::new(4.0, -1.0));
        assert_eq!(t.ratio, 1.0);
        assert_eq!(t.angle, 0.0);
        assert_eq!(t.base_position, Point::new(3.0, -3.0));
    }

    #[test]
    fn two_point_fit_reproduces_both_pairs() {
        let pairs = [
            (
                Point::new(0.0, 0.0),
                Point::new(10.0, 0.0),
                Point::new(100.0, 50.0),
                Point::new(100.0, 70.0),
            ),
            (
                Point::new(3.0, 4.0),
                Point::new(-5.0, 2.0),
                Point::new(17.0, -1.0),
                Point::new(2.0, 9.0),
            ),
            (
                Point::new(1.0, 1.0),
                Point::new(1.0, 2.0),
                Point::new(0.0, 0.0),
                Point::new(-3.0, 0.0),
            ),
        ];
        for (a, b, a2, b2) in &pairs {
            let t = SimilarityTransform::from_two(a, b, a2, b2).unwrap();
            assert_point_close(&t.map(a), a2, 1e-9);
            assert_point_close(&t.map(b), b2, 1e-9);
        }
    }

    #[test]
    fn two_point_fit_known_parameters() {
        let t = SimilarityTransform::from_two(
            &Point::new(0.0, 0.0),
            &Point::new(10.0, 0.0),
            &Point::new(100.0, 50.0),
            &Point::new(100.0, 70.0),
        )
        .unwrap();
        assert_close(t.ratio, 2.0, 1e-12);
        assert_angle_close(t.angle, 90.0, 1e-9);
    }

    #[test]
    fn two_point_fit_rejects_coincident() {
        let p = Point::new(1.0, 1.0);
        assert_eq!(
            SimilarityTransform::from_two(&p, &p, &Point::ORIGIN, &Point::new(1.0, 0.0)),
            Err(FitError::Degenerate)
        );
    }

    #[test]
    fn triangle_fit_concrete_scenario() {
        let src = [Point::new(0.0, 0.0), Point::new(10.0, 0.0), Point::new(0.0, 10.0)];
        let dst = [Point::new(100.0, 50.0), Point::new(100.0, 70.0), Point::new(80.0, 50.0)];
        let t = SimilarityTransform::from_triangles(&src, &dst, 2.0).unwrap();
        assert_close(t.ratio, 2.0, 1e-9);
        assert_angle_close(t.angle, 90.0, 1e-6);
        assert_point_close(&t.map(&src[0]), &dst[0], 1e-9);
        for i in 0..3 {
            assert_point_close(&t.map(&src[i]), &dst[i], 1e-9);
        }
    }

    #[test]
    fn triangle_fit_rejects_reflection() {
        // Mirror image across the x axis: not reachable by any similarity.
        let src = [Point::new(0.0, 0.0), Point::new(10.0, 0.0), Point::new(3.0, 7.0)];
        let dst = [Point::new(0.0, 0.0), Point::new(10.0, 0.0), Point::new(3.0, -7.0)];
        assert!(matches!(
            SimilarityTransform::from_triangles(&src, &dst, 2.0),
            Err(FitError::NotSimilar { .. })
        ));
    }

    #[test]
    fn triangle_fit_rejects_misordered_vertices() {
        let src = [Point::new(0.0, 0.0), Point::new(10.0, 0.0), Point::new(2.0, 6.0)];
        let t = SimilarityTransform::new(Point::new(5.0, 5.0), 1.3, 40.0);
        let dst = [t.map(&src[1]), t.map(&src[0]), t.map(&src[2])];
        assert!(matches!(
            SimilarityTransform::from_triangles(&src, &dst, 2.0),
            Err(FitError::NotSimilar { .. })
        ));
    }

    #[test]
    fn triangle_fit_collinear_is_degenerate() {
        let src = [Point::new(0.0, 0.0), Point::new(1.0, 1.0), Point::new(2.0, 2.0)];
        let dst = [Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(2.0, 0.0)];
        assert_eq!(
            SimilarityTransform::from_triangles(&src, &dst, 2.0),
            Err(FitError::Degenerate)
        );
    }

    #[test]
    fn least_squares_recovers_exact_transform() {
        let truth = SimilarityTransform::new(Point::new(-12.0, 33.0), 0.8, 215.0);
        let src = sample_points();
        let dst = truth.map_all(&src);
        let t = SimilarityTransform::fit(&src, &dst).unwrap();
        assert_close(t.ratio, 0.8, 1e-9);
        assert_angle_close(t.angle, 215.0, 1e-7);
        assert_point_close(&t.base_position, &truth.base_position, 1e-7);
    }

    #[test]
    fn least_squares_tolerates_small_noise() {
        let truth = SimilarityTransform::new(Point::new(4.0, 4.0), 1.25, 10.0);
        let src: Vec<Point> = (0..20)
            .map(|i| Point::new((i % 5) as f64 * 20.0, (i / 5) as f64 * 20.0))
            .collect();
        let dst: Vec<Point> = src
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let jitter = if i % 2 == 0 { 0.05 } else { -0.05 };
                truth.map(p) + Point::new(jitter, -jitter)
            })
            .collect();
        let t = SimilarityTransform::fit(&src, &dst).unwrap();
        assert_close(t.ratio, 1.25, 1e-2);
        assert_angle_close(t.angle, 10.0, 0.5);
    }

    #[test]
    fn fit_dispatches_by_count() {
        assert_eq!(
            SimilarityTransform::fit(&[], &[]),
            Err(FitError::TooFewCorrespondences { needed: 1, got: 0 })
        );
        assert!(matches!(
            SimilarityTransform::fit(&[Point::ORIGIN], &[]),
            Err(FitError::LengthMismatch { src: 1, dst: 0 })
        ));
        let one =
            SimilarityTransform::fit(&[Point::new(1.0, 1.0)], &[Point::new(2.0, 3.0)]).unwrap();
        assert_eq!(one.base_position, Point::new(1.0, 2.0));

        let coincident = vec![Point::new(1.0, 1.0); 5];
        assert_eq!(
            SimilarityTransform::fit(&coincident, &coincident),
            Err(FitError::Degenerate)
        );
    }
}
