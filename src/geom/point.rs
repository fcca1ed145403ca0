//! 2D point value type shared by every stage of the matcher.

use std::fmt;
use std::ops::{Add, Mul, Sub};

/// A position on the detector plane (or in any 2D coordinate space).
///
/// Points carry no identity beyond their value; the index of a point
/// within its list is what the graph and the matcher refer to.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Point) -> f64 {
        self.distance_sq(other).sqrt()
    }

    pub fn distance_sq(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    /// Bearing of the vector from `self` to `other`, in degrees
    /// counter-clockwise from the +x axis, normalized to `[0, 360)`.
    pub fn bearing_to(&self, other: &Point) -> f64 {
        normalize_degrees((other.y - self.y).atan2(other.x - self.x).to_degrees())
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Point {
    type Output = Point;

    fn mul(self, rhs: f64) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Point::new(x, y)
    }
}

impl From<[f64; 2]> for Point {
    fn from([x, y]: [f64; 2]) -> Self {
        Point::new(x, y)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3})", self.x, self.y)
    }
}

/// Anything that occupies a position a [`SpatialGrid`](crate::grid::SpatialGrid)
/// can bin.
pub trait Locate {
    fn position(&self) -> Point;
}

impl Locate for Point {
    fn position(&self) -> Point {
        *self
    }
}

/// A point tagged with its index in the list it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedPoint {
    pub index: usize,
    pub point: Point,
}

impl Locate for IndexedPoint {
    fn position(&self) -> Point {
        self.point
    }
}

/// Wrap an angle in degrees into `[0, 360)`.
pub fn normalize_degrees(angle: f64) -> f64 {
    let a = angle.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs.
    if a >= 360.0 { 0.0 } else { a }
}

/// Shortest angular separation between two angles in degrees, in `[0, 180]`.
pub fn circular_distance(a: f64, b: f64) -> f64 {
    let d = normalize_degrees(a - b);
    d.min(360.0 - d)
}

/// Circular mean of two angles in degrees, normalized to `[0, 360)`.
pub fn circular_mean(a: f64, b: f64) -> f64 {
    let (sa, ca) = a.to_radians().sin_cos();
    let (sb, cb) = b.to_radians().sin_cos();
    normalize_degrees((sa + sb).atan2(ca + cb).to_degrees())
}
