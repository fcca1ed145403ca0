//! Bucketed 2D index for window and radius queries.
//!
//! A [`SpatialGrid`] covers a bounding rectangle divided into `rows x cols`
//! cells. Every stored item is binned by its [`Locate::position`], optionally
//! passed through a per-instance remap first, so the same structure indexes
//! detector positions directly and triangle shapes in log-ratio space.
//!
//! Rows run along y, columns along x. An undivided grid is a single cell.

use std::fmt;

use thiserror::Error;
use tracing::trace;

use crate::geom::point::{Locate, Point};

/// Relative padding added to the high corner of auto-computed bounds, so
/// points sitting exactly on the extreme edge stay inside.
pub const BOUNDS_EPSILON: f64 = 1e-5;

/// Upper limit on cells per axis chosen by the unit/coverage helpers.
pub const MAX_DIVISIONS: usize = 1000;

/// Coordinate remap applied before binning. Must be monotonic per axis.
pub type Remap = Box<dyn Fn(Point) -> Point + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GridError {
    #[error("position ({x}, {y}) is outside the grid bounds")]
    OutOfBounds { x: f64, y: f64 },
    #[error("cannot divide grid into {rows} x {cols} cells")]
    InvalidDivision { rows: usize, cols: usize },
    #[error("cell size must be positive, got {width} x {height}")]
    InvalidUnit { width: f64, height: f64 },
}

/// What happens when a position falls outside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundsPolicy {
    /// Inserts and lookups fail with [`GridError::OutOfBounds`].
    #[default]
    Strict,
    /// The position is accepted and binned into the nearest edge cell.
    Clamp,
}

/// Axis-aligned rectangle in binning space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub top_left: Point,
    pub bottom_right: Point,
}

impl Bounds {
    /// Rectangle spanned by two opposite corners, in any order.
    pub fn new(a: Point, b: Point) -> Self {
        Self {
            top_left: Point::new(a.x.min(b.x), a.y.min(b.y)),
            bottom_right: Point::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    /// Smallest rectangle holding every point, with the high corner pushed
    /// out by [`BOUNDS_EPSILON`]. Coincident or absent points still give a
    /// rectangle of non-zero area.
    pub fn enclosing<I: IntoIterator<Item = Point>>(points: I) -> Self {
        let mut lo = Point::new(f64::INFINITY, f64::INFINITY);
        let mut hi = Point::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        let mut any = false;
        for p in points {
            if !p.is_finite() {
                continue;
            }
            any = true;
            lo.x = lo.x.min(p.x);
            lo.y = lo.y.min(p.y);
            hi.x = hi.x.max(p.x);
            hi.y = hi.y.max(p.y);
        }
        if !any {
            lo = Point::ORIGIN;
            hi = Point::ORIGIN;
        }
        Self {
            top_left: lo,
            bottom_right: Point::new(hi.x + pad(lo.x, hi.x), hi.y + pad(lo.y, hi.y)),
        }
    }

    pub fn width(&self) -> f64 {
        self.bottom_right.x - self.top_left.x
    }

    pub fn height(&self) -> f64 {
        self.bottom_right.y - self.top_left.y
    }

    /// Inclusive containment test. NaN coordinates are never contained.
    pub fn contains(&self, p: &Point) -> bool {
        p.x >= self.top_left.x
            && p.x <= self.bottom_right.x
            && p.y >= self.top_left.y
            && p.y <= self.bottom_right.y
    }
}

fn pad(lo: f64, hi: f64) -> f64 {
    let base = (hi - lo).max(hi.abs());
    if base > 0.0 {
        base * BOUNDS_EPSILON
    } else {
        BOUNDS_EPSILON
    }
}

/// Handle returned by [`SpatialGrid::insert`]; identifies exactly one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridKey(usize);

/// A rectangular region divided into buckets of items.
pub struct SpatialGrid<T> {
    bounds: Bounds,
    policy: BoundsPolicy,
    remap: Option<Remap>,
    slots: Vec<Option<T>>,
    len: usize,
    rows: usize,
    cols: usize,
    cells: Vec<Vec<usize>>,
}

impl<T: Locate> SpatialGrid<T> {
    /// An empty, undivided grid over explicit bounds.
    pub fn new(bounds: Bounds, policy: BoundsPolicy) -> Self {
        Self {
            bounds,
            policy,
            remap: None,
            slots: Vec::new(),
            len: 0,
            rows: 1,
            cols: 1,
            cells: vec![Vec::new()],
        }
    }

    /// An empty grid whose `bounds` are expressed in remapped coordinates.
    pub fn with_remap(bounds: Bounds, policy: BoundsPolicy, remap: Remap) -> Self {
        let mut grid = Self::new(bounds, policy);
        grid.remap = Some(remap);
        grid
    }

    /// A grid sized to enclose `items`, all of which are inserted.
    pub fn from_items<I: IntoIterator<Item = T>>(items: I, policy: BoundsPolicy) -> Self {
        Self::build(items, policy, None)
    }

    /// Like [`from_items`](Self::from_items), with bounds computed over the
    /// remapped positions.
    pub fn from_items_remapped<I: IntoIterator<Item = T>>(
        items: I,
        policy: BoundsPolicy,
        remap: Remap,
    ) -> Self {
        Self::build(items, policy, Some(remap))
    }

    fn build<I: IntoIterator<Item = T>>(
        items: I,
        policy: BoundsPolicy,
        remap: Option<Remap>,
    ) -> Self {
        let items: Vec<T> = items.into_iter().collect();
        let mut grid = Self::new(Bounds::new(Point::ORIGIN, Point::ORIGIN), policy);
        grid.remap = remap;
        let bounds = Bounds::enclosing(items.iter().map(|it| grid.binning_position(it.position())));
        grid.bounds = bounds;
        for item in items {
            // Non-finite positions are the only way an item can miss the
            // enclosing box; those are dropped in strict mode.
            if let Err(e) = grid.insert(item) {
                trace!("dropping item while building grid: {e}");
            }
        }
        grid
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn policy(&self) -> BoundsPolicy {
        self.policy
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: GridKey) -> Option<&T> {
        self.slots.get(key.0).and_then(Option::as_ref)
    }

    /// Every stored item, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten()
    }

    /// The coordinates `p` is binned at.
    pub fn binning_position(&self, p: Point) -> Point {
        match &self.remap {
            Some(f) => f(p),
            None => p,
        }
    }

    pub fn is_out_of_bounds(&self, p: &Point) -> bool {
        !self.bounds.contains(&self.binning_position(*p))
    }

    pub fn insert(&mut self, item: T) -> Result<GridKey, GridError> {
        let cell = self.cell_index(&item.position())?;
        let id = self.slots.len();
        self.slots.push(Some(item));
        self.cells[cell].push(id);
        self.len += 1;
        Ok(GridKey(id))
    }

    /// Remove exactly the item `key` refers to.
    pub fn remove(&mut self, key: GridKey) -> Option<T> {
        let item = self.slots.get_mut(key.0)?.take()?;
        let cell = self.clamped_cell_index(&self.binning_position(item.position()));
        if let Some(pos) = self.cells[cell].iter().position(|&id| id == key.0) {
            self.cells[cell].swap_remove(pos);
        }
        self.len -= 1;
        Some(item)
    }

    /// Redistribute every held item into a fresh `rows x cols` table.
    pub fn divide(&mut self, rows: usize, cols: usize) -> Result<(), GridError> {
        if rows == 0 || cols == 0 {
            return Err(GridError::InvalidDivision { rows, cols });
        }
        self.rows = rows;
        self.cols = cols;
        self.cells = vec![Vec::new(); rows * cols];
        for id in 0..self.slots.len() {
            if let Some(item) = &self.slots[id] {
                let cell = self.clamped_cell_index(&self.binning_position(item.position()));
                self.cells[cell].push(id);
            }
        }
        Ok(())
    }

    /// Divide into cells of (at most) `unit_width x unit_height`, in binning
    /// coordinates.
    pub fn divide_by_unit(&mut self, unit_width: f64, unit_height: f64) -> Result<(), GridError> {
        if !(unit_width > 0.0 && unit_height > 0.0) {
            return Err(GridError::InvalidUnit {
                width: unit_width,
                height: unit_height,
            });
        }
        let cols = (self.bounds.width() / unit_width).ceil();
        let rows = (self.bounds.height() / unit_height).ceil();
        self.divide(clamp_divisions(rows), clamp_divisions(cols))
    }

    /// Pick a resolution where a circle of `radius` spans at most two cells
    /// along either axis, bounding the work of a radius query.
    pub fn divide_for_coverage(&mut self, radius: f64) -> Result<(), GridError> {
        self.divide_by_unit(2.0 * radius, 2.0 * radius)
    }

    /// `(row, col)` of the cell `p` falls in.
    pub fn cell_for(&self, p: &Point) -> Result<(usize, usize), GridError> {
        let idx = self.cell_index(p)?;
        Ok((idx / self.cols, idx % self.cols))
    }

    /// Items in every cell within `row_steps` rows and `col_steps` columns
    /// of the cell holding `p`.
    pub fn window(
        &self,
        p: &Point,
        row_steps: usize,
        col_steps: usize,
    ) -> Result<Vec<&T>, GridError> {
        let (row, col) = self.cell_for(p)?;
        let rows = row.saturating_sub(row_steps)..=(row + row_steps).min(self.rows - 1);
        let cols = col.saturating_sub(col_steps)..=(col + col_steps).min(self.cols - 1);
        Ok(self.collect_cells(rows, cols))
    }

    /// Items whose position lies within Euclidean distance `radius` of `p`.
    pub fn within_radius(&self, p: &Point, radius: f64) -> Result<Vec<&T>, GridError> {
        self.cell_for(p)?;
        let (rows, cols) = self.cell_span(p, radius);
        let radius_sq = radius * radius;
        let mut found = self.collect_cells(rows, cols);
        found.retain(|it| it.position().distance_sq(p) <= radius_sq);
        Ok(found)
    }

    /// The closest item within `radius` of `p`, if any.
    pub fn nearest(&self, p: &Point, radius: f64) -> Result<Option<&T>, GridError> {
        let found = self.within_radius(p, radius)?;
        Ok(found.into_iter().min_by(|a, b| {
            a.position()
                .distance_sq(p)
                .total_cmp(&b.position().distance_sq(p))
        }))
    }

    fn collect_cells(
        &self,
        rows: std::ops::RangeInclusive<usize>,
        cols: std::ops::RangeInclusive<usize>,
    ) -> Vec<&T> {
        let mut out = Vec::new();
        for r in rows {
            for c in cols.clone() {
                for &id in &self.cells[r * self.cols + c] {
                    if let Some(item) = &self.slots[id] {
                        out.push(item);
                    }
                }
            }
        }
        out
    }

    /// Row and column ranges covering the square of half-width `radius`
    /// around `p`, clamped to the table.
    fn cell_span(
        &self,
        p: &Point,
        radius: f64,
    ) -> (std::ops::RangeInclusive<usize>, std::ops::RangeInclusive<usize>) {
        let lo = self.binning_position(Point::new(p.x - radius, p.y - radius));
        let hi = self.binning_position(Point::new(p.x + radius, p.y + radius));
        let (r0, c0) = self.raw_cell(&lo);
        let (r1, c1) = self.raw_cell(&hi);
        (r0.min(r1)..=r0.max(r1), c0.min(c1)..=c0.max(c1))
    }

    fn cell_index(&self, p: &Point) -> Result<usize, GridError> {
        let b = self.binning_position(*p);
        if self.policy == BoundsPolicy::Strict && !self.bounds.contains(&b) {
            return Err(GridError::OutOfBounds { x: p.x, y: p.y });
        }
        Ok(self.clamped_cell_index(&b))
    }

    fn clamped_cell_index(&self, binned: &Point) -> usize {
        let (row, col) = self.raw_cell(binned);
        row * self.cols + col
    }

    fn raw_cell(&self, binned: &Point) -> (usize, usize) {
        let col = axis_cell(
            binned.x,
            self.bounds.top_left.x,
            self.bounds.width(),
            self.cols,
        );
        let row = axis_cell(
            binned.y,
            self.bounds.top_left.y,
            self.bounds.height(),
            self.rows,
        );
        (row, col)
    }
}

fn axis_cell(v: f64, origin: f64, extent: f64, count: usize) -> usize {
    if count <= 1 || !(extent > 0.0) {
        return 0;
    }
    let t = ((v - origin) / extent * count as f64).floor();
    // NaN casts to 0; infinities saturate.
    (t.max(0.0) as usize).min(count - 1)
}

fn clamp_divisions(n: f64) -> usize {
    if n.is_nan() || n < 1.0 {
        1
    } else {
        (n as usize).min(MAX_DIVISIONS)
    }
}

impl<T> fmt::Debug for SpatialGrid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpatialGrid")
            .field("bounds", &self.bounds)
            .field("policy", &self.policy)
            .field("remapped", &self.remap.is_some())
            .field("len", &self.len)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}
