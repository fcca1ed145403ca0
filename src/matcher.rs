//! End-to-end point-set matcher.
//!
//! Ties together triangle generation, shape hashing, transform fitting and
//! voting:
//! 1. Build the minimum spanning tree of each list
//! 2. Enumerate locally anchored triangles along each tree
//! 3. Index list 2's triangles by shape, and checklist 2's points by position
//! 4. For each list-1 triangle, fit a transform against every shape-similar
//!    list-2 triangle
//! 5. Score each fitted transform by how many checklist-1 points it lands
//!    on checklist-2 points
//! 6. Return the first transform scoring at least `score_to_pass`, or the
//!    best one seen once the candidates run out

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Level, debug, enabled, info, trace, warn};

use crate::geom::point::Point;
use crate::geom::similarity::{FitError, SimilarityTransform};
use crate::graph::Graph;
use crate::triangles::{ShapeIndex, candidate_triangles};
use crate::verify::{CheckIndex, VerifyResult, score_transform};

/// Receives human-readable progress lines. Sinks are called synchronously
/// on the solving thread and must not block.
pub trait MessageSink: Send {
    fn message(&self, text: &str);
}

impl<F: Fn(&str) + Send> MessageSink for F {
    fn message(&self, text: &str) {
        self(text)
    }
}

/// Parameters of a match. Every field has a default; a TOML file naming a
/// subset of the keys overrides just those.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Tree hops around each list-1 node searched for triangle vertices.
    pub trigraph_search_step1: usize,
    /// Tree hops around each list-2 node searched for triangle vertices.
    pub trigraph_search_step2: usize,
    /// Shape-index cells per axis.
    pub triangle_map_division_count: usize,
    /// Shape-coordinate ratio spanned by one log-space unit. Must exceed 1.0.
    pub triangle_map_unit_ratio: f64,
    /// Score at which a transform is returned immediately.
    pub score_to_pass: f64,
    /// Best score below which the search is reported as failed.
    pub score_to_fail: f64,
    /// Tolerance for scale (as a ratio) and rotation (in degrees) when
    /// fitting, and the allowed transform scale range `[1/x, x]`.
    pub acceptable_ratio: f64,
    /// Match radius used when scoring, in point-coordinate units.
    pub check_accuracy: f64,
    /// Cells per axis of the checklist-2 position index.
    pub check_map_division: usize,
    /// Wall-clock budget in seconds. `None` searches until exhausted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    /// Re-fit the accepted transform over all matched pairs.
    pub refine: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            trigraph_search_step1: 1,
            trigraph_search_step2: 1,
            triangle_map_division_count: 10,
            triangle_map_unit_ratio: 1.1,
            score_to_pass: 0.5,
            score_to_fail: 0.1,
            acceptable_ratio: 2.0,
            check_accuracy: 1.0,
            check_map_division: 100,
            timeout_secs: None,
            refine: false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("triangle_map_unit_ratio must be greater than 1.0, got {0}")]
    UnitRatio(f64),
    #[error("triangle_map_division_count must be at least 1")]
    DivisionCount,
    #[error("check_map_division must be at least 1")]
    CheckMapDivision,
    #[error("acceptable_ratio must be at least 1.0, got {0}")]
    AcceptableRatio(f64),
    #[error("check_accuracy must be positive, got {0}")]
    CheckAccuracy(f64),
    #[error("{name} must lie in [0, 1], got {value}")]
    Score { name: &'static str, value: f64 },
    #[error("score_to_fail ({fail}) exceeds score_to_pass ({pass})")]
    ScoreOrder { pass: f64, fail: f64 },
    #[error("timeout must be a positive, representable number of seconds, got {0}")]
    Timeout(f64),
}

impl MatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.triangle_map_unit_ratio > 1.0 && self.triangle_map_unit_ratio.is_finite()) {
            return Err(ConfigError::UnitRatio(self.triangle_map_unit_ratio));
        }
        if self.triangle_map_division_count == 0 {
            return Err(ConfigError::DivisionCount);
        }
        if self.check_map_division == 0 {
            return Err(ConfigError::CheckMapDivision);
        }
        if !(self.acceptable_ratio >= 1.0 && self.acceptable_ratio.is_finite()) {
            return Err(ConfigError::AcceptableRatio(self.acceptable_ratio));
        }
        if !(self.check_accuracy > 0.0 && self.check_accuracy.is_finite()) {
            return Err(ConfigError::CheckAccuracy(self.check_accuracy));
        }
        for (name, value) in [
            ("score_to_pass", self.score_to_pass),
            ("score_to_fail", self.score_to_fail),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Score { name, value });
            }
        }
        if self.score_to_fail > self.score_to_pass {
            return Err(ConfigError::ScoreOrder {
                pass: self.score_to_pass,
                fail: self.score_to_fail,
            });
        }
        if let Some(t) = self.timeout_secs
            && !(t > 0.0 && Duration::try_from_secs_f64(t).is_ok())
        {
            return Err(ConfigError::Timeout(t));
        }
        Ok(())
    }

    /// `None` when unset or not representable as a `Duration`.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .and_then(|t| Duration::try_from_secs_f64(t).ok())
    }
}

/// Final answer of a match.
///
/// `Matched` covers both a confident pass (`score >= score_to_pass`) and a
/// weak accept (`score_to_fail <= score < score_to_pass`); inspect the score
/// to tell them apart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchResult {
    Matched {
        transform: SimilarityTransform,
        score: f64,
    },
    Failed {
        best_transform: SimilarityTransform,
        best_score: f64,
    },
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }

    pub fn score(&self) -> f64 {
        match self {
            MatchResult::Matched { score, .. } => *score,
            MatchResult::Failed { best_score, .. } => *best_score,
        }
    }

    /// The accepted transform, or the best attempt of a failed search.
    pub fn transform(&self) -> &SimilarityTransform {
        match self {
            MatchResult::Matched { transform, .. } => transform,
            MatchResult::Failed { best_transform, .. } => best_transform,
        }
    }
}

/// Counters collected during one search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveStats {
    pub triangles1: usize,
    pub triangles2: usize,
    /// Shape-similar triangle pairs examined.
    pub candidate_pairs: usize,
    /// Pairs whose per-axis fits disagreed.
    pub not_similar: usize,
    /// Pairs whose fit was singular (collinear vertices).
    pub degenerate: usize,
    /// Fitted transforms discarded for scale outside `[1/r, r]`.
    pub ratio_rejected: usize,
    /// Transforms that reached scoring.
    pub scored: usize,
    pub best_score: f64,
    /// Checklist index pairs matched by the returned transform.
    pub matched_pairs: Vec<(usize, usize)>,
    /// Whether the returned transform came from the refinement fit.
    pub refined: bool,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Finds the similarity transform relating two unordered point lists.
///
/// One matcher owns all state of its search; independent matchers may run
/// on separate threads without coordination.
pub struct PointSetMatcher {
    list1: Vec<Point>,
    list2: Vec<Point>,
    checklist1: Option<Vec<Point>>,
    checklist2: Option<Vec<Point>>,
    config: MatchConfig,
    sinks: Vec<Box<dyn MessageSink>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl PointSetMatcher {
    /// Fails fast on an invalid configuration.
    pub fn new(
        list1: Vec<Point>,
        list2: Vec<Point>,
        config: MatchConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            list1,
            list2,
            checklist1: None,
            checklist2: None,
            config,
            sinks: Vec::new(),
            cancel: None,
        })
    }

    /// Score against these lists instead of the triangle-generating ones.
    pub fn with_checklists(mut self, checklist1: Vec<Point>, checklist2: Vec<Point>) -> Self {
        self.checklist1 = Some(checklist1);
        self.checklist2 = Some(checklist2);
        self
    }

    pub fn set_checklist1(&mut self, points: Vec<Point>) {
        self.checklist1 = Some(points);
    }

    pub fn set_checklist2(&mut self, points: Vec<Point>) {
        self.checklist2 = Some(points);
    }

    /// Stop the search early once `flag` is set. The search then ends as if
    /// its candidates were exhausted.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn add_sink<S: MessageSink + 'static>(&mut self, sink: S) {
        self.sinks.push(Box::new(sink));
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn list1(&self) -> &[Point] {
        &self.list1
    }

    pub fn list2(&self) -> &[Point] {
        &self.list2
    }

    pub fn checklist1(&self) -> &[Point] {
        self.checklist1.as_deref().unwrap_or(&self.list1)
    }

    pub fn checklist2(&self) -> &[Point] {
        self.checklist2.as_deref().unwrap_or(&self.list2)
    }

    /// Run the search once.
    ///
    /// The result depends on list order: the first transform reaching
    /// `score_to_pass` wins, not the global best.
    pub fn solve(&self) -> (MatchResult, SolveStats) {
        let config = &self.config;
        let mut stats = SolveStats::default();
        // A budget too large to add to the clock is no budget at all.
        let deadline = config.timeout().and_then(|d| Instant::now().checked_add(d));
        let check1 = self.checklist1();
        let check2 = self.checklist2();

        let tree1 = Graph::minimum_spanning_tree(&self.list1);
        let tree2 = Graph::minimum_spanning_tree(&self.list2);
        let triangles1 = candidate_triangles(&self.list1, &tree1, config.trigraph_search_step1);
        let triangles2 = candidate_triangles(&self.list2, &tree2, config.trigraph_search_step2);
        stats.triangles1 = triangles1.len();
        stats.triangles2 = triangles2.len();
        self.notify(|| {
            format!(
                "list 1: {} points, {} triangles; list 2: {} points, {} triangles",
                self.list1.len(),
                triangles1.len(),
                self.list2.len(),
                triangles2.len()
            )
        });

        let shape_index = match ShapeIndex::build(
            triangles2,
            config.triangle_map_division_count,
            config.triangle_map_unit_ratio,
        ) {
            Ok(index) => index,
            Err(e) => {
                warn!("cannot build shape index: {e}");
                return (failed(), stats);
            }
        };
        let check_index = match CheckIndex::build(check2, config.check_map_division) {
            Ok(index) => index,
            Err(e) => {
                warn!("cannot build checklist index: {e}");
                return (failed(), stats);
            }
        };

        let mut best: Option<(SimilarityTransform, VerifyResult)> = None;
        let mut passed = false;

        'search: for t1 in &triangles1 {
            if self.interrupted(deadline, &mut stats) {
                break;
            }

            let candidates = shape_index.candidates(&t1.invariant);
            self.notify(|| format!("triangle {:?}: {} candidates", t1.ids, candidates.len()));

            for t2 in candidates {
                stats.candidate_pairs += 1;
                let transform = match SimilarityTransform::from_triangles(
                    &t1.triangle.vertices,
                    &t2.triangle.vertices,
                    config.acceptable_ratio,
                ) {
                    Ok(t) => t,
                    Err(FitError::NotSimilar { .. }) => {
                        stats.not_similar += 1;
                        continue;
                    }
                    Err(_) => {
                        stats.degenerate += 1;
                        continue;
                    }
                };
                if !ratio_in_range(transform.ratio, config.acceptable_ratio) {
                    stats.ratio_rejected += 1;
                    continue;
                }

                let result =
                    score_transform(&transform, check1, &check_index, config.check_accuracy);
                stats.scored += 1;
                trace!(ids1 = ?t1.ids, ids2 = ?t2.ids, score = result.score, "scored candidate");

                let improved = best.as_ref().is_none_or(|(_, b)| result.score > b.score);
                if improved {
                    self.notify(|| {
                        format!(
                            "triangle {:?} -> {:?}: {transform}; best score {:.4}",
                            t1.ids, t2.ids, result.score
                        )
                    });
                    best = Some((transform, result));
                }

                if best.as_ref().is_some_and(|(_, b)| b.score >= config.score_to_pass) {
                    passed = true;
                    break 'search;
                }
                if self.interrupted(deadline, &mut stats) {
                    break 'search;
                }
            }
        }

        let Some((mut transform, mut verify)) = best else {
            debug!(?stats, "no candidate transform reached scoring");
            return (failed(), stats);
        };

        if config.refine && verify.score >= config.score_to_fail {
            if let Some((t, v)) = self.refine(&transform, &verify, check1, &check_index) {
                stats.refined = true;
                transform = t;
                verify = v;
            }
        }

        let score = verify.score;
        stats.best_score = score;
        stats.matched_pairs = verify.matched_pairs;

        let result = if passed || score >= config.score_to_fail {
            info!(%transform, score, passed, "point sets matched");
            MatchResult::Matched { transform, score }
        } else {
            debug!(%transform, score, "no transform reached score_to_fail");
            MatchResult::Failed {
                best_transform: transform,
                best_score: score,
            }
        };
        self.notify(|| format!("finished: best score {score:.4}"));
        (result, stats)
    }

    /// Least-squares re-fit over the matched pairs, kept only if it scores
    /// at least as well.
    fn refine(
        &self,
        transform: &SimilarityTransform,
        verify: &VerifyResult,
        check1: &[Point],
        check_index: &CheckIndex,
    ) -> Option<(SimilarityTransform, VerifyResult)> {
        if verify.matched_pairs.len() < 3 {
            return None;
        }
        let check2 = self.checklist2();
        let (src, dst): (Vec<Point>, Vec<Point>) = verify
            .matched_pairs
            .iter()
            .map(|&(i, j)| (check1[i], check2[j]))
            .unzip();

        let refit = match SimilarityTransform::fit(&src, &dst) {
            Ok(t) => t,
            Err(e) => {
                debug!("refinement fit failed: {e}");
                return None;
            }
        };
        if !ratio_in_range(refit.ratio, self.config.acceptable_ratio) {
            return None;
        }
        let rescored = score_transform(&refit, check1, check_index, self.config.check_accuracy);
        self.notify(|| {
            format!(
                "refined {transform} -> {refit}; score {:.4} -> {:.4}",
                verify.score, rescored.score
            )
        });
        (rescored.score >= verify.score).then_some((refit, rescored))
    }

    fn interrupted(&self, deadline: Option<Instant>, stats: &mut SolveStats) -> bool {
        if let Some(flag) = &self.cancel
            && flag.load(Ordering::Relaxed)
        {
            stats.cancelled = true;
            return true;
        }
        if let Some(dl) = deadline
            && Instant::now() > dl
        {
            stats.timed_out = true;
            return true;
        }
        false
    }

    fn notify<F: FnOnce() -> String>(&self, message: F) {
        if self.sinks.is_empty() && !enabled!(Level::DEBUG) {
            return;
        }
        let text = message();
        debug!(target: "trimatch::progress", "{text}");
        for sink in &self.sinks {
            sink.message(&text);
        }
    }
}

fn ratio_in_range(ratio: f64, acceptable_ratio: f64) -> bool {
    ratio >= 1.0 / acceptable_ratio && ratio <= acceptable_ratio
}

fn failed() -> MatchResult {
    MatchResult::Failed {
        best_transform: SimilarityTransform::identity(),
        best_score: 0.0,
    }
}
