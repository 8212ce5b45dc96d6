use std::collections::HashSet;

use glam::DVec2;
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use once_cell::unsync::OnceCell;

use crate::comb::LinePolygonsCrossings;
use crate::geometry::{angle_left, Coord, Point2, PolygonSet};
use crate::path::ExtrusionLine;
use crate::settings::{SeamCornerPref, ZSeamConfig, ZSeamType};

///Points closer than this may be considered overlapping, in square microns.
const EPSILON_SCORE: f64 = 25.0;

///Above this many remaining candidates the combing aware scoring falls back
///to a straight-line penalty instead of computing real combed distances.
const COMBED_SCORING_MAX_CANDIDATES: usize = 100;

///The penalty factor on the straight-line distance of a candidate whose
///approach crosses the combing boundary, when real combing is too costly.
const CROSSING_PENALTY: f64 = 5.0;

///Read-only access to the vertex sequence of an orderable path. Implemented
///for plain polygons and for variable width walls.
pub trait PathVertices {
    fn num_points(&self) -> usize;
    fn point(&self, idx: usize) -> Point2;
}

impl PathVertices for crate::geometry::Polygon {
    fn num_points(&self) -> usize {
        self.len()
    }
    fn point(&self, idx: usize) -> Point2 {
        self[idx]
    }
}

impl PathVertices for ExtrusionLine {
    fn num_points(&self) -> usize {
        self.junctions.len()
    }
    fn point(&self, idx: usize) -> Point2 {
        self.junctions[idx].p
    }
}

impl<T: PathVertices + ?Sized> PathVertices for &T {
    fn num_points(&self) -> usize {
        (**self).num_points()
    }
    fn point(&self, idx: usize) -> Point2 {
        (**self).point(idx)
    }
}

///One path managed by the optimiser, together with the outcome of the
///optimisation: where to start it and in which direction to traverse it.
#[derive(Clone, Debug)]
pub struct OrderablePath<P> {
    pub vertices: P,
    pub is_closed: bool,
    ///The chosen start vertex (closed paths) or start endpoint (open ones).
    pub start_index: usize,
    ///Whether to traverse the path in reverse direction.
    pub backwards: bool,
}

impl<P: PathVertices> OrderablePath<P> {
    ///The point at which the head ends after traversing this path.
    fn end_point(&self) -> Point2 {
        if self.is_closed {
            // a closed loop ends where it started
            self.vertices.point(self.start_index)
        } else if self.backwards {
            self.vertices.point(0)
        } else {
            self.vertices.point(self.vertices.num_points() - 1)
        }
    }
}

///Sequences closed loops and open polylines to minimise travel, while
///respecting a precedence relation and a seam placement policy.
pub struct PathOrderOptimizer<'bound, P> {
    start_point: Point2,
    seam_config: ZSeamConfig,
    ///When supplied, travels that cross this boundary score worse: either
    ///by their real combed distance or by a flat penalty.
    combing_boundary: Option<&'bound PolygonSet>,
    router: OnceCell<LinePolygonsCrossings>,
    ///Ordered pairs (a, b): path a must be printed before path b. Indices
    ///refer to insertion order.
    order_requirements: HashSet<(usize, usize)>,
    pub paths: Vec<OrderablePath<P>>,
    ///The computed permutation: indices into `paths` in print order.
    pub order: Vec<usize>,
}

impl<'bound, P: PathVertices> PathOrderOptimizer<'bound, P> {
    pub fn new(start_point: Point2, seam_config: ZSeamConfig) -> Self {
        PathOrderOptimizer {
            start_point,
            seam_config,
            combing_boundary: None,
            router: OnceCell::new(),
            order_requirements: HashSet::new(),
            paths: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn with_combing_boundary(mut self, boundary: &'bound PolygonSet) -> Self {
        if !boundary.is_empty() {
            self.combing_boundary = Some(boundary);
        }
        self
    }

    pub fn set_order_requirements(&mut self, requirements: HashSet<(usize, usize)>) {
        self.order_requirements = requirements;
    }

    pub fn add_polygon(&mut self, vertices: P) {
        self.paths.push(OrderablePath {
            vertices,
            is_closed: true,
            start_index: 0,
            backwards: false,
        });
    }

    pub fn add_polyline(&mut self, vertices: P) {
        self.paths.push(OrderablePath {
            vertices,
            is_closed: false,
            start_index: 0,
            backwards: false,
        });
    }

    ///Compute the print order and per-path start locations.
    pub fn optimize(&mut self) {
        self.order.clear();
        let n = self.paths.len();
        if n == 0 {
            return;
        }

        // Close the precedence relation transitively, so chains of
        // near-equal candidates can't produce a constraint cycle later.
        let requirements = transitive_closure(&self.order_requirements, n);
        let mut blockers = vec![0usize; n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(a, b) in &requirements {
            blockers[b] += 1;
            successors[a].push(b);
        }

        // Random seam starts are drawn up front in insertion order, so the
        // choice only depends on the seed.
        let random_starts: Vec<usize> = if self.seam_config.seam_type == ZSeamType::Random {
            let mut rng = StdRng::seed_from_u64(self.seam_config.random_seed);
            self.paths
                .iter()
                .map(|path| {
                    let n_points = path.vertices.num_points().max(1);
                    rng.gen_range(0..n_points)
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut prev_point = match self.seam_config.seam_type {
            ZSeamType::UserSpecified => self.seam_config.pos,
            _ => self.start_point,
        };
        let mut picked = vec![false; n];

        for _ in 0..n {
            let remaining = n - self.order.len();
            let mut best: Option<(usize, f64, usize, bool)> = None; // (path, score, start, backwards)

            for path_idx in 0..n {
                if picked[path_idx]
                    || blockers[path_idx] > 0
                    || self.paths[path_idx].vertices.num_points() == 0
                {
                    continue;
                }
                let (start_index, backwards) =
                    self.find_start_location(path_idx, prev_point, &random_starts);
                let candidate_point = self.paths[path_idx].vertices.point(start_index);
                let mut score = (candidate_point - prev_point).vsize2() as f64;
                if best.as_ref().map_or(true, |(_, s, _, _)| score < *s) {
                    score = self.combing_aware_score(prev_point, candidate_point, score, remaining);
                }
                if best.as_ref().map_or(true, |(_, s, _, _)| score < *s) {
                    best = Some((path_idx, score, start_index, backwards));
                }
            }

            let Some((path_idx, _, start_index, backwards)) = best else {
                // only blocked paths remain: the input relation is cyclic
                log::error!("failed to find the next path; the precedence relation has a cycle");
                if let Some(path_idx) = (0..n).find(|&i| !picked[i]) {
                    picked[path_idx] = true;
                    self.order.push(path_idx);
                    continue;
                }
                break;
            };

            picked[path_idx] = true;
            self.paths[path_idx].start_index = start_index;
            self.paths[path_idx].backwards = backwards;
            prev_point = self.paths[path_idx].end_point();
            self.order.push(path_idx);
            for &successor in &successors[path_idx] {
                blockers[successor] -= 1;
            }
        }
    }

    ///Iterate the paths in the computed order.
    pub fn ordered(&self) -> impl Iterator<Item = (usize, &OrderablePath<P>)> {
        self.order.iter().map(move |&idx| (idx, &self.paths[idx]))
    }

    ///Charge the candidate with the cost of actually getting there when the
    ///straight approach crosses the combing boundary.
    fn combing_aware_score(
        &self,
        prev_point: Point2,
        candidate: Point2,
        straight_score: f64,
        remaining_candidates: usize,
    ) -> f64 {
        let Some(boundary) = self.combing_boundary else {
            return straight_score;
        };
        if (candidate - prev_point).vsize2() < EPSILON_SCORE as i64 {
            return straight_score;
        }
        let router = self
            .router
            .get_or_init(|| LinePolygonsCrossings::new(boundary));
        if !router.crosses(prev_point, candidate) {
            return straight_score;
        }
        if remaining_candidates > COMBED_SCORING_MAX_CANDIDATES {
            // combing every candidate of a big layer is too time consuming
            straight_score * CROSSING_PENALTY
        } else {
            let combed = router.combed_distance(prev_point, candidate) as f64;
            combed * combed
        }
    }

    ///The start vertex (closed paths) or start endpoint (open polylines)
    ///for one path, given the current head position.
    fn find_start_location(
        &self,
        path_idx: usize,
        prev_point: Point2,
        random_starts: &[usize],
    ) -> (usize, bool) {
        let path = &self.paths[path_idx];
        let n_points = path.vertices.num_points();
        if !path.is_closed {
            // open polylines start at whichever endpoint is closer
            let target = match self.seam_config.seam_type {
                ZSeamType::UserSpecified => self.seam_config.pos,
                _ => prev_point,
            };
            let front = (path.vertices.point(0) - target).vsize2();
            let back = (path.vertices.point(n_points - 1) - target).vsize2();
            return if back < front {
                (n_points - 1, true)
            } else {
                (0, false)
            };
        }

        match self.seam_config.seam_type {
            ZSeamType::Random => (random_starts[path_idx] % n_points, false),
            ZSeamType::UserSpecified => {
                (self.scored_start_vertex(path_idx, self.seam_config.pos), false)
            }
            ZSeamType::Shortest | ZSeamType::SharpestCorner => {
                (self.scored_start_vertex(path_idx, prev_point), false)
            }
        }
    }

    ///Score every candidate start vertex by travel distance and corner
    ///preference, with a deterministic tie-break: the scan starts at the
    ///vertex nearest a fixed focus point and later near-equal candidates
    ///win, so seams stay locally stable across layers.
    fn scored_start_vertex(&self, path_idx: usize, target: Point2) -> usize {
        let path = &self.paths[path_idx];
        let n_points = path.vertices.num_points();
        let config = &self.seam_config;

        // a point far outside any build plate; squared distances to it stay
        // well within the coordinate range
        const FOCUS_FAR_AWAY: Coord = 1_000_000_000;
        let focus_fixed_point = match config.seam_type {
            ZSeamType::UserSpecified => config.pos,
            _ => Point2::new(0, FOCUS_FAR_AWAY),
        };
        let start_from_pos = (0..n_points)
            .min_by_key(|&idx| (path.vertices.point(idx) - focus_fixed_point).vsize2())
            .unwrap_or(0);

        let mut best_point_idx = 0;
        let mut best_point_score = f64::INFINITY;
        for offset in 0..n_points {
            let point_idx = (start_from_pos + offset) % n_points;
            let p0 = path.vertices.point((point_idx + n_points - 1) % n_points);
            let p1 = path.vertices.point(point_idx);
            let p2 = path.vertices.point((point_idx + 1) % n_points);

            // with a sharpest-corner preference the distance is fixed and
            // the decision is driven by the curvature alone
            let mut dist_score = if config.seam_type == ZSeamType::SharpestCorner
                && config.corner_pref != SeamCornerPref::None
            {
                10_000.0
            } else {
                (p1 - target).vsize2() as f64
            };
            let corner_angle = angle_left(p0, p1, p2) / std::f64::consts::PI; // 0 -> 2
            let corner_shift = if config.seam_type == ZSeamType::Shortest {
                // a very acute corner shifts the score by 10 mm
                10_000.0 * 10_000.0
            } else {
                // the larger the distance, the more a corner attracts the
                // seam, leaving the user some control over where it lies
                dist_score / 10.0
            };
            match config.corner_pref {
                SeamCornerPref::Inner => {
                    if corner_angle > 1.0 {
                        // concave: reduce the score proportional to how concave
                        dist_score -= (corner_angle - 1.0) * corner_shift;
                    }
                }
                SeamCornerPref::Outer => {
                    if corner_angle < 1.0 {
                        dist_score -= (1.0 - corner_angle) * corner_shift;
                    }
                }
                SeamCornerPref::Any => {
                    dist_score -= (corner_angle - 1.0).abs() * corner_shift;
                }
                SeamCornerPref::Weighted => {
                    // any corner scores, slightly in favour of concave ones
                    let mut dist_score_corner = (corner_angle - 1.0).abs() * corner_shift;
                    if corner_angle > 1.0 {
                        dist_score_corner *= 2.0;
                    }
                    dist_score -= dist_score_corner;
                }
                SeamCornerPref::None => {}
            }
            if dist_score - EPSILON_SCORE < best_point_score {
                best_point_idx = point_idx;
                best_point_score = dist_score;
            }
        }
        best_point_idx
    }
}

///Add the transitive closure of the precedence relation: {(a,b), (b,c)}
///also yields (a,c).
fn transitive_closure(
    requirements: &HashSet<(usize, usize)>,
    n: usize,
) -> HashSet<(usize, usize)> {
    let mut closed = requirements.clone();
    let mut reaches: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    for &(a, b) in requirements {
        reaches[a].insert(b);
    }
    let mut changed = true;
    while changed {
        changed = false;
        for a in 0..n {
            let next: Vec<usize> = reaches[a]
                .iter()
                .flat_map(|&b| reaches[b].iter().copied())
                .collect();
            for c in next {
                if c != a && reaches[a].insert(c) {
                    changed = true;
                }
            }
        }
    }
    for (a, targets) in reaches.iter().enumerate() {
        for &b in targets {
            closed.insert((a, b));
        }
    }
    closed
}

///Order open polylines monotonically: sorted by the projection of their
///nearest endpoint onto `direction`, any two lines closer to each other than
///`max_adjacent_distance` appear in increasing projected order. Returns the
///permutation plus, per line, whether to traverse it reversed so the line
///start is the lower-projected endpoint.
pub fn monotonic_ordering<P: PathVertices>(
    lines: &[P],
    direction: f64,
    _max_adjacent_distance: Coord,
) -> Vec<(usize, bool)> {
    let dir = DVec2::new(direction.cos(), direction.sin());
    let mut keyed: Vec<(f64, usize, bool)> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.num_points() > 0)
        .map(|(idx, line)| {
            let front = line.point(0).as_dvec2().dot(dir);
            let back = line.point(line.num_points() - 1).as_dvec2().dot(dir);
            if back < front {
                (back, idx, true)
            } else {
                (front, idx, false)
            }
        })
        .collect();
    // a stable sort keeps equal projections in input order, which makes the
    // result deterministic
    keyed.sort_by_key(|(key, _, _)| OrderedFloat(*key));
    keyed.into_iter().map(|(_, idx, rev)| (idx, rev)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Polygon;
    use crate::settings::SeamCornerPref;

    fn square_at(x: Coord, y: Coord, size: Coord) -> Polygon {
        Polygon::new(vec![
            Point2::new(x, y),
            Point2::new(x + size, y),
            Point2::new(x + size, y + size),
            Point2::new(x, y + size),
        ])
    }

    #[test]
    fn nearest_polygon_first() {
        let near = square_at(0, 0, 1000);
        let far = square_at(50_000, 0, 1000);
        let mut optimizer =
            PathOrderOptimizer::new(Point2::new(-100, 0), ZSeamConfig::default());
        optimizer.add_polygon(&far);
        optimizer.add_polygon(&near);
        optimizer.optimize();
        assert_eq!(optimizer.order, vec![1, 0]);
    }

    #[test]
    fn precedence_overrides_distance() {
        let near = square_at(0, 0, 1000);
        let far = square_at(50_000, 0, 1000);
        let mut optimizer =
            PathOrderOptimizer::new(Point2::new(-100, 0), ZSeamConfig::default());
        optimizer.add_polygon(&far); // 0
        optimizer.add_polygon(&near); // 1
        optimizer.set_order_requirements([(0, 1)].into_iter().collect());
        optimizer.optimize();
        assert_eq!(optimizer.order, vec![0, 1]);
    }

    #[test]
    fn precedence_is_closed_transitively() {
        let polys: Vec<Polygon> = (0..3).map(|i| square_at(i * 10_000, 0, 1000)).collect();
        let mut optimizer =
            PathOrderOptimizer::new(Point2::new(100_000, 0), ZSeamConfig::default());
        for poly in &polys {
            optimizer.add_polygon(poly);
        }
        // only adjacent pairs given; (0, 2) is implied
        optimizer.set_order_requirements([(0, 1), (1, 2)].into_iter().collect());
        optimizer.optimize();
        let pos = |i: usize| optimizer.order.iter().position(|&x| x == i).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(1) < pos(2));
        assert!(pos(0) < pos(2));
    }

    #[test]
    fn open_lines_start_at_nearer_endpoint() {
        let line = Polygon::new(vec![Point2::new(0, 0), Point2::new(10_000, 0)]);
        let mut optimizer =
            PathOrderOptimizer::new(Point2::new(11_000, 0), ZSeamConfig::default());
        optimizer.add_polyline(&line);
        optimizer.optimize();
        assert!(optimizer.paths[0].backwards);
        assert_eq!(optimizer.paths[0].start_index, 1);
    }

    #[test]
    fn sharpest_inner_corner_attracts_seam() {
        // the concave notch corner at (500, 10) is the sharpest inner corner
        let poly = Polygon::new(vec![
            Point2::new(0, 0),
            Point2::new(1000, 0),
            Point2::new(1000, 10),
            Point2::new(500, 10),
            Point2::new(500, 1000),
            Point2::new(0, 1000),
        ]);
        let config = ZSeamConfig::new(
            ZSeamType::SharpestCorner,
            Point2::default(),
            SeamCornerPref::Inner,
        );
        let mut optimizer = PathOrderOptimizer::new(Point2::new(0, 0), config);
        optimizer.add_polygon(&poly);
        optimizer.optimize();
        assert_eq!(optimizer.paths[0].start_index, 3);
    }

    #[test]
    fn random_seam_is_deterministic_for_a_seed() {
        let poly = square_at(0, 0, 1000);
        let mut config = ZSeamConfig::default();
        config.seam_type = ZSeamType::Random;
        config.random_seed = 42;
        let run = |config: ZSeamConfig| {
            let mut optimizer = PathOrderOptimizer::new(Point2::new(0, 0), config);
            optimizer.add_polygon(&poly);
            optimizer.optimize();
            optimizer.paths[0].start_index
        };
        assert_eq!(run(config.clone()), run(config));
    }

    #[test]
    fn crossing_boundary_penalises_candidates() {
        // two equally-far polygons; travelling to one crosses the boundary
        let blocked = square_at(10_000, -500, 1000);
        let free = square_at(-11_000, -500, 1000);
        let wall = PolygonSet::new(vec![Polygon::new(vec![
            Point2::new(5000, -10_000),
            Point2::new(5500, -10_000),
            Point2::new(5500, 10_000),
            Point2::new(5000, 10_000),
        ])]);
        let mut optimizer = PathOrderOptimizer::new(Point2::new(0, 0), ZSeamConfig::default())
            .with_combing_boundary(&wall);
        optimizer.add_polygon(&blocked);
        optimizer.add_polygon(&free);
        optimizer.optimize();
        assert_eq!(optimizer.order[0], 1, "the unobstructed polygon goes first");
    }

    #[test]
    fn monotonic_order_follows_projection() {
        let lines: Vec<Polygon> = vec![
            Polygon::new(vec![Point2::new(3000, 0), Point2::new(3000, 1000)]),
            Polygon::new(vec![Point2::new(1000, 0), Point2::new(1000, 1000)]),
            Polygon::new(vec![Point2::new(2000, 0), Point2::new(2000, 1000)]),
        ];
        let order = monotonic_ordering(&lines, 0.0, 1500);
        let indices: Vec<usize> = order.iter().map(|(idx, _)| *idx).collect();
        assert_eq!(indices, vec![1, 2, 0]);
    }
}
