use itertools::Itertools;
use once_cell::unsync::OnceCell;

use crate::geometry::{segment_parameter, shorter_than, Coord, PartsView, Point2, PolygonSet};
use crate::grid::{HasLine, SparseLineGrid};

///Distance to move the start and end point towards the inside, to avoid
///collisions with the boundary they sit on.
const OFFSET_EXTRA_START_END: Coord = 100;

///Cell size of the location-to-segment grids over the comb boundaries.
const LOC_TO_LINE_CELL_SIZE: Coord = 2000;

///A single travel path either inside or outside the parts.
#[derive(Clone, Debug, Default)]
pub struct CombPath {
    pub points: Vec<Point2>,
    ///Whether the path could not avoid moving through a boundary.
    pub cross_boundary: bool,
    ///Whether this is the segment that moves through air between parts; the
    ///retraction (and hop) of a multi-part travel belongs on this segment.
    pub through_air: bool,
}

///A sequence of paths alternating between inside a part and outside a part.
#[derive(Clone, Debug, Default)]
pub struct CombPaths {
    pub paths: Vec<CombPath>,
    ///Whether the route moves through air between parts.
    pub through_air: bool,
    ///Whether the requested destination was moved onto the boundary while
    ///resolving it. The unretract then belongs on the approach to the final
    ///point rather than at the point itself.
    pub end_point_moved: bool,
}

impl CombPaths {
    pub fn total_length(&self) -> Coord {
        self.paths
            .iter()
            .map(|path| {
                path.points
                    .iter()
                    .tuple_windows()
                    .map(|(a, b)| (*b - *a).vsize())
                    .sum::<Coord>()
            })
            .sum()
    }

    pub fn crosses_boundary(&self) -> bool {
        self.paths.iter().any(|path| path.cross_boundary)
    }
}

///One segment of a comb boundary, stored in the location-to-segment grid.
#[derive(Clone, Debug)]
struct BoundarySegment {
    p0: Point2,
    p1: Point2,
    poly_idx: usize,
    seg_idx: usize,
}

impl HasLine for BoundarySegment {
    fn line(&self) -> (Point2, Point2) {
        (self.p0, self.p1)
    }
}

///A comb boundary with its per-part view and segment grid.
#[derive(Clone, Debug)]
struct IndexedBoundary {
    polygons: PolygonSet,
    parts: PartsView,
    grid: SparseLineGrid<BoundarySegment>,
}

impl IndexedBoundary {
    fn build(polygons: PolygonSet) -> Self {
        let parts = PartsView::assemble(&polygons);
        let mut grid = SparseLineGrid::new(LOC_TO_LINE_CELL_SIZE);
        for (poly_idx, polygon) in polygons.iter().enumerate() {
            if polygon.len() < 2 {
                continue;
            }
            for (seg_idx, (p0, p1)) in polygon.edges().enumerate() {
                grid.insert(BoundarySegment {
                    p0,
                    p1,
                    poly_idx,
                    seg_idx,
                });
            }
        }
        IndexedBoundary {
            polygons,
            parts,
            grid,
        }
    }

    fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }
}

///A resolved travel endpoint: where the point ended up and, when it lies
///inside the boundary, which part contains it.
#[derive(Clone, Copy, Debug)]
struct ResolvedEndpoint {
    point: Point2,
    part: Option<usize>,
    moved: bool,
}

///A crossing from the inside boundary to the outside boundary for one end
///of a travel move.
#[derive(Clone, Copy, Debug)]
struct Crossing {
    ///The point on (just inside of) the inside part boundary.
    in_or_mid: Point2,
    ///The point on the outside boundary, from which the air move happens.
    out: Point2,
}

///Generates full combing actions for travel moves from a start point to an
///end point, one instance per layer.
///
///Typical output: a combing path to the boundary of the start part, a move
///through air avoiding the other parts in the layer, and a combing path from
///the boundary of the ending part to the end point.
pub struct Comb {
    ///The minimum boundary within which to comb; fallback when the
    ///preferred boundary isolates the endpoints.
    minimum: IndexedBoundary,
    ///The preferred boundary within which to comb.
    preferred: IndexedBoundary,
    ///The boundary outside of which to stay during moves through air, when
    ///known. Its part view and segment grid are built on first use.
    outside_source: Option<PolygonSet>,
    outside: OnceCell<IndexedBoundary>,
    ///When combing through the minimum boundary, path points are nudged
    ///towards the preferred boundary by this distance afterwards.
    move_inside_distance: Coord,
    ///Maximal squared distance a point may be from the inside boundary and
    ///still be moved inside it instead of being treated as outside.
    max_move_inside_distance2: i64,
}

impl Comb {
    ///`offset_from_outlines` is the offset used to construct the boundaries
    ///from the part outlines (about a nozzle radius); it bounds how far an
    ///endpoint may be moved inside. `outside` is the boundary to comb along
    ///for moves through air, when the caller was able to compute one.
    pub fn new(
        boundary_minimum: PolygonSet,
        boundary_preferred: PolygonSet,
        outside: Option<PolygonSet>,
        offset_from_outlines: Coord,
        move_inside_distance: Coord,
    ) -> Self {
        Comb {
            minimum: IndexedBoundary::build(boundary_minimum),
            preferred: IndexedBoundary::build(boundary_preferred),
            outside_source: outside,
            outside: OnceCell::new(),
            move_inside_distance,
            max_move_inside_distance2: offset_from_outlines * offset_from_outlines * 4,
        }
    }

    ///The outside boundary, assembled on first read.
    fn outside(&self) -> Option<&IndexedBoundary> {
        let source = self.outside_source.as_ref()?;
        Some(
            self.outside
                .get_or_init(|| IndexedBoundary::build(source.clone())),
        )
    }

    ///Calculate the comb paths (if any): one for each boundary combed,
    ///alternated with travel paths through air.
    ///
    ///Returns None when combing fails entirely; the caller then emits a
    ///straight travel with a forced retraction.
    pub fn calc(
        &self,
        start: Point2,
        end: Point2,
        start_inside: bool,
        end_inside: bool,
        max_comb_distance_ignored: Coord,
        via_outside_makes_combing_fail: bool,
        fail_on_unavoidable_obstacles: bool,
    ) -> Option<CombPaths> {
        if shorter_than(end - start, max_comb_distance_ignored) {
            return Some(CombPaths {
                paths: vec![CombPath {
                    points: vec![start, end],
                    cross_boundary: false,
                    through_air: false,
                }],
                through_air: false,
                end_point_moved: false,
            });
        }

        // Fast path: both endpoints resolve to the same part of the
        // preferred boundary.
        let start_preferred = self.resolve(&self.preferred, start, start_inside);
        let end_preferred = self.resolve(&self.preferred, end, end_inside);
        if let (Some(start_part), Some(end_part)) = (start_preferred.part, end_preferred.part) {
            if start_part == end_part {
                let route =
                    comb_route(&self.preferred, start_preferred.point, end_preferred.point);
                return Some(CombPaths {
                    paths: vec![route],
                    through_air: false,
                    end_point_moved: end_preferred.moved,
                });
            }
        }

        // The preferred boundary isolates the endpoints; retry with the
        // minimum boundary and move the resulting path towards the
        // preferred boundary afterwards.
        let start_minimum = self.resolve(&self.minimum, start, start_inside);
        let end_minimum = self.resolve(&self.minimum, end, end_inside);
        if let (Some(start_part), Some(end_part)) = (start_minimum.part, end_minimum.part) {
            if start_part == end_part {
                let mut route = comb_route(&self.minimum, start_minimum.point, end_minimum.point);
                self.move_comb_path_inside(&mut route);
                return Some(CombPaths {
                    paths: vec![route],
                    through_air: false,
                    end_point_moved: end_minimum.moved,
                });
            }
        }

        // Both boundaries isolate the endpoints (or an endpoint is outside
        // every part): the travel goes through air.
        if via_outside_makes_combing_fail {
            return None;
        }
        if self.minimum.is_empty() && self.preferred.is_empty() && self.outside().is_none() {
            // no boundary information at all: nothing to comb against
            return None;
        }

        let (resolved_start, start_boundary) = pick_resolved(start_preferred, start_minimum)
            .map(|(r, preferred)| {
                (
                    r,
                    if preferred {
                        &self.preferred
                    } else {
                        &self.minimum
                    },
                )
            })
            .unwrap_or((start_preferred, &self.preferred));
        let (resolved_end, end_boundary) = pick_resolved(end_preferred, end_minimum)
            .map(|(r, preferred)| {
                (
                    r,
                    if preferred {
                        &self.preferred
                    } else {
                        &self.minimum
                    },
                )
            })
            .unwrap_or((end_preferred, &self.preferred));

        let start_crossing =
            self.find_crossing(start_boundary, resolved_start, resolved_end.point);
        let end_crossing = self.find_crossing(end_boundary, resolved_end, resolved_start.point);

        let mut paths = Vec::new();
        if resolved_start.part.is_some() && start_crossing.in_or_mid != resolved_start.point {
            paths.push(comb_route(
                start_boundary,
                resolved_start.point,
                start_crossing.in_or_mid,
            ));
        }

        let mut middle = match self.outside() {
            Some(outside) if !outside.is_empty() => {
                let route = comb_route(outside, start_crossing.out, end_crossing.out);
                if route.cross_boundary && fail_on_unavoidable_obstacles {
                    return None;
                }
                route
            }
            _ => CombPath {
                // outside boundary unknown: move via air in a straight line
                points: vec![start_crossing.out, end_crossing.out],
                cross_boundary: false,
                through_air: false,
            },
        };
        middle.through_air = true;
        paths.push(middle);

        if resolved_end.part.is_some() && end_crossing.in_or_mid != resolved_end.point {
            paths.push(comb_route(
                end_boundary,
                end_crossing.in_or_mid,
                resolved_end.point,
            ));
        }

        Some(CombPaths {
            paths,
            through_air: true,
            end_point_moved: resolved_end.moved,
        })
    }

    ///Move an endpoint inside the boundary when it should be inside but is
    ///not quite, and find the part containing it.
    fn resolve(&self, boundary: &IndexedBoundary, p: Point2, want_inside: bool) -> ResolvedEndpoint {
        if !want_inside || boundary.is_empty() {
            return ResolvedEndpoint {
                point: p,
                part: None,
                moved: false,
            };
        }
        if let Some(part) = boundary.parts.part_containing(&boundary.polygons, p) {
            return ResolvedEndpoint {
                point: p,
                part: Some(part),
                moved: false,
            };
        }
        if let Some((_, moved)) = boundary.polygons.move_inside(
            p,
            OFFSET_EXTRA_START_END,
            self.max_move_inside_distance2,
        ) {
            if let Some(part) = boundary.parts.part_containing(&boundary.polygons, moved) {
                return ResolvedEndpoint {
                    point: moved,
                    part: Some(part),
                    moved: true,
                };
            }
        }
        ResolvedEndpoint {
            point: p,
            part: None,
            moved: false,
        }
    }

    ///The crossing that exits the part of `resolved` towards
    ///`estimated_other`, minimising the joint detour of leaving the part and
    ///getting onto the outside boundary.
    fn find_crossing(
        &self,
        boundary: &IndexedBoundary,
        resolved: ResolvedEndpoint,
        estimated_other: Point2,
    ) -> Crossing {
        let Some(part_idx) = resolved.part else {
            // already outside: cross at the point itself
            return Crossing {
                in_or_mid: resolved.point,
                out: resolved.point,
            };
        };
        let outer_poly_idx = boundary.parts.parts[part_idx][0];
        let outer = &boundary.polygons[outer_poly_idx];
        let outside = self.outside().filter(|outside| !outside.is_empty());

        let mut best: Option<(i64, Crossing)> = None;
        for &vertex in outer.iter() {
            let out_candidate = match outside {
                Some(outside) => outside
                    .polygons
                    .closest_point(vertex)
                    .map(|(_, closest)| closest.location)
                    .unwrap_or(vertex),
                None => vertex,
            };
            let detour = (vertex - resolved.point).vsize()
                + (out_candidate - vertex).vsize()
                + (estimated_other - out_candidate).vsize();
            if best.as_ref().map_or(true, |(score, _)| detour < *score) {
                best = Some((
                    detour,
                    Crossing {
                        in_or_mid: vertex,
                        out: out_candidate,
                    },
                ));
            }
        }
        best.map(|(_, crossing)| crossing).unwrap_or(Crossing {
            in_or_mid: resolved.point,
            out: resolved.point,
        })
    }

    ///Nudge every point of a comb path computed over the minimum boundary
    ///towards the preferred boundary, so the head keeps more distance from
    ///the walls where it can.
    fn move_comb_path_inside(&self, path: &mut CombPath) {
        if self.preferred.is_empty() || self.move_inside_distance == 0 {
            return;
        }
        let n = path.points.len();
        for (idx, point) in path.points.iter_mut().enumerate() {
            if idx == 0 || idx == n - 1 {
                continue; // endpoints stay where the caller put them
            }
            if self.preferred.polygons.inside(*point, true) {
                continue;
            }
            if let Some((_, moved)) = self.preferred.polygons.move_inside(
                *point,
                self.move_inside_distance,
                self.move_inside_distance * self.move_inside_distance * 4,
            ) {
                *point = moved;
            }
        }
    }
}

///Pick the resolved endpoint that landed inside a part, preferring the
///preferred-boundary resolution. The bool tells which boundary it came from.
fn pick_resolved(
    preferred: ResolvedEndpoint,
    minimum: ResolvedEndpoint,
) -> Option<(ResolvedEndpoint, bool)> {
    if preferred.part.is_some() {
        Some((preferred, true))
    } else if minimum.part.is_some() {
        Some((minimum, false))
    } else {
        None
    }
}

///The polygon crossing primitive as a standalone router, for callers that
///only need boundary respecting routes and crossing tests (the path order
///optimiser's combing aware scoring).
pub struct LinePolygonsCrossings {
    boundary: IndexedBoundary,
}

impl LinePolygonsCrossings {
    pub fn new(polygons: &PolygonSet) -> Self {
        LinePolygonsCrossings {
            boundary: IndexedBoundary::build(polygons.clone()),
        }
    }

    ///Whether the straight segment crosses any boundary edge. Only the
    ///edges stored in the grid cells along the segment are tested.
    pub fn crosses(&self, from: Point2, to: Point2) -> bool {
        let mut found = false;
        self.boundary.grid.process_line((from, to), |segment| {
            found = segment_parameter(from, to, segment.p0, segment.p1).is_some();
            !found
        });
        found
    }

    ///The boundary respecting route between two points.
    pub fn comb(&self, from: Point2, to: Point2) -> CombPath {
        comb_route(&self.boundary, from, to)
    }

    ///The length of the boundary respecting route, in microns.
    pub fn combed_distance(&self, from: Point2, to: Point2) -> Coord {
        let path = self.comb(from, to);
        path.points
            .windows(2)
            .map(|w| (w[1] - w[0]).vsize())
            .sum()
    }
}

///One crossing of the query segment with a boundary polygon, ordered by the
///parameter along the query segment.
#[derive(Clone, Debug)]
struct LineCrossing {
    t: f64,
    poly_idx: usize,
    seg_idx: usize,
    point: Point2,
}

///Route from `start` to `end` while respecting the boundary polygons:
///wherever the straight segment crosses a polygon, the route walks around
///that polygon along the shorter side.
///
///The crossings are gathered by walking the cells of the segment in the
///boundary's line grid, so only edges stored in those cells are tested; the
///earliest crossing comes first.
fn comb_route(boundary: &IndexedBoundary, start: Point2, end: Point2) -> CombPath {
    let mut crossings: Vec<LineCrossing> = Vec::new();
    boundary.grid.process_line((start, end), |segment| {
        if let Some(t) = segment_parameter(start, end, segment.p0, segment.p1) {
            // segments spanning several cells are visited once per cell
            if !crossings
                .iter()
                .any(|c| c.poly_idx == segment.poly_idx && c.seg_idx == segment.seg_idx)
            {
                let along = end - start;
                let point = start
                    + Point2::new(
                        (along.x as f64 * t) as Coord,
                        (along.y as f64 * t) as Coord,
                    );
                crossings.push(LineCrossing {
                    t,
                    poly_idx: segment.poly_idx,
                    seg_idx: segment.seg_idx,
                    point,
                });
            }
        }
        true
    });

    if crossings.is_empty() {
        return CombPath {
            points: vec![start, end],
            cross_boundary: false,
            through_air: false,
        };
    }
    crossings.sort_by(|a, b| a.t.partial_cmp(&b.t).expect("crossing parameters are finite"));

    // Pair the earliest and latest crossing per polygon and walk around the
    // polygon between them. A polygon crossed an odd number of times cannot
    // be avoided: the route then moves through the boundary.
    let mut per_polygon: Vec<(usize, Vec<&LineCrossing>)> = Vec::new();
    for crossing in &crossings {
        match per_polygon
            .iter_mut()
            .find(|(poly_idx, _)| *poly_idx == crossing.poly_idx)
        {
            Some((_, list)) => list.push(crossing),
            None => per_polygon.push((crossing.poly_idx, vec![crossing])),
        }
    }

    let mut points = vec![start];
    let mut cross_boundary = false;
    for (poly_idx, list) in &per_polygon {
        if list.len() % 2 == 1 {
            cross_boundary = true;
            continue;
        }
        let entry = list.first().expect("crossed polygons have crossings");
        let exit = list.last().expect("crossed polygons have crossings");
        points.extend(walk_around(
            &boundary.polygons[*poly_idx],
            entry,
            exit,
        ));
    }
    points.push(end);
    CombPath {
        points,
        cross_boundary,
        through_air: false,
    }
}

///The shorter of the two walks along the polygon outline from the entry
///crossing to the exit crossing.
fn walk_around(
    polygon: &crate::geometry::Polygon,
    entry: &LineCrossing,
    exit: &LineCrossing,
) -> Vec<Point2> {
    let n = polygon.len();
    let mut forward = vec![entry.point];
    let mut idx = (entry.seg_idx + 1) % n;
    while idx != (exit.seg_idx + 1) % n {
        forward.push(polygon[idx]);
        idx = (idx + 1) % n;
    }
    forward.push(exit.point);

    let mut backward = vec![entry.point];
    let mut idx = entry.seg_idx;
    while idx != exit.seg_idx {
        backward.push(polygon[idx]);
        idx = (idx + n - 1) % n;
    }
    backward.push(exit.point);

    let length = |path: &[Point2]| -> i64 {
        path.windows(2).map(|w| (w[1] - w[0]).vsize()).sum()
    };
    if length(&forward) <= length(&backward) {
        forward
    } else {
        backward
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Polygon;

    fn square(origin: Point2, size: Coord) -> Polygon {
        Polygon::new(vec![
            origin,
            origin + Point2::new(size, 0),
            origin + Point2::new(size, size),
            origin + Point2::new(0, size),
        ])
    }

    fn square_set(origin: Point2, size: Coord) -> PolygonSet {
        PolygonSet::new(vec![square(origin, size)])
    }

    #[test]
    fn straight_route_inside_one_square() {
        let boundary = square_set(Point2::new(0, 0), 10_000);
        let comb = Comb::new(boundary.clone(), boundary, None, 400, 50);
        let paths = comb
            .calc(
                Point2::new(1000, 1000),
                Point2::new(9000, 9000),
                true,
                true,
                0,
                false,
                false,
            )
            .expect("both points are in the same part");
        assert!(!paths.through_air);
        assert_eq!(paths.paths.len(), 1);
        let path = &paths.paths[0];
        assert!(!path.cross_boundary);
        assert_eq!(path.points.first(), Some(&Point2::new(1000, 1000)));
        assert_eq!(path.points.last(), Some(&Point2::new(9000, 9000)));
        let inside = square_set(Point2::new(0, 0), 10_000);
        for point in &path.points {
            assert!(inside.inside(*point, true));
        }
    }

    #[test]
    fn route_walks_around_hole() {
        // a 10x10 mm square with a 2x6 mm hole between start and end
        let boundary = PolygonSet::new(vec![
            square(Point2::new(0, 0), 10_000),
            square(Point2::new(4000, 2000), 2000),
        ]);
        let comb = Comb::new(boundary.clone(), boundary.clone(), None, 400, 50);
        let paths = comb
            .calc(
                Point2::new(1000, 3000),
                Point2::new(9000, 3000),
                true,
                true,
                0,
                false,
                false,
            )
            .expect("hole does not disconnect the part");
        assert!(!paths.through_air);
        let path = &paths.paths[0];
        assert!(!path.cross_boundary);
        assert!(path.points.len() > 2, "the route must bend around the hole");
        // every segment stays clear of the hole interior
        for w in path.points.windows(2) {
            let mid = Point2::new((w[0].x + w[1].x) / 2, (w[0].y + w[1].y) / 2);
            assert!(boundary.inside(mid, true), "{:?} escapes the boundary", mid);
        }
    }

    #[test]
    fn separated_parts_travel_through_air() {
        let boundary = PolygonSet::new(vec![
            square(Point2::new(0, 0), 1000),
            square(Point2::new(5000, 0), 1000),
        ]);
        let comb = Comb::new(boundary.clone(), boundary, None, 100, 20);
        let paths = comb
            .calc(
                Point2::new(500, 500),
                Point2::new(5500, 500),
                true,
                true,
                0,
                false,
                false,
            )
            .expect("the travel is routed via air");
        assert!(paths.through_air);
        assert!(paths.paths.len() >= 3, "inside start, air, inside end");
    }

    #[test]
    fn air_moves_can_fail_combing_by_policy() {
        let boundary = PolygonSet::new(vec![
            square(Point2::new(0, 0), 1000),
            square(Point2::new(5000, 0), 1000),
        ]);
        let comb = Comb::new(boundary.clone(), boundary, None, 100, 20);
        assert!(comb
            .calc(
                Point2::new(500, 500),
                Point2::new(5500, 500),
                true,
                true,
                0,
                true,
                false,
            )
            .is_none());
    }

    #[test]
    fn short_moves_skip_combing() {
        let boundary = square_set(Point2::new(0, 0), 10_000);
        let comb = Comb::new(boundary.clone(), boundary, None, 400, 50);
        let paths = comb
            .calc(
                Point2::new(100, 100),
                Point2::new(150, 100),
                true,
                true,
                1000,
                false,
                false,
            )
            .expect("short moves always comb trivially");
        assert_eq!(paths.paths.len(), 1);
        assert_eq!(paths.paths[0].points, vec![Point2::new(100, 100), Point2::new(150, 100)]);
    }
}
