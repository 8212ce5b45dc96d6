use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

use glam::DVec2;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::PlannerError;

///All stored geometry is in integer micro metres.
pub type Coord = i64;

///One micro metre squared distances fit easily; a whole millimetre is 1000.
pub const MICRON_PER_MM: i64 = 1000;

///Convert a micron count to millimetres for transient float computation.
pub fn microns_to_mm(microns: Coord) -> f64 {
    microns as f64 / MICRON_PER_MM as f64
}

///Convert millimetres to the nearest micron.
pub fn mm_to_microns(mm: f64) -> Coord {
    (mm * MICRON_PER_MM as f64).round() as Coord
}

///A point (or vector) in the layer plane, in integer micro metres.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point2 {
    pub x: Coord,
    pub y: Coord,
}

impl Point2 {
    pub const fn new(x: Coord, y: Coord) -> Self {
        Point2 { x, y }
    }

    ///Squared length of this point interpreted as a vector.
    pub fn vsize2(self) -> i64 {
        self.x * self.x + self.y * self.y
    }

    ///Length of this point interpreted as a vector, in microns.
    pub fn vsize(self) -> i64 {
        (self.vsize2() as f64).sqrt() as i64
    }

    ///Length in millimetres, for time and material computations.
    pub fn vsize_mm(self) -> f64 {
        (self.vsize2() as f64).sqrt() / MICRON_PER_MM as f64
    }

    pub fn dot(self, other: Point2) -> i64 {
        self.x * other.x + self.y * other.y
    }

    ///Z component of the cross product, positive when `other` is left of self.
    pub fn cross(self, other: Point2) -> i64 {
        self.x * other.y - self.y * other.x
    }

    ///Scale this vector to the requested length. A zero vector stays zero.
    pub fn with_length(self, length: Coord) -> Point2 {
        let size = self.vsize();
        if size == 0 {
            return Point2::new(0, 0);
        }
        Point2::new(self.x * length / size, self.y * length / size)
    }

    pub fn as_dvec2(self) -> DVec2 {
        DVec2::new(self.x as f64, self.y as f64)
    }
}

impl Add for Point2 {
    type Output = Point2;
    fn add(self, rhs: Point2) -> Point2 {
        Point2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Point2 {
    fn add_assign(&mut self, rhs: Point2) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Point2 {
    type Output = Point2;
    fn sub(self, rhs: Point2) -> Point2 {
        Point2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl SubAssign for Point2 {
    fn sub_assign(&mut self, rhs: Point2) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

impl Neg for Point2 {
    type Output = Point2;
    fn neg(self) -> Point2 {
        Point2::new(-self.x, -self.y)
    }
}

impl Mul<Coord> for Point2 {
    type Output = Point2;
    fn mul(self, rhs: Coord) -> Point2 {
        Point2::new(self.x * rhs, self.y * rhs)
    }
}

///Whether the vector is strictly shorter than the given length.
///Compares squared sizes so no square root is taken.
pub fn shorter_than(vector: Point2, length: Coord) -> bool {
    vector.vsize2() < length * length
}

///The angle left of the corner p0 -> p1 -> p2, in the range [0, 2*pi).
///
///For a counter-clockwise outline this is the interior angle at p1: a
///straight continuation yields pi, convex corners fall below it and reflex
///(concave) corners rise above it.
pub fn angle_left(p0: Point2, p1: Point2, p2: Point2) -> f64 {
    let a = (p0 - p1).as_dvec2();
    let b = (p2 - p1).as_dvec2();
    let angle = -f64::atan2(a.x * b.y - a.y * b.x, a.dot(b));
    if angle < 0.0 {
        angle + std::f64::consts::TAU
    } else {
        angle
    }
}

///Sum the lengths of the polyline through `points`, checking for overflow.
pub fn checked_polyline_length(points: &[Point2]) -> Result<Coord, PlannerError> {
    let mut total: i64 = 0;
    for window in points.windows(2) {
        let segment = (window[1] - window[0]).vsize();
        total = total
            .checked_add(segment)
            .ok_or(PlannerError::NumericOverflow {
                context: "accumulating a polyline length",
            })?;
    }
    Ok(total)
}

///An ordered sequence of points. Closedness (an implicit edge from the last
///point back to the first) is decided by the operation using the polygon;
///the same storage holds open polylines such as infill lines.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Polygon(pub Vec<Point2>);

impl Polygon {
    pub fn new(points: Vec<Point2>) -> Self {
        Polygon(points)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, p: Point2) {
        self.0.push(p);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point2> {
        self.0.iter()
    }

    ///Iterate the closed edge list, including the wrap-around edge.
    pub fn edges(&self) -> impl Iterator<Item = (Point2, Point2)> + '_ {
        self.0.iter().copied().circular_tuple_windows::<(_, _)>()
    }

    ///Twice the signed area. Positive for counter-clockwise polygons.
    pub fn area2(&self) -> i128 {
        let mut sum: i128 = 0;
        for (a, b) in self.edges() {
            sum += (a.x as i128) * (b.y as i128) - (b.x as i128) * (a.y as i128);
        }
        sum
    }

    ///Total length of the closed outline.
    pub fn perimeter(&self) -> i64 {
        self.edges().map(|(a, b)| (b - a).vsize()).sum()
    }

    ///Even-odd inside test. Points exactly on the border count as inside
    ///when `border_is_inside` is set.
    pub fn inside(&self, p: Point2, border_is_inside: bool) -> bool {
        if self.0.len() < 3 {
            return false;
        }
        let mut crossings = 0;
        for (a, b) in self.edges() {
            if on_segment(a, b, p) {
                return border_is_inside;
            }
            if (a.y > p.y) != (b.y > p.y) {
                // x coordinate of the edge at height p.y
                let x_cross =
                    a.x as f64 + (b.x - a.x) as f64 * (p.y - a.y) as f64 / (b.y - a.y) as f64;
                if (p.x as f64) < x_cross {
                    crossings += 1;
                }
            }
        }
        crossings % 2 == 1
    }

    ///The vertex index and location of the point on the outline closest to `p`.
    pub fn closest_point(&self, p: Point2) -> Option<ClosestPoint> {
        let mut best: Option<ClosestPoint> = None;
        for (seg_idx, (a, b)) in self.edges().enumerate() {
            let candidate = closest_point_on_segment(a, b, p);
            let dist2 = (candidate - p).vsize2();
            if best.as_ref().map_or(true, |b| dist2 < b.dist2) {
                best = Some(ClosestPoint {
                    location: candidate,
                    segment_index: seg_idx,
                    dist2,
                });
            }
        }
        best
    }
}

impl From<Vec<Point2>> for Polygon {
    fn from(points: Vec<Point2>) -> Self {
        Polygon(points)
    }
}

impl std::ops::Index<usize> for Polygon {
    type Output = Point2;
    fn index(&self, index: usize) -> &Point2 {
        &self.0[index]
    }
}

///The result of a closest-point query on a polygon outline.
#[derive(Clone, Copy, Debug)]
pub struct ClosestPoint {
    pub location: Point2,
    ///Index of the edge (from vertex i to vertex i+1) the location lies on.
    pub segment_index: usize,
    pub dist2: i64,
}

///An ordered collection of polygons: a multi-part region, or a bag of
///open polyline segments depending on the consumer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolygonSet(pub Vec<Polygon>);

impl PolygonSet {
    pub fn new(polygons: Vec<Polygon>) -> Self {
        PolygonSet(polygons)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, polygon: Polygon) {
        self.0.push(polygon);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Polygon> {
        self.0.iter()
    }

    ///Even-odd inside test over all member polygons: holes cancel out.
    pub fn inside(&self, p: Point2, border_is_inside: bool) -> bool {
        let mut inside_count = 0;
        for polygon in &self.0 {
            if polygon.len() < 3 {
                continue;
            }
            for (a, b) in polygon.edges() {
                if on_segment(a, b, p) {
                    return border_is_inside;
                }
            }
            if polygon.inside(p, border_is_inside) {
                inside_count += 1;
            }
        }
        inside_count % 2 == 1
    }

    ///Whether the open segment from `a` to `b` properly crosses any edge.
    ///Touching an endpoint does not count as a crossing.
    pub fn collides_with_segment(&self, a: Point2, b: Point2) -> bool {
        self.0.iter().any(|polygon| {
            polygon
                .edges()
                .any(|(c, d)| segment_parameter(a, b, c, d).is_some())
        })
    }

    ///The closest outline point over all member polygons.
    pub fn closest_point(&self, p: Point2) -> Option<(usize, ClosestPoint)> {
        let mut best: Option<(usize, ClosestPoint)> = None;
        for (poly_idx, polygon) in self.0.iter().enumerate() {
            if polygon.len() < 2 {
                continue;
            }
            if let Some(candidate) = polygon.closest_point(p) {
                if best.as_ref().map_or(true, |(_, b)| candidate.dist2 < b.dist2) {
                    best = Some((poly_idx, candidate));
                }
            }
        }
        best
    }

    ///Move `p` so that it lies `distance` inside the boundary, if `p` is
    ///within `max_dist2` of the boundary to begin with. Returns the index of
    ///the polygon that was moved towards.
    pub fn move_inside(&self, p: Point2, distance: Coord, max_dist2: i64) -> Option<(usize, Point2)> {
        if self.inside(p, true) && distance == 0 {
            return None;
        }
        let (poly_idx, closest) = self.closest_point(p)?;
        if !self.inside(p, true) && closest.dist2 > max_dist2 {
            return None;
        }
        let polygon = &self.0[poly_idx];
        let (a, b) = (
            polygon[closest.segment_index],
            polygon[(closest.segment_index + 1) % polygon.len()],
        );
        let along = b - a;
        // candidate normals on both sides of the edge; pick the one that
        // lands inside the boundary
        let normal = Point2::new(-along.y, along.x).with_length(distance.max(1));
        let inward = closest.location + normal;
        let outward = closest.location - normal;
        if self.inside(inward, true) {
            Some((poly_idx, inward))
        } else if self.inside(outward, true) {
            Some((poly_idx, outward))
        } else {
            None
        }
    }

    ///Total vertex count over all member polygons.
    pub fn point_count(&self) -> usize {
        self.0.iter().map(Polygon::len).sum()
    }
}

impl From<Vec<Polygon>> for PolygonSet {
    fn from(polygons: Vec<Polygon>) -> Self {
        PolygonSet(polygons)
    }
}

impl std::ops::Index<usize> for PolygonSet {
    type Output = Polygon;
    fn index(&self, index: usize) -> &Polygon {
        &self.0[index]
    }
}

///Whether `p` lies on the closed segment from `a` to `b`.
fn on_segment(a: Point2, b: Point2, p: Point2) -> bool {
    let ab = b - a;
    let ap = p - a;
    if ab.cross(ap) != 0 {
        return false;
    }
    let dot = ab.dot(ap);
    dot >= 0 && dot <= ab.vsize2()
}

///Parameter t in (0, 1) along `ab` where the open segments `ab` and `cd`
///properly cross, if they do. Shared endpoints and collinear overlap do not
///count; the comb routines treat those as touching, not crossing.
pub fn segment_parameter(a: Point2, b: Point2, c: Point2, d: Point2) -> Option<f64> {
    let r = b - a;
    let s = d - c;
    let denominator = r.cross(s);
    if denominator == 0 {
        return None;
    }
    let qp = c - a;
    let t_numerator = qp.cross(s);
    let u_numerator = qp.cross(r);
    let t = t_numerator as f64 / denominator as f64;
    let u = u_numerator as f64 / denominator as f64;
    if t > 0.0 && t < 1.0 && u >= 0.0 && u < 1.0 {
        Some(t)
    } else {
        None
    }
}

///The point on segment `ab` closest to `p`.
pub fn closest_point_on_segment(a: Point2, b: Point2, p: Point2) -> Point2 {
    let ab = b - a;
    let length2 = ab.vsize2();
    if length2 == 0 {
        return a;
    }
    let t = (p - a).dot(ab).clamp(0, length2);
    a + Point2::new(
        (ab.x as i128 * t as i128 / length2 as i128) as i64,
        (ab.y as i128 * t as i128 / length2 as i128) as i64,
    )
}

///Structured indices onto a PolygonSet that group its polygons into parts:
///one outer outline plus the holes it encloses.
#[derive(Clone, Debug, Default)]
pub struct PartsView {
    ///Per part, the indices of the member polygons. The first index of each
    ///part is its outer outline.
    pub parts: Vec<Vec<usize>>,
}

impl PartsView {
    ///Group the polygons of `set` into parts by containment depth: polygons
    ///at even depth start a part, polygons at odd depth are holes of the
    ///innermost polygon containing them.
    pub fn assemble(set: &PolygonSet) -> PartsView {
        let n = set.len();
        let mut containers: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (idx, polygon) in set.iter().enumerate() {
            let Some(&probe) = polygon.0.first() else {
                continue;
            };
            for (other_idx, other) in set.iter().enumerate() {
                if other_idx != idx && other.inside(probe, false) {
                    containers[idx].push(other_idx);
                }
            }
        }

        let mut parts: Vec<Vec<usize>> = Vec::new();
        let mut part_of: Vec<Option<usize>> = vec![None; n];
        // outer outlines first so the holes can attach to them
        for idx in 0..n {
            if containers[idx].len() % 2 == 0 {
                part_of[idx] = Some(parts.len());
                parts.push(vec![idx]);
            }
        }
        for idx in 0..n {
            if containers[idx].len() % 2 == 1 {
                // attach to the innermost even-depth container
                let owner = containers[idx]
                    .iter()
                    .copied()
                    .filter(|&c| containers[c].len() % 2 == 0)
                    .max_by_key(|&c| containers[c].len());
                if let Some(owner) = owner {
                    let part_idx = part_of[owner].expect("outer outlines are assigned first");
                    parts[part_idx].push(idx);
                }
            }
        }
        PartsView { parts }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    ///The part that contains `p`, if any.
    pub fn part_containing(&self, set: &PolygonSet, p: Point2) -> Option<usize> {
        self.parts.iter().position(|members| {
            let mut inside_count = 0;
            for &poly_idx in members {
                if set[poly_idx].inside(p, true) {
                    inside_count += 1;
                }
            }
            inside_count % 2 == 1
        })
    }

    ///Assemble the polygons of one part into their own set.
    pub fn part(&self, set: &PolygonSet, part_idx: usize) -> PolygonSet {
        PolygonSet::new(
            self.parts[part_idx]
                .iter()
                .map(|&poly_idx| set[poly_idx].clone())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(origin: Point2, size: Coord) -> Polygon {
        Polygon::new(vec![
            origin,
            origin + Point2::new(size, 0),
            origin + Point2::new(size, size),
            origin + Point2::new(0, size),
        ])
    }

    #[test]
    fn inside_square() {
        let poly = square(Point2::new(0, 0), 1000);
        assert!(poly.inside(Point2::new(500, 500), false));
        assert!(!poly.inside(Point2::new(1500, 500), false));
        assert!(poly.inside(Point2::new(0, 500), true));
        assert!(!poly.inside(Point2::new(0, 500), false));
    }

    #[test]
    fn hole_cancels_out() {
        let set = PolygonSet::new(vec![
            square(Point2::new(0, 0), 1000),
            square(Point2::new(250, 250), 500),
        ]);
        assert!(set.inside(Point2::new(100, 100), false));
        assert!(!set.inside(Point2::new(500, 500), false));
    }

    #[test]
    fn segment_crossing_parameter_is_ordered() {
        let a = Point2::new(0, 500);
        let b = Point2::new(2000, 500);
        let t = segment_parameter(a, b, Point2::new(1000, 0), Point2::new(1000, 1000))
            .expect("segments cross");
        assert!((t - 0.5).abs() < 1e-9);
        assert!(segment_parameter(a, b, Point2::new(3000, 0), Point2::new(3000, 1000)).is_none());
    }

    #[test]
    fn parts_view_groups_holes_with_outlines() {
        let set = PolygonSet::new(vec![
            square(Point2::new(0, 0), 1000),
            square(Point2::new(5000, 0), 1000),
            square(Point2::new(250, 250), 500),
        ]);
        let parts = PartsView::assemble(&set);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts.part_containing(&set, Point2::new(100, 100)), Some(0));
        assert_eq!(parts.part_containing(&set, Point2::new(5500, 500)), Some(1));
        assert_eq!(parts.part_containing(&set, Point2::new(500, 500)), None);
    }

    #[test]
    fn move_inside_lands_inside() {
        let set = PolygonSet::new(vec![square(Point2::new(0, 0), 10000)]);
        let outside = Point2::new(-50, 5000);
        let (_, moved) = set
            .move_inside(outside, 100, 400 * 400)
            .expect("point is close enough to the boundary");
        assert!(set.inside(moved, false));
    }

    #[test]
    fn angle_left_distinguishes_corner_sides() {
        // straight line continuation
        let straight = angle_left(
            Point2::new(0, 0),
            Point2::new(1000, 0),
            Point2::new(2000, 0),
        );
        assert!((straight - std::f64::consts::PI).abs() < 1e-9);
        // convex corner of a counter-clockwise square: interior angle pi/2
        let convex = angle_left(
            Point2::new(0, 0),
            Point2::new(1000, 0),
            Point2::new(1000, 1000),
        );
        assert!((convex - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
        // the same corner walked clockwise is reflex
        let reflex = angle_left(
            Point2::new(1000, 1000),
            Point2::new(1000, 0),
            Point2::new(0, 0),
        );
        assert!(reflex > std::f64::consts::PI);
    }
}
