use std::collections::HashMap;

use crate::geometry::{Coord, Point2};

///Grid cell coordinates. Cell (0, 0) is the double-wide cell around the
///origin, see [`SquareGrid::to_grid_coord`].
pub type GridPoint = Point2;

///The cell geometry shared by all sparse grids: a uniform square grid keyed
///by integer cell coordinates.
#[derive(Clone, Debug)]
pub struct SquareGrid {
    cell_size: Coord,
}

impl SquareGrid {
    pub fn new(cell_size: Coord) -> Self {
        assert!(cell_size > 0, "cell size must be positive");
        SquareGrid { cell_size }
    }

    pub fn cell_size(&self) -> Coord {
        self.cell_size
    }

    pub fn to_grid_point(&self, point: Point2) -> GridPoint {
        GridPoint::new(self.to_grid_coord(point.x), self.to_grid_coord(point.y))
    }

    ///This mapping via truncation results in the cells with grid coordinate
    ///zero being twice as large in that axis. This doesn't cause any
    ///incorrect behavior, just changes the running time slightly; it avoids
    ///a signed divide-and-floor on hot paths.
    pub fn to_grid_coord(&self, coord: Coord) -> Coord {
        coord / self.cell_size
    }

    ///The lower corner coordinate of a grid cell. Subject to the same
    ///asymmetry around zero as [`SquareGrid::to_grid_coord`].
    pub fn to_lower_coord(&self, grid_coord: Coord) -> Coord {
        grid_coord * self.cell_size
    }

    fn nonzero_sign(z: Coord) -> Coord {
        if z >= 0 {
            1
        } else {
            -1
        }
    }

    ///Visit all cells covering the square of half-width `radius` around
    ///`query_pt`. At most (2 * radius / cell_size + 1 + 1)^2 cells are
    ///visited. Stops early when `process_cell` returns false; the return
    ///value tells whether processing ran to completion.
    pub fn process_nearby_cells(
        &self,
        query_pt: Point2,
        radius: Coord,
        mut process_cell: impl FnMut(GridPoint) -> bool,
    ) -> bool {
        let min_grid = self.to_grid_point(query_pt - Point2::new(radius, radius));
        let max_grid = self.to_grid_point(query_pt + Point2::new(radius, radius));
        for grid_y in min_grid.y..=max_grid.y {
            for grid_x in min_grid.x..=max_grid.x {
                if !process_cell(GridPoint::new(grid_x, grid_y)) {
                    return false;
                }
            }
        }
        true
    }

    ///Visit every cell the line visibly passes through, stepping row by row
    ///in y and advancing the x range per row. The end cell is always visited
    ///last.
    pub fn process_line_cells(
        &self,
        line: (Point2, Point2),
        mut process_cell: impl FnMut(GridPoint) -> bool,
    ) -> bool {
        let (mut start, mut end) = line;
        if end.x < start.x {
            // make sure x increases between start and end
            std::mem::swap(&mut start, &mut end);
        }

        let start_cell = self.to_grid_point(start);
        let end_cell = self.to_grid_point(end);
        let y_diff = end.y - start.y;
        let y_dir = Self::nonzero_sign(y_diff);

        let mut x_cell_start = start_cell.x;
        let mut cell_y = start_cell.y;
        while cell_y * y_dir <= end_cell.y * y_dir {
            // nearest y coordinate of the cells in the next row
            let nearest_next_y = self.to_lower_coord(
                cell_y
                    + if Self::nonzero_sign(cell_y) == y_dir || cell_y == 0 {
                        y_dir
                    } else {
                        0
                    },
            );
            // the x coord of the last cell to include from this row
            let x_cell_end = if y_diff == 0 {
                end_cell.x
            } else {
                let area = (end.x - start.x) * (nearest_next_y - start.y);
                let corresponding_x = start.x + area / y_diff;
                let rounding_fixup = (corresponding_x < 0 && area % y_diff != 0) as Coord;
                let x_cell_end = self.to_grid_coord(corresponding_x + rounding_fixup);
                if x_cell_end < start_cell.x {
                    // process at least one cell
                    x_cell_start
                } else {
                    x_cell_end
                }
            };

            for cell_x in x_cell_start..=x_cell_end {
                let grid_loc = GridPoint::new(cell_x, cell_y);
                if !process_cell(grid_loc) {
                    return false;
                }
                if grid_loc == end_cell {
                    return true;
                }
            }
            x_cell_start = x_cell_end;
            cell_y += y_dir;
        }
        debug_assert!(false, "the line sweep should have ended at the end cell");
        true
    }
}

///Sparse grid which can locate spatially nearby elements efficiently.
///
///Insertion is O(1) amortised per stored cell; `get_nearby` with radius r
///visits at most ceil((2r / cell_size + 1)^2) cells and may return elements
///up to radius + cell_size away from the query point.
#[derive(Clone, Debug)]
pub struct SparseGrid<E> {
    square: SquareGrid,
    grid: HashMap<GridPoint, Vec<E>>,
}

impl<E> SparseGrid<E> {
    pub fn new(cell_size: Coord) -> Self {
        SparseGrid {
            square: SquareGrid::new(cell_size),
            grid: HashMap::new(),
        }
    }

    pub fn cell_size(&self) -> Coord {
        self.square.cell_size()
    }

    pub fn square_grid(&self) -> &SquareGrid {
        &self.square
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    ///Iterate all stored elements with their cell.
    pub fn iter(&self) -> impl Iterator<Item = (GridPoint, &E)> {
        self.grid
            .iter()
            .flat_map(|(cell, elems)| elems.iter().map(move |e| (*cell, e)))
    }

    pub(crate) fn insert_at_cell(&mut self, cell: GridPoint, elem: E) {
        self.grid.entry(cell).or_default().push(elem);
    }

    pub(crate) fn insert_at_point(&mut self, point: Point2, elem: E) {
        let cell = self.square.to_grid_point(point);
        self.insert_at_cell(cell, elem);
    }

    fn process_from_cell(&self, cell: GridPoint, process: &mut impl FnMut(&E) -> bool) -> bool {
        if let Some(elems) = self.grid.get(&cell) {
            for elem in elems {
                if !process(elem) {
                    return false;
                }
            }
        }
        true
    }

    ///Process elements from cells that might contain points within `radius`
    ///of `query_pt`. Stops when the callback returns false.
    pub fn process_nearby(
        &self,
        query_pt: Point2,
        radius: Coord,
        mut process: impl FnMut(&E) -> bool,
    ) -> bool {
        self.square
            .process_nearby_cells(query_pt, radius, |cell| self.process_from_cell(cell, &mut process))
    }

    ///Process elements from every cell the query line touches.
    pub fn process_line(
        &self,
        query_line: (Point2, Point2),
        mut process: impl FnMut(&E) -> bool,
    ) -> bool {
        self.square
            .process_line_cells(query_line, |cell| self.process_from_cell(cell, &mut process))
    }
}

impl<E: Clone> SparseGrid<E> {
    ///All elements within `radius` of `query_pt`, plus possibly some that
    ///are slightly beyond it (same-cell neighbours).
    pub fn get_nearby(&self, query_pt: Point2, radius: Coord) -> Vec<E> {
        let mut ret = Vec::new();
        self.process_nearby(query_pt, radius, |elem| {
            ret.push(elem.clone());
            true
        });
        ret
    }
}

///A sparse grid of elements with a single position, stored in the one cell
///containing that position.
#[derive(Clone, Debug)]
pub struct SparsePointGrid<E: HasPosition> {
    inner: SparseGrid<E>,
}

///Accessor for the position of elements stored in a [`SparsePointGrid`].
pub trait HasPosition {
    fn position(&self) -> Point2;
}

impl<E: HasPosition> SparsePointGrid<E> {
    pub fn new(cell_size: Coord) -> Self {
        SparsePointGrid {
            inner: SparseGrid::new(cell_size),
        }
    }

    pub fn insert(&mut self, elem: E) {
        let position = elem.position();
        self.inner.insert_at_point(position, elem);
    }

    pub fn iter(&self) -> impl Iterator<Item = (GridPoint, &E)> {
        self.inner.iter()
    }

    pub fn process_nearby(
        &self,
        query_pt: Point2,
        radius: Coord,
        process: impl FnMut(&E) -> bool,
    ) -> bool {
        self.inner.process_nearby(query_pt, radius, process)
    }

    ///Whether any element within `radius` satisfies the precondition.
    ///Returns on the first hit.
    pub fn get_any_nearby(&self, query_pt: Point2, radius: Coord, precondition: impl Fn(&E) -> bool) -> bool
    where
        E: Clone,
    {
        !self.inner.process_nearby(query_pt, radius, |elem| {
            let close_enough = (elem.position() - query_pt).vsize2() <= radius * radius;
            !(close_enough && precondition(elem))
        })
    }

    ///The element nearest to `query_pt` within `radius` that satisfies the
    ///precondition, tracking the best candidate so far. O(k) in the visited
    ///candidates.
    pub fn get_nearest(
        &self,
        query_pt: Point2,
        radius: Coord,
        precondition: impl Fn(&E) -> bool,
    ) -> Option<E>
    where
        E: Clone,
    {
        let mut best: Option<(i64, E)> = None;
        self.inner.process_nearby(query_pt, radius, |elem| {
            if precondition(elem) {
                let dist2 = (elem.position() - query_pt).vsize2();
                if dist2 <= radius * radius && best.as_ref().map_or(true, |(d, _)| dist2 < *d) {
                    best = Some((dist2, elem.clone()));
                }
            }
            true
        });
        best.map(|(_, elem)| elem)
    }

    ///All elements within `radius` of `query_pt`, plus possibly some that
    ///are slightly beyond it (same-cell neighbours).
    pub fn get_nearby(&self, query_pt: Point2, radius: Coord) -> Vec<E>
    where
        E: Clone,
    {
        self.inner.get_nearby(query_pt, radius)
    }
}

impl<E: Clone> SparseGrid<E> {
    fn collect_line_cells(&self, line: (Point2, Point2)) -> Vec<GridPoint> {
        let mut cells = Vec::new();
        self.square.process_line_cells(line, |cell| {
            cells.push(cell);
            true
        });
        cells
    }
}

///Accessor for the segment endpoints of elements stored in a
///[`SparseLineGrid`].
pub trait HasLine {
    fn line(&self) -> (Point2, Point2);
}

///A sparse grid of segment shaped elements; each element is stored in every
///cell its segment visibly passes through.
#[derive(Clone, Debug)]
pub struct SparseLineGrid<E: HasLine + Clone> {
    inner: SparseGrid<E>,
}

impl<E: HasLine + Clone> SparseLineGrid<E> {
    pub fn new(cell_size: Coord) -> Self {
        SparseLineGrid {
            inner: SparseGrid::new(cell_size),
        }
    }

    pub fn cell_size(&self) -> Coord {
        self.inner.cell_size()
    }

    pub fn insert(&mut self, elem: E) {
        let cells = self.inner.collect_line_cells(elem.line());
        for cell in cells {
            self.inner.insert_at_cell(cell, elem.clone());
        }
    }

    ///Process every stored element whose cell is touched by the query line.
    ///Elements spanning several cells are visited once per touched cell.
    pub fn process_line(
        &self,
        query_line: (Point2, Point2),
        process: impl FnMut(&E) -> bool,
    ) -> bool {
        self.inner.process_line(query_line, process)
    }

    pub fn get_nearby(&self, query_pt: Point2, radius: Coord) -> Vec<E> {
        self.inner.get_nearby(query_pt, radius)
    }
}

///An element of a [`SparsePointGridInclusive`]: the indexed point together
///with its value.
#[derive(Clone, Debug)]
pub struct SparsePointGridElem<V> {
    pub point: Point2,
    pub val: V,
}

impl<V> HasPosition for SparsePointGridElem<V> {
    fn position(&self) -> Point2 {
        self.point
    }
}

///A sparse point grid storing `(Point, Value)` records, for values that
///don't carry their own position.
#[derive(Clone, Debug)]
pub struct SparsePointGridInclusive<V: Clone> {
    inner: SparsePointGrid<SparsePointGridElem<V>>,
}

impl<V: Clone> SparsePointGridInclusive<V> {
    pub fn new(cell_size: Coord) -> Self {
        SparsePointGridInclusive {
            inner: SparsePointGrid::new(cell_size),
        }
    }

    pub fn insert(&mut self, point: Point2, val: V) {
        self.inner.insert(SparsePointGridElem { point, val });
    }

    ///The values of all records near `query_pt`, may include values slightly
    ///beyond `radius`.
    pub fn get_nearby_vals(&self, query_pt: Point2, radius: Coord) -> Vec<V> {
        let mut ret = Vec::new();
        self.inner.process_nearby(query_pt, radius, |elem| {
            ret.push(elem.val.clone());
            true
        });
        ret
    }

    pub fn get_nearby(&self, query_pt: Point2, radius: Coord) -> Vec<(Point2, V)> {
        let mut ret = Vec::new();
        self.inner.process_nearby(query_pt, radius, |elem| {
            ret.push((elem.point, elem.val.clone()));
            true
        });
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Marker {
        point: Point2,
        id: usize,
    }

    impl HasPosition for Marker {
        fn position(&self) -> Point2 {
            self.point
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Segment {
        a: Point2,
        b: Point2,
        id: usize,
    }

    impl HasLine for Segment {
        fn line(&self) -> (Point2, Point2) {
            (self.a, self.b)
        }
    }

    #[test]
    fn zero_cells_are_double_wide() {
        let grid = SquareGrid::new(1000);
        // truncating division folds (-1000, 1000) into grid coordinate 0
        assert_eq!(grid.to_grid_coord(-999), 0);
        assert_eq!(grid.to_grid_coord(999), 0);
        assert_eq!(grid.to_grid_coord(1000), 1);
        assert_eq!(grid.to_grid_coord(-1000), -1);
    }

    #[test]
    fn nearby_finds_inserted_points() {
        let mut grid = SparsePointGrid::new(1000);
        grid.insert(Marker {
            point: Point2::new(500, 500),
            id: 0,
        });
        grid.insert(Marker {
            point: Point2::new(9500, 500),
            id: 1,
        });
        let near = grid
            .get_nearest(Point2::new(600, 500), 1000, |_| true)
            .expect("marker 0 is in range");
        assert_eq!(near.id, 0);
        assert!(grid
            .get_nearest(Point2::new(5000, 5000), 1000, |_| true)
            .is_none());
    }

    #[test]
    fn nearest_respects_precondition() {
        let mut grid = SparsePointGrid::new(1000);
        grid.insert(Marker {
            point: Point2::new(0, 0),
            id: 0,
        });
        grid.insert(Marker {
            point: Point2::new(400, 0),
            id: 1,
        });
        let nearest = grid
            .get_nearest(Point2::new(100, 0), 2000, |m| m.id != 0)
            .expect("marker 1 passes the precondition");
        assert_eq!(nearest.id, 1);
    }

    #[test]
    fn line_grid_covers_diagonal() {
        let mut grid = SparseLineGrid::new(1000);
        grid.insert(Segment {
            a: Point2::new(1500, 1500),
            b: Point2::new(4500, 3500),
            id: 7,
        });
        // querying across the stored segment must surface it
        let mut seen = false;
        grid.process_line((Point2::new(3000, 500), Point2::new(3000, 4500)), |seg| {
            seen |= seg.id == 7;
            true
        });
        assert!(seen);
        // a faraway query must not
        let mut seen_far = false;
        grid.process_line((Point2::new(20000, 0), Point2::new(20000, 9000)), |seg| {
            seen_far |= seg.id == 7;
            true
        });
        assert!(!seen_far);
    }

    #[test]
    fn line_sweep_visits_end_cell_of_negative_lines() {
        let grid = SquareGrid::new(10);
        let mut cells = Vec::new();
        grid.process_line_cells((Point2::new(-253, -103), Point2::new(-253, -173)), |cell| {
            cells.push(cell);
            true
        });
        assert!(cells.contains(&grid.to_grid_point(Point2::new(-253, -103))));
        assert!(cells.contains(&grid.to_grid_point(Point2::new(-253, -173))));
    }

    #[test]
    fn inclusive_grid_returns_values() {
        let mut grid = SparsePointGridInclusive::new(2000);
        grid.insert(Point2::new(0, 0), 42usize);
        grid.insert(Point2::new(100, 100), 43usize);
        let vals = grid.get_nearby_vals(Point2::new(50, 50), 500);
        assert!(vals.contains(&42));
        assert!(vals.contains(&43));
    }
}
