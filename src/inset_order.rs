use std::collections::HashSet;

use crate::geometry::shorter_than;
use crate::grid::{HasPosition, SparsePointGrid};
use crate::path::{ExtrusionJunction, ExtrusionLine};
use crate::settings::{InsetDirection, WallOrderConfig};

///How much farther two junctions may be apart due to corners. This must
///stay below 2, otherwise an order requirement could arise between e.g.
///wall 2 of one region and wall 3 of another region while a wall 3 of the
///first region lies in between.
const DIAGONAL_EXTENSION: f64 = 1.9;

///Translate a wall ordering policy into the precedence relation consumed by
///the path order optimiser. Pairs (a, b) mean: wall `a` prints before wall
///`b`; indices refer to positions in `walls`.
pub fn order_requirements(
    walls: &[ExtrusionLine],
    config: &WallOrderConfig,
) -> HashSet<(usize, usize)> {
    let outer_to_inner = config.inset_direction == InsetDirection::OutsideIn;
    let mut order = if config.pack_by_inset {
        inset_order(walls, outer_to_inner)
    } else {
        region_order(walls, outer_to_inner)
    };
    if config.center_last {
        apply_center_last(walls, &mut order);
    }
    order
}

///Pack by inset: every line at inset k precedes every line at inset k+1 (or
///the other way around for inside-out printing). Odd lines overlaying the
///walls at the next lower inset print after those walls.
pub fn inset_order(walls: &[ExtrusionLine], outer_to_inner: bool) -> HashSet<(usize, usize)> {
    let mut order = HashSet::new();

    let mut walls_by_inset: Vec<Vec<usize>> = Vec::new();
    let mut fillers_by_inset: Vec<Vec<usize>> = Vec::new();
    for (idx, line) in walls.iter().enumerate() {
        let buckets = if line.is_odd {
            &mut fillers_by_inset
        } else {
            &mut walls_by_inset
        };
        if line.inset_index >= buckets.len() {
            buckets.resize(line.inset_index + 1, Vec::new());
        }
        buckets[line.inset_index].push(idx);
    }

    for inset_idx in 0..walls_by_inset.len().saturating_sub(1) {
        for &line in &walls_by_inset[inset_idx] {
            for &inner_line in &walls_by_inset[inset_idx + 1] {
                if outer_to_inner {
                    order.insert((line, inner_line));
                } else {
                    order.insert((inner_line, line));
                }
            }
        }
    }
    // gap fillers at inset k overlay the walls at inset k - 1
    for inset_idx in 1..fillers_by_inset.len() {
        if inset_idx - 1 >= walls_by_inset.len() {
            continue;
        }
        for &filler in &fillers_by_inset[inset_idx] {
            for &enclosing_wall in &walls_by_inset[inset_idx - 1] {
                order.insert((enclosing_wall, filler));
            }
        }
    }

    order
}

///A wall junction mapped back to the wall it belongs to, for the region
///adjacency grid.
#[derive(Clone, Debug)]
struct JunctionLoc {
    junction: ExtrusionJunction,
    wall_idx: usize,
}

impl HasPosition for JunctionLoc {
    fn position(&self) -> crate::geometry::Point2 {
        self.junction.p
    }
}

///By region: map junction locations into a point grid and require an order
///between walls of adjacent inset indices whose junctions lie within about
///a line width of each other. This captures adjacent regions (a hole's wall
///next to the outer wall) without explicit region detection.
pub fn region_order(walls: &[ExtrusionLine], outer_to_inner: bool) -> HashSet<(usize, usize)> {
    let mut order = HashSet::new();

    let max_line_w = walls.iter().map(ExtrusionLine::max_width).max().unwrap_or(0);
    if max_line_w == 0 {
        return order;
    }
    let searching_radius = (max_line_w as f64 * DIAGONAL_EXTENSION) as i64;

    let mut grid = SparsePointGrid::new(searching_radius.max(1));
    for (wall_idx, line) in walls.iter().enumerate() {
        for &junction in &line.junctions {
            grid.insert(JunctionLoc { junction, wall_idx });
        }
    }

    let junction_locs: Vec<JunctionLoc> = grid.iter().map(|(_, elem)| elem.clone()).collect();
    for here_loc in junction_locs {
        let here = &walls[here_loc.wall_idx];
        for nearby_loc in grid.get_nearby(here_loc.junction.p, searching_radius) {
            let nearby = &walls[nearby_loc.wall_idx];
            if nearby_loc.wall_idx == here_loc.wall_idx {
                continue;
            }
            if nearby.inset_index == here.inset_index {
                continue;
            }
            if nearby.inset_index > here.inset_index + 1
                || here.inset_index > nearby.inset_index + 1
            {
                continue; // not directly adjacent
            }
            let max_gap = ((here_loc.junction.w + nearby_loc.junction.w) / 2) as f64
                * DIAGONAL_EXTENSION;
            if !shorter_than(here_loc.junction.p - nearby_loc.junction.p, max_gap as i64) {
                continue; // the junctions are too far away from each other
            }
            if here.is_odd || nearby.is_odd {
                if here.is_odd && !nearby.is_odd && nearby.inset_index < here.inset_index {
                    order.insert((nearby_loc.wall_idx, here_loc.wall_idx));
                }
                if nearby.is_odd && !here.is_odd && here.inset_index < nearby.inset_index {
                    order.insert((here_loc.wall_idx, nearby_loc.wall_idx));
                }
            } else if (nearby.inset_index < here.inset_index) == outer_to_inner {
                order.insert((nearby_loc.wall_idx, here_loc.wall_idx));
            } else {
                order.insert((here_loc.wall_idx, nearby_loc.wall_idx));
            }
        }
    }
    order
}

///Centre-last post-processing: every odd (gap filler) line must be preceded
///by every non-odd line.
pub fn apply_center_last(walls: &[ExtrusionLine], order: &mut HashSet<(usize, usize)>) {
    for (odd_idx, line) in walls.iter().enumerate() {
        if !line.is_odd {
            continue;
        }
        for (other_idx, other_line) in walls.iter().enumerate() {
            if !other_line.is_odd {
                order.insert((other_idx, odd_idx));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Coord, Point2};

    fn wall_square(center: Point2, half: Coord, width: Coord, inset_index: usize) -> ExtrusionLine {
        let corners = [
            center + Point2::new(-half, -half),
            center + Point2::new(half, -half),
            center + Point2::new(half, half),
            center + Point2::new(-half, half),
        ];
        ExtrusionLine::new(
            corners
                .iter()
                .map(|&p| ExtrusionJunction::new(p, width, inset_index))
                .collect(),
            true,
            inset_index,
        )
    }

    #[test]
    fn outside_in_orders_insets_outwards_first() {
        let walls = vec![
            wall_square(Point2::new(0, 0), 3000, 400, 0),
            wall_square(Point2::new(0, 0), 2600, 400, 1),
            wall_square(Point2::new(0, 0), 2200, 400, 2),
        ];
        let order = inset_order(&walls, true);
        assert!(order.contains(&(0, 1)));
        assert!(order.contains(&(1, 2)));
        assert!(!order.contains(&(1, 0)));
    }

    #[test]
    fn inside_out_reverses_the_relation() {
        let walls = vec![
            wall_square(Point2::new(0, 0), 3000, 400, 0),
            wall_square(Point2::new(0, 0), 2600, 400, 1),
        ];
        let order = inset_order(&walls, false);
        assert!(order.contains(&(1, 0)));
        assert!(!order.contains(&(0, 1)));
    }

    #[test]
    fn gap_fillers_follow_their_enclosing_walls() {
        let mut filler = wall_square(Point2::new(0, 0), 2400, 200, 1);
        filler.is_odd = true;
        filler.is_closed = false;
        let walls = vec![wall_square(Point2::new(0, 0), 3000, 400, 0), filler];
        let order = inset_order(&walls, true);
        assert!(order.contains(&(0, 1)));
    }

    #[test]
    fn region_order_links_adjacent_insets_only() {
        // two separate regions, each with two concentric walls; the regions
        // are far apart so no cross-region requirements may appear
        let region_a = [
            wall_square(Point2::new(0, 0), 3000, 400, 0),
            wall_square(Point2::new(0, 0), 2600, 400, 1),
        ];
        let region_b = [
            wall_square(Point2::new(100_000, 0), 3000, 400, 0),
            wall_square(Point2::new(100_000, 0), 2600, 400, 1),
        ];
        let walls: Vec<ExtrusionLine> = region_a.into_iter().chain(region_b).collect();
        let order = region_order(&walls, true);
        assert!(order.contains(&(0, 1)));
        assert!(order.contains(&(2, 3)));
        for &(a, b) in &order {
            let same_region = (a < 2) == (b < 2);
            assert!(same_region, "unexpected cross-region requirement {:?}", (a, b));
        }
    }

    #[test]
    fn center_last_puts_odd_lines_at_the_end() {
        let mut filler = wall_square(Point2::new(0, 0), 2400, 200, 2);
        filler.is_odd = true;
        let walls = vec![
            wall_square(Point2::new(0, 0), 3000, 400, 0),
            wall_square(Point2::new(0, 0), 2600, 400, 1),
            filler,
        ];
        let mut order = HashSet::new();
        apply_center_last(&walls, &mut order);
        assert!(order.contains(&(0, 2)));
        assert!(order.contains(&(1, 2)));
        assert!(!order.contains(&(2, 0)));
    }
}
