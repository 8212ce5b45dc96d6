use crate::error::PlannerError;
use crate::geometry::{closest_point_on_segment, microns_to_mm, Coord, Point2};
use crate::path::SpaceFillType;
use crate::plan::ExtruderPlan;

///Collapse (extrusion, short travel, collinear extrusion) runs into single
///extrusion moves. The merged path extrudes over the former travel gap as
///well, so its flow is adjusted to keep the total extruded volume equal;
///the collinearity requirement keeps the deposit on the original line.
///
///Returns whether anything was merged. Paths carrying the
///skip_agressive_merge_hint are left alone.
pub fn merge_infill_lines(
    plan: &mut ExtruderPlan<'_>,
    nozzle_size: Coord,
) -> Result<bool, PlannerError> {
    let paths = std::mem::take(&mut plan.paths);
    let mut result: Vec<crate::path::GCodePath<'_>> = Vec::with_capacity(paths.len());
    let mut changed = false;

    // the start point of the path about to be pushed onto `result`
    let mut position = plan.start_position;
    // the start point of the last extrusion path in `result`
    let mut last_extrusion_start = plan.start_position;

    let mut iter = paths.into_iter().peekable();
    while let Some(path) = iter.next() {
        let mergeable_travel = path.is_travel_path()
            && !path.retract
            && !path.perform_z_hop
            && !path.perform_prime
            && path.points.len() == 1
            && result.last().is_some_and(|prev| is_merge_candidate(prev))
            && iter.peek().is_some_and(|next| {
                let prev = result.last().expect("checked above");
                is_merge_candidate(next)
                    && std::ptr::eq(prev.config, next.config)
                    && prev.spiralize == next.spiralize
                    && prev.speed_factor == next.speed_factor
            });

        if mergeable_travel {
            let travel_end = path.points[0];
            let gap = (travel_end - position).vsize();
            let next = iter.peek().expect("peeked above");
            let prev = result.last().expect("checked above");

            if gap < 2 * nozzle_size
                && collinear_with(prev, last_extrusion_start, &path.points, &next.points)
            {
                let next = iter.next().expect("peeked above");
                let prev = result.last_mut().expect("checked above");

                // the volumes the two lines were going to deposit
                let prev_length_mm =
                    polyline_length_mm(last_extrusion_start, &prev.points)?;
                let next_length_mm = polyline_length_mm(travel_end, &next.points)?;
                let volume = prev_length_mm * prev.extrusion_mm3_per_mm()
                    + next_length_mm * next.extrusion_mm3_per_mm();

                let continuation_start = *prev.points.last().expect("merge candidates have points");
                prev.points.extend(next.points.iter().copied());
                let merged_length_mm =
                    polyline_length_mm(last_extrusion_start, &prev.points)?;

                // redistribute the volume over the longer merged line
                let nominal = prev.config.extrusion_mm3_per_mm();
                if merged_length_mm > 0.0 && nominal > 0.0 {
                    prev.flow = volume / (merged_length_mm * nominal);
                }
                debug_assert!(
                    (merged_length_mm * prev.extrusion_mm3_per_mm() - volume).abs()
                        <= 0.01 * microns_to_mm(prev.config.line_width).powi(3).max(1e-9),
                    "merging must preserve the extruded volume"
                );

                position = prev
                    .points
                    .last()
                    .copied()
                    .unwrap_or(continuation_start);
                changed = true;
                continue;
            }
        }

        if !path.is_travel_path() {
            last_extrusion_start = position;
        }
        if let Some(last) = path.points.last() {
            position = *last;
        }
        result.push(path);
    }

    plan.paths = result;
    Ok(changed)
}

fn is_merge_candidate(path: &crate::path::GCodePath<'_>) -> bool {
    !path.is_travel_path()
        && path.space_fill_type == SpaceFillType::Lines
        && !path.skip_agressive_merge_hint
        && !path.spiralize
        && !path.points.is_empty()
}

///Whether the travel gap and the second extrusion stay on the line carried
///by the first extrusion, within half a line width.
fn collinear_with(
    prev: &crate::path::GCodePath<'_>,
    prev_start: Point2,
    travel_points: &[Point2],
    next_points: &[Point2],
) -> bool {
    let Some(&prev_end) = prev.points.last() else {
        return false;
    };
    let carrier_end = next_points.last().copied().unwrap_or(prev_end);
    let tolerance = (prev.config.line_width / 2).max(1);
    travel_points
        .iter()
        .chain(next_points.iter())
        .chain(std::iter::once(&prev_start))
        .all(|&p| {
            let on_line = closest_point_on_segment(prev_start, carrier_end, p);
            (p - on_line).vsize2() <= tolerance * tolerance
        })
}

fn polyline_length_mm(start: Point2, points: &[Point2]) -> Result<f64, PlannerError> {
    let mut total: i64 = 0;
    let mut previous = start;
    for &point in points {
        let segment = (point - previous).vsize();
        total = total
            .checked_add(segment)
            .ok_or(PlannerError::NumericOverflow {
                context: "accumulating merged line lengths",
            })?;
        previous = point;
    }
    Ok(microns_to_mm(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GCodePathConfig, PrintFeatureType, SpeedDerivatives};
    use crate::path::GCodePath;
    use crate::settings::{FanSpeedLayerTimeSettings, RetractionConfig};

    fn extrusion_config() -> GCodePathConfig {
        GCodePathConfig::new(
            PrintFeatureType::Infill,
            400,
            100,
            1.0,
            SpeedDerivatives::new(50.0, 1000.0, 10.0),
        )
    }

    fn travel_config() -> GCodePathConfig {
        GCodePathConfig::travel(
            PrintFeatureType::MoveCombing,
            SpeedDerivatives::new(120.0, 5000.0, 30.0),
        )
    }

    fn plan_with<'cfg>(
        retraction: &'cfg RetractionConfig,
        paths: Vec<GCodePath<'cfg>>,
    ) -> ExtruderPlan<'cfg> {
        let mut plan = ExtruderPlan::new(
            0,
            Point2::new(0, 0),
            10,
            false,
            false,
            100,
            FanSpeedLayerTimeSettings::default(),
            retraction,
        );
        plan.paths = paths;
        plan
    }

    fn extrusion<'cfg>(config: &'cfg GCodePathConfig, to: Point2) -> GCodePath<'cfg> {
        let mut path = GCodePath::new(config, None, SpaceFillType::Lines, 1.0, false, 1.0);
        path.points.push(to);
        path
    }

    fn travel<'cfg>(config: &'cfg GCodePathConfig, to: Point2) -> GCodePath<'cfg> {
        let mut path = GCodePath::new(config, None, SpaceFillType::None, 0.0, false, 1.0);
        path.points.push(to);
        path
    }

    fn total_volume(plan: &ExtruderPlan<'_>) -> f64 {
        let mut position = plan.start_position;
        let mut volume = 0.0;
        for path in &plan.paths {
            for &p in &path.points {
                volume += (p - position).vsize_mm() * path.extrusion_mm3_per_mm();
                position = p;
            }
        }
        volume
    }

    #[test]
    fn collinear_lines_with_short_gaps_merge() {
        let extrusion_config = extrusion_config();
        let travel_config = travel_config();
        let retraction = RetractionConfig::default();
        let mut plan = plan_with(
            &retraction,
            vec![
                extrusion(&extrusion_config, Point2::new(10_000, 0)),
                travel(&travel_config, Point2::new(10_500, 0)),
                extrusion(&extrusion_config, Point2::new(20_000, 0)),
            ],
        );
        let volume_before = total_volume(&plan);
        let changed = merge_infill_lines(&mut plan, 1000).unwrap();
        assert!(changed);
        assert_eq!(plan.paths.len(), 1);
        let volume_after = total_volume(&plan);
        assert!(
            (volume_before - volume_after).abs() <= 0.01 * 0.4_f64.powi(3),
            "volume must be preserved: {} vs {}",
            volume_before,
            volume_after
        );
    }

    #[test]
    fn long_gaps_do_not_merge() {
        let extrusion_config = extrusion_config();
        let travel_config = travel_config();
        let retraction = RetractionConfig::default();
        let mut plan = plan_with(
            &retraction,
            vec![
                extrusion(&extrusion_config, Point2::new(10_000, 0)),
                travel(&travel_config, Point2::new(15_000, 0)),
                extrusion(&extrusion_config, Point2::new(20_000, 0)),
            ],
        );
        assert!(!merge_infill_lines(&mut plan, 1000).unwrap());
        assert_eq!(plan.paths.len(), 3);
    }

    #[test]
    fn out_of_line_extrusions_do_not_merge() {
        let extrusion_config = extrusion_config();
        let travel_config = travel_config();
        let retraction = RetractionConfig::default();
        let mut plan = plan_with(
            &retraction,
            vec![
                extrusion(&extrusion_config, Point2::new(10_000, 0)),
                travel(&travel_config, Point2::new(10_500, 900)),
                extrusion(&extrusion_config, Point2::new(20_000, 900)),
            ],
        );
        assert!(!merge_infill_lines(&mut plan, 1000).unwrap());
    }

    #[test]
    fn skip_hint_is_respected() {
        let extrusion_config = extrusion_config();
        let travel_config = travel_config();
        let retraction = RetractionConfig::default();
        let mut first = extrusion(&extrusion_config, Point2::new(10_000, 0));
        first.skip_agressive_merge_hint = true;
        let mut plan = plan_with(
            &retraction,
            vec![
                first,
                travel(&travel_config, Point2::new(10_500, 0)),
                extrusion(&extrusion_config, Point2::new(20_000, 0)),
            ],
        );
        assert!(!merge_infill_lines(&mut plan, 1000).unwrap());
        assert_eq!(plan.paths.len(), 3);
    }

    #[test]
    fn chains_collapse_into_one_line() {
        let extrusion_config = extrusion_config();
        let travel_config = travel_config();
        let retraction = RetractionConfig::default();
        let mut plan = plan_with(
            &retraction,
            vec![
                extrusion(&extrusion_config, Point2::new(5000, 0)),
                travel(&travel_config, Point2::new(5400, 0)),
                extrusion(&extrusion_config, Point2::new(10_000, 0)),
                travel(&travel_config, Point2::new(10_400, 0)),
                extrusion(&extrusion_config, Point2::new(15_000, 0)),
            ],
        );
        let volume_before = total_volume(&plan);
        assert!(merge_infill_lines(&mut plan, 1000).unwrap());
        assert_eq!(plan.paths.len(), 1);
        assert!((total_volume(&plan) - volume_before).abs() <= 0.01 * 0.4_f64.powi(3));
    }
}
