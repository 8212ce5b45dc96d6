use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::config::GCodePathConfig;
use crate::geometry::{Coord, Point2};

///The strategy with which an area is occupied with filament. Walls are
///Polygons, zigzag infill is PolyLines, grid and line infill is Lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceFillType {
    None,
    Polygons,
    PolyLines,
    Lines,
}

///Time and material estimates for a portion of paths: a path, an extruder
///plan or a whole layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeMaterialEstimates {
    ///Time in seconds occupied by extrusion.
    pub extrude_time: f64,
    ///Time in seconds occupied by non-retracted travel.
    pub unretracted_travel_time: f64,
    ///Time in seconds occupied by retracted travel.
    pub retracted_travel_time: f64,
    ///Material used, in mm^3.
    pub material: f64,
}

impl TimeMaterialEstimates {
    pub fn new(
        extrude_time: f64,
        unretracted_travel_time: f64,
        retracted_travel_time: f64,
        material: f64,
    ) -> Self {
        TimeMaterialEstimates {
            extrude_time,
            unretracted_travel_time,
            retracted_travel_time,
            material,
        }
    }

    pub fn reset(&mut self) {
        *self = TimeMaterialEstimates::default();
    }

    pub fn total_time(&self) -> f64 {
        self.extrude_time + self.unretracted_travel_time + self.retracted_travel_time
    }

    ///Total time during which the head is not retracted.
    pub fn total_unretracted_time(&self) -> f64 {
        self.extrude_time + self.unretracted_travel_time
    }

    pub fn travel_time(&self) -> f64 {
        self.retracted_travel_time + self.unretracted_travel_time
    }

    pub fn extrude_time(&self) -> f64 {
        self.extrude_time
    }

    pub fn material(&self) -> f64 {
        self.material
    }
}

impl Add for TimeMaterialEstimates {
    type Output = TimeMaterialEstimates;
    fn add(self, other: TimeMaterialEstimates) -> TimeMaterialEstimates {
        TimeMaterialEstimates::new(
            self.extrude_time + other.extrude_time,
            self.unretracted_travel_time + other.unretracted_travel_time,
            self.retracted_travel_time + other.retracted_travel_time,
            self.material + other.material,
        )
    }
}

impl AddAssign for TimeMaterialEstimates {
    fn add_assign(&mut self, other: TimeMaterialEstimates) {
        *self = *self + other;
    }
}

impl Sub for TimeMaterialEstimates {
    type Output = TimeMaterialEstimates;
    fn sub(self, other: TimeMaterialEstimates) -> TimeMaterialEstimates {
        TimeMaterialEstimates::new(
            self.extrude_time - other.extrude_time,
            self.unretracted_travel_time - other.unretracted_travel_time,
            self.retracted_travel_time - other.retracted_travel_time,
            self.material - other.material,
        )
    }
}

impl SubAssign for TimeMaterialEstimates {
    fn sub_assign(&mut self, other: TimeMaterialEstimates) {
        *self = *self - other;
    }
}

///One contiguous segment of planned output: several line segments of the
///same kind of movement sharing one config.
///
///This is a compact premature representation; per-segment properties are
///added when the paths are processed into printer commands downstream.
#[derive(Clone, Debug)]
pub struct GCodePath<'cfg> {
    ///The configuration settings of the path, borrowed from the per-mesh
    ///config table that outlives the plan.
    pub config: &'cfg GCodePathConfig,
    ///Which mesh this path belongs to, if any.
    pub mesh_id: Option<String>,
    pub space_fill_type: SpaceFillType,
    ///A type independent flow multiplier on top of the config flow.
    pub flow: f64,
    ///A factor the speed is multiplied with for this path.
    pub speed_factor: f64,
    ///The factor the non-travel speed is multiplied with as a consequence of
    ///back pressure compensation.
    pub speed_back_pressure_factor: f64,
    ///Whether the path is a travel path preceded by a retraction move.
    pub retract: bool,
    ///Whether the last move of the path should be preceded by an
    ///unretraction. Used to unretract in the last travel move before an
    ///outer wall, so the prime blob lands before the wall instead of on it.
    pub unretract_before_last_travel_move: bool,
    ///Whether to perform a z hop in this path, which must be a travel path.
    pub perform_z_hop: bool,
    ///Whether this path is preceded by a prime (blob).
    pub perform_prime: bool,
    ///Whether this path needs to skip aggressive merging if any travel paths
    ///are in between the extrusions.
    pub skip_agressive_merge_hint: bool,
    ///The points constituting this path, after a conceptual pen-down at the
    ///first point.
    pub points: Vec<Point2>,
    ///Path is finished; a new path should be started instead of appending.
    pub done: bool,
    ///Whether to gradually increment the z position during this path. A
    ///sequence of spiralized paths rises exactly one layer.
    pub spiralize: bool,
    ///Fan speed override for this path, within 0-100; inherit from the
    ///config otherwise.
    pub fan_speed: Option<f64>,
    ///Naive time and material estimates.
    pub estimates: TimeMaterialEstimates,
}

impl<'cfg> GCodePath<'cfg> {
    pub fn new(
        config: &'cfg GCodePathConfig,
        mesh_id: Option<String>,
        space_fill_type: SpaceFillType,
        flow: f64,
        spiralize: bool,
        speed_factor: f64,
    ) -> Self {
        GCodePath {
            config,
            mesh_id,
            space_fill_type,
            flow,
            speed_factor,
            speed_back_pressure_factor: 1.0,
            retract: false,
            unretract_before_last_travel_move: false,
            perform_z_hop: false,
            perform_prime: false,
            skip_agressive_merge_hint: false,
            points: Vec::new(),
            done: false,
            spiralize,
            fan_speed: None,
            estimates: TimeMaterialEstimates::default(),
        }
    }

    pub fn is_travel_path(&self) -> bool {
        self.config.is_travel_path()
    }

    ///The material flow in mm^3 per mm traversed.
    pub fn extrusion_mm3_per_mm(&self) -> f64 {
        self.flow * self.config.extrusion_mm3_per_mm()
    }

    ///The fan speed for this path: the override when within 0-100, the
    ///config value otherwise.
    pub fn fan_speed(&self) -> f64 {
        match self.fan_speed {
            Some(fan_speed) if (0.0..=100.0).contains(&fan_speed) => fan_speed,
            _ => self.config.fan_speed,
        }
    }

    ///Total traversed length of this path starting from `from`, in microns.
    pub fn length_from(&self, from: Point2) -> Coord {
        let mut total = 0;
        let mut previous = from;
        for &point in &self.points {
            total += (point - previous).vsize();
            previous = point;
        }
        total
    }
}

///A junction of a variable-width wall: a position, the width of the wall at
///that position, and the perimeter it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtrusionJunction {
    pub p: Point2,
    ///The width of the wall at this junction, in microns.
    pub w: Coord,
    ///Which perimeter this junction is part of; counts from the outer wall.
    pub perimeter_index: usize,
}

impl ExtrusionJunction {
    pub fn new(p: Point2, w: Coord, perimeter_index: usize) -> Self {
        ExtrusionJunction { p, w, perimeter_index }
    }
}

///A variable-width wall toolpath: an ordered sequence of junctions, either a
///closed loop or an open polyline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtrusionLine {
    pub junctions: Vec<ExtrusionJunction>,
    pub is_closed: bool,
    ///The inset this line sits at; inset 0 is the outermost wall.
    pub inset_index: usize,
    ///Odd lines are gap fillers: single traces between walls rather than
    ///proper wall loops. They print after the enclosing walls.
    pub is_odd: bool,
}

impl ExtrusionLine {
    pub fn new(junctions: Vec<ExtrusionJunction>, is_closed: bool, inset_index: usize) -> Self {
        ExtrusionLine {
            junctions,
            is_closed,
            inset_index,
            is_odd: false,
        }
    }

    pub fn len(&self) -> usize {
        self.junctions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.junctions.is_empty()
    }

    pub fn first_point(&self) -> Option<Point2> {
        self.junctions.first().map(|j| j.p)
    }

    pub fn last_point(&self) -> Option<Point2> {
        self.junctions.last().map(|j| j.p)
    }

    ///The widest junction of the line.
    pub fn max_width(&self) -> Coord {
        self.junctions.iter().map(|j| j.w).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PrintFeatureType, SpeedDerivatives};

    #[test]
    fn travel_path_extrudes_nothing() {
        let travel_config = GCodePathConfig::travel(
            PrintFeatureType::MoveCombing,
            SpeedDerivatives::new(120.0, 5000.0, 30.0),
        );
        let path = GCodePath::new(&travel_config, None, SpaceFillType::None, 0.0, false, 1.0);
        assert!(path.is_travel_path());
        assert_eq!(path.extrusion_mm3_per_mm(), 0.0);
    }

    #[test]
    fn fan_speed_override_must_be_in_range() {
        let config = GCodePathConfig::new(
            PrintFeatureType::Skin,
            400,
            100,
            1.0,
            SpeedDerivatives::new(30.0, 1000.0, 10.0),
        )
        .with_fan_speed(70.0);
        let mut path = GCodePath::new(&config, None, SpaceFillType::Lines, 1.0, false, 1.0);
        assert_eq!(path.fan_speed(), 70.0);
        path.fan_speed = Some(55.0);
        assert_eq!(path.fan_speed(), 55.0);
        path.fan_speed = Some(250.0);
        assert_eq!(path.fan_speed(), 70.0);
    }

    #[test]
    fn estimates_add_up() {
        let a = TimeMaterialEstimates::new(1.0, 2.0, 3.0, 4.0);
        let b = TimeMaterialEstimates::new(0.5, 0.5, 0.5, 0.5);
        let sum = a + b;
        assert_eq!(sum.total_time(), 7.5);
        assert_eq!(sum.travel_time(), 6.0);
        assert_eq!((sum - b).material(), 4.0);
    }
}
