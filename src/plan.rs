use itertools::Itertools;
use log::warn;

use crate::comb::Comb;
use crate::config::{GCodePathConfig, PathConfigStorage};
use crate::error::PlannerError;
use crate::geometry::{shorter_than, Coord, Point2, Polygon, PolygonSet};
use crate::inset_order;
use crate::order::{monotonic_ordering, PathOrderOptimizer};
use crate::path::{ExtrusionLine, GCodePath, SpaceFillType, TimeMaterialEstimates};
use crate::settings::{
    FanSpeedLayerTimeSettings, RetractionConfig, Settings, WallOrderConfig, ZSeamConfig,
};

///A nozzle temperature command to be inserted in between the paths of an
///extruder plan.
#[derive(Clone, Debug, PartialEq)]
pub struct NozzleTempInsert {
    ///The command is inserted before the path at this index.
    pub path_idx: usize,
    pub extruder: usize,
    pub temperature: f64,
    ///Whether the printer should wait for the temperature to be reached.
    pub wait: bool,
}

///An extruder plan contains all planned paths pertaining to a single
///extruder train, with temperature command inserts in between.
pub struct ExtruderPlan<'cfg> {
    ///The extruder used for the paths in this plan.
    pub extruder_nr: usize,
    ///The paths planned for this extruder.
    pub paths: Vec<GCodePath<'cfg>>,
    inserts: Vec<NozzleTempInsert>,

    ///The required temperature at the start of this extruder plan, or the
    ///temperature to heat to gradually over the layer change between this
    ///plan and the previous plan with the same extruder.
    pub required_start_temperature: f64,
    ///The normal printing temperature of this plan; none if the plan has no
    ///extrusion moves.
    pub extrusion_temperature: Option<f64>,
    ///The standby temperature for the previous extruder, when this plan
    ///switched away from it.
    pub prev_extruder_standby_temp: Option<f64>,

    ///The position the head was at before starting this extruder plan.
    pub start_position: Point2,
    layer_nr: i64,
    is_initial_layer: bool,
    is_raft_layer: bool,
    pub layer_thickness: Coord,

    fan_speed_layer_time_settings: FanSpeedLayerTimeSettings,
    retraction_config: &'cfg RetractionConfig,

    ///The factor by which to alter the extrusion move speed, for printing
    ///slower than normal.
    extrude_speed_factor: f64,
    travel_speed_factor: f64,
    ///Extra waiting time at the end of this plan so the layer can cool.
    extra_time: f64,
    ///The total naive time estimate for this extruder plan.
    total_print_time: f64,
    ///The fan speed to be used during this plan, in percent.
    fan_speed: f64,
    ///Accumulated estimates for all planned paths within this plan.
    pub estimates: TimeMaterialEstimates,
}

impl<'cfg> ExtruderPlan<'cfg> {
    pub fn new(
        extruder_nr: usize,
        start_position: Point2,
        layer_nr: i64,
        is_initial_layer: bool,
        is_raft_layer: bool,
        layer_thickness: Coord,
        fan_speed_layer_time_settings: FanSpeedLayerTimeSettings,
        retraction_config: &'cfg RetractionConfig,
    ) -> Self {
        ExtruderPlan {
            extruder_nr,
            paths: Vec::new(),
            inserts: Vec::new(),
            required_start_temperature: 0.0,
            extrusion_temperature: None,
            prev_extruder_standby_temp: None,
            start_position,
            layer_nr,
            is_initial_layer,
            is_raft_layer,
            layer_thickness,
            fan_speed_layer_time_settings,
            retraction_config,
            extrude_speed_factor: 1.0,
            travel_speed_factor: 1.0,
            extra_time: 0.0,
            total_print_time: 0.0,
            fan_speed: 0.0,
            estimates: TimeMaterialEstimates::default(),
        }
    }

    pub fn is_initial_layer(&self) -> bool {
        self.is_initial_layer
    }

    pub fn is_raft_layer(&self) -> bool {
        self.is_raft_layer
    }

    pub fn retraction_config(&self) -> &'cfg RetractionConfig {
        self.retraction_config
    }

    ///Add a new temperature command insert.
    pub fn insert_command(&mut self, insert: NozzleTempInsert) {
        self.inserts.push(insert);
    }

    ///The temperature command inserts, sorted by target path index.
    pub fn sorted_inserts(&mut self) -> &[NozzleTempInsert] {
        self.inserts.sort_by_key(|insert| insert.path_idx);
        &self.inserts
    }

    pub fn has_inserts(&self) -> bool {
        !self.inserts.is_empty()
    }

    pub fn set_extrude_speed_factor(&mut self, speed_factor: f64) {
        self.extrude_speed_factor = speed_factor;
    }

    pub fn extrude_speed_factor(&self) -> f64 {
        self.extrude_speed_factor
    }

    ///Travel is never slowed down below its configured speed.
    pub fn set_travel_speed_factor(&mut self, speed_factor: f64) {
        self.travel_speed_factor = speed_factor.max(1.0);
    }

    pub fn travel_speed_factor(&self) -> f64 {
        self.travel_speed_factor
    }

    ///The fan speed computed by
    ///[`ExtruderPlan::process_fan_speed_and_minimal_layer_time`].
    pub fn fan_speed(&self) -> f64 {
        self.fan_speed
    }

    pub fn set_fan_speed(&mut self, fan_speed: f64) {
        self.fan_speed = fan_speed;
    }

    ///The dwell needed at the end of this plan to meet the minimum layer
    ///time when slowing down was bounded by the minimum speed.
    pub fn extra_time(&self) -> f64 {
        self.extra_time
    }

    pub fn total_print_time(&self) -> f64 {
        self.total_print_time
    }

    ///The position the head ends at after this plan, if any move was made.
    pub fn last_position(&self) -> Option<Point2> {
        self.paths
            .iter()
            .rev()
            .find_map(|path| path.points.last().copied())
    }

    ///Compute naive per-path time and material estimates: no slowdown at
    ///corners, just segment length over speed. Retraction flanks put half
    ///the retract/unretract time on either side.
    pub fn compute_naive_time_estimates(
        &mut self,
        starting_position: Point2,
    ) -> TimeMaterialEstimates {
        self.estimates.reset();
        let mut p0 = starting_position;
        let mut was_retracted = false;
        for path in &mut self.paths {
            path.estimates.reset();
            let is_extrusion_path = !path.is_travel_path();
            if !is_extrusion_path && path.retract != was_retracted {
                // retraction or unretraction happens at this flank
                let retract_unretract_time = if path.retract {
                    self.retraction_config.distance / self.retraction_config.speed
                } else {
                    self.retraction_config.distance / self.retraction_config.prime_speed
                };
                path.estimates.retracted_travel_time += 0.5 * retract_unretract_time;
                path.estimates.unretracted_travel_time += 0.5 * retract_unretract_time;
                was_retracted = path.retract;
            }
            let speed = if is_extrusion_path {
                path.config.speed() * path.speed_factor * path.speed_back_pressure_factor
            } else {
                path.config.speed() * path.speed_factor
            };
            for &p1 in &path.points {
                let length_mm = (p1 - p0).vsize_mm();
                if is_extrusion_path {
                    path.estimates.material += length_mm * path.extrusion_mm3_per_mm();
                    path.estimates.extrude_time += length_mm / speed;
                } else if path.retract {
                    path.estimates.retracted_travel_time += length_mm / speed;
                } else {
                    path.estimates.unretracted_travel_time += length_mm / speed;
                }
                p0 = p1;
            }
            self.estimates += path.estimates;
        }
        self.estimates
    }

    ///Force the minimal layer time by slowing the extrusion moves down,
    ///bounded below by `minimal_speed`; time that cannot be recovered by
    ///slowing down becomes a dwell at the end of the plan.
    fn force_minimal_layer_time(
        &mut self,
        min_time: f64,
        minimal_speed: f64,
        travel_time: f64,
        extrude_time: f64,
    ) {
        let total_time = travel_time + extrude_time;
        if total_time >= min_time || extrude_time <= 0.0 {
            self.total_print_time = total_time;
            return;
        }
        let min_extrude_time = (min_time - travel_time).max(1.0);
        let mut factor = extrude_time / min_extrude_time;
        for path in &self.paths {
            if path.is_travel_path() {
                continue;
            }
            let speed = path.config.speed() * factor;
            if speed < minimal_speed {
                factor = minimal_speed / path.config.speed();
            }
        }

        // only slow down when that is actually slower
        if factor < 1.0 {
            self.set_extrude_speed_factor(factor);
        } else {
            factor = 1.0;
        }

        let inv_factor = 1.0 / factor;
        self.estimates.extrude_time *= inv_factor;
        for path in &mut self.paths {
            path.estimates.extrude_time *= inv_factor;
        }

        if min_time - (extrude_time * inv_factor) - travel_time > 0.1 {
            self.extra_time = min_time - (extrude_time * inv_factor) - travel_time;
        }
        self.total_print_time = (extrude_time * inv_factor) + travel_time;
    }

    ///Apply the speed corrections for the minimal layer time and determine
    ///the fan speed. Resets the factors it computes first, so a second
    ///invocation with unchanged inputs yields the same plan.
    pub fn process_fan_speed_and_minimal_layer_time(
        &mut self,
        force_minimal_layer_time: bool,
        starting_position: Point2,
    ) {
        self.extrude_speed_factor = 1.0;
        self.extra_time = 0.0;
        let fsml = self.fan_speed_layer_time_settings.clone();
        let estimates = self.compute_naive_time_estimates(starting_position);
        self.total_print_time = estimates.total_time();
        if force_minimal_layer_time {
            self.force_minimal_layer_time(
                fsml.cool_min_layer_time,
                fsml.cool_min_speed,
                estimates.travel_time(),
                estimates.extrude_time(),
            );
        }

        // interpolate the fan speed between the regular and the maximum fan
        // speed, over the band between the two layer time thresholds
        self.fan_speed = fsml.cool_fan_speed_min;
        let total_layer_time = estimates.unretracted_travel_time + estimates.extrude_time;
        if force_minimal_layer_time && total_layer_time < fsml.cool_min_layer_time {
            self.fan_speed = fsml.cool_fan_speed_max;
        } else if fsml.cool_min_layer_time_fan_speed_max > fsml.cool_min_layer_time
            && force_minimal_layer_time
            && total_layer_time < fsml.cool_min_layer_time_fan_speed_max
        {
            let fan_speed_diff = fsml.cool_fan_speed_max - fsml.cool_fan_speed_min;
            let layer_time_diff =
                fsml.cool_min_layer_time_fan_speed_max - fsml.cool_min_layer_time;
            let fraction_of_slope =
                (total_layer_time - fsml.cool_min_layer_time) / layer_time_diff;
            self.fan_speed = fsml.cool_fan_speed_max - fan_speed_diff * fraction_of_slope;
        }

        if self.layer_nr < fsml.cool_fan_full_layer && fsml.cool_fan_full_layer > 0 {
            // ramp the fan up over the first layers, starting from the
            // initial-layer fan speed at layer zero
            let layer_nr = self.layer_nr.max(0);
            self.fan_speed = fsml.cool_fan_speed_0
                + (self.fan_speed - fsml.cool_fan_speed_0) * layer_nr as f64
                    / fsml.cool_fan_full_layer as f64;
        }
    }

    ///Adjust the outflow of every extrusion path so the pressure between
    ///the nozzle and the last printed layer is compensated for. A
    ///compensation factor of zero is a no-op.
    pub fn apply_back_pressure_compensation(&mut self, back_pressure_compensation: f64) {
        const EPSILON_SPEED_FACTOR: f64 = 0.001;
        for path in &mut self.paths {
            if path.is_travel_path() || path.config.is_bridge_path {
                continue;
            }
            // the flow in mm^3/s relative to the config's nominal flow
            let relative_flow = path.flow * path.speed_factor;
            path.speed_back_pressure_factor = (1.0
                + (relative_flow - 1.0) * back_pressure_compensation)
                .max(EPSILON_SPEED_FACTOR);
        }
    }
}

///Per-extruder values read from the settings map once, at plan
///construction, so the add operations stay infallible.
#[derive(Clone, Debug)]
struct ExtruderPlanningSettings {
    ///Travels shorter than this bypass combing, retraction and hopping.
    nozzle_tip_outer_diameter: Coord,
    ///How far to move inside the boundary before an uncombed retraction.
    move_inside_line_width: Coord,
}

impl ExtruderPlanningSettings {
    fn from_settings(settings: &Settings) -> Result<Self, PlannerError> {
        let wall_line_count = settings.get_count("wall_line_count")?;
        let move_inside_line_width = if wall_line_count > 1 {
            settings.get_microns("wall_line_width_x")?
        } else {
            settings.get_microns("wall_line_width_0")?
        };
        Ok(ExtruderPlanningSettings {
            nozzle_tip_outer_diameter: settings.get_microns("machine_nozzle_tip_outer_diameter")?,
            move_inside_line_width,
        })
    }
}

///Everything needed to start planning one layer.
pub struct LayerSetup<'cfg> {
    ///May be negative for raft layers.
    pub layer_nr: i64,
    pub z: Coord,
    pub layer_thickness: Coord,
    pub is_initial_layer: bool,
    pub is_raft_layer: bool,
    pub start_extruder: usize,
    ///The position the head is at when the layer starts.
    pub start_position: Point2,
    ///Whether the head starts out inside a layer part.
    pub start_is_inside: bool,
    pub configs: &'cfg PathConfigStorage,
    pub fan_speed_layer_time_settings_per_extruder: Vec<FanSpeedLayerTimeSettings>,
    ///The boundary to move into when retracting, and to comb within as a
    ///fallback.
    pub comb_boundary_minimum: PolygonSet,
    ///The boundary preferably combed within.
    pub comb_boundary_preferred: PolygonSet,
    ///The boundary to route along for travels through air, when available.
    pub comb_avoid_boundary: Option<PolygonSet>,
    ///The outline offset the comb boundaries were built with.
    pub comb_offset_from_outlines: Coord,
    ///How far to move comb points inside when the minimum boundary is used.
    pub comb_move_inside_distance: Coord,
    ///The user specified layer start position, per extruder.
    pub layer_start_positions: Vec<Point2>,
}

///The planned moves of one layer: a mutable, extruder-partitioned buffer of
///extrusion and travel segments. It facilitates combing to keep the head
///inside the print and tracks the per-plan time estimates so the cooling
///pass can enforce the minimal layer time.
pub struct LayerPlan<'cfg> {
    pub layer_nr: i64,
    pub z: Coord,
    pub layer_thickness: Coord,
    pub is_initial_layer: bool,
    pub is_raft_layer: bool,
    ///Whether to give every new path the skip_agressive_merge_hint.
    pub mode_skip_agressive_merge: bool,

    configs: &'cfg PathConfigStorage,
    planning_settings: Vec<ExtruderPlanningSettings>,
    fan_speed_layer_time_settings_per_extruder: Vec<FanSpeedLayerTimeSettings>,

    ///Always contains at least one ExtruderPlan; extruder switches happen
    ///only at plan boundaries and no two adjacent plans share an extruder.
    extruder_plans: Vec<ExtruderPlan<'cfg>>,

    last_planned_position: Option<Point2>,
    first_travel_destination: Option<Point2>,
    first_travel_destination_is_inside: bool,
    ///Whether the last planned move ended inside a layer part.
    was_inside: bool,
    ///Whether the next planned destination is inside a layer part.
    is_inside: bool,
    current_mesh: Option<String>,

    comb_boundary_minimum: PolygonSet,
    comb_boundary_preferred: PolygonSet,
    comb: Option<Comb>,
    comb_move_inside_distance: Coord,

    ///Unsupported regions of the current part that need bridging.
    bridge_wall_mask: PolygonSet,
    ///Regions of the current part where the walls overhang.
    overhang_mask: PolygonSet,

    skirt_brim_is_planned: Vec<bool>,
    prime_tower_is_planned: Vec<bool>,
    layer_start_pos_per_extruder: Vec<Point2>,
    last_extruder_previous_layer: usize,

    ///Set once the cooling pass ran; the plan may no longer be mutated.
    frozen: bool,
    ///How many recoverable geometry problems were dropped while planning.
    recovered_warnings: u32,
}

impl<'cfg> LayerPlan<'cfg> {
    pub fn new(setup: LayerSetup<'cfg>) -> Result<Self, PlannerError> {
        let extruder_count = setup.configs.extruder_count();
        if extruder_count == 0 {
            return Err(PlannerError::InternalInvariant(
                "a layer plan needs at least one configured extruder".to_string(),
            ));
        }
        if setup.start_extruder >= extruder_count
            || setup.fan_speed_layer_time_settings_per_extruder.len() != extruder_count
            || setup.layer_start_positions.len() != extruder_count
        {
            return Err(PlannerError::InternalInvariant(format!(
                "inconsistent extruder tables for layer {}",
                setup.layer_nr
            )));
        }
        let planning_settings = setup
            .configs
            .settings_per_extruder
            .iter()
            .map(ExtruderPlanningSettings::from_settings)
            .collect::<Result<Vec<_>, _>>()?;

        let combing_mode = setup.configs.retraction_config_per_extruder[setup.start_extruder]
            .combing;
        let comb = if combing_mode != crate::settings::CombingMode::Off
            && !setup.comb_boundary_preferred.is_empty()
        {
            Some(Comb::new(
                setup.comb_boundary_minimum.clone(),
                setup.comb_boundary_preferred.clone(),
                setup.comb_avoid_boundary,
                setup.comb_offset_from_outlines,
                setup.comb_move_inside_distance,
            ))
        } else {
            None
        };

        let first_plan = ExtruderPlan::new(
            setup.start_extruder,
            setup.start_position,
            setup.layer_nr,
            setup.is_initial_layer,
            setup.is_raft_layer,
            setup.layer_thickness,
            setup.fan_speed_layer_time_settings_per_extruder[setup.start_extruder].clone(),
            &setup.configs.retraction_config_per_extruder[setup.start_extruder],
        );

        Ok(LayerPlan {
            layer_nr: setup.layer_nr,
            z: setup.z,
            layer_thickness: setup.layer_thickness,
            is_initial_layer: setup.is_initial_layer,
            is_raft_layer: setup.is_raft_layer,
            mode_skip_agressive_merge: false,
            configs: setup.configs,
            planning_settings,
            fan_speed_layer_time_settings_per_extruder: setup
                .fan_speed_layer_time_settings_per_extruder,
            extruder_plans: vec![first_plan],
            last_planned_position: None,
            first_travel_destination: None,
            first_travel_destination_is_inside: false,
            was_inside: setup.start_is_inside,
            is_inside: false,
            current_mesh: None,
            comb_boundary_minimum: setup.comb_boundary_minimum,
            comb_boundary_preferred: setup.comb_boundary_preferred,
            comb,
            comb_move_inside_distance: setup.comb_move_inside_distance,
            bridge_wall_mask: PolygonSet::default(),
            overhang_mask: PolygonSet::default(),
            skirt_brim_is_planned: vec![false; extruder_count],
            prime_tower_is_planned: vec![false; extruder_count],
            layer_start_pos_per_extruder: setup.layer_start_positions,
            last_extruder_previous_layer: setup.start_extruder,
            frozen: false,
            recovered_warnings: 0,
        })
    }

    pub fn extruder(&self) -> usize {
        self.extruder_plans
            .last()
            .expect("a layer plan always has an extruder plan")
            .extruder_nr
    }

    pub fn extruder_plans(&self) -> &[ExtruderPlan<'cfg>] {
        &self.extruder_plans
    }

    pub fn extruder_plans_mut(&mut self) -> &mut [ExtruderPlan<'cfg>] {
        &mut self.extruder_plans
    }

    ///The last planned position, or the user specified layer start position
    ///when nothing was planned yet. That position might be outside of the
    ///build plate.
    pub fn last_planned_position_or_starting_position(&self) -> Point2 {
        self.last_planned_position
            .unwrap_or(self.layer_start_pos_per_extruder[self.extruder()])
    }

    pub fn last_planned_position(&self) -> Option<Point2> {
        self.last_planned_position
    }

    ///The destination of the first travel move of this layer, and whether
    ///it was inside a layer part. None while the layer is still empty.
    pub fn first_travel_destination_state(&self) -> Option<(Point2, bool)> {
        self.first_travel_destination
            .map(|destination| (destination, self.first_travel_destination_is_inside))
    }

    ///Whether the last planned position is inside a layer part.
    pub fn is_inside_mesh(&self) -> bool {
        self.was_inside
    }

    ///Set whether the next destination is inside a layer part. Walls, skin
    ///and infill count as inside; support and prime tower do not.
    pub fn set_is_inside(&mut self, is_inside: bool) {
        self.is_inside = is_inside;
    }

    ///Track the currently printing mesh.
    pub fn set_mesh(&mut self, mesh_id: impl Into<String>) {
        self.current_mesh = Some(mesh_id.into());
    }

    pub fn set_bridge_wall_mask(&mut self, mask: PolygonSet) {
        self.bridge_wall_mask = mask;
    }

    pub fn set_overhang_mask(&mut self, mask: PolygonSet) {
        self.overhang_mask = mask;
    }

    pub fn skirt_brim_is_planned(&self, extruder_nr: usize) -> bool {
        self.skirt_brim_is_planned[extruder_nr]
    }

    pub fn set_skirt_brim_is_planned(&mut self, extruder_nr: usize) {
        self.skirt_brim_is_planned[extruder_nr] = true;
    }

    pub fn prime_tower_is_planned(&self, extruder_nr: usize) -> bool {
        self.prime_tower_is_planned[extruder_nr]
    }

    pub fn set_prime_tower_is_planned(&mut self, extruder_nr: usize) {
        self.prime_tower_is_planned[extruder_nr] = true;
    }

    pub fn comb_boundary_minimum(&self) -> &PolygonSet {
        &self.comb_boundary_minimum
    }

    ///How many recoverable geometry problems were dropped while planning.
    pub fn recovered_warnings(&self) -> u32 {
        self.recovered_warnings
    }

    fn note_recovered(&mut self, error: &PlannerError) {
        debug_assert!(error.is_recoverable());
        warn!("layer {}: {}", self.layer_nr, error);
        self.recovered_warnings += 1;
    }

    ///Either extend the last path, when it was made with the same config
    ///and modifiers and is not done yet, or start a new one.
    fn get_latest_path_with_config(
        &mut self,
        config: &'cfg GCodePathConfig,
        space_fill_type: SpaceFillType,
        flow: f64,
        spiralize: bool,
        speed_factor: f64,
        fan_speed: Option<f64>,
    ) -> &mut GCodePath<'cfg> {
        assert!(!self.frozen, "the layer plan is frozen after the cooling pass");
        let mesh_id = self.current_mesh.clone();
        let skip_agressive_merge_hint = self.mode_skip_agressive_merge;
        let plan = self
            .extruder_plans
            .last_mut()
            .expect("a layer plan always has an extruder plan");
        let reusable = plan.paths.last().is_some_and(|path| {
            std::ptr::eq(path.config, config)
                && !path.done
                && path.flow == flow
                && path.speed_factor == speed_factor
                && path.spiralize == spiralize
                && path.fan_speed == fan_speed
                && path.mesh_id == mesh_id
        });
        if !reusable {
            let mut path = GCodePath::new(config, mesh_id, space_fill_type, flow, spiralize, speed_factor);
            path.fan_speed = fan_speed;
            path.skip_agressive_merge_hint = skip_agressive_merge_hint;
            plan.paths.push(path);
        }
        plan.paths.last_mut().expect("a path was just ensured")
    }

    ///Force the next path request to start a new path, e.g. when the
    ///content behind a shared config pointer changed.
    pub fn force_new_path_start(&mut self) {
        if let Some(path) = self
            .extruder_plans
            .last_mut()
            .and_then(|plan| plan.paths.last_mut())
        {
            path.done = true;
        }
    }

    ///Plan a switch to a new extruder. Returns whether the extruder
    ///changed; nothing happens when it is already the active one.
    pub fn set_extruder(&mut self, extruder_nr: usize) -> bool {
        if extruder_nr == self.extruder() {
            return false;
        }
        self.set_is_inside(false);
        let last_plan = self
            .extruder_plans
            .last_mut()
            .expect("a layer plan always has an extruder plan");
        if last_plan.paths.is_empty() && !last_plan.has_inserts() {
            // the first extruder plan of a layer is made with the extruder
            // of the previous layer and may simply be taken over
            last_plan.extruder_nr = extruder_nr;
            last_plan.fan_speed_layer_time_settings =
                self.fan_speed_layer_time_settings_per_extruder[extruder_nr].clone();
            last_plan.retraction_config = &self.configs.retraction_config_per_extruder[extruder_nr];
        } else {
            let start_position = self.last_planned_position_or_starting_position();
            self.extruder_plans.push(ExtruderPlan::new(
                extruder_nr,
                start_position,
                self.layer_nr,
                self.is_initial_layer,
                self.is_raft_layer,
                self.layer_thickness,
                self.fan_speed_layer_time_settings_per_extruder[extruder_nr].clone(),
                &self.configs.retraction_config_per_extruder[extruder_nr],
            ));
        }
        true
    }

    ///Append a straight travel without combing, continuing the last travel
    ///path when possible, and retract if the path was already retracting.
    pub fn add_travel_simple(&mut self, p: Point2) -> &GCodePath<'cfg> {
        let configs = self.configs;
        let travel_config = &configs.travel_config_per_extruder[self.extruder()];
        if self.last_planned_position.is_none() {
            self.first_travel_destination = Some(p);
            self.first_travel_destination_is_inside = self.is_inside;
        }
        let path =
            self.get_latest_path_with_config(travel_config, SpaceFillType::None, 0.0, false, 1.0, None);
        path.points.push(p);
        self.last_planned_position = Some(p);
        self.current_path()
    }

    fn current_path(&self) -> &GCodePath<'cfg> {
        self.extruder_plans
            .last()
            .and_then(|plan| plan.paths.last())
            .expect("a path was just planned")
    }

    ///How many retractions already happened within the configured window of
    ///recently extruded material.
    fn retraction_count_in_window(&self) -> usize {
        let plan = self
            .extruder_plans
            .last()
            .expect("a layer plan always has an extruder plan");
        let window = plan.retraction_config.extrusion_window;
        let mut count = 0;
        let mut extruded_mm3 = 0.0;
        for path in plan.paths.iter().rev() {
            if path.is_travel_path() {
                if path.retract {
                    count += 1;
                }
            } else {
                let length_mm: f64 = path
                    .points
                    .iter()
                    .tuple_windows()
                    .map(|(a, b)| (*b - *a).vsize_mm())
                    .sum();
                extruded_mm3 += length_mm * path.extrusion_mm3_per_mm();
                if extruded_mm3 > window {
                    break;
                }
            }
        }
        count
    }

    ///Travel to the boundary-inside point near the current position, so a
    ///retraction does not ooze on the outer wall.
    pub fn move_inside_comb_boundary(&mut self, distance: Coord) {
        let max_dist2 = 2000 * 2000; // when further than this, the position is not really inside
        let Some(p) = self.last_planned_position else {
            return;
        };
        if let Some((_, moved)) = self
            .comb_boundary_minimum
            .move_inside(p, distance, max_dist2)
        {
            if self.comb_boundary_minimum.inside(moved, true) && moved != p {
                self.add_travel_simple(moved);
                // any retraction must happen after this move, not before it
                self.force_new_path_start();
            }
        }
    }

    ///Travel to a point, with everything that entails: combing through the
    ///inside boundaries, the decision to retract, and the decision to hop.
    ///
    ///The first travel move of a layer is a bogus move without combing or
    ///retraction, to be fixed up by the downstream consumer.
    pub fn add_travel(&mut self, p: Point2, force_retract: bool) -> &GCodePath<'cfg> {
        let extruder = self.extruder();
        let configs = self.configs;
        let travel_config = &configs.travel_config_per_extruder[extruder];
        let retraction_config = &configs.retraction_config_per_extruder[extruder];

        let Some(last_position) = self.last_planned_position else {
            self.add_travel_simple(p);
            self.was_inside = self.is_inside;
            return self.current_path();
        };

        // destinations within one nozzle tip diameter are travelled to
        // directly, without combing, retraction or hop
        if shorter_than(
            p - last_position,
            self.planning_settings[extruder].nozzle_tip_outer_diameter,
        ) {
            self.add_travel_simple(p);
            self.was_inside = self.is_inside;
            return self.current_path();
        }

        let hop_enabled = retraction_config.z_hop_enabled;
        let retraction_enabled = retraction_config.enabled;
        let mut combed = false;

        if let Some(comb) = &self.comb {
            let fail_on_unavoidable_obstacles =
                hop_enabled && retraction_config.z_hop_only_when_collides;
            if let Some(comb_paths) = comb.calc(
                last_position,
                p,
                self.was_inside,
                self.is_inside,
                retraction_config.min_travel_distance,
                false,
                fail_on_unavoidable_obstacles,
            ) {
                combed = true;
                let mut retract = force_retract
                    || comb_paths.paths.len() > 1
                    || comb_paths.through_air
                    || comb_paths.crosses_boundary();
                if comb_paths.paths.len() == 1 {
                    let only = &comb_paths.paths[0];
                    if comb_paths.through_air
                        && !only.cross_boundary
                        && only.points.len() == 2
                        && only.points[0] == last_position
                        && only.points[1] == p
                    {
                        // support-to-support moves that cross nothing do not
                        // need to retract
                        retract = false;
                    }
                }
                if retraction_enabled {
                    if comb_paths.total_length() > retraction_config.combing_max_distance {
                        retract = true;
                    }
                } else {
                    retract = false;
                }
                if retract
                    && self.retraction_count_in_window() >= retraction_config.count_max
                {
                    retract = false;
                }

                let end_point_moved = comb_paths.end_point_moved;
                for comb_path in comb_paths.paths {
                    if comb_path.points.is_empty() {
                        continue;
                    }
                    // each comb segment becomes its own travel path
                    self.force_new_path_start();
                    let path = self.get_latest_path_with_config(
                        travel_config,
                        SpaceFillType::None,
                        0.0,
                        false,
                        1.0,
                        None,
                    );
                    if comb_path.through_air {
                        path.retract = retract;
                        path.perform_z_hop = retract
                            && hop_enabled
                            && (!retraction_config.z_hop_only_when_collides
                                || comb_path.cross_boundary);
                    } else if !comb_paths.through_air {
                        // a single-boundary comb carries its retract itself
                        path.retract = retract;
                    }
                    let last = *comb_path.points.last().expect("comb paths are not empty");
                    path.points.extend(comb_path.points);
                    self.last_planned_position = Some(last);
                }
                if retract && end_point_moved {
                    // the destination was moved onto an outer wall start:
                    // unretract on the approach, not at the wall itself
                    if let Some(path) = self
                        .extruder_plans
                        .last_mut()
                        .and_then(|plan| plan.paths.last_mut())
                    {
                        path.unretract_before_last_travel_move = true;
                    }
                }
            }
        }

        if !combed {
            // no combing at all? retract, unless the move is too short
            let long_enough = !shorter_than(
                p - last_position,
                retraction_config.min_travel_distance,
            );
            let mut retract = retraction_enabled && (force_retract || long_enough);
            if retract && self.retraction_count_in_window() >= retraction_config.count_max {
                retract = false;
            }
            if retract && self.was_inside {
                // move inside the part first, so oozing during the
                // retraction lands inside the print
                self.move_inside_comb_boundary(
                    self.planning_settings[extruder].move_inside_line_width,
                );
            }
            let collides = !self.comb_boundary_preferred.is_empty()
                && self
                    .comb_boundary_preferred
                    .collides_with_segment(self.last_planned_position.unwrap_or(last_position), p);
            self.force_new_path_start();
            let path = self.get_latest_path_with_config(
                travel_config,
                SpaceFillType::None,
                0.0,
                false,
                1.0,
                None,
            );
            path.retract = retract;
            path.perform_z_hop = retract
                && hop_enabled
                && (!retraction_config.z_hop_only_when_collides || collides);
        }

        self.add_travel_simple(p);
        self.was_inside = self.is_inside;
        self.current_path()
    }

    ///Plan a prime blob at the current location.
    pub fn plan_prime(&mut self) {
        self.force_new_path_start();
        let Some(p) = self.last_planned_position else {
            return;
        };
        self.add_travel_simple(p + Point2::new(0, 100));
        if let Some(path) = self
            .extruder_plans
            .last_mut()
            .and_then(|plan| plan.paths.last_mut())
        {
            path.retract = false;
            path.perform_prime = true;
        }
        self.force_new_path_start();
    }

    ///Add an extrusion move to a certain point, optionally with a flow and
    ///speed differing from the config.
    #[allow(clippy::too_many_arguments)]
    pub fn add_extrusion_move(
        &mut self,
        p: Point2,
        config: &'cfg GCodePathConfig,
        space_fill_type: SpaceFillType,
        flow: f64,
        spiralize: bool,
        speed_factor: f64,
        fan_speed: Option<f64>,
    ) {
        let path =
            self.get_latest_path_with_config(config, space_fill_type, flow, spiralize, speed_factor, fan_speed);
        path.points.push(p);
        self.last_planned_position = Some(p);
    }

    ///Add a closed polygon starting at the given vertex: travel there, lay
    ///the loop down, then optionally wipe along the printed perimeter to
    ///fuse the seam.
    #[allow(clippy::too_many_arguments)]
    pub fn add_polygon(
        &mut self,
        polygon: &Polygon,
        start_idx: usize,
        backwards: bool,
        config: &'cfg GCodePathConfig,
        wall_0_wipe_dist: Coord,
        spiralize: bool,
        flow_ratio: f64,
        always_retract: bool,
    ) {
        if polygon.len() < 3 {
            self.note_recovered(&PlannerError::GeometryDegenerate {
                reason: format!("closed polygon with {} vertices", polygon.len()),
            });
            return;
        }
        let n = polygon.len();
        let vertex = |i: usize| {
            if backwards {
                polygon[(start_idx + n - i % n) % n]
            } else {
                polygon[(start_idx + i) % n]
            }
        };
        self.add_travel(vertex(0), always_retract);
        for i in 1..n {
            self.add_extrusion_move(
                vertex(i),
                config,
                SpaceFillType::Polygons,
                flow_ratio,
                spiralize,
                1.0,
                None,
            );
        }
        // close the loop
        self.add_extrusion_move(
            vertex(0),
            config,
            SpaceFillType::Polygons,
            flow_ratio,
            spiralize,
            1.0,
            None,
        );

        if wall_0_wipe_dist > 0 {
            // wipe without extrusion along the printed perimeter
            let mut distance_traversed = 0;
            let mut p0 = vertex(0);
            for i in 1..=n {
                let p1 = vertex(i % n);
                let p0p1_dist = (p1 - p0).vsize();
                if distance_traversed + p0p1_dist >= wall_0_wipe_dist {
                    let remaining = wall_0_wipe_dist - distance_traversed;
                    let half_way = p0 + (p1 - p0).with_length(remaining);
                    self.add_travel_simple(half_way);
                    break;
                }
                self.add_travel_simple(p1);
                distance_traversed += p0p1_dist;
                p0 = p1;
            }
            self.force_new_path_start();
        }
    }

    ///Add polygons in an optimised order, starting near the last planned
    ///position (or the given start location).
    #[allow(clippy::too_many_arguments)]
    pub fn add_polygons_by_optimizer(
        &mut self,
        polygons: &PolygonSet,
        config: &'cfg GCodePathConfig,
        z_seam_config: &ZSeamConfig,
        wall_0_wipe_dist: Coord,
        spiralize: bool,
        flow_ratio: f64,
        always_retract: bool,
        reverse_order: bool,
        start_near_location: Option<Point2>,
    ) {
        if polygons.is_empty() {
            return;
        }
        let start =
            start_near_location.unwrap_or_else(|| self.last_planned_position_or_starting_position());
        let picks: Vec<(usize, usize)> = {
            let mut optimizer = PathOrderOptimizer::new(start, z_seam_config.clone());
            let mut source_indices = Vec::new();
            for (poly_idx, polygon) in polygons.iter().enumerate() {
                if polygon.len() < 3 {
                    continue; // reported by add_polygon when addressed directly
                }
                source_indices.push(poly_idx);
                optimizer.add_polygon(polygon);
            }
            optimizer.optimize();
            optimizer
                .order
                .iter()
                .map(|&i| (source_indices[i], optimizer.paths[i].start_index))
                .collect()
        };
        let picked: Vec<(usize, usize)> = if reverse_order {
            picks.into_iter().rev().collect()
        } else {
            picks
        };
        for (poly_idx, start_idx) in picked {
            self.add_polygon(
                &polygons[poly_idx],
                start_idx,
                false,
                config,
                wall_0_wipe_dist,
                spiralize,
                flow_ratio,
                always_retract,
            );
        }
    }

    ///Add a single wall line, splitting it according to the bridge and
    ///overhang masks: edges whose midpoint hangs over air print with the
    ///bridge config, overhung edges print slowed down, and the speed ramps
    ///back up after a bridge as pressure builds up again.
    #[allow(clippy::too_many_arguments)]
    fn add_wall_line(
        &mut self,
        p0: Point2,
        p1: Point2,
        flow: f64,
        width_flow: f64,
        non_bridge_config: &'cfg GCodePathConfig,
        bridge_config: &'cfg GCodePathConfig,
        overhang_speed_factor: f64,
        non_bridge_line_volume: &mut f64,
        speed_factor: &mut f64,
    ) {
        ///Pseudo-volume of non-bridge extrusion needed to regain full
        ///pressure (and speed) after a bridge.
        const PRESSURE_RECOVERY_VOLUME: f64 = 5.0;

        let midpoint = Point2::new((p0.x + p1.x) / 2, (p0.y + p1.y) / 2);
        let is_bridge =
            !self.bridge_wall_mask.is_empty() && self.bridge_wall_mask.inside(midpoint, true);
        let is_overhang =
            !self.overhang_mask.is_empty() && self.overhang_mask.inside(midpoint, true);

        if is_bridge {
            self.add_extrusion_move(
                p1,
                bridge_config,
                SpaceFillType::Polygons,
                flow * width_flow,
                false,
                1.0,
                None,
            );
            // the nozzle is depressurised after a bridge
            *non_bridge_line_volume = 0.0;
            *speed_factor = (bridge_config.speed() / non_bridge_config.speed()).min(1.0);
            return;
        }

        let segment_flow = flow * width_flow;
        let length_mm = (p1 - p0).vsize_mm();
        let segment_speed_factor = if is_overhang {
            overhang_speed_factor
        } else {
            // accelerate back to full speed proportional to the volume
            // extruded since the last bridge
            if *speed_factor < 1.0 {
                *speed_factor = (*speed_factor
                    + (1.0 - *speed_factor) * (*non_bridge_line_volume / PRESSURE_RECOVERY_VOLUME))
                    .min(1.0);
            }
            *speed_factor
        };
        *non_bridge_line_volume += length_mm * segment_flow * non_bridge_config.extrusion_mm3_per_mm();
        self.add_extrusion_move(
            p1,
            non_bridge_config,
            SpaceFillType::Polygons,
            segment_flow,
            false,
            segment_speed_factor,
            None,
        );
    }

    ///Add a variable-width wall starting at the given junction.
    #[allow(clippy::too_many_arguments)]
    pub fn add_wall(
        &mut self,
        wall: &ExtrusionLine,
        start_idx: usize,
        settings: &Settings,
        non_bridge_config: &'cfg GCodePathConfig,
        bridge_config: &'cfg GCodePathConfig,
        wall_0_wipe_dist: Coord,
        flow_ratio: f64,
        always_retract: bool,
        is_closed: bool,
        is_reversed: bool,
        is_linked_path: bool,
    ) {
        if wall.is_empty() {
            return;
        }
        if is_closed && wall.len() < 3 {
            self.note_recovered(&PlannerError::GeometryDegenerate {
                reason: format!("closed wall with {} junctions", wall.len()),
            });
            return;
        }
        let overhang_speed_factor = settings
            .get_percent_as_ratio("wall_overhang_speed_factor")
            .unwrap_or(1.0);

        let n = wall.len();
        let junction = |i: usize| {
            if is_reversed {
                wall.junctions[(start_idx + n - i % n) % n]
            } else {
                wall.junctions[(start_idx + i) % n]
            }
        };
        let segment_count = if is_closed { n } else { n - 1 };

        self.add_travel(junction(0).p, always_retract && !is_linked_path);

        // assume the extruder is fully pressurised to begin with
        let mut non_bridge_line_volume = 100.0;
        let mut speed_factor = 1.0;
        for i in 0..segment_count {
            let ja = junction(i);
            let jb = junction(i + 1);
            // the average junction width modulates the flow of the segment
            let width_flow =
                (ja.w + jb.w) as f64 / 2.0 / non_bridge_config.line_width.max(1) as f64;
            self.add_wall_line(
                ja.p,
                jb.p,
                flow_ratio,
                width_flow,
                non_bridge_config,
                bridge_config,
                overhang_speed_factor,
                &mut non_bridge_line_volume,
                &mut speed_factor,
            );
        }

        if is_closed && wall_0_wipe_dist > 0 {
            let mut distance_traversed = 0;
            let mut p0 = junction(0).p;
            for i in 1..=n {
                let p1 = junction(i % n).p;
                let p0p1_dist = (p1 - p0).vsize();
                if distance_traversed + p0p1_dist >= wall_0_wipe_dist {
                    let remaining = wall_0_wipe_dist - distance_traversed;
                    self.add_travel_simple(p0 + (p1 - p0).with_length(remaining));
                    break;
                }
                self.add_travel_simple(p1);
                distance_traversed += p0p1_dist;
                p0 = p1;
            }
            self.force_new_path_start();
        }
    }

    ///Add the walls of one region: the wall order policy is translated into
    ///a precedence relation, the path order optimiser sequences the walls
    ///under it, and each wall is laid down with the config matching its
    ///inset.
    #[allow(clippy::too_many_arguments)]
    pub fn add_walls(
        &mut self,
        walls: &[ExtrusionLine],
        settings: &Settings,
        wall_order: &WallOrderConfig,
        z_seam_config: &ZSeamConfig,
        inset_0_non_bridge_config: &'cfg GCodePathConfig,
        inset_x_non_bridge_config: &'cfg GCodePathConfig,
        inset_0_bridge_config: &'cfg GCodePathConfig,
        inset_x_bridge_config: &'cfg GCodePathConfig,
        retract_before_outer_wall: bool,
        wall_0_wipe_dist: Coord,
        wall_x_wipe_dist: Coord,
    ) {
        if walls.is_empty() {
            return;
        }
        let requirements = inset_order::order_requirements(walls, wall_order);
        let start = self.last_planned_position_or_starting_position();
        let picks: Vec<(usize, usize, bool)> = {
            let mut optimizer = PathOrderOptimizer::new(start, z_seam_config.clone());
            for wall in walls {
                if wall.is_closed {
                    optimizer.add_polygon(wall);
                } else {
                    optimizer.add_polyline(wall);
                }
            }
            optimizer.set_order_requirements(requirements);
            optimizer.optimize();
            optimizer
                .order
                .iter()
                .map(|&i| {
                    (
                        i,
                        optimizer.paths[i].start_index,
                        optimizer.paths[i].backwards,
                    )
                })
                .collect()
        };

        for (wall_idx, start_idx, mut backwards) in picks {
            let wall = &walls[wall_idx];
            if wall.is_empty() {
                continue;
            }
            let is_outer_wall = wall.inset_index == 0; // or thin wall gap filler
            let is_gap_filler = wall.is_odd;
            let non_bridge_config = if is_outer_wall {
                inset_0_non_bridge_config
            } else {
                inset_x_non_bridge_config
            };
            let bridge_config = if is_outer_wall {
                inset_0_bridge_config
            } else {
                inset_x_bridge_config
            };
            let wipe_dist = if is_outer_wall && !is_gap_filler {
                wall_0_wipe_dist
            } else {
                wall_x_wipe_dist
            };
            let retract_before = is_outer_wall && retract_before_outer_wall;

            if wall_order.alternate_walls {
                // on even layers walls start in the normal direction, on odd
                // layers inverted; odd insets flip once more
                let revert_inset = wall.inset_index % 2 == 1;
                let revert_layer = self.layer_nr.rem_euclid(2) == 1;
                backwards ^= revert_inset != revert_layer;
            }

            self.set_is_inside(true);
            self.add_wall(
                wall,
                start_idx,
                settings,
                non_bridge_config,
                bridge_config,
                wipe_dist,
                1.0,
                retract_before,
                wall.is_closed,
                backwards,
                false,
            );
        }
    }

    ///Emit one ordered open polyline with an optional wipe afterwards.
    #[allow(clippy::too_many_arguments)]
    fn add_ordered_line(
        &mut self,
        line: &Polygon,
        backwards: bool,
        config: &'cfg GCodePathConfig,
        space_fill_type: SpaceFillType,
        wipe_dist: Coord,
        flow_ratio: f64,
        fan_speed: Option<f64>,
    ) {
        let n = line.len();
        if n < 2 {
            self.note_recovered(&PlannerError::GeometryDegenerate {
                reason: format!("polyline with {} vertices", n),
            });
            return;
        }
        let vertex = |i: usize| if backwards { line[n - 1 - i] } else { line[i] };
        self.add_travel(vertex(0), false);
        for i in 1..n {
            self.add_extrusion_move(
                vertex(i),
                config,
                space_fill_type,
                flow_ratio,
                false,
                1.0,
                fan_speed,
            );
        }
        if wipe_dist != 0 {
            let p_last = vertex(n - 1);
            let p_prev = vertex(n - 2);
            let line_width = config.line_width;
            if (p_last - p_prev).vsize2() > line_width * line_width * 4 {
                // otherwise this line will be optimised away when merging
                // multiple lines into a single extrusion move
                self.add_extrusion_move(
                    p_last + (p_last - p_prev).with_length(wipe_dist),
                    config,
                    space_fill_type,
                    0.0,
                    false,
                    1.0,
                    fan_speed,
                );
            }
        }
    }

    ///Add open polylines (line infill and the like) in an optimised order.
    ///With travel optimisation enabled the ordering also avoids travels
    ///that cross the combing boundary.
    #[allow(clippy::too_many_arguments)]
    pub fn add_lines_by_optimizer(
        &mut self,
        lines: &PolygonSet,
        config: &'cfg GCodePathConfig,
        space_fill_type: SpaceFillType,
        enable_travel_optimization: bool,
        wipe_dist: Coord,
        flow_ratio: f64,
        near_start_location: Option<Point2>,
        fan_speed: Option<f64>,
    ) {
        if lines.is_empty() {
            return;
        }
        let start =
            near_start_location.unwrap_or_else(|| self.last_planned_position_or_starting_position());
        let boundary = if enable_travel_optimization {
            Some(self.comb_boundary_minimum.clone())
        } else {
            None
        };
        let picks: Vec<(usize, bool)> = {
            let mut optimizer = PathOrderOptimizer::new(start, ZSeamConfig::default());
            if let Some(boundary) = &boundary {
                optimizer = optimizer.with_combing_boundary(boundary);
            }
            let mut source_indices = Vec::new();
            for (line_idx, line) in lines.iter().enumerate() {
                if line.len() < 2 {
                    continue;
                }
                source_indices.push(line_idx);
                optimizer.add_polyline(line);
            }
            optimizer.optimize();
            optimizer
                .order
                .iter()
                .map(|&i| (source_indices[i], optimizer.paths[i].backwards))
                .collect()
        };
        for (line_idx, backwards) in picks {
            self.add_ordered_line(
                &lines[line_idx],
                backwards,
                config,
                space_fill_type,
                wipe_dist,
                flow_ratio,
                fan_speed,
            );
        }
    }

    ///Add open polylines in a monotonic order: sorted along the given
    ///direction, so each line is overlapped by its neighbour from always
    ///the same side.
    #[allow(clippy::too_many_arguments)]
    pub fn add_lines_monotonic(
        &mut self,
        lines: &PolygonSet,
        config: &'cfg GCodePathConfig,
        space_fill_type: SpaceFillType,
        monotonic_direction: f64,
        max_adjacent_distance: Coord,
        wipe_dist: Coord,
        flow_ratio: f64,
        fan_speed: Option<f64>,
    ) {
        let order = monotonic_ordering(&lines.0, monotonic_direction, max_adjacent_distance);
        for (line_idx, backwards) in order {
            self.add_ordered_line(
                &lines[line_idx],
                backwards,
                config,
                space_fill_type,
                wipe_dist,
                flow_ratio,
                fan_speed,
            );
        }
    }

    ///Run the cooling adjustments over every extruder plan and freeze the
    ///plan. Only the final extruder plan enforces the minimal layer time.
    pub fn process_fan_speed_and_minimal_layer_time(&mut self, starting_position: Point2) {
        let mut position = starting_position;
        let plan_count = self.extruder_plans.len();
        for (idx, plan) in self.extruder_plans.iter_mut().enumerate() {
            plan.start_position = position;
            let force_minimal_layer_time = idx == plan_count - 1;
            plan.process_fan_speed_and_minimal_layer_time(force_minimal_layer_time, position);
            position = plan.last_position().unwrap_or(position);
        }
        self.frozen = true;
    }

    ///Override the computed fan speed of every extruder plan.
    pub fn override_fan_speeds(&mut self, speed: f64) {
        for plan in &mut self.extruder_plans {
            plan.set_fan_speed(speed);
        }
    }

    ///Compensate the outflow of all extrusion paths for back pressure. The
    ///compensation strength comes from each extruder's settings; zero
    ///leaves every path untouched.
    pub fn apply_back_pressure_compensation(&mut self) -> Result<(), PlannerError> {
        for plan in &mut self.extruder_plans {
            let factor = self.configs.settings_per_extruder[plan.extruder_nr]
                .get_percent_as_ratio("speed_equalize_flow_width_factor")?;
            plan.apply_back_pressure_compensation(factor);
        }
        Ok(())
    }

    ///Collapse runs of short travels between collinear extrusions into
    ///single extrusion moves, preserving the extruded volume.
    pub fn merge_collinear_infill_lines(&mut self) -> Result<bool, PlannerError> {
        let mut changed = false;
        for plan in self.extruder_plans.iter_mut() {
            let nozzle_size = self.planning_settings[plan.extruder_nr].nozzle_tip_outer_diameter;
            changed |= crate::merge::merge_infill_lines(plan, nozzle_size)?;
        }
        Ok(changed)
    }

    ///Check the structural data model invariants; a violation is a bug in
    ///the planning code, not in the caller's input.
    pub fn validate(&self) -> Result<(), PlannerError> {
        for pair in self.extruder_plans.windows(2) {
            if pair[0].extruder_nr == pair[1].extruder_nr {
                return Err(PlannerError::InternalInvariant(format!(
                    "two consecutive extruder plans for extruder {}",
                    pair[0].extruder_nr
                )));
            }
        }
        for plan in &self.extruder_plans {
            for path in &plan.paths {
                if path.is_travel_path()
                    && (path.flow != 0.0 || path.extrusion_mm3_per_mm() != 0.0)
                {
                    return Err(PlannerError::InternalInvariant(
                        "travel path with non-zero flow".to_string(),
                    ));
                }
                if path.retract && !path.is_travel_path() {
                    return Err(PlannerError::InternalInvariant(
                        "retracting extrusion path".to_string(),
                    ));
                }
                if path.perform_z_hop && !path.retract {
                    return Err(PlannerError::InternalInvariant(
                        "z hop without retraction".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}
