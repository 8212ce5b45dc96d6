use layerplan::plan::{LayerPlan, LayerSetup};
use layerplan::{
    FanSpeedLayerTimeSettings, GCodePathConfig, PathConfigStorage, Point2, Polygon, PolygonSet,
    PrintFeatureType, Settings, SpaceFillType, SpeedDerivatives,
};

///Settings close to a stock single-extruder profile, with values that can
///be recognised uniquely where possible.
fn test_settings(retraction_enable: bool, hop_enabled: bool, combing: &str) -> Settings {
    [
        ("speed_travel", "120"),
        ("acceleration_travel", "5006"),
        ("jerk_travel", "5.6"),
        ("retraction_enable", if retraction_enable { "true" } else { "false" }),
        ("retraction_amount", "6.5"),
        ("retraction_retract_speed", "25"),
        ("retraction_prime_speed", "20"),
        ("retraction_extra_prime_amount", "0"),
        ("retraction_hop", "1.5"),
        ("retraction_hop_enabled", if hop_enabled { "true" } else { "false" }),
        ("retraction_hop_only_when_collides", "false"),
        ("speed_z_hop", "10"),
        ("retraction_min_travel", "0"),
        ("retraction_extrusion_window", "6.5"),
        ("retraction_count_max", "90"),
        ("retraction_combing", combing),
        ("retraction_combing_max_distance", "30"),
        ("machine_nozzle_tip_outer_diameter", "1"),
        ("wall_line_count", "3"),
        ("wall_line_width_0", "0.301"),
        ("wall_line_width_x", "0.3"),
        ("wall_overhang_speed_factor", "100"),
        ("speed_equalize_flow_width_factor", "0"),
    ]
    .into_iter()
    .collect()
}

fn test_storage(retraction_enable: bool, hop_enabled: bool, combing: &str) -> PathConfigStorage {
    PathConfigStorage::from_settings(vec![test_settings(retraction_enable, hop_enabled, combing)])
        .expect("the test settings are complete")
}

fn fan_settings() -> FanSpeedLayerTimeSettings {
    FanSpeedLayerTimeSettings {
        cool_min_layer_time: 5.0,
        cool_min_layer_time_fan_speed_max: 10.0,
        cool_fan_speed_0: 0.0,
        cool_fan_speed_min: 75.0,
        cool_fan_speed_max: 100.0,
        cool_min_speed: 10.0,
        cool_fan_full_layer: 3,
    }
}

fn square(origin: Point2, size: i64) -> Polygon {
    Polygon::new(vec![
        origin,
        origin + Point2::new(size, 0),
        origin + Point2::new(size, size),
        origin + Point2::new(0, size),
    ])
}

fn layer_setup<'a>(
    configs: &'a PathConfigStorage,
    boundary: PolygonSet,
    start_position: Point2,
    start_is_inside: bool,
) -> LayerSetup<'a> {
    LayerSetup {
        layer_nr: 100,
        z: 10_000,
        layer_thickness: 100,
        is_initial_layer: false,
        is_raft_layer: false,
        start_extruder: 0,
        start_position,
        start_is_inside,
        configs,
        fan_speed_layer_time_settings_per_extruder: vec![fan_settings()],
        comb_boundary_minimum: boundary.clone(),
        comb_boundary_preferred: boundary,
        comb_avoid_boundary: None,
        comb_offset_from_outlines: 400,
        comb_move_inside_distance: 50,
        layer_start_positions: vec![Point2::new(0, 0)],
    }
}

fn extrusion_config(speed: f64, line_width: i64) -> GCodePathConfig {
    GCodePathConfig::new(
        PrintFeatureType::OuterWall,
        line_width,
        100,
        1.0,
        SpeedDerivatives::new(speed, 1000.0, 10.0),
    )
}

#[test]
fn short_travel_has_no_retraction_and_no_hop() {
    let configs = test_storage(true, true, "off");
    let setup = layer_setup(&configs, PolygonSet::default(), Point2::new(0, 0), true);
    let mut plan = LayerPlan::new(setup).unwrap();
    plan.add_travel_simple(Point2::new(0, 0));

    // nozzle tip outer diameter is 1000 microns; a 100 micron move goes direct
    let path = plan.add_travel(Point2::new(100, 0), false);
    assert_eq!(path.points, vec![Point2::new(0, 0), Point2::new(100, 0)]);
    assert!(!path.retract);
    assert!(!path.perform_z_hop);
    plan.validate().unwrap();
}

#[test]
fn combed_travel_stays_inside_the_square() {
    let configs = test_storage(true, false, "all");
    let boundary = PolygonSet::new(vec![square(Point2::new(0, 0), 10_000)]);
    let setup = layer_setup(&configs, boundary.clone(), Point2::new(1000, 1000), true);
    let mut plan = LayerPlan::new(setup).unwrap();
    plan.set_is_inside(true);
    plan.add_travel_simple(Point2::new(1000, 1000));
    plan.add_travel(Point2::new(9000, 9000), false);

    let travels: Vec<_> = plan.extruder_plans()[0]
        .paths
        .iter()
        .filter(|path| path.is_travel_path())
        .collect();
    assert!(!travels.is_empty());
    let mut all_points = Vec::new();
    for path in &travels {
        assert!(!path.retract, "combed travel must not retract");
        all_points.extend(path.points.iter().copied());
    }
    assert_eq!(all_points.first(), Some(&Point2::new(1000, 1000)));
    assert_eq!(all_points.last(), Some(&Point2::new(9000, 9000)));
    for window in all_points.windows(2) {
        let mid = Point2::new(
            (window[0].x + window[1].x) / 2,
            (window[0].y + window[1].y) / 2,
        );
        assert!(boundary.inside(mid, true), "{:?} left the boundary", mid);
        assert!(
            !boundary.collides_with_segment(window[0], window[1]),
            "travel segment {:?} -> {:?} crosses the boundary",
            window[0],
            window[1]
        );
    }
    plan.validate().unwrap();
}

#[test]
fn travel_between_parts_retracts_and_hops_in_the_air() {
    let configs = test_storage(true, true, "all");
    let boundary = PolygonSet::new(vec![
        square(Point2::new(0, 0), 1000),
        square(Point2::new(5000, 0), 1000),
    ]);
    let setup = layer_setup(&configs, boundary, Point2::new(500, 500), true);
    let mut plan = LayerPlan::new(setup).unwrap();
    plan.set_is_inside(true);
    plan.add_travel_simple(Point2::new(500, 500));
    plan.add_travel(Point2::new(5500, 500), false);

    let travels: Vec<_> = plan.extruder_plans()[0]
        .paths
        .iter()
        .filter(|path| path.is_travel_path() && !path.points.is_empty())
        .collect();
    // the seed travel, plus: inside part A, through the air, inside part B
    assert!(travels.len() >= 4, "got {} travel paths", travels.len());
    let retracting: Vec<_> = travels.iter().filter(|path| path.retract).collect();
    assert_eq!(retracting.len(), 1, "only the air move retracts");
    assert!(retracting[0].perform_z_hop, "always-hop policy hops the air move");
    assert_eq!(
        plan.last_planned_position(),
        Some(Point2::new(5500, 500))
    );
    plan.validate().unwrap();
}

#[test]
fn outside_in_insets_are_laid_down_outermost_first() {
    use layerplan::{ExtrusionJunction, ExtrusionLine};
    use layerplan::{InsetDirection, WallOrderConfig, ZSeamConfig};

    let configs = test_storage(false, false, "off");
    let inset_0 = extrusion_config(50.0, 400);
    let inset_x = extrusion_config(60.0, 400);
    let inset_0_bridge = extrusion_config(20.0, 400);
    let inset_x_bridge = extrusion_config(25.0, 400);
    let setup = layer_setup(&configs, PolygonSet::default(), Point2::new(0, 0), false);
    let mut plan = LayerPlan::new(setup).unwrap();
    plan.add_travel_simple(Point2::new(0, 0));

    let wall = |half: i64, inset_index: usize| {
        let center = Point2::new(5000, 5000);
        let corners = [
            center + Point2::new(-half, -half),
            center + Point2::new(half, -half),
            center + Point2::new(half, half),
            center + Point2::new(-half, half),
        ];
        ExtrusionLine::new(
            corners
                .iter()
                .map(|&p| ExtrusionJunction::new(p, 400, inset_index))
                .collect(),
            true,
            inset_index,
        )
    };
    let walls = vec![wall(3000, 0), wall(2600, 1), wall(2200, 2)];

    let wall_order = WallOrderConfig {
        inset_direction: InsetDirection::OutsideIn,
        pack_by_inset: true,
        center_last: false,
        alternate_walls: false,
    };
    let settings = test_settings(false, false, "off");
    plan.add_walls(
        &walls,
        &settings,
        &wall_order,
        &ZSeamConfig::default(),
        &inset_0,
        &inset_x,
        &inset_0_bridge,
        &inset_x_bridge,
        false,
        0,
        0,
    );

    // walk the extrusion paths and record the extent of each wall loop
    let mut extents: Vec<i64> = Vec::new();
    for path in &plan.extruder_plans()[0].paths {
        if path.is_travel_path() {
            continue;
        }
        let extent = path
            .points
            .iter()
            .map(|p| (p.x - 5000).abs().max((p.y - 5000).abs()))
            .max()
            .unwrap();
        extents.push(extent);
    }
    assert_eq!(extents.len(), 3);
    assert_eq!(extents, vec![3000, 2600, 2200], "outermost wall first");
    plan.validate().unwrap();
}

#[test]
fn minimum_layer_time_slows_down_to_the_speed_floor() {
    let configs = test_storage(false, false, "off");
    let mut setup = layer_setup(&configs, PolygonSet::default(), Point2::new(0, 0), false);
    // minimum layer time 10 s; minimum speed 5 mm/s
    let mut fan = fan_settings();
    fan.cool_min_layer_time = 10.0;
    fan.cool_min_speed = 5.0;
    setup.fan_speed_layer_time_settings_per_extruder = vec![fan];
    let config = extrusion_config(100.0, 1000);
    let mut plan = LayerPlan::new(setup).unwrap();
    plan.add_travel_simple(Point2::new(0, 0));

    // 1 mm of extrusion at 100 mm/s with a 0.1 mm^2 cross section; the
    // naive time estimate is 0.01 s
    plan.add_extrusion_move(
        Point2::new(1000, 0),
        &config,
        SpaceFillType::Lines,
        1.0,
        false,
        1.0,
        None,
    );

    plan.process_fan_speed_and_minimal_layer_time(Point2::new(0, 0));

    let extruder_plan = &plan.extruder_plans()[0];
    let factor = extruder_plan.extrude_speed_factor();
    assert!(
        (factor - 0.05).abs() < 1e-9,
        "the extrusion is floored at 5 mm/s, got factor {}",
        factor
    );
    // 0.2 s of printing leaves 9.8 s to recover as a dwell
    assert!(
        (extruder_plan.extra_time() - 9.8).abs() < 1e-6,
        "got extra time {}",
        extruder_plan.extra_time()
    );
    // a layer this short runs the fan at full speed
    assert_eq!(extruder_plan.fan_speed(), 100.0);
}

#[test]
fn cooling_is_idempotent() {
    let configs = test_storage(true, false, "off");
    let config = extrusion_config(100.0, 1000);
    let setup = layer_setup(&configs, PolygonSet::default(), Point2::new(0, 0), false);
    let mut plan = LayerPlan::new(setup).unwrap();
    plan.add_travel_simple(Point2::new(0, 0));
    plan.add_extrusion_move(
        Point2::new(1000, 0),
        &config,
        SpaceFillType::Lines,
        1.0,
        false,
        1.0,
        None,
    );
    plan.add_travel(Point2::new(9000, 0), false);
    plan.add_extrusion_move(
        Point2::new(10_000, 0),
        &config,
        SpaceFillType::Lines,
        1.0,
        false,
        1.0,
        None,
    );

    plan.process_fan_speed_and_minimal_layer_time(Point2::new(0, 0));
    let first = (
        plan.extruder_plans()[0].extrude_speed_factor(),
        plan.extruder_plans()[0].fan_speed(),
        plan.extruder_plans()[0].extra_time(),
        plan.extruder_plans()[0].estimates,
    );

    plan.process_fan_speed_and_minimal_layer_time(Point2::new(0, 0));
    let second = (
        plan.extruder_plans()[0].extrude_speed_factor(),
        plan.extruder_plans()[0].fan_speed(),
        plan.extruder_plans()[0].extra_time(),
        plan.extruder_plans()[0].estimates,
    );
    assert_eq!(first, second);
}

#[test]
fn zero_back_pressure_compensation_is_neutral() {
    let configs = test_storage(false, false, "off");
    let config = extrusion_config(50.0, 400);
    let setup = layer_setup(&configs, PolygonSet::default(), Point2::new(0, 0), false);
    let mut plan = LayerPlan::new(setup).unwrap();
    plan.add_travel_simple(Point2::new(0, 0));
    for (idx, flow) in [1.0, 0.9, 1.2].into_iter().enumerate() {
        plan.add_extrusion_move(
            Point2::new(1000 * (idx as i64 + 1), 0),
            &config,
            SpaceFillType::Lines,
            flow,
            false,
            1.0,
            None,
        );
    }

    // the settings carry a zero compensation factor
    plan.apply_back_pressure_compensation().unwrap();
    for path in &plan.extruder_plans()[0].paths {
        assert_eq!(path.speed_back_pressure_factor, 1.0);
    }
}

#[test]
fn extruder_plans_never_repeat_an_extruder() {
    let settings = test_settings(false, false, "off");
    let configs =
        PathConfigStorage::from_settings(vec![settings.clone(), settings]).unwrap();
    let mut setup = layer_setup(&configs, PolygonSet::default(), Point2::new(0, 0), false);
    setup.fan_speed_layer_time_settings_per_extruder = vec![fan_settings(), fan_settings()];
    setup.layer_start_positions = vec![Point2::new(0, 0), Point2::new(0, 0)];
    let mut plan = LayerPlan::new(setup).unwrap();

    // switching on a still-empty plan just takes the plan over
    assert!(plan.set_extruder(1));
    assert_eq!(plan.extruder_plans().len(), 1);
    assert_eq!(plan.extruder(), 1);

    plan.add_travel_simple(Point2::new(1000, 0));
    assert!(plan.set_extruder(0));
    assert_eq!(plan.extruder_plans().len(), 2);

    // switching to the already-active extruder is a no-op
    assert!(!plan.set_extruder(0));
    assert_eq!(plan.extruder_plans().len(), 2);

    let extruders: Vec<usize> = plan
        .extruder_plans()
        .iter()
        .map(|extruder_plan| extruder_plan.extruder_nr)
        .collect();
    assert_eq!(extruders, vec![1, 0]);
    plan.validate().unwrap();
}

#[test]
fn monotonic_lines_follow_the_direction() {
    let configs = test_storage(false, false, "off");
    let config = extrusion_config(30.0, 400);
    let setup = layer_setup(&configs, PolygonSet::default(), Point2::new(0, 0), false);
    let mut plan = LayerPlan::new(setup).unwrap();
    plan.add_travel_simple(Point2::new(0, 0));

    let lines = PolygonSet::new(vec![
        Polygon::new(vec![Point2::new(3000, 0), Point2::new(3000, 2000)]),
        Polygon::new(vec![Point2::new(1000, 0), Point2::new(1000, 2000)]),
        Polygon::new(vec![Point2::new(2000, 0), Point2::new(2000, 2000)]),
    ]);
    plan.add_lines_monotonic(&lines, &config, SpaceFillType::Lines, 0.0, 1500, 0, 1.0, None);

    let xs: Vec<i64> = plan.extruder_plans()[0]
        .paths
        .iter()
        .filter(|path| !path.is_travel_path())
        .map(|path| path.points[0].x)
        .collect();
    assert_eq!(xs, vec![1000, 2000, 3000]);
    plan.validate().unwrap();
}
