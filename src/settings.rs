use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::error::PlannerError;
use crate::geometry::{mm_to_microns, Coord, Point2};

///A flat key to string-value settings map with typed accessors, one per
///extruder train. Length-like values are stored in millimetres and read in
///integer micro metres.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    map: HashMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn has(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    fn raw(&self, key: &str) -> Result<&str, PlannerError> {
        self.map
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| PlannerError::Unsupported {
                key: key.to_string(),
                value: "(unset)".to_string(),
            })
    }

    fn unsupported(&self, key: &str, value: &str) -> PlannerError {
        PlannerError::Unsupported {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    ///A length given in millimetres, as integer micro metres.
    pub fn get_microns(&self, key: &str) -> Result<Coord, PlannerError> {
        Ok(mm_to_microns(self.get_mm(key)?))
    }

    ///A plain millimetre (or mm^3) quantity.
    pub fn get_mm(&self, key: &str) -> Result<f64, PlannerError> {
        let raw = self.raw(key)?;
        raw.trim()
            .parse::<f64>()
            .map_err(|_| self.unsupported(key, raw))
    }

    ///A velocity in mm/s. Also used for accelerations and jerks.
    pub fn get_mm_per_s(&self, key: &str) -> Result<f64, PlannerError> {
        self.get_mm(key)
    }

    ///A duration in seconds.
    pub fn get_duration(&self, key: &str) -> Result<f64, PlannerError> {
        let value = self.get_mm(key)?;
        if value < 0.0 {
            return Err(self.unsupported(key, &value.to_string()));
        }
        Ok(value)
    }

    ///A unit-less ratio given as-is (1.0 based).
    pub fn get_ratio(&self, key: &str) -> Result<f64, PlannerError> {
        self.get_mm(key)
    }

    ///A ratio given as a percentage (100 based), returned 1.0 based.
    pub fn get_percent_as_ratio(&self, key: &str) -> Result<f64, PlannerError> {
        Ok(self.get_mm(key)? / 100.0)
    }

    pub fn get_count(&self, key: &str) -> Result<usize, PlannerError> {
        let raw = self.raw(key)?;
        raw.trim()
            .parse::<usize>()
            .map_err(|_| self.unsupported(key, raw))
    }

    ///A layer index; may be negative for raft layers.
    pub fn get_layer_index(&self, key: &str) -> Result<i64, PlannerError> {
        let raw = self.raw(key)?;
        raw.trim()
            .parse::<i64>()
            .map_err(|_| self.unsupported(key, raw))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, PlannerError> {
        let raw = self.raw(key)?;
        match raw.trim() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(self.unsupported(key, other)),
        }
    }

    ///An enumerated setting, parsed through the enum's `FromStr`. A value
    ///outside the declared enumeration is fatal at plan construction.
    pub fn get_enum<T: FromStr>(&self, key: &str) -> Result<T, PlannerError> {
        let raw = self.raw(key)?;
        raw.trim()
            .parse::<T>()
            .map_err(|_| self.unsupported(key, raw))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut settings = Settings::new();
        for (key, value) in iter {
            settings.add(key, value);
        }
        settings
    }
}

///Which regions compose the inside combing boundary.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumString, EnumIter, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum CombingMode {
    Off,
    All,
    NoSkin,
    Infill,
}

///Where to start a closed loop.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumString, EnumIter, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum ZSeamType {
    ///Minimise purely by travel distance to the previous end point.
    Shortest,
    ///Start each closed path at the vertex nearest a user-given point.
    UserSpecified,
    ///A pseudo-random vertex, deterministic for a given seed.
    Random,
    ///Score candidate vertices by travel distance plus a corner bonus.
    SharpestCorner,
}

///Which corners attract the seam under [`ZSeamType::SharpestCorner`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumString, EnumIter, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum SeamCornerPref {
    None,
    Inner,
    Outer,
    Any,
    Weighted,
}

///The order in which concentric walls of one region are printed.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumString, EnumIter, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum InsetDirection {
    InsideOut,
    OutsideIn,
    CenterLast,
}

///Everything that configures one retraction event plus the policies that
///decide when one happens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetractionConfig {
    ///Gates all retraction decisions.
    pub enabled: bool,
    ///The distance retracted, in mm of filament.
    pub distance: f64,
    ///The speed with which to retract (mm/s).
    pub speed: f64,
    ///The speed with which to unretract (mm/s).
    pub prime_speed: f64,
    ///The amount of material primed extra after unretracting (mm^3).
    pub prime_volume: f64,
    ///The amount to lift the head during a retracted travel, in microns.
    pub z_hop: Coord,
    pub z_hop_enabled: bool,
    ///Hop only when the straight travel would collide with a part.
    pub z_hop_only_when_collides: bool,
    ///Z axis speed during the hop (mm/s).
    pub z_hop_speed: f64,
    ///Minimal travel distance to even consider retracting (microns).
    pub min_travel_distance: Coord,
    ///Window of mm extruded filament in which to limit the retraction count.
    pub extrusion_window: f64,
    ///Maximum retractions within the extrusion window.
    pub count_max: usize,
    pub combing: CombingMode,
    ///Above this combed distance, combing retracts anyway (microns).
    pub combing_max_distance: Coord,
}

impl RetractionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, PlannerError> {
        Ok(RetractionConfig {
            enabled: settings.get_bool("retraction_enable")?,
            distance: settings.get_mm("retraction_amount")?,
            speed: settings.get_mm_per_s("retraction_retract_speed")?,
            prime_speed: settings.get_mm_per_s("retraction_prime_speed")?,
            prime_volume: settings.get_mm("retraction_extra_prime_amount")?,
            z_hop: settings.get_microns("retraction_hop")?,
            z_hop_enabled: settings.get_bool("retraction_hop_enabled")?,
            z_hop_only_when_collides: settings.get_bool("retraction_hop_only_when_collides")?,
            z_hop_speed: settings.get_mm_per_s("speed_z_hop")?,
            min_travel_distance: settings.get_microns("retraction_min_travel")?,
            extrusion_window: settings.get_mm("retraction_extrusion_window")?,
            count_max: settings.get_count("retraction_count_max")?,
            combing: settings.get_enum("retraction_combing")?,
            combing_max_distance: settings.get_microns("retraction_combing_max_distance")?,
        })
    }
}

impl Default for RetractionConfig {
    fn default() -> Self {
        RetractionConfig {
            enabled: false,
            distance: 0.0,
            speed: 25.0,
            prime_speed: 25.0,
            prime_volume: 0.0,
            z_hop: 0,
            z_hop_enabled: false,
            z_hop_only_when_collides: false,
            z_hop_speed: 10.0,
            min_travel_distance: 0,
            extrusion_window: 10.0,
            count_max: 100,
            combing: CombingMode::Off,
            combing_max_distance: Coord::MAX,
        }
    }
}

///Settings related to fan speed and cooling, collated so a single block can
///be passed around per extruder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FanSpeedLayerTimeSettings {
    ///How long a layer should minimally take so it can cool down before the
    ///next layer is printed onto it (seconds).
    pub cool_min_layer_time: f64,
    ///Layers shorter than this interpolate between regular and maximum fan
    ///speed (seconds).
    pub cool_min_layer_time_fan_speed_max: f64,
    ///Fan speed on the initial layer (percent).
    pub cool_fan_speed_0: f64,
    ///Regular fan speed (percent).
    pub cool_fan_speed_min: f64,
    ///Fan speed when the minimum layer time is reached (percent).
    pub cool_fan_speed_max: f64,
    ///Never slow extrusions below this on account of the minimum layer time
    ///(mm/s).
    pub cool_min_speed: f64,
    ///The fan ramps up from cool_fan_speed_0 across this many layers.
    pub cool_fan_full_layer: i64,
}

impl FanSpeedLayerTimeSettings {
    pub fn from_settings(settings: &Settings) -> Result<Self, PlannerError> {
        Ok(FanSpeedLayerTimeSettings {
            cool_min_layer_time: settings.get_duration("cool_min_layer_time")?,
            cool_min_layer_time_fan_speed_max: settings
                .get_duration("cool_min_layer_time_fan_speed_max")?,
            cool_fan_speed_0: settings.get_mm("cool_fan_speed_0")?,
            cool_fan_speed_min: settings.get_mm("cool_fan_speed_min")?,
            cool_fan_speed_max: settings.get_mm("cool_fan_speed_max")?,
            cool_min_speed: settings.get_mm_per_s("cool_min_speed")?,
            cool_fan_full_layer: settings.get_layer_index("cool_fan_full_layer")?,
        })
    }
}

impl Default for FanSpeedLayerTimeSettings {
    fn default() -> Self {
        FanSpeedLayerTimeSettings {
            cool_min_layer_time: 5.0,
            cool_min_layer_time_fan_speed_max: 10.0,
            cool_fan_speed_0: 0.0,
            cool_fan_speed_min: 100.0,
            cool_fan_speed_max: 100.0,
            cool_min_speed: 10.0,
            cool_fan_full_layer: 2,
        }
    }
}

///The seam placement policy handed to the path order optimiser.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZSeamConfig {
    pub seam_type: ZSeamType,
    ///The user specified seam position, in microns.
    pub pos: Point2,
    pub corner_pref: SeamCornerPref,
    ///Seed for the deterministic pseudo-random seam placement.
    pub random_seed: u64,
}

impl ZSeamConfig {
    pub fn new(seam_type: ZSeamType, pos: Point2, corner_pref: SeamCornerPref) -> Self {
        ZSeamConfig {
            seam_type,
            pos,
            corner_pref,
            random_seed: 0,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, PlannerError> {
        Ok(ZSeamConfig {
            seam_type: settings.get_enum("z_seam_type")?,
            pos: Point2::new(
                settings.get_microns("z_seam_x")?,
                settings.get_microns("z_seam_y")?,
            ),
            corner_pref: settings.get_enum("z_seam_corner")?,
            random_seed: 0,
        })
    }
}

impl Default for ZSeamConfig {
    fn default() -> Self {
        ZSeamConfig::new(ZSeamType::Shortest, Point2::default(), SeamCornerPref::None)
    }
}

///How the walls of one region are sequenced, see the inset order module.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WallOrderConfig {
    pub inset_direction: InsetDirection,
    ///Pack by inset index when false was requested for region optimisation.
    pub pack_by_inset: bool,
    ///Gap fillers and other odd lines go last.
    pub center_last: bool,
    ///Alternate wall directions by inset and layer parity.
    pub alternate_walls: bool,
}

impl WallOrderConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, PlannerError> {
        let inset_direction: InsetDirection = settings.get_enum("inset_direction")?;
        Ok(WallOrderConfig {
            inset_direction,
            pack_by_inset: !settings.get_bool("optimize_wall_printing_order")?,
            center_last: settings.get_bool("wall_order_center_last")?
                || inset_direction == InsetDirection::CenterLast,
            alternate_walls: settings.get_bool("material_alternate_walls")?,
        })
    }
}
