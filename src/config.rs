use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumCount, EnumIter, EnumString};

use crate::error::PlannerError;
use crate::geometry::{microns_to_mm, Coord};
use crate::settings::Settings;

///The feature a planned path belongs to. Downstream consumers key emission
///behaviour (and layer-view colouring) off this.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumCount,
    EnumIter,
    EnumString,
    Display,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum PrintFeatureType {
    OuterWall,
    InnerWall,
    Skin,
    Support,
    SupportInfill,
    SupportInterface,
    PrimeTower,
    Infill,
    SkirtBrim,
    MoveCombing,
    MoveRetraction,
    None,
}

///The speed, acceleration and jerk of one feature config.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeedDerivatives {
    ///Print or travel speed in mm/s.
    pub speed: f64,
    ///Acceleration in mm/s^2.
    pub acceleration: f64,
    ///Jerk in mm/s.
    pub jerk: f64,
}

impl SpeedDerivatives {
    pub fn new(speed: f64, acceleration: f64, jerk: f64) -> Self {
        SpeedDerivatives {
            speed,
            acceleration,
            jerk,
        }
    }
}

///The immutable configuration for printing one feature type: line
///dimensions, base flow and the speed envelope. Shared by borrow between all
///paths of that feature on a layer, so it must outlive the layer plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GCodePathConfig {
    pub feature: PrintFeatureType,
    ///The laid down line width in microns; zero for travel configs.
    pub line_width: Coord,
    ///The layer thickness in microns.
    pub layer_thickness: Coord,
    ///The base flow ratio (1.0 based) from the settings.
    pub flow: f64,
    pub speed_derivatives: SpeedDerivatives,
    ///Whether this is the config of a bridge-over-air feature.
    pub is_bridge_path: bool,
    ///The fan speed to use for paths of this feature, in percent.
    pub fan_speed: f64,
}

impl GCodePathConfig {
    pub fn new(
        feature: PrintFeatureType,
        line_width: Coord,
        layer_thickness: Coord,
        flow: f64,
        speed_derivatives: SpeedDerivatives,
    ) -> Self {
        GCodePathConfig {
            feature,
            line_width,
            layer_thickness,
            flow,
            speed_derivatives,
            is_bridge_path: false,
            fan_speed: 100.0,
        }
    }

    ///A config for travel moves: no line width, no flow.
    pub fn travel(feature: PrintFeatureType, speed_derivatives: SpeedDerivatives) -> Self {
        GCodePathConfig {
            feature,
            line_width: 0,
            layer_thickness: 0,
            flow: 0.0,
            speed_derivatives,
            is_bridge_path: false,
            fan_speed: 100.0,
        }
    }

    pub fn with_bridge(mut self, is_bridge_path: bool) -> Self {
        self.is_bridge_path = is_bridge_path;
        self
    }

    pub fn with_fan_speed(mut self, fan_speed: f64) -> Self {
        self.fan_speed = fan_speed;
        self
    }

    ///A travel config extrudes no material.
    pub fn is_travel_path(&self) -> bool {
        self.line_width == 0
    }

    pub fn speed(&self) -> f64 {
        self.speed_derivatives.speed
    }

    pub fn acceleration(&self) -> f64 {
        self.speed_derivatives.acceleration
    }

    pub fn jerk(&self) -> f64 {
        self.speed_derivatives.jerk
    }

    ///The material flow in mm^3 per mm traversed, before per-path flow
    ///modifiers.
    pub fn extrusion_mm3_per_mm(&self) -> f64 {
        microns_to_mm(self.line_width) * microns_to_mm(self.layer_thickness) * self.flow
    }
}

///The per-extruder configuration tables whose lifetime brackets the layer
///plans built from them: travel configs, retraction configs and the raw
///settings of each extruder train.
#[derive(Clone, Debug, Default)]
pub struct PathConfigStorage {
    pub travel_config_per_extruder: Vec<GCodePathConfig>,
    pub retraction_config_per_extruder: Vec<crate::settings::RetractionConfig>,
    pub settings_per_extruder: Vec<Settings>,
}

impl PathConfigStorage {
    ///Assemble the per-extruder tables from each extruder train's settings.
    pub fn from_settings(settings_per_extruder: Vec<Settings>) -> Result<Self, PlannerError> {
        let mut travel_config_per_extruder = Vec::with_capacity(settings_per_extruder.len());
        let mut retraction_config_per_extruder = Vec::with_capacity(settings_per_extruder.len());
        for settings in &settings_per_extruder {
            travel_config_per_extruder.push(GCodePathConfig::travel(
                PrintFeatureType::MoveCombing,
                SpeedDerivatives::new(
                    settings.get_mm_per_s("speed_travel")?,
                    settings.get_mm_per_s("acceleration_travel")?,
                    settings.get_mm_per_s("jerk_travel")?,
                ),
            ));
            retraction_config_per_extruder
                .push(crate::settings::RetractionConfig::from_settings(settings)?);
        }
        Ok(PathConfigStorage {
            travel_config_per_extruder,
            retraction_config_per_extruder,
            settings_per_extruder,
        })
    }

    pub fn extruder_count(&self) -> usize {
        self.travel_config_per_extruder.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn travel_config_has_no_flow() {
        let config = GCodePathConfig::travel(
            PrintFeatureType::MoveCombing,
            SpeedDerivatives::new(120.0, 5000.0, 30.0),
        );
        assert!(config.is_travel_path());
        assert_eq!(config.extrusion_mm3_per_mm(), 0.0);
    }

    #[test]
    fn extrusion_volume_follows_line_dimensions() {
        let config = GCodePathConfig::new(
            PrintFeatureType::OuterWall,
            400,
            100,
            1.0,
            SpeedDerivatives::new(50.0, 1000.0, 10.0),
        );
        // 0.4 mm x 0.1 mm cross section
        assert!((config.extrusion_mm3_per_mm() - 0.04).abs() < 1e-12);
    }
}
