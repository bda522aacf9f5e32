//! Unit-conversion table.
//!
//! Every known unit string maps to a physical dimension and an affine
//! transform to that dimension's reference unit:
//! `reference = value * scale + offset`. Two units convert into each other
//! only when they share a dimension. Some strings are ambiguous (`m s-1` is
//! both a velocity and a water-equivalent precipitation rate), so an alias
//! may carry several interpretations; the canonical unit picks one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Physical dimension of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Reference: K.
    Temperature,
    /// Mass flux of water, reference kg m-2 s-1 (equivalently mm s-1).
    WaterFlux,
    /// Reference: W m-2.
    EnergyFlux,
    /// Reference: m s-1.
    Velocity,
    /// Reference: m.
    Length,
    /// Reference: Pa.
    Pressure,
    /// Reference: m2 s-2.
    Geopotential,
    /// Reference: 1.
    Fraction,
    /// Reference: kg m-2.
    MassPerArea,
}

/// Affine map from a unit into its dimension's reference unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitDef {
    pub dimension: Dimension,
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
}

impl UnitDef {
    const fn new(dimension: Dimension, scale: f64, offset: f64) -> Self {
        Self {
            dimension,
            scale,
            offset,
        }
    }
}

/// User-declared unit, from the `units` section of the tables file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomUnit {
    pub name: String,
    #[serde(flatten)]
    pub def: UnitDef,
}

/// Conversion between two units of the same dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conversion {
    pub scale: f64,
    pub offset: f64,
}

impl Conversion {
    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0
    }

    #[inline]
    pub fn apply(&self, value: f64) -> f64 {
        value * self.scale + self.offset
    }
}

const SECONDS_PER_DAY: f64 = 86_400.0;

fn builtin_units() -> Vec<(&'static str, UnitDef)> {
    use Dimension::*;
    vec![
        // Temperature
        ("K", UnitDef::new(Temperature, 1.0, 0.0)),
        ("kelvin", UnitDef::new(Temperature, 1.0, 0.0)),
        ("degK", UnitDef::new(Temperature, 1.0, 0.0)),
        ("degC", UnitDef::new(Temperature, 1.0, 273.15)),
        ("deg_C", UnitDef::new(Temperature, 1.0, 273.15)),
        ("°C", UnitDef::new(Temperature, 1.0, 273.15)),
        ("C", UnitDef::new(Temperature, 1.0, 273.15)),
        ("celsius", UnitDef::new(Temperature, 1.0, 273.15)),
        ("Celsius", UnitDef::new(Temperature, 1.0, 273.15)),
        ("degF", UnitDef::new(Temperature, 5.0 / 9.0, 273.15 - 32.0 * 5.0 / 9.0)),
        // Water flux
        ("kg m-2 s-1", UnitDef::new(WaterFlux, 1.0, 0.0)),
        ("mm s-1", UnitDef::new(WaterFlux, 1.0, 0.0)),
        ("mm day-1", UnitDef::new(WaterFlux, 1.0 / SECONDS_PER_DAY, 0.0)),
        ("mm/day", UnitDef::new(WaterFlux, 1.0 / SECONDS_PER_DAY, 0.0)),
        ("mm d-1", UnitDef::new(WaterFlux, 1.0 / SECONDS_PER_DAY, 0.0)),
        ("m day-1", UnitDef::new(WaterFlux, 1000.0 / SECONDS_PER_DAY, 0.0)),
        ("m s-1", UnitDef::new(WaterFlux, 1000.0, 0.0)),
        // Energy flux
        ("W m-2", UnitDef::new(EnergyFlux, 1.0, 0.0)),
        ("W/m2", UnitDef::new(EnergyFlux, 1.0, 0.0)),
        ("J m-2 day-1", UnitDef::new(EnergyFlux, 1.0 / SECONDS_PER_DAY, 0.0)),
        // Velocity
        ("m s-1", UnitDef::new(Velocity, 1.0, 0.0)),
        ("m/s", UnitDef::new(Velocity, 1.0, 0.0)),
        ("km h-1", UnitDef::new(Velocity, 1000.0 / 3600.0, 0.0)),
        ("cm s-1", UnitDef::new(Velocity, 0.01, 0.0)),
        // Length
        ("m", UnitDef::new(Length, 1.0, 0.0)),
        ("cm", UnitDef::new(Length, 0.01, 0.0)),
        ("mm", UnitDef::new(Length, 0.001, 0.0)),
        ("km", UnitDef::new(Length, 1000.0, 0.0)),
        // Pressure
        ("Pa", UnitDef::new(Pressure, 1.0, 0.0)),
        ("hPa", UnitDef::new(Pressure, 100.0, 0.0)),
        ("mbar", UnitDef::new(Pressure, 100.0, 0.0)),
        ("millibars", UnitDef::new(Pressure, 100.0, 0.0)),
        // Geopotential
        ("m2 s-2", UnitDef::new(Geopotential, 1.0, 0.0)),
        // Fraction
        ("1", UnitDef::new(Fraction, 1.0, 0.0)),
        ("0-1", UnitDef::new(Fraction, 1.0, 0.0)),
        ("fraction", UnitDef::new(Fraction, 1.0, 0.0)),
        ("%", UnitDef::new(Fraction, 0.01, 0.0)),
        ("percent", UnitDef::new(Fraction, 0.01, 0.0)),
        // Mass per area
        ("kg m-2", UnitDef::new(MassPerArea, 1.0, 0.0)),
    ]
}

/// Normalise spelling variants: `kg m**-2 s**-1`, `kg m^-2 s^-1` and
/// `kg  m-2 s-1` all become `kg m-2 s-1`.
pub fn normalize_unit(unit: &str) -> String {
    unit.replace("**", "")
        .replace('^', "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a unit string denotes degrees Celsius.
pub fn is_celsius(unit: &str) -> bool {
    matches!(
        normalize_unit(unit).as_str(),
        "degC" | "deg_C" | "°C" | "C" | "celsius" | "Celsius" | "degrees_C" | "degrees Celsius"
    )
}

/// Lookup table of units.
#[derive(Debug, Clone)]
pub struct UnitTable {
    units: HashMap<String, Vec<UnitDef>>,
}

impl Default for UnitTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitTable {
    /// Table holding the built-in units.
    pub fn new() -> Self {
        let mut table = Self {
            units: HashMap::new(),
        };
        for (name, def) in builtin_units() {
            table.insert(name, def);
        }
        table.insert("degrees_C", UnitDef::new(Dimension::Temperature, 1.0, 273.15));
        table.insert("degrees Celsius", UnitDef::new(Dimension::Temperature, 1.0, 273.15));
        table
    }

    /// Add an interpretation of a unit string. A second definition with the
    /// same dimension replaces the first.
    pub fn insert(&mut self, name: &str, def: UnitDef) {
        let defs = self.units.entry(normalize_unit(name)).or_default();
        defs.retain(|d| d.dimension != def.dimension);
        defs.push(def);
    }

    pub fn with_custom(mut self, custom: &[CustomUnit]) -> Self {
        for unit in custom {
            self.insert(&unit.name, unit.def);
        }
        self
    }

    pub fn is_known(&self, unit: &str) -> bool {
        self.units.contains_key(&normalize_unit(unit))
    }

    /// Dimensions a unit string can stand for.
    pub fn dimensions(&self, unit: &str) -> Vec<Dimension> {
        self.units
            .get(&normalize_unit(unit))
            .map(|defs| defs.iter().map(|d| d.dimension).collect())
            .unwrap_or_default()
    }

    /// Conversion from `from` to `to`, if both are known and share a dimension.
    pub fn conversion(&self, from: &str, to: &str) -> Option<Conversion> {
        let from_defs = self.units.get(&normalize_unit(from))?;
        let to_defs = self.units.get(&normalize_unit(to))?;
        for target in to_defs {
            if let Some(source) = from_defs.iter().find(|d| d.dimension == target.dimension) {
                // reference = x*s1 + o1 ; y = (reference - o2) / s2
                return Some(Conversion {
                    scale: source.scale / target.scale,
                    offset: (source.offset - target.offset) / target.scale,
                });
            }
        }
        None
    }
}
