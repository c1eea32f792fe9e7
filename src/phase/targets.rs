//! Growth phases and their target parameter windows.
//!
//! The built-in table is configuration data. A deployment may override any
//! subset of it (per phase, per parameter) from a JSON file; the lookup itself
//! is an exhaustive match, so there is no fallback entry to go missing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};

// ---

/// The eleven stages of a grow cycle, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthPhase {
    Germination,
    Seedling,
    VegetativeEarly,
    VegetativeLate,
    Transition,
    FloweringEarly,
    FloweringMid,
    FloweringLate,
    Flush,
    Drying,
    Curing,
}

impl GrowthPhase {
    /// All phases in cycle order.
    pub const ALL: [GrowthPhase; 11] = [
        GrowthPhase::Germination,
        GrowthPhase::Seedling,
        GrowthPhase::VegetativeEarly,
        GrowthPhase::VegetativeLate,
        GrowthPhase::Transition,
        GrowthPhase::FloweringEarly,
        GrowthPhase::FloweringMid,
        GrowthPhase::FloweringLate,
        GrowthPhase::Flush,
        GrowthPhase::Drying,
        GrowthPhase::Curing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GrowthPhase::Germination => "germination",
            GrowthPhase::Seedling => "seedling",
            GrowthPhase::VegetativeEarly => "vegetative_early",
            GrowthPhase::VegetativeLate => "vegetative_late",
            GrowthPhase::Transition => "transition",
            GrowthPhase::FloweringEarly => "flowering_early",
            GrowthPhase::FloweringMid => "flowering_mid",
            GrowthPhase::FloweringLate => "flowering_late",
            GrowthPhase::Flush => "flush",
            GrowthPhase::Drying => "drying",
            GrowthPhase::Curing => "curing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Following phase in the cycle, `None` after curing.
    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Preceding phase in the cycle, `None` before germination.
    pub fn previous(self) -> Option<Self> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// Expected (min, max) duration in days.
    pub fn duration_days(self) -> (i64, i64) {
        match self {
            GrowthPhase::Germination => (3, 7),
            GrowthPhase::Seedling => (7, 14),
            GrowthPhase::VegetativeEarly => (14, 21),
            GrowthPhase::VegetativeLate => (14, 28),
            GrowthPhase::Transition => (7, 14),
            GrowthPhase::FloweringEarly => (14, 21),
            GrowthPhase::FloweringMid => (21, 28),
            GrowthPhase::FloweringLate => (14, 21),
            GrowthPhase::Flush => (7, 14),
            GrowthPhase::Drying => (7, 14),
            GrowthPhase::Curing => (14, 60),
        }
    }

    /// Whether moving on is recommended after spending `started_at..now` here.
    pub fn should_advance(self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> (bool, String) {
        // ---
        let (min_days, max_days) = self.duration_days();
        let days = (now - started_at).num_days();

        if days < min_days {
            (false, format!("minimum duration not reached ({days}/{min_days} days)"))
        } else if days >= max_days {
            (true, format!("maximum duration reached ({days}/{max_days} days)"))
        } else {
            (true, format!("minimum duration reached ({days} days), transition possible"))
        }
    }
}

/// A monitored environmental or nutrient parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Temperature,
    Humidity,
    Vpd,
    Co2,
    Ph,
    Ec,
    Light,
}

impl Parameter {
    /// Map a reading's sensor type onto the parameter it is judged against.
    pub fn from_sensor_type(sensor_type: &str) -> Option<Self> {
        match sensor_type {
            "temperature" => Some(Parameter::Temperature),
            "humidity" => Some(Parameter::Humidity),
            "vpd" => Some(Parameter::Vpd),
            "co2" => Some(Parameter::Co2),
            "ph" => Some(Parameter::Ph),
            "ec" => Some(Parameter::Ec),
            "light" | "light_ppfd" => Some(Parameter::Light),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Parameter::Temperature => "temperature",
            Parameter::Humidity => "humidity",
            Parameter::Vpd => "vpd",
            Parameter::Co2 => "co2",
            Parameter::Ph => "ph",
            Parameter::Ec => "ec",
            Parameter::Light => "light",
        }
    }
}

/// Target for one parameter: a numeric `[min, max]` or a schedule descriptor
/// such as `"18/6"` or `"dark"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Range(f64, f64),
    Schedule(String),
}

impl Target {
    pub fn range(&self) -> Option<(f64, f64)> {
        match self {
            Target::Range(min, max) => Some((*min, *max)),
            Target::Schedule(_) => None,
        }
    }
}

/// Targets for one phase, keyed by parameter.
pub type TargetRanges = BTreeMap<Parameter, Target>;

/// Per-phase overrides as read from a deployment file.
pub type PhaseOverrides = BTreeMap<GrowthPhase, TargetRanges>;

/// Reject numeric targets that are not finite or whose `min` exceeds `max`.
pub fn check_targets(ranges: &TargetRanges) -> Result<()> {
    // ---
    for (parameter, target) in ranges {
        let Some((min, max)) = target.range() else {
            continue;
        };
        if !min.is_finite() || !max.is_finite() {
            return Err(TelemetryError::InvalidTarget {
                reason: format!("{} target [{min}, {max}] is not finite", parameter.as_str()),
            });
        }
        if min > max {
            return Err(TelemetryError::InvalidTarget {
                reason: format!("{} target [{min}, {max}] is inverted", parameter.as_str()),
            });
        }
    }
    Ok(())
}

fn targets(
    temperature: (f64, f64),
    humidity: (f64, f64),
    vpd: (f64, f64),
    co2: (f64, f64),
    ph: (f64, f64),
    ec: (f64, f64),
    light: &str,
) -> TargetRanges {
    BTreeMap::from([
        (Parameter::Temperature, Target::Range(temperature.0, temperature.1)),
        (Parameter::Humidity, Target::Range(humidity.0, humidity.1)),
        (Parameter::Vpd, Target::Range(vpd.0, vpd.1)),
        (Parameter::Co2, Target::Range(co2.0, co2.1)),
        (Parameter::Ph, Target::Range(ph.0, ph.1)),
        (Parameter::Ec, Target::Range(ec.0, ec.1)),
        (Parameter::Light, Target::Schedule(light.to_string())),
    ])
}

fn default_targets(phase: GrowthPhase) -> TargetRanges {
    // ---
    use GrowthPhase::*;
    match phase {
        Germination => targets((22.0, 26.0), (70.0, 90.0), (0.4, 0.8), (400.0, 800.0), (5.8, 6.2), (0.0, 0.4), "18/6"),
        Seedling => targets((22.0, 26.0), (65.0, 75.0), (0.4, 0.8), (400.0, 800.0), (5.8, 6.2), (0.4, 0.8), "18/6"),
        VegetativeEarly => targets((22.0, 28.0), (55.0, 70.0), (0.8, 1.1), (600.0, 1000.0), (5.8, 6.3), (0.8, 1.3), "18/6"),
        VegetativeLate => targets((22.0, 28.0), (50.0, 65.0), (0.9, 1.2), (800.0, 1200.0), (5.8, 6.3), (1.2, 1.6), "18/6"),
        Transition => targets((21.0, 27.0), (45.0, 60.0), (1.0, 1.3), (800.0, 1200.0), (5.8, 6.3), (1.4, 1.8), "12/12"),
        FloweringEarly => targets((20.0, 26.0), (45.0, 55.0), (1.1, 1.4), (800.0, 1200.0), (5.8, 6.3), (1.6, 2.0), "12/12"),
        FloweringMid => targets((20.0, 26.0), (40.0, 50.0), (1.2, 1.5), (800.0, 1200.0), (5.8, 6.3), (1.8, 2.2), "12/12"),
        FloweringLate => targets((18.0, 24.0), (35.0, 45.0), (1.2, 1.6), (600.0, 1000.0), (5.8, 6.3), (1.4, 1.8), "12/12"),
        Flush => targets((18.0, 24.0), (35.0, 45.0), (1.2, 1.6), (400.0, 800.0), (5.8, 6.3), (0.0, 0.4), "12/12"),
        Drying => targets((15.0, 21.0), (55.0, 65.0), (0.8, 1.2), (400.0, 600.0), (5.5, 6.5), (0.0, 0.4), "dark"),
        Curing => targets((15.0, 21.0), (58.0, 65.0), (0.7, 1.0), (400.0, 600.0), (5.5, 6.5), (0.0, 0.4), "dark"),
    }
}

/// Phase → targets lookup, built once at startup.
#[derive(Debug, Clone)]
pub struct PhaseTable {
    entries: [TargetRanges; 11],
}

impl Default for PhaseTable {
    fn default() -> Self {
        Self {
            entries: GrowthPhase::ALL.map(default_targets),
        }
    }
}

impl PhaseTable {
    /// Built-in table with `overrides` merged over it, parameter by parameter.
    pub fn with_overrides(overrides: PhaseOverrides) -> Self {
        // ---
        let mut table = Self::default();
        for (phase, ranges) in overrides {
            table.entries[phase.index()].extend(ranges);
        }
        table
    }

    pub fn target_ranges(&self, phase: GrowthPhase) -> &TargetRanges {
        &self.entries[phase.index()]
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_every_phase_has_every_parameter() {
        // ---
        let table = PhaseTable::default();
        for phase in GrowthPhase::ALL {
            let t = table.target_ranges(phase);
            for p in [
                Parameter::Temperature,
                Parameter::Humidity,
                Parameter::Vpd,
                Parameter::Co2,
                Parameter::Ph,
                Parameter::Ec,
            ] {
                let (min, max) = t[&p].range().unwrap();
                assert!(min <= max, "{} {} inverted", phase.as_str(), p.as_str());
            }
            assert!(matches!(t[&Parameter::Light], Target::Schedule(_)));
        }
    }

    #[test]
    fn test_sequence_navigation() {
        // ---
        assert_eq!(GrowthPhase::Germination.previous(), None);
        assert_eq!(GrowthPhase::Germination.next(), Some(GrowthPhase::Seedling));
        assert_eq!(GrowthPhase::Flush.next(), Some(GrowthPhase::Drying));
        assert_eq!(GrowthPhase::Curing.next(), None);
        assert_eq!(GrowthPhase::parse(" Flowering_Mid"), Some(GrowthPhase::FloweringMid));
        assert_eq!(GrowthPhase::parse("bloom"), None);
    }

    #[test]
    fn test_overrides_merge_per_parameter() {
        // ---
        let overrides: PhaseOverrides = serde_json::from_str(
            r#"{ "flowering_mid": { "temperature": [19.0, 25.0], "light": "11/13" } }"#,
        )
        .unwrap();
        let table = PhaseTable::with_overrides(overrides);
        let t = table.target_ranges(GrowthPhase::FloweringMid);

        assert_eq!(t[&Parameter::Temperature], Target::Range(19.0, 25.0));
        assert_eq!(t[&Parameter::Light], Target::Schedule("11/13".to_string()));
        assert_eq!(t[&Parameter::Humidity], Target::Range(40.0, 50.0));
    }

    #[test]
    fn test_check_targets() {
        // ---
        for phase in GrowthPhase::ALL {
            assert!(check_targets(PhaseTable::default().target_ranges(phase)).is_ok());
        }

        let inverted = BTreeMap::from([(Parameter::Humidity, Target::Range(70.0, 60.0))]);
        assert!(matches!(check_targets(&inverted), Err(TelemetryError::InvalidTarget { .. })));

        let unbounded = BTreeMap::from([(Parameter::Ec, Target::Range(f64::NAN, 2.0))]);
        assert!(check_targets(&unbounded).is_err());
    }

    #[test]
    fn test_unknown_phase_override_is_rejected() {
        // ---
        let parsed: std::result::Result<PhaseOverrides, _> =
            serde_json::from_str(r#"{ "bloom": { "temperature": [19.0, 25.0] } }"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_should_advance() {
        // ---
        let start = Utc::now();
        let phase = GrowthPhase::Seedling;

        assert!(!phase.should_advance(start, start + TimeDelta::days(3)).0);
        assert!(phase.should_advance(start, start + TimeDelta::days(7)).0);
        let (advance, reason) = phase.should_advance(start, start + TimeDelta::days(20));
        assert!(advance);
        assert!(reason.contains("maximum"));
    }

    #[test]
    fn test_sensor_type_mapping() {
        // ---
        assert_eq!(Parameter::from_sensor_type("light_ppfd"), Some(Parameter::Light));
        assert_eq!(Parameter::from_sensor_type("water_level"), None);
    }
}
