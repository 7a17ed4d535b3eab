//! Per-phase measurement record.
//!
//! A [`PhaseLine`] holds the latest readings of one electrical phase together
//! with the topic suffixes its fields are sourced from. Fields are addressed
//! through the closed [`Field`] enumeration.

use crate::error::InvalidFieldError;
use serde_derive::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Voltage assumed for a phase that never reported one.
pub const NOMINAL_VOLTAGE: f64 = 230.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Voltage,
    Current,
    Power,
    Imported,
    Exported,
}

impl Field {
    /// All fields in resolver scan order.
    pub const ALL: [Field; 5] = [
        Field::Voltage,
        Field::Current,
        Field::Power,
        Field::Imported,
        Field::Exported,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Voltage => "voltage",
            Field::Current => "current",
            Field::Power => "power",
            Field::Imported => "imported",
            Field::Exported => "exported",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Field::Voltage => "V",
            Field::Current => "A",
            Field::Power => "W",
            Field::Imported | Field::Exported => "kWh",
        }
    }

    /// Path segment below `/Ac/<phase>/` (and below `/Ac/` for totals).
    pub fn path_segment(self) -> &'static str {
        match self {
            Field::Voltage => "Voltage",
            Field::Current => "Current",
            Field::Power => "Power",
            Field::Exported => "Energy/Forward",
            Field::Imported => "Energy/Reverse",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = InvalidFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .into_iter()
            .find(|field| field.name() == s)
            .ok_or_else(|| InvalidFieldError(s.to_string()))
    }
}

/// Topic suffixes feeding each field. An empty suffix means the field is not
/// sourced from the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopicBindings {
    pub voltage: String,
    pub current: String,
    pub power: String,
    pub imported: String,
    pub exported: String,
}

impl TopicBindings {
    pub fn get(&self, field: Field) -> &str {
        match field {
            Field::Voltage => &self.voltage,
            Field::Current => &self.current,
            Field::Power => &self.power,
            Field::Imported => &self.imported,
            Field::Exported => &self.exported,
        }
    }

    /// Configured bindings in scan order, skipping unsourced fields.
    pub fn iter(&self) -> impl Iterator<Item = (Field, &str)> {
        Field::ALL
            .into_iter()
            .map(|field| (field, self.get(field)))
            .filter(|(_, suffix)| !suffix.is_empty())
    }
}

/// What a call to [`PhaseLine::derive_missing`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Derivation {
    pub voltage_defaulted: bool,
    pub derived: Option<Field>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseLine {
    pub name: String,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub imported: f64,
    pub exported: f64,
    pub topics: TopicBindings,
    pub last_power_update: Option<Instant>,
    last_observed: Option<Field>,
    derived: Option<Field>,
}

impl PhaseLine {
    pub fn new(name: impl Into<String>, topics: TopicBindings) -> Self {
        Self {
            name: name.into(),
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
            imported: 0.0,
            exported: 0.0,
            topics,
            last_power_update: None,
            last_observed: None,
            derived: None,
        }
    }

    pub fn get(&self, field: Field) -> f64 {
        match field {
            Field::Voltage => self.voltage,
            Field::Current => self.current,
            Field::Power => self.power,
            Field::Imported => self.imported,
            Field::Exported => self.exported,
        }
    }

    fn slot(&mut self, field: Field) -> &mut f64 {
        match field {
            Field::Voltage => &mut self.voltage,
            Field::Current => &mut self.current,
            Field::Power => &mut self.power,
            Field::Imported => &mut self.imported,
            Field::Exported => &mut self.exported,
        }
    }

    /// Stores an observed reading.
    pub fn set_field(&mut self, field: Field, value: f64) {
        *self.slot(field) = value;
        if field == Field::Power {
            self.last_power_update = Some(Instant::now());
        }
        if self.derived == Some(field) {
            self.derived = None;
        }
        self.last_observed = Some(field);
    }

    pub fn set_by_name(&mut self, field: &str, value: f64) -> Result<(), InvalidFieldError> {
        self.set_field(field.parse()?, value);
        Ok(())
    }

    /// Fills in voltage, then current or power, from the other readings.
    ///
    /// A field counts as missing when it is zero or holds an earlier estimate.
    /// The most recently observed field is never overwritten, and at most one
    /// of current/power is derived per call.
    pub fn derive_missing(&mut self) -> Derivation {
        let mut outcome = Derivation::default();

        if self.voltage == 0.0 {
            self.voltage = NOMINAL_VOLTAGE;
            outcome.voltage_defaulted = true;
        }

        if self.power != 0.0 && self.is_missing(Field::Current) {
            self.current = self.power / self.voltage;
            outcome.derived = Some(Field::Current);
        } else if self.current != 0.0 && self.is_missing(Field::Power) {
            self.power = self.voltage * self.current;
            outcome.derived = Some(Field::Power);
        }

        if outcome.derived.is_some() {
            self.derived = outcome.derived;
        }
        outcome
    }

    fn is_missing(&self, field: Field) -> bool {
        self.last_observed != Some(field) && (self.get(field) == 0.0 || self.derived == Some(field))
    }

    /// The field currently holding an estimate rather than a reading.
    pub fn derived(&self) -> Option<Field> {
        self.derived
    }

    /// Drops a derived estimate so the next reading re-derives it.
    pub fn clear_derived(&mut self) -> Option<Field> {
        let field = self.derived.take()?;
        *self.slot(field) = 0.0;
        Some(field)
    }

    /// Device path of one of this phase's fields, e.g. `/Ac/L1/Power`.
    pub fn path(&self, field: Field) -> String {
        format!("/Ac/{}/{}", self.name, field.path_segment())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(voltage: f64, current: f64, power: f64) -> PhaseLine {
        let mut line = PhaseLine::new("L1", TopicBindings::default());
        line.voltage = voltage;
        line.current = current;
        line.power = power;
        line
    }

    #[test]
    fn test_field_parse_and_display() {
        for field in Field::ALL {
            assert_eq!(field.name().parse::<Field>(), Ok(field));
            assert_eq!(field.to_string(), field.name());
        }
        assert_eq!(
            "Power".parse::<Field>(),
            Err(InvalidFieldError("Power".to_string()))
        );
    }

    #[test]
    fn test_set_by_name_rejects_unknown_field() {
        let mut line = phase(230.0, 0.0, 0.0);
        let err = line.set_by_name("frequency", 50.0).unwrap_err();
        assert_eq!(err, InvalidFieldError("frequency".to_string()));
        assert_eq!(line, phase(230.0, 0.0, 0.0));
    }

    #[test]
    fn test_set_power_stamps_update_time() {
        let mut line = phase(230.0, 0.0, 0.0);
        assert!(line.last_power_update.is_none());
        line.set_by_name("current", 2.0).unwrap();
        assert!(line.last_power_update.is_none());
        line.set_by_name("power", 460.0).unwrap();
        assert!(line.last_power_update.is_some());
        assert_eq!(line.power, 460.0);
    }

    #[test]
    fn test_derive_current_from_power() {
        let mut line = phase(230.0, 0.0, 920.0);
        let outcome = line.derive_missing();
        assert_eq!(line.current, 4.0);
        assert_eq!(line.power, 920.0);
        assert_eq!(outcome.derived, Some(Field::Current));
        assert_eq!(line.derived(), Some(Field::Current));
    }

    #[test]
    fn test_derive_power_from_current() {
        let mut line = phase(230.0, 4.0, 0.0);
        let outcome = line.derive_missing();
        assert_eq!(line.power, 920.0);
        assert_eq!(line.current, 4.0);
        assert_eq!(outcome.derived, Some(Field::Power));
    }

    #[test]
    fn test_derive_leaves_complete_readings_alone() {
        let mut line = phase(230.0, 5.0, 920.0);
        let outcome = line.derive_missing();
        assert_eq!(outcome, Derivation::default());
        assert_eq!(line, phase(230.0, 5.0, 920.0));
    }

    #[test]
    fn test_derive_defaults_voltage() {
        let mut line = phase(0.0, 0.0, 460.0);
        let outcome = line.derive_missing();
        assert!(outcome.voltage_defaulted);
        assert_eq!(line.voltage, NOMINAL_VOLTAGE);
        assert_eq!(line.current, 2.0);
    }

    #[test]
    fn test_derive_never_overwrites_observed_zero_power() {
        let mut line = phase(230.0, 4.0, 0.0);
        line.set_field(Field::Power, 0.0);
        let outcome = line.derive_missing();
        assert_eq!(outcome.derived, None);
        assert_eq!(line.power, 0.0);
    }

    #[test]
    fn test_derived_estimate_is_refreshed_by_next_power_reading() {
        let mut line = phase(230.0, 0.0, 0.0);
        line.set_field(Field::Power, 920.0);
        line.derive_missing();
        assert_eq!(line.current, 4.0);

        line.set_field(Field::Power, 460.0);
        line.derive_missing();
        assert_eq!(line.current, 2.0);
    }

    #[test]
    fn test_real_reading_replaces_estimate() {
        let mut line = phase(230.0, 0.0, 0.0);
        line.set_field(Field::Power, 920.0);
        line.derive_missing();
        line.set_field(Field::Current, 3.9);
        assert_eq!(line.derived(), None);

        line.set_field(Field::Power, 460.0);
        line.derive_missing();
        assert_eq!(line.current, 3.9);
    }

    #[test]
    fn test_clear_derived_resets_estimate() {
        let mut line = phase(230.0, 0.0, 920.0);
        line.derive_missing();
        assert_eq!(line.clear_derived(), Some(Field::Current));
        assert_eq!(line.current, 0.0);
        assert_eq!(line.clear_derived(), None);
    }

    #[test]
    fn test_paths() {
        let line = phase(230.0, 0.0, 0.0);
        assert_eq!(line.path(Field::Power), "/Ac/L1/Power");
        assert_eq!(line.path(Field::Exported), "/Ac/L1/Energy/Forward");
        assert_eq!(line.path(Field::Imported), "/Ac/L1/Energy/Reverse");
    }

    #[test]
    fn test_bindings_iter_skips_empty() {
        let topics = TopicBindings {
            power: "L1/Power".to_string(),
            exported: "L1/Export".to_string(),
            ..Default::default()
        };
        let bound: Vec<_> = topics.iter().collect();
        assert_eq!(
            bound,
            vec![(Field::Power, "L1/Power"), (Field::Exported, "L1/Export")]
        );
    }
}
