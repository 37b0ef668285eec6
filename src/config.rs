use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::units::{DataRate, TimeDelta};

/// KeyValueConfig is the lookup consulted for field-trial style
/// configuration. It is injected at construction so tests can override
/// individual experiments; the controller performs no global reads.
pub trait KeyValueConfig {
    /// lookup returns the group string registered for the given trial key,
    /// or an empty string when the trial is not configured.
    fn lookup(&self, key: &str) -> &str;
}

/// FieldTrials is a simple map-backed KeyValueConfig.
#[derive(Default, Debug, Clone)]
pub struct FieldTrials {
    trials: HashMap<String, String>,
}

impl FieldTrials {
    pub fn new() -> Self {
        FieldTrials::default()
    }

    /// set registers a group string for a trial key, replacing any
    /// previous value.
    pub fn set(mut self, key: &str, group: &str) -> Self {
        self.trials.insert(key.to_owned(), group.to_owned());
        self
    }
}

impl KeyValueConfig for FieldTrials {
    fn lookup(&self, key: &str) -> &str {
        self.trials.get(key).map(|s| s.as_str()).unwrap_or("")
    }
}

/// TrialGroup splits a group string of the form
/// `Enabled,key:value,other_key:value` into flags and keyed parameters.
/// Malformed values are reported by the typed getters, which log a warning
/// and keep the default.
#[derive(Debug, Default)]
pub(crate) struct TrialGroup {
    entries: Vec<(String, Option<String>)>,
}

impl TrialGroup {
    pub(crate) fn new(group: &str) -> Self {
        let entries = group
            .split(',')
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once(':') {
                Some((key, value)) => (key.to_owned(), Some(value.to_owned())),
                None => (part.to_owned(), None),
            })
            .collect();
        TrialGroup { entries }
    }

    pub(crate) fn has_flag(&self, key: &str) -> bool {
        self.entries
            .iter()
            .any(|(k, v)| k == key && v.is_none())
    }

    fn value_of(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    pub(crate) fn parameter_f64(&self, key: &str, default: f64) -> f64 {
        match self.value_of(key).map(parse_f64) {
            Some(Ok(value)) => value,
            Some(Err(err)) => {
                log::warn!("failed to parse trial parameter {}: {}", key, err);
                default
            }
            None => default,
        }
    }

    pub(crate) fn parameter_time_delta(&self, key: &str, default: TimeDelta) -> TimeDelta {
        match self.value_of(key).map(parse_time_delta) {
            Some(Ok(value)) => value,
            Some(Err(err)) => {
                log::warn!("failed to parse trial parameter {}: {}", key, err);
                default
            }
            None => default,
        }
    }

    pub(crate) fn parameter_data_rate(&self, key: &str, default: DataRate) -> DataRate {
        match self.value_of(key).map(parse_data_rate) {
            Some(Ok(value)) => value,
            Some(Err(err)) => {
                log::warn!("failed to parse trial parameter {}: {}", key, err);
                default
            }
            None => default,
        }
    }
}

fn parse_f64(value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| Error::ErrInvalidFieldTrialValue(value.to_owned()))
}

/// Durations accept a unit suffix (`s`, `ms`, `us`); a bare number is
/// interpreted as milliseconds.
fn parse_time_delta(value: &str) -> Result<TimeDelta> {
    let (number, unit) = split_unit(value);
    let parsed = number
        .parse::<i64>()
        .map_err(|_| Error::ErrInvalidFieldTrialValue(value.to_owned()))?;
    match unit {
        "" | "ms" => Ok(TimeDelta::from_millis(parsed)),
        "s" => Ok(TimeDelta::from_secs(parsed)),
        "us" => Ok(TimeDelta::from_micros(parsed)),
        _ => Err(Error::ErrInvalidFieldTrialValue(value.to_owned())),
    }
}

/// Rates accept a unit suffix (`bps`, `kbps`); a bare number is
/// interpreted as kilobits per second.
fn parse_data_rate(value: &str) -> Result<DataRate> {
    let (number, unit) = split_unit(value);
    let parsed = number
        .parse::<i64>()
        .map_err(|_| Error::ErrInvalidFieldTrialValue(value.to_owned()))?;
    match unit {
        "" | "kbps" => Ok(DataRate::from_kbps(parsed)),
        "bps" => Ok(DataRate::from_bps(parsed)),
        _ => Err(Error::ErrInvalidFieldTrialValue(value.to_owned())),
    }
}

fn split_unit(value: &str) -> (&str, &str) {
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '-')
        .unwrap_or(value.len());
    value.split_at(split)
}
