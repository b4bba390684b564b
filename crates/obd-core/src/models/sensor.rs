//! Live sensor readings

use serde::{Deserialize, Serialize};

/// One decoded parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Mode 01 parameter identifier
    pub pid: u8,
    /// Display name, e.g. "Engine RPM"
    pub name: String,
    pub value: f64,
    pub unit: String,
    /// Direction of change over the recent history
    #[serde(default)]
    pub trend: Trend,
    /// Recent values, oldest first; scoped to the link session that produced them
    #[serde(skip)]
    pub history: Vec<f64>,
}

impl SensorReading {
    pub fn new(pid: u8, name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            value,
            unit: unit.into(),
            trend: Trend::Unknown,
            history: Vec::new(),
        }
    }

    /// Attach a history window and derive the trend label from it
    pub fn with_history(mut self, history: Vec<f64>) -> Self {
        self.trend = Trend::from_history(&history);
        self.history = history;
        self
    }
}

/// Trend label derived from a rolling history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
    Steady,
    #[default]
    Unknown,
}

/// Relative change against the previous mean below which a value counts as steady
const STEADY_BAND: f64 = 0.02;

impl Trend {
    /// Compare the newest value with the mean of the earlier ones
    pub fn from_history(history: &[f64]) -> Trend {
        let Some((&latest, earlier)) = history.split_last() else {
            return Trend::Unknown;
        };
        if earlier.is_empty() {
            return Trend::Unknown;
        }
        let mean = earlier.iter().sum::<f64>() / earlier.len() as f64;
        let band = (mean.abs() * STEADY_BAND).max(f64::EPSILON);
        if latest - mean > band {
            Trend::Rising
        } else if mean - latest > band {
            Trend::Falling
        } else {
            Trend::Steady
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trend_from_history() {
        assert_eq!(Trend::from_history(&[]), Trend::Unknown);
        assert_eq!(Trend::from_history(&[90.0]), Trend::Unknown);
        assert_eq!(Trend::from_history(&[90.0, 91.0, 99.0]), Trend::Rising);
        assert_eq!(Trend::from_history(&[800.0, 790.0, 700.0]), Trend::Falling);
        assert_eq!(Trend::from_history(&[12.6, 12.6, 12.61]), Trend::Steady);
        assert_eq!(Trend::from_history(&[0.0, 0.0, 0.0]), Trend::Steady);
    }

    #[test]
    fn test_history_not_serialized() {
        let reading = SensorReading::new(0x05, "Coolant Temperature", 92.0, "°C")
            .with_history(vec![88.0, 92.0]);
        assert_eq!(reading.trend, Trend::Rising);

        let json = serde_json::to_value(&reading).unwrap();
        assert!(json.get("history").is_none());
        assert_eq!(json["trend"], "rising");
    }
}
