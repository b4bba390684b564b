//! Vehicle identity

use serde::{Deserialize, Serialize};

/// Caller-supplied vehicle reference
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleContext {
    /// Identifier used for the one-session-per-vehicle rule and storage lookups
    pub vehicle_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mileage: Option<u32>,
}

impl VehicleContext {
    pub fn new(vehicle_id: impl Into<String>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            ..Default::default()
        }
    }

    /// "2015 Honda Civic", falling back to the vehicle id
    pub fn display_name(&self) -> String {
        let parts: Vec<String> = [
            self.year.map(|y| y.to_string()),
            self.make.clone(),
            self.model.clone(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if parts.is_empty() {
            self.vehicle_id.clone()
        } else {
            parts.join(" ")
        }
    }
}

/// Identification read from the vehicle (mode 09) and the link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecu_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name() {
        let mut vehicle = VehicleContext::new("car-1");
        assert_eq!(vehicle.display_name(), "car-1");

        vehicle.year = Some(2015);
        vehicle.make = Some("Honda".into());
        vehicle.model = Some("Civic".into());
        assert_eq!(vehicle.display_name(), "2015 Honda Civic");
    }
}
