//! Well-known sensor ids carried in sensor-data packets.

use std::fmt;

/// Supported sensors. Any id outside this set is rejected.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SensorId {
    /// Photo resistor reading.
    LightIntensity,
    /// Water content of the soil.
    SoilMoisture,
    AirTemperature,
    AirHumidity,
}

impl SensorId {
    pub const ALL: [SensorId; 4] = [
        SensorId::LightIntensity,
        SensorId::SoilMoisture,
        SensorId::AirTemperature,
        SensorId::AirHumidity,
    ];

    /// Reading reported for a sensor that has not produced a value.
    pub const DEFAULT_READING: f64 = -1.0;

    pub fn as_byte(self) -> u8 {
        match self {
            SensorId::LightIntensity => 1,
            SensorId::SoilMoisture => 2,
            SensorId::AirTemperature => 3,
            SensorId::AirHumidity => 4,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(SensorId::LightIntensity),
            2 => Some(SensorId::SoilMoisture),
            3 => Some(SensorId::AirTemperature),
            4 => Some(SensorId::AirHumidity),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SensorId::LightIntensity => "Light Intensity",
            SensorId::SoilMoisture => "Soil Moisture",
            SensorId::AirTemperature => "Temperature",
            SensorId::AirHumidity => "Humidity",
        }
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
