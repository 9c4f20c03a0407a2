//! Leaf identity: the role a peer declares when it registers.

use std::fmt;

use serde::Deserialize;

/// Role of a leaf. Decides which branch of the stem services it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    /// A node reporting sensor readings.
    SensorEndpoint,
    /// A mobile client consuming readings.
    MobileUser,
}

impl Identity {
    pub const ALL: [Identity; 2] = [Identity::SensorEndpoint, Identity::MobileUser];

    /// Wire representation (one byte).
    pub fn as_byte(self) -> u8 {
        match self {
            Identity::SensorEndpoint => 0,
            Identity::MobileUser => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Identity::SensorEndpoint),
            1 => Some(Identity::MobileUser),
            _ => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::SensorEndpoint => f.write_str("sensor endpoint"),
            Identity::MobileUser => f.write_str("mobile user"),
        }
    }
}
