//! Generation capabilities offered by the fleet.
//!
//! Each capability is served by exactly one worker. The lowercase name is
//! used in URLs, output folder names and log tags.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Image,
    Mesh,
    Rig,
    Motion,
    Speech,
    Audio,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Image,
        Capability::Mesh,
        Capability::Rig,
        Capability::Motion,
        Capability::Speech,
        Capability::Audio,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Mesh => "mesh",
            Self::Rig => "rig",
            Self::Motion => "motion",
            Self::Speech => "speech",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Unknown capability: '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_names() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
    }

    #[test]
    fn parse_unknown_name_fails() {
        assert!("video".parse::<Capability>().is_err());
    }

    #[test]
    fn serde_uses_lowercase() {
        let json = serde_json::to_string(&Capability::Speech).unwrap();
        assert_eq!(json, "\"speech\"");
    }
}
