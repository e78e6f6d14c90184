use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::HyphaeError;

/// Subscription tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Expert,
    Master,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Expert => "expert",
            Tier::Master => "master",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = HyphaeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "expert" => Ok(Tier::Expert),
            "master" => Ok(Tier::Master),
            other => Err(HyphaeError::InvalidInput(format!("unknown tier '{other}'"))),
        }
    }
}
