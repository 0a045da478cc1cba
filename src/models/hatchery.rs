use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A registered compute-provisioning service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hatchery {
    pub id: Uuid,
    pub name: String,
    /// Worker model type it can spawn (`docker`, `openstack`, ...)
    pub model_type: String,
    /// PEM public key verifying worker spawn tokens
    pub public_key: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_status: Option<HatcheryStatus>,
}

impl Hatchery {
    pub fn new(name: &str, model_type: &str, public_key: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            model_type: model_type.to_string(),
            public_key: public_key.to_string(),
            last_heartbeat: None,
            last_status: None,
        }
    }
}

/// Monitoring status reported with a heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HatcheryStatus {
    pub version: String,
    /// Workers currently being spawned
    pub spawning: u32,
    /// Maximum number of workers
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: Uuid,
    pub name: String,
}

impl Region {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionRole {
    /// May spawn workers for jobs of the region
    Spawn,
    Manage,
}

impl RegionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawn => "Spawn",
            Self::Manage => "Manage",
        }
    }
}

impl fmt::Display for RegionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RegionRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Spawn" => Ok(Self::Spawn),
            "Manage" => Ok(Self::Manage),
            _ => Err(format!("Invalid region role: {s}")),
        }
    }
}

/// RBAC rule `(region, hatchery, role)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionGrant {
    pub region: String,
    pub hatchery_name: String,
    pub role: RegionRole,
}

impl RegionGrant {
    pub fn spawn(region: &str, hatchery_name: &str) -> Self {
        Self {
            region: region.to_string(),
            hatchery_name: hatchery_name.to_string(),
            role: RegionRole::Spawn,
        }
    }
}
