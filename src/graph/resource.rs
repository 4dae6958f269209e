//! Resource snapshot types.
//!
//! A [`CloudResource`] is an immutable copy of one live resource node taken at
//! a single point in time. Generators and watchers only ever see snapshots, so
//! concurrent metric updates can never produce a torn read.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of resource kinds in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Physical machine.
    Pm,
    /// Virtual machine hosted by a PM.
    Vm,
    /// Contained sub-resource (e.g. a service instance) hosted by a VM.
    Co,
    /// Logical grouping across physical owners.
    Tier,
}

impl ResourceType {
    /// Short upper-case label, as used in generator type names.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pm => "PM",
            Self::Vm => "VM",
            Self::Co => "CO",
            Self::Tier => "TIER",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pm" => Ok(Self::Pm),
            "vm" => Ok(Self::Vm),
            "co" => Ok(Self::Co),
            "tier" => Ok(Self::Tier),
            other => Err(format!("unknown resource type '{other}'")),
        }
    }
}

/// Physical machine metrics.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmMetrics {
    pub cpu_consumption: i64,
    pub ram_consumption: i64,
    pub disk_consumption: i64,
}

/// Virtual machine metrics.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmMetrics {
    pub vcpu_consumption: i64,
    pub ram_consumption: i64,
    pub disk_consumption: i64,
}

/// Contained resource metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoMetrics {
    /// Last observed response time, in milliseconds.
    pub response_time: i64,
}

/// Type-specific metrics, tagged by resource type.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceMetrics {
    Pm(PmMetrics),
    Vm(VmMetrics),
    Co(CoMetrics),
    Tier,
}

impl ResourceMetrics {
    /// The resource type these metrics belong to.
    #[must_use]
    pub const fn resource_type(&self) -> ResourceType {
        match self {
            Self::Pm(_) => ResourceType::Pm,
            Self::Vm(_) => ResourceType::Vm,
            Self::Co(_) => ResourceType::Co,
            Self::Tier => ResourceType::Tier,
        }
    }
}

/// Immutable snapshot of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudResource {
    /// Stable name, unique within the owning holder.
    pub name: String,
    /// Derived health score.
    pub score: i64,
    /// Name of the physical owner (PM for a VM, VM for a Co).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Name of the logical tier, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    /// Type-specific metrics.
    pub metrics: ResourceMetrics,
}

impl CloudResource {
    /// The type tag of this resource.
    #[must_use]
    pub const fn resource_type(&self) -> ResourceType {
        self.metrics.resource_type()
    }

    #[must_use]
    pub const fn as_pm(&self) -> Option<&PmMetrics> {
        match &self.metrics {
            ResourceMetrics::Pm(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_vm(&self) -> Option<&VmMetrics> {
        match &self.metrics {
            ResourceMetrics::Vm(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_co(&self) -> Option<&CoMetrics> {
        match &self.metrics {
            ResourceMetrics::Co(m) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_parses_case_insensitively() {
        assert_eq!("Co".parse::<ResourceType>().unwrap(), ResourceType::Co);
        assert_eq!(" VM ".parse::<ResourceType>().unwrap(), ResourceType::Vm);
        assert!("rack".parse::<ResourceType>().is_err());
    }

    #[test]
    fn snapshot_accessors_follow_tag() {
        let co = CloudResource {
            name: "co-1".to_string(),
            score: 3,
            parent: Some("vm-1".to_string()),
            tier: None,
            metrics: ResourceMetrics::Co(CoMetrics { response_time: 120 }),
        };
        assert_eq!(co.resource_type(), ResourceType::Co);
        assert_eq!(co.as_co().map(|m| m.response_time), Some(120));
        assert!(co.as_vm().is_none());
        assert!(co.as_pm().is_none());
    }

    #[test]
    fn snapshot_serializes_with_tagged_metrics() {
        let tier = CloudResource {
            name: "front".to_string(),
            score: 0,
            parent: None,
            tier: None,
            metrics: ResourceMetrics::Tier,
        };
        let json = serde_json::to_value(&tier).unwrap();
        assert_eq!(json["metrics"]["type"], "tier");
        assert!(json.get("parent").is_none());
    }
}
