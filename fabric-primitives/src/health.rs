//! Health snapshots produced by agents on demand.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall or per-component health classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Fully operational.
    Ok,
    /// Operational with reduced capacity or a failing non-critical check.
    Degraded,
    /// Not operational.
    Unhealthy,
}

impl HealthStatus {
    /// Returns the lowercase wire token for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Result of a single named component check.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Status of the component.
    pub status: HealthStatus,
    /// Optional human-readable detail, e.g. a failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    /// A passing check with no detail.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            status: HealthStatus::Ok,
            detail: None,
        }
    }

    /// A check at the given status with a detail message.
    #[must_use]
    pub fn with_detail(status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
        }
    }
}

/// Point-in-time health report for one agent.
///
/// The top-level status is derived from the component checks at construction
/// time: any `Unhealthy` check forces the snapshot away from `Ok`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    status: HealthStatus,
    uptime_seconds: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    checks: BTreeMap<String, ComponentHealth>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metrics: BTreeMap<String, f64>,
    epoch: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Builds a snapshot, deriving the top-level status from `checks`.
    #[must_use]
    pub fn from_checks(
        uptime_seconds: u64,
        checks: BTreeMap<String, ComponentHealth>,
        metrics: BTreeMap<String, f64>,
    ) -> Self {
        let status = derive_status(&checks);
        Self {
            status,
            uptime_seconds,
            checks,
            metrics,
            epoch: Utc::now(),
        }
    }

    /// Returns the derived top-level status.
    #[must_use]
    pub const fn status(&self) -> HealthStatus {
        self.status
    }

    /// Returns seconds since the agent finished startup.
    #[must_use]
    pub const fn uptime_seconds(&self) -> u64 {
        self.uptime_seconds
    }

    /// Returns the component check results.
    #[must_use]
    pub const fn checks(&self) -> &BTreeMap<String, ComponentHealth> {
        &self.checks
    }

    /// Returns counter and gauge values reported by the agent.
    #[must_use]
    pub const fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    /// Returns the wall-clock time the snapshot was taken.
    #[must_use]
    pub const fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }
}

fn derive_status(checks: &BTreeMap<String, ComponentHealth>) -> HealthStatus {
    let mut status = HealthStatus::Ok;
    for check in checks.values() {
        match check.status {
            HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
            HealthStatus::Degraded => status = HealthStatus::Degraded,
            HealthStatus::Ok => {}
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(entries: &[(&str, HealthStatus)]) -> BTreeMap<String, ComponentHealth> {
        entries
            .iter()
            .map(|(name, status)| {
                (
                    (*name).to_string(),
                    ComponentHealth {
                        status: *status,
                        detail: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn all_ok_yields_ok() {
        let snapshot = HealthSnapshot::from_checks(
            5,
            checks(&[("self", HealthStatus::Ok), ("endpoints", HealthStatus::Ok)]),
            BTreeMap::new(),
        );
        assert_eq!(snapshot.status(), HealthStatus::Ok);
    }

    #[test]
    fn unhealthy_check_never_yields_ok() {
        let snapshot = HealthSnapshot::from_checks(
            5,
            checks(&[
                ("self", HealthStatus::Ok),
                ("registry", HealthStatus::Unhealthy),
            ]),
            BTreeMap::new(),
        );
        assert_eq!(snapshot.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn degraded_check_degrades_snapshot() {
        let snapshot = HealthSnapshot::from_checks(
            5,
            checks(&[
                ("self", HealthStatus::Ok),
                ("endpoints", HealthStatus::Degraded),
            ]),
            BTreeMap::new(),
        );
        assert_eq!(snapshot.status(), HealthStatus::Degraded);
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let json = r#"{
            "status": "ok",
            "uptime_seconds": 9,
            "epoch": "2026-01-05T00:00:00Z",
            "gpu_vram_free": 123456
        }"#;
        let snapshot: HealthSnapshot = serde_json::from_str(json).expect("decode");
        assert_eq!(snapshot.status(), HealthStatus::Ok);
        assert_eq!(snapshot.uptime_seconds(), 9);
    }
}
