//! Consistent-hash traffic router for A/B and canary exposure.
//!
//! [`route`] is a pure function of an identifier and a [`RoutingConfig`]. The
//! identifier is hashed together with a fingerprint of the version set, the
//! hash picks a point in `[0, total_weight)`, and the version whose cumulative
//! weight interval contains that point wins. Versions are walked in natural
//! version order (`v2` before `v10`) so the intervals do not depend on the
//! order the caller listed them in.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::obs;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("routing config has no versions")]
    NoVersions,

    #[error("routing config total weight is zero")]
    ZeroWeight,

    #[error("version `{0}` listed more than once")]
    DuplicateVersion(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionWeight {
    pub version: String,
    /// Relative share of traffic. Zero keeps the version listed but unreachable.
    pub weight: u32,
    #[serde(default)]
    pub canary: bool,
}

impl VersionWeight {
    pub fn stable(version: impl Into<String>, weight: u32) -> Self {
        Self {
            version: version.into(),
            weight,
            canary: false,
        }
    }

    pub fn canary(version: impl Into<String>, weight: u32) -> Self {
        Self {
            version: version.into(),
            weight,
            canary: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub versions: Vec<VersionWeight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
}

impl RoutingConfig {
    pub fn new(versions: Vec<VersionWeight>) -> Self {
        Self {
            versions,
            experiment_id: None,
        }
    }

    pub fn with_experiment(mut self, experiment_id: impl Into<String>) -> Self {
        self.experiment_id = Some(experiment_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), RouterError> {
        if self.versions.is_empty() {
            return Err(RouterError::NoVersions);
        }
        let mut seen = BTreeSet::new();
        for v in &self.versions {
            if !seen.insert(v.version.as_str()) {
                return Err(RouterError::DuplicateVersion(v.version.clone()));
            }
        }
        if self.total_weight() == 0 {
            return Err(RouterError::ZeroWeight);
        }
        Ok(())
    }

    pub fn total_weight(&self) -> u64 {
        self.versions.iter().map(|v| u64::from(v.weight)).sum()
    }

    /// Versions in routing order.
    pub fn ordered(&self) -> Vec<&VersionWeight> {
        let mut ordered: Vec<&VersionWeight> = self.versions.iter().collect();
        ordered.sort_by(|a, b| natural_cmp(&a.version, &b.version));
        ordered
    }

    /// Hex SHA-256 over the ordered version names. Weights are excluded, so
    /// adjusting a split keeps each identifier's hash point fixed.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for v in self.ordered() {
            hasher.update(v.version.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingAssignment {
    pub identifier: String,
    pub version: String,
    pub is_canary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    /// Hash point in `[0, 1)`.
    pub position: f64,
}

/// Compare version strings with digit runs ordered numerically.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a, b);
    loop {
        match (a.chars().next(), b.chars().next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let da = a.len() - a.trim_start_matches(|c: char| c.is_ascii_digit()).len();
                let db = b.len() - b.trim_start_matches(|c: char| c.is_ascii_digit()).len();
                let (na, nb) = (a[..da].trim_start_matches('0'), b[..db].trim_start_matches('0'));
                let ord = na
                    .len()
                    .cmp(&nb.len())
                    .then_with(|| na.cmp(nb))
                    .then_with(|| da.cmp(&db));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[da..];
                b = &b[db..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a = &a[x.len_utf8()..];
                b = &b[y.len_utf8()..];
            }
        }
    }
}

fn hash_point(identifier: &str, fingerprint: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    hasher.update([0x1f]);
    hasher.update(fingerprint.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Resolve `identifier` to a version under `config`.
pub fn route(identifier: &str, config: &RoutingConfig) -> Result<RoutingAssignment, RouterError> {
    config.validate()?;
    let total = config.total_weight();
    let h = hash_point(identifier, &config.fingerprint());
    // Scale into [0, total) without floating point.
    let point = ((u128::from(h) * u128::from(total)) >> 64) as u64;

    let ordered = config.ordered();
    let mut upper = 0u64;
    let mut chosen = ordered[ordered.len() - 1];
    for v in ordered {
        upper += u64::from(v.weight);
        if point < upper {
            chosen = v;
            break;
        }
    }

    let position = h as f64 / 2f64.powi(64);
    obs::emit_route_assigned(&chosen.version, chosen.canary, position);
    Ok(RoutingAssignment {
        identifier: identifier.to_string(),
        version: chosen.version.clone(),
        is_canary: chosen.canary,
        experiment_id: config.experiment_id.clone(),
        position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(stable: u32, canary: u32) -> RoutingConfig {
        RoutingConfig::new(vec![
            VersionWeight::stable("v1", stable),
            VersionWeight::canary("v2", canary),
        ])
    }

    #[test]
    fn test_natural_order() {
        let mut names = vec!["v10", "v2", "v1.10", "v1.9", "v02"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["v1.9", "v1.10", "v2", "v02", "v10"]);
    }

    #[test]
    fn test_listing_order_does_not_matter() {
        let a = split(90, 10);
        let mut b = a.clone();
        b.versions.reverse();
        assert_eq!(a.fingerprint(), b.fingerprint());
        for id in ["alice", "bob", "user123", ""] {
            assert_eq!(route(id, &a).unwrap(), route(id, &b).unwrap());
        }
    }

    #[test]
    fn test_full_weight_always_wins() {
        let cfg = split(0, 5);
        for i in 0..50 {
            let a = route(&format!("user{i}"), &cfg).unwrap();
            assert_eq!(a.version, "v2");
            assert!(a.is_canary);
        }
    }

    #[test]
    fn test_split_is_roughly_honoured() {
        let cfg = split(90, 10);
        let canary = (0..2000)
            .filter(|i| route(&format!("user{i}"), &cfg).unwrap().is_canary)
            .count();
        assert!((120..=280).contains(&canary), "canary share {canary}/2000");
    }

    #[test]
    fn test_growing_canary_only_moves_stable_users() {
        let (small, large) = (split(90, 10), split(50, 50));
        for i in 0..500 {
            let id = format!("user{i}");
            if route(&id, &small).unwrap().is_canary {
                assert!(route(&id, &large).unwrap().is_canary, "{id} left the canary");
            }
        }
    }

    #[test]
    fn test_invalid_configs() {
        assert_eq!(
            route("x", &RoutingConfig::new(Vec::new())).unwrap_err(),
            RouterError::NoVersions
        );
        assert_eq!(route("x", &split(0, 0)).unwrap_err(), RouterError::ZeroWeight);
        let dup = RoutingConfig::new(vec![
            VersionWeight::stable("v1", 1),
            VersionWeight::canary("v1", 1),
        ]);
        assert_eq!(
            route("x", &dup).unwrap_err(),
            RouterError::DuplicateVersion("v1".into())
        );
    }

    #[test]
    fn test_experiment_id_carried() {
        let a = route("u", &split(1, 1).with_experiment("exp-7")).unwrap();
        assert_eq!(a.experiment_id.as_deref(), Some("exp-7"));
        assert!((0.0..1.0).contains(&a.position));
    }
}
