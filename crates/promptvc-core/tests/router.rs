//! Traffic router determinism.

use promptvc_core::{route, RoutingConfig, VersionWeight};
use proptest::prelude::*;

fn stable_canary(stable: u32, canary: u32) -> RoutingConfig {
    RoutingConfig::new(vec![
        VersionWeight::stable("stable", stable),
        VersionWeight::canary("canary", canary),
    ])
}

#[test]
fn same_identifier_resolves_identically_across_calls() {
    let config = stable_canary(90, 10);
    let first = route("user123", &config).unwrap();
    for _ in 0..1000 {
        assert_eq!(route("user123", &config).unwrap(), first);
    }
}

#[test]
fn rebuilt_config_routes_identically() {
    let a = stable_canary(90, 10).with_experiment("exp-1");
    let b: RoutingConfig = serde_json::from_value(serde_json::json!({
        "experiment_id": "exp-1",
        "versions": [
            {"version": "canary", "weight": 10, "canary": true},
            {"version": "stable", "weight": 90},
        ]
    }))
    .unwrap();
    for i in 0..200 {
        let id = format!("session-{i}");
        assert_eq!(route(&id, &a).unwrap(), route(&id, &b).unwrap());
    }
}

proptest! {
    #[test]
    fn routing_is_idempotent(
        id in ".{0,40}",
        weights in prop::collection::vec(0u32..100, 1..6),
    ) {
        let versions: Vec<VersionWeight> = weights
            .iter()
            .enumerate()
            .map(|(i, w)| VersionWeight {
                version: format!("v{i}"),
                weight: *w,
                canary: i > 0,
            })
            .collect();
        let config = RoutingConfig::new(versions);
        prop_assume!(config.total_weight() > 0);

        let a = route(&id, &config).unwrap();
        let b = route(&id, &config).unwrap();
        prop_assert_eq!(&a, &b);
        let chosen = config.versions.iter().find(|v| v.version == a.version).unwrap();
        prop_assert!(chosen.weight > 0);
    }
}
