//! The `networks` pod annotation: model, parsing, and keyed-set diff.

use std::collections::BTreeMap;

use error_stack::Report;
use serde::Deserialize;

use crate::k8s::types::KubernetesError;

/// Pod annotation listing the pod's network attachments.
pub const NETWORKS_ANNOTATION: &str = "networks";

/// One entry of the `networks` annotation array.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkAttachment {
    #[serde(rename = "networkName")]
    pub network_name: String,
    #[serde(rename = "ifMAC", default)]
    pub if_mac: String,
    #[serde(rename = "isPrimary", default)]
    pub is_primary: bool,
    /// Makes the agent skip configuring this network.
    #[serde(rename = "podagentSkip", default)]
    pub podagent_skip: bool,
}

impl NetworkAttachment {
    /// Primary networks belong to the cluster's default CNI; skip-marked
    /// ones are declared but explicitly left alone.
    pub fn is_managed(&self) -> bool {
        !self.is_primary && !self.podagent_skip
    }

    pub fn property(&self) -> NetworkProperty {
        NetworkProperty {
            if_mac: self.if_mac.clone(),
            is_primary: self.is_primary,
            podagent_skip: self.podagent_skip,
        }
    }
}

/// The value triple the diff compares per network name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProperty {
    pub if_mac: String,
    pub is_primary: bool,
    pub podagent_skip: bool,
}

/// networkName → property triple; the set the differ operates on.
pub type NetworkMap = BTreeMap<String, NetworkProperty>;

/// Parse the raw annotation value.
pub fn parse_networks(annotation: &str) -> Result<Vec<NetworkAttachment>, Report<KubernetesError>> {
    serde_json::from_str(annotation).map_err(|e| {
        Report::new(KubernetesError::AnnotationParse {
            message: format!("invalid networks annotation: {e}"),
        })
    })
}

/// The managed subset of the annotation as a keyed map.
pub fn managed_network_map(networks: &[NetworkAttachment]) -> NetworkMap {
    networks
        .iter()
        .filter(|network| network.is_managed())
        .map(|network| (network.network_name.clone(), network.property()))
        .collect()
}

/// Network names present in `old` and gone from `new` entirely.
///
/// A name that merely changed its property triple is not "removed": it
/// shows up in [`added_networks`] instead, and the reconciler's drift branch
/// replays it with the new parameters.
pub fn removed_networks(old: &NetworkMap, new: &NetworkMap) -> Vec<String> {
    old.keys()
        .filter(|name| !new.contains_key(*name))
        .cloned()
        .collect()
}

/// Pairs of `new` that are absent from `old` or carry a changed triple.
pub fn added_networks(old: &NetworkMap, new: &NetworkMap) -> Vec<(String, NetworkProperty)> {
    new.iter()
        .filter(|(name, property)| old.get(*name) != Some(property))
        .map(|(name, property)| (name.clone(), property.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property(mac: &str) -> NetworkProperty {
        NetworkProperty {
            if_mac: mac.to_string(),
            is_primary: false,
            podagent_skip: false,
        }
    }

    #[test]
    fn parses_annotation_array() {
        let raw = r#"[
            {"networkName":"blue","ifMAC":"02:00:00:00:00:01","isPrimary":false,"podagentSkip":false},
            {"networkName":"mgmt","isPrimary":true}
        ]"#;

        let networks = parse_networks(raw).unwrap();
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].network_name, "blue");
        assert_eq!(networks[0].if_mac, "02:00:00:00:00:01");
        assert!(networks[0].is_managed());
        assert!(networks[1].is_primary);
        assert!(!networks[1].is_managed());
    }

    #[test]
    fn rejects_malformed_annotation() {
        let err = parse_networks("not json").unwrap_err();
        assert!(matches!(
            err.current_context(),
            KubernetesError::AnnotationParse { .. }
        ));
    }

    #[test]
    fn managed_map_filters_primary_and_skipped() {
        let raw = r#"[
            {"networkName":"blue","ifMAC":"02:00:00:00:00:01"},
            {"networkName":"mgmt","isPrimary":true},
            {"networkName":"red","podagentSkip":true}
        ]"#;

        let map = managed_network_map(&parse_networks(raw).unwrap());
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("blue"));
    }

    #[test]
    fn diff_reports_added_and_removed() {
        let old: NetworkMap = [("blue".to_string(), property("02:00:00:00:00:01"))].into();
        let new: NetworkMap = [("red".to_string(), property("02:00:00:00:00:02"))].into();

        assert_eq!(removed_networks(&old, &new), ["blue"]);
        let added = added_networks(&old, &new);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].0, "red");
    }

    #[test]
    fn changed_triple_is_added_not_removed() {
        let old: NetworkMap = [("blue".to_string(), property("02:00:00:00:00:01"))].into();
        let new: NetworkMap = [("blue".to_string(), property("02:00:00:00:00:02"))].into();

        assert!(removed_networks(&old, &new).is_empty());
        let added = added_networks(&old, &new);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].1.if_mac, "02:00:00:00:00:02");
    }

    #[test]
    fn unchanged_triple_is_no_action() {
        let map: NetworkMap = [("blue".to_string(), property("02:00:00:00:00:01"))].into();

        assert!(removed_networks(&map, &map.clone()).is_empty());
        assert!(added_networks(&map, &map.clone()).is_empty());
    }
}
