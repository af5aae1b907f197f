//! Typed client for the edge-routing management API.
//!
//! The control plane consumes three capabilities from the edge system:
//! virtual-host alias resolution, conflict-aware writes to the routing
//! key-value map, and single-entry KVM reads for indirect environment
//! variables. [`EdgeApi`] is the seam; [`client::EdgeClient`] is the real
//! HTTP implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

mod client;

pub use client::EdgeClient;

/// Key-value map holding the environment's routing credential.
pub const ROUTING_KVM_NAME: &str = "edge-routing";

/// Entry key the external-facing API key is stored under.
pub const ROUTING_KVM_KEY: &str = "x-routing-api-key";

/// Org property that selects the per-entry KVM update endpoint.
pub const CPS_PROPERTY: &str = "features.isCpsEnabled";

#[derive(Error, Debug)]
pub enum EdgeError {
    #[error("edge API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{operation} returned status {status}{detail}")]
    Status {
        operation: &'static str,
        status: u16,
        detail: String,
    },
}

impl EdgeError {
    pub fn status(operation: &'static str, status: u16) -> Self {
        EdgeError::Status {
            operation,
            status,
            detail: String::new(),
        }
    }

    pub fn status_with_detail(operation: &'static str, status: u16, detail: String) -> Self {
        let detail = if detail.is_empty() {
            detail
        } else {
            format!(": {detail}")
        };
        EdgeError::Status {
            operation,
            status,
            detail,
        }
    }
}

/// One key-value entry in a routing KVM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KvmEntry {
    pub name: String,
    pub value: String,
}

/// Whole-map KVM payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvmBody {
    pub name: String,
    pub entry: Vec<KvmEntry>,
}

/// Error payload the edge API returns on a failed KVM update.
#[derive(Debug, Deserialize)]
pub struct EdgeFailure {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub contexts: Vec<String>,
}

/// Virtual host detail; only the alias list matters here. A response
/// without `hostAliases` is malformed and fails decoding.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHost {
    pub host_aliases: Vec<String>,
}

/// Organization detail, reduced to the property bag we probe.
#[derive(Debug, Default, Deserialize)]
pub struct Organization {
    #[serde(default)]
    pub properties: OrgProperties,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrgProperties {
    #[serde(default)]
    pub property: Vec<OrgProperty>,
}

#[derive(Debug, Deserialize)]
pub struct OrgProperty {
    pub name: String,
    pub value: String,
}

impl Organization {
    /// Named-property lookup over the org's property list.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .property
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Whether the org stores KVMs in compact (CPS) mode.
    pub fn cps_enabled(&self) -> bool {
        self.property(CPS_PROPERTY) == Some("true")
    }
}

/// Capabilities the control plane consumes from the edge-routing API.
#[async_trait]
pub trait EdgeApi: Send + Sync {
    /// Resolve the deduplicated set of externally visible hostnames for an
    /// environment. Per-virtual-host lookups run concurrently; the first
    /// error aborts the resolution (in-flight lookups finish in the
    /// background and are discarded).
    async fn resolve_hosts(&self, org: &str, env: &str) -> Result<BTreeSet<String>, EdgeError>;

    /// Store the routing credential in the environment's KVM. Creates the
    /// map, and on conflict updates the existing entry instead; the update
    /// endpoint depends on the org's compact-storage mode.
    async fn write_routing_key(&self, org: &str, env: &str, value: &str) -> Result<(), EdgeError>;

    /// Read a single KVM entry value.
    async fn read_kvm_entry(
        &self,
        org: &str,
        env: &str,
        map: &str,
        key: &str,
    ) -> Result<String, EdgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn org_property_lookup() {
        let org: Organization = serde_json::from_str(
            r#"{
                "name": "acme",
                "properties": {
                    "property": [
                        {"name": "features.isCpsEnabled", "value": "true"},
                        {"name": "other", "value": "x"}
                    ]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(org.property("other"), Some("x"));
        assert!(org.cps_enabled());
    }

    #[test]
    fn org_without_properties_is_not_cps() {
        let org: Organization = serde_json::from_str(r#"{"name": "acme"}"#).unwrap();
        assert_eq!(org.property(CPS_PROPERTY), None);
        assert!(!org.cps_enabled());
    }

    #[test]
    fn virtual_host_requires_alias_list() {
        let ok: Result<VirtualHost, _> =
            serde_json::from_str(r#"{"hostAliases": ["a.example.com"], "port": "80"}"#);
        assert_eq!(ok.unwrap().host_aliases, vec!["a.example.com"]);

        let missing: Result<VirtualHost, _> = serde_json::from_str(r#"{"port": "80"}"#);
        assert!(missing.is_err());
    }
}
