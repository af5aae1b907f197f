//! Process configuration.
//!
//! All feature toggles live in an immutable [`Settings`] value constructed
//! once at startup and passed explicitly into each component. Nothing reads
//! them from ambient global state after that.

use crate::cli::Args;

/// Immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Edge API base URL, normalized to end with a slash.
    pub edge_api_url: String,
    /// Mirror routing credentials into the edge KVM and permit valueFrom
    /// environment-variable resolution.
    pub routing_kvm_enabled: bool,
    /// Resolve hostnames from the edge API during provisioning.
    pub sync_hosts_enabled: bool,
    /// Annotate new namespaces with a default-deny ingress policy.
    pub isolate_namespaces: bool,
    /// Permit privileged containers in synthesized pod templates.
    pub allow_privileged: bool,
    /// Registry base for synthesized container images. Empty means
    /// deployment synthesis is refused.
    pub image_base_uri: String,
    /// Pod CIDR referenced by the routing-policy annotation.
    pub pod_cidr: String,
}

impl Settings {
    pub fn from_args(args: &Args) -> Self {
        let mut edge_api_url = args.edge_api_url.clone();
        if !edge_api_url.ends_with('/') {
            edge_api_url.push('/');
        }
        Settings {
            edge_api_url,
            routing_kvm_enabled: args.routing_kvm,
            sync_hosts_enabled: args.sync_hosts,
            isolate_namespaces: args.isolate_namespaces,
            allow_privileged: args.allow_privileged,
            image_base_uri: args.image_base_uri.trim_end_matches('/').to_string(),
            pod_cidr: args.pod_cidr.clone(),
        }
    }
}
