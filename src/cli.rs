use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gangway")]
#[command(about = "Control-plane facade for tenant environments and deployments")]
#[command(version)]
pub struct Args {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Bind address for the server
    #[arg(long, default_value = "0.0.0.0", env = "GANGWAY_BIND_ADDR")]
    pub bind_addr: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 9000, env = "GANGWAY_PORT")]
    pub port: u16,

    /// Path to a .env file for loading configuration
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Base URL of the edge-routing management API
    #[arg(
        long,
        env = "GANGWAY_EDGE_API_URL",
        default_value = "https://api.edge.example.com/"
    )]
    pub edge_api_url: String,

    /// Mirror routing credentials into the edge key-value store and allow
    /// valueFrom environment-variable resolution
    #[arg(long, env = "GANGWAY_ROUTING_KVM")]
    pub routing_kvm: bool,

    /// Resolve externally visible hostnames from the edge API when
    /// provisioning an environment
    #[arg(long, env = "GANGWAY_SYNC_HOSTS")]
    pub sync_hosts: bool,

    /// Annotate new namespaces with a default-deny ingress network policy
    #[arg(long, env = "GANGWAY_ISOLATE_NAMESPACES")]
    pub isolate_namespaces: bool,

    /// Allow deployments to run privileged containers
    #[arg(long, env = "GANGWAY_ALLOW_PRIVILEGED")]
    pub allow_privileged: bool,

    /// Container registry base URI for synthesized pod templates (required
    /// for deployment creation)
    #[arg(long, env = "GANGWAY_IMAGE_BASE_URI", default_value = "")]
    pub image_base_uri: String,

    /// Pod CIDR referenced by the routing-policy annotation
    #[arg(long, env = "GANGWAY_POD_CIDR", default_value = "10.1.0.0/16")]
    pub pod_cidr: String,
}
