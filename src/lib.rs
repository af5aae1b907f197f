//! Control-plane facade: REST provisioning of tenant environments and
//! deployments, synchronized with an external edge-routing API.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod edge;
pub mod error;
pub mod provision;
pub mod reconcile;
pub mod server;
pub mod template;

pub use error::Error;
