use std::sync::Arc;

use crate::cluster::ClusterClient;
use crate::config::Settings;
use crate::edge::EdgeClient;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub cluster: ClusterClient,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(settings: Settings, cluster: ClusterClient) -> Self {
        AppState {
            settings: Arc::new(settings),
            cluster,
            http: reqwest::Client::new(),
        }
    }

    /// Edge client bound to one inbound request's Authorization header.
    pub fn edge_client(&self, authorization: &str) -> EdgeClient {
        EdgeClient::new(
            self.http.clone(),
            self.settings.edge_api_url.clone(),
            authorization.to_string(),
        )
    }
}
