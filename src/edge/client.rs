use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    EdgeApi, EdgeError, EdgeFailure, KvmBody, KvmEntry, Organization, VirtualHost,
    ROUTING_KVM_KEY, ROUTING_KVM_NAME,
};

/// HTTP implementation of [`EdgeApi`].
///
/// Carries the caller's bearer token: the inbound `Authorization` header is
/// forwarded verbatim on every edge request, so each client instance is
/// scoped to one inbound request.
#[derive(Clone)]
pub struct EdgeClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl EdgeClient {
    /// `base_url` must end with a slash; `token` is the raw Authorization
    /// header value to pass through.
    pub fn new(http: reqwest::Client, base_url: String, token: String) -> Self {
        EdgeClient {
            http,
            base_url,
            token,
        }
    }

    fn env_url(&self, org: &str, env: &str, tail: &str) -> String {
        format!(
            "{}v1/organizations/{}/environments/{}/{}",
            self.base_url, org, env, tail
        )
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, EdgeError> {
        Ok(self
            .http
            .get(url)
            .header(AUTHORIZATION, &self.token)
            .send()
            .await?)
    }

    async fn post_json<B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<reqwest::Response, EdgeError> {
        Ok(self
            .http
            .post(url)
            .header(AUTHORIZATION, &self.token)
            .header(CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?)
    }

    /// Fetch the alias list for one virtual host.
    async fn host_aliases(
        &self,
        org: &str,
        env: &str,
        virtual_host: &str,
    ) -> Result<Vec<String>, EdgeError> {
        let url = self.env_url(org, env, &format!("virtualhosts/{virtual_host}"));
        let resp = self.get(&url).await?;
        if resp.status().as_u16() != 200 {
            return Err(EdgeError::status(
                "virtual host lookup",
                resp.status().as_u16(),
            ));
        }
        let vh: VirtualHost = resp.json().await?;
        Ok(vh.host_aliases)
    }

    async fn cps_enabled(&self, org: &str) -> Result<bool, EdgeError> {
        let url = format!("{}v1/organizations/{}", self.base_url, org);
        let resp = self.get(&url).await?;
        if resp.status().as_u16() != 200 {
            return Err(EdgeError::status(
                "organization lookup",
                resp.status().as_u16(),
            ));
        }
        let org: Organization = resp.json().await?;
        Ok(org.cps_enabled())
    }

    /// Update an existing KVM after a create conflict. Compact (CPS) orgs
    /// take a single-entry write on the narrow endpoint; everything else
    /// must replace the whole map body.
    async fn update_routing_key(
        &self,
        org: &str,
        env: &str,
        entry: &KvmEntry,
    ) -> Result<(), EdgeError> {
        let map_url = self.env_url(org, env, &format!("keyvaluemaps/{ROUTING_KVM_NAME}"));
        let resp = if self.cps_enabled(org).await? {
            let entry_url = format!("{}/entries/{}", map_url, entry.name);
            debug!(url = %entry_url, "updating routing KVM entry (compact mode)");
            self.post_json(&entry_url, entry).await?
        } else {
            let body = KvmBody {
                name: ROUTING_KVM_NAME.to_string(),
                entry: vec![entry.clone()],
            };
            debug!(url = %map_url, "updating routing KVM (whole map)");
            self.post_json(&map_url, &body).await?
        };

        let status = resp.status().as_u16();
        if status != 200 {
            let detail = resp
                .json::<EdgeFailure>()
                .await
                .map(|f| f.message)
                .unwrap_or_default();
            return Err(EdgeError::status_with_detail(
                "routing KVM update",
                status,
                detail,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EdgeApi for EdgeClient {
    async fn resolve_hosts(&self, org: &str, env: &str) -> Result<BTreeSet<String>, EdgeError> {
        let url = self.env_url(org, env, "virtualhosts");
        let resp = self.get(&url).await?;
        if resp.status().as_u16() != 200 {
            return Err(EdgeError::status(
                "virtual hosts listing",
                resp.status().as_u16(),
            ));
        }
        let virtual_hosts: Vec<String> = resp.json().await?;

        // One task per virtual host. The channel is sized to hold every
        // result so tasks still running after a first-error return never
        // block on send; their results are simply dropped with the receiver.
        let (tx, mut rx) = mpsc::channel(virtual_hosts.len().max(1));
        let pending = virtual_hosts.len();
        for virtual_host in virtual_hosts {
            let tx = tx.clone();
            let client = self.clone();
            let (org, env) = (org.to_string(), env.to_string());
            tokio::spawn(async move {
                let result = client.host_aliases(&org, &env, &virtual_host).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut hosts = BTreeSet::new();
        for _ in 0..pending {
            match rx.recv().await {
                Some(Ok(aliases)) => hosts.extend(aliases),
                Some(Err(err)) => return Err(err),
                None => break,
            }
        }
        Ok(hosts)
    }

    async fn write_routing_key(&self, org: &str, env: &str, value: &str) -> Result<(), EdgeError> {
        let entry = KvmEntry {
            name: ROUTING_KVM_KEY.to_string(),
            value: BASE64.encode(value),
        };
        let body = KvmBody {
            name: ROUTING_KVM_NAME.to_string(),
            entry: vec![entry.clone()],
        };
        let url = self.env_url(org, env, "keyvaluemaps");
        let resp = self.post_json(&url, &body).await?;
        match resp.status().as_u16() {
            201 => Ok(()),
            409 => self.update_routing_key(org, env, &entry).await,
            status => Err(EdgeError::status("routing KVM creation", status)),
        }
    }

    async fn read_kvm_entry(
        &self,
        org: &str,
        env: &str,
        map: &str,
        key: &str,
    ) -> Result<String, EdgeError> {
        let url = self.env_url(org, env, &format!("keyvaluemaps/{map}/entries/{key}"));
        let resp = self.get(&url).await?;
        if resp.status().as_u16() != 200 {
            return Err(EdgeError::status("KVM entry read", resp.status().as_u16()));
        }
        let entry: KvmEntry = resp.json().await?;
        Ok(entry.value)
    }
}
