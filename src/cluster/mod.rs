//! Thin typed wrapper over the cluster orchestrator API.
//!
//! Only the imperative CRUD surface the control plane needs: namespaces,
//! secrets, deployments, replica sets, pods, list-by-label-selector and pod
//! log fetch. [`ClusterApi`] is the seam; [`ClusterClient`] is the real
//! client. The orchestrator's own control loop is trusted to converge.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;

/// Orchestrator operations the provisioner and reconciler consume.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_namespace(&self, name: &str) -> Result<Namespace, kube::Error>;
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, kube::Error>;
    async fn replace_namespace(
        &self,
        name: &str,
        namespace: &Namespace,
    ) -> Result<Namespace, kube::Error>;
    async fn delete_namespace(&self, name: &str) -> Result<(), kube::Error>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error>;
    async fn create_secret(&self, namespace: &str, secret: &Secret)
        -> Result<Secret, kube::Error>;

    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Deployment, kube::Error>;
    async fn list_deployments(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Deployment>, kube::Error>;
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, kube::Error>;
    async fn replace_deployment(
        &self,
        namespace: &str,
        name: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, kube::Error>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    async fn list_replica_sets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ReplicaSet>, kube::Error>;
    async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, kube::Error>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        tail_lines: Option<i64>,
        previous: bool,
    ) -> Result<String, kube::Error>;
}

#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    pub fn new(client: Client) -> Self {
        ClusterClient { client }
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn replica_sets(&self, namespace: &str) -> Api<ReplicaSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for ClusterClient {
    async fn get_namespace(&self, name: &str) -> Result<Namespace, kube::Error> {
        self.namespaces().get(name).await
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, kube::Error> {
        self.namespaces()
            .create(&PostParams::default(), namespace)
            .await
    }

    async fn replace_namespace(
        &self,
        name: &str,
        namespace: &Namespace,
    ) -> Result<Namespace, kube::Error> {
        self.namespaces()
            .replace(name, &PostParams::default(), namespace)
            .await
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), kube::Error> {
        self.namespaces()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error> {
        self.secrets(namespace).get(name).await
    }

    async fn create_secret(
        &self,
        namespace: &str,
        secret: &Secret,
    ) -> Result<Secret, kube::Error> {
        self.secrets(namespace)
            .create(&PostParams::default(), secret)
            .await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, kube::Error> {
        self.deployments(namespace).get(name).await
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Deployment>, kube::Error> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(self.deployments(namespace).list(&params).await?.items)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, kube::Error> {
        self.deployments(namespace)
            .create(&PostParams::default(), deployment)
            .await
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        name: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, kube::Error> {
        self.deployments(namespace)
            .replace(name, &PostParams::default(), deployment)
            .await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.deployments(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list_replica_sets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ReplicaSet>, kube::Error> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.replica_sets(namespace).list(&params).await?.items)
    }

    async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.replica_sets(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, kube::Error> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.pods(namespace).list(&params).await?.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        tail_lines: Option<i64>,
        previous: bool,
    ) -> Result<String, kube::Error> {
        let params = LogParams {
            tail_lines,
            previous,
            ..LogParams::default()
        };
        self.pods(namespace).logs(pod, &params).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    pub(crate) fn api_error(code: u16, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: message.to_string(),
            code,
        })
    }

    fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
        let Some((key, value)) = selector.split_once('=') else {
            return true;
        };
        labels.is_some_and(|l| l.get(key).map(String::as_str) == Some(value))
    }

    /// In-memory stand-in for the orchestrator API. Failure switches let a
    /// test break one operation while the rest of the state behaves.
    #[derive(Default)]
    pub(crate) struct MockCluster {
        pub namespaces: Mutex<BTreeMap<String, Namespace>>,
        pub secrets: Mutex<BTreeMap<(String, String), Secret>>,
        pub deployments: Mutex<BTreeMap<(String, String), Deployment>>,
        pub replica_sets: Mutex<BTreeMap<(String, String), ReplicaSet>>,
        pub pods: Mutex<BTreeMap<(String, String), Pod>>,
        pub logs: Mutex<BTreeMap<(String, String), String>>,
        pub fail_secret_create: bool,
        pub fail_namespace_delete: bool,
        pub fail_next_replica_set_delete: Mutex<bool>,
    }

    #[async_trait]
    impl ClusterApi for MockCluster {
        async fn get_namespace(&self, name: &str) -> Result<Namespace, kube::Error> {
            self.namespaces
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| api_error(404, "namespace not found"))
        }

        async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, kube::Error> {
            let name = namespace.metadata.name.clone().unwrap_or_default();
            let mut namespaces = self.namespaces.lock().unwrap();
            if namespaces.contains_key(&name) {
                return Err(api_error(409, "namespace already exists"));
            }
            namespaces.insert(name, namespace.clone());
            Ok(namespace.clone())
        }

        async fn replace_namespace(
            &self,
            name: &str,
            namespace: &Namespace,
        ) -> Result<Namespace, kube::Error> {
            let mut namespaces = self.namespaces.lock().unwrap();
            if !namespaces.contains_key(name) {
                return Err(api_error(404, "namespace not found"));
            }
            namespaces.insert(name.to_string(), namespace.clone());
            Ok(namespace.clone())
        }

        async fn delete_namespace(&self, name: &str) -> Result<(), kube::Error> {
            if self.fail_namespace_delete {
                return Err(api_error(500, "namespace delete failed"));
            }
            match self.namespaces.lock().unwrap().remove(name) {
                Some(_) => Ok(()),
                None => Err(api_error(404, "namespace not found")),
            }
        }

        async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error> {
            self.secrets
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| api_error(404, "secret not found"))
        }

        async fn create_secret(
            &self,
            namespace: &str,
            secret: &Secret,
        ) -> Result<Secret, kube::Error> {
            if self.fail_secret_create {
                return Err(api_error(500, "secret create failed"));
            }
            let name = secret.metadata.name.clone().unwrap_or_default();
            self.secrets
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name), secret.clone());
            Ok(secret.clone())
        }

        async fn get_deployment(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Deployment, kube::Error> {
            self.deployments
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| api_error(404, "deployment not found"))
        }

        async fn list_deployments(
            &self,
            namespace: &str,
            label_selector: Option<&str>,
        ) -> Result<Vec<Deployment>, kube::Error> {
            Ok(self
                .deployments
                .lock()
                .unwrap()
                .iter()
                .filter(|((ns, _), deployment)| {
                    ns == namespace
                        && label_selector.is_none_or(|selector| {
                            matches_selector(deployment.metadata.labels.as_ref(), selector)
                        })
                })
                .map(|(_, deployment)| deployment.clone())
                .collect())
        }

        async fn create_deployment(
            &self,
            namespace: &str,
            deployment: &Deployment,
        ) -> Result<Deployment, kube::Error> {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            let mut deployments = self.deployments.lock().unwrap();
            let key = (namespace.to_string(), name);
            if deployments.contains_key(&key) {
                return Err(api_error(409, "deployment already exists"));
            }
            deployments.insert(key, deployment.clone());
            Ok(deployment.clone())
        }

        async fn replace_deployment(
            &self,
            namespace: &str,
            name: &str,
            deployment: &Deployment,
        ) -> Result<Deployment, kube::Error> {
            let mut deployments = self.deployments.lock().unwrap();
            let key = (namespace.to_string(), name.to_string());
            if !deployments.contains_key(&key) {
                return Err(api_error(404, "deployment not found"));
            }
            deployments.insert(key, deployment.clone());
            Ok(deployment.clone())
        }

        async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
            match self
                .deployments
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()))
            {
                Some(_) => Ok(()),
                None => Err(api_error(404, "deployment not found")),
            }
        }

        async fn list_replica_sets(
            &self,
            namespace: &str,
            label_selector: &str,
        ) -> Result<Vec<ReplicaSet>, kube::Error> {
            Ok(self
                .replica_sets
                .lock()
                .unwrap()
                .iter()
                .filter(|((ns, _), rs)| {
                    ns == namespace && matches_selector(rs.metadata.labels.as_ref(), label_selector)
                })
                .map(|(_, rs)| rs.clone())
                .collect())
        }

        async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
            {
                let mut fail = self.fail_next_replica_set_delete.lock().unwrap();
                if *fail {
                    *fail = false;
                    return Err(api_error(500, "replica set delete failed"));
                }
            }
            match self
                .replica_sets
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()))
            {
                Some(_) => Ok(()),
                None => Err(api_error(404, "replica set not found")),
            }
        }

        async fn list_pods(
            &self,
            namespace: &str,
            label_selector: &str,
        ) -> Result<Vec<Pod>, kube::Error> {
            Ok(self
                .pods
                .lock()
                .unwrap()
                .iter()
                .filter(|((ns, _), pod)| {
                    ns == namespace
                        && matches_selector(pod.metadata.labels.as_ref(), label_selector)
                })
                .map(|(_, pod)| pod.clone())
                .collect())
        }

        async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
            match self
                .pods
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()))
            {
                Some(_) => Ok(()),
                None => Err(api_error(404, "pod not found")),
            }
        }

        async fn pod_logs(
            &self,
            namespace: &str,
            pod: &str,
            _tail_lines: Option<i64>,
            _previous: bool,
        ) -> Result<String, kube::Error> {
            self.logs
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), pod.to_string()))
                .cloned()
                .ok_or_else(|| api_error(404, "pod not found"))
        }
    }
}
