//! Cluster API client
//!
//! [`ClusterClient`] is the only path from the reconciler to the API server.
//! Every method resolves to either success, [`Error::NotFound`],
//! [`Error::AlreadyExists`] or another error, which is all the reconciler
//! needs to decide its next step.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use opentelemetry::KeyValue;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::key::WorkloadKey;
use crate::metrics::{self, operation_result};
use crate::resources::{pod_template_labels, PodLabels, NETWORK_POLICY_KIND, SERVICE_KIND};
use crate::{Error, Result, FIELD_MANAGER};

/// Kind name of the primary resource
pub const WORKLOAD_KIND: &str = "Deployment";

/// A workload as read from the API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workload {
    /// Namespace and name
    pub key: WorkloadKey,
    /// Labels of the pod template
    pub pod_labels: PodLabels,
}

/// Operations the reconciler performs against the cluster
///
/// Implementations map "object does not exist" to [`Error::NotFound`] and
/// "name already taken" to [`Error::AlreadyExists`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Read a workload directly from the API server
    async fn get_workload(&self, key: &WorkloadKey) -> Result<Workload>;

    /// Read the Service named by `key`
    async fn get_service(&self, key: &WorkloadKey) -> Result<Service>;

    /// Create a Service in the namespace of `key`
    async fn create_service(&self, key: &WorkloadKey, service: &Service) -> Result<()>;

    /// Replace the Service named by `key` with `service` via server-side apply
    async fn apply_service(&self, key: &WorkloadKey, service: &Service) -> Result<()>;

    /// Delete the Service named by `key`
    async fn delete_service(&self, key: &WorkloadKey) -> Result<()>;

    /// Read the NetworkPolicy named by `key`
    async fn get_network_policy(&self, key: &WorkloadKey) -> Result<NetworkPolicy>;

    /// Create a NetworkPolicy in the namespace of `key`
    async fn create_network_policy(&self, key: &WorkloadKey, policy: &NetworkPolicy)
        -> Result<()>;

    /// Replace the NetworkPolicy named by `key` with `policy` via server-side apply
    async fn apply_network_policy(&self, key: &WorkloadKey, policy: &NetworkPolicy)
        -> Result<()>;

    /// Delete the NetworkPolicy named by `key`
    async fn delete_network_policy(&self, key: &WorkloadKey) -> Result<()>;
}

/// [`ClusterClient`] backed by a kube [`Client`]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn services(&self, key: &WorkloadKey) -> Api<Service> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    fn network_policies(&self, key: &WorkloadKey) -> Api<NetworkPolicy> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

/// Record a derived-object call in metrics and pass the result through
fn observe<T>(kind: &'static str, operation: &'static str, result: Result<T>) -> Result<T> {
    metrics::DERIVED_OPERATIONS.add(
        1,
        &[
            KeyValue::new("kind", kind),
            KeyValue::new("operation", operation),
            KeyValue::new("result", operation_result(&result)),
        ],
    );
    result
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_workload(&self, key: &WorkloadKey) -> Result<Workload> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        let deployment = api
            .get(&key.name)
            .await
            .map_err(|e| Error::from_kube(e, WORKLOAD_KIND, &key.namespace, &key.name))?;

        Ok(Workload {
            key: key.clone(),
            pod_labels: pod_template_labels(&deployment),
        })
    }

    async fn get_service(&self, key: &WorkloadKey) -> Result<Service> {
        self.services(key)
            .get(&key.name)
            .await
            .map_err(|e| Error::from_kube(e, SERVICE_KIND, &key.namespace, &key.name))
    }

    async fn create_service(&self, key: &WorkloadKey, service: &Service) -> Result<()> {
        let result = self
            .services(key)
            .create(&PostParams::default(), service)
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, SERVICE_KIND, &key.namespace, &key.name));
        debug!(key = %key, ok = result.is_ok(), "create service");
        observe(SERVICE_KIND, "create", result)
    }

    async fn apply_service(&self, key: &WorkloadKey, service: &Service) -> Result<()> {
        let result = self
            .services(key)
            .patch(&key.name, &apply_params(), &Patch::Apply(service))
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, SERVICE_KIND, &key.namespace, &key.name));
        observe(SERVICE_KIND, "replace", result)
    }

    async fn delete_service(&self, key: &WorkloadKey) -> Result<()> {
        let result = self
            .services(key)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, SERVICE_KIND, &key.namespace, &key.name));
        observe(SERVICE_KIND, "delete", result)
    }

    async fn get_network_policy(&self, key: &WorkloadKey) -> Result<NetworkPolicy> {
        self.network_policies(key)
            .get(&key.name)
            .await
            .map_err(|e| Error::from_kube(e, NETWORK_POLICY_KIND, &key.namespace, &key.name))
    }

    async fn create_network_policy(
        &self,
        key: &WorkloadKey,
        policy: &NetworkPolicy,
    ) -> Result<()> {
        let result = self
            .network_policies(key)
            .create(&PostParams::default(), policy)
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, NETWORK_POLICY_KIND, &key.namespace, &key.name));
        debug!(key = %key, ok = result.is_ok(), "create network policy");
        observe(NETWORK_POLICY_KIND, "create", result)
    }

    async fn apply_network_policy(
        &self,
        key: &WorkloadKey,
        policy: &NetworkPolicy,
    ) -> Result<()> {
        let result = self
            .network_policies(key)
            .patch(&key.name, &apply_params(), &Patch::Apply(policy))
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, NETWORK_POLICY_KIND, &key.namespace, &key.name));
        observe(NETWORK_POLICY_KIND, "replace", result)
    }

    async fn delete_network_policy(&self, key: &WorkloadKey) -> Result<()> {
        let result = self
            .network_policies(key)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, NETWORK_POLICY_KIND, &key.namespace, &key.name));
        observe(NETWORK_POLICY_KIND, "delete", result)
    }
}
