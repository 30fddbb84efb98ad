//! Derived object builders
//!
//! Both derived objects are pure functions of a workload key and its
//! pod-template labels. The reconciler never diffs against remembered state;
//! it rebuilds the desired object every time and compares it with what the
//! API server holds.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::key::WorkloadKey;
use crate::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, WORKLOAD_ANNOTATION};

/// Kind name used in errors, logs and metrics for the derived policy
pub const NETWORK_POLICY_KIND: &str = "NetworkPolicy";

/// Kind name used in errors, logs and metrics for the derived service
pub const SERVICE_KIND: &str = "Service";

/// Policy types on the derived NetworkPolicy
///
/// Both must be listed: with no egress rules, the API server would otherwise
/// default the policy to ingress-only and leave egress open.
const POLICY_TYPES: [&str; 2] = ["Ingress", "Egress"];

/// The single port exposed by the derived Service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePortSpec {
    /// Port name
    pub name: String,
    /// Port number, also used as the target port
    pub port: i32,
}

impl Default for ServicePortSpec {
    fn default() -> Self {
        Self {
            name: "http".to_string(),
            port: 80,
        }
    }
}

/// Label set of a workload's pod template
pub type PodLabels = BTreeMap<String, String>;

/// Metadata shared by both derived objects
fn derived_metadata(key: &WorkloadKey) -> ObjectMeta {
    ObjectMeta {
        name: Some(key.name.clone()),
        namespace: Some(key.namespace.clone()),
        labels: Some(BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            MANAGED_BY_VALUE.to_string(),
        )])),
        annotations: Some(BTreeMap::from([(
            WORKLOAD_ANNOTATION.to_string(),
            key.to_string(),
        )])),
        ..Default::default()
    }
}

/// Build the default-deny NetworkPolicy for a workload
///
/// Pods matching `labels` accept no ingress and send no egress.
pub fn build_network_policy(key: &WorkloadKey, labels: &PodLabels) -> NetworkPolicy {
    NetworkPolicy {
        metadata: derived_metadata(key),
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(labels.clone()),
                match_expressions: None,
            },
            ingress: Some(vec![]),
            egress: Some(vec![]),
            policy_types: Some(POLICY_TYPES.iter().map(|t| t.to_string()).collect()),
        }),
    }
}

/// Build the Service exposing a workload on a single named port
pub fn build_service(key: &WorkloadKey, labels: &PodLabels, port: &ServicePortSpec) -> Service {
    Service {
        metadata: derived_metadata(key),
        spec: Some(ServiceSpec {
            selector: Some(labels.clone()),
            ports: Some(vec![ServicePort {
                name: Some(port.name.clone()),
                port: port.port,
                target_port: Some(IntOrString::Int(port.port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// True if the object carries this controller's managed-by label
pub fn is_managed(metadata: &ObjectMeta) -> bool {
    metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_BY_LABEL))
        .is_some_and(|value| value == MANAGED_BY_VALUE)
}

/// Compare the enforcement-relevant parts of two NetworkPolicies
///
/// Server-side defaulting turns empty rule lists into absent ones, so `None`
/// and `Some(vec![])` are treated alike.
pub fn network_policy_matches(existing: &NetworkPolicy, desired: &NetworkPolicy) -> bool {
    let (Some(existing), Some(desired)) = (existing.spec.as_ref(), desired.spec.as_ref()) else {
        return false;
    };

    let selector_matches = existing.pod_selector.match_labels.clone().unwrap_or_default()
        == desired.pod_selector.match_labels.clone().unwrap_or_default()
        && existing
            .pod_selector
            .match_expressions
            .as_ref()
            .map_or(true, Vec::is_empty);

    let no_ingress = existing.ingress.as_ref().map_or(true, Vec::is_empty);
    let no_egress = existing.egress.as_ref().map_or(true, Vec::is_empty);

    let mut existing_types = existing.policy_types.clone().unwrap_or_default();
    let mut desired_types = desired.policy_types.clone().unwrap_or_default();
    existing_types.sort();
    desired_types.sort();

    selector_matches && no_ingress && no_egress && existing_types == desired_types
}

/// Compare selector and exposed port of two Services
pub fn service_matches(existing: &Service, desired: &Service) -> bool {
    let (Some(existing), Some(desired)) = (existing.spec.as_ref(), desired.spec.as_ref()) else {
        return false;
    };

    if existing.selector.clone().unwrap_or_default() != desired.selector.clone().unwrap_or_default()
    {
        return false;
    }

    let existing_ports = existing.ports.as_deref().unwrap_or_default();
    let desired_ports = desired.ports.as_deref().unwrap_or_default();
    existing_ports.len() == desired_ports.len()
        && existing_ports
            .iter()
            .zip(desired_ports)
            .all(|(have, want)| have.name == want.name && have.port == want.port)
}

/// Pod-template labels of a Deployment
pub fn pod_template_labels(deployment: &k8s_openapi::api::apps::v1::Deployment) -> PodLabels {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.labels.clone())
        .unwrap_or_default()
}
