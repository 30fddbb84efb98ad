//! Workload keys
//!
//! A [`WorkloadKey`] names a Deployment and, by construction, both derived
//! objects. The work queue deduplicates on it, so repeated notifications for
//! the same Deployment collapse into one pending reconciliation.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;

use crate::Error;

/// Namespace and name of a workload
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    /// Namespace of the workload
    pub namespace: String,
    /// Name of the workload
    pub name: String,
}

impl WorkloadKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Resolve the key of a Deployment
    ///
    /// Returns `None` when the object carries no namespace or no name, which
    /// happens only for malformed notifications.
    pub fn from_deployment(deployment: &Deployment) -> Option<Self> {
        let namespace = deployment.namespace()?;
        let name = deployment.metadata.name.clone()?;
        let key = Self::new(namespace, name);
        key.validate().ok()?;
        Some(key)
    }

    /// Check that both halves of the key are present and well-formed
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() || self.name.is_empty() {
            return Err(Error::InvalidKey(self.to_string()));
        }
        if self.namespace.contains('/') || self.name.contains('/') {
            return Err(Error::InvalidKey(self.to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for WorkloadKey {
    type Err = Error;

    /// Parse a `namespace/name` key
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidKey(s.to_string()))?;
        let key = Self::new(namespace, name);
        key.validate()?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn deployment(namespace: Option<&str>, name: Option<&str>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: name.map(String::from),
                namespace: namespace.map(String::from),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_display_and_parse() {
        let key = WorkloadKey::new("default", "web");
        assert_eq!(key.to_string(), "default/web");
        assert_eq!("default/web".parse::<WorkloadKey>().ok(), Some(key));
    }

    /// Story: Keys that cannot name a workload are rejected, never guessed
    #[test]
    fn story_malformed_keys_are_rejected() {
        for raw in ["web", "/web", "default/", "a/b/c", ""] {
            let parsed = raw.parse::<WorkloadKey>();
            assert!(
                matches!(parsed, Err(Error::InvalidKey(_))),
                "expected {raw:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_from_deployment() {
        let key = WorkloadKey::from_deployment(&deployment(Some("prod"), Some("api")));
        assert_eq!(key, Some(WorkloadKey::new("prod", "api")));
    }

    #[test]
    fn test_from_deployment_without_namespace_or_name() {
        assert_eq!(WorkloadKey::from_deployment(&deployment(None, Some("api"))), None);
        assert_eq!(WorkloadKey::from_deployment(&deployment(Some("prod"), None)), None);
    }
}
