//! Type triples identifying a published user-facing kind.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failed to parse a `group/version` (or bare `version` for the core group) string.
#[derive(Debug, Error)]
#[error("failed to parse group/version {0:?}")]
pub struct ParseGroupVersionError(pub String);

/// Group, version and kind of a dynamically-typed resource.
///
/// Used both as the identity of a published platform type and as the
/// `apiVersion`/`kind` carried verbatim on a node's object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, schemars::JsonSchema)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn gvk(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Parse from a Kubernetes `apiVersion` + `kind` pair, e.g. `("apps/v1", "Deployment")`.
    pub fn from_api_version_kind(api_version: &str, kind: &str) -> Result<Self, ParseGroupVersionError> {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Ok(Self {
            group,
            version,
            kind: kind.to_string(),
        })
    }

    /// Reconstruct the `apiVersion` string (`group/version`, or bare `version` for the core group).
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.api_version())
    }
}

impl FromStr for GroupVersionKind {
    type Err = ParseGroupVersionError;

    /// Parse the `group/version/Kind` wire form used in a published type's status.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [version, kind] => Ok(Self::gvk("", version, kind)),
            [group, version, kind] => Ok(Self::gvk(group, version, kind)),
            _ => Err(ParseGroupVersionError(s.to_string())),
        }
    }
}

/// A namespaced-or-cluster-scoped reference to a single object, erased of any
/// compile-time type. Used as the key for the inventory, the adoption
/// lookup, and the dynamic-type watcher's instance index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ObjectIdentity {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(gvk: GroupVersionKind, namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk, ns, self.name),
            None => write!(f, "{} {}", self.gvk, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_roundtrips_for_named_group() {
        let gvk = GroupVersionKind::from_api_version_kind("apps/v1", "Deployment").unwrap();
        assert_eq!(gvk.api_version(), "apps/v1");
        assert_eq!(gvk.group, "apps");
    }

    #[test]
    fn api_version_roundtrips_for_core_group() {
        let gvk = GroupVersionKind::from_api_version_kind("v1", "ConfigMap").unwrap();
        assert_eq!(gvk.api_version(), "v1");
        assert_eq!(gvk.group, "");
    }

    #[test]
    fn parses_wire_form_with_group() {
        let gvk: GroupVersionKind = "widgets.example.com/v1alpha1/WebService".parse().unwrap();
        assert_eq!(gvk.group, "widgets.example.com");
        assert_eq!(gvk.kind, "WebService");
    }

    #[test]
    fn parses_wire_form_without_group() {
        let gvk: GroupVersionKind = "v1/ConfigMap".parse().unwrap();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
    }
}
