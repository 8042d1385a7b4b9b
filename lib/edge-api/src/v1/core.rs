//! Types shared by every resource kind

use kube::{Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a namespaced resource
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct ResourceRef {
    pub name: String,
    /// Empty means "the namespace of the referring resource"
    #[serde(default)]
    pub namespace: String,
}

impl ResourceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Reference to an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }

    /// Fill in the namespace from the referring resource when it was omitted
    pub fn in_namespace(&self, default_namespace: &str) -> Self {
        if self.namespace.is_empty() {
            Self::new(default_namespace, self.name.clone())
        } else {
            self.clone()
        }
    }

    /// `namespace.name`
    pub fn key(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Lifecycle state reported on a resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StatusState {
    #[default]
    Pending,
    Accepted,
    Rejected,
    Warning,
}

impl StatusState {
    /// Pending is the only state the reconciliation loop must move a resource out of
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusState::Pending)
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusState::Pending => "Pending",
            StatusState::Accepted => "Accepted",
            StatusState::Rejected => "Rejected",
            StatusState::Warning => "Warning",
        };
        f.write_str(s)
    }
}

/// Status written back by the control plane
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default)]
    pub state: StatusState,

    /// Human-readable explanation for Rejected and Warning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Component that wrote this status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_by: Option<String>,

    /// `metadata.generation` the status was computed from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Status {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn accepted() -> Self {
        Self {
            state: StatusState::Accepted,
            ..Default::default()
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            state: StatusState::Rejected,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn warning(reason: impl Into<String>) -> Self {
        Self {
            state: StatusState::Warning,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn reported_by(mut self, reporter: impl Into<String>) -> Self {
        self.reported_by = Some(reporter.into());
        self
    }
}

/// Resources that carry a [`Status`] subresource
pub trait HasStatus {
    fn status(&self) -> Option<&Status>;

    fn set_status(&mut self, status: Status);

    /// A resource that was never reported on is Pending
    fn state(&self) -> StatusState {
        self.status().map(|s| s.state).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_defaults_namespace() {
        let r = ResourceRef::new("", "petstore");
        assert_eq!(r.in_namespace("default").key(), "default.petstore");

        let r = ResourceRef::new("apps", "petstore");
        assert_eq!(r.in_namespace("default").key(), "apps.petstore");
    }

    #[test]
    fn test_status_terminal() {
        assert!(!Status::pending().state.is_terminal());
        assert!(Status::accepted().state.is_terminal());
        let rejected = Status::rejected("duplicate bind address");
        assert!(rejected.state.is_terminal());
        assert_eq!(rejected.reason.as_deref(), Some("duplicate bind address"));
    }
}
