//! Resource reports
//!
//! Translation never fails: configuration problems are recorded here against
//! the resource that caused them and become that resource's status.

use edge_api::{ResourceRef, Status};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Gateway,
    VirtualService,
    Upstream,
    Proxy,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Gateway => "Gateway",
            ResourceKind::VirtualService => "VirtualService",
            ResourceKind::Upstream => "Upstream",
            ResourceKind::Proxy => "Proxy",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ResourceReports {
    reports: BTreeMap<(ResourceKind, ResourceRef), Report>,
}

impl ResourceReports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a resource so it is reported even without errors
    pub fn accept(&mut self, kind: ResourceKind, resource: &ResourceRef) {
        self.reports.entry((kind, resource.clone())).or_default();
    }

    pub fn add_error(&mut self, kind: ResourceKind, resource: &ResourceRef, err: impl Into<String>) {
        let report = self.reports.entry((kind, resource.clone())).or_default();
        let err = err.into();
        if !report.errors.contains(&err) {
            report.errors.push(err);
        }
    }

    pub fn add_warning(&mut self, kind: ResourceKind, resource: &ResourceRef, warning: impl Into<String>) {
        let report = self.reports.entry((kind, resource.clone())).or_default();
        let warning = warning.into();
        if !report.warnings.contains(&warning) {
            report.warnings.push(warning);
        }
    }

    pub fn merge(&mut self, other: ResourceReports) {
        for ((kind, resource), report) in other.reports {
            for err in report.errors {
                self.add_error(kind, &resource, err);
            }
            for warning in report.warnings {
                self.add_warning(kind, &resource, warning);
            }
            self.accept(kind, &resource);
        }
    }

    pub fn get(&self, kind: ResourceKind, resource: &ResourceRef) -> Option<&Report> {
        self.reports.get(&(kind, resource.clone()))
    }

    pub fn has_errors(&self, kind: ResourceKind, resource: &ResourceRef) -> bool {
        self.get(kind, resource).is_some_and(|r| !r.errors.is_empty())
    }

    /// True when any resource of `kind` has an error
    pub fn any_errors(&self, kind: ResourceKind) -> bool {
        self.reports
            .iter()
            .any(|((k, _), r)| *k == kind && !r.errors.is_empty())
    }

    /// Errors reject, warnings alone warn, nothing accepts
    pub fn status_for(&self, kind: ResourceKind, resource: &ResourceRef) -> Status {
        match self.get(kind, resource) {
            Some(report) if !report.errors.is_empty() => {
                let mut reasons = report.errors.clone();
                reasons.extend(report.warnings.iter().cloned());
                Status::rejected(reasons.join("; "))
            }
            Some(report) if !report.warnings.is_empty() => {
                Status::warning(report.warnings.join("; "))
            }
            _ => Status::accepted(),
        }
    }

    pub fn resources(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceRef> {
        self.reports
            .keys()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}
